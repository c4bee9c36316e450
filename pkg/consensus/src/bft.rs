use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::errors::*;
use crate::protos::*;

/// Side effects requested by the byzantine module during one operation: messages
/// to broadcast to every other replica, and requests that became executable (in
/// strict sequence order)
#[derive(Default)]
pub struct BftOutput {
	pub broadcasts: Vec<BftEnvelope>,
	pub executable: Vec<(SeqNum, Command)>,
}

impl BftOutput {
	fn broadcast(&mut self, msg: BftEnvelope) {
		self.broadcasts.push(msg);
	}
}

pub enum BftEnvelope {
	PrePrepare(PrePrepareMessage),
	Prepare(PrepareMessage),
	Commit(CommitMessage),
}

#[derive(Debug)]
pub enum BftSubmitError {
	/// Requests enter the protocol through the primary of the current view
	NotPrimary { primary: ServerId },
}

/// Agreement state for a single (view, seq) slot
struct Slot {
	/// The pre-prepare this replica accepted: the request body and its digest.
	/// At most one request is ever accepted per slot
	accepted: Option<(RequestDigest, Command)>,

	/// Prepare digests by sender. A sender's first claim wins so that a faulty
	/// peer cannot retract a message it already sent
	prepares: HashMap<ServerId, RequestDigest>,

	commits: HashMap<ServerId, RequestDigest>,

	prepared: bool,
	committed: bool,
	applied: bool,
}

impl Slot {
	fn new() -> Slot {
		Slot {
			accepted: None,
			prepares: HashMap::new(),
			commits: HashMap::new(),
			prepared: false,
			committed: false,
			applied: false,
		}
	}
}

/// Pure three-phase byzantine agreement state machine. The surrounding server
/// performs all networking; handlers here validate, count quorums, and emit
/// broadcasts plus executable requests through a BftOutput
///
/// A cluster of n = 3f + 1 replicas tolerates f faulty ones: every phase waits
/// for 2f + 1 matching messages from distinct senders, so any two quorums
/// intersect in at least one honest replica
pub struct BftModule {
	id: ServerId,

	/// All replica ids in id order. The primary of view v is members[v mod n]
	members: Vec<ServerId>,

	f: usize,

	view: ViewId,

	/// Used only by the primary to assign the next sequence number
	next_seq: SeqNum,

	slots: HashMap<(ViewId, SeqNum), Slot>,

	/// Highest sequence number applied in the current view. Execution never skips
	/// ahead of this
	last_executed: SeqNum,

	/// Deliberately violate the protocol in bounded ways (testing only)
	malicious: bool,
}

impl BftModule {
	pub fn new(id: ServerId, members: Vec<ServerId>, malicious: bool) -> Result<BftModule> {
		let n = members.len();
		if n < 4 || n % 3 != 1 {
			bail!("byzantine agreement requires n = 3f + 1 replicas with f >= 1, got n = {}", n);
		}
		if !members.contains(&id) {
			bail!("replica id {} is not a cluster member", id);
		}

		if malicious {
			info!(id, "replica running in malicious mode");
		}

		Ok(BftModule {
			id,
			f: (n - 1) / 3,
			members,
			view: 0,
			next_seq: 0,
			slots: HashMap::new(),
			last_executed: 0,
			malicious,
		})
	}

	pub fn view(&self) -> ViewId {
		self.view
	}

	pub fn last_executed(&self) -> SeqNum {
		self.last_executed
	}

	pub fn primary(&self) -> ServerId {
		self.members[(self.view % self.members.len() as u64) as usize]
	}

	pub fn is_primary(&self) -> bool {
		self.primary() == self.id
	}

	fn quorum(&self) -> usize {
		2 * self.f + 1
	}

	/// A client request entering the protocol. Only the primary assigns sequence
	/// numbers; everyone else points the client at it
	pub fn submit(
		&mut self,
		command: Command,
		out: &mut BftOutput,
	) -> std::result::Result<SeqNum, BftSubmitError> {
		if !self.is_primary() {
			return Err(BftSubmitError::NotPrimary { primary: self.primary() });
		}

		self.next_seq += 1;
		let seq = self.next_seq;
		let digest = command.digest();

		let slot = self.slots.entry((self.view, seq)).or_insert_with(Slot::new);
		slot.accepted = Some((digest, command.clone()));
		// The primary's own prepare counts toward the quorum like anyone else's
		slot.prepares.insert(self.id, digest);

		out.broadcast(BftEnvelope::PrePrepare(PrePrepareMessage {
			view: self.view,
			seq,
			digest,
			sender_id: self.id,
			request: command,
		}));
		out.broadcast(BftEnvelope::Prepare(PrepareMessage {
			view: self.view,
			seq,
			digest,
			sender_id: self.id,
		}));

		self.advance(self.view, seq, out);
		Ok(seq)
	}

	pub fn handle_pre_prepare(&mut self, msg: PrePrepareMessage, out: &mut BftOutput) {
		if msg.view != self.view {
			debug!(id = self.id, view = msg.view, "dropping pre-prepare for another view");
			return;
		}

		// Only the primary of the view may order requests
		if msg.sender_id != self.primary() {
			warn!(id = self.id, sender = msg.sender_id, "dropping pre-prepare from non-primary");
			return;
		}

		// The request bytes must hash to the declared digest; a tampered request
		// is discarded before it can touch any quorum
		if msg.request.digest() != msg.digest {
			warn!(id = self.id, seq = msg.seq, "dropping pre-prepare with mismatched digest");
			return;
		}

		let slot = self.slots.entry((msg.view, msg.seq)).or_insert_with(Slot::new);
		match &slot.accepted {
			Some((digest, _)) if *digest != msg.digest => {
				warn!(
					id = self.id,
					seq = msg.seq,
					"dropping conflicting pre-prepare for an already accepted slot"
				);
				return;
			}
			Some(_) => return,
			None => {
				slot.accepted = Some((msg.digest, msg.request.clone()));
			}
		}

		if self.malicious {
			self.misbehave(&msg, out);
			return;
		}

		let slot = self.slots.entry((msg.view, msg.seq)).or_insert_with(Slot::new);
		slot.prepares.insert(self.id, msg.digest);

		out.broadcast(BftEnvelope::Prepare(PrepareMessage {
			view: msg.view,
			seq: msg.seq,
			digest: msg.digest,
			sender_id: self.id,
		}));

		self.advance(msg.view, msg.seq, out);
	}

	pub fn handle_prepare(&mut self, msg: PrepareMessage, out: &mut BftOutput) {
		if msg.view != self.view || !self.members.contains(&msg.sender_id) {
			return;
		}
		if self.malicious {
			return;
		}

		let slot = self.slots.entry((msg.view, msg.seq)).or_insert_with(Slot::new);
		// First claim per sender wins; duplicates never double count
		slot.prepares.entry(msg.sender_id).or_insert(msg.digest);

		self.advance(msg.view, msg.seq, out);
	}

	pub fn handle_commit(&mut self, msg: CommitMessage, out: &mut BftOutput) {
		if msg.view != self.view || !self.members.contains(&msg.sender_id) {
			return;
		}
		if self.malicious {
			return;
		}

		let slot = self.slots.entry((msg.view, msg.seq)).or_insert_with(Slot::new);
		slot.commits.entry(msg.sender_id).or_insert(msg.digest);

		self.advance(msg.view, msg.seq, out);
	}

	/// Re-evaluates one slot's quorums after any message landed, then drains the
	/// execution queue in sequence order
	fn advance(&mut self, view: ViewId, seq: SeqNum, out: &mut BftOutput) {
		let quorum = self.quorum();
		let id = self.id;

		if let Some(slot) = self.slots.get_mut(&(view, seq)) {
			// Quorums only ever count messages matching the accepted digest;
			// anything else in the maps is byzantine noise
			let digest = match &slot.accepted {
				Some((digest, _)) => *digest,
				None => return,
			};

			let matching_prepares =
				slot.prepares.values().filter(|d| **d == digest).count();
			if !slot.prepared && matching_prepares >= quorum {
				slot.prepared = true;
				slot.commits.insert(id, digest);

				debug!(id, seq, "prepared");
				out.broadcast(BftEnvelope::Commit(CommitMessage {
					view,
					seq,
					digest,
					sender_id: id,
				}));
			}

			let matching_commits = slot.commits.values().filter(|d| **d == digest).count();
			if slot.prepared && !slot.committed && matching_commits >= quorum {
				slot.committed = true;
				debug!(id, seq, "committed locally");
			}
		}

		// A committed slot executes only once every predecessor in the view has;
		// gaps stay parked until the missing sequence numbers commit
		loop {
			let next = self.last_executed + 1;
			let slot = match self.slots.get_mut(&(self.view, next)) {
				Some(s) if s.committed && !s.applied => s,
				_ => break,
			};

			slot.applied = true;
			if let Some((_, command)) = &slot.accepted {
				out.executable.push((next, command.clone()));
			}
			self.last_executed = next;
		}
	}

	/// Bounded protocol violations for fault-tolerance testing: forge an order we
	/// have no right to assign, vouch for a digest that matches nothing, and stay
	/// silent for the phases that would actually help
	fn misbehave(&mut self, msg: &PrePrepareMessage, out: &mut BftOutput) {
		let mut corrupted = msg.digest;
		corrupted[0] ^= 0xff;

		let forged = Command::Set { key: "intruder".into(), value: "intruder".into() };
		out.broadcast(BftEnvelope::PrePrepare(PrePrepareMessage {
			view: msg.view,
			seq: msg.seq,
			digest: forged.digest(),
			sender_id: self.id,
			request: forged,
		}));

		out.broadcast(BftEnvelope::Prepare(PrepareMessage {
			view: msg.view,
			seq: msg.seq,
			digest: corrupted,
			sender_id: self.id,
		}));
	}
}
