use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, info};

use crate::errors::*;
use crate::log::MemoryLog;
use crate::protos::*;
use crate::state::*;

/// At some random time in this range of milliseconds, a follower will become a
/// candidate if it has heard nothing from a leader
pub const ELECTION_TIMEOUT: (u64, u64) = (300, 600);

/// If the leader doesn't send anything else within this amount of time, then it
/// will send an empty heartbeat to all followers
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(50);

/// On success, the entry has been accepted and may eventually be committed at the
/// returned position
pub type ProposeResult = std::result::Result<LogPosition, ProposeError>;

#[derive(Debug)]
pub enum ProposeError {
	/// The entry can't be proposed by this server because we are not the current
	/// leader
	NotLeader { leader_hint: Option<ServerId> },
}

/// Represents all external side effects requested by the consensus module during a
/// single operation. The caller is responsible for persisting hard state before
/// sending out any of the messages
pub struct Tick {
	/// Exact time at which this tick is happening
	pub time: Instant,

	/// Hard state changed and must be made durable before the messages below leave
	/// this server
	pub persist: bool,

	/// The commit index advanced; the apply worker has new entries to hand to the
	/// state machine
	pub committed: bool,

	pub messages: Vec<Message>,

	/// If no other events occur, the next time at which cycle() should run
	pub next_tick: Option<Duration>,
}

impl Tick {
	pub fn empty() -> Tick {
		Tick {
			time: Instant::now(),
			persist: false,
			committed: false,
			messages: vec![],
			next_tick: None,
		}
	}

	pub fn at(time: Instant) -> Tick {
		Tick { time, ..Tick::empty() }
	}

	fn write_hard_state(&mut self) {
		self.persist = true;
	}

	fn send(&mut self, msg: Message) {
		self.messages.push(msg);
	}
}

/// Wrapper around a response that must not be sent until the hard state produced
/// by the same operation has been durably saved. Consuming it is the caller's
/// assertion that persistence succeeded
pub struct MustPersistHardState<T> {
	inner: T,
}

impl<T> MustPersistHardState<T> {
	fn new(inner: T) -> Self {
		MustPersistHardState { inner }
	}

	pub fn persisted(self) -> T {
		self.inner
	}
}

/// Pure election and replication state machine. All I/O (persistence, timers, the
/// network) lives in the surrounding server; every entry point here takes a Tick
/// that accumulates the side effects the caller must perform
pub struct ConsensusModule {
	/// Id of the current server we are representing
	id: ServerId,

	/// Ids of every member of the cluster (ourselves included), in id order
	members: Vec<ServerId>,

	current_term: Term,

	voted_for: Option<ServerId>,

	log: MemoryLog,

	/// Index of the last entry known to be replicated on a majority. Volatile:
	/// recomputed after a restart from the first leader contact
	commit_index: LogIndex,

	state: ServerState,
}

impl ConsensusModule {
	pub fn new(
		id: ServerId,
		members: Vec<ServerId>,
		hard_state: HardState,
		now: Instant,
	) -> ConsensusModule {
		ConsensusModule {
			id,
			members,
			current_term: hard_state.current_term,
			voted_for: hard_state.voted_for,
			log: MemoryLog::from_entries(hard_state.entries),
			commit_index: 0,
			state: Self::new_follower(now),
		}
	}

	pub fn id(&self) -> ServerId {
		self.id
	}

	pub fn role(&self) -> Role {
		self.state.role()
	}

	pub fn current_term(&self) -> Term {
		self.current_term
	}

	pub fn commit_index(&self) -> LogIndex {
		self.commit_index
	}

	pub fn log(&self) -> &MemoryLog {
		&self.log
	}

	/// The snapshot of persistent state that the write-ahead log stores. Cloned
	/// because the caller serializes it after this server has already moved on
	pub fn hard_state(&self) -> HardState {
		HardState {
			current_term: self.current_term,
			voted_for: self.voted_for,
			entries: self.log.entries().to_vec(),
		}
	}

	/// Best known id of the current leader, for redirecting clients
	pub fn leader_hint(&self) -> Option<ServerId> {
		match &self.state {
			ServerState::Leader(_) => Some(self.id),
			ServerState::Follower(s) => s.last_leader_id.or(self.voted_for),
			ServerState::Candidate(_) => None,
		}
	}

	/// Propose a new state machine command to be replicated. Only valid on the
	/// leader; the entry is appended locally and replication starts on this tick
	pub fn propose_command(&mut self, command: Command, out: &mut Tick) -> ProposeResult {
		if let ServerState::Leader(_) = self.state {
			let index = self.log.last_index() + 1;
			let term = self.current_term;

			self.log.append(LogEntry { term, index, command });
			out.write_hard_state();

			// Cycle the state to replicate this entry to other servers
			self.cycle(out);

			Ok(LogPosition { term, index })
		} else {
			Err(ProposeError::NotLeader { leader_hint: self.leader_hint() })
		}
	}

	/// Drives timers forward. May produce messages, elections, and commits; sets
	/// next_tick to the time at which it wants to run again
	pub fn cycle(&mut self, tick: &mut Tick) {
		enum Summary {
			Follower { elapsed: Duration, election_timeout: Duration },
			Candidate { vote_count: usize, elapsed: Duration, election_timeout: Duration },
			Leader { next_commit_index: Option<LogIndex> },
		}

		// Move the interesting numbers out of the state so that the transitions
		// below can mutate it freely
		let summary = match &self.state {
			ServerState::Follower(s) => Summary::Follower {
				elapsed: tick.time.saturating_duration_since(s.last_heartbeat),
				election_timeout: s.election_timeout,
			},
			ServerState::Candidate(s) => Summary::Candidate {
				// Our own vote is implicit
				vote_count: 1 + s.votes_received.len(),
				elapsed: tick.time.saturating_duration_since(s.election_start),
				election_timeout: s.election_timeout,
			},
			ServerState::Leader(s) => Summary::Leader {
				next_commit_index: self.find_next_commit_index(s),
			},
		};

		match summary {
			Summary::Follower { elapsed, election_timeout } => {
				if elapsed >= election_timeout {
					self.start_election(tick);
				} else {
					tick.next_tick = Some(election_timeout - elapsed);
				}
			}
			Summary::Candidate { vote_count, elapsed, election_timeout } => {
				if vote_count >= self.majority_size() {
					self.become_leader(tick);
				} else if elapsed >= election_timeout {
					// Split vote or unreachable peers; try again in a fresh term
					self.start_election(tick);
				} else {
					tick.next_tick = Some(election_timeout - elapsed);
				}
			}
			Summary::Leader { next_commit_index } => {
				if let Some(ci) = next_commit_index {
					self.update_committed(ci, tick);
				}

				let next_heartbeat = self.replicate_entries(tick);
				tick.next_tick = Some(next_heartbeat);
			}
		}
	}

	/// On the leader, finds the highest index that can newly be marked committed:
	/// a majority of servers matches it and it belongs to the current term. Entries
	/// from older terms are never committed by counting replicas alone
	fn find_next_commit_index(&self, s: &ServerLeaderState) -> Option<LogIndex> {
		let majority = self.majority_size();

		let mut ci = self.log.last_index();
		while ci > self.commit_index {
			// Terms are monotonic within the log, so once we walk past the current
			// term there is nothing left that may be committed
			let term = match self.log.term(ci) {
				Some(t) => t,
				None => break,
			};

			if term < self.current_term {
				break;
			}

			if term == self.current_term {
				// The leader's own log trivially matches
				let mut count = 1;
				for (id, progress) in s.servers.iter() {
					if *id != self.id && progress.match_index >= ci {
						count += 1;
					}
				}

				if count >= majority {
					return Some(ci);
				}
			}

			ci -= 1;
		}

		None
	}

	/// On the leader, produces requests to replicate or maintain the log on every
	/// other server, sending empty heartbeats to followers that are already caught
	/// up. Returns the time remaining until the next heartbeat is due
	fn replicate_entries(&mut self, tick: &mut Tick) -> Duration {
		let state = match &mut self.state {
			ServerState::Leader(s) => s,
			// Only ever called from the leader arm of cycle()
			_ => return HEARTBEAT_INTERVAL,
		};

		let leader_id = self.id;
		let term = self.current_term;
		let leader_commit = self.commit_index;
		let log = &self.log;
		let last_log_index = log.last_index();

		// Requests with the same previous index are identical, so they are built
		// once and addressed to every server that needs them
		let mut message_map: HashMap<LogIndex, Message> = HashMap::new();

		// Elapsed time since the oldest heartbeat among up-to-date followers
		let mut since_last_heartbeat = Duration::from_millis(0);

		for id in self.members.iter() {
			if *id == leader_id {
				continue;
			}

			let progress = state
				.servers
				.entry(*id)
				.or_insert_with(|| ServerProgress::new(last_log_index));

			// One request in flight per server
			if progress.request_pending {
				continue;
			}

			// An up-to-date server only needs a heartbeat once per interval
			if progress.match_index >= last_log_index {
				if let Some(time) = progress.last_sent {
					let elapsed = tick.time.saturating_duration_since(time);
					if elapsed < HEARTBEAT_INTERVAL {
						if elapsed > since_last_heartbeat {
							since_last_heartbeat = elapsed;
						}
						continue;
					}
				}
			}

			progress.request_pending = true;
			progress.last_sent = Some(tick.time);

			let prev_log_index = progress.next_index - 1;

			if let Some(msg) = message_map.get_mut(&prev_log_index) {
				msg.to.push(*id);
			} else {
				let req = AppendEntriesRequest {
					term,
					leader_id,
					prev_log_index,
					// prev_log_index never exceeds our own last index, so the term
					// lookup can't miss
					prev_log_term: log.term(prev_log_index).unwrap_or(0),
					entries: log.entries_after(prev_log_index).to_vec(),
					leader_commit,
				};

				message_map.insert(
					prev_log_index,
					Message {
						to: vec![*id],
						body: MessageBody::AppendEntries(req, last_log_index),
					},
				);
			}
		}

		for (_, msg) in message_map.into_iter() {
			tick.send(msg);
		}

		HEARTBEAT_INTERVAL - since_last_heartbeat.min(HEARTBEAT_INTERVAL)
	}

	fn start_election(&mut self, tick: &mut Tick) {
		self.current_term += 1;
		self.voted_for = Some(self.id);
		tick.write_hard_state();

		info!(id = self.id, term = self.current_term, "starting election");

		self.state = ServerState::Candidate(ServerCandidateState {
			election_start: tick.time,
			election_timeout: Self::new_election_timeout(),
			votes_received: HashSet::new(),
		});

		let last = self.log.last_position();
		let req = RequestVoteRequest {
			term: self.current_term,
			candidate_id: self.id,
			last_log_index: last.index,
			last_log_term: last.term,
		};

		let ids: Vec<ServerId> =
			self.members.iter().cloned().filter(|id| *id != self.id).collect();

		if !ids.is_empty() {
			tick.send(Message { to: ids, body: MessageBody::RequestVote(req) });
		}

		// Either immediately wins a single-server election or schedules the next
		// election timeout
		self.cycle(tick);
	}

	fn become_leader(&mut self, tick: &mut Tick) {
		info!(id = self.id, term = self.current_term, "won election, becoming leader");

		let last_log_index = self.log.last_index();

		let servers = self
			.members
			.iter()
			.filter(|id| **id != self.id)
			.map(|id| (*id, ServerProgress::new(last_log_index)))
			.collect();

		self.state = ServerState::Leader(ServerLeaderState { servers });

		// We are starting our term with uncommitted entries from a previous term.
		// Propose a no-op so that they become committable under the current-term
		// counting rule
		if self.commit_index < last_log_index {
			let _ = self.propose_command(Command::Noop, tick);
			return;
		}

		// Assert leadership with an immediate round of heartbeats
		self.cycle(tick);
	}

	fn new_follower(now: Instant) -> ServerState {
		ServerState::Follower(ServerFollowerState {
			election_timeout: Self::new_election_timeout(),
			last_leader_id: None,
			last_heartbeat: now,
		})
	}

	fn become_follower(&mut self, tick: &mut Tick) {
		self.state = Self::new_follower(tick.time);
		self.cycle(tick);
	}

	/// Run every single time a term is seen in a remote request or response. If
	/// another server has a higher term than us, we must step down
	fn observe_term(&mut self, term: Term, tick: &mut Tick) {
		if term > self.current_term {
			self.current_term = term;
			self.voted_for = None;
			tick.write_hard_state();

			self.become_follower(tick);
		}
	}

	fn update_committed(&mut self, index: LogIndex, tick: &mut Tick) {
		debug_assert!(index > self.commit_index);
		self.commit_index = index;
		tick.committed = true;
	}

	/// Number of votes required to get anything done
	fn majority_size(&self) -> usize {
		self.members.len() / 2 + 1
	}

	fn new_election_timeout() -> Duration {
		let ms = rand::thread_rng().gen_range(ELECTION_TIMEOUT.0..ELECTION_TIMEOUT.1);
		Duration::from_millis(ms)
	}

	/// Called when another server is requesting that we vote for it. The response
	/// must not leave this server until the hard state has been saved: the whole
	/// point of the vote record is to survive a crash
	pub fn request_vote(
		&mut self,
		req: RequestVoteRequest,
		tick: &mut Tick,
	) -> MustPersistHardState<RequestVoteResponse> {
		self.observe_term(req.term, tick);

		let granted = self.should_grant_vote(&req);

		if granted {
			self.voted_for = Some(req.candidate_id);
			tick.write_hard_state();

			// Granting a vote implies we believe the candidate may become leader,
			// so defer our own election
			if let ServerState::Follower(s) = &mut self.state {
				s.last_heartbeat = tick.time;
			}

			debug!(id = self.id, candidate = req.candidate_id, term = self.current_term, "granted vote");
		}

		MustPersistHardState::new(RequestVoteResponse {
			term: self.current_term,
			vote_granted: granted,
		})
	}

	fn should_grant_vote(&self, req: &RequestVoteRequest) -> bool {
		// observe_term already adopted any higher term, so an up-to-date request
		// now has exactly our term
		if req.term < self.current_term {
			return false;
		}

		match self.voted_for {
			// We have already voted in this term and are not allowed to change our
			// mind
			Some(id) if id != req.candidate_id => return false,
			_ => {}
		}

		// Whether the candidate's log is at least as up-to-date as our own
		let last = self.log.last_position();
		req.last_log_term > last.term
			|| (req.last_log_term == last.term && req.last_log_index >= last.index)
	}

	/// Handles a replication request from the server claiming to be the current
	/// leader. A success response must not be sent until the appended entries are
	/// durable
	pub fn append_entries(
		&mut self,
		req: AppendEntriesRequest,
		tick: &mut Tick,
	) -> Result<MustPersistHardState<AppendEntriesResponse>> {
		self.observe_term(req.term, tick);

		let response = |term: Term, success: bool| {
			MustPersistHardState::new(AppendEntriesResponse { term, success })
		};

		// A request from an older term is not from the current leader; the term in
		// our response will demote it
		if req.term < self.current_term {
			return Ok(response(self.current_term, false));
		}

		// A candidate observing a leader in its own term lost the election
		match &self.state {
			ServerState::Candidate(_) => self.become_follower(tick),
			ServerState::Leader(_) => {
				// Two leaders in one term would mean votes were double counted
				bail!("received append entries from a second leader in term {}", req.term);
			}
			ServerState::Follower(_) => {}
		}

		if let ServerState::Follower(s) = &mut self.state {
			s.last_heartbeat = tick.time;
			s.last_leader_id = Some(req.leader_id);
		}

		// Sanity check that the entries are sequential and start right after the
		// declared previous position
		if let Some(first) = req.entries.first() {
			if first.index != req.prev_log_index + 1 {
				bail!("received entries do not follow the previous position");
			}
			for pair in req.entries.windows(2) {
				if pair[1].index != pair[0].index + 1 || pair[1].term < pair[0].term {
					bail!("received entries are unsorted or inconsistent");
				}
			}
		}

		// The leader will decrement and retry until our logs agree at this position
		match self.log.term(req.prev_log_index) {
			Some(term) if term == req.prev_log_term => {}
			_ => return Ok(response(self.current_term, false)),
		}

		// Skip entries we already have; on the first conflict, truncate our log
		// from that index onward
		let mut first_new = 0;
		for e in req.entries.iter() {
			match self.log.term(e.index) {
				Some(t) if t == e.term => {
					first_new += 1;
				}
				Some(_) => {
					if self.commit_index >= e.index {
						bail!("refusing to truncate entries already committed locally");
					}

					self.log.truncate_suffix(e.index);
					tick.write_hard_state();
					break;
				}
				None => break,
			}
		}

		for e in &req.entries[first_new..] {
			self.log.append(e.clone());
			tick.write_hard_state();
		}

		// Index of the last entry this request vouched for, whether or not we had
		// to append it
		let last_new = req.entries.last().map(|e| e.index).unwrap_or(req.prev_log_index);

		// Only advance the commit index over entries this request has vouched for;
		// anything beyond last_new may still disagree with the leader
		if req.leader_commit > self.commit_index {
			let next = std::cmp::min(req.leader_commit, last_new);
			if next > self.commit_index {
				self.update_committed(next, tick);
			}
		}

		Ok(response(self.current_term, true))
	}

	/// Handles the response to a RequestVote that this module issued to the given
	/// server
	pub fn request_vote_callback(
		&mut self,
		from_id: ServerId,
		resp: RequestVoteResponse,
		tick: &mut Tick,
	) {
		self.observe_term(resp.term, tick);

		// Late responses from an election we already abandoned carry a stale term
		if resp.term != self.current_term || from_id == self.id {
			return;
		}

		let mut should_cycle = false;
		if let ServerState::Candidate(s) = &mut self.state {
			if resp.vote_granted {
				s.votes_received.insert(from_id);
			}
			should_cycle = true;
		}

		if should_cycle {
			// Only really needed if we just achieved a majority
			self.cycle(tick);
		}
	}

	/// Handles the response to an AppendEntries request. last_index is the last
	/// log index carried by the original request
	pub fn append_entries_callback(
		&mut self,
		from_id: ServerId,
		last_index: LogIndex,
		resp: AppendEntriesResponse,
		tick: &mut Tick,
	) {
		self.observe_term(resp.term, tick);

		if resp.term != self.current_term {
			return;
		}

		let mut should_cycle = false;
		if let ServerState::Leader(s) = &mut self.state {
			if let Some(progress) = s.servers.get_mut(&from_id) {
				if resp.success {
					if last_index > progress.match_index {
						progress.match_index = last_index;
						progress.next_index = last_index + 1;
					}
				} else {
					// The follower is missing or disagrees at next_index - 1; back
					// off one entry and retry
					// TODO: Try jumping straight to the follower's last index to
					// catch up far-behind followers in fewer round trips
					if progress.next_index > 1 {
						progress.next_index -= 1;
					}
				}

				progress.request_pending = false;
				should_cycle = true;
			}
		}

		if should_cycle {
			self.cycle(tick);
		}
	}

	/// Handles the event of receiving no response (drop, timeout, or transport
	/// error) for an AppendEntries request
	pub fn append_entries_noresponse(&mut self, from_id: ServerId, _tick: &mut Tick) {
		// The next heartbeat interval will retry on its own cadence
		if let ServerState::Leader(s) = &mut self.state {
			if let Some(progress) = s.servers.get_mut(&from_id) {
				progress.request_pending = false;
			}
		}
	}
}
