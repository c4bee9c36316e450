use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{oneshot, watch};
use tokio::time::{timeout, Duration};
use tracing::debug;

use crate::bft::{BftEnvelope, BftModule, BftOutput, BftSubmitError};
use crate::errors::*;
use crate::protos::*;
use crate::rpc::{self, PeerPool};
use crate::state_machine::MemoryKVStateMachine;

const SUBMIT_TIMEOUT: Duration = Duration::from_secs(2);

struct SubmitWaiter {
	seq: SeqNum,
	tx: oneshot::Sender<SubmitRequestResponse>,
}

struct BftShared {
	module: BftModule,
	waiters: Vec<SubmitWaiter>,
}

/// One byzantine-fault-tolerant replica. The same shape as the crash-fault
/// server: a single mutex over the pure module, message fan-out outside the
/// lock. There is no write-ahead log here; the protocol's quorum intersection
/// carries the safety argument instead of local durability
pub struct BftServer {
	id: ServerId,
	members: Vec<ServerId>,
	shared: Mutex<BftShared>,
	state_machine: Arc<MemoryKVStateMachine>,
	pool: Arc<PeerPool>,
	shutdown: watch::Receiver<bool>,
}

impl BftServer {
	pub fn new(
		id: ServerId,
		members: Vec<ServerId>,
		malicious: bool,
		state_machine: Arc<MemoryKVStateMachine>,
		pool: Arc<PeerPool>,
		shutdown: watch::Receiver<bool>,
	) -> Result<Arc<BftServer>> {
		let module = BftModule::new(id, members.clone(), malicious)?;

		Ok(Arc::new(BftServer {
			id,
			members,
			shared: Mutex::new(BftShared { module, waiters: vec![] }),
			state_machine,
			pool,
			shutdown,
		}))
	}

	/// Runs one protocol step under the lock. Requests that became executable are
	/// applied to the state machine before the lock is released, which is what
	/// pins the strict sequence order; broadcasts go out afterwards
	fn with_module<R>(
		self: &Arc<Self>,
		f: impl FnOnce(&mut BftShared, &mut BftOutput) -> R,
	) -> Option<R> {
		if *self.shutdown.borrow() {
			return None;
		}

		let (result, broadcasts) = {
			let mut shared = self.shared.lock().unwrap();
			let mut out = BftOutput::default();
			let result = f(&mut shared, &mut out);

			for (seq, command) in out.executable {
				let outcome = self.state_machine.apply(&command);
				debug!(id = self.id, seq, "applied request");

				let mut i = 0;
				while i < shared.waiters.len() {
					if shared.waiters[i].seq != seq {
						i += 1;
						continue;
					}
					let waiter = shared.waiters.swap_remove(i);
					let _ = waiter.tx.send(SubmitRequestResponse {
						ok: true,
						value: outcome.value.clone(),
					});
				}
			}

			(result, out.broadcasts)
		};

		self.dispatch(broadcasts);
		Some(result)
	}

	/// Fans each produced message out to every other replica. Agreement messages
	/// are one-way; nobody waits on the acknowledgements
	fn dispatch(self: &Arc<Self>, broadcasts: Vec<BftEnvelope>) {
		if broadcasts.is_empty() {
			return;
		}

		let others: Vec<ServerId> =
			self.members.iter().cloned().filter(|id| *id != self.id).collect();

		for envelope in broadcasts {
			let req = match envelope {
				BftEnvelope::PrePrepare(msg) => Request::PrePrepare(msg),
				BftEnvelope::Prepare(msg) => Request::Prepare(msg),
				BftEnvelope::Commit(msg) => Request::Commit(msg),
			};

			// Responses don't matter; dropping the receiver lets the calls finish
			// on their own
			let _ = self.pool.broadcast(&others, req, rpc::RPC_DEADLINE);
		}
	}

	pub async fn submit(self: &Arc<Self>, command: Command) -> SubmitRequestResponse {
		let (tx, rx) = oneshot::channel();

		let submitted = self.with_module(move |shared, out| {
			match shared.module.submit(command, out) {
				Ok(seq) => {
					shared.waiters.push(SubmitWaiter { seq, tx });
					Ok(())
				}
				Err(e) => Err(e),
			}
		});

		match submitted {
			None | Some(Err(BftSubmitError::NotPrimary { .. })) => {
				SubmitRequestResponse { ok: false, value: None }
			}
			Some(Ok(())) => match timeout(SUBMIT_TIMEOUT, rx).await {
				Ok(Ok(resp)) => resp,
				_ => SubmitRequestResponse { ok: false, value: None },
			},
		}
	}

	pub fn status(&self) -> StatusResponse {
		let shared = self.shared.lock().unwrap();
		let executed = shared.module.last_executed();

		StatusResponse {
			id: self.id,
			role: if shared.module.is_primary() { Role::Leader } else { Role::Follower },
			current_term: shared.module.view(),
			commit_index: executed,
			last_applied: executed,
			log_len: executed,
			leader_hint: Some(shared.module.primary()),
		}
	}
}

/// Inbound RPC dispatch for a byzantine replica
pub struct BftServerHandler(pub Arc<BftServer>);

#[async_trait]
impl rpc::Handler for BftServerHandler {
	async fn handle(&self, req: Request) -> Response {
		let server = &self.0;

		match req {
			Request::PrePrepare(msg) => {
				server.with_module(|shared, out| shared.module.handle_pre_prepare(msg, out));
				Response::Ack
			}
			Request::Prepare(msg) => {
				server.with_module(|shared, out| shared.module.handle_prepare(msg, out));
				Response::Ack
			}
			Request::Commit(msg) => {
				server.with_module(|shared, out| shared.module.handle_commit(msg, out));
				Response::Ack
			}
			Request::SubmitRequest(req) => {
				Response::SubmitRequest(server.submit(req.command).await)
			}
			Request::SetPartition(req) => {
				server.pool.filter.set(&req.blocked_ids);
				Response::Ack
			}
			Request::Read(req) => {
				Response::Read(ReadResponse { value: server.state_machine.get(&req.key) })
			}
			Request::Status => Response::Status(server.status()),
			Request::Ping => Response::Ack,
			_ => Response::Error("log replication is not enabled on this server".into()),
		}
	}
}
