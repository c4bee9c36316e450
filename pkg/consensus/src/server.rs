use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{oneshot, watch, Notify};
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, error};

use crate::consensus::{ConsensusModule, ProposeError, Tick, HEARTBEAT_INTERVAL};
use crate::atomic::Wal;
use crate::protos::*;
use crate::rpc::{self, PeerPool};
use crate::state_machine::MemoryKVStateMachine;

/// How long a client submission may wait for commitment and application before
/// the server gives up on answering
const SUBMIT_TIMEOUT: Duration = Duration::from_secs(2);

struct CommitWaiter {
	position: LogPosition,
	tx: oneshot::Sender<SubmitCommandResponse>,
}

struct ServerShared {
	module: ConsensusModule,
	wal: Wal,

	/// Index of the last entry handed to the state machine. Always at most the
	/// module's commit index
	last_applied: LogIndex,

	waiters: Vec<CommitWaiter>,
}

/// One crash-fault-tolerant replication server. Owns the consensus module behind
/// a single coarse mutex; timers, inbound handlers, and response callbacks all
/// funnel their state transitions through it, and every outbound message is sent
/// outside the lock from snapshot data the module placed in its tick
pub struct Server {
	id: ServerId,
	shared: Mutex<ServerShared>,
	state_machine: Arc<MemoryKVStateMachine>,
	pool: Arc<PeerPool>,

	cycle_notify: Notify,
	apply_notify: Notify,
	shutdown: watch::Receiver<bool>,

	/// Set when a hard state save fails. Correctness of everything we say on the
	/// wire depends on persistence, so a failed server stops participating
	failed: AtomicBool,
}

impl Server {
	pub fn new(
		id: ServerId,
		members: Vec<ServerId>,
		wal: Wal,
		hard_state: HardState,
		state_machine: Arc<MemoryKVStateMachine>,
		pool: Arc<PeerPool>,
		shutdown: watch::Receiver<bool>,
	) -> Arc<Server> {
		let module = ConsensusModule::new(id, members, hard_state, std::time::Instant::now());

		Arc::new(Server {
			id,
			shared: Mutex::new(ServerShared { module, wal, last_applied: 0, waiters: vec![] }),
			state_machine,
			pool,
			cycle_notify: Notify::new(),
			apply_notify: Notify::new(),
			shutdown,
			failed: AtomicBool::new(false),
		})
	}

	/// Starts the timer and apply workers
	pub fn start(self: &Arc<Self>) {
		let server = self.clone();
		tokio::spawn(async move { server.run_cycle().await });

		let server = self.clone();
		tokio::spawn(async move { server.run_apply().await });
	}

	/// Runs one state transition under the lock. Hard state produced by the
	/// transition is saved before the lock is released, and the transition's
	/// messages are dispatched only afterwards, so nothing ever leaves this server
	/// ahead of its own durability
	fn with_module<R>(
		self: &Arc<Self>,
		f: impl FnOnce(&mut ServerShared, &mut Tick) -> R,
	) -> Option<R> {
		if self.failed.load(Ordering::SeqCst) || *self.shutdown.borrow() {
			return None;
		}

		let (result, messages) = {
			let mut shared = self.shared.lock().unwrap();
			let mut tick = Tick::empty();
			let result = f(&mut shared, &mut tick);

			if tick.persist {
				if let Err(e) = shared.wal.save(&shared.module.hard_state()) {
					error!(id = self.id, error = %e, "hard state save failed, leaving the cluster");
					self.failed.store(true, Ordering::SeqCst);
					return None;
				}
			}

			if tick.committed {
				self.apply_notify.notify_one();
			}

			(result, tick.messages)
		};

		if !messages.is_empty() {
			self.dispatch(messages);
			// The timer worker recomputes its deadline; a fresh leader must begin
			// heartbeating right away rather than after a follower-length sleep
			self.cycle_notify.notify_one();
		}

		Some(result)
	}

	/// Sends out the messages produced by one tick and feeds responses back into
	/// the module as they arrive. Each peer is contacted on its own task; silence
	/// is reported for replication so the leader can clear its in-flight marker
	fn dispatch(self: &Arc<Self>, messages: Vec<Message>) {
		for msg in messages {
			match msg.body {
				MessageBody::RequestVote(req) => {
					for to in msg.to {
						let server = self.clone();
						let req = req.clone();
						tokio::spawn(async move {
							let client = match server.pool.client(to) {
								Some(c) => c,
								None => return,
							};

							let resp =
								client.call(&Request::RequestVote(req), rpc::RPC_DEADLINE).await;

							if let Some(Response::RequestVote(resp)) = resp {
								server.with_module(|s, tick| {
									s.module.request_vote_callback(to, resp, tick)
								});
							}
						});
					}
				}
				MessageBody::AppendEntries(req, last_index) => {
					let deadline = rpc::replication_deadline(req.entries.len());
					for to in msg.to {
						let server = self.clone();
						let req = req.clone();
						tokio::spawn(async move {
							let client = match server.pool.client(to) {
								Some(c) => c,
								None => return,
							};

							let resp =
								client.call(&Request::AppendEntries(req), deadline).await;

							match resp {
								Some(Response::AppendEntries(resp)) => {
									server.with_module(|s, tick| {
										s.module.append_entries_callback(
											to, last_index, resp, tick,
										)
									});
								}
								_ => {
									server.with_module(|s, tick| {
										s.module.append_entries_noresponse(to, tick)
									});
								}
							}
						});
					}
				}
			}
		}
	}

	/// Fails and removes waiters that can no longer resolve, so leadership churn
	/// doesn't grow the waiter list without bound. A waiter's entry may still
	/// commit only while the log holds exactly its (term, index); once the entry
	/// has been truncated or overwritten by another leader, answer not-leader now
	/// rather than keeping the slot forever. Submitters that already gave up have
	/// closed their channel and are simply dropped
	fn prune_waiters(shared: &mut ServerShared) {
		let mut i = 0;
		while i < shared.waiters.len() {
			if shared.waiters[i].tx.is_closed() {
				shared.waiters.swap_remove(i);
				continue;
			}

			let position = shared.waiters[i].position;
			let intact =
				matches!(shared.module.log().term(position.index), Some(t) if t == position.term);
			if intact {
				i += 1;
				continue;
			}

			let waiter = shared.waiters.swap_remove(i);
			let _ = waiter.tx.send(SubmitCommandResponse::NotLeader {
				leader_hint: shared.module.leader_hint(),
			});
		}
	}

	/// Election and heartbeat timer worker
	async fn run_cycle(self: Arc<Self>) {
		let mut shutdown = self.shutdown.clone();

		loop {
			if *shutdown.borrow() || self.failed.load(Ordering::SeqCst) {
				break;
			}

			let next = {
				let mut shared = self.shared.lock().unwrap();
				let mut tick = Tick::empty();
				shared.module.cycle(&mut tick);
				Self::prune_waiters(&mut shared);

				if tick.persist {
					if let Err(e) = shared.wal.save(&shared.module.hard_state()) {
						error!(id = self.id, error = %e, "hard state save failed, leaving the cluster");
						self.failed.store(true, Ordering::SeqCst);
						break;
					}
				}
				if tick.committed {
					self.apply_notify.notify_one();
				}

				let next = tick.next_tick;
				let messages = tick.messages;
				drop(shared);

				if !messages.is_empty() {
					self.dispatch(messages);
				}
				next
			};

			let wait = next.unwrap_or(HEARTBEAT_INTERVAL);
			tokio::select! {
				_ = sleep(wait) => {}
				_ = self.cycle_notify.notified() => {}
				_ = shutdown.changed() => break,
			}
		}
	}

	/// Apply worker: hands committed entries to the state machine in strict index
	/// order and resolves client submissions waiting on them
	async fn run_apply(self: Arc<Self>) {
		let mut shutdown = self.shutdown.clone();

		loop {
			loop {
				let batch: Vec<LogEntry> = {
					let shared = self.shared.lock().unwrap();
					let from = shared.last_applied;
					let to = shared.module.commit_index();
					if from >= to {
						break;
					}

					((from + 1)..=to)
						.filter_map(|i| shared.module.log().entry(i).cloned())
						.collect()
				};

				for entry in batch {
					let outcome = self.state_machine.apply(&entry.command);
					debug!(id = self.id, index = entry.index, "applied entry");

					let mut shared = self.shared.lock().unwrap();
					shared.last_applied = entry.index;

					// A waiter's proposal either landed at this index in its own
					// term, or was displaced by another leader's entry
					let mut i = 0;
					while i < shared.waiters.len() {
						if shared.waiters[i].position.index != entry.index {
							i += 1;
							continue;
						}

						let waiter = shared.waiters.swap_remove(i);
						let resp = if waiter.position.term == entry.term {
							SubmitCommandResponse::Ok { value: outcome.value.clone() }
						} else {
							SubmitCommandResponse::NotLeader {
								leader_hint: shared.module.leader_hint(),
							}
						};
						let _ = waiter.tx.send(resp);
					}
				}
			}

			{
				let mut shared = self.shared.lock().unwrap();
				Self::prune_waiters(&mut shared);
			}

			tokio::select! {
				_ = self.apply_notify.notified() => {}
				_ = shutdown.changed() => break,
			}
		}
	}

	/// Client command submission. Appends on the leader and answers once the
	/// entry has been committed and applied
	pub async fn submit(self: &Arc<Self>, command: Command) -> SubmitCommandResponse {
		let (tx, rx) = oneshot::channel();

		let proposed = self.with_module(move |s, tick| {
			match s.module.propose_command(command, tick) {
				Ok(position) => {
					s.waiters.push(CommitWaiter { position, tx });
					Ok(())
				}
				Err(e) => Err(e),
			}
		});

		match proposed {
			None => SubmitCommandResponse::Timeout,
			Some(Err(ProposeError::NotLeader { leader_hint })) => {
				SubmitCommandResponse::NotLeader { leader_hint }
			}
			Some(Ok(())) => match timeout(SUBMIT_TIMEOUT, rx).await {
				Ok(Ok(resp)) => resp,
				// Either the submission deadline passed or the waiter was dropped
				// during shutdown
				_ => SubmitCommandResponse::Timeout,
			},
		}
	}

	pub fn status(&self) -> StatusResponse {
		let shared = self.shared.lock().unwrap();
		StatusResponse {
			id: self.id,
			role: shared.module.role(),
			current_term: shared.module.current_term(),
			commit_index: shared.module.commit_index(),
			last_applied: shared.last_applied,
			log_len: shared.module.log().len(),
			leader_hint: shared.module.leader_hint(),
		}
	}
}

/// Inbound RPC dispatch for a crash-fault-tolerant server
pub struct ServerHandler(pub Arc<Server>);

#[async_trait]
impl rpc::Handler for ServerHandler {
	async fn handle(&self, req: Request) -> Response {
		let server = &self.0;

		match req {
			Request::RequestVote(req) => {
				match server.with_module(|s, tick| s.module.request_vote(req, tick)) {
					Some(resp) => Response::RequestVote(resp.persisted()),
					None => Response::Error("server is unavailable".into()),
				}
			}
			Request::AppendEntries(req) => {
				match server.with_module(|s, tick| s.module.append_entries(req, tick)) {
					Some(Ok(resp)) => Response::AppendEntries(resp.persisted()),
					Some(Err(e)) => Response::Error(e.to_string()),
					None => Response::Error("server is unavailable".into()),
				}
			}
			Request::SubmitCommand(req) => {
				Response::SubmitCommand(server.submit(req.command).await)
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
			_ => Response::Error("byzantine agreement is not enabled on this server".into()),
		}
	}
}
