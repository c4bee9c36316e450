use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::atomic::{DirLock, Wal};
use crate::bft_server::{BftServer, BftServerHandler};
use crate::config::ClusterConfig;
use crate::errors::*;
use crate::protos::ServerId;
use crate::rpc::{self, PeerPool};
use crate::server::{Server, ServerHandler};
use crate::state_machine::MemoryKVStateMachine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
	/// Crash-fault-tolerant log replication
	Raft,
	/// Byzantine-fault-tolerant three-phase agreement
	Pbft,
}

pub struct NodeConfig {
	pub id: ServerId,

	/// Directory for this instance's durable state. Locked for the lifetime of
	/// the node
	pub dir: PathBuf,

	/// Path to the JSON cluster configuration for the chosen protocol
	pub config_path: PathBuf,

	pub protocol: Protocol,

	/// Run the byzantine protocol dishonestly (testing only)
	pub malicious: bool,
}

enum ProtocolServer {
	Raft(Arc<Server>),
	Pbft(Arc<BftServer>),
}

/// One running node: a bound listener, the protocol server behind it, and its
/// background workers. Dropping the node after shutdown() releases the data
/// directory lock
pub struct Node {
	pub id: ServerId,
	addr: String,
	shutdown: watch::Sender<bool>,
	_dir_lock: DirLock,
	_server: ProtocolServer,
}

impl Node {
	pub async fn start(config: NodeConfig) -> Result<Arc<Node>> {
		let dir_lock = DirLock::open(&config.dir)?;

		let cluster = ClusterConfig::load(&config.config_path)?;
		let me = cluster
			.peer(config.id)
			.ok_or_else(|| {
				Error::from(format!("server id {} is not in the cluster config", config.id))
			})?
			.clone();

		let listener = TcpListener::bind(me.addr()).await
			.chain_err(|| format!("failed to bind {}", me.addr()))?;
		let addr = listener.local_addr()?.to_string();

		let pool = Arc::new(PeerPool::new(config.id, cluster.peers()));
		let state_machine = Arc::new(MemoryKVStateMachine::new());
		let (shutdown_tx, shutdown_rx) = watch::channel(false);

		let server = match config.protocol {
			Protocol::Raft => {
				let wal = Wal::open(&config.dir, config.id);
				let hard_state = wal.load()?;

				let server = Server::new(
					config.id,
					cluster.ids(),
					wal,
					hard_state,
					state_machine,
					pool,
					shutdown_rx.clone(),
				);
				server.start();

				tokio::spawn(rpc::serve(
					listener,
					Arc::new(ServerHandler(server.clone())),
					shutdown_rx,
				));

				ProtocolServer::Raft(server)
			}
			Protocol::Pbft => {
				// Reject unusable cluster sizes before serving anything
				cluster.byzantine_faults()?;

				let server = BftServer::new(
					config.id,
					cluster.ids(),
					config.malicious,
					state_machine,
					pool,
					shutdown_rx.clone(),
				)?;

				tokio::spawn(rpc::serve(
					listener,
					Arc::new(BftServerHandler(server.clone())),
					shutdown_rx,
				));

				ProtocolServer::Pbft(server)
			}
		};

		info!(id = config.id, addr = %addr, protocol = ?config.protocol, "node started");

		Ok(Arc::new(Node {
			id: config.id,
			addr,
			shutdown: shutdown_tx,
			_dir_lock: dir_lock,
			_server: server,
		}))
	}

	pub fn addr(&self) -> &str {
		&self.addr
	}

	/// Stops the timers, refuses new RPCs, and lets in-flight handlers drain on
	/// their own deadlines
	pub fn shutdown(&self) {
		let _ = self.shutdown.send(true);
	}
}
