#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use consensus::config::PeerDescriptor;
use consensus::node::{Node, NodeConfig, Protocol};
use consensus::protos::*;
use consensus::rpc;

/// Deadline for plain control calls against a test node
const CALL_TIMEOUT: Duration = Duration::from_millis(500);

/// Submissions wait for commitment, so they get the server's own patience plus
/// slack
const SUBMIT_CALL_TIMEOUT: Duration = Duration::from_secs(3);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// An in-process cluster of real nodes talking TCP on loopback
pub struct TestCluster {
	pub peers: Vec<PeerDescriptor>,
	nodes: Vec<Option<Arc<Node>>>,
	dirs: Vec<TempDir>,
	config_path: PathBuf,
	_config_dir: TempDir,
	protocol: Protocol,
	malicious: Vec<ServerId>,
}

impl TestCluster {
	pub async fn start(n: u64, protocol: Protocol, malicious: &[ServerId]) -> TestCluster {
		let peers: Vec<PeerDescriptor> = (1..=n)
			.map(|id| PeerDescriptor {
				id,
				ip: "127.0.0.1".into(),
				port: portpicker::pick_unused_port().expect("no available port"),
			})
			.collect();

		let config_dir = TempDir::new().unwrap();
		let config_path = config_dir.path().join("cluster.json");
		std::fs::write(&config_path, serde_json::to_vec_pretty(&peers).unwrap()).unwrap();

		let mut cluster = TestCluster {
			peers,
			nodes: (0..n).map(|_| None).collect(),
			dirs: (0..n).map(|_| TempDir::new().unwrap()).collect(),
			config_path,
			_config_dir: config_dir,
			protocol,
			malicious: malicious.to_vec(),
		};

		for id in 1..=n {
			cluster.boot(id).await;
		}

		cluster
	}

	/// Starts (or restarts) one node on its existing data directory
	pub async fn boot(&mut self, id: ServerId) {
		let idx = (id - 1) as usize;
		assert!(self.nodes[idx].is_none(), "node {} is already running", id);

		let node = Node::start(NodeConfig {
			id,
			dir: self.dirs[idx].path().to_path_buf(),
			config_path: self.config_path.clone(),
			protocol: self.protocol,
			malicious: self.malicious.contains(&id),
		})
		.await
		.expect("failed to start node");

		self.nodes[idx] = Some(node);
	}

	/// Stops one node and releases its listener and directory lock. The data
	/// directory itself survives for a later boot()
	pub async fn kill(&mut self, id: ServerId) {
		let idx = (id - 1) as usize;
		if let Some(node) = self.nodes[idx].take() {
			node.shutdown();
		}
		// Let the accept loop observe the signal and drop the listener
		tokio::time::sleep(Duration::from_millis(100)).await;
	}

	pub fn live_ids(&self) -> Vec<ServerId> {
		self.nodes
			.iter()
			.enumerate()
			.filter(|(_, n)| n.is_some())
			.map(|(i, _)| (i + 1) as ServerId)
			.collect()
	}

	pub fn addr(&self, id: ServerId) -> String {
		self.peers[(id - 1) as usize].addr()
	}

	async fn call(&self, id: ServerId, req: Request, deadline: Duration) -> Option<Response> {
		tokio::time::timeout(deadline, rpc::call(&self.addr(id), &req))
			.await
			.ok()
			.and_then(|r| r.ok())
	}

	pub async fn status(&self, id: ServerId) -> Option<StatusResponse> {
		match self.call(id, Request::Status, CALL_TIMEOUT).await {
			Some(Response::Status(s)) => Some(s),
			_ => None,
		}
	}

	pub async fn submit(&self, id: ServerId, command: Command) -> Option<SubmitCommandResponse> {
		let req = Request::SubmitCommand(SubmitCommandRequest { command });
		match self.call(id, req, SUBMIT_CALL_TIMEOUT).await {
			Some(Response::SubmitCommand(resp)) => Some(resp),
			_ => None,
		}
	}

	pub async fn submit_request(&self, id: ServerId, command: Command) -> Option<SubmitRequestResponse> {
		let req = Request::SubmitRequest(SubmitRequestRequest { command });
		match self.call(id, req, SUBMIT_CALL_TIMEOUT).await {
			Some(Response::SubmitRequest(resp)) => Some(resp),
			_ => None,
		}
	}

	pub async fn read(&self, id: ServerId, key: &str) -> Option<String> {
		let req = Request::Read(ReadRequest { key: key.into() });
		match self.call(id, req, CALL_TIMEOUT).await {
			Some(Response::Read(resp)) => resp.value,
			_ => None,
		}
	}

	pub async fn set_partition(&self, id: ServerId, blocked: Vec<ServerId>) {
		let req = Request::SetPartition(SetPartitionRequest { blocked_ids: blocked });
		let resp = self.call(id, req, CALL_TIMEOUT).await;
		assert!(matches!(resp, Some(Response::Ack)), "set_partition on {} failed", id);
	}

	/// Waits until one of the listed nodes reports itself leader and returns its
	/// status
	pub async fn wait_for_leader(
		&self,
		among: &[ServerId],
		deadline: Duration,
	) -> Option<StatusResponse> {
		let start = Instant::now();
		loop {
			for id in among {
				if let Some(status) = self.status(*id).await {
					if status.role == Role::Leader {
						return Some(status);
					}
				}
			}

			if start.elapsed() > deadline {
				return None;
			}
			tokio::time::sleep(POLL_INTERVAL).await;
		}
	}

	/// Waits until every listed node serves the expected value for the key
	pub async fn wait_for_value(
		&self,
		among: &[ServerId],
		key: &str,
		expected: &str,
		deadline: Duration,
	) -> bool {
		let start = Instant::now();
		loop {
			let mut all = true;
			for id in among {
				if self.read(*id, key).await.as_deref() != Some(expected) {
					all = false;
					break;
				}
			}
			if all {
				return true;
			}

			if start.elapsed() > deadline {
				return false;
			}
			tokio::time::sleep(POLL_INTERVAL).await;
		}
	}
}

pub fn set(key: &str, value: &str) -> Command {
	Command::Set { key: key.into(), value: value.into() }
}
