use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::*;
use crate::protos::ServerId;

/// One record of the cluster configuration file
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PeerDescriptor {
	pub id: ServerId,
	pub ip: String,
	pub port: u16,
}

impl PeerDescriptor {
	pub fn addr(&self) -> String {
		format!("{}:{}", self.ip, self.port)
	}
}

/// Static cluster membership. The configuration is fixed for the lifetime of the
/// cluster; there are no runtime membership changes
#[derive(Debug, Clone)]
pub struct ClusterConfig {
	peers: Vec<PeerDescriptor>,
}

impl ClusterConfig {
	/// Loads a JSON array of peer records from disk
	pub fn load(path: &Path) -> Result<ClusterConfig> {
		let data = std::fs::read(path)
			.chain_err(|| format!("failed to read cluster config {:?}", path))?;
		let peers: Vec<PeerDescriptor> = serde_json::from_slice(&data)?;
		Self::from_peers(peers)
	}

	pub fn from_peers(mut peers: Vec<PeerDescriptor>) -> Result<ClusterConfig> {
		if peers.is_empty() {
			bail!("cluster config contains no peers");
		}

		let mut seen = HashSet::new();
		for p in &peers {
			if !seen.insert(p.id) {
				bail!("duplicate server id {} in cluster config", p.id);
			}
		}

		// A stable id order makes primary selection and quorum math deterministic
		// across servers
		peers.sort_by_key(|p| p.id);

		Ok(ClusterConfig { peers })
	}

	pub fn peers(&self) -> &[PeerDescriptor] {
		&self.peers
	}

	pub fn ids(&self) -> Vec<ServerId> {
		self.peers.iter().map(|p| p.id).collect()
	}

	pub fn peer(&self, id: ServerId) -> Option<&PeerDescriptor> {
		self.peers.iter().find(|p| p.id == id)
	}

	pub fn len(&self) -> usize {
		self.peers.len()
	}

	pub fn is_empty(&self) -> bool {
		self.peers.is_empty()
	}

	/// Checks that the cluster is usable for byzantine agreement and returns the
	/// number of tolerated faulty servers. Requires exactly n = 3f + 1 with f >= 1;
	/// anything else is a configuration error rather than a runtime surprise
	pub fn byzantine_faults(&self) -> Result<usize> {
		let n = self.peers.len();
		if n < 4 || n % 3 != 1 {
			bail!(
				"byzantine agreement requires n = 3f + 1 servers with f >= 1, got n = {}",
				n
			);
		}
		Ok((n - 1) / 3)
	}
}
