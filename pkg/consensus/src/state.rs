use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::protos::*;

/// Volatile role state of a single server. Recreated from scratch on every role
/// transition; nothing in here survives a restart
pub enum ServerState {
	Follower(ServerFollowerState),
	Candidate(ServerCandidateState),
	Leader(ServerLeaderState),
}

impl ServerState {
	pub fn role(&self) -> Role {
		match self {
			ServerState::Follower(_) => Role::Follower,
			ServerState::Candidate(_) => Role::Candidate,
			ServerState::Leader(_) => Role::Leader,
		}
	}
}

pub struct ServerFollowerState {
	pub election_timeout: Duration,

	/// Id of the last server we observed acting as leader, used as a redirect hint
	/// for clients
	pub last_leader_id: Option<ServerId>,

	/// Last time we received any message that asserts the presence of a current
	/// leader (or granted a vote)
	pub last_heartbeat: Instant,
}

pub struct ServerCandidateState {
	/// Time at which the current election was started
	pub election_start: Instant,

	/// Randomized deadline after which a fresh election is started (split vote)
	pub election_timeout: Duration,

	/// Servers that granted us a vote in the current term. Our own vote is implicit
	pub votes_received: HashSet<ServerId>,
}

pub struct ServerLeaderState {
	pub servers: HashMap<ServerId, ServerProgress>,
}

/// Leader-side replication progress for a single follower
pub struct ServerProgress {
	/// Index of the next log entry to send
	pub next_index: LogIndex,

	/// Highest index known to be replicated on the follower
	pub match_index: LogIndex,

	/// Whether a request is currently in flight to this server. While set, no
	/// further requests are issued to it
	pub request_pending: bool,

	/// When we last sent any request to this server
	pub last_sent: Option<Instant>,
}

impl ServerProgress {
	pub fn new(last_log_index: LogIndex) -> ServerProgress {
		ServerProgress {
			next_index: last_log_index + 1,
			match_index: 0,
			request_pending: false,
			last_sent: None,
		}
	}
}
