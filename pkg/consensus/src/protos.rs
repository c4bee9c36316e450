use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Type used to uniquely identify each server. Assigned statically in the cluster
/// configuration file and never reused
pub type ServerId = u64;

pub type Term = u64;

pub type LogIndex = u64;

/// Agreement epoch for the byzantine protocol. Determines which server is the primary
pub type ViewId = u64;

/// Sequence number assigned by the primary to order requests within a view
pub type SeqNum = u64;

/// SHA-256 hash of the canonical encoding of a command
pub type RequestDigest = [u8; 32];

/// A deterministic operation on the replicated key-value store
/// Applying the same sequence of commands on two servers must produce identical states
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum Command {
	Set { key: String, value: String },

	Delete { key: String },

	Get { key: String },

	/// Does nothing but occupies a single log index
	/// Proposed by a new leader to force commitment of entries from older terms
	Noop,
}

impl Command {
	/// Hashes the command through a fixed field-by-field encoding
	/// Every honest server hashing the same command must produce the same digest, so
	/// this must stay stable across versions (keys are length-prefixed to keep the
	/// encoding unambiguous)
	pub fn digest(&self) -> RequestDigest {
		let mut h = Sha256::new();
		match self {
			Command::Set { key, value } => {
				h.update([1u8]);
				h.update((key.len() as u32).to_be_bytes());
				h.update(key.as_bytes());
				h.update(value.as_bytes());
			}
			Command::Delete { key } => {
				h.update([2u8]);
				h.update(key.as_bytes());
			}
			Command::Get { key } => {
				h.update([3u8]);
				h.update(key.as_bytes());
			}
			Command::Noop => {
				h.update([4u8]);
			}
		}

		h.finalize().into()
	}
}

/// The format of a single entry in every server's replicated log
/// Each entry represents an increment by one of the current log index and is
/// immutable once appended
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
	pub term: Term,
	pub index: LogIndex,
	pub command: Command,
}

/// Persistent state of a single server
/// This is the exact tuple that must survive a crash: everything else is
/// reconstructable from it
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct HardState {
	/// Latest term seen by this server (starts at 0)
	pub current_term: Term,

	/// The id of the server that we have voted for in the current term
	pub voted_for: Option<ServerId>,

	pub entries: Vec<LogEntry>,
}

/// A (term, index) pair naming one slot of the log
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogPosition {
	pub term: Term,
	pub index: LogIndex,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
	Follower,
	Candidate,
	Leader,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RequestVoteRequest {
	pub term: Term,
	pub candidate_id: ServerId,
	pub last_log_index: LogIndex,
	pub last_log_term: Term,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RequestVoteResponse {
	pub term: Term,
	pub vote_granted: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AppendEntriesRequest {
	pub term: Term,
	pub leader_id: ServerId,
	pub prev_log_index: LogIndex,
	pub prev_log_term: Term,
	/// Entries with sequential indexes starting at prev_log_index + 1
	pub entries: Vec<LogEntry>,
	pub leader_commit: LogIndex,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AppendEntriesResponse {
	pub term: Term,
	pub success: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SubmitCommandRequest {
	pub command: Command,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum SubmitCommandResponse {
	/// The command was committed and applied. For a Get this carries the value
	Ok { value: Option<String> },

	/// This server is not the leader. The hint is the last server observed acting
	/// as leader, if any; the caller is expected to redirect
	NotLeader { leader_hint: Option<ServerId> },

	/// The command could not be confirmed within the submission deadline. It may
	/// or may not commit later
	Timeout,
}

/// First phase of the byzantine agreement. Only the primary of the view may send
/// this, and only this message carries the request body
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PrePrepareMessage {
	pub view: ViewId,
	pub seq: SeqNum,
	pub digest: RequestDigest,
	pub sender_id: ServerId,
	pub request: Command,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PrepareMessage {
	pub view: ViewId,
	pub seq: SeqNum,
	pub digest: RequestDigest,
	pub sender_id: ServerId,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CommitMessage {
	pub view: ViewId,
	pub seq: SeqNum,
	pub digest: RequestDigest,
	pub sender_id: ServerId,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SubmitRequestRequest {
	pub command: Command,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SubmitRequestResponse {
	pub ok: bool,
	pub value: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SetPartitionRequest {
	pub blocked_ids: Vec<ServerId>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ReadRequest {
	pub key: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ReadResponse {
	pub value: Option<String>,
}

/// Snapshot of one server's externally observable protocol state. This is the
/// observability seam used by the cluster test harness
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StatusResponse {
	pub id: ServerId,
	pub role: Role,
	pub current_term: Term,
	pub commit_index: LogIndex,
	pub last_applied: LogIndex,
	pub log_len: u64,
	pub leader_hint: Option<ServerId>,
}

/// Envelope for every inbound RPC. The node server decodes one of these per
/// frame and dispatches on the variant
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum Request {
	RequestVote(RequestVoteRequest),
	AppendEntries(AppendEntriesRequest),
	SubmitCommand(SubmitCommandRequest),

	PrePrepare(PrePrepareMessage),
	Prepare(PrepareMessage),
	Commit(CommitMessage),
	SubmitRequest(SubmitRequestRequest),

	SetPartition(SetPartitionRequest),
	Read(ReadRequest),
	Status,
	Ping,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum Response {
	RequestVote(RequestVoteResponse),
	AppendEntries(AppendEntriesResponse),
	SubmitCommand(SubmitCommandResponse),
	SubmitRequest(SubmitRequestResponse),
	Read(ReadResponse),
	Status(StatusResponse),

	/// Acknowledgement for one-way messages and control calls
	Ack,

	Error(String),
}

/// An outbound message requested by the consensus module during a single operation
/// The same body may be addressed to several servers at once
pub struct Message {
	pub to: Vec<ServerId>,
	pub body: MessageBody,
}

pub enum MessageBody {
	RequestVote(RequestVoteRequest),

	/// The index is the last log index carried by the request, retained so that the
	/// response callback knows how far the follower's log was advanced
	AppendEntries(AppendEntriesRequest, LogIndex),
}
