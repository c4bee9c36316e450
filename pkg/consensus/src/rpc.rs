use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use dashmap::DashSet;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::config::PeerDescriptor;
use crate::errors::*;
use crate::protos::{Request, Response, ServerId};

/// Deadline for votes, heartbeats, and one-way agreement messages
pub const RPC_DEADLINE: Duration = Duration::from_millis(100);

/// Refuse frames beyond this size rather than trusting a length prefix from a
/// possibly byzantine peer
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Deadline for an entry-bearing replication request, scaled with the payload
pub fn replication_deadline(num_entries: usize) -> Duration {
	RPC_DEADLINE + Duration::from_millis(2 * num_entries as u64)
}

pub fn marshal<T: Serialize>(value: &T) -> Result<Vec<u8>> {
	Ok(rmp_serde::to_vec_named(value)?)
}

pub fn unmarshal<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
	Ok(rmp_serde::from_slice(data)?)
}

async fn write_frame(stream: &mut TcpStream, body: &[u8]) -> Result<()> {
	let mut buf = BytesMut::with_capacity(4 + body.len());
	buf.put_u32(body.len() as u32);
	buf.put_slice(body);
	stream.write_all(&buf).await?;
	Ok(())
}

async fn read_frame(stream: &mut TcpStream) -> Result<Vec<u8>> {
	let mut len_buf = [0u8; 4];
	stream.read_exact(&mut len_buf).await?;

	let len = u32::from_be_bytes(len_buf) as usize;
	if len > MAX_FRAME_SIZE {
		bail!("frame of {} bytes exceeds the size limit", len);
	}

	let mut body = vec![0u8; len];
	stream.read_exact(&mut body).await?;
	Ok(body)
}

/// Sends one request to the given address and waits for the response. No deadline
/// here; callers wrap this in a timeout
pub async fn call(addr: &str, req: &Request) -> Result<Response> {
	let mut stream = TcpStream::connect(addr).await?;
	write_frame(&mut stream, &marshal(req)?).await?;
	let body = read_frame(&mut stream).await?;
	unmarshal(&body)
}

/// The set of peers this server pretends it cannot reach. A testing seam, not a
/// firewall: the send path consults it before opening any connection, so a
/// blocked peer receives no bytes at all from this server
pub struct PartitionFilter {
	blocked: DashSet<ServerId>,
}

impl PartitionFilter {
	pub fn new() -> PartitionFilter {
		PartitionFilter { blocked: DashSet::new() }
	}

	/// Replaces the blocked set wholesale
	pub fn set(&self, ids: &[ServerId]) {
		self.blocked.clear();
		for id in ids {
			self.blocked.insert(*id);
		}
	}

	pub fn is_blocked(&self, id: ServerId) -> bool {
		self.blocked.contains(&id)
	}
}

impl Default for PartitionFilter {
	fn default() -> Self {
		Self::new()
	}
}

/// One logical client per peer. Calls that are dropped by the partition filter,
/// time out, or fail in transport all yield None: the protocol layers treat every
/// flavor of silence identically and re-send on their own cadence
pub struct PeerClient {
	pub id: ServerId,
	addr: String,
	filter: Arc<PartitionFilter>,
}

impl PeerClient {
	pub fn new(peer: &PeerDescriptor, filter: Arc<PartitionFilter>) -> PeerClient {
		PeerClient { id: peer.id, addr: peer.addr(), filter }
	}

	pub async fn call(&self, req: &Request, deadline: Duration) -> Option<Response> {
		if self.filter.is_blocked(self.id) {
			trace!(peer = self.id, "outbound call dropped by partition filter");
			return None;
		}

		match timeout(deadline, call(&self.addr, req)).await {
			Ok(Ok(resp)) => Some(resp),
			Ok(Err(e)) => {
				// Transport failures are routine while peers restart or partitions
				// heal
				trace!(peer = self.id, error = %e, "outbound call failed");
				None
			}
			Err(_) => {
				trace!(peer = self.id, "outbound call timed out");
				None
			}
		}
	}
}

/// All peer clients of one server plus the shared partition filter
pub struct PeerPool {
	clients: HashMap<ServerId, Arc<PeerClient>>,
	pub filter: Arc<PartitionFilter>,
}

impl PeerPool {
	pub fn new(own_id: ServerId, peers: &[PeerDescriptor]) -> PeerPool {
		let filter = Arc::new(PartitionFilter::new());
		let clients = peers
			.iter()
			.filter(|p| p.id != own_id)
			.map(|p| (p.id, Arc::new(PeerClient::new(p, filter.clone()))))
			.collect();

		PeerPool { clients, filter }
	}

	pub fn client(&self, id: ServerId) -> Option<Arc<PeerClient>> {
		self.clients.get(&id).cloned()
	}

	/// Issues the same request to every listed peer concurrently. Responses (or
	/// None for silence) arrive on the returned channel as each call settles; the
	/// receiver may be dropped early by callers that don't care about answers
	pub fn broadcast(
		&self,
		to: &[ServerId],
		req: Request,
		deadline: Duration,
	) -> mpsc::Receiver<(ServerId, Option<Response>)> {
		let (tx, rx) = mpsc::channel(to.len().max(1));

		for id in to {
			if let Some(client) = self.client(*id) {
				let tx = tx.clone();
				let req = req.clone();
				tokio::spawn(async move {
					let resp = client.call(&req, deadline).await;
					let _ = tx.send((client.id, resp)).await;
				});
			}
		}

		rx
	}
}

/// Inbound dispatch implemented by each protocol server
#[async_trait]
pub trait Handler: Send + Sync + 'static {
	async fn handle(&self, req: Request) -> Response;
}

/// Accept loop for one server. Each connection carries one request frame and one
/// response frame; handlers run in their own task so a slow replication fan-out
/// never serializes unrelated inbound calls
pub async fn serve<H: Handler>(
	listener: TcpListener,
	handler: Arc<H>,
	mut shutdown: watch::Receiver<bool>,
) {
	loop {
		let accepted = tokio::select! {
			res = listener.accept() => res,
			_ = shutdown.changed() => break,
		};

		let (mut stream, addr) = match accepted {
			Ok(v) => v,
			Err(e) => {
				debug!(error = %e, "accept failed");
				continue;
			}
		};

		let handler = handler.clone();
		tokio::spawn(async move {
			if let Err(e) = handle_connection(&mut stream, handler).await {
				trace!(peer = %addr, error = %e, "connection closed with error");
			}
		});
	}
}

async fn handle_connection<H: Handler>(stream: &mut TcpStream, handler: Arc<H>) -> Result<()> {
	let body = read_frame(stream).await?;
	let req: Request = unmarshal(&body)?;
	let resp = handler.handle(req).await;
	write_frame(stream, &marshal(&resp)?).await
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::protos::*;

	struct EchoHandler;

	#[async_trait]
	impl Handler for EchoHandler {
		async fn handle(&self, req: Request) -> Response {
			match req {
				Request::Ping => Response::Ack,
				Request::Read(r) => Response::Read(ReadResponse { value: Some(r.key) }),
				_ => Response::Error("unexpected".into()),
			}
		}
	}

	async fn spawn_echo() -> (String, watch::Sender<bool>) {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap().to_string();
		let (tx, rx) = watch::channel(false);
		tokio::spawn(serve(listener, Arc::new(EchoHandler), rx));
		(addr, tx)
	}

	#[tokio::test]
	async fn round_trips_a_request() {
		let (addr, _shutdown) = spawn_echo().await;

		let resp = call(&addr, &Request::Read(ReadRequest { key: "hello".into() }))
			.await
			.unwrap();
		match resp {
			Response::Read(r) => assert_eq!(r.value, Some("hello".into())),
			other => panic!("unexpected response {:?}", other),
		}
	}

	#[tokio::test]
	async fn blocked_peer_gets_no_bytes() {
		// The address points at a live server, but the filter must short-circuit
		// before any connection is opened
		let (addr, _shutdown) = spawn_echo().await;
		let (ip, port) = addr.rsplit_once(':').unwrap();

		let filter = Arc::new(PartitionFilter::new());
		let peer = PeerDescriptor { id: 7, ip: ip.into(), port: port.parse().unwrap() };
		let client = PeerClient::new(&peer, filter.clone());

		filter.set(&[7]);
		assert!(client.call(&Request::Ping, RPC_DEADLINE).await.is_none());

		filter.set(&[]);
		assert!(client.call(&Request::Ping, RPC_DEADLINE).await.is_some());
	}

	#[tokio::test]
	async fn unreachable_peer_is_silence_not_error() {
		let filter = Arc::new(PartitionFilter::new());
		// Port 1 is essentially never listening
		let peer = PeerDescriptor { id: 1, ip: "127.0.0.1".into(), port: 1 };
		let client = PeerClient::new(&peer, filter);

		assert!(client.call(&Request::Ping, Duration::from_millis(50)).await.is_none());
	}

	#[tokio::test]
	async fn broadcast_collects_responses_as_they_arrive() {
		let (addr, _shutdown) = spawn_echo().await;
		let (ip, port) = addr.rsplit_once(':').unwrap();

		let peers: Vec<PeerDescriptor> = vec![
			PeerDescriptor { id: 2, ip: ip.into(), port: port.parse().unwrap() },
			// Dead peer: contributes a None
			PeerDescriptor { id: 3, ip: "127.0.0.1".into(), port: 1 },
		];

		let pool = PeerPool::new(1, &peers);
		let mut rx = pool.broadcast(&[2, 3], Request::Ping, Duration::from_millis(200));

		let mut answered = 0;
		let mut silent = 0;
		while let Some((_, resp)) = rx.recv().await {
			match resp {
				Some(_) => answered += 1,
				None => silent += 1,
			}
		}

		assert_eq!(answered, 1);
		assert_eq!(silent, 1);
	}
}
