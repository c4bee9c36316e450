//! End-to-end scenarios for the crash-fault-tolerant protocol: real nodes, real
//! sockets, injected partitions, and restarts from the write-ahead log.

mod common;

use std::time::{Duration, Instant};

use common::{set, TestCluster};
use consensus::node::{Node, NodeConfig, Protocol};
use consensus::protos::*;
use consensus::rpc;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn five_nodes_elect_a_single_leader() {
	let cluster = TestCluster::start(5, Protocol::Raft, &[]).await;
	let all: Vec<ServerId> = (1..=5).collect();

	// Within two seconds the cluster settles on exactly one leader and every
	// node agrees on the term
	let start = Instant::now();
	loop {
		let mut statuses = vec![];
		for id in &all {
			if let Some(s) = cluster.status(*id).await {
				statuses.push(s);
			}
		}

		if statuses.len() == 5 {
			let leaders = statuses.iter().filter(|s| s.role == Role::Leader).count();
			let followers = statuses.iter().filter(|s| s.role == Role::Follower).count();
			let term = statuses[0].current_term;

			if leaders == 1
				&& followers == 4
				&& statuses.iter().all(|s| s.current_term == term)
			{
				return;
			}
		}

		assert!(start.elapsed() < Duration::from_secs(2), "no stable single leader within 2s");
		tokio::time::sleep(Duration::from_millis(50)).await;
	}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn committed_command_is_served_by_every_node() {
	let cluster = TestCluster::start(5, Protocol::Raft, &[]).await;
	let all: Vec<ServerId> = (1..=5).collect();

	let leader = cluster
		.wait_for_leader(&all, Duration::from_secs(2))
		.await
		.expect("no leader elected");

	let resp = cluster.submit(leader.id, set("x", "1")).await.expect("submit failed");
	assert_eq!(resp, SubmitCommandResponse::Ok { value: None });

	assert!(
		cluster.wait_for_value(&all, "x", "1", Duration::from_secs(1)).await,
		"value not visible on every node within 1s"
	);

	// Exactly the submitted entry landed in every log
	for id in &all {
		let status = cluster.status(*id).await.expect("status failed");
		assert_eq!(status.log_len, 1, "node {} has log length {}", id, status.log_len);
	}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn surviving_nodes_elect_a_new_leader_after_failover() {
	let mut cluster = TestCluster::start(5, Protocol::Raft, &[]).await;
	let all: Vec<ServerId> = (1..=5).collect();

	let old = cluster
		.wait_for_leader(&all, Duration::from_secs(2))
		.await
		.expect("no leader elected");

	cluster.kill(old.id).await;
	let rest = cluster.live_ids();

	let new = cluster
		.wait_for_leader(&rest, Duration::from_secs(2))
		.await
		.expect("no replacement leader within 2s");
	assert_ne!(new.id, old.id);
	assert!(
		new.current_term > old.current_term,
		"new leader term {} is not above {}",
		new.current_term,
		old.current_term
	);

	let resp = cluster.submit(new.id, set("y", "2")).await.expect("submit failed");
	assert_eq!(resp, SubmitCommandResponse::Ok { value: None });

	assert!(cluster.wait_for_value(&rest, "y", "2", Duration::from_secs(2)).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn majority_side_of_a_partition_keeps_committing() {
	let cluster = TestCluster::start(5, Protocol::Raft, &[]).await;
	let all: Vec<ServerId> = (1..=5).collect();
	let majority: Vec<ServerId> = vec![1, 2, 3];
	let minority: Vec<ServerId> = vec![4, 5];

	cluster.wait_for_leader(&all, Duration::from_secs(2)).await.expect("no leader elected");

	// Cut {1,2,3} off from {4,5} in both directions
	for id in &majority {
		cluster.set_partition(*id, minority.clone()).await;
	}
	for id in &minority {
		cluster.set_partition(*id, majority.clone()).await;
	}

	// The majority side can still elect and commit
	let leader = cluster
		.wait_for_leader(&majority, Duration::from_secs(2))
		.await
		.expect("majority side has no leader");
	let resp = cluster.submit(leader.id, set("z", "A")).await.expect("submit failed");
	assert_eq!(resp, SubmitCommandResponse::Ok { value: None });
	assert!(cluster.wait_for_value(&majority, "z", "A", Duration::from_secs(1)).await);

	// The minority side must not accept writes: anything but Ok is acceptable
	let resp = cluster.submit(4, set("z", "B")).await;
	assert!(
		!matches!(resp, Some(SubmitCommandResponse::Ok { .. })),
		"a two-node side committed a write: {:?}",
		resp
	);
	assert_ne!(cluster.read(4, "z").await.as_deref(), Some("B"));
	assert_ne!(cluster.read(5, "z").await.as_deref(), Some("B"));

	// Heal the partition; the minority converges onto the committed write
	for id in &all {
		cluster.set_partition(*id, vec![]).await;
	}
	assert!(
		cluster.wait_for_value(&all, "z", "A", Duration::from_secs(2)).await,
		"minority logs did not converge after healing"
	);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn granted_vote_survives_a_restart() {
	// A single real node; the test itself plays the other two cluster members
	let peers: Vec<consensus::config::PeerDescriptor> = (1..=3)
		.map(|id| consensus::config::PeerDescriptor {
			id,
			ip: "127.0.0.1".into(),
			port: portpicker::pick_unused_port().expect("no available port"),
		})
		.collect();

	let config_dir = tempfile::tempdir().unwrap();
	let config_path = config_dir.path().join("cluster.json");
	std::fs::write(&config_path, serde_json::to_vec(&peers).unwrap()).unwrap();
	let data_dir = tempfile::tempdir().unwrap();

	let node_config = || NodeConfig {
		id: 1,
		dir: data_dir.path().to_path_buf(),
		config_path: config_path.clone(),
		protocol: Protocol::Raft,
		malicious: false,
	};

	let node = Node::start(node_config()).await.unwrap();
	let addr = peers[0].addr();

	// Candidate 2 wins node 1's vote in a far-future term
	let term = 1000;
	let vote = |candidate_id: ServerId| {
		Request::RequestVote(RequestVoteRequest {
			term,
			candidate_id,
			last_log_index: 0,
			last_log_term: 0,
		})
	};

	match rpc::call(&addr, &vote(2)).await.unwrap() {
		Response::RequestVote(resp) => assert!(resp.vote_granted),
		other => panic!("unexpected response {:?}", other),
	}

	node.shutdown();
	drop(node);
	tokio::time::sleep(Duration::from_millis(100)).await;

	// After recovery the node remembers both the term and who got its vote, so a
	// different candidate is refused in the same term
	let node = Node::start(node_config()).await.unwrap();

	match rpc::call(&addr, &vote(3)).await.unwrap() {
		Response::RequestVote(resp) => {
			assert!(!resp.vote_granted, "second vote granted in the same term")
		}
		other => panic!("unexpected response {:?}", other),
	}

	match rpc::call(&addr, &Request::Status).await.unwrap() {
		Response::Status(status) => assert!(
			status.current_term >= term,
			"recovered term {} below the persisted {}",
			status.current_term,
			term
		),
		other => panic!("unexpected response {:?}", other),
	}

	node.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn submissions_to_followers_carry_a_leader_hint() {
	let cluster = TestCluster::start(3, Protocol::Raft, &[]).await;
	let all: Vec<ServerId> = (1..=3).collect();

	let leader = cluster
		.wait_for_leader(&all, Duration::from_secs(2))
		.await
		.expect("no leader elected");

	// Give followers a heartbeat to learn who leads
	tokio::time::sleep(Duration::from_millis(200)).await;

	for id in all.iter().filter(|id| **id != leader.id) {
		match cluster.submit(*id, set("k", "v")).await.expect("submit failed") {
			SubmitCommandResponse::NotLeader { leader_hint } => {
				assert_eq!(leader_hint, Some(leader.id), "follower {} hinted wrongly", id)
			}
			other => panic!("follower {} accepted a write: {:?}", id, other),
		}
	}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn get_commands_read_through_the_log() {
	let cluster = TestCluster::start(3, Protocol::Raft, &[]).await;
	let all: Vec<ServerId> = (1..=3).collect();

	let leader = cluster
		.wait_for_leader(&all, Duration::from_secs(2))
		.await
		.expect("no leader elected");

	cluster.submit(leader.id, set("x", "42")).await.expect("submit failed");

	let resp = cluster
		.submit(leader.id, Command::Get { key: "x".into() })
		.await
		.expect("submit failed");
	assert_eq!(resp, SubmitCommandResponse::Ok { value: Some("42".into()) });

	let resp = cluster
		.submit(leader.id, Command::Delete { key: "x".into() })
		.await
		.expect("submit failed");
	assert_eq!(resp, SubmitCommandResponse::Ok { value: None });

	assert!(cluster.read(leader.id, "x").await.is_none());
}
