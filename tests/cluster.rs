//! End-to-end cluster scenarios (spec §8 "End-to-end scenarios"), run
//! against real `Peer`/`Applier`/`Persister`/`StateMachine` instances wired
//! together over an in-process fake `RaftTransport` instead of real
//! sockets — the transport-level health FSM and framing are covered
//! separately in `transport::channel`/`transport::framing`'s own unit
//! tests, so this suite exercises consensus, replication, and dedup.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tempfile::TempDir;
use tokio::time::timeout;

use kvraft::error::{Error, Result};
use kvraft::kv::memtable::BTreeStateMachine;
use kvraft::kv::{ApplyOutcome, ClientOp, OpKind};
use kvraft::persist::FilePersister;
use kvraft::raft::peer::Peer;
use kvraft::raft::rpc::{
    AppendEntriesArgs, AppendEntriesReply, InstallSnapshotArgs, InstallSnapshotReply, NodeId, RequestVoteArgs,
    RequestVoteReply,
};
use kvraft::raft::{election, replication};
use kvraft::transport::RaftTransport;
use kvraft::applier::Applier;

/// Routes RPCs directly to the target `Peer`'s handler instead of over a
/// socket. `faulty` simulates a killed process or network partition: any
/// call addressed to a faulty node fails as a transport error, matching
/// what a real dropped TCP connection would do.
struct FakeTransport {
    peers: RwLock<HashMap<NodeId, Arc<Peer>>>,
    faulty: RwLock<HashSet<NodeId>>,
}

impl FakeTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            peers: RwLock::new(HashMap::new()),
            faulty: RwLock::new(HashSet::new()),
        })
    }

    fn register(&self, id: NodeId, peer: Arc<Peer>) {
        self.peers.write().insert(id, peer);
    }

    fn set_faulty(&self, id: NodeId, faulty: bool) {
        if faulty {
            self.faulty.write().insert(id);
        } else {
            self.faulty.write().remove(&id);
        }
    }

    fn target(&self, id: NodeId) -> Result<Arc<Peer>> {
        if self.faulty.read().contains(&id) {
            return Err(Error::Transport(format!("node {id} is unreachable")));
        }
        self.peers
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::Transport(format!("no such node {id}")))
    }
}

#[async_trait]
impl RaftTransport for FakeTransport {
    async fn request_vote(&self, peer: NodeId, args: RequestVoteArgs) -> Result<RequestVoteReply> {
        Ok(self.target(peer)?.handle_request_vote(args).await)
    }

    async fn append_entries(&self, peer: NodeId, args: AppendEntriesArgs) -> Result<AppendEntriesReply> {
        Ok(self.target(peer)?.handle_append_entries(args).await)
    }

    async fn install_snapshot(&self, peer: NodeId, args: InstallSnapshotArgs) -> Result<InstallSnapshotReply> {
        Ok(self.target(peer)?.handle_install_snapshot(args).await)
    }
}

struct Node {
    id: NodeId,
    peer: Arc<Peer>,
    applier: Arc<Applier>,
    store: Arc<BTreeStateMachine>,
    _dir: TempDir,
}

/// Builds an `n`-node cluster sharing one `FakeTransport`, with each
/// node's consensus/replication/apply background loops already spawned.
async fn spawn_cluster(n: u64, max_raftstate_size: usize) -> (Arc<FakeTransport>, Vec<Node>) {
    let transport = FakeTransport::new();
    let mut nodes = Vec::with_capacity(n as usize);

    for id in 0..n {
        let dir = TempDir::new().unwrap();
        let persister = Arc::new(FilePersister::new(dir.path(), id));
        let store = Arc::new(BTreeStateMachine::new());
        let peer_ids: Vec<NodeId> = (0..n).filter(|&x| x != id).collect();

        let peer = Peer::create(
            id,
            peer_ids,
            persister,
            transport.clone(),
            store.clone(),
            max_raftstate_size,
        )
        .await
        .unwrap();
        transport.register(id, peer.clone());

        let applier = Applier::new(peer.clone());
        tokio::spawn(applier.clone().run());
        tokio::spawn(election::election_loop(peer.clone()));
        tokio::spawn(replication::leader_loop(peer.clone()));

        nodes.push(Node {
            id,
            peer,
            applier,
            store,
            _dir: dir,
        });
    }

    (transport, nodes)
}

/// Polls for a settled leader, as a real client would discover one by
/// trial and error against `WrongLeader` replies.
async fn await_leader(nodes: &[Node]) -> usize {
    timeout(Duration::from_secs(5), async {
        loop {
            for (i, node) in nodes.iter().enumerate() {
                if node.peer.is_leader() {
                    return i;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("cluster failed to elect a leader in time")
}

async fn submit_and_wait(node: &Node, op: ClientOp) -> Result<ApplyOutcome> {
    let (index, _term) = node.peer.submit(op.encode().unwrap()).await?;
    let rx = node.applier.wait_for(index);
    timeout(Duration::from_secs(5), rx)
        .await
        .map_err(|_| Error::Timeout("apply wait timed out".into()))?
        .map_err(|_| Error::Internal("applier dropped waiter".into()))
}

fn op(client: &str, req: u64, kind: OpKind, key: &str, value: &str) -> ClientOp {
    ClientOp {
        client_id: client.to_string(),
        request_id: req,
        kind,
        key: key.to_string(),
        value: value.to_string(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_node_cluster_elects_exactly_one_leader() {
    let (_transport, nodes) = spawn_cluster(3, 1024 * 1024).await;
    let leader_idx = await_leader(&nodes).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    let leader_count = nodes.iter().filter(|n| n.peer.is_leader()).count();
    assert_eq!(leader_count, 1);
    assert!(nodes[leader_idx].peer.is_leader());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_leader_write_and_read() {
    let (_transport, nodes) = spawn_cluster(3, 1024 * 1024).await;
    let leader_idx = await_leader(&nodes).await;
    let leader = &nodes[leader_idx];

    submit_and_wait(leader, op("c1", 1, OpKind::Put, "a", "1")).await.unwrap();
    let outcome = submit_and_wait(leader, op("c1", 2, OpKind::Get, "a", "")).await.unwrap();
    assert_eq!(outcome, ApplyOutcome::Get(Some("1".to_string())));

    // A non-leader rejects client submissions outright.
    let follower_idx = (0..nodes.len()).find(|&i| i != leader_idx).unwrap();
    let err = nodes[follower_idx].peer.submit(vec![]).await.unwrap_err();
    assert!(matches!(err, Error::WrongLeader));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn writes_replicate_to_every_follower() {
    let (_transport, nodes) = spawn_cluster(3, 1024 * 1024).await;
    let leader_idx = await_leader(&nodes).await;

    submit_and_wait(&nodes[leader_idx], op("c1", 1, OpKind::Put, "k", "v")).await.unwrap();

    timeout(Duration::from_secs(5), async {
        loop {
            if nodes.iter().all(|n| n.store.get("k").as_deref() == Some("v")) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("not all followers converged on the leader's write");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn append_concatenates_in_submission_order() {
    let (_transport, nodes) = spawn_cluster(3, 1024 * 1024).await;
    let leader_idx = await_leader(&nodes).await;
    let leader = &nodes[leader_idx];

    submit_and_wait(leader, op("c1", 1, OpKind::Append, "k", "a")).await.unwrap();
    submit_and_wait(leader, op("c1", 2, OpKind::Append, "k", "b")).await.unwrap();
    submit_and_wait(leader, op("c1", 3, OpKind::Append, "k", "c")).await.unwrap();

    let outcome = submit_and_wait(leader, op("c1", 4, OpKind::Get, "k", "")).await.unwrap();
    assert_eq!(outcome, ApplyOutcome::Get(Some("abc".to_string())));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_request_id_is_a_no_op() {
    let (_transport, nodes) = spawn_cluster(3, 1024 * 1024).await;
    let leader_idx = await_leader(&nodes).await;
    let leader = &nodes[leader_idx];

    let first = submit_and_wait(leader, op("c1", 5, OpKind::Put, "x", "1")).await.unwrap();
    assert_eq!(first, ApplyOutcome::Mutated);

    // Client retries the same requestId after an ambiguous failure.
    let retry = submit_and_wait(leader, op("c1", 5, OpKind::Put, "x", "2")).await.unwrap();
    assert_eq!(retry, ApplyOutcome::Duplicate);

    let value = submit_and_wait(leader, op("c1", 6, OpKind::Get, "x", "")).await.unwrap();
    assert_eq!(value, ApplyOutcome::Get(Some("1".to_string())));

    // A fresh requestId commits normally.
    submit_and_wait(leader, op("c1", 7, OpKind::Put, "x", "2")).await.unwrap();
    let value = submit_and_wait(leader, op("c1", 8, OpKind::Get, "x", "")).await.unwrap();
    assert_eq!(value, ApplyOutcome::Get(Some("2".to_string())));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn partitioned_follower_catches_up_after_heal() {
    let (transport, nodes) = spawn_cluster(3, 1024 * 1024).await;
    let leader_idx = await_leader(&nodes).await;
    let leader = &nodes[leader_idx];
    let victim = (0..nodes.len()).find(|&i| i != leader_idx).unwrap() as NodeId;

    transport.set_faulty(victim, true);

    submit_and_wait(leader, op("c1", 1, OpKind::Put, "p", "1")).await.unwrap();
    submit_and_wait(leader, op("c1", 2, OpKind::Put, "p", "2")).await.unwrap();

    // The partitioned node never saw either write.
    assert_eq!(nodes[victim as usize].store.get("p"), None);

    transport.set_faulty(victim, false);

    timeout(Duration::from_secs(5), async {
        loop {
            if nodes[victim as usize].store.get("p").as_deref() == Some("2") {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("partitioned node failed to catch up after the partition healed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn snapshot_catch_up_after_long_partition() {
    // A tiny threshold forces `maybe_snapshot` to compact the log on
    // almost every applied entry, so the healed follower must receive the
    // missing prefix via `InstallSnapshot` rather than replayed log
    // entries (spec §8 scenario 3).
    let (transport, nodes) = spawn_cluster(3, 64).await;
    let leader_idx = await_leader(&nodes).await;
    let leader = &nodes[leader_idx];
    let victim = (0..nodes.len()).find(|&i| i != leader_idx).unwrap() as NodeId;

    transport.set_faulty(victim, true);

    for i in 0..20u64 {
        submit_and_wait(leader, op("c1", i + 1, OpKind::Put, "snap", &i.to_string()))
            .await
            .unwrap();
    }

    transport.set_faulty(victim, false);

    timeout(Duration::from_secs(10), async {
        loop {
            if nodes[victim as usize].store.get("snap").as_deref() == Some("19") {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("partitioned node failed to catch up via snapshot installation");
}
