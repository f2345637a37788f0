//! Client-side router (spec §4.7 "Clerk"): sticky leader selection with
//! failover across peers, backed by per-client request deduplication so
//! retries after ambiguous failures are safe.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use uuid::Uuid;

use crate::error::Result;
use crate::raft::rpc::{ClientErr, GetArgs, GetReply, KvOp, NodeId, PutAppendArgs, PutAppendReply};
use crate::transport::channel::Channel;
use crate::transport::pool::ConnectionPool;

/// The capability interface picking which peer to try next (spec §9
/// "Interface abstractions": `ILoadBalancer`). A sticky-leader-then-rotate
/// policy is the only implementation needed here, grounded in the
/// original's `RoundRobinLoadBalancer`.
pub trait LoadBalancer: Send + Sync {
    /// Index into the peer list to try next.
    fn select(&self) -> usize;
    /// Called after a successful reply from `index`, to make it sticky.
    fn mark_success(&self, index: usize);
    /// Called after a failed/`WrongLeader` reply from `index`, to rotate
    /// away from it.
    fn mark_failure(&self, index: usize);
}

/// Stays on the last-known leader; on failure, rotates round-robin to the
/// next peer.
pub struct StickyLoadBalancer {
    current: AtomicUsize,
    peer_count: usize,
}

impl StickyLoadBalancer {
    pub fn new(peer_count: usize) -> Self {
        Self {
            current: AtomicUsize::new(0),
            peer_count,
        }
    }
}

impl LoadBalancer for StickyLoadBalancer {
    fn select(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    fn mark_success(&self, index: usize) {
        self.current.store(index, Ordering::Release);
    }

    fn mark_failure(&self, index: usize) {
        let next = (index + 1) % self.peer_count.max(1);
        self.current.store(next, Ordering::Release);
    }
}

/// One client's view of the cluster: a stable random `clientId`, a
/// monotonically increasing `requestId`, and the sticky-leader routing
/// policy (spec §4.7).
pub struct Clerk {
    client_id: String,
    next_request_id: AtomicU64,
    peers: Vec<(NodeId, SocketAddr)>,
    pool: std::sync::Arc<ConnectionPool>,
    balancer: Box<dyn LoadBalancer>,
}

impl Clerk {
    pub fn new(peers: Vec<(NodeId, SocketAddr)>, pool: std::sync::Arc<ConnectionPool>) -> Self {
        let balancer = Box::new(StickyLoadBalancer::new(peers.len()));
        Self {
            client_id: Uuid::new_v4().to_string(),
            next_request_id: AtomicU64::new(1),
            peers,
            pool,
            balancer,
        }
    }

    fn allocate_request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    fn channel_at(&self, index: usize) -> std::sync::Arc<Channel> {
        let (node_id, addr) = self.peers[index];
        self.pool.get(node_id, addr)
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let request_id = self.allocate_request_id();
        let args = GetArgs {
            client_id: self.client_id.clone(),
            request_id,
            key: key.to_string(),
        };

        loop {
            let index = self.balancer.select();
            let channel = self.channel_at(index);
            let encoded = bincode::encode_to_vec(&args, bincode::config::standard())?;
            let addr = self.peers[index].1;

            let outcome = channel.call("Kv", "Get", &encoded).await;
            self.pool.put(addr, channel);

            match outcome {
                Ok(bytes) => {
                    let (reply, _): (GetReply, usize) = bincode::decode_from_slice(&bytes, bincode::config::standard())?;
                    match reply.err {
                        ClientErr::Ok => {
                            self.balancer.mark_success(index);
                            return Ok(Some(reply.value));
                        }
                        ClientErr::NoKey => {
                            self.balancer.mark_success(index);
                            return Ok(None);
                        }
                        ClientErr::WrongLeader => {
                            self.balancer.mark_failure(index);
                        }
                    }
                }
                Err(_) => {
                    self.balancer.mark_failure(index);
                }
            }
        }
    }

    pub async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.put_append(key, value, KvOp::Put).await
    }

    pub async fn append(&self, key: &str, value: &str) -> Result<()> {
        self.put_append(key, value, KvOp::Append).await
    }

    async fn put_append(&self, key: &str, value: &str, op: KvOp) -> Result<()> {
        let request_id = self.allocate_request_id();
        let args = PutAppendArgs {
            client_id: self.client_id.clone(),
            request_id,
            op,
            key: key.to_string(),
            value: value.to_string(),
        };

        loop {
            let index = self.balancer.select();
            let channel = self.channel_at(index);
            let encoded = bincode::encode_to_vec(&args, bincode::config::standard())?;
            let addr = self.peers[index].1;

            let outcome = channel.call("Kv", "PutAppend", &encoded).await;
            self.pool.put(addr, channel);

            match outcome {
                Ok(bytes) => {
                    let (reply, _): (PutAppendReply, usize) =
                        bincode::decode_from_slice(&bytes, bincode::config::standard())?;
                    match reply.err {
                        ClientErr::Ok | ClientErr::NoKey => {
                            self.balancer.mark_success(index);
                            return Ok(());
                        }
                        ClientErr::WrongLeader => {
                            self.balancer.mark_failure(index);
                        }
                    }
                }
                Err(_) => {
                    self.balancer.mark_failure(index);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sticky_balancer_stays_on_success() {
        let lb = StickyLoadBalancer::new(3);
        lb.mark_success(2);
        assert_eq!(lb.select(), 2);
    }

    #[test]
    fn sticky_balancer_rotates_on_failure() {
        let lb = StickyLoadBalancer::new(3);
        lb.mark_failure(0);
        assert_eq!(lb.select(), 1);
        lb.mark_failure(1);
        assert_eq!(lb.select(), 2);
        lb.mark_failure(2);
        assert_eq!(lb.select(), 0);
    }
}
