//! Peer-to-peer transport: wire framing, per-peer channels, and the
//! connection pool that owns them (spec §4.5, §4.6).

pub mod channel;
pub mod framing;
pub mod pool;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::raft::rpc::{
    AppendEntriesArgs, AppendEntriesReply, InstallSnapshotArgs, InstallSnapshotReply, NodeId, RequestVoteArgs,
    RequestVoteReply,
};

/// The capability interface the consensus core sends RPCs through (spec §9
/// "Interface abstractions": `IRaftRpcChannel`). Kept as a trait so
/// election and replication logic can be tested against in-memory fakes
/// instead of real sockets.
#[async_trait]
pub trait RaftTransport: Send + Sync {
    async fn request_vote(&self, peer: NodeId, args: RequestVoteArgs) -> Result<RequestVoteReply>;
    async fn append_entries(&self, peer: NodeId, args: AppendEntriesArgs) -> Result<AppendEntriesReply>;
    async fn install_snapshot(&self, peer: NodeId, args: InstallSnapshotArgs) -> Result<InstallSnapshotReply>;
}

/// `RaftTransport` backed by a pooled TCP channel per peer.
pub struct TcpRaftTransport {
    pool: Arc<pool::ConnectionPool>,
    peer_addrs: std::collections::HashMap<NodeId, SocketAddr>,
}

impl TcpRaftTransport {
    pub fn new(pool: Arc<pool::ConnectionPool>, peer_addrs: std::collections::HashMap<NodeId, SocketAddr>) -> Self {
        Self { pool, peer_addrs }
    }

    async fn call<Args, Reply>(&self, peer: NodeId, method: &str, args: &Args) -> Result<Reply>
    where
        Args: serde::Serialize + bincode::Encode,
        Reply: for<'de> serde::Deserialize<'de> + bincode::Decode<()>,
    {
        let addr = *self
            .peer_addrs
            .get(&peer)
            .ok_or_else(|| crate::error::Error::Transport(format!("no address for peer {peer}")))?;
        let channel = self.pool.get(peer, addr);
        let encoded = bincode::encode_to_vec(args, bincode::config::standard())?;
        let reply_bytes = channel.call("Raft", method, &encoded).await;
        self.pool.put(addr, channel);
        let reply_bytes = reply_bytes?;
        let (reply, _) = bincode::decode_from_slice(&reply_bytes, bincode::config::standard())?;
        Ok(reply)
    }
}

#[async_trait]
impl RaftTransport for TcpRaftTransport {
    async fn request_vote(&self, peer: NodeId, args: RequestVoteArgs) -> Result<RequestVoteReply> {
        self.call(peer, "RequestVote", &args).await
    }

    async fn append_entries(&self, peer: NodeId, args: AppendEntriesArgs) -> Result<AppendEntriesReply> {
        self.call(peer, "AppendEntries", &args).await
    }

    async fn install_snapshot(&self, peer: NodeId, args: InstallSnapshotArgs) -> Result<InstallSnapshotReply> {
        self.call(peer, "InstallSnapshot", &args).await
    }
}
