//! Wire messages for the three consensus RPCs and the two client RPCs
//! (spec §6 "External interfaces").

use serde::{Deserialize, Serialize};

use crate::raft::log::{LogEntry, LogIndex, Term};

pub type NodeId = u64;

#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct RequestVoteArgs {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct RequestVoteReply {
    pub term: Term,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct AppendEntriesArgs {
    pub term: Term,
    pub leader_id: NodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct AppendEntriesReply {
    pub term: Term,
    pub success: bool,
    /// Fast-backoff conflict hint (spec §4.1 step 3). `None` when `success`.
    pub conflict_term: Option<Term>,
    pub conflict_index: Option<LogIndex>,
}

#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct InstallSnapshotArgs {
    pub term: Term,
    pub leader_id: NodeId,
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct InstallSnapshotReply {
    pub term: Term,
}

/// Application-level ping used for idle-channel heartbeats (spec §9
/// "Ambiguity"): a real round trip over the same framing as every other
/// RPC, rather than a zero-length `send()` that never exercises the
/// connection.
#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct PingArgs {
    pub from: NodeId,
}

#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct PingReply {
    pub from: NodeId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub enum ClientErr {
    Ok,
    NoKey,
    WrongLeader,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub enum KvOp {
    Put,
    Append,
}

#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct GetArgs {
    pub client_id: String,
    pub request_id: u64,
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct GetReply {
    pub err: ClientErr,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct PutAppendArgs {
    pub client_id: String,
    pub request_id: u64,
    pub op: KvOp,
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct PutAppendReply {
    pub err: ClientErr,
}
