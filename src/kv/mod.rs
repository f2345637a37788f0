//! The replicated state machine: ordered-map KV operations plus per-client
//! request deduplication (spec §4.3).
//!
//! The concrete ordered-map store is explicitly out of scope for this crate
//! (spec §1 "Out of scope") — `memtable::BTreeStateMachine` is a minimal
//! `BTreeMap`-backed implementation kept only so the crate runs end to end;
//! production deployments are expected to swap in their own `StateMachine`.

pub mod memtable;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One client-submitted operation, as encoded into a `LogEntry::command`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct ClientOp {
    pub client_id: String,
    pub request_id: u64,
    pub kind: OpKind,
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub enum OpKind {
    Get,
    Put,
    Append,
}

impl ClientOp {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::encode_to_vec(self, bincode::config::standard())?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (op, _) = bincode::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(op)
    }
}

/// Outcome of applying an operation to the store, independent of dedup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Get(Option<String>),
    Mutated,
    Duplicate,
}

/// The capability interface the consensus core applies committed entries
/// through (spec §9 "Interface abstractions": `IStateMachine`). Kept as an
/// explicit trait so the core can be tested against in-memory fakes.
#[async_trait]
pub trait StateMachine: Send + Sync {
    /// Apply one already-committed `ClientOp` at log `index`. Mutations are
    /// no-ops if `request_id <= dedup[client_id]`; dedup is updated
    /// unconditionally so retried `Get`s are also idempotent for dedup
    /// bookkeeping (spec §4.3).
    async fn apply(&self, index: u64, op: ClientOp) -> ApplyOutcome;

    /// Serialize store + dedup table into opaque snapshot bytes.
    async fn take_snapshot(&self) -> Vec<u8>;

    /// Restore store + dedup table from a previously produced snapshot.
    async fn install_snapshot(&self, snapshot: &[u8]) -> Result<()>;
}
