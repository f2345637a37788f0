//! Minimal `BTreeMap`-backed `StateMachine`. Not the spec's concern (spec §1
//! treats the concrete ordered-map store as an external collaborator) —
//! kept only so the crate is runnable end to end without a real storage
//! engine plugged in.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::kv::{ApplyOutcome, ClientOp, OpKind, StateMachine};

#[derive(Default, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
struct Snapshot {
    store: BTreeMap<String, String>,
    dedup: HashMap<String, u64>,
}

pub struct BTreeStateMachine {
    inner: RwLock<Snapshot>,
}

impl BTreeStateMachine {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Snapshot::default()),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.read().store.get(key).cloned()
    }
}

impl Default for BTreeStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateMachine for BTreeStateMachine {
    async fn apply(&self, _index: u64, op: ClientOp) -> ApplyOutcome {
        let mut guard = self.inner.write();

        let last = guard.dedup.get(&op.client_id).copied().unwrap_or(0);
        let duplicate = op.request_id <= last;

        let outcome = if matches!(op.kind, OpKind::Get) {
            ApplyOutcome::Get(guard.store.get(&op.key).cloned())
        } else if duplicate {
            ApplyOutcome::Duplicate
        } else {
            match op.kind {
                OpKind::Put => {
                    guard.store.insert(op.key.clone(), op.value.clone());
                }
                OpKind::Append => {
                    guard
                        .store
                        .entry(op.key.clone())
                        .and_modify(|v| v.push_str(&op.value))
                        .or_insert_with(|| op.value.clone());
                }
                OpKind::Get => unreachable!(),
            }
            ApplyOutcome::Mutated
        };

        if op.request_id > last {
            guard.dedup.insert(op.client_id.clone(), op.request_id);
        }

        outcome
    }

    async fn take_snapshot(&self) -> Vec<u8> {
        let guard = self.inner.read();
        bincode::encode_to_vec(&*guard, bincode::config::standard())
            .expect("in-memory snapshot encoding cannot fail")
    }

    async fn install_snapshot(&self, snapshot: &[u8]) -> Result<()> {
        let (restored, _): (Snapshot, _) =
            bincode::decode_from_slice(snapshot, bincode::config::standard())?;
        *self.inner.write() = restored;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(client: &str, req: u64, kind: OpKind, key: &str, value: &str) -> ClientOp {
        ClientOp {
            client_id: client.to_string(),
            request_id: req,
            kind,
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    #[tokio::test]
    async fn put_then_get() {
        let sm = BTreeStateMachine::new();
        sm.apply(1, op("c1", 1, OpKind::Put, "a", "1")).await;
        assert_eq!(sm.get("a"), Some("1".to_string()));
    }

    #[tokio::test]
    async fn append_concatenates() {
        let sm = BTreeStateMachine::new();
        sm.apply(1, op("c1", 1, OpKind::Append, "k", "a")).await;
        sm.apply(2, op("c1", 2, OpKind::Append, "k", "b")).await;
        sm.apply(3, op("c1", 3, OpKind::Append, "k", "c")).await;
        assert_eq!(sm.get("k"), Some("abc".to_string()));
    }

    #[tokio::test]
    async fn dedup_makes_retry_a_no_op() {
        let sm = BTreeStateMachine::new();
        sm.apply(1, op("c1", 5, OpKind::Put, "x", "1")).await;
        let outcome = sm.apply(2, op("c1", 5, OpKind::Put, "x", "2")).await;
        assert_eq!(outcome, ApplyOutcome::Duplicate);
        assert_eq!(sm.get("x"), Some("1".to_string()));

        sm.apply(3, op("c1", 6, OpKind::Put, "x", "2")).await;
        assert_eq!(sm.get("x"), Some("2".to_string()));
    }

    #[tokio::test]
    async fn snapshot_round_trip() {
        let sm = BTreeStateMachine::new();
        sm.apply(1, op("c1", 1, OpKind::Put, "a", "1")).await;
        sm.apply(2, op("c1", 2, OpKind::Append, "a", "2")).await;

        let snap = sm.take_snapshot().await;

        let restored = BTreeStateMachine::new();
        restored.install_snapshot(&snap).await.unwrap();
        assert_eq!(restored.get("a"), sm.get("a"));

        // A stale retry after restore is still deduped.
        let outcome = restored.apply(3, op("c1", 2, OpKind::Put, "a", "zzz")).await;
        assert_eq!(outcome, ApplyOutcome::Duplicate);
    }
}
