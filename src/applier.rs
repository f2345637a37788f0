//! Pulls committed log entries into the state machine and wakes any
//! client request blocked on a specific index (spec §4.2).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::kv::{ApplyOutcome, ClientOp};
use crate::raft::peer::Peer;
use crate::raft::log::LogIndex;

pub struct Applier {
    peer: Arc<Peer>,
    pending: Mutex<HashMap<LogIndex, oneshot::Sender<ApplyOutcome>>>,
}

impl Applier {
    pub fn new(peer: Arc<Peer>) -> Arc<Self> {
        Arc::new(Self {
            peer,
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// Register interest in the outcome of applying `index`, to be
    /// resolved once the Applier processes it. Used by the client-facing
    /// Get/PutAppend handlers to block for their own request's commit.
    pub fn wait_for(&self, index: LogIndex) -> oneshot::Receiver<ApplyOutcome> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(index, tx);
        rx
    }

    pub fn cancel_wait(&self, index: LogIndex) {
        self.pending.lock().remove(&index);
    }

    /// Runs for the lifetime of the process: waits for commit-index
    /// advancement, then applies every newly committed entry in order.
    ///
    /// The `Notified` future is created *before* draining, not after, so a
    /// `notify_waiters()` that fires while `drain()` is still running (e.g.
    /// the leader advances `commit_index` again mid-apply) is not missed:
    /// `Notify` captures the current notification epoch when the future is
    /// created, and resolves immediately on first poll if that epoch has
    /// since moved. Awaiting `notified()` only after `drain()` returns would
    /// let such a signal land in the gap between the two calls and be
    /// dropped, since `notify_waiters` stores no permit for a task that
    /// isn't already registered.
    pub async fn run(self: Arc<Self>) {
        loop {
            let notified = self.peer.commit_notify.notified();
            self.drain().await;
            notified.await;
        }
    }

    async fn drain(&self) {
        loop {
            let next = {
                let inner = self.peer.inner.lock();
                if inner.last_applied >= inner.commit_index {
                    return;
                }
                inner.last_applied + 1
            };

            let entry = {
                let inner = self.peer.inner.lock();
                inner.log.entry_at(next).cloned()
            };
            let Some(entry) = entry else {
                // Entry subsumed by a snapshot installed concurrently;
                // last_applied is already caught up by the snapshot path.
                return;
            };

            let outcome = match ClientOp::decode(&entry.command) {
                Ok(op) => self.peer.state_machine.apply(entry.index, op).await,
                Err(e) => {
                    tracing::error!(index = entry.index, error = %e, "failed to decode committed entry");
                    continue;
                }
            };

            {
                let mut inner = self.peer.inner.lock();
                inner.last_applied = inner.last_applied.max(entry.index);
            }

            if let Some(waiter) = self.pending.lock().remove(&entry.index) {
                let _ = waiter.send(outcome);
            }

            if let Err(e) = self.peer.maybe_snapshot().await {
                tracing::error!(error = %e, "snapshot trigger failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::memtable::BTreeStateMachine;
    use crate::kv::OpKind;
    use crate::persist::FilePersister;
    use crate::raft::rpc::{AppendEntriesArgs, AppendEntriesReply, InstallSnapshotArgs, InstallSnapshotReply, RequestVoteArgs, RequestVoteReply};
    use crate::transport::RaftTransport;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct NoopTransport;

    #[async_trait]
    impl RaftTransport for NoopTransport {
        async fn request_vote(&self, _peer: u64, _args: RequestVoteArgs) -> crate::error::Result<RequestVoteReply> {
            Err(crate::error::Error::Transport("unreachable in test".into()))
        }
        async fn append_entries(&self, _peer: u64, _args: AppendEntriesArgs) -> crate::error::Result<AppendEntriesReply> {
            Err(crate::error::Error::Transport("unreachable in test".into()))
        }
        async fn install_snapshot(
            &self,
            _peer: u64,
            _args: InstallSnapshotArgs,
        ) -> crate::error::Result<InstallSnapshotReply> {
            Err(crate::error::Error::Transport("unreachable in test".into()))
        }
    }

    async fn single_node_leader_peer() -> (Arc<Peer>, TempDir) {
        let dir = TempDir::new().unwrap();
        let persister = Arc::new(FilePersister::new(dir.path(), 1));
        let transport = Arc::new(NoopTransport);
        let state_machine = Arc::new(BTreeStateMachine::new());
        let peer = Peer::create(1, vec![], persister, transport, state_machine, 1024 * 1024)
            .await
            .unwrap();
        // A peer with no other members can always be its own majority.
        peer.inner.lock().role = crate::raft::peer::Role::Leader;
        (peer, dir)
    }

    #[tokio::test]
    async fn applies_committed_entry_and_wakes_waiter() {
        let (peer, _dir) = single_node_leader_peer().await;
        let applier = Applier::new(peer.clone());

        let op = ClientOp {
            client_id: "c1".into(),
            request_id: 1,
            kind: OpKind::Put,
            key: "a".into(),
            value: "1".into(),
        };
        let (index, _term) = peer.submit(op.encode().unwrap()).await.unwrap();
        peer.inner.lock().commit_index = index;

        let rx = applier.wait_for(index);
        peer.commit_notify.notify_waiters();
        applier.drain().await;

        let outcome = rx.await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Mutated);
    }

    /// Regression test for a lost-wakeup race in `run()`: if the `Notified`
    /// future were created *after* `drain()` instead of before it, a
    /// `commit_notify.notify_waiters()` firing in the gap between one
    /// `drain()` returning and the next `notified().await` starting would
    /// be silently dropped (`notify_waiters` stores no permit for a task
    /// that isn't registered yet), leaving the last committed entry
    /// unapplied. This submits and commits entries back-to-back, giving the
    /// background `run()` loop every opportunity to land in that gap, and
    /// asserts the final one is still applied within a short deadline.
    #[tokio::test]
    async fn run_does_not_drop_a_commit_signal_racing_with_drain() {
        let (peer, _dir) = single_node_leader_peer().await;
        let applier = Applier::new(peer.clone());
        tokio::spawn(applier.clone().run());

        let mut last_index = 0;
        let mut last_rx = None;
        for i in 1..=50u64 {
            let op = ClientOp {
                client_id: "c1".into(),
                request_id: i,
                kind: OpKind::Put,
                key: "k".into(),
                value: i.to_string(),
            };
            let (index, _term) = peer.submit(op.encode().unwrap()).await.unwrap();
            let rx = applier.wait_for(index);
            peer.inner.lock().commit_index = index;
            peer.commit_notify.notify_waiters();
            last_index = index;
            last_rx = Some(rx);
        }

        let outcome = tokio::time::timeout(std::time::Duration::from_secs(5), last_rx.unwrap())
            .await
            .expect("final commit signal was dropped; last entry never applied")
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Mutated);
        assert_eq!(peer.inner.lock().last_applied, last_index);
    }
}
