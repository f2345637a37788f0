//! Leader replication loop: periodic `AppendEntries`/`InstallSnapshot`
//! fan-out, `nextIndex`/`matchIndex` bookkeeping, and commit-index
//! advancement (spec §4.1 "Leader replication", "Commit rule").

use std::sync::Arc;

use crate::raft::peer::{Peer, Role};
use crate::raft::rpc::{AppendEntriesArgs, InstallSnapshotArgs};
use crate::raft::HEARTBEAT_INTERVAL;

/// Runs for the lifetime of the process, broadcasting heartbeats/entries
/// at `HEARTBEAT_INTERVAL` whenever this peer currently holds leadership.
/// A role check gates each tick so a demoted leader simply stops sending.
pub async fn leader_loop(peer: Arc<Peer>) {
    loop {
        tokio::time::sleep(HEARTBEAT_INTERVAL).await;
        if !peer.is_leader() {
            continue;
        }
        replicate_once(&peer).await;
        advance_commit_index(&peer);
    }
}

async fn replicate_once(peer: &Arc<Peer>) {
    let peer_ids = peer.peer_ids.clone();
    let mut handles = Vec::with_capacity(peer_ids.len());
    for id in peer_ids {
        let peer = peer.clone();
        handles.push(tokio::spawn(async move { replicate_to(&peer, id).await }));
    }
    for handle in handles {
        let _ = handle.await;
    }
}

async fn replicate_to(peer: &Arc<Peer>, follower: u64) {
    let current_term = {
        let inner = peer.inner.lock();
        if inner.role != Role::Leader {
            return;
        }
        inner.current_term
    };

    let snapshot_needed = {
        let inner = peer.inner.lock();
        let next = *inner.next_index.get(&follower).unwrap_or(&(inner.log.last_index() + 1));
        next <= inner.log.last_included_index()
    };

    if snapshot_needed {
        send_install_snapshot(peer, follower, current_term).await;
        return;
    }

    let (args, next_index_sent) = {
        let inner = peer.inner.lock();
        let next = *inner.next_index.get(&follower).unwrap_or(&(inner.log.last_index() + 1));
        let prev_log_index = next - 1;
        let Some(prev_log_term) = inner.log.term_at(prev_log_index) else {
            return;
        };
        let entries = inner.log.entries_from(next).to_vec();
        (
            AppendEntriesArgs {
                term: inner.current_term,
                leader_id: peer.id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: inner.commit_index,
            },
            next,
        )
    };

    let entries_len = args.entries.len() as u64;
    let Ok(reply) = peer.transport.append_entries(follower, args).await else {
        return;
    };

    let mut inner = peer.inner.lock();
    if inner.current_term != current_term || inner.role != Role::Leader {
        return;
    }
    if reply.term > inner.current_term {
        inner.current_term = reply.term;
        inner.voted_for = None;
        inner.role = Role::Follower;
        drop(inner);
        let _ = peer.persist().await;
        return;
    }

    if reply.success {
        let match_index = next_index_sent - 1 + entries_len;
        inner.match_index.insert(follower, match_index);
        inner.next_index.insert(follower, match_index + 1);
    } else {
        let fallback = reply.conflict_index.unwrap_or(1).max(1);
        let new_next = match reply.conflict_term {
            Some(term) => inner
                .log
                .entries_from(inner.log.last_included_index() + 1)
                .iter()
                .rev()
                .find(|e| e.term == term)
                .map(|e| e.index + 1)
                .unwrap_or(fallback),
            None => fallback,
        };
        inner.next_index.insert(follower, new_next.max(1));
    }
}

async fn send_install_snapshot(peer: &Arc<Peer>, follower: u64, current_term: u64) {
    let (term, last_included_index, last_included_term) = {
        let inner = peer.inner.lock();
        (inner.current_term, inner.log.last_included_index(), inner.log.last_included_term())
    };
    // State-machine access never happens while the peer mutex is held.
    let snapshot_bytes = peer.state_machine.take_snapshot().await;
    let args = InstallSnapshotArgs {
        term,
        leader_id: peer.id,
        last_included_index,
        last_included_term,
        data: snapshot_bytes,
    };

    let Ok(reply) = peer.transport.install_snapshot(follower, args).await else {
        return;
    };

    let mut inner = peer.inner.lock();
    if inner.current_term != current_term || inner.role != Role::Leader {
        return;
    }
    if reply.term > inner.current_term {
        inner.current_term = reply.term;
        inner.voted_for = None;
        inner.role = Role::Follower;
        return;
    }
    inner.match_index.insert(follower, last_included_index);
    inner.next_index.insert(follower, last_included_index + 1);
}

/// Advance `commit_index` to the largest `N` a majority of `matchIndex`
/// values reach, restricted to entries from the current term (spec §4.1
/// "Commit rule").
fn advance_commit_index(peer: &Arc<Peer>) {
    let mut inner = peer.inner.lock();
    if inner.role != Role::Leader {
        return;
    }

    let mut match_indices: Vec<u64> = inner.match_index.values().copied().collect();
    match_indices.push(inner.log.last_index());
    match_indices.sort_unstable_by(|a, b| b.cmp(a));

    let majority_index = match_indices.len() / 2;
    let candidate_n = match_indices.get(majority_index).copied().unwrap_or(0);

    if candidate_n > inner.commit_index && inner.log.term_at(candidate_n) == Some(inner.current_term) {
        inner.commit_index = candidate_n;
        drop(inner);
        peer.commit_notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Result};
    use crate::kv::memtable::BTreeStateMachine;
    use crate::persist::FilePersister;
    use crate::raft::log::LogEntry;
    use crate::raft::rpc::{
        AppendEntriesReply, InstallSnapshotReply, RequestVoteArgs, RequestVoteReply,
    };
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct NoopTransport;

    #[async_trait]
    impl crate::transport::RaftTransport for NoopTransport {
        async fn request_vote(&self, _peer: u64, _args: RequestVoteArgs) -> Result<RequestVoteReply> {
            Err(Error::Transport("unreachable in test".into()))
        }
        async fn append_entries(&self, _peer: u64, _args: AppendEntriesArgs) -> Result<AppendEntriesReply> {
            Err(Error::Transport("unreachable in test".into()))
        }
        async fn install_snapshot(&self, _peer: u64, _args: InstallSnapshotArgs) -> Result<InstallSnapshotReply> {
            Err(Error::Transport("unreachable in test".into()))
        }
    }

    /// A 4-node (even-sized) leader with a 5-entry log at the current term,
    /// `match_index` empty so each test fills in only the followers' view.
    async fn four_node_leader() -> (Arc<Peer>, TempDir) {
        let dir = TempDir::new().unwrap();
        let persister = Arc::new(FilePersister::new(dir.path(), 0));
        let transport = Arc::new(NoopTransport);
        let state_machine = Arc::new(BTreeStateMachine::new());
        let peer = Peer::create(0, vec![1, 2, 3], persister, transport, state_machine, 1024 * 1024)
            .await
            .unwrap();

        {
            let mut inner = peer.inner.lock();
            inner.role = Role::Leader;
            inner.current_term = 1;
            for i in 1..=5u64 {
                inner.log.append(LogEntry::new(1, i, vec![i as u8]));
            }
        }
        (peer, dir)
    }

    #[tokio::test]
    async fn commit_does_not_advance_on_a_minority_for_even_sized_cluster() {
        let (peer, _dir) = four_node_leader().await;
        {
            // Self (implicit, via last_index) plus follower 1 agree on
            // index 5; followers 2 and 3 have replicated nothing. That is
            // 2 of 4 nodes — not a majority — so commit_index must not
            // move. Counting the leader twice (the bug this guards
            // against) would make it look like 3 of 5 and wrongly commit.
            let mut inner = peer.inner.lock();
            inner.match_index.insert(1, 5);
            inner.match_index.insert(2, 0);
            inner.match_index.insert(3, 0);
        }

        advance_commit_index(&peer);
        assert_eq!(peer.inner.lock().commit_index, 0);
    }

    #[tokio::test]
    async fn commit_advances_once_a_true_majority_replicates_for_even_sized_cluster() {
        let (peer, _dir) = four_node_leader().await;
        {
            // Self + followers 1 and 2 agree on index 5: 3 of 4, a genuine
            // majority.
            let mut inner = peer.inner.lock();
            inner.match_index.insert(1, 5);
            inner.match_index.insert(2, 5);
            inner.match_index.insert(3, 0);
        }

        advance_commit_index(&peer);
        assert_eq!(peer.inner.lock().commit_index, 5);
    }
}
