//! `Peer`: one consensus participant. Owns the role state machine,
//! persistent and volatile state, and the RPC handlers that drive them
//! (spec §4.1).
//!
//! Locking discipline (spec §5): all of role/term/votedFor/log/indices
//! live behind one `parking_lot::Mutex`. Nothing that suspends (I/O,
//! `.await` on a channel call) happens while that lock is held — the
//! handlers snapshot what they need, drop the lock, do I/O, and where the
//! result still matters, reacquire and re-check term/role before applying
//! it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::kv::StateMachine;
use crate::persist::Persister;
use crate::raft::log::{LogEntry, LogIndex, RaftLog, Term};
use crate::raft::rpc::{
    AppendEntriesArgs, AppendEntriesReply, InstallSnapshotArgs, InstallSnapshotReply, NodeId, RequestVoteArgs,
    RequestVoteReply,
};
use crate::transport::RaftTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

#[derive(Serialize, Deserialize, bincode::Encode, bincode::Decode)]
struct PersistentState {
    current_term: Term,
    voted_for: Option<NodeId>,
    log: RaftLog,
}

pub(crate) struct Inner {
    pub role: Role,
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    pub log: RaftLog,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub next_index: HashMap<NodeId, LogIndex>,
    pub match_index: HashMap<NodeId, LogIndex>,
    pub leader_id: Option<NodeId>,
}

pub struct Peer {
    pub id: NodeId,
    pub peer_ids: Vec<NodeId>,
    pub(crate) inner: Mutex<Inner>,
    pub(crate) persister: Arc<dyn Persister>,
    pub(crate) transport: Arc<dyn RaftTransport>,
    pub(crate) state_machine: Arc<dyn StateMachine>,
    pub(crate) max_raftstate_size: usize,
    pub commit_notify: Notify,
    pub role_notify: Notify,
    election_deadline: Mutex<Instant>,
}

impl Peer {
    /// Construct a peer and restore persisted state, if any (spec §3
    /// "Lifecycle"). Absent files yield the empty initial state.
    pub async fn create(
        id: NodeId,
        peer_ids: Vec<NodeId>,
        persister: Arc<dyn Persister>,
        transport: Arc<dyn RaftTransport>,
        state_machine: Arc<dyn StateMachine>,
        max_raftstate_size: usize,
    ) -> Result<Arc<Self>> {
        let raw_state = persister.read_raft_state().await?;
        let (current_term, voted_for, log) = if raw_state.is_empty() {
            (0, None, RaftLog::new())
        } else {
            let (state, _): (PersistentState, usize) =
                bincode::decode_from_slice(&raw_state, bincode::config::standard())?;
            (state.current_term, state.voted_for, state.log)
        };

        let snapshot = persister.read_snapshot().await?;
        let (commit_index, last_applied) = (log.last_included_index(), log.last_included_index());
        if !snapshot.is_empty() {
            state_machine.install_snapshot(&snapshot).await?;
        }

        let peer = Arc::new(Self {
            id,
            peer_ids,
            inner: Mutex::new(Inner {
                role: Role::Follower,
                current_term,
                voted_for,
                log,
                commit_index,
                last_applied,
                next_index: HashMap::new(),
                match_index: HashMap::new(),
                leader_id: None,
            }),
            persister,
            transport,
            state_machine,
            max_raftstate_size,
            commit_notify: Notify::new(),
            role_notify: Notify::new(),
            election_deadline: Mutex::new(Instant::now()),
        });
        peer.reset_election_timer(super::election::random_election_timeout());
        Ok(peer)
    }

    pub fn is_leader(&self) -> bool {
        self.inner.lock().role == Role::Leader
    }

    pub fn current_term(&self) -> Term {
        self.inner.lock().current_term
    }

    pub fn leader_hint(&self) -> Option<NodeId> {
        self.inner.lock().leader_id
    }

    pub(crate) fn reset_election_timer(&self, timeout: std::time::Duration) {
        *self.election_deadline.lock() = Instant::now() + timeout;
    }

    pub(crate) fn election_timer_expired(&self) -> bool {
        Instant::now() >= *self.election_deadline.lock()
    }

    /// Leader-only: append `command` to the local log and return its
    /// `(index, term)`. Returns `Error::WrongLeader` otherwise.
    pub async fn submit(&self, command: Vec<u8>) -> Result<(LogIndex, Term)> {
        let (index, term, bytes) = {
            let mut inner = self.inner.lock();
            if inner.role != Role::Leader {
                return Err(Error::WrongLeader);
            }
            let index = inner.log.last_index() + 1;
            let term = inner.current_term;
            inner.log.append(LogEntry::new(term, index, command));
            (index, term, self.encode_persistent_state(&inner))
        };
        self.persister.save_raft_state(bytes).await?;
        Ok((index, term))
    }

    pub(crate) fn encode_persistent_state(&self, inner: &Inner) -> Vec<u8> {
        let state = PersistentState {
            current_term: inner.current_term,
            voted_for: inner.voted_for,
            log: inner.log.clone(),
        };
        bincode::encode_to_vec(&state, bincode::config::standard()).expect("persistent state always encodes")
    }

    pub(crate) async fn persist(&self) -> Result<()> {
        let bytes = {
            let inner = self.inner.lock();
            self.encode_persistent_state(&inner)
        };
        self.persister.save_raft_state(bytes).await
    }

    pub async fn handle_request_vote(&self, args: RequestVoteArgs) -> RequestVoteReply {
        let mut needs_persist = false;
        let (term, grant) = {
            let mut inner = self.inner.lock();
            if args.term < inner.current_term {
                return RequestVoteReply {
                    term: inner.current_term,
                    vote_granted: false,
                };
            }
            if args.term > inner.current_term {
                inner.current_term = args.term;
                inner.voted_for = None;
                inner.role = Role::Follower;
                needs_persist = true;
            }

            let my_last_term = inner.log.last_term();
            let my_last_index = inner.log.last_index();
            let log_ok = (args.last_log_term, args.last_log_index) >= (my_last_term, my_last_index);
            let can_vote = match inner.voted_for {
                None => true,
                Some(candidate) => candidate == args.candidate_id,
            };
            let grant = log_ok && can_vote;

            if grant {
                inner.voted_for = Some(args.candidate_id);
                needs_persist = true;
            }
            (inner.current_term, grant)
        };

        if needs_persist {
            let _ = self.persist().await;
        }
        if grant {
            self.reset_election_timer(super::election::random_election_timeout());
        }
        RequestVoteReply {
            term,
            vote_granted: grant,
        }
    }

    pub async fn handle_append_entries(&self, args: AppendEntriesArgs) -> AppendEntriesReply {
        let mut needs_persist = false;
        let mut commit_advanced = false;

        let result = {
            let mut inner = self.inner.lock();
            if args.term < inner.current_term {
                return AppendEntriesReply {
                    term: inner.current_term,
                    success: false,
                    conflict_term: None,
                    conflict_index: None,
                };
            }

            if args.term > inner.current_term {
                inner.current_term = args.term;
                inner.voted_for = None;
                needs_persist = true;
            }
            inner.role = Role::Follower;
            inner.leader_id = Some(args.leader_id);

            if inner.log.term_at(args.prev_log_index) != Some(args.prev_log_term) {
                let (conflict_term, conflict_index) = inner.log.conflict_hint(args.prev_log_index);
                let term = inner.current_term;
                Err((term, conflict_term, conflict_index))
            } else {
                if !args.entries.is_empty() {
                    inner.log.append_entries(args.prev_log_index, &args.entries);
                    needs_persist = true;
                }
                let last_new_index = args.prev_log_index + args.entries.len() as u64;
                if args.leader_commit > inner.commit_index {
                    inner.commit_index = args.leader_commit.min(last_new_index);
                    commit_advanced = true;
                }
                Ok(inner.current_term)
            }
        };

        if needs_persist {
            let _ = self.persist().await;
        }
        self.reset_election_timer(super::election::random_election_timeout());
        if commit_advanced {
            self.commit_notify.notify_waiters();
        }

        match result {
            Ok(term) => AppendEntriesReply {
                term,
                success: true,
                conflict_term: None,
                conflict_index: None,
            },
            Err((term, conflict_term, conflict_index)) => AppendEntriesReply {
                term,
                success: false,
                conflict_term,
                conflict_index: Some(conflict_index),
            },
        }
    }

    pub async fn handle_install_snapshot(&self, args: InstallSnapshotArgs) -> InstallSnapshotReply {
        {
            let inner = self.inner.lock();
            if args.term < inner.current_term {
                return InstallSnapshotReply {
                    term: inner.current_term,
                };
            }
        }

        if let Err(e) = self.state_machine.install_snapshot(&args.data).await {
            tracing::error!(error = %e, "failed to install snapshot into state machine");
        }

        let (term, raft_bytes) = {
            let mut inner = self.inner.lock();
            if args.term > inner.current_term {
                inner.current_term = args.term;
                inner.voted_for = None;
            }
            inner.role = Role::Follower;
            inner.leader_id = Some(args.leader_id);
            inner.log.install_snapshot(args.last_included_index, args.last_included_term);
            inner.commit_index = inner.commit_index.max(args.last_included_index);
            inner.last_applied = inner.last_applied.max(args.last_included_index);
            self.reset_election_timer(super::election::random_election_timeout());
            (inner.current_term, self.encode_persistent_state(&inner))
        };

        if let Err(e) = self.persister.save(raft_bytes, args.data).await {
            tracing::error!(error = %e, "failed to persist installed snapshot");
        }

        InstallSnapshotReply { term }
    }

    /// Triggered by the Applier after applying entries (spec §4.1
    /// "Snapshot trigger"): if persisted raftstate has grown past
    /// `max_raftstate_size`, compact the log through `lastApplied`.
    pub async fn maybe_snapshot(&self) -> Result<()> {
        let size = self.persister.raft_state_size().await?;
        if (size as usize) < self.max_raftstate_size {
            return Ok(());
        }

        let snapshot_bytes = self.state_machine.take_snapshot().await;
        let raft_bytes = {
            let mut inner = self.inner.lock();
            let through = inner.last_applied;
            inner.log.compact(through);
            self.encode_persistent_state(&inner)
        };
        self.persister.save(raft_bytes, snapshot_bytes).await
    }
}
