//! Election timer and `RequestVote` issuance (spec §4.1 "Role FSM").

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::raft::peer::{Peer, Role};
use crate::raft::rpc::RequestVoteArgs;
use crate::raft::{ELECTION_TIMEOUT_MAX, ELECTION_TIMEOUT_MIN};

pub fn random_election_timeout() -> Duration {
    let min = ELECTION_TIMEOUT_MIN.as_millis() as u64;
    let max = ELECTION_TIMEOUT_MAX.as_millis() as u64;
    let millis = rand::rng().random_range(min..=max);
    Duration::from_millis(millis)
}

/// Polls the election deadline and starts a new election whenever it
/// expires and the peer is not already a settled leader.
pub async fn election_loop(peer: Arc<Peer>) {
    loop {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if peer.is_leader() {
            continue;
        }
        if peer.election_timer_expired() {
            start_election(&peer).await;
        }
    }
}

async fn start_election(peer: &Arc<Peer>) {
    let (term, candidate_id, last_log_index, last_log_term, peer_ids) = {
        let mut inner = peer.inner.lock();
        inner.role = Role::Candidate;
        inner.current_term += 1;
        inner.voted_for = Some(peer.id);
        (
            inner.current_term,
            peer.id,
            inner.log.last_index(),
            inner.log.last_term(),
            peer.peer_ids.clone(),
        )
    };
    peer.reset_election_timer(random_election_timeout());

    let bytes = {
        let inner = peer.inner.lock();
        peer.encode_persistent_state(&inner)
    };
    if let Err(e) = peer.persister.save_raft_state(bytes).await {
        tracing::error!(error = %e, "failed to persist vote-for-self before requesting votes");
        return;
    }

    let args = RequestVoteArgs {
        term,
        candidate_id,
        last_log_index,
        last_log_term,
    };

    let mut votes: Vec<tokio::task::JoinHandle<Option<crate::raft::rpc::RequestVoteReply>>> = Vec::new();
    for &id in &peer_ids {
        let peer = peer.clone();
        let args = args.clone();
        votes.push(tokio::spawn(async move { peer.transport.request_vote(id, args).await.ok() }));
    }

    let mut granted = 1usize; // vote for self
    let majority = (peer_ids.len() + 1) / 2 + 1;

    for handle in votes {
        let Ok(Some(reply)) = handle.await else {
            continue;
        };

        let mut inner = peer.inner.lock();
        if reply.term > inner.current_term {
            inner.current_term = reply.term;
            inner.voted_for = None;
            inner.role = Role::Follower;
            drop(inner);
            let _ = peer.persist().await;
            return;
        }
        if inner.current_term != term || inner.role != Role::Candidate {
            // Stale response from an election we've since moved past.
            continue;
        }
        drop(inner);

        if reply.vote_granted {
            granted += 1;
        }
    }

    let mut inner = peer.inner.lock();
    if inner.role == Role::Candidate && inner.current_term == term && granted >= majority {
        inner.role = Role::Leader;
        inner.leader_id = Some(peer.id);
        let last_index = inner.log.last_index();
        for &id in &peer_ids {
            inner.next_index.insert(id, last_index + 1);
            inner.match_index.insert(id, 0);
        }
        drop(inner);
        peer.role_notify.notify_waiters();
    }
}
