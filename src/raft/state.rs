//! Role and leader-side replication state.

use crate::types::{LogIndex, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The role of a Raft node within its current term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Passive; responds to RPCs and waits out its election timer.
    Follower,
    /// Actively soliciting votes for a new term.
    Candidate,
    /// Handling proposals and driving replication.
    Leader,
}

impl Role {
    pub fn is_leader(&self) -> bool {
        matches!(self, Role::Leader)
    }

    pub fn is_candidate(&self) -> bool {
        matches!(self, Role::Candidate)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Follower => write!(f, "Follower"),
            Role::Candidate => write!(f, "Candidate"),
            Role::Leader => write!(f, "Leader"),
        }
    }
}

/// Per-peer replication bookkeeping, reinitialized on every election win.
#[derive(Debug, Clone)]
pub struct LeaderState {
    /// For each peer, index of the next log entry to send.
    pub next_index: HashMap<NodeId, LogIndex>,
    /// For each peer, highest log index known to be replicated there.
    pub match_index: HashMap<NodeId, LogIndex>,
}

impl LeaderState {
    pub fn new(peers: &[NodeId], last_log_index: LogIndex) -> Self {
        let mut next_index = HashMap::new();
        let mut match_index = HashMap::new();

        for &peer in peers {
            next_index.insert(peer, last_log_index + 1);
            match_index.insert(peer, 0);
        }

        Self {
            next_index,
            match_index,
        }
    }

    /// Record a successful replication up to `match_index` on `peer`.
    ///
    /// Only moves forward: replies from arbitrarily delayed duplicates must
    /// not rewind the match point.
    pub fn record_match(&mut self, peer: NodeId, match_index: LogIndex) {
        let current = self.match_index.entry(peer).or_insert(0);
        if match_index > *current {
            *current = match_index;
        }
        self.next_index.insert(peer, *current + 1);
    }

    /// Rewind the next index for `peer` after a consistency rejection.
    pub fn rewind_next(&mut self, peer: NodeId, next: LogIndex) {
        self.next_index.insert(peer, next.max(1));
    }

    /// The highest index replicated on a quorum, counting the leader's own
    /// `last_log_index`. The caller still has to check the entry's term
    /// before committing.
    pub fn quorum_match_index(&self, last_log_index: LogIndex, quorum: usize) -> LogIndex {
        let mut indices: Vec<LogIndex> = self.match_index.values().copied().collect();
        indices.push(last_log_index);
        indices.sort_unstable();
        indices.reverse();

        if quorum == 0 || quorum > indices.len() {
            return 0;
        }
        indices[quorum - 1]
    }
}
