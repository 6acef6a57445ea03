//! Raft consensus implementation for the ballast replicated log.
//!
//! This module implements the Raft consensus algorithm: leader election,
//! log replication, commit advancement, durable state, and snapshot
//! installation. Committed commands are delivered in index order to the
//! upper-layer service over an apply channel.

// Deny unsafe code patterns in this critical consensus module.
// unwrap() calls can cause panics that break consensus.
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

mod log;
mod node;
pub mod persist;
pub mod router;
pub mod rpc;
mod state;

pub use log::{LogEntry, RaftLog};
pub use node::RaftNode;
pub use persist::{DurableState, MemPersister, Persister, RocksPersister};
pub use router::LocalRouter;
pub use rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RaftRpc, RequestVoteRequest, RequestVoteResponse,
};
pub use state::{LeaderState, Role};

use crate::types::{LogIndex, Term};
use std::sync::Arc;

/// A message on the apply channel.
///
/// Command messages arrive in strictly increasing index order. A snapshot
/// message replaces the whole prefix up to its index; command messages then
/// resume from the next index. Consumers must tolerate re-delivery of
/// indexes they have already applied.
#[derive(Debug, Clone)]
pub enum ApplyMsg {
    /// A committed log entry.
    Command {
        index: LogIndex,
        term: Term,
        data: Arc<Vec<u8>>,
    },
    /// A service snapshot covering every entry up to `index`.
    Snapshot {
        index: LogIndex,
        term: Term,
        data: Vec<u8>,
    },
}
