//! Error types for the ballast consensus core.
//!
//! All fallible operations return [`Result`], backed by the unified
//! [`BallastError`] enum. Callers that drive proposals should check
//! [`BallastError::is_retryable`] before giving up: a `NotLeader` rejection
//! or a transport timeout is expected during elections and partitions, and
//! clients are expected to retry against another node.

use crate::types::NodeId;
use std::io;
use thiserror::Error;

/// Main error type for ballast operations.
#[derive(Error, Debug)]
pub enum BallastError {
    // Consensus errors
    #[error("not the leader; leader is: {leader:?}")]
    NotLeader { leader: Option<NodeId> },

    #[error("raft log error: {0}")]
    Log(String),

    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    // Transport errors
    #[error("peer unavailable: {0}")]
    Unavailable(String),

    #[error("request timed out after {0}ms")]
    Timeout(u64),

    // Durability errors
    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // External errors
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("node is shut down")]
    Shutdown,

    #[error("internal error: {0}")]
    Internal(String),
}

impl BallastError {
    /// Check if the error is transient and the operation may be retried,
    /// typically against another node.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BallastError::NotLeader { .. }
                | BallastError::Timeout(_)
                | BallastError::Unavailable(_)
        )
    }
}

impl From<rocksdb::Error> for BallastError {
    fn from(e: rocksdb::Error) -> Self {
        BallastError::Storage(e.to_string())
    }
}

impl From<bincode::Error> for BallastError {
    fn from(e: bincode::Error) -> Self {
        BallastError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for BallastError {
    fn from(e: serde_json::Error) -> Self {
        BallastError::Serialization(e.to_string())
    }
}

/// Result type alias for ballast operations.
pub type Result<T> = std::result::Result<T, BallastError>;
