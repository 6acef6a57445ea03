//! Core type definitions shared across the ballast crate.
//!
//! Identifiers are plain `u64` aliases rather than newtypes: they cross the
//! wire and the durable codec constantly, and the alias keeps those layers
//! free of conversion noise.

/// Unique identifier for a node in the cluster.
pub type NodeId = u64;

/// Raft term number. Monotonically increasing; each election starts a new term.
pub type Term = u64;

/// Raft log position. 1-based; index 0 is the sentinel before the first entry.
pub type LogIndex = u64;
