//! Ballast - a replicated state machine built on Raft consensus.
//!
//! Ballast keeps a fault-tolerant, ordered log replicated across a fixed
//! cluster of nodes and delivers committed commands in order to an
//! embedded key/value service. The consensus core handles leader election,
//! log replication, commit advancement, durable state, and snapshot
//! transfer; transports and storage media plug in behind small traits.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Ballast                             │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Service Layer: KvService | KvClient                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Consensus Core: RaftNode | RaftLog | apply channel         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Pluggable Edges: RaftRpc transport | Persister storage     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use ballast::config::RaftConfig;
//! use ballast::kv::KvService;
//! use ballast::raft::{LocalRouter, MemPersister, Persister, RaftNode};
//! use std::sync::Arc;
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> ballast::Result<()> {
//!     let router = LocalRouter::new();
//!     let persister: Arc<dyn Persister> = Arc::new(MemPersister::new());
//!     let (apply_tx, apply_rx) = mpsc::unbounded_channel();
//!
//!     let raft = RaftNode::new(
//!         RaftConfig::default(),
//!         1,
//!         vec![],
//!         router.handle(1),
//!         Arc::clone(&persister),
//!         apply_tx,
//!     )?;
//!     router.register(1, Arc::clone(&raft));
//!     raft.run();
//!
//!     let service = KvService::new(raft, persister, 0);
//!     service.run(apply_rx);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod kv;
pub mod raft;
pub mod types;

pub use error::{BallastError, Result};
