//! Durable state for the consensus core.
//!
//! The core treats its persistence medium as an opaque store of two byte
//! blobs: the serialized raft state and the latest service snapshot. The
//! blobs must be readable after a crash, and the paired write must be
//! atomic so a snapshot is never observed without the matching state.

use super::LogEntry;
use crate::error::Result;
use crate::types::{LogIndex, NodeId, Term};
use parking_lot::Mutex;
use rocksdb::{Options, WriteBatch, DB};
use serde::{Deserialize, Serialize};
use std::path::Path;

const STATE_KEY: &[u8] = b"raft_state";
const SNAPSHOT_KEY: &[u8] = b"raft_snapshot";

/// Everything the node must recover after a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DurableState {
    /// Highest term seen.
    pub current_term: Term,
    /// Peer voted for in `current_term`, if any.
    pub voted_for: Option<NodeId>,
    /// Index of the last entry covered by the latest snapshot.
    pub last_snapshot_index: LogIndex,
    /// Term of the entry at `last_snapshot_index`.
    pub last_snapshot_term: Term,
    /// Log suffix beyond the snapshot point.
    pub entries: Vec<LogEntry>,
}

impl DurableState {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Store for the raft-state and snapshot blobs.
pub trait Persister: Send + Sync {
    /// Persist the raft state blob.
    fn save_state(&self, state: &[u8]) -> Result<()>;

    /// Persist both blobs in a single atomic write.
    fn save_state_and_snapshot(&self, state: &[u8], snapshot: &[u8]) -> Result<()>;

    /// Read back the raft state blob, if one was ever saved.
    fn read_state(&self) -> Result<Option<Vec<u8>>>;

    /// Read back the snapshot blob, if one was ever saved.
    fn read_snapshot(&self) -> Result<Option<Vec<u8>>>;

    /// Size in bytes of the persisted raft state blob.
    fn state_size(&self) -> Result<usize>;
}

/// RocksDB-backed persister.
pub struct RocksPersister {
    db: DB,
}

impl RocksPersister {
    /// Open or create a persister at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let db = DB::open(&opts, path)?;
        Ok(Self { db })
    }
}

impl Persister for RocksPersister {
    fn save_state(&self, state: &[u8]) -> Result<()> {
        self.db.put(STATE_KEY, state)?;
        self.db.flush()?;
        Ok(())
    }

    fn save_state_and_snapshot(&self, state: &[u8], snapshot: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::default();
        batch.put(STATE_KEY, state);
        batch.put(SNAPSHOT_KEY, snapshot);
        self.db.write(batch)?;
        self.db.flush()?;
        Ok(())
    }

    fn read_state(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(STATE_KEY)?)
    }

    fn read_snapshot(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(SNAPSHOT_KEY)?)
    }

    fn state_size(&self) -> Result<usize> {
        Ok(self.db.get(STATE_KEY)?.map(|b| b.len()).unwrap_or(0))
    }
}

/// In-memory persister for tests and in-process clusters. Contents survive
/// a node restart as long as the same instance is handed back to the node.
#[derive(Default)]
pub struct MemPersister {
    blobs: Mutex<MemBlobs>,
}

#[derive(Default)]
struct MemBlobs {
    state: Option<Vec<u8>>,
    snapshot: Option<Vec<u8>>,
}

impl MemPersister {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Persister for MemPersister {
    fn save_state(&self, state: &[u8]) -> Result<()> {
        self.blobs.lock().state = Some(state.to_vec());
        Ok(())
    }

    fn save_state_and_snapshot(&self, state: &[u8], snapshot: &[u8]) -> Result<()> {
        let mut blobs = self.blobs.lock();
        blobs.state = Some(state.to_vec());
        blobs.snapshot = Some(snapshot.to_vec());
        Ok(())
    }

    fn read_state(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.lock().state.clone())
    }

    fn read_snapshot(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.lock().snapshot.clone())
    }

    fn state_size(&self) -> Result<usize> {
        Ok(self.blobs.lock().state.as_ref().map(|b| b.len()).unwrap_or(0))
    }
}
