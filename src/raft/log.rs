//! Raft log implementation.

use crate::error::{BallastError, Result};
use crate::types::{LogIndex, Term};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

/// A single entry in the Raft log.
///
/// Uses Arc<Vec<u8>> for the data field to enable O(1) cloning during
/// log replication, avoiding expensive data copies in the hot path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when the entry was received by the leader.
    pub term: Term,
    /// The global index of this entry in the log.
    pub index: LogIndex,
    /// The command data (Arc-wrapped for cheap cloning during replication).
    #[serde(with = "arc_bytes")]
    pub data: Arc<Vec<u8>>,
}

impl LogEntry {
    /// Create a new log entry.
    pub fn new(term: Term, index: LogIndex, data: Vec<u8>) -> Self {
        Self {
            term,
            index,
            data: Arc::new(data),
        }
    }

    /// Get a reference to the command bytes.
    #[inline]
    pub fn data_bytes(&self) -> &[u8] {
        &self.data
    }
}

/// Serde helper module for Arc<Vec<u8>> serialization.
/// Serializes as raw bytes, deserializes into an Arc-wrapped Vec.
mod arc_bytes {
    use serde::{Deserializer, Serializer};
    use std::sync::Arc;

    pub fn serialize<S>(data: &Arc<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serde_bytes::serialize(data.as_slice(), serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Arc<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: Vec<u8> = serde_bytes::deserialize(deserializer)?;
        Ok(Arc::new(bytes))
    }
}

/// The in-memory Raft log suffix: every entry with an index greater than the
/// latest snapshot point. Global indexes are 1-based; `last_snapshot_index`
/// is 0 until the first compaction.
#[derive(Debug)]
pub struct RaftLog {
    entries: VecDeque<LogEntry>,
    /// Index of the last entry covered by the latest snapshot.
    last_snapshot_index: LogIndex,
    /// Term of the entry at `last_snapshot_index`.
    last_snapshot_term: Term,
}

impl RaftLog {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            last_snapshot_index: 0,
            last_snapshot_term: 0,
        }
    }

    /// Rebuild a log from its persisted parts.
    pub fn from_parts(
        last_snapshot_index: LogIndex,
        last_snapshot_term: Term,
        entries: Vec<LogEntry>,
    ) -> Self {
        Self {
            entries: entries.into(),
            last_snapshot_index,
            last_snapshot_term,
        }
    }

    pub fn last_snapshot_index(&self) -> LogIndex {
        self.last_snapshot_index
    }

    pub fn last_snapshot_term(&self) -> Term {
        self.last_snapshot_term
    }

    /// Get the index of the last log entry (the snapshot point if empty).
    pub fn last_index(&self) -> LogIndex {
        match self.entries.back() {
            Some(entry) => entry.index,
            None => self.last_snapshot_index,
        }
    }

    /// Get the term of the last log entry (the snapshot term if empty).
    pub fn last_term(&self) -> Term {
        match self.entries.back() {
            Some(entry) => entry.term,
            None => self.last_snapshot_term,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Translate a global index into an offset in the in-memory suffix.
    ///
    /// Panics when asked for an index at or below the snapshot point: that
    /// entry no longer exists anywhere, so reaching for it is an invariant
    /// violation, not a recoverable condition.
    fn offset_of(&self, index: LogIndex) -> usize {
        assert!(
            index > self.last_snapshot_index,
            "log index {} does not exceed snapshot index {}",
            index,
            self.last_snapshot_index
        );
        (index - self.last_snapshot_index - 1) as usize
    }

    /// Append an entry to the log.
    pub fn append(&mut self, entry: LogEntry) -> Result<()> {
        let expected_index = self.last_index() + 1;
        if entry.index != expected_index {
            return Err(BallastError::Log(format!(
                "expected index {}, got {}",
                expected_index, entry.index
            )));
        }
        self.entries.push_back(entry);
        Ok(())
    }

    /// Get an entry by global index.
    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        if index <= self.last_snapshot_index || index > self.last_index() {
            return None;
        }
        self.entries.get(self.offset_of(index))
    }

    /// Get the term at a global index.
    ///
    /// Returns `None` past the end of the log. Panics below the snapshot
    /// point (see [`RaftLog::offset_of`]); `last_snapshot_index` itself is
    /// answered from the snapshot metadata, which also covers the index-0
    /// sentinel of a fresh log.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == self.last_snapshot_index {
            return Some(self.last_snapshot_term);
        }
        if index > self.last_index() {
            return None;
        }
        self.entries.get(self.offset_of(index)).map(|e| e.term)
    }

    /// Get up to `limit` entries starting from the given global index.
    pub fn entries_from(&self, start_index: LogIndex, limit: usize) -> Vec<LogEntry> {
        if start_index > self.last_index() {
            return Vec::new();
        }
        let offset = self.offset_of(start_index.max(self.last_snapshot_index + 1));
        self.entries.iter().skip(offset).take(limit).cloned().collect()
    }

    /// Get entries in the inclusive global range [start, end].
    pub fn entries_range(&self, start: LogIndex, end: LogIndex) -> Vec<LogEntry> {
        self.entries_from(start, usize::MAX)
            .into_iter()
            .take_while(|e| e.index <= end)
            .collect()
    }

    /// Truncate the log from the given global index (inclusive).
    /// Used when receiving conflicting entries from the leader.
    pub fn truncate_from(&mut self, index: LogIndex) {
        if index <= self.last_snapshot_index {
            self.entries.clear();
            return;
        }
        self.entries.truncate(self.offset_of(index));
    }

    /// Check if our log contains `prev_log_index` with `prev_log_term`.
    pub fn matches(&self, prev_log_index: LogIndex, prev_log_term: Term) -> bool {
        match self.term_at(prev_log_index) {
            Some(term) => term == prev_log_term,
            None => false,
        }
    }

    /// First global index of the run of entries carrying `term` that ends at
    /// `from`. Used to build the accelerated back-off hint on rejection.
    pub fn first_index_with_term(&self, term: Term, from: LogIndex) -> LogIndex {
        let mut index = from;
        while index > self.last_snapshot_index + 1 && self.term_at(index - 1) == Some(term) {
            index -= 1;
        }
        index
    }

    /// Last global index in the log whose term is `term`, if any.
    /// Used by the leader to rewind next_index on a conflict reply.
    pub fn last_index_with_term(&self, term: Term) -> Option<LogIndex> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.term == term)
            .map(|e| e.index)
    }

    /// Discard entries covered by a locally produced snapshot up to
    /// `up_to_index`, keeping the suffix.
    pub fn compact(&mut self, up_to_index: LogIndex, snapshot_term: Term) {
        if up_to_index <= self.last_snapshot_index {
            return;
        }

        while let Some(front) = self.entries.front() {
            if front.index > up_to_index {
                break;
            }
            self.entries.pop_front();
        }

        self.last_snapshot_index = up_to_index;
        self.last_snapshot_term = snapshot_term;
    }

    /// Reset the log around a snapshot received from the leader.
    ///
    /// If we already hold the snapshot's last entry with a matching term the
    /// suffix beyond it is retained; otherwise the whole log is discarded.
    pub fn install_snapshot(&mut self, last_included_index: LogIndex, last_included_term: Term) {
        let retain_suffix = last_included_index > self.last_snapshot_index
            && last_included_index <= self.last_index()
            && self.term_at(last_included_index) == Some(last_included_term);

        if retain_suffix {
            self.compact(last_included_index, last_included_term);
        } else {
            self.entries.clear();
            self.last_snapshot_index = last_included_index;
            self.last_snapshot_term = last_included_term;
        }
    }

    /// Check if a candidate's log is at least as up-to-date as ours.
    /// Used for voting in leader election.
    pub fn is_up_to_date(&self, last_log_index: LogIndex, last_log_term: Term) -> bool {
        let our_last_term = self.last_term();
        if last_log_term != our_last_term {
            last_log_term > our_last_term
        } else {
            last_log_index >= self.last_index()
        }
    }

    /// Clone the in-memory suffix for the durable codec.
    pub fn entries_vec(&self) -> Vec<LogEntry> {
        self.entries.iter().cloned().collect()
    }
}

impl Default for RaftLog {
    fn default() -> Self {
        Self::new()
    }
}
