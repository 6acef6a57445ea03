//! Key/value service replicated through the consensus core.
//!
//! Each node pairs a [`KvService`] with its [`RaftNode`]. Writes are
//! proposed to the log and acknowledged only once the command comes back
//! committed on the apply channel; reads take the same path so they observe
//! a linearizable view. Duplicate writes from client retries are suppressed
//! with a per-client sequence table, which travels inside snapshots so
//! deduplication survives compaction and restarts.

use crate::error::{BallastError, Result};
use crate::raft::{ApplyMsg, Persister, RaftNode};
use crate::types::{LogIndex, Term};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout, Duration, Instant};
use tracing::{debug, error, info, warn};

/// How long a proposer waits for its command to commit before telling the
/// caller to retry elsewhere.
const EXECUTE_TIMEOUT: Duration = Duration::from_secs(2);

/// A single key/value operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum KvOp {
    Get { key: String },
    Put { key: String, value: String },
    Append { key: String, value: String },
}

/// A client command as stored in the replicated log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvCommand {
    /// Issuing client.
    pub client_id: u64,
    /// Client-local sequence number, strictly increasing per client.
    pub request_seq: u64,
    pub op: KvOp,
}

/// Serialized service state carried inside a snapshot.
#[derive(Debug, Default, Serialize, Deserialize)]
struct KvSnapshot {
    data: HashMap<String, String>,
    last_seq: HashMap<u64, u64>,
}

struct KvInner {
    data: HashMap<String, String>,
    /// Highest request_seq applied per client, for write deduplication.
    last_seq: HashMap<u64, u64>,
    /// Highest log index reflected in `data`.
    applied_index: LogIndex,
    /// Proposers waiting for their index to commit, with the term they
    /// proposed under.
    waiters: HashMap<LogIndex, (Term, oneshot::Sender<Result<Option<String>>>)>,
}

/// The replicated key/value state machine for one node.
pub struct KvService {
    raft: Arc<RaftNode>,
    persister: Arc<dyn Persister>,
    /// Persisted-state size above which a snapshot is taken; zero disables.
    snapshot_threshold: usize,
    inner: Mutex<KvInner>,
}

impl KvService {
    pub fn new(
        raft: Arc<RaftNode>,
        persister: Arc<dyn Persister>,
        snapshot_threshold: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            raft,
            persister,
            snapshot_threshold,
            inner: Mutex::new(KvInner {
                data: HashMap::new(),
                last_seq: HashMap::new(),
                applied_index: 0,
                waiters: HashMap::new(),
            }),
        })
    }

    pub fn raft(&self) -> &Arc<RaftNode> {
        &self.raft
    }

    /// Start consuming the apply channel.
    pub fn run(self: &Arc<Self>, apply_rx: mpsc::UnboundedReceiver<ApplyMsg>) {
        tokio::spawn(Arc::clone(self).consume(apply_rx));
    }

    /// Propose a command and wait for it to commit.
    ///
    /// Fails fast with `NotLeader` on a non-leader; clients retry against
    /// another node. A leader that loses its term mid-flight surfaces the
    /// same way once a different command claims the index.
    pub async fn execute(&self, command: KvCommand) -> Result<Option<String>> {
        let encoded = bincode::serialize(&command)?;
        let (index, term) = self.raft.propose(encoded)?;

        let (tx, rx) = oneshot::channel();
        self.inner.lock().waiters.insert(index, (term, tx));

        match timeout(EXECUTE_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                // Waiter was displaced: another proposal owns this index now.
                Err(BallastError::NotLeader {
                    leader: self.raft.leader_hint(),
                })
            }
            Err(_) => {
                self.inner.lock().waiters.remove(&index);
                Err(BallastError::Timeout(EXECUTE_TIMEOUT.as_millis() as u64))
            }
        }
    }

    /// Read a key directly from local applied state, bypassing the log.
    /// Not linearizable; for inspection and tests.
    pub fn local_get(&self, key: &str) -> Option<String> {
        self.inner.lock().data.get(key).cloned()
    }

    /// Highest log index reflected in the local state.
    pub fn applied_index(&self) -> LogIndex {
        self.inner.lock().applied_index
    }

    async fn consume(self: Arc<Self>, mut apply_rx: mpsc::UnboundedReceiver<ApplyMsg>) {
        while let Some(msg) = apply_rx.recv().await {
            match msg {
                ApplyMsg::Command { index, term, data } => {
                    self.apply_command(index, term, &data);
                }
                ApplyMsg::Snapshot { index, term, data } => {
                    self.restore_snapshot(index, term, &data);
                }
            }
        }
        debug!("apply channel closed, service stopping");
    }

    fn apply_command(&self, index: LogIndex, term: Term, data: &[u8]) {
        let mut snapshot_due = None;
        {
            let mut inner = self.inner.lock();
            if index <= inner.applied_index {
                // Re-delivered prefix after a snapshot; already reflected.
                return;
            }

            let result = match bincode::deserialize::<KvCommand>(data) {
                Ok(command) => Ok(Self::apply_to_state(&mut inner, command)),
                Err(e) => {
                    error!(index, error = %e, "undecodable command in committed log");
                    Err(BallastError::Serialization(e.to_string()))
                }
            };
            inner.applied_index = index;

            if let Some((expected_term, tx)) = inner.waiters.remove(&index) {
                if expected_term == term {
                    let _ = tx.send(result);
                } else {
                    // The index committed under a different term, so the
                    // command the waiter proposed was dropped.
                    let _ = tx.send(Err(BallastError::NotLeader { leader: None }));
                }
            }

            if self.snapshot_threshold > 0 {
                match self.persister.state_size() {
                    Ok(size) if size >= self.snapshot_threshold => {
                        let snapshot = KvSnapshot {
                            data: inner.data.clone(),
                            last_seq: inner.last_seq.clone(),
                        };
                        match bincode::serialize(&snapshot) {
                            Ok(bytes) => snapshot_due = Some((index, bytes)),
                            Err(e) => error!(error = %e, "failed to serialize snapshot"),
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "failed to read persisted state size"),
                }
            }
        }

        if let Some((index, bytes)) = snapshot_due {
            info!(index, "state size over threshold, taking snapshot");
            if let Err(e) = self.raft.snapshot(index, bytes) {
                warn!(index, error = %e, "snapshot request rejected");
            }
        }
    }

    fn apply_to_state(inner: &mut KvInner, command: KvCommand) -> Option<String> {
        match command.op {
            KvOp::Get { key } => inner.data.get(&key).cloned(),
            KvOp::Put { key, value } => {
                if Self::fresh_write(inner, command.client_id, command.request_seq) {
                    inner.data.insert(key, value);
                }
                None
            }
            KvOp::Append { key, value } => {
                if Self::fresh_write(inner, command.client_id, command.request_seq) {
                    inner.data.entry(key).or_default().push_str(&value);
                }
                None
            }
        }
    }

    /// True when this (client, seq) write has not been applied yet; records
    /// it as applied. Retried duplicates come back false.
    fn fresh_write(inner: &mut KvInner, client_id: u64, request_seq: u64) -> bool {
        let last = inner.last_seq.entry(client_id).or_insert(0);
        if request_seq <= *last {
            return false;
        }
        *last = request_seq;
        true
    }

    fn restore_snapshot(&self, index: LogIndex, term: Term, data: &[u8]) {
        if !self.raft.cond_install_snapshot(term, index) {
            debug!(index, "snapshot superseded by newer commits, skipping");
            return;
        }

        let snapshot: KvSnapshot = match bincode::deserialize(data) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!(index, error = %e, "undecodable snapshot");
                return;
            }
        };

        let mut inner = self.inner.lock();
        inner.data = snapshot.data;
        inner.last_seq = snapshot.last_seq;
        inner.applied_index = index;

        // Whatever was waiting below the snapshot point was resolved on
        // some other node; tell the proposers to retry.
        let stale: Vec<LogIndex> = inner
            .waiters
            .keys()
            .copied()
            .filter(|&i| i <= index)
            .collect();
        for i in stale {
            if let Some((_, tx)) = inner.waiters.remove(&i) {
                let _ = tx.send(Err(BallastError::NotLeader { leader: None }));
            }
        }

        info!(index, "restored state from snapshot");
    }
}

/// Client handle that hunts for the leader across a set of services.
///
/// Write deduplication relies on `(client_id, request_seq)`: every retry of
/// one logical operation reuses the same sequence number.
pub struct KvClient {
    services: Vec<Arc<KvService>>,
    client_id: u64,
    next_seq: AtomicU64,
    /// Index of the service that last answered; tried first.
    preferred: AtomicUsize,
}

impl KvClient {
    /// How long a single logical operation may retry before giving up.
    const OP_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new(services: Vec<Arc<KvService>>, client_id: u64) -> Self {
        Self {
            services,
            client_id,
            next_seq: AtomicU64::new(0),
            preferred: AtomicUsize::new(0),
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        self.run_op(KvOp::Get {
            key: key.to_string(),
        })
        .await
    }

    pub async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.run_op(KvOp::Put {
            key: key.to_string(),
            value: value.to_string(),
        })
        .await
        .map(|_| ())
    }

    pub async fn append(&self, key: &str, value: &str) -> Result<()> {
        self.run_op(KvOp::Append {
            key: key.to_string(),
            value: value.to_string(),
        })
        .await
        .map(|_| ())
    }

    async fn run_op(&self, op: KvOp) -> Result<Option<String>> {
        let request_seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let deadline = Instant::now() + Self::OP_TIMEOUT;
        let mut target = self.preferred.load(Ordering::Relaxed);

        loop {
            let service = &self.services[target % self.services.len()];
            let command = KvCommand {
                client_id: self.client_id,
                request_seq,
                op: op.clone(),
            };

            match service.execute(command).await {
                Ok(value) => {
                    self.preferred
                        .store(target % self.services.len(), Ordering::Relaxed);
                    return Ok(value);
                }
                Err(e) if e.is_retryable() => {
                    if Instant::now() >= deadline {
                        return Err(BallastError::Timeout(Self::OP_TIMEOUT.as_millis() as u64));
                    }
                    debug!(error = %e, "operation bounced, trying next node");
                    target += 1;
                    sleep(Duration::from_millis(50)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
