//! In-process cluster harness for the integration suites.
//!
//! Builds N raft nodes over the [`LocalRouter`], records every apply-channel
//! message per node, and exposes partition/crash/restart controls plus
//! wait-helpers with generous deadlines.

#![allow(dead_code)]

use ballast::config::RaftConfig;
use ballast::raft::{ApplyMsg, LocalRouter, MemPersister, Persister, RaftNode};
use ballast::types::{LogIndex, NodeId, Term};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration, Instant};

/// Upper bound for anything the cluster is expected to reach eventually.
pub const LONG_WAIT: Duration = Duration::from_secs(10);

/// Everything one node has emitted on its apply channel, in order.
#[derive(Default)]
pub struct AppliedLog {
    pub events: Vec<ApplyMsg>,
}

impl AppliedLog {
    /// Payload delivered for `index`, if any (the latest delivery wins).
    pub fn command_at(&self, index: LogIndex) -> Option<Vec<u8>> {
        self.events.iter().rev().find_map(|msg| match msg {
            ApplyMsg::Command { index: i, data, .. } if *i == index => Some(data.to_vec()),
            _ => None,
        })
    }

    pub fn contains_command(&self, data: &[u8]) -> bool {
        self.events.iter().any(|msg| {
            matches!(msg, ApplyMsg::Command { data: d, .. } if d.as_slice() == data)
        })
    }

    pub fn command_count(&self, index: LogIndex) -> usize {
        self.events
            .iter()
            .filter(|msg| matches!(msg, ApplyMsg::Command { index: i, .. } if *i == index))
            .count()
    }

    pub fn snapshots(&self) -> Vec<LogIndex> {
        self.events
            .iter()
            .filter_map(|msg| match msg {
                ApplyMsg::Snapshot { index, .. } => Some(*index),
                _ => None,
            })
            .collect()
    }

    /// Every command index strictly above `floor`.
    pub fn commands_above(&self, floor: LogIndex) -> bool {
        self.events.iter().all(|msg| match msg {
            ApplyMsg::Command { index, .. } => *index > floor,
            _ => true,
        })
    }

    /// Assert the stream has no gaps: command indexes advance one at a time,
    /// with snapshots allowed to jump the cursor forward and stale
    /// re-deliveries allowed below it.
    pub fn assert_contiguous(&self) {
        let mut next_expected: LogIndex = 1;
        for msg in &self.events {
            match msg {
                ApplyMsg::Command { index, .. } => {
                    if *index == next_expected {
                        next_expected += 1;
                    } else {
                        assert!(
                            *index < next_expected,
                            "gap in apply stream: expected {}, got {}",
                            next_expected,
                            index
                        );
                    }
                }
                ApplyMsg::Snapshot { index, .. } => {
                    next_expected = next_expected.max(index + 1);
                }
            }
        }
    }
}

struct NodeHandle {
    raft: Arc<RaftNode>,
    applied: Arc<Mutex<AppliedLog>>,
}

/// An in-process cluster of raft nodes with per-node apply recorders.
pub struct Cluster {
    pub router: Arc<LocalRouter>,
    ids: Vec<NodeId>,
    config: RaftConfig,
    nodes: Mutex<HashMap<NodeId, NodeHandle>>,
    persisters: Mutex<HashMap<NodeId, Arc<MemPersister>>>,
}

impl Cluster {
    pub fn new(n: usize) -> Self {
        let cluster = Self {
            router: LocalRouter::new(),
            ids: (1..=n as NodeId).collect(),
            config: RaftConfig::default(),
            nodes: Mutex::new(HashMap::new()),
            persisters: Mutex::new(HashMap::new()),
        };
        for &id in &cluster.ids {
            let persister = Arc::new(MemPersister::new());
            cluster.persisters.lock().insert(id, Arc::clone(&persister));
            cluster.spawn_node(id, persister);
        }
        cluster
    }

    fn spawn_node(&self, id: NodeId, persister: Arc<MemPersister>) {
        let peers: Vec<NodeId> = self.ids.iter().copied().filter(|&p| p != id).collect();
        let (apply_tx, mut apply_rx) = mpsc::unbounded_channel();

        let raft = RaftNode::new(
            self.config.clone(),
            id,
            peers,
            self.router.handle(id),
            persister as Arc<dyn Persister>,
            apply_tx,
        )
        .expect("node construction");
        self.router.register(id, Arc::clone(&raft));
        raft.run();

        let applied = Arc::new(Mutex::new(AppliedLog::default()));
        let recorder = Arc::clone(&applied);
        tokio::spawn(async move {
            while let Some(msg) = apply_rx.recv().await {
                recorder.lock().events.push(msg);
            }
        });

        self.nodes.lock().insert(id, NodeHandle { raft, applied });
    }

    pub fn ids(&self) -> &[NodeId] {
        &self.ids
    }

    pub fn raft(&self, id: NodeId) -> Arc<RaftNode> {
        Arc::clone(&self.nodes.lock()[&id].raft)
    }

    pub fn applied(&self, id: NodeId) -> Arc<Mutex<AppliedLog>> {
        Arc::clone(&self.nodes.lock()[&id].applied)
    }

    pub fn get_state(&self, id: NodeId) -> (Term, bool) {
        self.raft(id).get_state()
    }

    /// Nodes currently claiming leadership, with their terms.
    pub fn leaders(&self) -> Vec<(NodeId, Term)> {
        let nodes = self.nodes.lock();
        nodes
            .iter()
            .filter_map(|(&id, handle)| {
                let (term, is_leader) = handle.raft.get_state();
                is_leader.then_some((id, term))
            })
            .collect()
    }

    /// Wait until some node in `eligible` claims leadership; returns the one
    /// with the highest term.
    pub async fn wait_for_leader_among(&self, eligible: &[NodeId]) -> NodeId {
        let deadline = Instant::now() + LONG_WAIT;
        loop {
            let leaders: Vec<(NodeId, Term)> = self
                .leaders()
                .into_iter()
                .filter(|(id, _)| eligible.contains(id))
                .collect();
            if let Some(&(id, _)) = leaders.iter().max_by_key(|(_, term)| *term) {
                return id;
            }
            assert!(
                Instant::now() < deadline,
                "no leader among {:?} within {:?}",
                eligible,
                LONG_WAIT
            );
            sleep(Duration::from_millis(25)).await;
        }
    }

    pub async fn wait_for_leader(&self) -> NodeId {
        let ids = self.ids.clone();
        self.wait_for_leader_among(&ids).await
    }

    /// Sample leadership claims for `duration` and return them per term.
    /// Used to check election safety: no term may ever show two leaders.
    pub async fn observe_leaders(&self, duration: Duration) -> HashMap<Term, HashSet<NodeId>> {
        let mut seen: HashMap<Term, HashSet<NodeId>> = HashMap::new();
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            for (id, term) in self.leaders() {
                seen.entry(term).or_default().insert(id);
            }
            sleep(Duration::from_millis(10)).await;
        }
        seen
    }

    /// Propose `data` on whoever currently leads and wait until it applies
    /// there. Retries across leader changes. Returns (leader, index).
    pub async fn commit_on_leader(&self, data: &[u8]) -> (NodeId, LogIndex) {
        let deadline = Instant::now() + LONG_WAIT;
        loop {
            assert!(
                Instant::now() < deadline,
                "failed to commit {:?} within {:?}",
                data,
                LONG_WAIT
            );

            let candidates = self.leaders();
            let Some(&(leader, _)) = candidates.iter().max_by_key(|(_, term)| *term) else {
                sleep(Duration::from_millis(25)).await;
                continue;
            };

            let raft = self.raft(leader);
            let Ok((index, _term)) = raft.propose(data.to_vec()) else {
                sleep(Duration::from_millis(25)).await;
                continue;
            };

            // Wait for this exact payload to come back applied; a lost
            // leadership shows up as a different payload at the index.
            let applied = self.applied(leader);
            let commit_deadline = Instant::now() + Duration::from_secs(2);
            loop {
                match applied.lock().command_at(index) {
                    Some(found) if found == data => return (leader, index),
                    Some(_) => break,
                    None => {}
                }
                if Instant::now() > commit_deadline {
                    break;
                }
                sleep(Duration::from_millis(20)).await;
            }
        }
    }

    /// Wait until `id` has applied `data` at `index`.
    pub async fn wait_command(&self, id: NodeId, index: LogIndex, data: &[u8]) {
        let applied = self.applied(id);
        let deadline = Instant::now() + LONG_WAIT;
        loop {
            if applied.lock().command_at(index).as_deref() == Some(data) {
                return;
            }
            assert!(
                Instant::now() < deadline,
                "node {} never applied {:?} at {}",
                id,
                data,
                index
            );
            sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn wait_command_all(&self, index: LogIndex, data: &[u8]) {
        for &id in &self.ids {
            self.wait_command(id, index, data).await;
        }
    }

    pub fn disconnect(&self, id: NodeId) {
        self.router.disconnect(id);
    }

    pub fn reconnect(&self, id: NodeId) {
        self.router.reconnect(id);
    }

    /// Kill a node and drop it from the network. Durable state survives.
    pub fn crash(&self, id: NodeId) {
        if let Some(handle) = self.nodes.lock().remove(&id) {
            handle.raft.kill();
        }
        self.router.deregister(id);
    }

    /// Bring a crashed node back from its persisted state. The apply
    /// recorder starts fresh.
    pub fn restart(&self, id: NodeId) {
        let persister = Arc::clone(&self.persisters.lock()[&id]);
        self.spawn_node(id, persister);
    }

    pub fn shutdown(&self) {
        for handle in self.nodes.lock().values() {
            handle.raft.kill();
        }
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.shutdown();
    }
}
