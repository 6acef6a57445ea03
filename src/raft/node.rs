//! The Raft node: election, replication, snapshots, and the apply loop.
//!
//! All mutable node state lives behind a single mutex. Three long-lived
//! tasks (election ticker, heartbeat ticker, applier) and one short-lived
//! task per dispatched peer RPC share it; the lock is never held across an
//! await point, so every reply handler revalidates role and term after
//! reacquiring it.

use super::persist::{DurableState, Persister};
use super::rpc::*;
use super::state::{LeaderState, Role};
use super::{ApplyMsg, LogEntry, RaftLog};
use crate::config::RaftConfig;
use crate::error::{BallastError, Result};
use crate::types::{LogIndex, NodeId, Term};
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep, sleep_until, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Mutable node state guarded by the one mutex.
struct RaftCore {
    role: Role,
    current_term: Term,
    voted_for: Option<NodeId>,
    log: RaftLog,
    commit_index: LogIndex,
    last_applied: LogIndex,
    leader_id: Option<NodeId>,
    leader: Option<LeaderState>,
    election_deadline: Instant,
}

/// What the heartbeat loop decided to send a peer.
enum Outbound {
    Append(AppendEntriesRequest),
    Snapshot(InstallSnapshotRequest),
}

/// One member of a replicated-log cluster.
pub struct RaftNode {
    me: NodeId,
    peers: Vec<NodeId>,
    config: RaftConfig,
    rpc: Arc<dyn RaftRpc>,
    persister: Arc<dyn Persister>,
    core: Mutex<RaftCore>,
    apply_tx: mpsc::UnboundedSender<ApplyMsg>,
    shutdown: watch::Sender<bool>,
}

impl RaftNode {
    /// Create a node, restoring durable state from the persister when
    /// present. The node is passive until [`RaftNode::run`] is called.
    pub fn new(
        config: RaftConfig,
        me: NodeId,
        peers: Vec<NodeId>,
        rpc: Arc<dyn RaftRpc>,
        persister: Arc<dyn Persister>,
        apply_tx: mpsc::UnboundedSender<ApplyMsg>,
    ) -> Result<Arc<Self>> {
        let mut current_term = 0;
        let mut voted_for = None;
        let mut log = RaftLog::new();

        if let Some(bytes) = persister.read_state()? {
            let durable = DurableState::decode(&bytes)?;
            current_term = durable.current_term;
            voted_for = durable.voted_for;
            log = RaftLog::from_parts(
                durable.last_snapshot_index,
                durable.last_snapshot_term,
                durable.entries,
            );
            info!(
                node_id = me,
                term = current_term,
                last_index = log.last_index(),
                snapshot_index = log.last_snapshot_index(),
                "restored durable state"
            );
        }

        let commit_index = log.last_snapshot_index();
        let (shutdown, _) = watch::channel(false);

        let node = Arc::new(Self {
            me,
            peers,
            config,
            rpc,
            persister,
            core: Mutex::new(RaftCore {
                role: Role::Follower,
                current_term,
                voted_for,
                log,
                commit_index,
                last_applied: commit_index,
                leader_id: None,
                leader: None,
                election_deadline: Instant::now(),
            }),
            apply_tx,
            shutdown,
        });

        {
            let mut core = node.core.lock();
            node.reset_election_timer(&mut core);
        }

        Ok(node)
    }

    /// Start the three long-lived activities. If a snapshot was restored,
    /// it is re-delivered on the apply channel first so the service can
    /// rebuild its state before any command messages arrive.
    pub fn run(self: &Arc<Self>) {
        {
            let core = self.core.lock();
            if core.log.last_snapshot_index() > 0 {
                match self.persister.read_snapshot() {
                    Ok(Some(data)) => {
                        let _ = self.apply_tx.send(ApplyMsg::Snapshot {
                            index: core.log.last_snapshot_index(),
                            term: core.log.last_snapshot_term(),
                            data,
                        });
                    }
                    Ok(None) => warn!(node_id = self.me, "snapshot metadata without snapshot blob"),
                    Err(e) => error!(node_id = self.me, error = %e, "failed to read snapshot"),
                }
            }
        }

        tokio::spawn(Arc::clone(self).election_ticker());
        tokio::spawn(Arc::clone(self).heartbeat_ticker());
        tokio::spawn(Arc::clone(self).apply_ticker());
    }

    /// Stop all activities. In-flight dispatch tasks finish their current
    /// reply handling and exit.
    pub fn kill(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn is_killed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Current term and whether this node believes it is the leader.
    pub fn get_state(&self) -> (Term, bool) {
        let core = self.core.lock();
        (core.current_term, core.role.is_leader())
    }

    /// The node this one believes is the current leader, if any.
    pub fn leader_hint(&self) -> Option<NodeId> {
        self.core.lock().leader_id
    }

    /// Leader-only entry point: append a command to the replicated log.
    ///
    /// Returns the index and term assigned to the command. Replication is
    /// driven asynchronously by the heartbeat ticker; commitment is observed
    /// through the apply channel.
    pub fn propose(&self, data: Vec<u8>) -> Result<(LogIndex, Term)> {
        if self.is_killed() {
            return Err(BallastError::Shutdown);
        }

        let mut core = self.core.lock();
        if !core.role.is_leader() {
            return Err(BallastError::NotLeader {
                leader: core.leader_id,
            });
        }

        let term = core.current_term;
        let index = core.log.last_index() + 1;
        core.log.append(LogEntry::new(term, index, data))?;

        if let Err(e) = self.persist_core(&core) {
            // The entry never became durable, so it must not stay visible.
            core.log.truncate_from(index);
            return Err(e);
        }

        // The leader's own log counts toward the quorum; without peers this
        // is the only writer that ever moves the commit index.
        self.advance_commit(&mut core);

        debug!(node_id = self.me, index, term, "accepted proposal");
        Ok((index, term))
    }

    /// Service notification that its state up to `index` is captured in
    /// `data`. Discards the covered log prefix and persists state and
    /// snapshot together.
    pub fn snapshot(&self, index: LogIndex, data: Vec<u8>) -> Result<()> {
        let mut core = self.core.lock();
        if index <= core.log.last_snapshot_index() {
            return Ok(());
        }
        if index > core.commit_index {
            return Err(BallastError::Log(format!(
                "snapshot index {} beyond commit index {}",
                index, core.commit_index
            )));
        }

        let term = match core.log.term_at(index) {
            Some(term) => term,
            None => {
                return Err(BallastError::Log(format!(
                    "snapshot index {} beyond log end {}",
                    index,
                    core.log.last_index()
                )))
            }
        };

        core.log.compact(index, term);
        self.persist_with_snapshot(&core, &data)?;
        info!(node_id = self.me, index, term, "compacted log into snapshot");
        Ok(())
    }

    /// Whether a snapshot delivered on the apply channel is still current:
    /// nothing newer has been committed since it was produced. The service
    /// calls this before switching to the snapshot's baseline.
    pub fn cond_install_snapshot(&self, _last_included_term: Term, last_included_index: LogIndex) -> bool {
        let core = self.core.lock();
        last_included_index >= core.commit_index
    }

    // ---------------------------------------------------------------------
    // Tickers
    // ---------------------------------------------------------------------

    async fn election_ticker(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let deadline = self.core.lock().election_deadline;
            tokio::select! {
                _ = sleep_until(deadline) => {}
                _ = shutdown.changed() => return,
            }

            let election = {
                let mut core = self.core.lock();
                if Instant::now() < core.election_deadline {
                    // Timer was reset while we slept; wait out the new deadline.
                    None
                } else if core.role.is_leader() {
                    self.reset_election_timer(&mut core);
                    None
                } else {
                    Some(self.begin_candidacy(&mut core))
                }
            };

            if let Some((term, last_log_index, last_log_term)) = election {
                self.solicit_votes(term, last_log_index, last_log_term);
            }
        }
    }

    async fn heartbeat_ticker(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => return,
            }
            let is_leader = self.core.lock().role.is_leader();
            if is_leader {
                self.broadcast_entries();
            }
        }
    }

    async fn apply_ticker(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let pending = {
                let core = self.core.lock();
                if core.commit_index > core.last_applied {
                    let up_to = core.commit_index;
                    Some((up_to, core.log.entries_range(core.last_applied + 1, up_to)))
                } else {
                    None
                }
            };

            match pending {
                Some((up_to, entries)) => {
                    for entry in entries {
                        let msg = ApplyMsg::Command {
                            index: entry.index,
                            term: entry.term,
                            data: Arc::clone(&entry.data),
                        };
                        if self.apply_tx.send(msg).is_err() {
                            // Service went away; nothing left to deliver to.
                            return;
                        }
                    }
                    let mut core = self.core.lock();
                    // A concurrent snapshot install may have advanced past us.
                    core.last_applied = core.last_applied.max(up_to);
                }
                None => {
                    tokio::select! {
                        _ = sleep(self.config.apply_interval) => {}
                        _ = shutdown.changed() => return,
                    }
                }
            }
        }
    }

    // ---------------------------------------------------------------------
    // Elections
    // ---------------------------------------------------------------------

    fn begin_candidacy(&self, core: &mut RaftCore) -> (Term, LogIndex, Term) {
        core.role = Role::Candidate;
        core.current_term += 1;
        core.voted_for = Some(self.me);
        core.leader_id = None;
        core.leader = None;
        self.reset_election_timer(core);

        if let Err(e) = self.persist_core(core) {
            error!(node_id = self.me, error = %e, "failed to persist candidacy");
        }

        info!(
            node_id = self.me,
            term = core.current_term,
            "election timeout, starting election"
        );
        (core.current_term, core.log.last_index(), core.log.last_term())
    }

    fn solicit_votes(self: &Arc<Self>, term: Term, last_log_index: LogIndex, last_log_term: Term) {
        // Vote for self; a single-node cluster wins on the spot.
        let votes = Arc::new(AtomicUsize::new(1));
        if self.quorum() <= 1 {
            let became_leader = {
                let mut core = self.core.lock();
                if core.role.is_candidate() && core.current_term == term {
                    self.promote_to_leader(&mut core);
                    true
                } else {
                    false
                }
            };
            if became_leader {
                self.broadcast_entries();
            }
            return;
        }

        for &peer in &self.peers {
            let node = Arc::clone(self);
            let votes = Arc::clone(&votes);
            let request = RequestVoteRequest {
                term,
                candidate_id: self.me,
                last_log_index,
                last_log_term,
            };
            tokio::spawn(async move {
                let reply = match timeout(
                    node.config.vote_rpc_timeout(),
                    node.rpc.request_vote(peer, request),
                )
                .await
                {
                    Ok(Ok(reply)) => reply,
                    Ok(Err(e)) => {
                        debug!(node_id = node.me, peer, error = %e, "vote request failed");
                        return;
                    }
                    Err(_) => {
                        debug!(node_id = node.me, peer, "vote request timed out");
                        return;
                    }
                };
                node.on_vote_reply(peer, term, reply, &votes);
            });
        }
    }

    fn on_vote_reply(
        self: &Arc<Self>,
        peer: NodeId,
        term: Term,
        reply: RequestVoteResponse,
        votes: &AtomicUsize,
    ) {
        let became_leader = {
            let mut core = self.core.lock();

            if reply.term > core.current_term {
                self.step_down(&mut core, reply.term);
                if let Err(e) = self.persist_core(&core) {
                    error!(node_id = self.me, error = %e, "failed to persist step-down");
                }
                false
            } else if !core.role.is_candidate() || core.current_term != term || !reply.vote_granted
            {
                false
            } else {
                let count = votes.fetch_add(1, Ordering::SeqCst) + 1;
                debug!(node_id = self.me, voter = peer, count, "received vote");
                if count == self.quorum() {
                    self.promote_to_leader(&mut core);
                    true
                } else {
                    false
                }
            }
        };

        if became_leader {
            // Assert leadership immediately rather than waiting a tick.
            self.broadcast_entries();
        }
    }

    fn promote_to_leader(&self, core: &mut RaftCore) {
        core.role = Role::Leader;
        core.leader_id = Some(self.me);
        core.leader = Some(LeaderState::new(&self.peers, core.log.last_index()));
        info!(
            node_id = self.me,
            term = core.current_term,
            last_index = core.log.last_index(),
            "won election, became leader"
        );
    }

    // ---------------------------------------------------------------------
    // Replication
    // ---------------------------------------------------------------------

    /// Build one outbound message per peer under the lock, then dispatch
    /// them on detached tasks. A peer whose next index is already covered
    /// by the snapshot gets the snapshot instead of entries.
    fn broadcast_entries(self: &Arc<Self>) {
        let mut outbound: Vec<(NodeId, Outbound)> = Vec::new();
        {
            let core = self.core.lock();
            if !core.role.is_leader() {
                return;
            }
            let leader = match core.leader.as_ref() {
                Some(leader) => leader,
                None => return,
            };

            for &peer in &self.peers {
                let next = leader.next_index.get(&peer).copied().unwrap_or(1);

                if next <= core.log.last_snapshot_index() {
                    let data = match self.persister.read_snapshot() {
                        Ok(Some(data)) => data,
                        Ok(None) => {
                            warn!(node_id = self.me, peer, "peer needs a snapshot but none is persisted");
                            continue;
                        }
                        Err(e) => {
                            error!(node_id = self.me, peer, error = %e, "failed to read snapshot");
                            continue;
                        }
                    };
                    outbound.push((
                        peer,
                        Outbound::Snapshot(InstallSnapshotRequest {
                            term: core.current_term,
                            leader_id: self.me,
                            last_included_index: core.log.last_snapshot_index(),
                            last_included_term: core.log.last_snapshot_term(),
                            data,
                        }),
                    ));
                    continue;
                }

                let prev_log_index = next - 1;
                let prev_log_term = match core.log.term_at(prev_log_index) {
                    Some(term) => term,
                    None => {
                        warn!(node_id = self.me, peer, next, "next index beyond log end");
                        continue;
                    }
                };
                outbound.push((
                    peer,
                    Outbound::Append(AppendEntriesRequest {
                        term: core.current_term,
                        leader_id: self.me,
                        prev_log_index,
                        prev_log_term,
                        entries: core.log.entries_from(next, self.config.max_entries_per_append),
                        leader_commit: core.commit_index,
                    }),
                ));
            }
        }

        for (peer, message) in outbound {
            let node = Arc::clone(self);
            match message {
                Outbound::Append(request) => {
                    tokio::spawn(node.dispatch_append(peer, request));
                }
                Outbound::Snapshot(request) => {
                    tokio::spawn(node.dispatch_snapshot(peer, request));
                }
            }
        }
    }

    async fn dispatch_append(self: Arc<Self>, peer: NodeId, request: AppendEntriesRequest) {
        let reply = match timeout(
            self.config.append_rpc_timeout(),
            self.rpc.append_entries(peer, request.clone()),
        )
        .await
        {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                debug!(node_id = self.me, peer, error = %e, "append dispatch failed");
                return;
            }
            Err(_) => {
                debug!(node_id = self.me, peer, "append dispatch timed out");
                return;
            }
        };
        self.on_append_reply(peer, &request, reply);
    }

    fn on_append_reply(
        &self,
        peer: NodeId,
        request: &AppendEntriesRequest,
        reply: AppendEntriesResponse,
    ) {
        let mut core = self.core.lock();

        if reply.term > core.current_term {
            self.step_down(&mut core, reply.term);
            if let Err(e) = self.persist_core(&core) {
                error!(node_id = self.me, error = %e, "failed to persist step-down");
            }
            return;
        }
        if !core.role.is_leader() || core.current_term != request.term {
            return;
        }

        if reply.success {
            let match_index = request.prev_log_index + request.entries.len() as u64;
            if let Some(leader) = core.leader.as_mut() {
                leader.record_match(peer, match_index);
            }
            self.advance_commit(&mut core);
            return;
        }

        // Accelerated back-off: jump next_index using the follower's hint.
        let next = if let Some(conflict_term) = reply.conflict_term {
            match core.log.last_index_with_term(conflict_term) {
                Some(index) => index,
                None => reply.conflict_index.unwrap_or(request.prev_log_index),
            }
        } else if let Some(conflict_index) = reply.conflict_index {
            conflict_index
        } else {
            request.prev_log_index
        };
        let next = next.min(request.prev_log_index);

        if let Some(leader) = core.leader.as_mut() {
            leader.rewind_next(peer, next);
        }
        debug!(node_id = self.me, peer, next, "rewound next index after rejection");
    }

    /// Advance the commit index to the highest quorum-replicated entry of
    /// the current term. Entries from prior terms commit only indirectly.
    fn advance_commit(&self, core: &mut RaftCore) {
        let leader = match core.leader.as_ref() {
            Some(leader) => leader,
            None => return,
        };

        let candidate = leader.quorum_match_index(core.log.last_index(), self.quorum());
        if candidate > core.commit_index && core.log.term_at(candidate) == Some(core.current_term) {
            core.commit_index = candidate;
            debug!(node_id = self.me, commit_index = candidate, "advanced commit index");
        }
    }

    async fn dispatch_snapshot(self: Arc<Self>, peer: NodeId, request: InstallSnapshotRequest) {
        let reply = match timeout(
            self.config.append_rpc_timeout(),
            self.rpc.install_snapshot(peer, request.clone()),
        )
        .await
        {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                debug!(node_id = self.me, peer, error = %e, "snapshot dispatch failed");
                return;
            }
            Err(_) => {
                debug!(node_id = self.me, peer, "snapshot dispatch timed out");
                return;
            }
        };

        let mut core = self.core.lock();
        if reply.term > core.current_term {
            self.step_down(&mut core, reply.term);
            if let Err(e) = self.persist_core(&core) {
                error!(node_id = self.me, error = %e, "failed to persist step-down");
            }
            return;
        }
        if !core.role.is_leader() || core.current_term != request.term {
            return;
        }
        if let Some(leader) = core.leader.as_mut() {
            leader.record_match(peer, request.last_included_index);
        }
        self.advance_commit(&mut core);
        debug!(
            node_id = self.me,
            peer,
            index = request.last_included_index,
            "peer caught up via snapshot"
        );
    }

    // ---------------------------------------------------------------------
    // RPC handlers (receiver side)
    // ---------------------------------------------------------------------

    /// Receiver-side RequestVote.
    pub fn handle_request_vote(&self, request: RequestVoteRequest) -> RequestVoteResponse {
        let mut core = self.core.lock();

        if request.term < core.current_term {
            return RequestVoteResponse {
                term: core.current_term,
                vote_granted: false,
            };
        }

        let mut changed = false;
        if request.term > core.current_term {
            self.step_down(&mut core, request.term);
            changed = true;
        }

        let can_vote = core
            .voted_for
            .map_or(true, |voted| voted == request.candidate_id);
        let up_to_date = core
            .log
            .is_up_to_date(request.last_log_index, request.last_log_term);
        let vote_granted = can_vote && up_to_date;

        if vote_granted {
            core.voted_for = Some(request.candidate_id);
            self.reset_election_timer(&mut core);
            changed = true;
        }

        if changed {
            if let Err(e) = self.persist_core(&core) {
                error!(node_id = self.me, error = %e, "failed to persist vote");
                return RequestVoteResponse {
                    term: core.current_term,
                    vote_granted: false,
                };
            }
        }

        debug!(
            node_id = self.me,
            candidate = request.candidate_id,
            term = request.term,
            vote_granted,
            "handled vote request"
        );
        RequestVoteResponse {
            term: core.current_term,
            vote_granted,
        }
    }

    /// Receiver-side AppendEntries.
    pub fn handle_append_entries(&self, request: AppendEntriesRequest) -> AppendEntriesResponse {
        let mut core = self.core.lock();

        if request.term < core.current_term {
            return AppendEntriesResponse::rejected(core.current_term);
        }

        let mut changed = false;
        if request.term > core.current_term {
            self.step_down(&mut core, request.term);
            changed = true;
        } else if core.role.is_candidate() {
            // A leader of our own term exists; fall in line but keep our
            // vote, which elected it.
            core.role = Role::Follower;
            core.leader = None;
        }

        core.leader_id = Some(request.leader_id);
        self.reset_election_timer(&mut core);

        if request.prev_log_index > core.log.last_index() {
            // We are missing the whole prefix; point the leader at our end.
            if changed {
                if let Err(e) = self.persist_core(&core) {
                    error!(node_id = self.me, error = %e, "failed to persist adopted term");
                }
            }
            return AppendEntriesResponse {
                term: core.current_term,
                success: false,
                conflict_term: None,
                conflict_index: Some(core.log.last_index() + 1),
            };
        }

        // A prefix older than our snapshot is already committed here; keep
        // only the portion of the batch we have not yet compacted away.
        let mut entries = request.entries;
        let mut prev_log_index = request.prev_log_index;
        let mut prev_log_term = request.prev_log_term;
        let snapshot_index = core.log.last_snapshot_index();
        if prev_log_index < snapshot_index {
            entries.retain(|entry| entry.index > snapshot_index);
            prev_log_index = snapshot_index;
            prev_log_term = core.log.last_snapshot_term();
        }

        if !core.log.matches(prev_log_index, prev_log_term) {
            let conflict_term = core.log.term_at(prev_log_index);
            let conflict_index = match conflict_term {
                Some(term) => core.log.first_index_with_term(term, prev_log_index),
                None => core.log.last_index() + 1,
            };
            if changed {
                if let Err(e) = self.persist_core(&core) {
                    error!(node_id = self.me, error = %e, "failed to persist adopted term");
                }
            }
            return AppendEntriesResponse {
                term: core.current_term,
                success: false,
                conflict_term,
                conflict_index: Some(conflict_index),
            };
        }

        for entry in entries {
            if entry.index <= core.log.last_index() {
                if core.log.term_at(entry.index) == Some(entry.term) {
                    continue;
                }
                // Conflicting suffix: ours loses.
                core.log.truncate_from(entry.index);
            }
            if let Err(e) = core.log.append(entry) {
                error!(node_id = self.me, error = %e, "failed to append replicated entry");
                return AppendEntriesResponse::rejected(core.current_term);
            }
            changed = true;
        }

        if changed {
            if let Err(e) = self.persist_core(&core) {
                error!(node_id = self.me, error = %e, "failed to persist replicated entries");
                return AppendEntriesResponse::rejected(core.current_term);
            }
        }

        if request.leader_commit > core.commit_index {
            core.commit_index = request.leader_commit.min(core.log.last_index());
        }

        AppendEntriesResponse {
            term: core.current_term,
            success: true,
            conflict_term: None,
            conflict_index: None,
        }
    }

    /// Receiver-side InstallSnapshot.
    pub fn handle_install_snapshot(
        &self,
        request: InstallSnapshotRequest,
    ) -> InstallSnapshotResponse {
        let (term, apply_msg) = {
            let mut core = self.core.lock();

            if request.term < core.current_term {
                return InstallSnapshotResponse {
                    term: core.current_term,
                };
            }

            let mut changed = false;
            if request.term > core.current_term {
                self.step_down(&mut core, request.term);
                changed = true;
            } else if core.role.is_candidate() {
                core.role = Role::Follower;
                core.leader = None;
            }
            core.leader_id = Some(request.leader_id);
            self.reset_election_timer(&mut core);

            if request.last_included_index <= core.commit_index {
                // Everything the snapshot covers is already committed here.
                if changed {
                    if let Err(e) = self.persist_core(&core) {
                        error!(node_id = self.me, error = %e, "failed to persist adopted term");
                    }
                }
                return InstallSnapshotResponse {
                    term: core.current_term,
                };
            }

            core.log
                .install_snapshot(request.last_included_index, request.last_included_term);
            core.commit_index = core.commit_index.max(request.last_included_index);
            core.last_applied = core.last_applied.max(request.last_included_index);

            if let Err(e) = self.persist_with_snapshot(&core, &request.data) {
                error!(node_id = self.me, error = %e, "failed to persist installed snapshot");
                return InstallSnapshotResponse {
                    term: core.current_term,
                };
            }

            info!(
                node_id = self.me,
                index = request.last_included_index,
                term = request.last_included_term,
                "installed snapshot from leader"
            );

            (
                core.current_term,
                ApplyMsg::Snapshot {
                    index: request.last_included_index,
                    term: request.last_included_term,
                    data: request.data,
                },
            )
        };

        // Channel send happens outside the lock.
        let _ = self.apply_tx.send(apply_msg);
        InstallSnapshotResponse { term }
    }

    // ---------------------------------------------------------------------
    // Shared helpers
    // ---------------------------------------------------------------------

    fn step_down(&self, core: &mut RaftCore, term: Term) {
        if term > core.current_term {
            core.voted_for = None;
        }
        core.role = Role::Follower;
        core.current_term = term;
        core.leader = None;
        core.leader_id = None;
        info!(node_id = self.me, term, "stepped down to follower");
    }

    fn reset_election_timer(&self, core: &mut RaftCore) {
        let jitter = rand::thread_rng()
            .gen_range(self.config.election_timeout_min..=self.config.election_timeout_max);
        core.election_deadline = Instant::now() + jitter;
    }

    fn quorum(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    fn persist_core(&self, core: &RaftCore) -> Result<()> {
        let state = self.durable_state(core).encode()?;
        self.persister.save_state(&state)
    }

    fn persist_with_snapshot(&self, core: &RaftCore, snapshot: &[u8]) -> Result<()> {
        let state = self.durable_state(core).encode()?;
        self.persister.save_state_and_snapshot(&state, snapshot)
    }

    fn durable_state(&self, core: &RaftCore) -> DurableState {
        DurableState {
            current_term: core.current_term,
            voted_for: core.voted_for,
            last_snapshot_index: core.log.last_snapshot_index(),
            last_snapshot_term: core.log.last_snapshot_term(),
            entries: core.log.entries_vec(),
        }
    }
}

impl Drop for RaftNode {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::persist::MemPersister;

    struct UnreachableRpc;

    #[async_trait::async_trait]
    impl RaftRpc for UnreachableRpc {
        async fn request_vote(
            &self,
            target: NodeId,
            _request: RequestVoteRequest,
        ) -> Result<RequestVoteResponse> {
            Err(BallastError::Unavailable(format!("peer {}", target)))
        }

        async fn append_entries(
            &self,
            target: NodeId,
            _request: AppendEntriesRequest,
        ) -> Result<AppendEntriesResponse> {
            Err(BallastError::Unavailable(format!("peer {}", target)))
        }

        async fn install_snapshot(
            &self,
            target: NodeId,
            _request: InstallSnapshotRequest,
        ) -> Result<InstallSnapshotResponse> {
            Err(BallastError::Unavailable(format!("peer {}", target)))
        }
    }

    fn test_node(
        me: NodeId,
        peers: Vec<NodeId>,
    ) -> (Arc<RaftNode>, mpsc::UnboundedReceiver<ApplyMsg>) {
        let (apply_tx, apply_rx) = mpsc::unbounded_channel();
        let node = RaftNode::new(
            RaftConfig::default(),
            me,
            peers,
            Arc::new(UnreachableRpc),
            Arc::new(MemPersister::new()),
            apply_tx,
        )
        .unwrap();
        (node, apply_rx)
    }

    #[tokio::test]
    async fn test_starts_as_follower() {
        let (node, _rx) = test_node(1, vec![2, 3]);
        let (term, is_leader) = node.get_state();
        assert_eq!(term, 0);
        assert!(!is_leader);
    }

    #[tokio::test]
    async fn test_propose_on_follower_is_rejected() {
        let (node, _rx) = test_node(1, vec![2, 3]);
        let err = node.propose(b"x".to_vec()).unwrap_err();
        assert!(matches!(err, BallastError::NotLeader { .. }));
    }

    #[tokio::test]
    async fn test_single_node_elects_and_applies() {
        let (node, mut rx) = test_node(1, vec![]);
        node.run();

        let deadline = Instant::now() + std::time::Duration::from_secs(2);
        loop {
            if node.get_state().1 {
                break;
            }
            assert!(Instant::now() < deadline, "no leader within 2s");
            sleep(std::time::Duration::from_millis(20)).await;
        }

        let (index, _term) = node.propose(b"hello".to_vec()).unwrap();
        assert_eq!(index, 1);

        let msg = timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("apply within 2s")
            .expect("channel open");
        match msg {
            ApplyMsg::Command { index, data, .. } => {
                assert_eq!(index, 1);
                assert_eq!(data.as_slice(), b"hello");
            }
            other => panic!("unexpected apply message: {:?}", other),
        }
        node.kill();
    }

    #[tokio::test]
    async fn test_vote_granting_and_term_adoption() {
        let (node, _rx) = test_node(1, vec![2, 3]);

        let reply = node.handle_request_vote(RequestVoteRequest {
            term: 3,
            candidate_id: 2,
            last_log_index: 0,
            last_log_term: 0,
        });
        assert!(reply.vote_granted);
        assert_eq!(reply.term, 3);

        // Same term, different candidate: the vote is spoken for.
        let reply = node.handle_request_vote(RequestVoteRequest {
            term: 3,
            candidate_id: 3,
            last_log_index: 5,
            last_log_term: 3,
        });
        assert!(!reply.vote_granted);

        // Stale term is rejected outright.
        let reply = node.handle_request_vote(RequestVoteRequest {
            term: 1,
            candidate_id: 3,
            last_log_index: 9,
            last_log_term: 1,
        });
        assert!(!reply.vote_granted);
        assert_eq!(reply.term, 3);
    }

    #[tokio::test]
    async fn test_vote_denied_to_stale_log() {
        let (node, _rx) = test_node(1, vec![2, 3]);

        node.handle_append_entries(AppendEntriesRequest {
            term: 2,
            leader_id: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![LogEntry::new(2, 1, b"a".to_vec()), LogEntry::new(2, 2, b"b".to_vec())],
            leader_commit: 0,
        });

        let reply = node.handle_request_vote(RequestVoteRequest {
            term: 3,
            candidate_id: 3,
            last_log_index: 1,
            last_log_term: 2,
        });
        assert!(!reply.vote_granted, "shorter log must not win the vote");
    }

    #[tokio::test]
    async fn test_append_entries_first_contact() {
        let (node, _rx) = test_node(1, vec![2, 3]);

        let reply = node.handle_append_entries(AppendEntriesRequest {
            term: 1,
            leader_id: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![LogEntry::new(1, 1, b"x".to_vec())],
            leader_commit: 1,
        });
        assert!(reply.success);

        let (term, is_leader) = node.get_state();
        assert_eq!(term, 1);
        assert!(!is_leader);
        assert_eq!(node.leader_hint(), Some(2));
    }

    #[tokio::test]
    async fn test_append_entries_gap_returns_hint() {
        let (node, _rx) = test_node(1, vec![2, 3]);

        let reply = node.handle_append_entries(AppendEntriesRequest {
            term: 1,
            leader_id: 2,
            prev_log_index: 5,
            prev_log_term: 1,
            entries: vec![],
            leader_commit: 0,
        });
        assert!(!reply.success);
        assert_eq!(reply.conflict_index, Some(1));
        assert_eq!(reply.conflict_term, None);
    }

    #[tokio::test]
    async fn test_append_entries_conflict_truncates() {
        let (node, _rx) = test_node(1, vec![2, 3]);

        node.handle_append_entries(AppendEntriesRequest {
            term: 1,
            leader_id: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![LogEntry::new(1, 1, b"a".to_vec()), LogEntry::new(1, 2, b"old".to_vec())],
            leader_commit: 1,
        });

        // A new leader overwrites the uncommitted tail.
        let reply = node.handle_append_entries(AppendEntriesRequest {
            term: 2,
            leader_id: 3,
            prev_log_index: 1,
            prev_log_term: 1,
            entries: vec![LogEntry::new(2, 2, b"new".to_vec())],
            leader_commit: 2,
        });
        assert!(reply.success);

        let core = node.core.lock();
        assert_eq!(core.log.last_index(), 2);
        assert_eq!(core.log.get(2).unwrap().data_bytes(), b"new");
        assert_eq!(core.commit_index, 2);
    }

    #[tokio::test]
    async fn test_install_snapshot_stale_is_ignored() {
        let (node, mut rx) = test_node(1, vec![2, 3]);

        node.handle_append_entries(AppendEntriesRequest {
            term: 1,
            leader_id: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![
                LogEntry::new(1, 1, b"a".to_vec()),
                LogEntry::new(1, 2, b"b".to_vec()),
                LogEntry::new(1, 3, b"c".to_vec()),
            ],
            leader_commit: 3,
        });

        let reply = node.handle_install_snapshot(InstallSnapshotRequest {
            term: 1,
            leader_id: 2,
            last_included_index: 2,
            last_included_term: 1,
            data: b"stale".to_vec(),
        });
        assert_eq!(reply.term, 1);
        assert!(rx.try_recv().is_err(), "stale snapshot must not be delivered");
    }

    #[tokio::test]
    async fn test_install_snapshot_replaces_log() {
        let (node, mut rx) = test_node(1, vec![2, 3]);

        node.handle_append_entries(AppendEntriesRequest {
            term: 1,
            leader_id: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![LogEntry::new(1, 1, b"a".to_vec())],
            leader_commit: 1,
        });

        node.handle_install_snapshot(InstallSnapshotRequest {
            term: 1,
            leader_id: 2,
            last_included_index: 10,
            last_included_term: 1,
            data: b"snap".to_vec(),
        });

        match rx.try_recv().unwrap() {
            ApplyMsg::Snapshot { index, data, .. } => {
                assert_eq!(index, 10);
                assert_eq!(data, b"snap");
            }
            other => panic!("unexpected apply message: {:?}", other),
        }

        let core = node.core.lock();
        assert_eq!(core.log.last_index(), 10);
        assert_eq!(core.commit_index, 10);
        assert_eq!(core.last_applied, 10);
        assert!(core.log.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_boundary_append_succeeds() {
        let (node, _rx) = test_node(1, vec![2, 3]);

        node.handle_install_snapshot(InstallSnapshotRequest {
            term: 1,
            leader_id: 2,
            last_included_index: 4,
            last_included_term: 1,
            data: b"snap".to_vec(),
        });

        // prev_log_index sitting exactly on the snapshot point must succeed
        // when the terms agree.
        let reply = node.handle_append_entries(AppendEntriesRequest {
            term: 1,
            leader_id: 2,
            prev_log_index: 4,
            prev_log_term: 1,
            entries: vec![LogEntry::new(1, 5, b"e".to_vec())],
            leader_commit: 5,
        });
        assert!(reply.success);

        let core = node.core.lock();
        assert_eq!(core.log.last_index(), 5);
    }

    #[tokio::test]
    async fn test_service_snapshot_compacts_and_restores() {
        let (apply_tx, _apply_rx) = mpsc::unbounded_channel();
        let persister = Arc::new(MemPersister::new());
        let node = RaftNode::new(
            RaftConfig::default(),
            1,
            vec![2, 3],
            Arc::new(UnreachableRpc),
            Arc::clone(&persister) as Arc<dyn Persister>,
            apply_tx,
        )
        .unwrap();

        node.handle_append_entries(AppendEntriesRequest {
            term: 1,
            leader_id: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![
                LogEntry::new(1, 1, b"a".to_vec()),
                LogEntry::new(1, 2, b"b".to_vec()),
                LogEntry::new(1, 3, b"c".to_vec()),
            ],
            leader_commit: 2,
        });

        node.snapshot(2, b"service state".to_vec()).unwrap();
        {
            let core = node.core.lock();
            assert_eq!(core.log.last_snapshot_index(), 2);
            assert_eq!(core.log.len(), 1);
        }

        // A rebuilt node picks the compacted log back up.
        let (apply_tx, mut apply_rx) = mpsc::unbounded_channel();
        let restarted = RaftNode::new(
            RaftConfig::default(),
            1,
            vec![2, 3],
            Arc::new(UnreachableRpc),
            persister as Arc<dyn Persister>,
            apply_tx,
        )
        .unwrap();
        restarted.run();

        match apply_rx.recv().await.unwrap() {
            ApplyMsg::Snapshot { index, data, .. } => {
                assert_eq!(index, 2);
                assert_eq!(data, b"service state");
            }
            other => panic!("unexpected apply message: {:?}", other),
        }
        let core = restarted.core.lock();
        assert_eq!(core.log.last_index(), 3);
        assert_eq!(core.current_term, 1);
        restarted.kill();
    }
}
