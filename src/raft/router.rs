//! In-process transport connecting nodes within one process.
//!
//! Used by the integration tests and the demo binary. Each node holds a
//! [`RouterHandle`] as its peer stub; the router dispatches calls straight
//! into the target node's handlers. Links can be cut and restored to stage
//! network partitions.

use super::node::RaftNode;
use super::rpc::*;
use crate::error::{BallastError, Result};
use crate::types::NodeId;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Message router for an in-process cluster.
#[derive(Default)]
pub struct LocalRouter {
    nodes: RwLock<HashMap<NodeId, Arc<RaftNode>>>,
    /// Directed links currently cut.
    cuts: RwLock<HashSet<(NodeId, NodeId)>>,
}

impl LocalRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `node` reachable under `id`. Replaces any previous registration,
    /// which is how a restarted node takes over its predecessor's address.
    pub fn register(&self, id: NodeId, node: Arc<RaftNode>) {
        self.nodes.write().insert(id, node);
    }

    /// Remove a node from the network entirely (a crash, as opposed to a
    /// partition).
    pub fn deregister(&self, id: NodeId) {
        self.nodes.write().remove(&id);
    }

    /// The peer stub a node uses to reach the rest of the cluster.
    pub fn handle(self: &Arc<Self>, origin: NodeId) -> Arc<RouterHandle> {
        Arc::new(RouterHandle {
            router: Arc::clone(self),
            origin,
        })
    }

    /// Cut every link to and from `id`.
    pub fn disconnect(&self, id: NodeId) {
        let ids: Vec<NodeId> = self.nodes.read().keys().copied().collect();
        let mut cuts = self.cuts.write();
        for other in ids {
            cuts.insert((id, other));
            cuts.insert((other, id));
        }
    }

    /// Restore every link to and from `id`.
    pub fn reconnect(&self, id: NodeId) {
        self.cuts.write().retain(|(a, b)| *a != id && *b != id);
    }

    /// Split the cluster into two halves that cannot reach each other.
    pub fn partition(&self, side_a: &[NodeId], side_b: &[NodeId]) {
        let mut cuts = self.cuts.write();
        for &a in side_a {
            for &b in side_b {
                cuts.insert((a, b));
                cuts.insert((b, a));
            }
        }
    }

    /// Heal all partitions.
    pub fn heal(&self) {
        self.cuts.write().clear();
    }

    fn lookup(&self, origin: NodeId, target: NodeId) -> Result<Arc<RaftNode>> {
        if self.cuts.read().contains(&(origin, target)) {
            return Err(BallastError::Unavailable(format!(
                "link {} -> {} is cut",
                origin, target
            )));
        }
        self.nodes
            .read()
            .get(&target)
            .cloned()
            .ok_or(BallastError::NodeNotFound(target))
    }
}

/// A node's view of the router.
pub struct RouterHandle {
    router: Arc<LocalRouter>,
    origin: NodeId,
}

#[async_trait::async_trait]
impl RaftRpc for RouterHandle {
    async fn request_vote(
        &self,
        target: NodeId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        let node = self.router.lookup(self.origin, target)?;
        Ok(node.handle_request_vote(request))
    }

    async fn append_entries(
        &self,
        target: NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let node = self.router.lookup(self.origin, target)?;
        Ok(node.handle_append_entries(request))
    }

    async fn install_snapshot(
        &self,
        target: NodeId,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let node = self.router.lookup(self.origin, target)?;
        Ok(node.handle_install_snapshot(request))
    }
}
