//! Configuration for ballast nodes.

use crate::error::{BallastError, Result};
use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Timing and batching knobs for the consensus core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftConfig {
    /// Minimum election timeout.
    pub election_timeout_min: Duration,
    /// Maximum election timeout.
    pub election_timeout_max: Duration,
    /// Heartbeat interval.
    pub heartbeat_interval: Duration,
    /// How long the applier sleeps when no committed entries are pending.
    pub apply_interval: Duration,
    /// Maximum entries per AppendEntries RPC.
    pub max_entries_per_append: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            apply_interval: Duration::from_millis(10),
            max_entries_per_append: 100,
        }
    }
}

impl RaftConfig {
    /// Timeout for a single AppendEntries or InstallSnapshot dispatch.
    /// A timed-out call counts as no reply and is retried on the next tick.
    pub fn append_rpc_timeout(&self) -> Duration {
        self.heartbeat_interval
    }

    /// Timeout for a single RequestVote dispatch.
    pub fn vote_rpc_timeout(&self) -> Duration {
        self.election_timeout_min / 2
    }
}

/// Full configuration for one node of a ballast cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This node's ID. Must be non-zero.
    pub node_id: NodeId,
    /// Peer node IDs (excluding this node).
    pub peers: Vec<NodeId>,
    /// Directory for the durable raft state and snapshot.
    pub data_dir: PathBuf,
    /// Persisted-state size (bytes) above which the service takes a snapshot.
    /// Zero disables service-initiated snapshots.
    pub snapshot_threshold: usize,
    /// Log filter, e.g. "info" or "ballast=debug".
    pub log_level: String,
    /// Consensus timing configuration.
    pub raft: RaftConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            peers: Vec::new(),
            data_dir: PathBuf::from("/tmp/ballast"),
            snapshot_threshold: 0,
            log_level: "info".to_string(),
            raft: RaftConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BallastError::Config(format!("failed to read config file: {}", e)))?;

        let config: Self = serde_json::from_str(&content)
            .map_err(|e| BallastError::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.node_id == 0 {
            return Err(BallastError::InvalidConfig {
                field: "node_id".to_string(),
                reason: "node ID must be non-zero".to_string(),
            });
        }

        if self.peers.contains(&self.node_id) {
            return Err(BallastError::InvalidConfig {
                field: "peers".to_string(),
                reason: "peer list must not contain the node itself".to_string(),
            });
        }

        if self.raft.election_timeout_min > self.raft.election_timeout_max {
            return Err(BallastError::InvalidConfig {
                field: "raft.election_timeout_min".to_string(),
                reason: "election timeout window is inverted".to_string(),
            });
        }

        if self.raft.heartbeat_interval >= self.raft.election_timeout_min {
            return Err(BallastError::InvalidConfig {
                field: "raft.heartbeat_interval".to_string(),
                reason: "heartbeat interval must be below the election timeout".to_string(),
            });
        }

        if self.raft.max_entries_per_append == 0 {
            return Err(BallastError::InvalidConfig {
                field: "raft.max_entries_per_append".to_string(),
                reason: "batch size must be non-zero".to_string(),
            });
        }

        Ok(())
    }
}
