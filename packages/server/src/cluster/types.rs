//! Cluster domain types: heartbeats, per-node state, and configuration.
//!
//! These types form the gossip subsystem's data model. Versions across the
//! heartbeat and all application-state entries of one node are drawn from the
//! same monotonic counter, which is what makes `max_version` well defined and
//! digest comparison sound.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use lodestone_core::NodeId;

// ---------------------------------------------------------------------------
// Well-known application-state keys
// ---------------------------------------------------------------------------

/// Keys the database publishes about itself. Unknown keys received from newer
/// nodes are stored and relayed verbatim.
pub mod state_keys {
    /// Node lifecycle status (joining, normal, leaving).
    pub const STATUS: &str = "status";
    /// Storage load indicator used by the balancer.
    pub const LOAD: &str = "load";
    /// Whether the SQL frontend accepts client sessions.
    pub const RPC_READY: &str = "rpc_ready";
}

// ---------------------------------------------------------------------------
// Heartbeat
// ---------------------------------------------------------------------------

/// Process-incarnation generation plus a per-node monotonic version counter.
///
/// The derived ordering is lexicographic over `(generation, version)`:
/// a restart (new generation) outranks any version reached by the previous
/// incarnation. Generations are wall-clock seconds at boot and therefore stay
/// within 63 bits; wraparound is not a case the comparison needs to handle.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Heartbeat {
    pub generation: u64,
    pub version: u64,
}

impl Heartbeat {
    /// Starting heartbeat for a fresh incarnation.
    #[must_use]
    pub fn starting(generation: u64) -> Self {
        Self {
            generation,
            version: 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Application state
// ---------------------------------------------------------------------------

/// One application-state cell: opaque value bytes stamped with the version
/// the owning node's counter held when the cell was written.
///
/// Cells that participate in MVCC carry bytes produced by the
/// `VersionedValueCodec`; the gossip layer never looks inside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedEntry {
    pub value: Vec<u8>,
    pub version: u64,
}

// ---------------------------------------------------------------------------
// NodeState
// ---------------------------------------------------------------------------

/// Everything the local node knows about one cluster member.
///
/// `is_alive` and `last_seen_ms` are local judgments (failure detector
/// output); they never travel on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    pub heartbeat: Heartbeat,
    pub application: HashMap<String, VersionedEntry>,
    pub is_alive: bool,
    pub last_seen_ms: u64,
}

impl NodeState {
    /// Zero-heartbeat placeholder created on first observation of a node.
    #[must_use]
    pub fn unknown() -> Self {
        Self {
            heartbeat: Heartbeat::default(),
            application: HashMap::new(),
            is_alive: true,
            last_seen_ms: 0,
        }
    }

    /// Fresh state for the local incarnation.
    #[must_use]
    pub fn starting(generation: u64, now_ms: u64) -> Self {
        Self {
            heartbeat: Heartbeat::starting(generation),
            application: HashMap::new(),
            is_alive: true,
            last_seen_ms: now_ms,
        }
    }

    /// Greatest version across the heartbeat and all application entries.
    ///
    /// Well defined because all versions of a node come from one counter.
    #[must_use]
    pub fn max_version(&self) -> u64 {
        self.application
            .values()
            .map(|entry| entry.version)
            .fold(self.heartbeat.version, u64::max)
    }

    /// Copy containing only the fragments newer than `floor`.
    ///
    /// The heartbeat is always carried so the receiver can anchor the
    /// generation the fragments belong to.
    #[must_use]
    pub fn fragments_above(&self, floor: u64) -> Self {
        Self {
            heartbeat: self.heartbeat,
            application: self
                .application
                .iter()
                .filter(|(_, entry)| entry.version > floor)
                .map(|(key, entry)| (key.clone(), entry.clone()))
                .collect(),
            is_alive: self.is_alive,
            last_seen_ms: self.last_seen_ms,
        }
    }
}

// ---------------------------------------------------------------------------
// ClusterHealth
// ---------------------------------------------------------------------------

/// Point-in-time membership summary for diagnostics and the sim binary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterHealth {
    pub node_count: usize,
    pub live_nodes: usize,
    pub unreachable_nodes: usize,
    pub local_generation: u64,
    pub local_heartbeat_version: u64,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Configuration for the phi-accrual failure detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhiAccrualConfig {
    /// Suspicion value at which a node is considered down.
    pub phi_threshold: f64,
    /// Maximum number of heartbeat intervals retained in the sample window.
    pub max_sample_size: usize,
    /// Floor for standard deviation, preventing false positives from very
    /// regular heartbeats (ms).
    pub min_std_dev_ms: u64,
    /// Silence duration treated as certain failure while the window is still
    /// too small for statistics (ms).
    pub max_no_heartbeat_ms: u64,
}

impl Default for PhiAccrualConfig {
    fn default() -> Self {
        Self {
            phi_threshold: 8.0,
            max_sample_size: 200,
            min_std_dev_ms: 100,
            max_no_heartbeat_ms: 8000,
        }
    }
}

/// Configuration for the gossip subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipConfig {
    /// Human-readable cluster name, logged at startup.
    pub cluster_name: String,
    /// Seed nodes probed when the live set is empty or by seed lottery.
    pub seeds: Vec<NodeId>,
    /// Gossip period: one selection round per tick (ms).
    pub gossip_interval_ms: u64,
    /// Soft deadline after which an in-flight round is abandoned (ms).
    pub round_timeout_ms: u64,
    /// Mailbox depth for inbound packets and timer events.
    pub mailbox_capacity: usize,
    /// Optional path of the persisted generation floor; `None` relies on
    /// clock resolution alone.
    pub generation_floor_path: Option<std::path::PathBuf>,
    /// Failure detector tuning.
    pub phi: PhiAccrualConfig,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            cluster_name: "lodestone".to_string(),
            seeds: Vec::new(),
            gossip_interval_ms: 1000,
            round_timeout_ms: 2000,
            mailbox_capacity: 1024,
            generation_floor_path: None,
            phi: PhiAccrualConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
