//! Gossip service traits.
//!
//! Seams between the gossip executor and its collaborators: outbound
//! transport, clock, failure detection, and the membership surface exposed to
//! the rest of the database. Transport framing, socket loops, and connection
//! management live outside this crate; only these contracts are consumed.

use std::collections::HashSet;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::sync::mpsc;

use lodestone_core::NodeId;

use super::state::ClusterChange;
use super::types::ClusterHealth;

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// A best-effort datagram send that could not be handed to the network.
///
/// Send failures are logged and counted; the peer is never demoted here --
/// missing heartbeats are the failure detector's evidence.
#[derive(Debug, thiserror::Error)]
#[error("send to {peer} failed: {reason}")]
pub struct TransportError {
    pub peer: NodeId,
    pub reason: String,
}

/// Outbound packet path, resolved per peer by the transport layer.
///
/// `send` must not block: the gossip executor calls it inline between
/// mutations. Datagram semantics -- no delivery or ordering guarantee.
pub trait TransportOut: Send + Sync {
    /// Hands one encoded packet to the network.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when the packet could not be queued.
    fn send(&self, peer: NodeId, packet: Bytes) -> Result<(), TransportError>;
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Abstraction over time for deterministic tests.
pub trait ClockSource: Send + Sync {
    /// Monotonic milliseconds since an arbitrary per-process origin. Drives
    /// heartbeat bookkeeping and failure detection.
    fn now_ms(&self) -> u64;

    /// Wall-clock seconds since the Unix epoch. Seeds the heartbeat
    /// generation at boot.
    fn wall_secs(&self) -> u64;
}

/// Default clock source backed by `Instant` and `SystemTime`.
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockSource for SystemClock {
    fn now_ms(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn wall_secs(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before Unix epoch")
            .as_secs()
    }
}

// ---------------------------------------------------------------------------
// Failure detection
// ---------------------------------------------------------------------------

/// Pluggable accrual failure detection.
///
/// The gossip executor reports every accepted heartbeat advance via
/// `notify_heartbeat` and polls `suspicion` each tick; a node whose suspicion
/// exceeds the configured threshold is marked unreachable until a fresh
/// heartbeat arrives.
pub trait FailureDetector: Send + Sync {
    /// Records a heartbeat arrival for a node.
    fn notify_heartbeat(&self, node_id: NodeId, now_ms: u64);

    /// Current suspicion score; monotonically increasing in silence.
    fn suspicion(&self, node_id: NodeId, now_ms: u64) -> f64;

    /// Returns `true` if the node's suspicion is below the threshold.
    fn is_alive(&self, node_id: NodeId, now_ms: u64) -> bool;

    /// Timestamp of the most recent recorded heartbeat.
    fn last_heartbeat(&self, node_id: NodeId) -> Option<u64>;

    /// Drops all tracking state for a node.
    fn remove(&self, node_id: NodeId);

    /// Drops all tracking state.
    fn reset(&self);
}

// ---------------------------------------------------------------------------
// Membership
// ---------------------------------------------------------------------------

/// The gossip subsystem's surface for the rest of the database.
///
/// Reads are lock-free snapshots; they never touch the executor's table.
/// Change events are delivered from the gossip executor through an unbounded
/// channel, so a slow subscriber cannot block gossip.
pub trait Membership: Send + Sync {
    /// This process's identity.
    fn local_id(&self) -> NodeId;

    /// Nodes currently considered alive (the local node included).
    fn live_nodes(&self) -> HashSet<NodeId>;

    /// Nodes currently considered unreachable.
    fn dead_nodes(&self) -> HashSet<NodeId>;

    /// Registers a listener for cluster change events.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<ClusterChange>;

    /// Point-in-time membership summary.
    fn health(&self) -> ClusterHealth;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
