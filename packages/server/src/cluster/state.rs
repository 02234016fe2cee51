//! The endpoint state table: the authoritative local view of the cluster.
//!
//! The table is exclusively owned by the gossip executor; every mutation
//! arrives through its mailbox, so mutations are linearizable without any
//! lock. Readers on other threads never touch the table directly -- they get
//! copy-on-read snapshots published after each mutation batch.
//!
//! Merge discipline (applied by [`EndpointStateTable::apply_remote`]):
//! a greater remote generation replaces the node's state wholesale; within
//! the same generation, the heartbeat and each application entry are accepted
//! individually iff the remote version is strictly greater than the local
//! one. Observed heartbeats are therefore non-decreasing for any node.

use lodestone_core::NodeId;
use std::collections::HashMap;

use super::types::{ClusterHealth, Heartbeat, NodeState, VersionedEntry};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Invariant violations inside the gossip subsystem.
///
/// These abort the operation that raised them and leave the table untouched;
/// they are never answers to remote input (malformed packets surface as
/// `CodecError` and are dropped before reaching the table).
#[derive(Debug, thiserror::Error)]
pub enum GossipError {
    #[error("node {0} is not the local node")]
    NotLocal(NodeId),
}

// ---------------------------------------------------------------------------
// Change tracking
// ---------------------------------------------------------------------------

/// One accepted fragment from a remote merge.
///
/// `key == None` marks a heartbeat change; `Some(key)` an application-state
/// cell. The gossiper turns these into subscriber notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedChange {
    pub node: NodeId,
    pub key: Option<String>,
}

/// Events delivered to membership subscribers on the gossip executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterChange {
    /// A node was seen for the first time.
    NodeJoined(NodeId),
    /// The failure detector restored a node.
    NodeUp(NodeId),
    /// The failure detector condemned a node.
    NodeDown(NodeId),
    /// A node came back with a greater generation.
    NodeRestarted(NodeId),
    /// An application-state cell changed.
    AppStateChanged { node: NodeId, key: String },
}

// ---------------------------------------------------------------------------
// Mailbox events
// ---------------------------------------------------------------------------

/// Everything that can wake the gossip executor, drained in FIFO order.
#[derive(Debug)]
pub enum GossipEvent {
    /// A decoded-not-yet-parsed packet delivered by an I/O task.
    Packet { from: NodeId, bytes: bytes::Bytes },
    /// Gossip period boundary.
    Tick,
    /// Soft deadline for an outstanding round.
    RoundTimeout { peer: NodeId, round: u64 },
    /// Local application-state write (bumps the heartbeat counter).
    LocalUpdate { key: String, value: Vec<u8> },
    /// Drain and stop.
    Shutdown,
}

// ---------------------------------------------------------------------------
// EndpointStateTable
// ---------------------------------------------------------------------------

/// Map from node identity to [`NodeState`], plus the local node's pinned id.
///
/// Entries are never deleted while the process lives: a silenced node stays
/// with `is_alive == false` so its versions keep winning against stale gossip
/// about it.
#[derive(Debug)]
pub struct EndpointStateTable {
    local: NodeId,
    nodes: HashMap<NodeId, NodeState>,
}

impl EndpointStateTable {
    /// Creates a table seeded with the local node at `(generation, 1)`.
    #[must_use]
    pub fn new(local: NodeId, generation: u64, now_ms: u64) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(local, NodeState::starting(generation, now_ms));
        Self { local, nodes }
    }

    /// The pinned local identity.
    #[must_use]
    pub fn local_id(&self) -> NodeId {
        self.local
    }

    /// Read access to one node's state.
    #[must_use]
    pub fn get(&self, node: NodeId) -> Option<&NodeState> {
        self.nodes.get(&node)
    }

    /// Number of known nodes, the local one included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Idempotent insertion: returns the existing entry or a newly created
    /// zero-heartbeat one.
    pub fn observe(&mut self, node: NodeId) -> &mut NodeState {
        self.nodes.entry(node).or_insert_with(NodeState::unknown)
    }

    /// Increments the local heartbeat version (one tick = one bump).
    pub fn bump_heartbeat(&mut self) -> Heartbeat {
        let state = self
            .nodes
            .get_mut(&self.local)
            .expect("local entry is created at construction and never removed");
        state.heartbeat.version += 1;
        state.heartbeat
    }

    /// Stores `key -> (value, v)` on the local node, where `v` is the freshly
    /// incremented heartbeat version.
    ///
    /// # Errors
    ///
    /// Returns [`GossipError::NotLocal`] when `node` is not the pinned local
    /// id; the table is left untouched.
    pub fn bump_local(
        &mut self,
        node: NodeId,
        key: impl Into<String>,
        value: Vec<u8>,
    ) -> Result<u64, GossipError> {
        if node != self.local {
            return Err(GossipError::NotLocal(node));
        }
        let version = self.bump_heartbeat().version;
        let state = self
            .nodes
            .get_mut(&self.local)
            .expect("local entry is created at construction and never removed");
        state
            .application
            .insert(key.into(), VersionedEntry { value, version });
        Ok(version)
    }

    /// Merges a remote [`NodeState`] under the rules in the module docs.
    ///
    /// Returns every `(node, key)` fragment that was actually accepted, with
    /// `key == None` standing for the heartbeat. Information about the local
    /// node is ignored: the local entry is only ever advanced by the local
    /// writer.
    pub fn apply_remote(
        &mut self,
        node: NodeId,
        remote: &NodeState,
        now_ms: u64,
    ) -> Vec<AppliedChange> {
        if node == self.local {
            tracing::debug!(%node, "ignoring gossip about the local node");
            return Vec::new();
        }

        let mut changes = Vec::new();
        match self.nodes.get_mut(&node) {
            None => {
                changes.push(AppliedChange { node, key: None });
                changes.extend(remote.application.keys().map(|key| AppliedChange {
                    node,
                    key: Some(key.clone()),
                }));
                let mut accepted = remote.clone();
                accepted.is_alive = true;
                accepted.last_seen_ms = now_ms;
                self.nodes.insert(node, accepted);
            }
            Some(local) => {
                if remote.heartbeat.generation > local.heartbeat.generation {
                    // Restart: the previous incarnation's state is discarded
                    // wholesale, whatever versions it had reached.
                    changes.push(AppliedChange { node, key: None });
                    changes.extend(remote.application.keys().map(|key| AppliedChange {
                        node,
                        key: Some(key.clone()),
                    }));
                    let was_alive = local.is_alive;
                    *local = remote.clone();
                    local.is_alive = was_alive;
                    local.last_seen_ms = now_ms;
                } else if remote.heartbeat.generation == local.heartbeat.generation {
                    if remote.heartbeat.version > local.heartbeat.version {
                        local.heartbeat = remote.heartbeat;
                        local.last_seen_ms = now_ms;
                        changes.push(AppliedChange { node, key: None });
                    }
                    for (key, entry) in &remote.application {
                        let accept = local
                            .application
                            .get(key)
                            .map_or(true, |existing| entry.version > existing.version);
                        if accept {
                            local.application.insert(key.clone(), entry.clone());
                            local.last_seen_ms = now_ms;
                            changes.push(AppliedChange {
                                node,
                                key: Some(key.clone()),
                            });
                        }
                    }
                }
                // Older generation: nothing to take.
            }
        }
        changes
    }

    /// Consistent copy of every entry, ordered by node id, for outbound
    /// message assembly.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(NodeId, NodeState)> {
        let mut entries: Vec<_> = self
            .nodes
            .iter()
            .map(|(node, state)| (*node, state.clone()))
            .collect();
        entries.sort_by_key(|(node, _)| *node);
        entries
    }

    /// Flips a node's liveness flag. Returns `true` if the flag changed.
    /// The local node is always alive.
    pub fn set_alive(&mut self, node: NodeId, alive: bool) -> bool {
        if node == self.local {
            return false;
        }
        match self.nodes.get_mut(&node) {
            Some(state) if state.is_alive != alive => {
                state.is_alive = alive;
                true
            }
            _ => false,
        }
    }

    /// Nodes currently considered alive, the local node included.
    #[must_use]
    pub fn live_nodes(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|(_, state)| state.is_alive)
            .map(|(node, _)| *node)
            .collect()
    }

    /// Nodes currently considered unreachable.
    #[must_use]
    pub fn unreachable_nodes(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|(_, state)| !state.is_alive)
            .map(|(node, _)| *node)
            .collect()
    }

    /// Membership summary for diagnostics.
    #[must_use]
    pub fn health(&self) -> ClusterHealth {
        let local = &self.nodes[&self.local];
        ClusterHealth {
            node_count: self.nodes.len(),
            live_nodes: self.live_nodes().len(),
            unreachable_nodes: self.unreachable_nodes().len(),
            local_generation: local.heartbeat.generation,
            local_heartbeat_version: local.heartbeat.version,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
