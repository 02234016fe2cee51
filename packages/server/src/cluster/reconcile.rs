//! Digest reconciliation: the pure function at the heart of a gossip round.
//!
//! Given the local table and a peer's digest list, decide per node whether to
//! request state from the peer, offer state to the peer, or do nothing:
//!
//! | case | condition                                  | action                       |
//! |------|--------------------------------------------|------------------------------|
//! | A    | unknown locally, or local gen < remote gen | request full state           |
//! | B    | local gen > remote gen                     | offer full local state       |
//! | C    | same gen, local max-version greater        | offer fragments above theirs |
//! | D    | same gen, local max-version smaller        | request delta above ours     |
//! | E    | equal                                      | nothing                      |
//!
//! Nodes known locally but absent from the peer's digest list are offered in
//! full. No mutation happens here; the caller merges whatever comes back.

use std::collections::HashSet;

use lodestone_core::NodeId;

use super::digest::GossipDigest;
use super::state::EndpointStateTable;
use super::types::NodeState;

/// Output of one reconciliation pass.
#[derive(Debug, Clone, Default)]
pub struct Reconciliation {
    /// Digests asking the peer for state (cases A and D).
    pub request_digests: Vec<GossipDigest>,
    /// States offered to the peer (cases B and C, plus local-only nodes).
    pub delta_states: Vec<(NodeId, NodeState)>,
}

impl Reconciliation {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.request_digests.is_empty() && self.delta_states.is_empty()
    }
}

/// Partitions the peer's digests against the local table.
#[must_use]
pub fn reconcile(table: &EndpointStateTable, remote_digests: &[GossipDigest]) -> Reconciliation {
    let mut out = Reconciliation::default();
    let mut mentioned: HashSet<NodeId> = HashSet::with_capacity(remote_digests.len());

    for remote in remote_digests {
        mentioned.insert(remote.node_id);

        let Some(local) = table.get(remote.node_id) else {
            // Case A: never heard of this node.
            out.request_digests
                .push(GossipDigest::request_all(remote.node_id, remote.generation));
            continue;
        };

        let local_generation = local.heartbeat.generation;
        if local_generation < remote.generation {
            // Case A: our incarnation is stale; ask for everything.
            out.request_digests
                .push(GossipDigest::request_all(remote.node_id, remote.generation));
        } else if local_generation > remote.generation {
            // Case B: peer holds a dead incarnation; replace it wholesale.
            out.delta_states.push((remote.node_id, local.clone()));
        } else {
            let local_max = local.max_version();
            if local_max > remote.max_version {
                // Case C: same incarnation, we are ahead; ship only the
                // fragments the peer has not seen.
                out.delta_states
                    .push((remote.node_id, local.fragments_above(remote.max_version)));
            } else if local_max < remote.max_version {
                // Case D: peer is ahead; ask for the delta above our floor.
                out.request_digests.push(GossipDigest {
                    node_id: remote.node_id,
                    generation: remote.generation,
                    max_version: local_max,
                });
            }
            // Case E: identical, nothing to do.
        }
    }

    // Nodes the peer did not mention at all.
    for (node_id, state) in table.snapshot() {
        if !mentioned.contains(&node_id) {
            out.delta_states.push((node_id, state));
        }
    }

    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
