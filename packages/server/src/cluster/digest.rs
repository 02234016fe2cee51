//! Gossip digests: the `(node, generation, max-version)` summaries that let
//! two nodes negotiate what to exchange without shipping full state.

use lodestone_core::NodeId;
use rand::seq::SliceRandom;
use rand::Rng;

use super::state::EndpointStateTable;

/// Reconciliation summary for one node. Immutable once constructed; lives
/// only as message payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GossipDigest {
    pub node_id: NodeId,
    pub generation: u64,
    pub max_version: u64,
}

impl GossipDigest {
    /// Digest requesting everything known about a node (`max_version == 0`).
    #[must_use]
    pub fn request_all(node_id: NodeId, generation: u64) -> Self {
        Self {
            node_id,
            generation,
            max_version: 0,
        }
    }
}

/// Builds the digest list for an outbound SYN: one digest per known node,
/// shuffled so the receiver cannot infer local iteration order.
pub fn shuffled_digests<R: Rng + ?Sized>(
    table: &EndpointStateTable,
    rng: &mut R,
) -> Vec<GossipDigest> {
    let mut digests: Vec<GossipDigest> = table
        .snapshot()
        .into_iter()
        .map(|(node_id, state)| GossipDigest {
            node_id,
            generation: state.heartbeat.generation,
            max_version: state.max_version(),
        })
        .collect();
    digests.shuffle(rng);
    digests
}
