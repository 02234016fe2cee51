//! Gossip partner selection.
//!
//! Each period the local node initiates up to three rounds:
//! 1. one with a live peer chosen uniformly (never itself),
//! 2. with probability `dead / (live + 1)`, one with an unreachable peer --
//!    bounded reprobing: expected probes scale with the unreachable fraction,
//! 3. with probability `1 / (live + 1)` (always, when no live peer exists),
//!    one with a seed not already targeted this period.

use lodestone_core::NodeId;
use rand::seq::IndexedRandom;
use rand::Rng;

/// The peers chosen for one gossip period.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerSelection {
    pub live: Option<NodeId>,
    pub unreachable: Option<NodeId>,
    pub seed: Option<NodeId>,
}

impl PeerSelection {
    /// Distinct round targets in selection order.
    #[must_use]
    pub fn targets(&self) -> Vec<NodeId> {
        let mut targets = Vec::with_capacity(3);
        for candidate in [self.live, self.unreachable, self.seed].into_iter().flatten() {
            if !targets.contains(&candidate) {
                targets.push(candidate);
            }
        }
        targets
    }
}

/// Selects this period's gossip partners.
pub fn select_peers<R: Rng + ?Sized>(
    local: NodeId,
    live: &[NodeId],
    unreachable: &[NodeId],
    seeds: &[NodeId],
    rng: &mut R,
) -> PeerSelection {
    let live_peers: Vec<NodeId> = live.iter().copied().filter(|&n| n != local).collect();
    #[allow(clippy::cast_precision_loss)]
    let denominator = (live_peers.len() + 1) as f64;

    let live_pick = live_peers.choose(rng).copied();

    let unreachable_pick = if unreachable.is_empty() {
        None
    } else {
        #[allow(clippy::cast_precision_loss)]
        let probability = unreachable.len() as f64 / denominator;
        if rng.random::<f64>() < probability {
            unreachable.choose(rng).copied()
        } else {
            None
        }
    };

    let seed_pick = {
        let gossip_to_seed = live_peers.is_empty() || rng.random::<f64>() < 1.0 / denominator;
        if gossip_to_seed {
            let candidates: Vec<NodeId> = seeds
                .iter()
                .copied()
                .filter(|&n| n != local && Some(n) != live_pick && Some(n) != unreachable_pick)
                .collect();
            candidates.choose(rng).copied()
        } else {
            None
        }
    };

    PeerSelection {
        live: live_pick,
        unreachable: unreachable_pick,
        seed: seed_pick,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
