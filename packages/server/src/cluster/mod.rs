//! Cluster membership and anti-entropy module.
//!
//! Provides the three-way gossip protocol (SYN / ACK / ACK2), the per-node
//! heartbeat + application-state table, digest-driven reconciliation, peer
//! selection, phi-accrual failure detection, and the wire codecs for all of
//! it. The [`gossiper::Gossiper`] executor ties the pieces together; the rest
//! of the database sees the cluster through the [`traits::Membership`]
//! surface.

pub mod digest;
pub mod failure_detector;
pub mod generation;
pub mod gossiper;
pub mod messages;
pub mod peer;
pub mod reconcile;
pub mod round;
pub mod state;
pub mod traits;
pub mod types;
pub mod wire;

// ---------------------------------------------------------------------------
// Re-exports -- flat public API
// ---------------------------------------------------------------------------

// types
pub use types::{
    state_keys, ClusterHealth, GossipConfig, Heartbeat, NodeState, PhiAccrualConfig,
    VersionedEntry,
};

// state
pub use state::{AppliedChange, ClusterChange, EndpointStateTable, GossipError, GossipEvent};

// digests and reconciliation
pub use digest::{shuffled_digests, GossipDigest};
pub use reconcile::{reconcile, Reconciliation};

// messages and wire
pub use messages::{Ack2Message, AckMessage, GossipMessage, PacketType, SynMessage};
pub use wire::{decode_packet, encode_packet};

// rounds and peers
pub use peer::{select_peers, PeerSelection};
pub use round::{Round, RoundPhase, RoundTable};

// failure detection
pub use failure_detector::{DeadlineFailureDetector, PhiAccrualFailureDetector};

// traits
pub use traits::{
    ClockSource, FailureDetector, Membership, SystemClock, TransportError, TransportOut,
};

// executor
pub use gossiper::{Gossiper, GossiperHandle, MembersSnapshot};

// ---------------------------------------------------------------------------
// Integration tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod integration_tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    use bytes::Bytes;
    use parking_lot::Mutex;

    use lodestone_core::codec::ProtocolVersion;
    use lodestone_core::{NodeId, RawBytesCodec, VersionedValue, VersionedValueCodec};

    use super::*;

    fn node(byte: u8) -> NodeId {
        NodeId::from_bytes([byte; 16])
    }

    // -- deterministic harness ---------------------------------------------

    struct ManualClock {
        ms: AtomicU64,
    }

    impl ManualClock {
        fn at_secs(secs: u64) -> Arc<Self> {
            Arc::new(Self {
                ms: AtomicU64::new(secs * 1000),
            })
        }
        fn set_secs(&self, secs: u64) {
            self.ms.store(secs * 1000, Ordering::SeqCst);
        }
    }

    impl ClockSource for ManualClock {
        fn now_ms(&self) -> u64 {
            self.ms.load(Ordering::SeqCst)
        }
        fn wall_secs(&self) -> u64 {
            self.ms.load(Ordering::SeqCst) / 1000
        }
    }

    /// Per-destination packet queues shared by all loopback transports.
    #[derive(Default)]
    struct LoopbackNetwork {
        queues: Mutex<HashMap<NodeId, Vec<(NodeId, Bytes)>>>,
    }

    struct LoopbackTransport {
        local: NodeId,
        network: Arc<LoopbackNetwork>,
    }

    impl TransportOut for LoopbackTransport {
        fn send(&self, peer: NodeId, packet: Bytes) -> Result<(), TransportError> {
            self.network
                .queues
                .lock()
                .entry(peer)
                .or_default()
                .push((self.local, packet));
            Ok(())
        }
    }

    /// A set of gossipers wired over the loopback network, driven by hand.
    struct Harness {
        network: Arc<LoopbackNetwork>,
        clock: Arc<ManualClock>,
        gossipers: HashMap<NodeId, Gossiper>,
    }

    impl Harness {
        fn new(clock: Arc<ManualClock>) -> Self {
            Self {
                network: Arc::new(LoopbackNetwork::default()),
                clock,
                gossipers: HashMap::new(),
            }
        }

        fn spawn(&mut self, id: NodeId, seeds: Vec<NodeId>) {
            let transport = Arc::new(LoopbackTransport {
                local: id,
                network: Arc::clone(&self.network),
            });
            let config = GossipConfig {
                seeds,
                ..GossipConfig::default()
            };
            let (gossiper, _handle) = Gossiper::with_identity(
                id,
                config,
                transport as Arc<dyn TransportOut>,
                Arc::clone(&self.clock) as Arc<dyn ClockSource>,
                Arc::new(DeadlineFailureDetector::new(60_000)),
            );
            self.gossipers.insert(id, gossiper);
        }

        fn tick(&mut self, id: NodeId) {
            self.gossipers
                .get_mut(&id)
                .unwrap()
                .step(GossipEvent::Tick);
        }

        /// Applies a local application-state write on one node.
        fn update(&mut self, id: NodeId, key: &str, value: &[u8]) {
            self.gossipers.get_mut(&id).unwrap().step(GossipEvent::LocalUpdate {
                key: key.to_string(),
                value: value.to_vec(),
            });
        }

        /// Delivers queued packets until the network is silent.
        fn pump(&mut self) {
            for _ in 0..64 {
                let pending: Vec<(NodeId, NodeId, Bytes)> = {
                    let mut queues = self.network.queues.lock();
                    queues
                        .drain()
                        .flat_map(|(dest, packets)| {
                            packets
                                .into_iter()
                                .map(move |(from, bytes)| (dest, from, bytes))
                        })
                        .collect()
                };
                if pending.is_empty() {
                    return;
                }
                for (dest, from, bytes) in pending {
                    if let Some(gossiper) = self.gossipers.get_mut(&dest) {
                        gossiper.step(GossipEvent::Packet { from, bytes });
                    }
                }
            }
            panic!("network never went silent");
        }

        /// The wire-visible content of one node's table: heartbeats and
        /// application entries, with local judgments stripped.
        fn wire_view(&self, id: NodeId) -> Vec<(NodeId, Heartbeat, Vec<(String, Vec<u8>, u64)>)> {
            self.gossipers[&id]
                .table()
                .snapshot()
                .into_iter()
                .map(|(peer, state)| {
                    let mut entries: Vec<(String, Vec<u8>, u64)> = state
                        .application
                        .iter()
                        .map(|(key, entry)| (key.clone(), entry.value.clone(), entry.version))
                        .collect();
                    entries.sort();
                    (peer, state.heartbeat, entries)
                })
                .collect()
        }

        fn converged(&self, ids: &[NodeId]) -> bool {
            let reference = self.wire_view(ids[0]);
            ids.iter().all(|&id| self.wire_view(id) == reference)
        }
    }

    // -- scenarios ---------------------------------------------------------

    /// Fresh join: one full round leaves both tables equal.
    #[test]
    fn fresh_join_converges_in_one_round() {
        let clock = ManualClock::at_secs(1);
        let mut net = Harness::new(Arc::clone(&clock));
        net.spawn(node(1), vec![node(2)]);
        net.spawn(node(2), vec![node(1)]);

        // Advance both nodes' local versions a little.
        net.update(node(1), state_keys::LOAD, b"30");
        net.update(node(1), state_keys::RPC_READY, b"ok");
        net.update(node(2), state_keys::LOAD, b"55");

        // One SYN(1 -> 2) / ACK / ACK2 exchange.
        net.tick(node(1));
        net.pump();

        assert!(net.converged(&[node(1), node(2)]));
        let view = net.wire_view(node(1));
        assert_eq!(view.len(), 2, "both nodes known on both sides");
    }

    /// Restart: a higher generation discards the old incarnation wholesale.
    #[test]
    fn restart_replaces_old_incarnation() {
        let clock = ManualClock::at_secs(100);
        let mut net = Harness::new(Arc::clone(&clock));
        net.spawn(node(1), vec![node(2)]);
        net.spawn(node(2), vec![node(1)]);

        // A builds up state at generation 100 and B learns it.
        net.update(node(1), state_keys::LOAD, b"heavy");
        net.update(node(1), state_keys::RPC_READY, b"ok");
        net.tick(node(1));
        net.pump();
        assert_eq!(
            net.wire_view(node(2))
                .iter()
                .find(|(id, ..)| *id == node(1))
                .unwrap()
                .1
                .generation,
            100
        );

        // A restarts: same identity, later clock second, fresh version.
        clock.set_secs(101);
        net.gossipers.remove(&node(1));
        net.network.queues.lock().clear();
        net.spawn(node(1), vec![node(2)]);

        net.tick(node(1));
        net.pump();

        let b_view_of_a = net
            .wire_view(node(2))
            .into_iter()
            .find(|(id, ..)| *id == node(1))
            .unwrap();
        assert_eq!(b_view_of_a.1.generation, 101);
        assert!(
            b_view_of_a.2.is_empty(),
            "pre-restart application state discarded wholesale"
        );
    }

    /// Partial delta: a second exchange moves only the fragments the peer
    /// has not seen, and untouched entries keep their old version stamps.
    #[test]
    fn partial_delta_updates_only_newer_fragments() {
        let clock = ManualClock::at_secs(1);
        let mut net = Harness::new(Arc::clone(&clock));
        net.spawn(node(1), vec![node(2)]);
        net.spawn(node(2), vec![node(1)]);

        net.update(node(1), state_keys::LOAD, b"100");
        net.tick(node(1));
        net.pump();
        assert!(net.converged(&[node(1), node(2)]));

        let load_version_before = net
            .wire_view(node(2))
            .into_iter()
            .find(|(id, ..)| *id == node(1))
            .unwrap()
            .2
            .iter()
            .find(|(key, ..)| key == state_keys::LOAD)
            .unwrap()
            .2;

        // Only rpc_ready changes on A.
        net.update(node(1), state_keys::RPC_READY, b"ok");
        net.tick(node(1));
        net.pump();

        let b_view_of_a = net
            .wire_view(node(2))
            .into_iter()
            .find(|(id, ..)| *id == node(1))
            .unwrap();
        let load_after = b_view_of_a
            .2
            .iter()
            .find(|(key, ..)| key == state_keys::LOAD)
            .unwrap();
        assert_eq!(load_after.2, load_version_before, "load untouched");
        assert!(
            b_view_of_a
                .2
                .iter()
                .any(|(key, value, _)| key == state_keys::RPC_READY && value == b"ok"),
            "rpc_ready delta applied"
        );
        assert!(net.converged(&[node(1), node(2)]));
    }

    /// Unknown node: gossip spreads entries the digest list never mentioned.
    #[test]
    fn third_node_spreads_through_gossip() {
        let clock = ManualClock::at_secs(1);
        let mut net = Harness::new(Arc::clone(&clock));
        net.spawn(node(1), vec![node(2)]);
        net.spawn(node(2), vec![node(1)]);
        net.spawn(node(3), vec![node(1)]);

        // A learns about C directly.
        net.tick(node(3));
        net.pump();
        assert!(net
            .wire_view(node(1))
            .iter()
            .any(|(id, ..)| *id == node(3)));

        // B initiates toward A without knowing C exists; A offers it.
        net.tick(node(2));
        net.pump();
        assert!(
            net.wire_view(node(2)).iter().any(|(id, ..)| *id == node(3)),
            "B learned C through A's local-only delta"
        );
    }

    /// Convergence: with no further local writes, repeated random pairwise
    /// rounds drive every table to the element-wise maximum.
    #[test]
    fn cluster_converges_under_repeated_rounds() {
        use rand::seq::IndexedRandom;

        let clock = ManualClock::at_secs(1);
        let mut net = Harness::new(Arc::clone(&clock));
        let ids: Vec<NodeId> = (1..=5).map(node).collect();
        for &id in &ids {
            // Ring seeding is enough; gossip fills in the rest.
            let seed = node((id.as_bytes()[0] % 5) + 1);
            net.spawn(id, vec![seed]);
        }

        // Distinct local state on every node, then no further mutations.
        for (index, &id) in ids.iter().enumerate() {
            net.update(id, state_keys::LOAD, &[index as u8]);
        }

        let mut rng = rand::rng();
        let mut rounds = 0;
        while !net.converged(&ids) {
            rounds += 1;
            assert!(rounds <= 40, "no convergence after {rounds} rounds");
            for &id in &ids {
                let peer = *ids
                    .iter()
                    .filter(|&&candidate| candidate != id)
                    .collect::<Vec<_>>()
                    .choose(&mut rng)
                    .unwrap();
                let now = clock.now_ms();
                net.gossipers.get_mut(&id).unwrap().start_round(*peer, now);
            }
            net.pump();
        }

        // Every node sees all five members with their distinct payloads.
        let view = net.wire_view(node(1));
        assert_eq!(view.len(), 5);
        for (index, &id) in ids.iter().enumerate() {
            let (_, _, entries) = view.iter().find(|(vid, ..)| *vid == id).unwrap();
            assert!(entries
                .iter()
                .any(|(key, value, _)| key == state_keys::LOAD && value == &vec![index as u8]));
        }
    }

    /// MVCC cell bytes survive a gossip exchange bit-exact.
    #[test]
    fn mvcc_encoded_values_travel_through_gossip() {
        let codec = VersionedValueCodec::new(RawBytesCodec);
        let cells = vec![
            VersionedValue::committed(b"row-a".to_vec()),
            VersionedValue {
                tid: 42,
                value: None,
            },
        ];
        let mut payload = Vec::new();
        codec.write_batch(&mut payload, &cells, ProtocolVersion::CURRENT);

        let clock = ManualClock::at_secs(1);
        let mut net = Harness::new(Arc::clone(&clock));
        net.spawn(node(1), vec![node(2)]);
        net.spawn(node(2), vec![node(1)]);

        net.update(node(1), "mvcc_marker", &payload);
        net.tick(node(1));
        net.pump();

        let received = net
            .wire_view(node(2))
            .into_iter()
            .find(|(id, ..)| *id == node(1))
            .unwrap()
            .2
            .into_iter()
            .find(|(key, ..)| key == "mvcc_marker")
            .unwrap()
            .1;
        assert_eq!(received, payload);

        let decoded = codec
            .read_batch(&mut received.as_slice(), cells.len(), ProtocolVersion::CURRENT)
            .unwrap();
        assert_eq!(decoded, cells);
    }

    // -- re-export accessibility -------------------------------------------

    #[test]
    fn reexports_accessible() {
        let _heartbeat = Heartbeat::starting(1);
        let _entry = VersionedEntry {
            value: vec![],
            version: 0,
        };
        let _state = NodeState::unknown();
        let _health = ClusterHealth::default();
        let _config = GossipConfig::default();
        let _phi_config = PhiAccrualConfig::default();

        let _table = EndpointStateTable::new(node(1), 1, 0);
        let _change = ClusterChange::NodeJoined(node(1));
        let _applied = AppliedChange {
            node: node(1),
            key: None,
        };
        let _event = GossipEvent::Tick;

        let _digest = GossipDigest::request_all(node(1), 1);
        let _reconciliation = Reconciliation::default();

        let _syn = GossipMessage::Syn(SynMessage { digests: vec![] });
        let _tag = PacketType::Syn;
        let _ack = AckMessage {
            digests: vec![],
            deltas: vec![],
        };
        let _ack2 = Ack2Message { deltas: vec![] };

        let _selection = PeerSelection::default();
        let _rounds = RoundTable::new();
        let _phase = RoundPhase::SynSent;

        let _phi = PhiAccrualFailureDetector::new(PhiAccrualConfig::default());
        let _deadline = DeadlineFailureDetector::new(5000);
        fn assert_detector(_: &dyn FailureDetector) {}
        assert_detector(&_phi);
        assert_detector(&_deadline);

        let _clock = SystemClock::new();
        fn assert_membership<T: Membership>() {}
        assert_membership::<GossiperHandle>();
    }
}
