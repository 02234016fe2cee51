//! The gossip executor: one task that owns the endpoint state table.
//!
//! Every mutation -- packet handling, period ticks, round timeouts, local
//! state writes -- arrives as a [`GossipEvent`] and is processed by
//! [`Gossiper::step`] on a single task, so mutations are linearizable without
//! a lock around the table. Reconciliation and merging are CPU-bound and
//! complete without yielding; the only `await` points are mailbox reads.
//!
//! Other threads observe the cluster through [`GossiperHandle`]: lock-free
//! [`MembersSnapshot`] reads (refreshed after every processed event) and an
//! unbounded change-event channel that can never block the executor.
//!
//! Error policy: undecodable packets are dropped and counted, transport
//! failures are logged and counted, and neither ever mutates the table. No
//! packet-level error removes a node from the ring -- condemnation is the
//! failure detector's job alone.

use std::collections::HashSet;
use std::sync::Arc;

use arc_swap::ArcSwap;
use bytes::Bytes;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, MissedTickBehavior};

use lodestone_core::codec::ProtocolVersion;
use lodestone_core::NodeId;

use super::digest::shuffled_digests;
use super::generation::next_generation;
use super::messages::{Ack2Message, AckMessage, GossipMessage, SynMessage};
use super::peer::select_peers;
use super::reconcile::reconcile;
use super::round::RoundTable;
use super::state::{ClusterChange, EndpointStateTable, GossipEvent};
use super::traits::{ClockSource, FailureDetector, Membership, TransportOut};
use super::types::{ClusterHealth, GossipConfig, NodeState};
use super::wire::{decode_packet, encode_packet};

// ---------------------------------------------------------------------------
// Shared read surface
// ---------------------------------------------------------------------------

/// Copy-on-read view of membership, swapped atomically by the executor.
#[derive(Debug, Clone, Default)]
pub struct MembersSnapshot {
    pub live: HashSet<NodeId>,
    pub dead: HashSet<NodeId>,
    pub health: ClusterHealth,
}

struct Shared {
    local: NodeId,
    snapshot: ArcSwap<MembersSnapshot>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ClusterChange>>>,
}

// ---------------------------------------------------------------------------
// GossiperHandle
// ---------------------------------------------------------------------------

/// Cheap-to-clone handle for everything outside the gossip executor.
///
/// I/O tasks post inbound packets here; the rest of the database reads
/// membership and subscribes to change events through the [`Membership`]
/// impl.
#[derive(Clone)]
pub struct GossiperHandle {
    shared: Arc<Shared>,
    mailbox: mpsc::Sender<GossipEvent>,
}

impl GossiperHandle {
    /// Posts one received packet to the executor mailbox.
    pub async fn deliver_packet(&self, from: NodeId, bytes: Bytes) {
        if self
            .mailbox
            .send(GossipEvent::Packet { from, bytes })
            .await
            .is_err()
        {
            tracing::debug!(%from, "gossip executor gone; dropping inbound packet");
        }
    }

    /// Publishes a local application-state change into the gossip stream.
    pub async fn update_local_state(&self, key: impl Into<String>, value: Vec<u8>) {
        let event = GossipEvent::LocalUpdate {
            key: key.into(),
            value,
        };
        if self.mailbox.send(event).await.is_err() {
            tracing::debug!("gossip executor gone; dropping local state update");
        }
    }

    /// Asks the executor to drain and stop.
    pub async fn shutdown(&self) {
        let _ = self.mailbox.send(GossipEvent::Shutdown).await;
    }
}

impl Membership for GossiperHandle {
    fn local_id(&self) -> NodeId {
        self.shared.local
    }

    fn live_nodes(&self) -> HashSet<NodeId> {
        self.shared.snapshot.load().live.clone()
    }

    fn dead_nodes(&self) -> HashSet<NodeId> {
        self.shared.snapshot.load().dead.clone()
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<ClusterChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.subscribers.lock().push(tx);
        rx
    }

    fn health(&self) -> ClusterHealth {
        self.shared.snapshot.load().health.clone()
    }
}

// ---------------------------------------------------------------------------
// Gossiper
// ---------------------------------------------------------------------------

/// The gossip executor state. Construct with [`Gossiper::new`], then either
/// drive it with [`Gossiper::run`] under tokio or feed events directly to
/// [`Gossiper::step`] for deterministic tests.
pub struct Gossiper {
    config: GossipConfig,
    table: EndpointStateTable,
    rounds: RoundTable,
    transport: Arc<dyn TransportOut>,
    clock: Arc<dyn ClockSource>,
    detector: Arc<dyn FailureDetector>,
    shared: Arc<Shared>,
    mailbox_tx: mpsc::Sender<GossipEvent>,
    mailbox_rx: mpsc::Receiver<GossipEvent>,
}

impl Gossiper {
    /// Creates a gossiper with a freshly generated identity.
    pub fn new(
        config: GossipConfig,
        transport: Arc<dyn TransportOut>,
        clock: Arc<dyn ClockSource>,
        detector: Arc<dyn FailureDetector>,
    ) -> (Self, GossiperHandle) {
        Self::with_identity(NodeId::random(), config, transport, clock, detector)
    }

    /// Creates a gossiper with an explicit identity (simulations and tests
    /// need the id before the transport registry exists).
    pub fn with_identity(
        local: NodeId,
        config: GossipConfig,
        transport: Arc<dyn TransportOut>,
        clock: Arc<dyn ClockSource>,
        detector: Arc<dyn FailureDetector>,
    ) -> (Self, GossiperHandle) {
        let generation = next_generation(&*clock, config.generation_floor_path.as_deref());
        let now = clock.now_ms();
        tracing::info!(
            cluster = %config.cluster_name,
            %local,
            generation,
            seeds = config.seeds.len(),
            "gossip subsystem starting"
        );

        let table = EndpointStateTable::new(local, generation, now);
        let shared = Arc::new(Shared {
            local,
            snapshot: ArcSwap::new(Arc::new(MembersSnapshot::default())),
            subscribers: Mutex::new(Vec::new()),
        });
        let (mailbox_tx, mailbox_rx) = mpsc::channel(config.mailbox_capacity);

        let handle = GossiperHandle {
            shared: Arc::clone(&shared),
            mailbox: mailbox_tx.clone(),
        };
        let gossiper = Self {
            config,
            table,
            rounds: RoundTable::new(),
            transport,
            clock,
            detector,
            shared,
            mailbox_tx,
            mailbox_rx,
        };
        gossiper.publish();
        (gossiper, handle)
    }

    /// This node's identity.
    #[must_use]
    pub fn local_id(&self) -> NodeId {
        self.table.local_id()
    }

    pub(crate) fn table(&self) -> &EndpointStateTable {
        &self.table
    }

    /// Drives the executor until shutdown: a period timer plus the mailbox,
    /// drained in FIFO order.
    pub async fn run(mut self) {
        let mut tick = interval(Duration::from_millis(self.config.gossip_interval_ms));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let keep_going = tokio::select! {
                _ = tick.tick() => self.step(GossipEvent::Tick),
                event = self.mailbox_rx.recv() => match event {
                    Some(event) => self.step(event),
                    None => false,
                },
            };
            if !keep_going {
                break;
            }
        }
        tracing::info!(local = %self.local_id(), "gossip executor stopped");
    }

    /// Processes one event and republishes the membership snapshot.
    ///
    /// This is the whole executor; `run` is only a loop around it. Tests
    /// call it directly for deterministic, single-threaded execution.
    /// Returns `false` once [`GossipEvent::Shutdown`] is seen.
    pub fn step(&mut self, event: GossipEvent) -> bool {
        match event {
            GossipEvent::Tick => self.on_tick(),
            GossipEvent::Packet { from, bytes } => self.on_packet(from, &bytes),
            GossipEvent::RoundTimeout { peer, round } => self.on_round_timeout(peer, round),
            GossipEvent::LocalUpdate { key, value } => self.on_local_update(key, value),
            GossipEvent::Shutdown => return false,
        }
        self.publish();
        true
    }

    // -- event handlers ----------------------------------------------------

    fn on_tick(&mut self) {
        let now = self.clock.now_ms();
        self.table.bump_heartbeat();
        self.evaluate_liveness(now);

        let live = self.table.live_nodes();
        let dead = self.table.unreachable_nodes();
        let selection = select_peers(
            self.local_id(),
            &live,
            &dead,
            &self.config.seeds,
            &mut rand::rng(),
        );
        for peer in selection.targets() {
            self.start_round(peer, now);
        }
    }

    /// Opens one anti-entropy round toward `peer`. Crate-visible so tests
    /// can drive pairwise rounds without the period tick's heartbeat bump.
    pub(crate) fn start_round(&mut self, peer: NodeId, now: u64) {
        let digests = shuffled_digests(&self.table, &mut rand::rng());
        let round = self.rounds.begin_initiated(peer, now);
        self.arm_round_timer(peer, round);
        counter!("gossip_rounds_started_total").increment(1);
        self.send(peer, &GossipMessage::Syn(SynMessage { digests }));
    }

    fn on_packet(&mut self, from: NodeId, bytes: &[u8]) {
        match decode_packet(bytes) {
            Ok(GossipMessage::Syn(syn)) => self.on_syn(from, &syn),
            Ok(GossipMessage::Ack(ack)) => self.on_ack(from, ack),
            Ok(GossipMessage::Ack2(ack2)) => self.on_ack2(from, &ack2),
            Err(error) => {
                counter!("gossip_packets_dropped_total").increment(1);
                tracing::warn!(%from, %error, "dropping undecodable gossip packet");
            }
        }
    }

    /// SYN: compute the reconciliation against the current table (no
    /// mutations) and answer with requests plus offers.
    fn on_syn(&mut self, from: NodeId, syn: &SynMessage) {
        let out = reconcile(&self.table, &syn.digests);
        let now = self.clock.now_ms();
        let round = self.rounds.begin_responding(from, now);
        self.arm_round_timer(from, round);
        self.send(
            from,
            &GossipMessage::Ack(AckMessage {
                digests: out.request_digests,
                deltas: out.delta_states,
            }),
        );
    }

    /// ACK: merge the peer's offers, then satisfy its requests from the
    /// now-merged table with an ACK2.
    ///
    /// A late ACK (round already abandoned) still gets its deltas merged --
    /// version filtering makes that safe and the data is fresh -- but no
    /// ACK2 is produced for a round that no longer exists.
    fn on_ack(&mut self, from: NodeId, ack: AckMessage) {
        let expected = self.rounds.complete_initiated(from);
        if !expected {
            counter!("gossip_stale_acks_total").increment(1);
            tracing::debug!(%from, "ACK for an abandoned or unknown round");
        }
        self.apply_deltas(&ack.deltas);

        if expected {
            let deltas = self.fulfill_requests(&ack.digests);
            self.send(from, &GossipMessage::Ack2(Ack2Message { deltas }));
        }
    }

    /// ACK2: merge and close the responder round.
    fn on_ack2(&mut self, from: NodeId, ack2: &Ack2Message) {
        if !self.rounds.complete_responding(from) {
            counter!("gossip_stale_acks_total").increment(1);
            tracing::debug!(%from, "ACK2 for an abandoned or unknown round");
        }
        self.apply_deltas(&ack2.deltas);
    }

    fn on_round_timeout(&mut self, peer: NodeId, round: u64) {
        if self.rounds.on_timeout(peer, round) {
            counter!("gossip_rounds_timed_out_total").increment(1);
            tracing::debug!(%peer, round, "gossip round abandoned without progress");
        }
    }

    fn on_local_update(&mut self, key: String, value: Vec<u8>) {
        let local = self.local_id();
        match self.table.bump_local(local, key.clone(), value) {
            Ok(version) => {
                tracing::debug!(%key, version, "local application state updated");
                self.emit(ClusterChange::AppStateChanged { node: local, key });
            }
            Err(error) => {
                // Unreachable through this path; kept as a hard invariant.
                tracing::error!(%error, "rejected local state update");
            }
        }
    }

    // -- merge plumbing ----------------------------------------------------

    /// Merges received states and routes the consequences: failure-detector
    /// heartbeats, liveness restoration, and subscriber events.
    fn apply_deltas(&mut self, deltas: &[(NodeId, NodeState)]) {
        let now = self.clock.now_ms();
        for (node, state) in deltas {
            let previous = self.table.get(*node).map(|known| known.heartbeat);
            let changes = self.table.apply_remote(*node, state, now);
            if changes.is_empty() {
                continue;
            }

            match previous {
                None => self.emit(ClusterChange::NodeJoined(*node)),
                Some(before) if state.heartbeat.generation > before.generation => {
                    self.emit(ClusterChange::NodeRestarted(*node));
                }
                Some(_) => {}
            }

            let heartbeat_advanced = changes.iter().any(|change| change.key.is_none());
            if heartbeat_advanced {
                self.detector.notify_heartbeat(*node, now);
                if self.table.set_alive(*node, true) {
                    self.emit(ClusterChange::NodeUp(*node));
                }
            }

            for change in changes {
                if let Some(key) = change.key {
                    self.emit(ClusterChange::AppStateChanged {
                        node: change.node,
                        key,
                    });
                }
            }
        }
    }

    /// Answers request digests from the local table: full state for
    /// everything-requests or a newer local generation, fragments above the
    /// floor otherwise.
    fn fulfill_requests(
        &self,
        requests: &[super::digest::GossipDigest],
    ) -> Vec<(NodeId, NodeState)> {
        requests
            .iter()
            .filter_map(|request| {
                let state = self.table.get(request.node_id)?;
                let full =
                    request.max_version == 0 || state.heartbeat.generation > request.generation;
                let delta = if full {
                    state.clone()
                } else {
                    state.fragments_above(request.max_version)
                };
                Some((request.node_id, delta))
            })
            .collect()
    }

    fn evaluate_liveness(&mut self, now: u64) {
        let local = self.local_id();
        for node in self.table.live_nodes() {
            if node == local {
                continue;
            }
            if !self.detector.is_alive(node, now) && self.table.set_alive(node, false) {
                counter!("gossip_nodes_condemned_total").increment(1);
                tracing::warn!(
                    %node,
                    suspicion = self.detector.suspicion(node, now),
                    "marking node unreachable"
                );
                self.emit(ClusterChange::NodeDown(node));
            }
        }
    }

    // -- outbound ----------------------------------------------------------

    fn send(&self, peer: NodeId, message: &GossipMessage) {
        let packet = encode_packet(message, ProtocolVersion::CURRENT);
        if let Err(error) = self.transport.send(peer, packet) {
            // Best effort: the failure detector will notice a silent peer.
            counter!("gossip_send_failures_total").increment(1);
            tracing::warn!(%error, "gossip send failed");
        }
    }

    /// Arms a soft-deadline timer that posts back into the mailbox. Outside
    /// a tokio runtime (deterministic tests) no timer is armed; tests post
    /// [`GossipEvent::RoundTimeout`] themselves.
    fn arm_round_timer(&self, peer: NodeId, round: u64) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let tx = self.mailbox_tx.clone();
        let timeout = Duration::from_millis(self.config.round_timeout_ms);
        runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(GossipEvent::RoundTimeout { peer, round }).await;
        });
    }

    // -- read surface ------------------------------------------------------

    fn publish(&self) {
        let health = self.table.health();
        #[allow(clippy::cast_precision_loss)]
        {
            gauge!("cluster_live_nodes").set(health.live_nodes as f64);
            gauge!("cluster_unreachable_nodes").set(health.unreachable_nodes as f64);
        }
        self.shared.snapshot.store(Arc::new(MembersSnapshot {
            live: self.table.live_nodes().into_iter().collect(),
            dead: self.table.unreachable_nodes().into_iter().collect(),
            health,
        }));
    }

    fn emit(&self, change: ClusterChange) {
        let mut subscribers = self.shared.subscribers.lock();
        subscribers.retain(|tx| tx.send(change.clone()).is_ok());
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
