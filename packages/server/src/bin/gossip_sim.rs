//! Multi-node gossip simulation over loopback UDP.
//!
//! Spawns N gossipers in one process, each with its own UDP socket and an
//! address registry standing in for the production transport layer. Every
//! node periodically rewrites its `load` state so deltas keep flowing, and
//! the run ends by checking that all membership views converged.
//!
//! ```text
//! cargo run --bin gossip-sim -- --nodes 7 --run-secs 20
//! RUST_LOG=lodestone_server=debug cargo run --bin gossip-sim
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use tokio::net::UdpSocket;
use tracing_subscriber::EnvFilter;

use lodestone_core::NodeId;
use lodestone_server::cluster::state_keys;
use lodestone_server::{
    ClusterChange, GossipConfig, Gossiper, GossiperHandle, Membership, PhiAccrualFailureDetector,
    SystemClock, TransportError, TransportOut,
};

#[derive(Debug, Parser)]
#[command(name = "gossip-sim", about = "Loopback UDP gossip cluster simulation")]
struct Args {
    /// Number of nodes to spawn.
    #[arg(long, default_value_t = 5, env = "GOSSIP_SIM_NODES")]
    nodes: usize,

    /// How long to let the cluster gossip before the convergence check.
    #[arg(long, default_value_t = 15, env = "GOSSIP_SIM_RUN_SECS")]
    run_secs: u64,

    /// First UDP port; node i binds `base_port + i` on 127.0.0.1.
    #[arg(long, default_value_t = 19_000)]
    base_port: u16,

    /// Expose Prometheus metrics on 127.0.0.1 at this port.
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Emit JSON logs instead of human-readable ones.
    #[arg(long, default_value_t = false)]
    json_logs: bool,
}

/// Outbound path: resolves a peer id to its UDP address and fires a datagram.
struct UdpTransport {
    socket: Arc<UdpSocket>,
    routes: Arc<HashMap<NodeId, SocketAddr>>,
}

impl TransportOut for UdpTransport {
    fn send(&self, peer: NodeId, packet: Bytes) -> Result<(), TransportError> {
        let Some(&addr) = self.routes.get(&peer) else {
            return Err(TransportError {
                peer,
                reason: "no route".to_string(),
            });
        };
        match self.socket.try_send_to(&packet, addr) {
            Ok(_) => Ok(()),
            Err(error) => Err(TransportError {
                peer,
                reason: error.to_string(),
            }),
        }
    }
}

/// Reads datagrams off one socket and posts them into the gossip mailbox.
async fn recv_loop(
    socket: Arc<UdpSocket>,
    senders: Arc<HashMap<SocketAddr, NodeId>>,
    handle: GossiperHandle,
) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, addr)) => {
                let Some(&from) = senders.get(&addr) else {
                    tracing::warn!(%addr, "datagram from unknown sender");
                    continue;
                };
                handle
                    .deliver_packet(from, Bytes::copy_from_slice(&buf[..len]))
                    .await;
            }
            Err(error) => {
                tracing::warn!(%error, "udp receive failed");
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    if let Some(port) = args.metrics_port {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(SocketAddr::from(([127, 0, 0, 1], port)))
            .install()
            .context("installing prometheus exporter")?;
        tracing::info!(port, "prometheus exporter listening");
    }

    // Identity and address plan for the whole cluster, known up front the
    // way a deployment's seed configuration would be.
    let ids: Vec<NodeId> = (0..args.nodes).map(|_| NodeId::random()).collect();
    let addrs: Vec<SocketAddr> = (0..args.nodes)
        .map(|i| {
            SocketAddr::from(([127, 0, 0, 1], args.base_port + u16::try_from(i).unwrap_or(0)))
        })
        .collect();
    let routes: Arc<HashMap<NodeId, SocketAddr>> =
        Arc::new(ids.iter().copied().zip(addrs.iter().copied()).collect());
    let senders: Arc<HashMap<SocketAddr, NodeId>> =
        Arc::new(addrs.iter().copied().zip(ids.iter().copied()).collect());

    let mut handles: Vec<GossiperHandle> = Vec::with_capacity(args.nodes);
    for (index, &id) in ids.iter().enumerate() {
        let socket = Arc::new(
            UdpSocket::bind(addrs[index])
                .await
                .with_context(|| format!("binding {}", addrs[index]))?,
        );
        let transport = Arc::new(UdpTransport {
            socket: Arc::clone(&socket),
            routes: Arc::clone(&routes),
        });
        let config = GossipConfig {
            cluster_name: "gossip-sim".to_string(),
            seeds: vec![ids[0]],
            ..GossipConfig::default()
        };
        let (gossiper, handle) = Gossiper::with_identity(
            id,
            config,
            transport,
            Arc::new(SystemClock::new()),
            Arc::new(PhiAccrualFailureDetector::new(Default::default())),
        );

        tokio::spawn(recv_loop(socket, Arc::clone(&senders), handle.clone()));
        tokio::spawn(gossiper.run());
        handles.push(handle);
    }

    // Narrate membership changes as the first node sees them.
    let mut changes = handles[0].subscribe();
    tokio::spawn(async move {
        while let Some(change) = changes.recv().await {
            match change {
                ClusterChange::NodeJoined(node) => tracing::info!(%node, "joined"),
                ClusterChange::NodeUp(node) => tracing::info!(%node, "up"),
                ClusterChange::NodeDown(node) => tracing::warn!(%node, "down"),
                ClusterChange::NodeRestarted(node) => tracing::info!(%node, "restarted"),
                ClusterChange::AppStateChanged { .. } => {}
            }
        }
    });

    // Keep application state churning so rounds carry real deltas.
    for (index, handle) in handles.iter().enumerate() {
        let handle = handle.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(2));
            let mut load: u64 = index as u64;
            loop {
                tick.tick().await;
                handle
                    .update_local_state(state_keys::LOAD, load.to_string().into_bytes())
                    .await;
                load += 7;
            }
        });
    }

    tracing::info!(nodes = args.nodes, run_secs = args.run_secs, "cluster running");
    let mut status = tokio::time::interval(Duration::from_secs(1));
    for _ in 0..args.run_secs {
        status.tick().await;
        let health = handles[0].health();
        tracing::info!(
            known = health.node_count,
            live = health.live_nodes,
            unreachable = health.unreachable_nodes,
            heartbeat = health.local_heartbeat_version,
            "membership"
        );
    }

    // Convergence check: every node should consider every node alive.
    let expected: std::collections::HashSet<NodeId> = ids.iter().copied().collect();
    let stragglers: Vec<usize> = handles
        .iter()
        .enumerate()
        .filter(|(_, handle)| handle.live_nodes() != expected)
        .map(|(index, _)| index)
        .collect();

    for handle in &handles {
        handle.shutdown().await;
    }

    if stragglers.is_empty() {
        tracing::info!("all {} nodes converged", args.nodes);
        Ok(())
    } else {
        anyhow::bail!("nodes {stragglers:?} did not converge within {}s", args.run_secs)
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
