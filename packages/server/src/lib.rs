//! Lodestone Server -- cluster membership, anti-entropy gossip, and failure detection.
//!
//! The [`cluster`] module is the whole public surface: the gossip executor
//! ([`Gossiper`]), its collaborator traits ([`TransportOut`], [`ClockSource`],
//! [`FailureDetector`]), and the [`Membership`] view the rest of the database
//! consumes. SQL, storage, and replication layers live in sibling crates and
//! reach the cluster only through these seams.

pub mod cluster;

pub use cluster::{
    ClockSource, ClusterChange, ClusterHealth, FailureDetector, GossipConfig, Gossiper,
    GossiperHandle, Membership, PhiAccrualFailureDetector, SystemClock, TransportError,
    TransportOut,
};
