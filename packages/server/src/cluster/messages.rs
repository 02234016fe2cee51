//! The three gossip wire messages.
//!
//! One anti-entropy round is SYN -> ACK -> ACK2: the initiator summarizes its
//! table as digests, the responder answers with its requests plus offers, and
//! the initiator closes by satisfying those requests. Byte layouts live in
//! [`super::wire`]; this module is the typed form.

use lodestone_core::NodeId;

use super::digest::GossipDigest;
use super::types::NodeState;

/// Wire discriminant for a gossip packet. Decoder dispatch is a match on
/// this enum; there is no open-ended packet hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Syn = 0,
    Ack = 1,
    Ack2 = 2,
}

impl PacketType {
    /// Maps a wire tag to a packet type.
    #[must_use]
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Syn),
            1 => Some(Self::Ack),
            2 => Some(Self::Ack2),
            _ => None,
        }
    }
}

/// Round opener: the initiator's shuffled digest list.
#[derive(Debug, Clone, PartialEq)]
pub struct SynMessage {
    pub digests: Vec<GossipDigest>,
}

/// Responder's answer: digests it wants satisfied plus states it offers.
#[derive(Debug, Clone, PartialEq)]
pub struct AckMessage {
    pub digests: Vec<GossipDigest>,
    pub deltas: Vec<(NodeId, NodeState)>,
}

/// Round closer: the initiator's answers to the responder's requests.
#[derive(Debug, Clone, PartialEq)]
pub struct Ack2Message {
    pub deltas: Vec<(NodeId, NodeState)>,
}

/// A decoded gossip packet.
#[derive(Debug, Clone, PartialEq)]
pub enum GossipMessage {
    Syn(SynMessage),
    Ack(AckMessage),
    Ack2(Ack2Message),
}

impl GossipMessage {
    /// The wire discriminant this message serializes under.
    #[must_use]
    pub fn packet_type(&self) -> PacketType {
        match self {
            GossipMessage::Syn(_) => PacketType::Syn,
            GossipMessage::Ack(_) => PacketType::Ack,
            GossipMessage::Ack2(_) => PacketType::Ack2,
        }
    }
}
