//! Byte layouts for gossip packets.
//!
//! Every packet is `tag byte | u16 protocol version | payload`. Payload
//! integers are LEB128 varints from `lodestone_core::codec`. A serialized
//! `NodeState` is framed by its byte length so readers can skip fields a
//! newer minor version appended; that frame is what makes rolling upgrades
//! within a major line safe.
//!
//! Decoders validate every length prefix against the remaining input before
//! allocating, and fail with `CodecError::Corrupt` rather than panic. A
//! failed decode drops the packet; it never touches the table.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use lodestone_core::codec::{
    read_bytes, read_string, read_uvarint, write_bytes, write_string, write_uvarint, CodecError,
    ProtocolVersion,
};
use lodestone_core::NodeId;

use super::digest::GossipDigest;
use super::messages::{Ack2Message, AckMessage, GossipMessage, PacketType, SynMessage};
use super::types::{Heartbeat, NodeState, VersionedEntry};

/// Smallest possible digest record: 16 id bytes + two 1-byte varints.
const MIN_DIGEST_WIRE: usize = NodeId::WIRE_LEN + 2;
/// Smallest possible delta record: 16 id bytes + a 1-byte frame length.
const MIN_DELTA_WIRE: usize = NodeId::WIRE_LEN + 1;

// ---------------------------------------------------------------------------
// Packets
// ---------------------------------------------------------------------------

/// Serializes a gossip message at the given protocol version.
#[must_use]
pub fn encode_packet(message: &GossipMessage, version: ProtocolVersion) -> Bytes {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_u8(message.packet_type() as u8);
    buf.put_u16(version.to_wire());

    match message {
        GossipMessage::Syn(syn) => {
            write_digest_list(&mut buf, &syn.digests);
        }
        GossipMessage::Ack(ack) => {
            write_digest_list(&mut buf, &ack.digests);
            write_delta_map(&mut buf, &ack.deltas);
        }
        GossipMessage::Ack2(ack2) => {
            write_delta_map(&mut buf, &ack2.deltas);
        }
    }
    buf.freeze()
}

/// Parses a gossip packet.
///
/// # Errors
///
/// [`CodecError::UnsupportedVersion`] when the writer's major line differs
/// from ours; [`CodecError::Corrupt`] for everything malformed, including an
/// unknown packet tag.
pub fn decode_packet(packet: &[u8]) -> Result<GossipMessage, CodecError> {
    let mut buf = packet;
    if buf.remaining() < 3 {
        return Err(CodecError::Corrupt("packet shorter than header"));
    }
    let tag = buf.get_u8();
    let version = ProtocolVersion::from_wire(buf.get_u16());
    if !ProtocolVersion::CURRENT.compatible_with(version) {
        return Err(CodecError::UnsupportedVersion(version));
    }

    let Some(packet_type) = PacketType::from_tag(tag) else {
        return Err(CodecError::Corrupt("unknown packet tag"));
    };

    match packet_type {
        PacketType::Syn => Ok(GossipMessage::Syn(SynMessage {
            digests: read_digest_list(&mut buf)?,
        })),
        PacketType::Ack => Ok(GossipMessage::Ack(AckMessage {
            digests: read_digest_list(&mut buf)?,
            deltas: read_delta_map(&mut buf)?,
        })),
        PacketType::Ack2 => Ok(GossipMessage::Ack2(Ack2Message {
            deltas: read_delta_map(&mut buf)?,
        })),
    }
}

// ---------------------------------------------------------------------------
// Digest list
// ---------------------------------------------------------------------------

fn write_digest_list<B: BufMut>(buf: &mut B, digests: &[GossipDigest]) {
    write_uvarint(buf, digests.len() as u64);
    for digest in digests {
        digest.node_id.write_to(buf);
        write_uvarint(buf, digest.generation);
        write_uvarint(buf, digest.max_version);
    }
}

fn read_digest_list<B: Buf>(buf: &mut B) -> Result<Vec<GossipDigest>, CodecError> {
    let count = read_count(buf, MIN_DIGEST_WIRE)?;
    let mut digests = Vec::with_capacity(count);
    for _ in 0..count {
        let node_id = NodeId::read_from(buf)?;
        let generation = read_uvarint(buf)?;
        let max_version = read_uvarint(buf)?;
        digests.push(GossipDigest {
            node_id,
            generation,
            max_version,
        });
    }
    Ok(digests)
}

// ---------------------------------------------------------------------------
// NodeState
// ---------------------------------------------------------------------------

/// Serializes a node state as a length-framed body.
///
/// Liveness and last-seen are local judgments and stay off the wire.
fn write_node_state<B: BufMut>(buf: &mut B, state: &NodeState) {
    let mut body = BytesMut::with_capacity(32);
    write_uvarint(&mut body, state.heartbeat.generation);
    write_uvarint(&mut body, state.heartbeat.version);
    write_uvarint(&mut body, state.application.len() as u64);

    // Deterministic entry order keeps encodings byte-comparable.
    let mut entries: Vec<_> = state.application.iter().collect();
    entries.sort_by(|(a, _), (b, _)| a.cmp(b));
    for (key, entry) in entries {
        write_string(&mut body, key);
        write_bytes(&mut body, &entry.value);
        write_uvarint(&mut body, entry.version);
    }

    write_bytes(buf, &body);
}

/// Parses a length-framed node state, ignoring any bytes a newer writer
/// appended after the fields known to this reader.
fn read_node_state<B: Buf>(buf: &mut B) -> Result<NodeState, CodecError> {
    let body = read_bytes(buf)?;
    let mut body = body.as_slice();

    let generation = read_uvarint(&mut body)?;
    let version = read_uvarint(&mut body)?;
    let count = read_count(&mut body, 3)?;

    let mut state = NodeState {
        heartbeat: Heartbeat {
            generation,
            version,
        },
        application: std::collections::HashMap::with_capacity(count),
        is_alive: true,
        last_seen_ms: 0,
    };
    for _ in 0..count {
        let key = read_string(&mut body)?;
        let value = read_bytes(&mut body)?;
        let entry_version = read_uvarint(&mut body)?;
        state.application.insert(
            key,
            VersionedEntry {
                value,
                version: entry_version,
            },
        );
    }
    // Remaining body bytes belong to a newer minor version.
    Ok(state)
}

// ---------------------------------------------------------------------------
// Delta map
// ---------------------------------------------------------------------------

fn write_delta_map<B: BufMut>(buf: &mut B, deltas: &[(NodeId, NodeState)]) {
    write_uvarint(buf, deltas.len() as u64);
    for (node_id, state) in deltas {
        node_id.write_to(buf);
        write_node_state(buf, state);
    }
}

fn read_delta_map<B: Buf>(buf: &mut B) -> Result<Vec<(NodeId, NodeState)>, CodecError> {
    let count = read_count(buf, MIN_DELTA_WIRE)?;
    let mut deltas = Vec::with_capacity(count);
    for _ in 0..count {
        let node_id = NodeId::read_from(buf)?;
        let state = read_node_state(buf)?;
        deltas.push((node_id, state));
    }
    Ok(deltas)
}

/// Reads a record count and sanity-checks it against the bytes actually
/// available, so a corrupt prefix cannot drive a huge allocation.
fn read_count<B: Buf>(buf: &mut B, min_record_len: usize) -> Result<usize, CodecError> {
    let count = read_uvarint(buf)?;
    let count = usize::try_from(count).map_err(|_| CodecError::Corrupt("count overflow"))?;
    if count.saturating_mul(min_record_len) > buf.remaining() {
        return Err(CodecError::Corrupt("record count exceeds remaining input"));
    }
    Ok(count)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn node(byte: u8) -> NodeId {
        NodeId::from_bytes([byte; 16])
    }

    fn sample_state() -> NodeState {
        let mut state = NodeState::starting(1_700_000_000, 0);
        state.heartbeat.version = 9;
        state.application.insert(
            "load".to_string(),
            VersionedEntry {
                value: b"100".to_vec(),
                version: 7,
            },
        );
        state.application.insert(
            "rpc_ready".to_string(),
            VersionedEntry {
                value: b"ok".to_vec(),
                version: 9,
            },
        );
        state
    }

    fn digest(byte: u8, generation: u64, max_version: u64) -> GossipDigest {
        GossipDigest {
            node_id: node(byte),
            generation,
            max_version,
        }
    }

    #[test]
    fn syn_round_trips() {
        let message = GossipMessage::Syn(SynMessage {
            digests: vec![digest(1, 1_700_000_000, 5), digest(2, 3, 0)],
        });
        let bytes = encode_packet(&message, ProtocolVersion::CURRENT);
        assert_eq!(decode_packet(&bytes).unwrap(), message);
    }

    #[test]
    fn ack_round_trips_with_digests_and_deltas() {
        let message = GossipMessage::Ack(AckMessage {
            digests: vec![digest(3, 9, 0)],
            deltas: vec![(node(1), sample_state())],
        });
        let bytes = encode_packet(&message, ProtocolVersion::CURRENT);
        let decoded = decode_packet(&bytes).unwrap();

        let GossipMessage::Ack(ack) = decoded else {
            panic!("wrong packet type");
        };
        assert_eq!(ack.digests, vec![digest(3, 9, 0)]);
        assert_eq!(ack.deltas.len(), 1);
        let (delta_node, state) = &ack.deltas[0];
        assert_eq!(*delta_node, node(1));
        assert_eq!(state.heartbeat.version, 9);
        assert_eq!(state.application.len(), 2);
    }

    #[test]
    fn ack2_round_trips() {
        let message = GossipMessage::Ack2(Ack2Message {
            deltas: vec![(node(1), sample_state()), (node(2), NodeState::unknown())],
        });
        let bytes = encode_packet(&message, ProtocolVersion::CURRENT);
        assert_eq!(decode_packet(&bytes).unwrap(), {
            // Wire state comes back with local-judgment defaults.
            let mut expected_second = NodeState::unknown();
            expected_second.is_alive = true;
            expected_second.last_seen_ms = 0;
            let mut expected_first = sample_state();
            expected_first.is_alive = true;
            expected_first.last_seen_ms = 0;
            GossipMessage::Ack2(Ack2Message {
                deltas: vec![(node(1), expected_first), (node(2), expected_second)],
            })
        });
    }

    #[test]
    fn packet_tag_is_first_byte() {
        let syn = encode_packet(
            &GossipMessage::Syn(SynMessage { digests: vec![] }),
            ProtocolVersion::CURRENT,
        );
        assert_eq!(syn[0], 0);
        let ack2 = encode_packet(
            &GossipMessage::Ack2(Ack2Message { deltas: vec![] }),
            ProtocolVersion::CURRENT,
        );
        assert_eq!(ack2[0], 2);
    }

    #[test]
    fn unknown_packet_tag_is_corrupt() {
        let packet = [7u8, 0x01, 0x00];
        assert_eq!(
            decode_packet(&packet),
            Err(CodecError::Corrupt("unknown packet tag"))
        );
    }

    #[test]
    fn incompatible_major_version_is_rejected() {
        let mut bytes = encode_packet(
            &GossipMessage::Syn(SynMessage { digests: vec![] }),
            ProtocolVersion::CURRENT,
        )
        .to_vec();
        let foreign = ProtocolVersion { major: 2, minor: 0 };
        bytes[1..3].copy_from_slice(&foreign.to_wire().to_be_bytes());

        assert_eq!(
            decode_packet(&bytes),
            Err(CodecError::UnsupportedVersion(foreign))
        );
    }

    #[test]
    fn newer_minor_version_is_accepted() {
        let mut bytes = encode_packet(
            &GossipMessage::Syn(SynMessage {
                digests: vec![digest(1, 1, 1)],
            }),
            ProtocolVersion::CURRENT,
        )
        .to_vec();
        let newer = ProtocolVersion {
            major: ProtocolVersion::CURRENT.major,
            minor: ProtocolVersion::CURRENT.minor + 1,
        };
        bytes[1..3].copy_from_slice(&newer.to_wire().to_be_bytes());

        assert!(decode_packet(&bytes).is_ok());
    }

    #[test]
    fn trailing_fields_in_node_state_frame_are_ignored() {
        // Encode a state, then splice extra bytes into its frame the way a
        // newer writer would append an unknown field.
        let state = sample_state();
        let mut framed = BytesMut::new();
        write_node_state(&mut framed, &state);

        let mut inner = read_bytes(&mut framed.clone().freeze()).unwrap();
        inner.extend_from_slice(&[0xAA, 0xBB, 0xCC]);
        let mut extended = BytesMut::new();
        write_bytes(&mut extended, &inner);

        let decoded = read_node_state(&mut extended.freeze()).unwrap();
        assert_eq!(decoded.heartbeat, state.heartbeat);
        assert_eq!(decoded.application, state.application);
    }

    #[test]
    fn truncated_packet_is_corrupt() {
        let message = GossipMessage::Ack(AckMessage {
            digests: vec![digest(3, 9, 0)],
            deltas: vec![(node(1), sample_state())],
        });
        let bytes = encode_packet(&message, ProtocolVersion::CURRENT);
        for cut in [1, 2, 5, bytes.len() - 1] {
            assert!(
                decode_packet(&bytes[..cut]).is_err(),
                "cut at {cut} should fail"
            );
        }
    }

    #[test]
    fn absurd_record_count_is_rejected_before_allocation() {
        let mut packet = vec![0u8]; // SYN
        packet.extend_from_slice(&ProtocolVersion::CURRENT.to_wire().to_be_bytes());
        write_uvarint(&mut packet, u64::from(u32::MAX)); // claimed digest count
        assert_eq!(
            decode_packet(&packet),
            Err(CodecError::Corrupt("record count exceeds remaining input"))
        );
    }

    #[test]
    fn empty_input_is_corrupt() {
        assert!(decode_packet(&[]).is_err());
    }

    proptest! {
        /// Arbitrary digest lists survive the wire.
        #[test]
        fn digest_lists_round_trip(
            raw in proptest::collection::vec((any::<u8>(), any::<u64>(), any::<u64>()), 0..32)
        ) {
            let digests: Vec<GossipDigest> = raw
                .into_iter()
                .map(|(byte, generation, max_version)| GossipDigest {
                    node_id: node(byte),
                    generation,
                    max_version,
                })
                .collect();
            let message = GossipMessage::Syn(SynMessage { digests });
            let bytes = encode_packet(&message, ProtocolVersion::CURRENT);
            prop_assert_eq!(decode_packet(&bytes).unwrap(), message);
        }

        /// Random byte garbage never panics the decoder.
        #[test]
        fn garbage_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = decode_packet(&bytes);
        }
    }
}
