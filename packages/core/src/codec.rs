//! Byte-level codec primitives shared by the storage and gossip wire formats.
//!
//! All variable-length integers are LEB128: unsigned values (`uvarint`) are
//! emitted 7 bits at a time, little-endian, high bit as continuation; signed
//! values (`varlong`) are zigzag-mapped onto the unsigned form so that small
//! magnitudes of either sign stay short.
//!
//! Decoders never panic on malformed input: every short read, overlong
//! varint, or length prefix that exceeds the remaining buffer surfaces as
//! [`CodecError::Corrupt`].

use std::fmt;

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised by decoders.
///
/// Packet-level handling policy: a `CodecError` causes the offending input to
/// be dropped and counted; it never propagates into state mutations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// The byte stream is malformed: short read, bad tag, overlong varint,
    /// or a length prefix larger than the remaining input.
    #[error("corrupt stream: {0}")]
    Corrupt(&'static str),
    /// The stream was produced by an incompatible protocol major line.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(ProtocolVersion),
}

// ---------------------------------------------------------------------------
// Protocol version
// ---------------------------------------------------------------------------

/// Protocol version carried by every wire packet and passed to every codec.
///
/// Compatibility is per major line: readers accept any minor within their own
/// major and must ignore unknown trailing fields, so a newer writer can add
/// fields without breaking older readers mid-rolling-upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

impl ProtocolVersion {
    /// The version this build writes.
    pub const CURRENT: Self = Self { major: 1, minor: 0 };

    /// Returns `true` if a stream written at `other` can be read at `self`.
    #[must_use]
    pub fn compatible_with(self, other: Self) -> bool {
        self.major == other.major
    }

    /// Packs the version into its `u16` wire form (major in the high byte);
    /// the caller writes it big-endian.
    #[must_use]
    pub fn to_wire(self) -> u16 {
        u16::from(self.major) << 8 | u16::from(self.minor)
    }

    /// Unpacks the `u16` wire form.
    #[must_use]
    pub fn from_wire(raw: u16) -> Self {
        Self {
            major: (raw >> 8) as u8,
            minor: (raw & 0xff) as u8,
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

// ---------------------------------------------------------------------------
// Unsigned varint
// ---------------------------------------------------------------------------

/// Writes an unsigned LEB128 varint (1-10 bytes).
pub fn write_uvarint<B: BufMut>(buf: &mut B, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.put_u8(byte);
            return;
        }
        buf.put_u8(byte | 0x80);
    }
}

/// Reads an unsigned LEB128 varint.
///
/// # Errors
///
/// Returns [`CodecError::Corrupt`] on a short read, a continuation chain
/// longer than 10 bytes, or bits set past the 64th.
pub fn read_uvarint<B: Buf>(buf: &mut B) -> Result<u64, CodecError> {
    let mut value: u64 = 0;
    let mut shift: u32 = 0;
    loop {
        if !buf.has_remaining() {
            return Err(CodecError::Corrupt("unexpected end of stream in varint"));
        }
        let byte = buf.get_u8();
        // The tenth byte may only carry the single remaining bit.
        if shift == 63 && byte > 1 {
            return Err(CodecError::Corrupt("varint overflows 64 bits"));
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > 63 {
            return Err(CodecError::Corrupt("varint continuation too long"));
        }
    }
}

// ---------------------------------------------------------------------------
// Signed varlong (zigzag)
// ---------------------------------------------------------------------------

/// Writes a signed integer as a zigzag-mapped LEB128 varint.
#[allow(clippy::cast_sign_loss)]
pub fn write_varlong<B: BufMut>(buf: &mut B, value: i64) {
    let zigzag = ((value << 1) ^ (value >> 63)) as u64;
    write_uvarint(buf, zigzag);
}

/// Reads a zigzag-mapped signed integer.
///
/// # Errors
///
/// Propagates [`CodecError::Corrupt`] from the underlying varint read.
#[allow(clippy::cast_possible_wrap)]
pub fn read_varlong<B: Buf>(buf: &mut B) -> Result<i64, CodecError> {
    let zigzag = read_uvarint(buf)?;
    Ok((zigzag >> 1) as i64 ^ -((zigzag & 1) as i64))
}

// ---------------------------------------------------------------------------
// Length-prefixed blobs
// ---------------------------------------------------------------------------

/// Writes a `uvarint` length prefix followed by the raw bytes.
pub fn write_bytes<B: BufMut>(buf: &mut B, value: &[u8]) {
    write_uvarint(buf, value.len() as u64);
    buf.put_slice(value);
}

/// Reads a length-prefixed blob.
///
/// The declared length is validated against the remaining input before any
/// allocation, so a corrupt prefix cannot trigger an oversized `Vec`.
///
/// # Errors
///
/// Returns [`CodecError::Corrupt`] if the prefix exceeds the remaining input.
pub fn read_bytes<B: Buf>(buf: &mut B) -> Result<Vec<u8>, CodecError> {
    let len = read_uvarint(buf)?;
    let len = usize::try_from(len).map_err(|_| CodecError::Corrupt("blob length overflow"))?;
    if buf.remaining() < len {
        return Err(CodecError::Corrupt("blob length exceeds remaining input"));
    }
    let mut value = vec![0u8; len];
    buf.copy_to_slice(&mut value);
    Ok(value)
}

/// Writes a length-prefixed UTF-8 string.
pub fn write_string<B: BufMut>(buf: &mut B, value: &str) {
    write_bytes(buf, value.as_bytes());
}

/// Reads a length-prefixed UTF-8 string.
///
/// # Errors
///
/// Returns [`CodecError::Corrupt`] on a bad length prefix or invalid UTF-8.
pub fn read_string<B: Buf>(buf: &mut B) -> Result<String, CodecError> {
    let raw = read_bytes(buf)?;
    String::from_utf8(raw).map_err(|_| CodecError::Corrupt("invalid utf-8 in string"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn uvarint_bytes(value: u64) -> Vec<u8> {
        let mut buf = Vec::new();
        write_uvarint(&mut buf, value);
        buf
    }

    // -- uvarint --

    #[test]
    fn uvarint_single_byte_boundary() {
        assert_eq!(uvarint_bytes(0), vec![0x00]);
        assert_eq!(uvarint_bytes(127), vec![0x7f]);
        assert_eq!(uvarint_bytes(128), vec![0x80, 0x01]);
    }

    #[test]
    fn uvarint_max_is_ten_bytes() {
        let bytes = uvarint_bytes(u64::MAX);
        assert_eq!(bytes.len(), 10);
        assert_eq!(read_uvarint(&mut bytes.as_slice()).unwrap(), u64::MAX);
    }

    #[test]
    fn uvarint_rejects_truncation() {
        // A continuation bit with nothing after it.
        let mut input: &[u8] = &[0x80];
        assert_eq!(
            read_uvarint(&mut input),
            Err(CodecError::Corrupt("unexpected end of stream in varint"))
        );
    }

    #[test]
    fn uvarint_rejects_overflow() {
        // 10 continuation bytes followed by a value byte: 11 significant groups.
        let input = [0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x01];
        assert!(matches!(
            read_uvarint(&mut input.as_slice()),
            Err(CodecError::Corrupt(_))
        ));
    }

    #[test]
    fn uvarint_rejects_empty_input() {
        let mut input: &[u8] = &[];
        assert!(read_uvarint(&mut input).is_err());
    }

    // -- varlong --

    #[test]
    fn varlong_zigzag_keeps_small_magnitudes_short() {
        for value in [-64_i64, -1, 0, 1, 63] {
            let mut buf = Vec::new();
            write_varlong(&mut buf, value);
            assert_eq!(buf.len(), 1, "varlong({value}) should be one byte");
        }
    }

    #[test]
    fn varlong_extremes_round_trip() {
        for value in [i64::MIN, i64::MIN + 1, -1, 0, 1, i64::MAX - 1, i64::MAX] {
            let mut buf = Vec::new();
            write_varlong(&mut buf, value);
            assert_eq!(read_varlong(&mut buf.as_slice()).unwrap(), value);
        }
    }

    // -- blobs and strings --

    #[test]
    fn bytes_round_trip() {
        let mut buf = Vec::new();
        write_bytes(&mut buf, &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(
            read_bytes(&mut buf.as_slice()).unwrap(),
            vec![0xde, 0xad, 0xbe, 0xef]
        );
    }

    #[test]
    fn bytes_rejects_length_past_end() {
        let mut buf = Vec::new();
        write_uvarint(&mut buf, 100);
        buf.extend_from_slice(&[1, 2, 3]);
        assert_eq!(
            read_bytes(&mut buf.as_slice()),
            Err(CodecError::Corrupt("blob length exceeds remaining input"))
        );
    }

    #[test]
    fn string_rejects_invalid_utf8() {
        let mut buf = Vec::new();
        write_bytes(&mut buf, &[0xff, 0xfe]);
        assert_eq!(
            read_string(&mut buf.as_slice()),
            Err(CodecError::Corrupt("invalid utf-8 in string"))
        );
    }

    // -- protocol version --

    #[test]
    fn protocol_version_wire_round_trip() {
        let version = ProtocolVersion { major: 3, minor: 7 };
        assert_eq!(ProtocolVersion::from_wire(version.to_wire()), version);
    }

    #[test]
    fn protocol_version_compatibility_is_per_major_line() {
        let reader = ProtocolVersion::CURRENT;
        assert!(reader.compatible_with(ProtocolVersion { major: 1, minor: 9 }));
        assert!(!reader.compatible_with(ProtocolVersion { major: 2, minor: 0 }));
    }

    // -- properties --

    proptest! {
        #[test]
        fn uvarint_round_trips(value: u64) {
            let mut buf = Vec::new();
            write_uvarint(&mut buf, value);
            prop_assert_eq!(read_uvarint(&mut buf.as_slice()).unwrap(), value);
        }

        #[test]
        fn varlong_round_trips(value: i64) {
            let mut buf = Vec::new();
            write_varlong(&mut buf, value);
            prop_assert_eq!(read_varlong(&mut buf.as_slice()).unwrap(), value);
        }

        #[test]
        fn bytes_round_trips(value: Vec<u8>) {
            let mut buf = Vec::new();
            write_bytes(&mut buf, &value);
            prop_assert_eq!(read_bytes(&mut buf.as_slice()).unwrap(), value);
        }
    }
}
