//! SQL cell values and the pluggable value codec seam.
//!
//! The MVCC layer treats cell contents as opaque: everything it needs goes
//! through the [`ValueCodec`] trait, which is passed explicitly to every
//! encode/decode call. Tests substitute their own codec without touching any
//! global state.
//!
//! Two implementations ship here:
//! - [`RawBytesCodec`]: length-prefixed raw bytes, compared lexicographically.
//! - [`SqlValueCodec`]: typed SQL [`Value`]s serialized as `MsgPack`
//!   (`rmp_serde::to_vec()`), compared by type rank then value.

use std::cmp::Ordering;

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::codec::{read_bytes, write_bytes, CodecError, ProtocolVersion};

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

/// Runtime representation of a SQL cell value.
///
/// NULL is not a variant: absence is modeled by `Option<Value>` at the MVCC
/// layer, so a tombstoned cell and an empty string stay distinguishable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(#[serde(with = "serde_bytes")] Vec<u8>),
}

impl Value {
    /// Rank used to order values of different SQL types.
    fn type_rank(&self) -> u8 {
        match self {
            Value::Bool(_) => 0,
            Value::Int(_) => 1,
            Value::Float(_) => 2,
            Value::Text(_) => 3,
            Value::Bytes(_) => 4,
        }
    }
}

// ---------------------------------------------------------------------------
// ValueCodec
// ---------------------------------------------------------------------------

/// Encoding, decoding, and total ordering for one value type.
///
/// Implementations must keep `compare` a total order: reflexive,
/// antisymmetric, transitive. The MVCC comparator and the storage engine's
/// key ordering both rely on it.
pub trait ValueCodec {
    type Value;

    /// Appends the wire form of `value`.
    fn write<B: BufMut>(&self, buf: &mut B, value: &Self::Value, version: ProtocolVersion);

    /// Reads one value.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Corrupt`] on malformed input.
    fn read<B: Buf>(
        &self,
        buf: &mut B,
        version: ProtocolVersion,
    ) -> Result<Self::Value, CodecError>;

    /// Total order over values.
    fn compare(&self, a: &Self::Value, b: &Self::Value) -> Ordering;
}

// ---------------------------------------------------------------------------
// RawBytesCodec
// ---------------------------------------------------------------------------

/// Length-prefixed raw bytes; the codec used wherever cell contents pass
/// through untyped (gossip payloads, replication streams).
#[derive(Debug, Clone, Copy, Default)]
pub struct RawBytesCodec;

impl ValueCodec for RawBytesCodec {
    type Value = Vec<u8>;

    fn write<B: BufMut>(&self, buf: &mut B, value: &Self::Value, _version: ProtocolVersion) {
        write_bytes(buf, value);
    }

    fn read<B: Buf>(
        &self,
        buf: &mut B,
        _version: ProtocolVersion,
    ) -> Result<Self::Value, CodecError> {
        read_bytes(buf)
    }

    fn compare(&self, a: &Self::Value, b: &Self::Value) -> Ordering {
        a.cmp(b)
    }
}

// ---------------------------------------------------------------------------
// SqlValueCodec
// ---------------------------------------------------------------------------

/// Typed SQL value codec backed by `MsgPack`.
///
/// The serialized form is itself length-prefixed so readers can skip a value
/// without understanding its type, which is what lets a newer writer add
/// `Value` variants within a protocol major line.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlValueCodec;

impl ValueCodec for SqlValueCodec {
    type Value = Value;

    fn write<B: BufMut>(&self, buf: &mut B, value: &Self::Value, _version: ProtocolVersion) {
        // Serialization of Value cannot fail: no maps with non-string keys,
        // no recursion.
        let raw = rmp_serde::to_vec(value).unwrap_or_default();
        write_bytes(buf, &raw);
    }

    fn read<B: Buf>(
        &self,
        buf: &mut B,
        _version: ProtocolVersion,
    ) -> Result<Self::Value, CodecError> {
        let raw = read_bytes(buf)?;
        rmp_serde::from_slice(&raw).map_err(|_| CodecError::Corrupt("malformed value payload"))
    }

    fn compare(&self, a: &Self::Value, b: &Self::Value) -> Ordering {
        a.type_rank().cmp(&b.type_rank()).then_with(|| match (a, b) {
            (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
            (Value::Int(x), Value::Int(y)) => x.cmp(y),
            (Value::Float(x), Value::Float(y)) => x.total_cmp(y),
            (Value::Text(x), Value::Text(y)) => x.cmp(y),
            (Value::Bytes(x), Value::Bytes(y)) => x.cmp(y),
            // Unreachable: equal type ranks imply equal variants.
            _ => Ordering::Equal,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
