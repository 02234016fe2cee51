//! MVCC versioned values and their batch-aware codec.
//!
//! Every cell that participates in MVCC is stored as a `(tid, value)` pair:
//! `tid` identifies the writing transaction, `0` meaning committed with no
//! pending transaction, and `value == None` is a tombstone. The codec is
//! shared between the storage engine and the gossip subsystem, so its byte
//! layout is frozen: a batch begins with a single tag byte selecting the
//! committed fast path (`0x00`) or the general form (`0x01`).
//!
//! The fast path exists because committed, non-null batches dominate real
//! row storage; they serialize to exactly the inner codec's bytes with one
//! byte of overhead for the whole batch.

use std::cmp::Ordering;

use bytes::{Buf, BufMut};

use crate::codec::{read_varlong, write_varlong, CodecError, ProtocolVersion};
use crate::value::ValueCodec;

/// Batch tag: every `tid == 0` and every value present.
const TAG_COMMITTED: u8 = 0x00;
/// Batch tag: general form with per-element tid and presence byte.
const TAG_MIXED: u8 = 0x01;

/// Presence byte for a tombstone.
const PRESENCE_NULL: u8 = 0x00;
/// Presence byte for a present value.
const PRESENCE_VALUE: u8 = 0x01;

// ---------------------------------------------------------------------------
// VersionedValue
// ---------------------------------------------------------------------------

/// A value tagged with the transaction that wrote it.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedValue<V> {
    /// Writing transaction id; `0` means committed.
    pub tid: i64,
    /// The cell contents; `None` is a tombstone.
    pub value: Option<V>,
}

impl<V> VersionedValue<V> {
    /// Wraps an already-committed value.
    pub fn committed(value: V) -> Self {
        Self {
            tid: 0,
            value: Some(value),
        }
    }

    /// Returns `true` when no transaction is pending on this cell.
    pub fn is_committed(&self) -> bool {
        self.tid == 0
    }
}

// ---------------------------------------------------------------------------
// VersionedValueCodec
// ---------------------------------------------------------------------------

/// Batch-aware codec for [`VersionedValue`]s over any inner [`ValueCodec`].
///
/// The inner codec is a plain field, passed in at construction; there is no
/// process-wide serializer instance anywhere in this crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct VersionedValueCodec<C> {
    inner: C,
}

impl<C: ValueCodec> VersionedValueCodec<C> {
    /// Wraps an inner value codec.
    pub fn new(inner: C) -> Self {
        Self { inner }
    }

    /// Returns the inner codec.
    pub fn inner(&self) -> &C {
        &self.inner
    }

    /// Encodes a homogeneous batch.
    ///
    /// A single scan decides the path: if every element is committed and
    /// non-null, the batch is written as tag `0x00` followed by the inner
    /// codec's bytes in order. Otherwise tag `0x01` and the general
    /// per-element form.
    pub fn write_batch<B: BufMut>(
        &self,
        buf: &mut B,
        values: &[VersionedValue<C::Value>],
        version: ProtocolVersion,
    ) {
        let all_committed = values.iter().all(|v| v.tid == 0 && v.value.is_some());

        if all_committed {
            buf.put_u8(TAG_COMMITTED);
            for entry in values {
                // Presence checked by the scan above.
                if let Some(value) = &entry.value {
                    self.inner.write(buf, value, version);
                }
            }
        } else {
            buf.put_u8(TAG_MIXED);
            for entry in values {
                self.write_one(buf, entry, version);
            }
        }
    }

    /// Decodes a batch of `len` elements.
    ///
    /// The element count travels out of band (row counts are part of the
    /// enclosing page or packet), matching `write_batch`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Corrupt`] on an unknown tag byte or any
    /// malformed element.
    pub fn read_batch<B: Buf>(
        &self,
        buf: &mut B,
        len: usize,
        version: ProtocolVersion,
    ) -> Result<Vec<VersionedValue<C::Value>>, CodecError> {
        if !buf.has_remaining() {
            return Err(CodecError::Corrupt("unexpected end of stream in batch tag"));
        }
        let tag = buf.get_u8();
        let mut values = Vec::with_capacity(len);
        match tag {
            TAG_COMMITTED => {
                for _ in 0..len {
                    let value = self.inner.read(buf, version)?;
                    values.push(VersionedValue::committed(value));
                }
            }
            TAG_MIXED => {
                for _ in 0..len {
                    values.push(self.read_one(buf, version)?);
                }
            }
            _ => return Err(CodecError::Corrupt("unknown batch tag")),
        }
        Ok(values)
    }

    /// Encodes a single value: `varlong(tid)`, presence byte, optional value.
    pub fn write_one<B: BufMut>(
        &self,
        buf: &mut B,
        entry: &VersionedValue<C::Value>,
        version: ProtocolVersion,
    ) {
        write_varlong(buf, entry.tid);
        match &entry.value {
            None => buf.put_u8(PRESENCE_NULL),
            Some(value) => {
                buf.put_u8(PRESENCE_VALUE);
                self.inner.write(buf, value, version);
            }
        }
    }

    /// Decodes a single value.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Corrupt`] on a short read or a presence byte
    /// other than `0x00`/`0x01`.
    pub fn read_one<B: Buf>(
        &self,
        buf: &mut B,
        version: ProtocolVersion,
    ) -> Result<VersionedValue<C::Value>, CodecError> {
        let tid = read_varlong(buf)?;
        if !buf.has_remaining() {
            return Err(CodecError::Corrupt("unexpected end of stream in presence"));
        }
        let value = match buf.get_u8() {
            PRESENCE_NULL => None,
            PRESENCE_VALUE => Some(self.inner.read(buf, version)?),
            _ => return Err(CodecError::Corrupt("unknown presence byte")),
        };
        Ok(VersionedValue { tid, value })
    }

    /// Total order: signed `tid` first, then the inner comparator.
    /// Tombstones order before present values.
    pub fn compare(
        &self,
        a: &VersionedValue<C::Value>,
        b: &VersionedValue<C::Value>,
    ) -> Ordering {
        a.tid.cmp(&b.tid).then_with(|| match (&a.value, &b.value) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(x), Some(y)) => self.inner.compare(x, y),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
