//! Lodestone Core -- node identity, codec primitives, and the MVCC versioned-value codec.
//!
//! This crate provides the foundation layer shared by the Lodestone storage
//! engine and the cluster gossip subsystem:
//!
//! - **Codec** ([`codec`]): LEB128 varints, zigzag varlongs, length-prefixed
//!   blobs, [`ProtocolVersion`], and [`CodecError`]
//! - **Identity** ([`node_id`]): [`NodeId`], stable per process incarnation
//! - **Values** ([`value`]): SQL [`Value`] enum and the [`ValueCodec`] seam
//!   with raw-bytes and `MsgPack`-backed implementations
//! - **MVCC** ([`mvcc`]): [`VersionedValue`] `(tid, value)` pairs and the
//!   batch-aware [`VersionedValueCodec`]
//!
//! Binary compatibility note: the byte layouts produced here are shared
//! between the storage layer and the gossip wire format and must stay stable
//! within a protocol major line.

pub mod codec;
pub mod mvcc;
pub mod node_id;
pub mod value;

// Codec
pub use codec::{
    read_bytes, read_string, read_uvarint, read_varlong, write_bytes, write_string,
    write_uvarint, write_varlong, CodecError, ProtocolVersion,
};

// Identity
pub use node_id::NodeId;

// Values
pub use value::{RawBytesCodec, SqlValueCodec, Value, ValueCodec};

// MVCC
pub use mvcc::{VersionedValue, VersionedValueCodec};
