//! Stable node identity.

use std::fmt;

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codec::CodecError;

/// Opaque identifier for a cluster node, stable for a process lifetime.
///
/// Equality, hashing, and ordering are total, so a `NodeId` can key hash maps
/// and sort deterministically in wire output. The wire form is the raw
/// 16 bytes of the underlying UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Number of bytes a `NodeId` occupies on the wire.
    pub const WIRE_LEN: usize = 16;

    /// Generates a fresh random identity for a new process incarnation.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Reconstructs an identity from its raw byte form.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Returns the raw byte form.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Appends the 16-byte wire form.
    pub fn write_to<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(self.0.as_bytes());
    }

    /// Reads the 16-byte wire form.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Corrupt`] if fewer than 16 bytes remain.
    pub fn read_from<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        if buf.remaining() < Self::WIRE_LEN {
            return Err(CodecError::Corrupt("short read in node id"));
        }
        let mut bytes = [0u8; 16];
        buf.copy_to_slice(&mut bytes);
        Ok(Self(Uuid::from_bytes(bytes)))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short prefix is enough to tell nodes apart in logs.
        let hex = self.0.simple().to_string();
        write!(f, "{}", &hex[..8])
    }
}
