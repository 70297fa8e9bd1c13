//! The node hash carried on the wire.
//!
//! Wire format is 48 bytes: a one-byte digest-type tag followed by 47 bytes
//! of digest payload. Only SHA-256 (32-byte digest, zero-padded) is defined
//! today; the tag leaves room for digest agility without a wire break, the
//! same way `trees::axtrees::Sha256Digest` leaves the multihash code as an
//! explicit, checked field rather than assuming a single fixed algorithm.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

pub const HASH_LEN: usize = 48;
const DIGEST_PAYLOAD_LEN: usize = HASH_LEN - 1;

/// The digest algorithm a reconnect attempt hashes nodes with. A
/// `ReconnectConfig` field rather than a compile-time choice, so a future
/// algorithm can be added without breaking callers pinned to `Sha256`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashAlgorithm {
    Sha256,
}

impl Default for HashAlgorithm {
    fn default() -> Self {
        HashAlgorithm::Sha256
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum DigestType {
    /// The canonical null hash: stands in for an absent child.
    Null = 0,
    Sha256 = 1,
}

impl TryFrom<u8> for DigestType {
    type Error = crate::error::ReconnectError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(DigestType::Null),
            1 => Ok(DigestType::Sha256),
            other => Err(crate::error::ReconnectError::Protocol(format!(
                "unknown digest type {other}"
            ))),
        }
    }
}

/// A node hash: either the distinguished null hash or a concrete digest.
#[derive(Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hash {
    digest_type: DigestType,
    bytes: [u8; DIGEST_PAYLOAD_LEN],
}

impl Hash {
    pub const NULL: Hash = Hash {
        digest_type: DigestType::Null,
        bytes: [0u8; DIGEST_PAYLOAD_LEN],
    };

    pub fn of_leaf(serialized: &[u8]) -> Hash {
        Self::sha256(serialized)
    }

    /// Combine a fixed-order sequence of child hashes (including null
    /// hashes for absent slots) into the hash of their parent.
    pub fn of_internal(class_id: u64, version: i32, children: &[Hash]) -> Hash {
        let mut hasher = Sha256::new();
        hasher.update(class_id.to_be_bytes());
        hasher.update(version.to_be_bytes());
        for child in children {
            hasher.update(child.as_bytes());
        }
        let digest = hasher.finalize();
        Self::from_sha256(digest.into())
    }

    fn sha256(data: &[u8]) -> Hash {
        let digest = Sha256::digest(data);
        Self::from_sha256(digest.into())
    }

    fn from_sha256(digest: [u8; 32]) -> Hash {
        let mut bytes = [0u8; DIGEST_PAYLOAD_LEN];
        bytes[..32].copy_from_slice(&digest);
        Hash {
            digest_type: DigestType::Sha256,
            bytes,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self.digest_type, DigestType::Null)
    }

    pub fn as_bytes(&self) -> [u8; HASH_LEN] {
        let mut out = [0u8; HASH_LEN];
        out[0] = self.digest_type as u8;
        out[1..].copy_from_slice(&self.bytes);
        out
    }

    pub fn from_bytes(bytes: [u8; HASH_LEN]) -> Result<Hash, crate::error::ReconnectError> {
        let digest_type = DigestType::try_from(bytes[0])?;
        let mut payload = [0u8; DIGEST_PAYLOAD_LEN];
        payload.copy_from_slice(&bytes[1..]);
        Ok(Hash {
            digest_type,
            bytes: payload,
        })
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            return write!(f, "Hash(null)");
        }
        write!(f, "Hash(")?;
        for b in &self.bytes[..8] {
            write!(f, "{b:02x}")?;
        }
        write!(f, "..)")
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
