//! Short ids
//!
//! Every key in the system is addressed by a 256-bit short id: the SHA-256
//! of the key's tagged encoding. Node ids, channel ids, overlay ids and DHT
//! key hashes all share this space, so Kademlia distances work on all of them.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::constants::SHORT_ID_SIZE;
use crate::error::{CryptoError, CryptoResult};

/// A 256-bit identifier
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct ShortId {
    bytes: [u8; SHORT_ID_SIZE],
}

impl ShortId {
    /// Create ShortId from raw bytes
    pub fn from_bytes(bytes: [u8; SHORT_ID_SIZE]) -> Self {
        Self { bytes }
    }

    /// Try to create from a slice
    pub fn try_from_slice(slice: &[u8]) -> CryptoResult<Self> {
        let bytes: [u8; SHORT_ID_SIZE] =
            slice.try_into().map_err(|_| CryptoError::InvalidKeyLength {
                expected: SHORT_ID_SIZE,
                actual: slice.len(),
            })?;
        Ok(Self { bytes })
    }

    /// SHA-256 of arbitrary bytes
    pub fn hash(data: &[u8]) -> Self {
        Self {
            bytes: Sha256::digest(data).into(),
        }
    }

    /// SHA-256 of `tag (little endian) || body`
    pub fn from_tagged(tag: u32, body: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(tag.to_le_bytes());
        hasher.update(body);
        Self {
            bytes: hasher.finalize().into(),
        }
    }

    /// A uniformly random id
    pub fn random() -> Self {
        let mut bytes = [0u8; SHORT_ID_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; SHORT_ID_SIZE] {
        &self.bytes
    }

    /// XOR distance between two ids (for Kademlia DHT)
    pub fn distance(&self, other: &ShortId) -> [u8; SHORT_ID_SIZE] {
        let mut result = [0u8; SHORT_ID_SIZE];
        for (i, byte) in result.iter_mut().enumerate() {
            *byte = self.bytes[i] ^ other.bytes[i];
        }
        result
    }

    /// Get the leading zeros in the XOR distance (for DHT bucket placement)
    pub fn leading_zeros(&self, other: &ShortId) -> u32 {
        let mut zeros = 0u32;
        for byte in self.distance(other) {
            if byte == 0 {
                zeros += 8;
            } else {
                zeros += byte.leading_zeros();
                break;
            }
        }
        zeros
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    /// Parse from hex string
    pub fn from_hex(s: &str) -> CryptoResult<Self> {
        let bytes = hex::decode(s).map_err(|e| CryptoError::InvalidHex(e.to_string()))?;
        Self::try_from_slice(&bytes)
    }
}

impl From<[u8; SHORT_ID_SIZE]> for ShortId {
    fn from(bytes: [u8; SHORT_ID_SIZE]) -> Self {
        Self { bytes }
    }
}

impl std::fmt::Debug for ShortId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ShortId({})", &self.to_hex()[..8])
    }
}

impl std::fmt::Display for ShortId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}
