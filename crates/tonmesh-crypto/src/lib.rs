//! tonmesh cryptographic primitives
//!
//! This crate provides the cryptography used by the tonmesh transport:
//! - Ed25519 identity keys and signatures
//! - Short ids (SHA-256 of a key's canonical encoding)
//! - X25519 shared keys derived from Ed25519 identities
//! - Identity encryption with a per-message ephemeral key
//! - AES-256-CTR channel encryption with a plaintext digest

pub mod keys;
pub mod symmetric;
pub mod encryption;
pub mod identity;
pub mod error;

pub use keys::{PrivateKey, PublicKey, SharedKey, Signature};
pub use symmetric::AesKey;
pub use encryption::{Decryptor, Encryptor};
pub use identity::ShortId;
pub use error::{CryptoError, CryptoResult};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::keys::*;
    pub use crate::symmetric::*;
    pub use crate::encryption::*;
    pub use crate::identity::*;
    pub use crate::error::*;
}

/// Protocol constants
pub mod constants {
    /// Ed25519 public/secret key size in bytes
    pub const ED25519_KEY_SIZE: usize = 32;

    /// Ed25519 signature size
    pub const SIGNATURE_SIZE: usize = 64;

    /// AES-256 key size
    pub const AES_KEY_SIZE: usize = 32;

    /// SHA-256 digest size, also the size of a short id
    pub const DIGEST_SIZE: usize = 32;

    /// Short id size
    pub const SHORT_ID_SIZE: usize = 32;

    /// Bytes added by channel (AES) encryption: the plaintext digest
    pub const CHANNEL_OVERHEAD: usize = DIGEST_SIZE;

    /// Bytes added by identity encryption: ephemeral key plus digest
    pub const IDENTITY_OVERHEAD: usize = ED25519_KEY_SIZE + DIGEST_SIZE;

    /// Tag prefixed to an Ed25519 public key before hashing it into a short id
    pub const KEY_TAG_ED25519: u32 = 0x4813_b4c6;

    /// Tag prefixed to an AES key before hashing it into a channel id
    pub const KEY_TAG_AES: u32 = 0x2dbc_add4;

    /// Tag prefixed to an overlay name before hashing it into an overlay id
    pub const KEY_TAG_OVERLAY: u32 = 0x34ba_45cb;
}
