//! Ed25519 identity keys
//!
//! A node has exactly one long-term key. It signs packets and DHT records,
//! and its Montgomery form is used for X25519 key agreement, so a peer's
//! public key is all that is needed to encrypt to it.

use ed25519_dalek::{Signature as Ed25519Sig, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::constants::{ED25519_KEY_SIZE, KEY_TAG_ED25519, SIGNATURE_SIZE};
use crate::error::{CryptoError, CryptoResult};
use crate::identity::ShortId;

/// A long-term Ed25519 secret key
#[derive(Clone)]
pub struct PrivateKey {
    inner: SigningKey,
}

/// An Ed25519 public key together with its cached short id
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "[u8; 32]", into = "[u8; 32]")]
pub struct PublicKey {
    inner: VerifyingKey,
    short_id: ShortId,
}

/// Ed25519 signature
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    #[serde(with = "BigArray")]
    bytes: [u8; SIGNATURE_SIZE],
}

/// X25519 shared secret between two identities
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedKey {
    bytes: [u8; 32],
}

impl PrivateKey {
    /// Generate a new random key
    pub fn generate() -> Self {
        Self {
            inner: SigningKey::generate(&mut OsRng),
        }
    }

    /// Create from a 32-byte seed
    pub fn from_bytes(bytes: [u8; ED25519_KEY_SIZE]) -> Self {
        Self {
            inner: SigningKey::from_bytes(&bytes),
        }
    }

    /// Export the seed (use with caution!)
    pub fn to_bytes(&self) -> [u8; ED25519_KEY_SIZE] {
        self.inner.to_bytes()
    }

    /// The matching public key
    pub fn public_key(&self) -> PublicKey {
        PublicKey::from_verifying(self.inner.verifying_key())
    }

    /// Short id of the matching public key
    pub fn short_id(&self) -> ShortId {
        self.public_key().short_id()
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature {
            bytes: self.inner.sign(message).to_bytes(),
        }
    }

    /// X25519 agreement between this key and a remote identity.
    ///
    /// Both sides of a pair compute the same value.
    pub fn shared_key(&self, remote: &PublicKey) -> SharedKey {
        let scalar = self.inner.to_scalar_bytes();
        let point = remote.inner.to_montgomery().to_bytes();
        SharedKey {
            bytes: x25519_dalek::x25519(scalar, point),
        }
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PrivateKey({:?})", self.short_id())
    }
}

impl PublicKey {
    fn from_verifying(inner: VerifyingKey) -> Self {
        let short_id = ShortId::from_tagged(KEY_TAG_ED25519, inner.as_bytes());
        Self { inner, short_id }
    }

    /// Create from raw bytes, rejecting bytes that are not a curve point
    pub fn from_bytes(bytes: [u8; ED25519_KEY_SIZE]) -> CryptoResult<Self> {
        let inner = VerifyingKey::from_bytes(&bytes).map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(Self::from_verifying(inner))
    }

    /// Try to create from a slice
    pub fn try_from_slice(slice: &[u8]) -> CryptoResult<Self> {
        let bytes: [u8; ED25519_KEY_SIZE] =
            slice.try_into().map_err(|_| CryptoError::InvalidKeyLength {
                expected: ED25519_KEY_SIZE,
                actual: slice.len(),
            })?;
        Self::from_bytes(bytes)
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; ED25519_KEY_SIZE] {
        self.inner.as_bytes()
    }

    /// Convert to bytes
    pub fn to_bytes(&self) -> [u8; ED25519_KEY_SIZE] {
        self.inner.to_bytes()
    }

    /// SHA-256 of the tagged key encoding
    pub fn short_id(&self) -> ShortId {
        self.short_id
    }

    /// Verify a signature made by the matching private key
    pub fn verify(&self, message: &[u8], signature: &Signature) -> CryptoResult<()> {
        let sig = Ed25519Sig::from_bytes(&signature.bytes);
        self.inner
            .verify(message, &sig)
            .map_err(|_| CryptoError::SignatureVerificationFailed)
    }
}

impl TryFrom<[u8; ED25519_KEY_SIZE]> for PublicKey {
    type Error = CryptoError;

    fn try_from(bytes: [u8; ED25519_KEY_SIZE]) -> CryptoResult<Self> {
        Self::from_bytes(bytes)
    }
}

impl From<PublicKey> for [u8; ED25519_KEY_SIZE] {
    fn from(key: PublicKey) -> Self {
        key.to_bytes()
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({:?}...)", &self.as_bytes()[..4])
    }
}

impl Signature {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; SIGNATURE_SIZE]) -> Self {
        Self { bytes }
    }

    /// Try to create from slice
    pub fn try_from_slice(slice: &[u8]) -> CryptoResult<Self> {
        let bytes: [u8; SIGNATURE_SIZE] =
            slice.try_into().map_err(|_| CryptoError::InvalidSignature)?;
        Ok(Self { bytes })
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.bytes
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.to_vec()
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({}...)", hex::encode(&self.bytes[..4]))
    }
}

impl SharedKey {
    /// Get the shared secret bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }

    /// The same secret with its bytes in reverse order
    pub fn reversed(&self) -> [u8; 32] {
        let mut bytes = self.bytes;
        bytes.reverse();
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_exchange() {
        let alice = PrivateKey::generate();
        let bob = PrivateKey::generate();

        let alice_shared = alice.shared_key(&bob.public_key());
        let bob_shared = bob.shared_key(&alice.public_key());

        assert_eq!(alice_shared.as_bytes(), bob_shared.as_bytes());
    }

    #[test]
    fn test_shared_key_differs_per_peer() {
        let alice = PrivateKey::generate();
        let bob = PrivateKey::generate();
        let carol = PrivateKey::generate();

        let with_bob = alice.shared_key(&bob.public_key());
        let with_carol = alice.shared_key(&carol.public_key());
        assert_ne!(with_bob.as_bytes(), with_carol.as_bytes());
    }

    #[test]
    fn test_sign_verify() {
        let key = PrivateKey::generate();
        let sig = key.sign(b"payload");

        assert!(key.public_key().verify(b"payload", &sig).is_ok());
        assert!(key.public_key().verify(b"payloaD", &sig).is_err());

        let other = PrivateKey::generate();
        assert!(other.public_key().verify(b"payload", &sig).is_err());
    }

    #[test]
    fn test_seed_roundtrip() {
        let key = PrivateKey::generate();
        let restored = PrivateKey::from_bytes(key.to_bytes());
        assert_eq!(key.public_key(), restored.public_key());
    }

    #[test]
    fn test_public_key_serialization() {
        let key = PrivateKey::generate().public_key();
        let encoded = bincode::serialize(&key).unwrap();
        assert_eq!(encoded.len(), ED25519_KEY_SIZE);

        let restored: PublicKey = bincode::deserialize(&encoded).unwrap();
        assert_eq!(key, restored);
        assert_eq!(key.short_id(), restored.short_id());
    }

    #[test]
    fn test_short_id_is_stable() {
        let key = PrivateKey::generate();
        let public = key.public_key();
        let again = PublicKey::from_bytes(public.to_bytes()).unwrap();
        assert_eq!(public.short_id(), again.short_id());
        assert_ne!(public.short_id().as_bytes(), public.as_bytes());
    }

    #[test]
    fn test_reversed() {
        let alice = PrivateKey::generate();
        let bob = PrivateKey::generate();
        let shared = alice.shared_key(&bob.public_key());
        let reversed = shared.reversed();
        assert_eq!(reversed[0], shared.as_bytes()[31]);
        assert_eq!(reversed[31], shared.as_bytes()[0]);
    }
}
