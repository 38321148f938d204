//! AES-256-CTR with a plaintext digest
//!
//! Ciphertext layout: `sha256(plaintext) (32) || AES-256-CTR(plaintext)`.
//! The key and IV mix the secret with the digest:
//! - key = secret[0..16] || digest[16..32]
//! - iv  = digest[0..4]  || secret[20..32]
//!
//! Decryption recomputes the digest over the recovered plaintext and fails
//! closed on mismatch, so the digest doubles as an integrity check.

use aes::cipher::{KeyIvInit, StreamCipher};
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::constants::{AES_KEY_SIZE, DIGEST_SIZE, KEY_TAG_AES};
use crate::error::{CryptoError, CryptoResult};
use crate::identity::ShortId;

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// A symmetric channel key
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct AesKey {
    bytes: [u8; AES_KEY_SIZE],
}

impl AesKey {
    /// Generate a random key
    pub fn generate() -> Self {
        let mut bytes = [0u8; AES_KEY_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; AES_KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; AES_KEY_SIZE] {
        &self.bytes
    }

    /// Hash of the tagged key; used as a channel id
    pub fn short_id(&self) -> ShortId {
        ShortId::from_tagged(KEY_TAG_AES, &self.bytes)
    }

    /// Encrypt under this key
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        encrypt(&self.bytes, plaintext)
    }

    /// Decrypt and check the digest
    pub fn decrypt(&self, ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
        decrypt(&self.bytes, ciphertext)
    }
}

impl std::fmt::Debug for AesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AesKey({:?})", self.short_id())
    }
}

fn cipher(secret: &[u8; AES_KEY_SIZE], digest: &[u8; DIGEST_SIZE]) -> Aes256Ctr {
    let mut key = [0u8; 32];
    key[..16].copy_from_slice(&secret[..16]);
    key[16..].copy_from_slice(&digest[16..]);

    let mut iv = [0u8; 16];
    iv[..4].copy_from_slice(&digest[..4]);
    iv[4..].copy_from_slice(&secret[20..]);

    let cipher = Aes256Ctr::new(&key.into(), &iv.into());
    key.zeroize();
    cipher
}

/// Encrypt `plaintext` under a 32-byte secret
pub fn encrypt(secret: &[u8; AES_KEY_SIZE], plaintext: &[u8]) -> Vec<u8> {
    let digest: [u8; DIGEST_SIZE] = Sha256::digest(plaintext).into();

    let mut out = Vec::with_capacity(DIGEST_SIZE + plaintext.len());
    out.extend_from_slice(&digest);
    out.extend_from_slice(plaintext);
    cipher(secret, &digest).apply_keystream(&mut out[DIGEST_SIZE..]);
    out
}

/// Decrypt data produced by [`encrypt`]
pub fn decrypt(secret: &[u8; AES_KEY_SIZE], ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
    if ciphertext.len() < DIGEST_SIZE {
        return Err(CryptoError::CiphertextTooShort {
            min: DIGEST_SIZE,
            actual: ciphertext.len(),
        });
    }

    let mut digest = [0u8; DIGEST_SIZE];
    digest.copy_from_slice(&ciphertext[..DIGEST_SIZE]);

    let mut plaintext = ciphertext[DIGEST_SIZE..].to_vec();
    cipher(secret, &digest).apply_keystream(&mut plaintext);

    let actual: [u8; DIGEST_SIZE] = Sha256::digest(&plaintext).into();
    let diff = actual
        .iter()
        .zip(digest.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b));
    if diff != 0 {
        return Err(CryptoError::DecryptionFailed);
    }

    Ok(plaintext)
}
