//! Cryptographic error types

use thiserror::Error;

/// Errors that can occur during cryptographic operations
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Invalid key length provided
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Ciphertext shorter than the encryption overhead
    #[error("Ciphertext too short: need at least {min} bytes, got {actual}")]
    CiphertextTooShort { min: usize, actual: usize },

    /// Decryption failed (digest mismatch or corrupted data)
    #[error("Decryption failed: integrity check failed")]
    DecryptionFailed,

    /// Signature verification failed
    #[error("Signature verification failed")]
    SignatureVerificationFailed,

    /// Invalid signature format
    #[error("Invalid signature format")]
    InvalidSignature,

    /// Bytes do not encode a valid Ed25519 point
    #[error("Invalid public key")]
    InvalidPublicKey,

    /// The key kind cannot perform this operation (e.g. AES keys never sign)
    #[error("Operation not supported by {0} keys")]
    Unsupported(&'static str),

    /// Malformed hex input
    #[error("Invalid hex: {0}")]
    InvalidHex(String),
}

/// Result type for cryptographic operations
pub type CryptoResult<T> = Result<T, CryptoError>;
