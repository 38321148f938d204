//! DHT error types

use thiserror::Error;

/// DHT errors
#[derive(Debug, Error)]
pub enum DhtError {
    /// Transport error (from tonmesh-adnl)
    #[error("ADNL error: {0}")]
    Adnl(#[from] tonmesh_adnl::AdnlError),

    /// Crypto error (from tonmesh-crypto)
    #[error("Crypto error: {0}")]
    Crypto(#[from] tonmesh_crypto::CryptoError),

    /// Key name or index out of range, or owner mismatch
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Value rejected by its update rule
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// Missing or wrong signature on a record
    #[error("Invalid signature on {0}")]
    InvalidSignature(&'static str),

    /// Value TTL is in the past
    #[error("Value expired at {0}")]
    Expired(u32),

    /// Value payload larger than allowed
    #[error("Value too large: {size} bytes, maximum is {max}")]
    ValueTooLarge { size: usize, max: usize },

    /// Storage is at capacity
    #[error("Storage full")]
    StorageFull,

    /// Unexpected or malformed protocol message
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Owning DHT instance has been dropped
    #[error("DHT is shut down")]
    Shutdown,
}

impl From<bincode::Error> for DhtError {
    fn from(e: bincode::Error) -> Self {
        DhtError::SerializationError(e.to_string())
    }
}

/// Result type for DHT operations
pub type DhtResult<T> = Result<T, DhtError>;
