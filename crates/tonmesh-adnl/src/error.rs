//! ADNL error types

use thiserror::Error;
use tonmesh_crypto::ShortId;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum AdnlError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Crypto error (from tonmesh-crypto)
    #[error("Crypto error: {0}")]
    Crypto(#[from] tonmesh_crypto::CryptoError),

    /// Truncated or malformed wire data
    #[error("Decode error: {0}")]
    Decode(String),

    /// Datagram addressed to an id that is neither ours nor a known channel
    #[error("Unknown destination: {0:?}")]
    UnknownDestination(ShortId),

    /// Packet without a usable sender identity
    #[error("Unknown source")]
    UnknownSource,

    /// Packet signature missing or wrong
    #[error("Invalid packet signature")]
    InvalidSignature,

    /// Peer confirmed a seqno we never sent
    #[error("Confirm seqno {confirm} is ahead of last sent seqno {sent}")]
    ConfirmSeqnoTooNew { confirm: u64, sent: u64 },

    /// Packet addressed to another incarnation of this node
    #[error("Packet for reinit date {date}, ours is {current}")]
    ReinitDateMismatch { date: u32, current: u32 },

    /// ConfirmChannel for a key we do not hold
    #[error("Channel confirmation does not match our channel key")]
    BadChannelConfirm,

    /// Malformed or inconsistent message part
    #[error("Invalid message part: {0}")]
    InvalidPart(String),

    /// Message is larger than the reassembly limit
    #[error("Message too large: {size} bytes, maximum is {max}")]
    MessageTooLarge { size: usize, max: usize },

    /// Remote has no address we can send to
    #[error("No address for peer {0:?}")]
    NoAddress(ShortId),

    /// Address kind cannot be dialled
    #[error("Unsupported address: {0}")]
    UnsupportedAddress(String),

    /// Send error
    #[error("Send error: {0}")]
    SendError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The owning local node has been dropped
    #[error("Local node is shut down")]
    NodeShutdown,
}

/// Result type for transport operations
pub type AdnlResult<T> = Result<T, AdnlError>;
