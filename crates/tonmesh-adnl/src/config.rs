//! Transport configuration

use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::error::{AdnlError, AdnlResult};

/// Local node and connection limits
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdnlConfig {
    /// Idle time after which a connection is forgotten
    pub connection_ttl: Duration,

    /// Idle time after which a channel id stops resolving
    pub channel_ttl: Duration,

    /// Maximum cached connections per local node
    pub max_connections: usize,

    /// Idle time after which a partial transfer is dropped
    pub transfer_ttl: Duration,

    /// Maximum partial transfers per connection
    pub max_transfers: usize,

    /// Largest message accepted for fragmentation or reassembly
    pub max_message_size: usize,

    /// Timeout for queries that do not pass their own
    pub query_timeout: Duration,
}

impl Default for AdnlConfig {
    fn default() -> Self {
        Self {
            connection_ttl: Duration::from_secs(15 * 60),
            channel_ttl: Duration::from_secs(15 * 60),
            max_connections: 4096,
            transfer_ttl: Duration::from_secs(5),
            max_transfers: 10,
            max_message_size: 1024 * 1024,
            query_timeout: Duration::from_secs(5),
        }
    }
}

impl AdnlConfig {
    /// Validate configuration
    pub fn validate(&self) -> AdnlResult<()> {
        if self.max_connections == 0 {
            return Err(AdnlError::ConfigError("max_connections must be > 0".into()));
        }
        if self.max_transfers == 0 {
            return Err(AdnlError::ConfigError("max_transfers must be > 0".into()));
        }
        if self.max_message_size < crate::MAX_ADNL_MESSAGE {
            return Err(AdnlError::ConfigError(format!(
                "max_message_size {} is below the single-packet budget {}",
                self.max_message_size,
                crate::MAX_ADNL_MESSAGE
            )));
        }
        if self.query_timeout.is_zero() {
            return Err(AdnlError::ConfigError("query_timeout must be > 0".into()));
        }
        Ok(())
    }
}
