//! DHT configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DhtError, DhtResult};

/// Search, maintenance and storage parameters
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DhtConfig {
    /// Bucket capacity and replication factor
    pub k: usize,

    /// Query fan-out per search round
    pub a: usize,

    /// Base timeout for a single DHT query
    pub query_timeout: Duration,

    /// Random extra time added to each query timeout
    pub query_jitter: Duration,

    /// Nodes not pinged for this long are pinged by the sweep
    pub ping_ttl: Duration,

    /// Pause between pings within one sweep
    pub ping_spacing: Duration,

    /// Ping results kept per node for latency averaging
    pub latency_history: usize,

    /// Largest value payload accepted
    pub max_value_size: usize,

    /// Maximum values held in local storage
    pub max_values: usize,

    /// Lifetime of a published address record
    pub address_ttl: Duration,

    /// Longest reverse connection registration accepted
    pub max_reverse_ttl: Duration,

    /// Period of the maintenance loop
    pub maintenance_interval: Duration,

    /// Period after which owned values are stored again
    pub republish_interval: Duration,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k: 10,
            a: 3,
            query_timeout: Duration::from_secs(3),
            query_jitter: Duration::from_millis(500),
            ping_ttl: Duration::from_secs(60),
            ping_spacing: Duration::from_millis(50),
            latency_history: 5,
            max_value_size: 768,
            max_values: 10_000,
            address_ttl: Duration::from_secs(3600),
            max_reverse_ttl: Duration::from_secs(3600),
            maintenance_interval: Duration::from_secs(10),
            republish_interval: Duration::from_secs(600),
        }
    }
}

impl DhtConfig {
    /// Validate configuration
    pub fn validate(&self) -> DhtResult<()> {
        if self.k == 0 {
            return Err(DhtError::ConfigError("k must be > 0".into()));
        }
        if self.a == 0 || self.a > self.k {
            return Err(DhtError::ConfigError(format!(
                "a must be in 1..={}, got {}",
                self.k, self.a
            )));
        }
        if self.query_timeout.is_zero() {
            return Err(DhtError::ConfigError("query_timeout must be > 0".into()));
        }
        if self.latency_history == 0 {
            return Err(DhtError::ConfigError("latency_history must be > 0".into()));
        }
        if self.max_value_size == 0 || self.max_values == 0 {
            return Err(DhtError::ConfigError("storage limits must be > 0".into()));
        }
        Ok(())
    }

    /// Query timeout with a fresh random jitter
    pub fn jittered_timeout(&self) -> Duration {
        let jitter_ms = self.query_jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.query_timeout;
        }
        self.query_timeout + Duration::from_millis(rand::random::<u64>() % jitter_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(DhtConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_fanout() {
        let config = DhtConfig {
            a: 20,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_jitter_bounds() {
        let config = DhtConfig::default();
        for _ in 0..50 {
            let timeout = config.jittered_timeout();
            assert!(timeout >= config.query_timeout);
            assert!(timeout < config.query_timeout + config.query_jitter);
        }
    }
}
