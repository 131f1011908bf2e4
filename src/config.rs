//! Node configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::time::Duration;

use crate::core::ID_BITS;
use crate::error::{DhtError, Result};

/// Default bucket size and replication factor.
pub const K_DEFAULT: usize = 20;

/// Default parallelism for iterative lookups.
pub const ALPHA_DEFAULT: usize = 3;

/// Maximum value size (bytes).
pub const MAX_VALUE_SIZE: usize = 1024 * 1024;

/// Tunables for a [`crate::DhtNode`].
///
/// Every field has a default, so a JSON file only needs the keys it overrides.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtConfig {
    /// `k`: contacts per bucket, and the number of replicas per record.
    pub bucket_size: usize,
    /// `α`: RPCs in flight per lookup round.
    pub alpha: usize,
    /// Timeout for FIND_NODE / FIND_VALUE / STORE calls.
    pub rpc_timeout_ms: u64,
    /// Timeout for liveness pings of full-bucket eviction candidates.
    pub ping_timeout_ms: u64,
    /// Upper bound on rounds per lookup.
    pub max_rounds: usize,
    pub max_value_size: usize,
    /// Record lifetime; `None` keeps records until the process exits.
    pub record_ttl_secs: Option<u64>,
    pub bucket_refresh_secs: u64,
    pub republish_secs: u64,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            bucket_size: K_DEFAULT,
            alpha: ALPHA_DEFAULT,
            rpc_timeout_ms: 3_000,
            ping_timeout_ms: 1_000,
            max_rounds: ID_BITS,
            max_value_size: MAX_VALUE_SIZE,
            record_ttl_secs: None,
            bucket_refresh_secs: 3_600,
            republish_secs: 3_600,
        }
    }
}

impl DhtConfig {
    /// Default configuration with a custom `k` and `α`.
    pub fn with_params(bucket_size: usize, alpha: usize) -> Self {
        Self {
            bucket_size,
            alpha,
            ..Self::default()
        }
    }

    /// Parse a JSON document and validate it.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.bucket_size == 0 {
            return Err(DhtError::Config("bucket_size must be positive".into()));
        }
        if self.alpha == 0 {
            return Err(DhtError::Config("alpha must be positive".into()));
        }
        if self.alpha > self.bucket_size {
            return Err(DhtError::Config(format!(
                "alpha ({}) must not exceed bucket_size ({})",
                self.alpha, self.bucket_size
            )));
        }
        if self.rpc_timeout_ms == 0 || self.ping_timeout_ms == 0 {
            return Err(DhtError::Config("timeouts must be positive".into()));
        }
        if self.max_rounds == 0 {
            return Err(DhtError::Config("max_rounds must be positive".into()));
        }
        if self.record_ttl_secs == Some(0) {
            return Err(DhtError::Config("record_ttl_secs must be positive".into()));
        }
        Ok(())
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn record_ttl(&self) -> Option<Duration> {
        self.record_ttl_secs.map(Duration::from_secs)
    }

    pub fn bucket_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.bucket_refresh_secs)
    }

    pub fn republish_interval(&self) -> Duration {
        Duration::from_secs(self.republish_secs)
    }
}
