//! Configuration for the naming substrate
//!
//! Every tunable of the cache, the naming client and the replica engines lives
//! here. Configuration is layered: defaults, then a TOML file, then `STRATA_*`
//! environment variables (`STRATA_CACHE_LIFETIME_MS=2000` sets
//! `cache.lifetime_ms`).

use crate::effects::transport::PeerFanOut;
use crate::errors::{Result, StrataError};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "STRATA_";

/// Client cache settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Longest time a fetched value is served without being refreshed
    pub lifetime_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            lifetime_ms: 5 * 60 * 1000,
        }
    }
}

impl CacheConfig {
    /// Cache lifetime as a duration
    pub fn lifetime(&self) -> Duration {
        Duration::from_millis(self.lifetime_ms)
    }
}

/// Naming client settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Minimum number of naming peers
    pub min_peers: usize,
    /// Maximum number of naming peers
    pub max_peers: usize,
    /// Pause between attempts of `fetch_with_retry`
    pub fetch_retry_wait_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            min_peers: 0,
            max_peers: 4,
            fetch_retry_wait_ms: 1000,
        }
    }
}

impl ClientConfig {
    /// Peer fan-out window handed to the transport
    pub fn fan_out(&self) -> PeerFanOut {
        PeerFanOut {
            min_peers: self.min_peers,
            max_peers: self.max_peers,
        }
    }

    /// Retry pause as a duration
    pub fn fetch_retry_wait(&self) -> Duration {
        Duration::from_millis(self.fetch_retry_wait_ms)
    }
}

/// Replica engine settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KvdbConfig {
    /// Capacity of the channel behind streaming list queries
    pub query_buffer_size: usize,
    /// A streaming query producing nothing for this long is closed
    pub read_query_timeout_ms: u64,
    /// Rebroadcast interval used when the caller passes 0
    pub default_rebroadcast_interval_secs: u64,
    /// Period of the head-count heartbeat log
    pub heartbeat_interval_ms: u64,
    /// Resubscription attempts before a broadcaster gives up
    pub max_resubscribe_attempts: u32,
}

impl Default for KvdbConfig {
    fn default() -> Self {
        Self {
            query_buffer_size: 1024,
            read_query_timeout_ms: 10_000,
            default_rebroadcast_interval_secs: 5,
            heartbeat_interval_ms: 3000,
            max_resubscribe_attempts: 3,
        }
    }
}

impl KvdbConfig {
    /// Streaming query inactivity timeout
    pub fn read_query_timeout(&self) -> Duration {
        Duration::from_millis(self.read_query_timeout_ms)
    }

    /// Heartbeat period
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Resolve a caller supplied rebroadcast interval, 0 meaning "default"
    pub fn rebroadcast_interval(&self, requested_secs: u64) -> Duration {
        if requested_secs == 0 {
            Duration::from_secs(self.default_rebroadcast_interval_secs)
        } else {
            Duration::from_secs(requested_secs)
        }
    }
}

/// Complete configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrataConfig {
    /// Client cache
    pub cache: CacheConfig,
    /// Naming client
    pub client: ClientConfig,
    /// Replica engines
    pub kvdb: KvdbConfig,
}

impl StrataConfig {
    /// Parse TOML; missing sections and fields keep their defaults
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: StrataConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file
    pub fn load_from_file(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            StrataError::invalid(format!("failed to read config {}: {e}", path.display()))
        })?;
        debug!(path = %path.display(), "Loading configuration");
        Self::from_toml_str(&text)
    }

    /// Apply every `STRATA_<SECTION>_<FIELD>` environment variable
    pub fn merge_with_env(&mut self) -> Result<()> {
        for (name, value) in std::env::vars() {
            let Some(rest) = name.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let rest = rest.to_lowercase();
            let Some((section, field)) = rest.split_once('_') else {
                continue;
            };
            let key = format!("{section}.{field}");
            self.set(&key, &value)?;
            debug!(key = %key, "Configuration override from environment");
        }
        self.validate()
    }

    /// Set one field addressed as `section.field`
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
            value
                .parse()
                .map_err(|_| StrataError::invalid(format!("invalid value `{value}` for {key}")))
        }

        match key {
            "cache.lifetime_ms" => self.cache.lifetime_ms = parse(key, value)?,
            "client.min_peers" => self.client.min_peers = parse(key, value)?,
            "client.max_peers" => self.client.max_peers = parse(key, value)?,
            "client.fetch_retry_wait_ms" => self.client.fetch_retry_wait_ms = parse(key, value)?,
            "kvdb.query_buffer_size" => self.kvdb.query_buffer_size = parse(key, value)?,
            "kvdb.read_query_timeout_ms" => self.kvdb.read_query_timeout_ms = parse(key, value)?,
            "kvdb.default_rebroadcast_interval_secs" => {
                self.kvdb.default_rebroadcast_interval_secs = parse(key, value)?;
            }
            "kvdb.heartbeat_interval_ms" => self.kvdb.heartbeat_interval_ms = parse(key, value)?,
            "kvdb.max_resubscribe_attempts" => {
                self.kvdb.max_resubscribe_attempts = parse(key, value)?;
            }
            _ => return Err(StrataError::invalid(format!("unknown config key `{key}`"))),
        }
        Ok(())
    }

    /// Reject settings the components cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.cache.lifetime_ms == 0 {
            return Err(StrataError::invalid("cache.lifetime_ms must be positive"));
        }
        if self.client.max_peers == 0 {
            return Err(StrataError::invalid("client.max_peers must be positive"));
        }
        if self.client.min_peers > self.client.max_peers {
            return Err(StrataError::invalid(format!(
                "client.min_peers ({}) exceeds client.max_peers ({})",
                self.client.min_peers, self.client.max_peers
            )));
        }
        if self.kvdb.query_buffer_size == 0 {
            return Err(StrataError::invalid("kvdb.query_buffer_size must be positive"));
        }
        if self.kvdb.read_query_timeout_ms == 0 {
            return Err(StrataError::invalid("kvdb.read_query_timeout_ms must be positive"));
        }
        if self.kvdb.default_rebroadcast_interval_secs == 0 {
            return Err(StrataError::invalid(
                "kvdb.default_rebroadcast_interval_secs must be positive",
            ));
        }
        if self.kvdb.heartbeat_interval_ms == 0 {
            return Err(StrataError::invalid("kvdb.heartbeat_interval_ms must be positive"));
        }
        Ok(())
    }
}
