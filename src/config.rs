//! Configuration management for Keygate.
//!
//! Settings come from an optional YAML file overlaid with `KEYGATE__*`
//! environment variables (`KEYGATE__EDGE__STORE_TIMEOUT_MS=20`).

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::CacheConfig;
use crate::error::{KeygateError, Result};
use crate::ratelimit::AsyncLimiterConfig;
use crate::store::RetryPolicy;

const ENV_PREFIX: &str = "KEYGATE";

/// Main configuration for the Keygate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeygateConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub edge: EdgeConfig,

    #[serde(default)]
    pub store: StoreConfig,

    /// Cluster gossip; disabled when absent
    #[serde(default)]
    pub mesh: Option<MeshConfig>,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// YAML file of keys, namespaces and overrides to load at startup
    #[serde(default)]
    pub seed_path: Option<String>,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// gRPC server address
    #[serde(default = "default_grpc_addr")]
    pub grpc_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            grpc_addr: default_grpc_addr(),
        }
    }
}

fn default_grpc_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8081))
}

/// Freshness and size of one metadata cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_cache_entries")]
    pub max_entries: u64,
    /// Served without revalidation while younger than this
    #[serde(default = "default_fresh_ms")]
    pub fresh_ms: u64,
    /// Evicted once older than this
    #[serde(default = "default_stale_ms")]
    pub stale_ms: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_entries: default_cache_entries(),
            fresh_ms: default_fresh_ms(),
            stale_ms: default_stale_ms(),
        }
    }
}

impl CacheSettings {
    pub fn to_cache_config(&self) -> CacheConfig {
        CacheConfig {
            max_entries: self.max_entries,
            fresh_for: Duration::from_millis(self.fresh_ms),
            stale_for: Duration::from_millis(self.stale_ms),
        }
    }
}

fn default_cache_entries() -> u64 {
    10_000
}

fn default_fresh_ms() -> u64 {
    60_000
}

fn default_stale_ms() -> u64 {
    600_000
}

/// Edge coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeConfig {
    /// Region name, reported in logs
    #[serde(default = "default_region")]
    pub region: String,

    /// Deadline of any single store call, retries included
    #[serde(default = "default_store_timeout")]
    pub store_timeout_ms: u64,

    #[serde(default)]
    pub key_cache: CacheSettings,

    #[serde(default)]
    pub override_cache: CacheSettings,

    /// Async-mode flush cadence
    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,

    /// Buffered increments per window that trigger an early flush
    #[serde(default = "default_flush_threshold")]
    pub flush_threshold: u64,

    /// Deadline of the read seeding a cold async window
    #[serde(default = "default_seed_timeout")]
    pub seed_timeout_ms: u64,

    /// How often due usage refills are applied
    #[serde(default = "default_refill_check_interval")]
    pub refill_check_interval_secs: u64,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            store_timeout_ms: default_store_timeout(),
            key_cache: CacheSettings::default(),
            override_cache: CacheSettings::default(),
            flush_interval_ms: default_flush_interval(),
            flush_threshold: default_flush_threshold(),
            seed_timeout_ms: default_seed_timeout(),
            refill_check_interval_secs: default_refill_check_interval(),
        }
    }
}

impl EdgeConfig {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn async_limiter(&self) -> AsyncLimiterConfig {
        AsyncLimiterConfig {
            flush_interval: Duration::from_millis(self.flush_interval_ms.max(1)),
            flush_threshold: self.flush_threshold.max(1),
            seed_timeout: Duration::from_millis(self.seed_timeout_ms),
            store_timeout: self.store_timeout(),
        }
    }
}

fn default_region() -> String {
    "local".to_string()
}

fn default_store_timeout() -> u64 {
    50
}

fn default_flush_interval() -> u64 {
    250
}

fn default_flush_threshold() -> u64 {
    100
}

fn default_seed_timeout() -> u64 {
    25
}

fn default_refill_check_interval() -> u64 {
    60
}

/// Which backend holds window counters and usage budgets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Redis,
}

/// Authoritative store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    #[serde(default)]
    pub redis_url: Option<String>,

    /// Prefix of every key written to Redis
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: None,
            key_prefix: default_key_prefix(),
            retry: RetryPolicy::default(),
        }
    }
}

fn default_key_prefix() -> String {
    "keygate".to_string()
}

/// Gossip membership used to spread cache invalidations between regions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Unique node identifier; random when absent
    #[serde(default)]
    pub node_id: Option<String>,
    pub listen_addr: SocketAddr,
    /// Defaults to `listen_addr`
    #[serde(default)]
    pub advertise_addr: Option<SocketAddr>,
    #[serde(default)]
    pub seed_nodes: Vec<String>,
    #[serde(default = "default_cluster_id")]
    pub cluster_id: String,
    #[serde(default = "default_gossip_interval")]
    pub gossip_interval_ms: u64,
    /// How often peers' invalidation epochs are checked
    #[serde(default = "default_invalidation_poll")]
    pub invalidation_poll_ms: u64,
}

fn default_cluster_id() -> String {
    "keygate".to_string()
}

fn default_gossip_interval() -> u64 {
    100
}

fn default_invalidation_poll() -> u64 {
    250
}

/// Log output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl KeygateConfig {
    /// Load configuration from an optional file path plus the environment.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| KeygateError::Config(e.to_string()))
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| KeygateError::Config(format!("Failed to parse configuration: {}", e)))
    }
}
