//! Configuration types
//!
//! Configuration is assembled from defaults, an optional TOML document and
//! `ARBOR_*` environment variables. Call [`RepositoryConfig::validate`]
//! before handing a configuration to a repository.

use crate::error::ConfigError;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Path lock settings.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LockConfig {
    /// Give up waiting for a path lock after this long. `None` waits forever.
    pub timeout: Option<Duration>,
}

/// Cache settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Maximum number of cached entries before the oldest are evicted.
    pub max_entries: usize,
    /// Entries older than this are treated as absent.
    pub entry_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            entry_ttl: Duration::from_secs(3600),
        }
    }
}

impl CacheConfig {
    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = max;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.entry_ttl = ttl;
        self
    }
}

/// Content buffering settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferConfig {
    /// Directory for temporary upload files; the system temp dir if unset.
    pub temp_dir: Option<PathBuf>,
    /// Read/write chunk size.
    pub chunk_size: usize,
    /// Touch the caller's token every time this many bytes have been copied.
    pub keepalive_interval_bytes: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            temp_dir: None,
            chunk_size: 64 * 1024,
            keepalive_interval_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Cluster settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    /// Broadcast flush messages after writes.
    pub enabled: bool,
    /// Identifier of this node on the cluster bus.
    pub node_id: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            node_id: "local".to_string(),
        }
    }
}

/// Master configuration for the locking cache-control repository.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RepositoryConfig {
    pub lock: LockConfig,
    pub cache: CacheConfig,
    pub buffer: BufferConfig,
    pub cluster: ClusterConfig,
}

impl RepositoryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock.timeout = Some(timeout);
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.buffer.temp_dir = Some(dir.into());
        self
    }

    pub fn with_keepalive_interval(mut self, bytes: u64) -> Self {
        self.buffer.keepalive_interval_bytes = bytes;
        self
    }

    pub fn with_chunk_size(mut self, bytes: usize) -> Self {
        self.buffer.chunk_size = bytes;
        self
    }

    pub fn with_cluster(mut self, node_id: impl Into<String>) -> Self {
        self.cluster = ClusterConfig {
            enabled: true,
            node_id: node_id.into(),
        };
        self
    }

    /// Create a config from environment variables.
    ///
    /// Environment variables:
    /// - `ARBOR_LOCK_TIMEOUT_MS`: path lock timeout (default: wait forever)
    /// - `ARBOR_CACHE_MAX_ENTRIES`: cache capacity (default: 10000)
    /// - `ARBOR_CACHE_TTL_SECS`: cache entry TTL (default: 3600)
    /// - `ARBOR_BUFFER_TEMP_DIR`: upload buffer directory (default: system temp)
    /// - `ARBOR_BUFFER_CHUNK_SIZE`: copy chunk size in bytes (default: 65536)
    /// - `ARBOR_BUFFER_KEEPALIVE_BYTES`: token keep-alive interval (default: 16 MiB)
    /// - `ARBOR_CLUSTER_ENABLED`: "true" or "false" (default: false)
    /// - `ARBOR_CLUSTER_NODE_ID`: node identifier (default: "local")
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) but reading from an arbitrary source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        let lock_timeout = parsed("ARBOR_LOCK_TIMEOUT_MS").map(Duration::from_millis);

        let max_entries = parsed("ARBOR_CACHE_MAX_ENTRIES")
            .map(|v| v as usize)
            .unwrap_or(defaults.cache.max_entries);

        let entry_ttl = parsed("ARBOR_CACHE_TTL_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.cache.entry_ttl);

        let temp_dir = lookup("ARBOR_BUFFER_TEMP_DIR")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        let chunk_size = parsed("ARBOR_BUFFER_CHUNK_SIZE")
            .map(|v| v as usize)
            .unwrap_or(defaults.buffer.chunk_size);

        let keepalive_interval_bytes = parsed("ARBOR_BUFFER_KEEPALIVE_BYTES")
            .unwrap_or(defaults.buffer.keepalive_interval_bytes);

        let cluster_enabled = lookup("ARBOR_CLUSTER_ENABLED")
            .map(|v| v.to_lowercase() == "true")
            .unwrap_or(defaults.cluster.enabled);

        let node_id = lookup("ARBOR_CLUSTER_NODE_ID").unwrap_or(defaults.cluster.node_id);

        Self {
            lock: LockConfig {
                timeout: lock_timeout,
            },
            cache: CacheConfig {
                max_entries,
                entry_ttl,
            },
            buffer: BufferConfig {
                temp_dir,
                chunk_size,
                keepalive_interval_bytes,
            },
            cluster: ClusterConfig {
                enabled: cluster_enabled,
                node_id,
            },
        }
    }

    /// Parse a TOML document; absent keys take their defaults.
    ///
    /// ```toml
    /// [lock]
    /// timeout_ms = 30000
    ///
    /// [cache]
    /// max_entries = 5000
    /// entry_ttl_secs = 600
    ///
    /// [buffer]
    /// temp_dir = "/var/tmp/arbor"
    /// chunk_size = 65536
    /// keepalive_interval_bytes = 8388608
    ///
    /// [cluster]
    /// enabled = true
    /// node_id = "node-a"
    /// ```
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(s).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        let defaults = Self::default();

        Ok(Self {
            lock: LockConfig {
                timeout: raw.lock.timeout_ms.map(Duration::from_millis),
            },
            cache: CacheConfig {
                max_entries: raw.cache.max_entries.unwrap_or(defaults.cache.max_entries),
                entry_ttl: raw
                    .cache
                    .entry_ttl_secs
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.cache.entry_ttl),
            },
            buffer: BufferConfig {
                temp_dir: raw.buffer.temp_dir,
                chunk_size: raw.buffer.chunk_size.unwrap_or(defaults.buffer.chunk_size),
                keepalive_interval_bytes: raw
                    .buffer
                    .keepalive_interval_bytes
                    .unwrap_or(defaults.buffer.keepalive_interval_bytes),
            },
            cluster: ClusterConfig {
                enabled: raw.cluster.enabled.unwrap_or(defaults.cluster.enabled),
                node_id: raw.cluster.node_id.unwrap_or(defaults.cluster.node_id),
            },
        })
    }

    /// Check invariants that the types alone cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lock.timeout == Some(Duration::ZERO) {
            return Err(ConfigError::InvalidValue {
                field: "lock.timeout".to_string(),
                value: "0".to_string(),
                reason: "must be positive; omit it to wait forever".to_string(),
            });
        }
        if self.cache.max_entries == 0 {
            return Err(ConfigError::InvalidValue {
                field: "cache.max_entries".to_string(),
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.buffer.chunk_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "buffer.chunk_size".to_string(),
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.buffer.keepalive_interval_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "buffer.keepalive_interval_bytes".to_string(),
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.cluster.enabled && self.cluster.node_id.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "cluster.node_id".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawConfig {
    lock: RawLock,
    cache: RawCache,
    buffer: RawBuffer,
    cluster: RawCluster,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawLock {
    timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawCache {
    max_entries: Option<usize>,
    entry_ttl_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawBuffer {
    temp_dir: Option<PathBuf>,
    chunk_size: Option<usize>,
    keepalive_interval_bytes: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawCluster {
    enabled: Option<bool>,
    node_id: Option<String>,
}
