//! Cache trait and statistics.

use arbor_core::{RepoPath, Resource};

/// Path-keyed cache of resource snapshots.
///
/// Implementations must be thread-safe. The concurrency layer only flushes
/// entries while holding path locks, so implementations need no ordering
/// guarantees beyond their own internal consistency.
pub trait Cache: Send + Sync {
    /// Cached snapshot for `uri`, if present and not expired.
    fn get(&self, uri: &RepoPath) -> Option<Resource>;

    /// Insert or replace the snapshot for `resource.uri`.
    fn put(&self, resource: Resource);

    /// Remove `uri`, and every cached descendant of it if `include_descendants`.
    ///
    /// The descendant set is whatever the cache currently holds; nothing is
    /// looked up in persistent storage.
    fn flush_from_cache(&self, uri: &RepoPath, include_descendants: bool);

    /// Every cached path strictly below `uri`.
    fn cached_descendant_paths(&self, uri: &RepoPath) -> Vec<RepoPath>;

    /// Usage statistics.
    fn stats(&self) -> CacheStats;
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses (including expired entries).
    pub misses: u64,
    /// Number of entries currently in cache.
    pub entry_count: u64,
    /// Number of entries removed by flushes.
    pub flushed: u64,
    /// Number of evictions due to capacity.
    pub evictions: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
