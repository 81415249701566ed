//! In-memory path cache.
//!
//! Entries live in a `BTreeMap` keyed by the canonical path string. Every
//! descendant of `/a` starts with `/a/`, and all strings sharing a prefix are
//! contiguous in byte order, so descendant enumeration is a single range scan.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Instant;

use arbor_core::{CacheConfig, RepoPath, Resource};

use super::traits::{Cache, CacheStats};

#[derive(Debug, Clone)]
struct CachedEntry {
    resource: Resource,
    cached_at: Instant,
}

/// Thread-safe in-memory [`Cache`] with TTL expiry and a capacity bound.
#[derive(Debug)]
pub struct InMemoryCache {
    entries: RwLock<BTreeMap<String, CachedEntry>>,
    config: CacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    flushed: AtomicU64,
    evictions: AtomicU64,
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl InMemoryCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            flushed: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Whether an entry for `uri` is held, expired or not.
    pub fn contains(&self, uri: &RepoPath) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(uri.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every cached path, in order.
    pub fn paths(&self) -> Vec<RepoPath> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|entry| entry.resource.uri.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn evict_oldest(&self, entries: &mut BTreeMap<String, CachedEntry>) {
        while entries.len() > self.config.max_entries {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.cached_at)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    entries.remove(&key);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
                None => break,
            }
        }
    }
}

fn descendant_keys(entries: &BTreeMap<String, CachedEntry>, uri: &RepoPath) -> Vec<String> {
    let prefix = uri.descendant_prefix();
    entries
        .range(prefix.clone()..)
        .take_while(|(key, _)| key.starts_with(&prefix))
        .filter(|(key, _)| key.as_str() != uri.as_str())
        .map(|(key, _)| key.clone())
        .collect()
}

impl Cache for InMemoryCache {
    fn get(&self, uri: &RepoPath) -> Option<Resource> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        match entries.get(uri.as_str()) {
            Some(entry) if entry.cached_at.elapsed() <= self.config.entry_ttl => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.resource.clone())
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn put(&self, resource: Resource) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(
            resource.uri.as_str().to_string(),
            CachedEntry {
                resource,
                cached_at: Instant::now(),
            },
        );
        self.evict_oldest(&mut entries);
    }

    fn flush_from_cache(&self, uri: &RepoPath, include_descendants: bool) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let mut removed = u64::from(entries.remove(uri.as_str()).is_some());
        if include_descendants {
            for key in descendant_keys(&entries, uri) {
                entries.remove(&key);
                removed += 1;
            }
        }
        self.flushed.fetch_add(removed, Ordering::Relaxed);
        tracing::trace!(path = %uri, include_descendants, removed, "Flushed cache entries");
    }

    fn cached_descendant_paths(&self, uri: &RepoPath) -> Vec<RepoPath> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        descendant_keys(&entries, uri)
            .iter()
            .filter_map(|key| entries.get(key).map(|entry| entry.resource.uri.clone()))
            .collect()
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count: self.len() as u64,
            flushed: self.flushed.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}
