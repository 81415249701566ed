#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use arbor_core::{CacheConfig, RepositoryConfig};
use arbor_repository::LockingCacheControlRepositoryWrapper;
use arbor_test_utils::{MockRepository, RecordingCache, RecordingRepository, RecordingTransport};

/// A wrapper over a recording delegate whose mock repository reads through
/// the same recording cache the wrapper flushes.
pub struct Harness {
    pub delegate: Arc<RecordingRepository>,
    pub cache: Arc<RecordingCache>,
    pub transport: Arc<RecordingTransport>,
    pub wrapper: Arc<LockingCacheControlRepositoryWrapper>,
}

pub fn test_config() -> RepositoryConfig {
    RepositoryConfig::default()
        .with_lock_timeout(Duration::from_secs(10))
        .with_cluster("node-a")
}

pub fn harness() -> Harness {
    harness_with(test_config())
}

pub fn harness_with(config: RepositoryConfig) -> Harness {
    arbor_test_utils::init_tracing();
    let cache = Arc::new(RecordingCache::new(CacheConfig::default()));
    let delegate = Arc::new(RecordingRepository::wrapping(
        MockRepository::new().with_cache(cache.clone()),
    ));
    let transport = Arc::new(RecordingTransport::new("node-a"));
    let wrapper = LockingCacheControlRepositoryWrapper::new(delegate.clone(), cache.clone(), config)
        .with_cluster(transport.clone())
        .expect("Failed to attach cluster transport");
    Harness {
        delegate,
        cache,
        transport,
        wrapper: Arc::new(wrapper),
    }
}

impl Harness {
    /// Forget setup traffic so assertions only see the operation under test.
    pub fn reset_recordings(&self) {
        self.delegate.clear_calls();
        self.delegate.reset_peak();
        self.cache.clear_flushes();
        self.transport.clear();
    }
}
