//! Arbor Repository - Path-Locking Cache Control
//!
//! Concurrency layer for a hierarchical content repository. Wraps any
//! [`Repository`](arbor_storage::Repository) so that:
//!
//! - operations on overlapping parts of the path tree are serialized by
//!   [`PathLockManager`], reads sharing and writes excluding
//! - the read-through cache is flushed after each write commits, at exactly
//!   the granularity the write could have made stale
//! - every flush is announced to cluster peers, and replicas apply peers'
//!   announcements under the same locks
//! - uploads are buffered to disk before any lock is taken
//!
//! ```no_run
//! use std::sync::Arc;
//! use arbor_core::{RepoPath, RepositoryConfig, Token};
//! use arbor_repository::LockingCacheControlRepositoryWrapper;
//! use arbor_storage::{InMemoryCache, MockRepository, Repository};
//!
//! let cache = Arc::new(InMemoryCache::default());
//! let engine = Arc::new(MockRepository::new().with_cache(cache.clone()));
//! let repo = LockingCacheControlRepositoryWrapper::new(engine, cache, RepositoryConfig::from_env());
//!
//! let token = Token::new("alice");
//! repo.create_collection(&token, &RepoPath::parse("/docs")?)?;
//! # Ok::<(), arbor_core::ArborError>(())
//! ```

pub mod buffer;
pub mod cluster;
pub mod path_lock;
pub mod wrapper;

pub use buffer::{BufferedContent, ContentBuffer};
pub use path_lock::{LockStats, PathLockGuard, PathLockManager};
pub use wrapper::{LockingCacheControlRepositoryWrapper, WriteOperation};
