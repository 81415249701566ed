//! Path-keyed resource cache.
//!
//! The cache maps a [`RepoPath`](arbor_core::RepoPath) to a resource
//! snapshot. It knows nothing about locking: the concurrency layer decides
//! when entries are flushed, and asks the cache which descendants of a path
//! it currently holds so it can lock and flush them too.

pub mod in_memory;
pub mod traits;

pub use in_memory::InMemoryCache;
pub use traits::{Cache, CacheStats};
