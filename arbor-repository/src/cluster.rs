//! Receiving side of the cluster flush protocol.
//!
//! A replica that hears about a peer's write takes the same EXCLUSIVE lock
//! scope a local write would, then flushes. The primary ignores flush
//! announcements. Until a role has been reported the node behaves like a
//! replica: a redundant flush costs a cache miss, a missed one serves stale
//! data.
//!
//! For the same reason a lock timeout never cancels a remote flush: the
//! replica flushes without the locks and logs the contention.

use std::collections::BTreeSet;

use arbor_cluster::{ClusterListener, ClusterMessage, ClusterRole, FlushMessage};
use arbor_core::{ArborError, ArborResult, LockError};

use crate::wrapper::LockingCacheControlRepositoryWrapper;

impl LockingCacheControlRepositoryWrapper {
    /// Apply a peer's flush announcement. Returns whether the local cache
    /// was flushed.
    pub fn handle_flush(&self, message: &FlushMessage) -> ArborResult<bool> {
        if message.origin == self.node_id() {
            return Ok(false);
        }
        if self.role() == Some(ClusterRole::Primary) {
            tracing::trace!(path = %message.path, origin = %message.origin, "Primary ignores flush announcement");
            return Ok(false);
        }

        let mut lock_set = BTreeSet::from([message.path.clone()]);
        if message.flush_descendants {
            lock_set.extend(self.cache().cached_descendant_paths(&message.path));
        }
        let guard = match self.lock_exclusive(lock_set) {
            Ok(guard) => Some(guard),
            Err(ArborError::Lock(LockError::Timeout { path, waited })) => {
                tracing::warn!(
                    path = %path,
                    ?waited,
                    origin = %message.origin,
                    "Path locks unavailable, flushing remote scope without them"
                );
                None
            }
            Err(e) => return Err(e),
        };
        self.cache()
            .flush_from_cache(&message.path, message.flush_descendants);
        drop(guard);
        tracing::debug!(
            path = %message.path,
            origin = %message.origin,
            operation = %message.operation,
            descendants = message.flush_descendants,
            "Applied remote flush"
        );
        Ok(true)
    }
}

impl ClusterListener for LockingCacheControlRepositoryWrapper {
    fn role_changed(&self, role: ClusterRole) {
        let previous = self.role();
        self.set_role(role);
        tracing::info!(?previous, role = %role, "Cluster role changed");
    }

    fn cluster_message(&self, message: ClusterMessage) {
        match message {
            ClusterMessage::Flush(flush) => {
                if let Err(e) = self.handle_flush(&flush) {
                    tracing::warn!(path = %flush.path, error = %e, "Failed to apply remote flush");
                }
            }
        }
    }
}
