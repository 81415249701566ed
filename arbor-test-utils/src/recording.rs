//! Instrumented fakes.
//!
//! [`RecordingRepository`] runs every call against a [`MockRepository`]
//! while recording when it entered and left, so tests can check which
//! critical sections overlapped. Calls can be slowed down and failures
//! injected per operation. [`RecordingCache`] and [`RecordingTransport`]
//! record what the concurrency layer flushed and announced.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use arbor_cluster::{ClusterMessage, ClusterTransport, FlushMessage, MessageType};
use arbor_core::{
    Acl, ArborResult, CacheConfig, ClusterError, Comment, ContentSource, EntityId, LockDepth,
    RecoverableResource, RepoPath, RepositoryError, Resource, Revision, RevisionKind,
    SearchQuery, StoreContext, Token,
};
use arbor_storage::{Cache, CacheStats, InMemoryCache, MockRepository, Repository};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// RECORDING REPOSITORY
// ============================================================================

/// One delegate call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    pub operation: &'static str,
    pub path: RepoPath,
    pub thread: ThreadId,
    pub entered: Instant,
    pub exited: Instant,
    pub succeeded: bool,
}

impl CallRecord {
    /// Whether the two calls were in flight at the same time.
    pub fn overlaps(&self, other: &CallRecord) -> bool {
        self.entered < other.exited && other.entered < self.exited
    }
}

/// Delegate repository that records every call.
#[derive(Default)]
pub struct RecordingRepository {
    inner: MockRepository,
    calls: Mutex<Vec<CallRecord>>,
    default_delay: Mutex<Duration>,
    delays: Mutex<HashMap<&'static str, Duration>>,
    failures: Mutex<HashMap<&'static str, usize>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl RecordingRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record calls made against `inner`.
    pub fn wrapping(inner: MockRepository) -> Self {
        Self {
            inner,
            ..Self::default()
        }
    }

    /// Sleep this long inside every call.
    pub fn with_delay(self, delay: Duration) -> Self {
        *lock(&self.default_delay) = delay;
        self
    }

    /// Sleep `delay` inside calls to `operation`, overriding the default.
    pub fn set_delay(&self, operation: &'static str, delay: Duration) {
        lock(&self.delays).insert(operation, delay);
    }

    /// Make the next call to `operation` fail after doing its simulated work.
    /// The underlying repository is left untouched.
    pub fn fail_next(&self, operation: &'static str) {
        *lock(&self.failures).entry(operation).or_insert(0) += 1;
    }

    pub fn inner(&self) -> &MockRepository {
        &self.inner
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        lock(&self.calls).clone()
    }

    pub fn calls_for(&self, operation: &str) -> Vec<CallRecord> {
        lock(&self.calls)
            .iter()
            .filter(|c| c.operation == operation)
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    /// Most calls ever in flight at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn reset_peak(&self) {
        self.peak.store(0, Ordering::SeqCst);
    }

    fn take_failure(&self, operation: &'static str) -> bool {
        let mut failures = lock(&self.failures);
        match failures.get_mut(operation) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    fn delay_for(&self, operation: &'static str) -> Duration {
        lock(&self.delays)
            .get(operation)
            .copied()
            .unwrap_or_else(|| *lock(&self.default_delay))
    }

    fn record<T>(
        &self,
        operation: &'static str,
        path: &RepoPath,
        call: impl FnOnce() -> ArborResult<T>,
    ) -> ArborResult<T> {
        let entered = Instant::now();
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let delay = self.delay_for(operation);
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        let result = if self.take_failure(operation) {
            Err(RepositoryError::IllegalOperation {
                reason: format!("injected failure in {}", operation),
            }
            .into())
        } else {
            call()
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        lock(&self.calls).push(CallRecord {
            operation,
            path: path.clone(),
            thread: thread::current().id(),
            entered,
            exited: Instant::now(),
            succeeded: result.is_ok(),
        });
        result
    }
}

impl Repository for RecordingRepository {
    fn retrieve(&self, token: &Token, uri: &RepoPath, for_processing: bool) -> ArborResult<Resource> {
        self.record("retrieve", uri, || self.inner.retrieve(token, uri, for_processing))
    }

    fn exists(&self, token: &Token, uri: &RepoPath) -> ArborResult<bool> {
        self.record("exists", uri, || self.inner.exists(token, uri))
    }

    fn list_children(
        &self,
        token: &Token,
        uri: &RepoPath,
        for_processing: bool,
    ) -> ArborResult<Vec<Resource>> {
        self.record("list_children", uri, || {
            self.inner.list_children(token, uri, for_processing)
        })
    }

    fn read_content(&self, token: &Token, uri: &RepoPath, for_processing: bool) -> ArborResult<Vec<u8>> {
        self.record("read_content", uri, || {
            self.inner.read_content(token, uri, for_processing)
        })
    }

    fn get_revisions(&self, token: &Token, uri: &RepoPath) -> ArborResult<Vec<Revision>> {
        self.record("get_revisions", uri, || self.inner.get_revisions(token, uri))
    }

    fn get_comments(&self, token: &Token, uri: &RepoPath) -> ArborResult<Vec<Comment>> {
        self.record("get_comments", uri, || self.inner.get_comments(token, uri))
    }

    fn get_recoverable_resources(
        &self,
        token: &Token,
        parent: &RepoPath,
    ) -> ArborResult<Vec<RecoverableResource>> {
        self.record("get_recoverable_resources", parent, || {
            self.inner.get_recoverable_resources(token, parent)
        })
    }

    fn search(&self, token: &Token, query: &SearchQuery) -> ArborResult<Vec<Resource>> {
        self.record("search", &query.scope, || self.inner.search(token, query))
    }

    fn create_collection(&self, token: &Token, uri: &RepoPath) -> ArborResult<Resource> {
        self.record("create_collection", uri, || {
            self.inner.create_collection(token, uri)
        })
    }

    fn create_document(
        &self,
        token: &Token,
        uri: &RepoPath,
        content: ContentSource,
    ) -> ArborResult<Resource> {
        self.record("create_document", uri, || {
            self.inner.create_document(token, uri, content)
        })
    }

    fn store(&self, token: &Token, resource: Resource, context: StoreContext) -> ArborResult<Resource> {
        let uri = resource.uri.clone();
        self.record("store", &uri, || self.inner.store(token, resource, context))
    }

    fn store_content(
        &self,
        token: &Token,
        uri: &RepoPath,
        content: ContentSource,
    ) -> ArborResult<Resource> {
        self.record("store_content", uri, || {
            self.inner.store_content(token, uri, content)
        })
    }

    fn copy(
        &self,
        token: &Token,
        src: &RepoPath,
        dest: &RepoPath,
        overwrite: bool,
        preserve_acl: bool,
    ) -> ArborResult<Resource> {
        self.record("copy", dest, || {
            self.inner.copy(token, src, dest, overwrite, preserve_acl)
        })
    }

    fn move_resource(
        &self,
        token: &Token,
        src: &RepoPath,
        dest: &RepoPath,
        overwrite: bool,
    ) -> ArborResult<Resource> {
        self.record("move", src, || {
            self.inner.move_resource(token, src, dest, overwrite)
        })
    }

    fn delete(&self, token: &Token, uri: &RepoPath, restorable: bool) -> ArborResult<()> {
        self.record("delete", uri, || self.inner.delete(token, uri, restorable))
    }

    fn lock(
        &self,
        token: &Token,
        uri: &RepoPath,
        owner_info: &str,
        depth: LockDepth,
        timeout: Duration,
        lock_token: Option<&str>,
    ) -> ArborResult<Resource> {
        self.record("lock", uri, || {
            self.inner
                .lock(token, uri, owner_info, depth, timeout, lock_token)
        })
    }

    fn unlock(&self, token: &Token, uri: &RepoPath, lock_token: Option<&str>) -> ArborResult<()> {
        self.record("unlock", uri, || self.inner.unlock(token, uri, lock_token))
    }

    fn store_acl(&self, token: &Token, uri: &RepoPath, acl: Acl) -> ArborResult<Resource> {
        self.record("store_acl", uri, || self.inner.store_acl(token, uri, acl))
    }

    fn delete_acl(&self, token: &Token, uri: &RepoPath) -> ArborResult<Resource> {
        self.record("delete_acl", uri, || self.inner.delete_acl(token, uri))
    }

    fn create_revision(&self, token: &Token, uri: &RepoPath, kind: RevisionKind) -> ArborResult<Revision> {
        self.record("create_revision", uri, || {
            self.inner.create_revision(token, uri, kind)
        })
    }

    fn delete_revision(&self, token: &Token, uri: &RepoPath, revision_id: u64) -> ArborResult<()> {
        self.record("delete_revision", uri, || {
            self.inner.delete_revision(token, uri, revision_id)
        })
    }

    fn recover(
        &self,
        token: &Token,
        parent: &RepoPath,
        recoverable: &RecoverableResource,
    ) -> ArborResult<Resource> {
        self.record("recover", parent, || {
            self.inner.recover(token, parent, recoverable)
        })
    }

    fn delete_recoverable(
        &self,
        token: &Token,
        parent: &RepoPath,
        recoverable: &RecoverableResource,
    ) -> ArborResult<()> {
        self.record("delete_recoverable", parent, || {
            self.inner.delete_recoverable(token, parent, recoverable)
        })
    }

    fn add_comment(&self, token: &Token, uri: &RepoPath, title: &str, text: &str) -> ArborResult<Comment> {
        self.record("add_comment", uri, || {
            self.inner.add_comment(token, uri, title, text)
        })
    }

    fn update_comment(&self, token: &Token, uri: &RepoPath, comment: Comment) -> ArborResult<Comment> {
        self.record("update_comment", uri, || {
            self.inner.update_comment(token, uri, comment)
        })
    }

    fn delete_comment(&self, token: &Token, uri: &RepoPath, comment_id: EntityId) -> ArborResult<()> {
        self.record("delete_comment", uri, || {
            self.inner.delete_comment(token, uri, comment_id)
        })
    }

    fn delete_all_comments(&self, token: &Token, uri: &RepoPath) -> ArborResult<()> {
        self.record("delete_all_comments", uri, || {
            self.inner.delete_all_comments(token, uri)
        })
    }
}

// ============================================================================
// RECORDING CACHE
// ============================================================================

/// [`InMemoryCache`] that remembers every flush request.
#[derive(Debug, Default)]
pub struct RecordingCache {
    inner: InMemoryCache,
    flushes: Mutex<Vec<(RepoPath, bool)>>,
}

impl RecordingCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: InMemoryCache::new(config),
            flushes: Mutex::new(Vec::new()),
        }
    }

    pub fn inner(&self) -> &InMemoryCache {
        &self.inner
    }

    /// Flush requests in call order, as `(path, include_descendants)`.
    pub fn flushes(&self) -> Vec<(RepoPath, bool)> {
        lock(&self.flushes).clone()
    }

    pub fn clear_flushes(&self) {
        lock(&self.flushes).clear();
    }

    pub fn contains(&self, uri: &RepoPath) -> bool {
        self.inner.contains(uri)
    }
}

impl Cache for RecordingCache {
    fn get(&self, uri: &RepoPath) -> Option<Resource> {
        self.inner.get(uri)
    }

    fn put(&self, resource: Resource) {
        self.inner.put(resource)
    }

    fn flush_from_cache(&self, uri: &RepoPath, include_descendants: bool) {
        lock(&self.flushes).push((uri.clone(), include_descendants));
        self.inner.flush_from_cache(uri, include_descendants)
    }

    fn cached_descendant_paths(&self, uri: &RepoPath) -> Vec<RepoPath> {
        self.inner.cached_descendant_paths(uri)
    }

    fn stats(&self) -> CacheStats {
        self.inner.stats()
    }
}

// ============================================================================
// RECORDING TRANSPORT
// ============================================================================

/// Cluster transport that keeps what it is asked to send.
#[derive(Debug)]
pub struct RecordingTransport {
    node_id: String,
    sent: Mutex<Vec<ClusterMessage>>,
    subscriptions: Mutex<HashSet<MessageType>>,
    failing: AtomicBool,
}

impl RecordingTransport {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            sent: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(HashSet::new()),
            failing: AtomicBool::new(false),
        }
    }

    /// Make every send fail with [`ClusterError::Disconnected`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<ClusterMessage> {
        lock(&self.sent).clone()
    }

    /// Sent flush messages as `(path, flush_descendants, operation)`.
    pub fn flush_scopes(&self) -> Vec<(RepoPath, bool, String)> {
        self.flush_messages()
            .into_iter()
            .map(|m| (m.path, m.flush_descendants, m.operation))
            .collect()
    }

    pub fn flush_messages(&self) -> Vec<FlushMessage> {
        lock(&self.sent)
            .iter()
            .map(|message| match message {
                ClusterMessage::Flush(flush) => flush.clone(),
            })
            .collect()
    }

    pub fn clear(&self) {
        lock(&self.sent).clear();
    }

    pub fn is_subscribed(&self, message_type: MessageType) -> bool {
        lock(&self.subscriptions).contains(&message_type)
    }
}

impl ClusterTransport for RecordingTransport {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn subscribe(&self, message_type: MessageType) -> Result<(), ClusterError> {
        lock(&self.subscriptions).insert(message_type);
        Ok(())
    }

    fn cluster_message(&self, message: ClusterMessage) -> Result<(), ClusterError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ClusterError::Disconnected {
                node_id: self.node_id.clone(),
            });
        }
        lock(&self.sent).push(message);
        Ok(())
    }
}
