//! Locking, cache-controlling repository decorator.
//!
//! Every call follows the same shape:
//!
//! 1. compute the lock set, including cached descendants where the write can
//!    change their cached state
//! 2. acquire it (SHARED for reads, EXCLUSIVE for writes)
//! 3. call the wrapped repository
//! 4. on success only, flush the affected cache scope, then announce each
//!    flushed scope to the cluster
//! 5. release the locks, on every exit path
//!
//! Errors from the wrapped repository pass through unchanged.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use arbor_cluster::{ClusterRole, ClusterTransport, FlushMessage, MessageType};
use arbor_core::{
    Acl, ArborResult, Comment, ContentSource, EntityId, LockDepth, LockMode, RecoverableResource,
    RepoPath, RepositoryConfig, Resource, Revision, RevisionKind, SearchQuery, StoreContext, Token,
};
use arbor_storage::{Cache, Repository, TokenManager};

use crate::buffer::ContentBuffer;
use crate::path_lock::{PathLockGuard, PathLockManager};

/// Write operations, as labelled in flush announcements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteOperation {
    CreateCollection,
    CreateDocument,
    Copy,
    Move,
    Delete,
    Store,
    StoreContent,
    Lock,
    Unlock,
    StoreAcl,
    DeleteAcl,
    CreateRevision,
    DeleteRevision,
    AddComment,
    UpdateComment,
    DeleteComment,
    DeleteAllComments,
    Recover,
    DeleteRecoverable,
}

impl WriteOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteOperation::CreateCollection => "create_collection",
            WriteOperation::CreateDocument => "create_document",
            WriteOperation::Copy => "copy",
            WriteOperation::Move => "move",
            WriteOperation::Delete => "delete",
            WriteOperation::Store => "store",
            WriteOperation::StoreContent => "store_content",
            WriteOperation::Lock => "lock",
            WriteOperation::Unlock => "unlock",
            WriteOperation::StoreAcl => "store_acl",
            WriteOperation::DeleteAcl => "delete_acl",
            WriteOperation::CreateRevision => "create_revision",
            WriteOperation::DeleteRevision => "delete_revision",
            WriteOperation::AddComment => "add_comment",
            WriteOperation::UpdateComment => "update_comment",
            WriteOperation::DeleteComment => "delete_comment",
            WriteOperation::DeleteAllComments => "delete_all_comments",
            WriteOperation::Recover => "recover",
            WriteOperation::DeleteRecoverable => "delete_recoverable",
        }
    }
}

impl fmt::Display for WriteOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cache scopes to flush after a write, keyed by path. A path flushed both
/// alone and with its descendants is flushed once, recursively.
#[derive(Debug, Default)]
struct FlushPlan(BTreeMap<RepoPath, bool>);

impl FlushPlan {
    fn path(mut self, path: &RepoPath) -> Self {
        self.0.entry(path.clone()).or_insert(false);
        self
    }

    fn subtree(mut self, path: &RepoPath) -> Self {
        self.0.insert(path.clone(), true);
        self
    }

    fn parent_of(self, path: &RepoPath) -> Self {
        match path.parent() {
            Some(parent) => self.path(&parent),
            None => self,
        }
    }
}

/// Decorates a [`Repository`] with path locking, cache flushing and cluster
/// flush announcements.
///
/// Owns its [`PathLockManager`]; every caller sharing a cache must go
/// through the same wrapper instance for the locking to mean anything.
pub struct LockingCacheControlRepositoryWrapper {
    delegate: Arc<dyn Repository>,
    cache: Arc<dyn Cache>,
    locks: PathLockManager,
    buffer: ContentBuffer,
    cluster: Option<Arc<dyn ClusterTransport>>,
    role: RwLock<Option<ClusterRole>>,
    config: RepositoryConfig,
}

impl LockingCacheControlRepositoryWrapper {
    pub fn new(
        delegate: Arc<dyn Repository>,
        cache: Arc<dyn Cache>,
        config: RepositoryConfig,
    ) -> Self {
        Self {
            delegate,
            cache,
            locks: PathLockManager::from_config(&config.lock),
            buffer: ContentBuffer::new(config.buffer.clone(), None),
            cluster: None,
            role: RwLock::new(None),
            config,
        }
    }

    /// Refresh sessions through `tokens` while buffering uploads.
    pub fn with_token_manager(mut self, tokens: Arc<dyn TokenManager>) -> Self {
        self.buffer = ContentBuffer::new(self.config.buffer.clone(), Some(tokens));
        self
    }

    /// Announce flushes through `transport` and subscribe to peers'
    /// announcements. Ignored unless clustering is enabled in the config.
    pub fn with_cluster(mut self, transport: Arc<dyn ClusterTransport>) -> ArborResult<Self> {
        if !self.config.cluster.enabled {
            tracing::info!(node_id = %transport.node_id(), "Cluster transport supplied but clustering is disabled");
            return Ok(self);
        }
        if transport.node_id() != self.config.cluster.node_id {
            tracing::warn!(
                configured = %self.config.cluster.node_id,
                transport = %transport.node_id(),
                "Cluster node id differs from configuration"
            );
        }
        transport.subscribe(MessageType::Flush)?;
        self.cluster = Some(transport);
        Ok(self)
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<dyn Cache> {
        &self.cache
    }

    pub fn lock_manager(&self) -> &PathLockManager {
        &self.locks
    }

    /// Current cluster role; `None` until the transport reports one.
    pub fn role(&self) -> Option<ClusterRole> {
        *self.role.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_role(&self, role: ClusterRole) {
        *self.role.write().unwrap_or_else(PoisonError::into_inner) = Some(role);
    }

    pub(crate) fn node_id(&self) -> &str {
        self.cluster
            .as_ref()
            .map(|c| c.node_id())
            .unwrap_or(&self.config.cluster.node_id)
    }

    // ------------------------------------------------------------------
    // Lock sets
    // ------------------------------------------------------------------

    fn cached_descendants(&self, uri: &RepoPath) -> Vec<RepoPath> {
        self.cache.cached_descendant_paths(uri)
    }

    pub(crate) fn lock_exclusive(
        &self,
        paths: BTreeSet<RepoPath>,
    ) -> ArborResult<PathLockGuard<'_>> {
        self.locks.lock(paths, LockMode::Exclusive)
    }

    fn read<T>(&self, uri: &RepoPath, call: impl FnOnce() -> ArborResult<T>) -> ArborResult<T> {
        let _guard = self.locks.lock([uri.clone()], LockMode::Shared)?;
        call()
    }

    /// Lock `lock_set` exclusively, run `call`, and on success flush and
    /// announce `plan`.
    fn write<T>(
        &self,
        operation: WriteOperation,
        lock_set: BTreeSet<RepoPath>,
        plan: FlushPlan,
        call: impl FnOnce() -> ArborResult<T>,
    ) -> ArborResult<T> {
        let guard = self.lock_exclusive(lock_set)?;
        tracing::debug!(operation = %operation, locked = guard.len(), "Write locks acquired");

        let result = call()?;

        for (path, recursive) in &plan.0 {
            if *recursive {
                self.log_late_descendants(operation, path, guard.paths());
            }
            self.cache.flush_from_cache(path, *recursive);
        }
        for (path, recursive) in plan.0 {
            self.announce(operation, path, recursive);
        }
        drop(guard);
        Ok(result)
    }

    /// Descendants cached after the lock set was computed are not locked.
    /// The recursive flush still removes them.
    fn log_late_descendants(&self, operation: WriteOperation, path: &RepoPath, locked: &[RepoPath]) {
        let late = self
            .cached_descendants(path)
            .into_iter()
            .filter(|p| locked.binary_search(p).is_err())
            .count();
        if late > 0 {
            tracing::debug!(operation = %operation, path = %path, late, "Descendants cached after lock set was computed");
        }
    }

    fn announce(&self, operation: WriteOperation, path: RepoPath, flush_descendants: bool) {
        let Some(cluster) = &self.cluster else {
            return;
        };
        let message = FlushMessage::new(cluster.node_id(), path, flush_descendants, operation.as_str());
        if let Err(e) = cluster.cluster_message(message.into()) {
            tracing::warn!(operation = %operation, error = %e, "Dropped cluster flush message");
        }
    }

    fn buffered<T>(
        &self,
        token: &Token,
        content: ContentSource,
        call: impl FnOnce(ContentSource) -> ArborResult<T>,
    ) -> ArborResult<T> {
        let (source, _cleanup) = self.buffer.buffer(token, content)?.into_parts();
        call(source)
    }
}

fn with_parent(uri: &RepoPath) -> BTreeSet<RepoPath> {
    let mut set = BTreeSet::new();
    if let Some(parent) = uri.parent() {
        set.insert(parent);
    }
    set.insert(uri.clone());
    set
}

impl Repository for LockingCacheControlRepositoryWrapper {
    fn retrieve(&self, token: &Token, uri: &RepoPath, for_processing: bool) -> ArborResult<Resource> {
        self.read(uri, || self.delegate.retrieve(token, uri, for_processing))
    }

    fn exists(&self, token: &Token, uri: &RepoPath) -> ArborResult<bool> {
        self.read(uri, || self.delegate.exists(token, uri))
    }

    fn list_children(
        &self,
        token: &Token,
        uri: &RepoPath,
        for_processing: bool,
    ) -> ArborResult<Vec<Resource>> {
        self.read(uri, || self.delegate.list_children(token, uri, for_processing))
    }

    fn read_content(&self, token: &Token, uri: &RepoPath, for_processing: bool) -> ArborResult<Vec<u8>> {
        self.read(uri, || self.delegate.read_content(token, uri, for_processing))
    }

    fn get_revisions(&self, token: &Token, uri: &RepoPath) -> ArborResult<Vec<Revision>> {
        self.read(uri, || self.delegate.get_revisions(token, uri))
    }

    fn get_comments(&self, token: &Token, uri: &RepoPath) -> ArborResult<Vec<Comment>> {
        self.read(uri, || self.delegate.get_comments(token, uri))
    }

    fn get_recoverable_resources(
        &self,
        token: &Token,
        parent: &RepoPath,
    ) -> ArborResult<Vec<RecoverableResource>> {
        self.read(parent, || self.delegate.get_recoverable_resources(token, parent))
    }

    fn search(&self, token: &Token, query: &SearchQuery) -> ArborResult<Vec<Resource>> {
        self.delegate.search(token, query)
    }

    fn create_collection(&self, token: &Token, uri: &RepoPath) -> ArborResult<Resource> {
        self.write(
            WriteOperation::CreateCollection,
            with_parent(uri),
            FlushPlan::default().parent_of(uri),
            || self.delegate.create_collection(token, uri),
        )
    }

    fn create_document(
        &self,
        token: &Token,
        uri: &RepoPath,
        content: ContentSource,
    ) -> ArborResult<Resource> {
        self.buffered(token, content, |source| {
            self.write(
                WriteOperation::CreateDocument,
                with_parent(uri),
                FlushPlan::default().parent_of(uri),
                || self.delegate.create_document(token, uri, source),
            )
        })
    }

    fn store(&self, token: &Token, resource: Resource, context: StoreContext) -> ArborResult<Resource> {
        let uri = resource.uri.clone();
        let mut lock_set = BTreeSet::from([uri.clone()]);
        let plan = if context.affects_descendants() {
            lock_set.extend(self.cached_descendants(&uri));
            FlushPlan::default().subtree(&uri)
        } else {
            FlushPlan::default().path(&uri)
        };
        self.write(WriteOperation::Store, lock_set, plan, || {
            self.delegate.store(token, resource, context)
        })
    }

    fn store_content(
        &self,
        token: &Token,
        uri: &RepoPath,
        content: ContentSource,
    ) -> ArborResult<Resource> {
        self.buffered(token, content, |source| {
            self.write(
                WriteOperation::StoreContent,
                BTreeSet::from([uri.clone()]),
                FlushPlan::default().path(uri),
                || self.delegate.store_content(token, uri, source),
            )
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
        let mut lock_set = with_parent(dest);
        if overwrite {
            lock_set.extend(self.cached_descendants(dest));
        }
        self.write(
            WriteOperation::Copy,
            lock_set,
            FlushPlan::default().subtree(dest).parent_of(dest),
            || self.delegate.copy(token, src, dest, overwrite, preserve_acl),
        )
    }

    fn move_resource(
        &self,
        token: &Token,
        src: &RepoPath,
        dest: &RepoPath,
        overwrite: bool,
    ) -> ArborResult<Resource> {
        let mut lock_set = with_parent(src);
        lock_set.extend(self.cached_descendants(src));
        lock_set.extend(with_parent(dest));
        if overwrite {
            lock_set.extend(self.cached_descendants(dest));
        }
        self.write(
            WriteOperation::Move,
            lock_set,
            FlushPlan::default()
                .subtree(src)
                .subtree(dest)
                .parent_of(src)
                .parent_of(dest),
            || self.delegate.move_resource(token, src, dest, overwrite),
        )
    }

    fn delete(&self, token: &Token, uri: &RepoPath, restorable: bool) -> ArborResult<()> {
        let mut lock_set = with_parent(uri);
        lock_set.extend(self.cached_descendants(uri));
        self.write(
            WriteOperation::Delete,
            lock_set,
            FlushPlan::default().subtree(uri).parent_of(uri),
            || self.delegate.delete(token, uri, restorable),
        )
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
        self.write(
            WriteOperation::Lock,
            BTreeSet::from([uri.clone()]),
            FlushPlan::default().path(uri),
            || {
                self.delegate
                    .lock(token, uri, owner_info, depth, timeout, lock_token)
            },
        )
    }

    fn unlock(&self, token: &Token, uri: &RepoPath, lock_token: Option<&str>) -> ArborResult<()> {
        self.write(
            WriteOperation::Unlock,
            BTreeSet::from([uri.clone()]),
            FlushPlan::default().path(uri),
            || self.delegate.unlock(token, uri, lock_token),
        )
    }

    fn store_acl(&self, token: &Token, uri: &RepoPath, acl: Acl) -> ArborResult<Resource> {
        let mut lock_set = BTreeSet::from([uri.clone()]);
        lock_set.extend(self.cached_descendants(uri));
        self.write(
            WriteOperation::StoreAcl,
            lock_set,
            FlushPlan::default().subtree(uri),
            || self.delegate.store_acl(token, uri, acl),
        )
    }

    fn delete_acl(&self, token: &Token, uri: &RepoPath) -> ArborResult<Resource> {
        let mut lock_set = BTreeSet::from([uri.clone()]);
        lock_set.extend(self.cached_descendants(uri));
        self.write(
            WriteOperation::DeleteAcl,
            lock_set,
            FlushPlan::default().subtree(uri),
            || self.delegate.delete_acl(token, uri),
        )
    }

    fn create_revision(&self, token: &Token, uri: &RepoPath, kind: RevisionKind) -> ArborResult<Revision> {
        self.write(
            WriteOperation::CreateRevision,
            BTreeSet::from([uri.clone()]),
            FlushPlan::default().path(uri),
            || self.delegate.create_revision(token, uri, kind),
        )
    }

    fn delete_revision(&self, token: &Token, uri: &RepoPath, revision_id: u64) -> ArborResult<()> {
        self.write(
            WriteOperation::DeleteRevision,
            BTreeSet::from([uri.clone()]),
            FlushPlan::default().path(uri),
            || self.delegate.delete_revision(token, uri, revision_id),
        )
    }

    fn recover(
        &self,
        token: &Token,
        parent: &RepoPath,
        recoverable: &RecoverableResource,
    ) -> ArborResult<Resource> {
        let target = parent.extend(&recoverable.name)?;
        self.write(
            WriteOperation::Recover,
            BTreeSet::from([parent.clone(), target]),
            FlushPlan::default().path(parent),
            || self.delegate.recover(token, parent, recoverable),
        )
    }

    fn delete_recoverable(
        &self,
        token: &Token,
        parent: &RepoPath,
        recoverable: &RecoverableResource,
    ) -> ArborResult<()> {
        self.write(
            WriteOperation::DeleteRecoverable,
            BTreeSet::from([parent.clone()]),
            FlushPlan::default().path(parent),
            || self.delegate.delete_recoverable(token, parent, recoverable),
        )
    }

    fn add_comment(&self, token: &Token, uri: &RepoPath, title: &str, text: &str) -> ArborResult<Comment> {
        self.write(
            WriteOperation::AddComment,
            BTreeSet::from([uri.clone()]),
            FlushPlan::default().path(uri),
            || self.delegate.add_comment(token, uri, title, text),
        )
    }

    fn update_comment(&self, token: &Token, uri: &RepoPath, comment: Comment) -> ArborResult<Comment> {
        self.write(
            WriteOperation::UpdateComment,
            BTreeSet::from([uri.clone()]),
            FlushPlan::default().path(uri),
            || self.delegate.update_comment(token, uri, comment),
        )
    }

    fn delete_comment(&self, token: &Token, uri: &RepoPath, comment_id: EntityId) -> ArborResult<()> {
        self.write(
            WriteOperation::DeleteComment,
            BTreeSet::from([uri.clone()]),
            FlushPlan::default().path(uri),
            || self.delegate.delete_comment(token, uri, comment_id),
        )
    }

    fn delete_all_comments(&self, token: &Token, uri: &RepoPath) -> ArborResult<()> {
        self.write(
            WriteOperation::DeleteAllComments,
            BTreeSet::from([uri.clone()]),
            FlushPlan::default().path(uri),
            || self.delegate.delete_all_comments(token, uri),
        )
    }
}
