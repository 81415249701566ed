//! In-memory repository for testing.
//!
//! [`MockRepository`] keeps the whole tree in a `BTreeMap` behind one
//! `RwLock`. Every mutation runs under the write lock from validation to
//! commit, which makes each call atomic: it either applies completely or
//! returns an error and changes nothing.
//!
//! When built with a cache, `retrieve` reads through it: hits are served
//! from the cache and misses populate it. The mock never flushes the
//! cache itself; that is the job of the concurrency layer.

use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use arbor_core::{
    new_entity_id, Acl, ArborError, ArborResult, Comment, ContentSource, EntityId, LockDepth,
    LockError, RecoverableResource, RepoPath, RepositoryError, Resource, ResourceKind,
    ResourceLock, Revision, RevisionKind, SearchQuery, StoreContext, Timestamp, Token,
};
use chrono::Utc;
use sha2::{Digest, Sha256};

use crate::{Cache, Repository, TokenManager};

const SYSTEM_PRINCIPAL: &str = "system";

#[derive(Debug, Clone)]
struct Node {
    resource: Resource,
    content: Vec<u8>,
    acl: Option<Acl>,
    revisions: Vec<(Revision, Vec<u8>)>,
    comments: Vec<Comment>,
}

impl Node {
    fn new(uri: RepoPath, kind: ResourceKind, principal: &str, content: Vec<u8>) -> Self {
        let now = Utc::now();
        let etag = (kind == ResourceKind::Document).then(|| digest(&content));
        Node {
            resource: Resource {
                uri,
                kind,
                created_at: now,
                modified_at: now,
                created_by: principal.to_string(),
                modified_by: principal.to_string(),
                content_length: content.len() as u64,
                etag,
                lock: None,
                inherits_acl: true,
                properties: BTreeMap::new(),
            },
            content,
            acl: None,
            revisions: Vec::new(),
            comments: Vec::new(),
        }
    }

    fn touch(&mut self, principal: &str) {
        self.resource.modified_at = Utc::now();
        self.resource.modified_by = principal.to_string();
    }

    fn active_lock(&self, now: Timestamp) -> Option<&ResourceLock> {
        self.resource.lock.as_ref().filter(|lock| !lock.is_expired(now))
    }

    fn snapshot(&self) -> Resource {
        let mut resource = self.resource.clone();
        resource.inherits_acl = self.acl.is_none();
        if resource
            .lock
            .as_ref()
            .is_some_and(|lock| lock.is_expired(Utc::now()))
        {
            resource.lock = None;
        }
        resource
    }
}

#[derive(Debug, Clone)]
struct TrashEntry {
    item: RecoverableResource,
    /// Nodes of the deleted subtree, keyed by their original paths.
    subtree: Vec<Node>,
}

#[derive(Debug, Default)]
struct RepoState {
    nodes: BTreeMap<RepoPath, Node>,
    trash: HashMap<RepoPath, Vec<TrashEntry>>,
    next_id: u64,
}

impl RepoState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn node(&self, uri: &RepoPath) -> ArborResult<&Node> {
        self.nodes.get(uri).ok_or_else(|| not_found(uri))
    }

    fn node_mut(&mut self, uri: &RepoPath) -> ArborResult<&mut Node> {
        self.nodes.get_mut(uri).ok_or_else(|| not_found(uri))
    }

    /// `uri` followed by every path below it.
    fn subtree(&self, uri: &RepoPath) -> Vec<RepoPath> {
        self.nodes
            .keys()
            .filter(|key| *key == uri || uri.is_ancestor_of(key))
            .cloned()
            .collect()
    }

    fn require_collection_parent(&self, uri: &RepoPath) -> ArborResult<RepoPath> {
        let parent = uri.parent().ok_or_else(|| illegal("the root has no parent"))?;
        let node = self.node(&parent)?;
        if !node.resource.is_collection() {
            return Err(illegal(&format!("parent {} is not a collection", parent)));
        }
        Ok(parent)
    }

    fn check_lock(&self, uri: &RepoPath, principal: &str) -> ArborResult<()> {
        if let Some(lock) = self.nodes.get(uri).and_then(|n| n.active_lock(Utc::now())) {
            if lock.principal != principal {
                return Err(RepositoryError::Locked {
                    uri: uri.clone(),
                    owner: lock.principal.clone(),
                }
                .into());
            }
        }
        Ok(())
    }

    /// The root of the subtree must be unlocked (`Locked`); a locked
    /// descendant fails the whole operation (`FailedDependency`).
    fn check_subtree_locks(&self, uri: &RepoPath, principal: &str) -> ArborResult<()> {
        self.check_lock(uri, principal)?;
        for path in self.subtree(uri).iter().filter(|p| *p != uri) {
            if self.check_lock(path, principal).is_err() {
                return Err(RepositoryError::FailedDependency {
                    uri: uri.clone(),
                    reason: format!("descendant {} is locked", path),
                }
                .into());
            }
        }
        Ok(())
    }

    fn remove_subtree(&mut self, uri: &RepoPath) -> Vec<Node> {
        self.subtree(uri)
            .iter()
            .filter_map(|path| self.nodes.remove(path))
            .collect()
    }

    fn touch(&mut self, uri: &RepoPath, principal: &str) {
        if let Some(node) = self.nodes.get_mut(uri) {
            node.touch(principal);
        }
    }
}

/// In-memory [`Repository`] for tests and development.
pub struct MockRepository {
    state: RwLock<RepoState>,
    cache: Option<Arc<dyn Cache>>,
    tokens: Option<Arc<dyn TokenManager>>,
    read_only: AtomicBool,
}

impl Default for MockRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRepository {
    /// An empty repository holding only the root collection.
    pub fn new() -> Self {
        let mut state = RepoState::default();
        state.nodes.insert(
            RepoPath::root(),
            Node::new(
                RepoPath::root(),
                ResourceKind::Collection,
                SYSTEM_PRINCIPAL,
                Vec::new(),
            ),
        );
        Self {
            state: RwLock::new(state),
            cache: None,
            tokens: None,
            read_only: AtomicBool::new(false),
        }
    }

    /// Read `retrieve` calls through `cache`.
    pub fn with_cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Authenticate tokens through `tokens`; without one, the token string
    /// is used as the principal name.
    pub fn with_token_manager(mut self, tokens: Arc<dyn TokenManager>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    /// Number of resources including the root.
    pub fn resource_count(&self) -> ArborResult<usize> {
        Ok(self.read()?.nodes.len())
    }

    /// Document body straight from storage, bypassing the cache.
    pub fn content_of(&self, uri: &RepoPath) -> ArborResult<Option<Vec<u8>>> {
        Ok(self.read()?.nodes.get(uri).map(|n| n.content.clone()))
    }

    fn read(&self) -> ArborResult<RwLockReadGuard<'_, RepoState>> {
        self.state
            .read()
            .map_err(|_| ArborError::Lock(LockError::Poisoned))
    }

    fn write(&self) -> ArborResult<RwLockWriteGuard<'_, RepoState>> {
        self.state
            .write()
            .map_err(|_| ArborError::Lock(LockError::Poisoned))
    }

    fn principal(&self, token: &Token) -> ArborResult<String> {
        match &self.tokens {
            Some(tokens) => tokens
                .principal(token)
                .map(|p| p.name)
                .ok_or_else(|| {
                    RepositoryError::Authentication {
                        reason: "unknown or expired token".to_string(),
                    }
                    .into()
                }),
            None => Ok(token.as_str().to_string()),
        }
    }

    /// Principal of a mutating call, after the read-only check.
    fn writer(&self, token: &Token, uri: &RepoPath) -> ArborResult<String> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(RepositoryError::ReadOnly { uri: uri.clone() }.into());
        }
        self.principal(token)
    }
}

fn not_found(uri: &RepoPath) -> ArborError {
    RepositoryError::NotFound { uri: uri.clone() }.into()
}

fn illegal(reason: &str) -> ArborError {
    RepositoryError::IllegalOperation {
        reason: reason.to_string(),
    }
    .into()
}

fn digest(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// Read a content source to the end. A disposable file is consumed: it is
/// removed once read, the in-memory equivalent of moving it into place.
fn read_source(content: ContentSource) -> ArborResult<Vec<u8>> {
    let disposable = match &content {
        ContentSource::File {
            path,
            delete_after_use: true,
        } => Some(path.clone()),
        _ => None,
    };
    let mut buf = Vec::new();
    content.into_reader()?.read_to_end(&mut buf)?;
    if let Some(path) = disposable {
        if let Err(e) = std::fs::remove_file(&path) {
            tracing::debug!(path = %path.display(), error = %e, "Could not remove consumed file");
        }
    }
    Ok(buf)
}

impl Repository for MockRepository {
    fn retrieve(
        &self,
        token: &Token,
        uri: &RepoPath,
        _for_processing: bool,
    ) -> ArborResult<Resource> {
        self.principal(token)?;
        if let Some(cached) = self.cache.as_ref().and_then(|c| c.get(uri)) {
            return Ok(cached);
        }
        let resource = self.read()?.node(uri)?.snapshot();
        if let Some(cache) = &self.cache {
            cache.put(resource.clone());
        }
        Ok(resource)
    }

    fn exists(&self, token: &Token, uri: &RepoPath) -> ArborResult<bool> {
        self.principal(token)?;
        Ok(self.read()?.nodes.contains_key(uri))
    }

    fn list_children(
        &self,
        token: &Token,
        uri: &RepoPath,
        _for_processing: bool,
    ) -> ArborResult<Vec<Resource>> {
        self.principal(token)?;
        let state = self.read()?;
        if !state.node(uri)?.resource.is_collection() {
            return Err(illegal(&format!("{} is not a collection", uri)));
        }
        Ok(state
            .nodes
            .iter()
            .filter(|(path, _)| path.parent().as_ref() == Some(uri))
            .map(|(_, node)| node.snapshot())
            .collect())
    }

    fn read_content(
        &self,
        token: &Token,
        uri: &RepoPath,
        _for_processing: bool,
    ) -> ArborResult<Vec<u8>> {
        self.principal(token)?;
        let state = self.read()?;
        let node = state.node(uri)?;
        if node.resource.is_collection() {
            return Err(illegal(&format!("{} is a collection", uri)));
        }
        Ok(node.content.clone())
    }

    fn get_revisions(&self, token: &Token, uri: &RepoPath) -> ArborResult<Vec<Revision>> {
        self.principal(token)?;
        let state = self.read()?;
        Ok(state
            .node(uri)?
            .revisions
            .iter()
            .map(|(rev, _)| rev.clone())
            .collect())
    }

    fn get_comments(&self, token: &Token, uri: &RepoPath) -> ArborResult<Vec<Comment>> {
        self.principal(token)?;
        Ok(self.read()?.node(uri)?.comments.clone())
    }

    fn get_recoverable_resources(
        &self,
        token: &Token,
        parent: &RepoPath,
    ) -> ArborResult<Vec<RecoverableResource>> {
        self.principal(token)?;
        let state = self.read()?;
        state.node(parent)?;
        Ok(state
            .trash
            .get(parent)
            .map(|entries| entries.iter().map(|e| e.item.clone()).collect())
            .unwrap_or_default())
    }

    fn search(&self, token: &Token, query: &SearchQuery) -> ArborResult<Vec<Resource>> {
        self.principal(token)?;
        let state = self.read()?;
        Ok(state
            .nodes
            .values()
            .filter(|node| query.matches(&node.resource))
            .take(query.limit)
            .map(Node::snapshot)
            .collect())
    }

    fn create_collection(&self, token: &Token, uri: &RepoPath) -> ArborResult<Resource> {
        let principal = self.writer(token, uri)?;
        let mut state = self.write()?;
        let parent = state.require_collection_parent(uri)?;
        if state.nodes.contains_key(uri) {
            return Err(illegal(&format!("{} already exists", uri)));
        }
        let node = Node::new(uri.clone(), ResourceKind::Collection, &principal, Vec::new());
        let resource = node.snapshot();
        state.nodes.insert(uri.clone(), node);
        state.touch(&parent, &principal);
        Ok(resource)
    }

    fn create_document(
        &self,
        token: &Token,
        uri: &RepoPath,
        content: ContentSource,
    ) -> ArborResult<Resource> {
        let principal = self.writer(token, uri)?;
        let mut state = self.write()?;
        let parent = state.require_collection_parent(uri)?;
        if state.nodes.contains_key(uri) {
            return Err(illegal(&format!("{} already exists", uri)));
        }
        let body = read_source(content)?;
        let node = Node::new(uri.clone(), ResourceKind::Document, &principal, body);
        let resource = node.snapshot();
        state.nodes.insert(uri.clone(), node);
        state.touch(&parent, &principal);
        Ok(resource)
    }

    fn store(
        &self,
        token: &Token,
        resource: Resource,
        _context: StoreContext,
    ) -> ArborResult<Resource> {
        let principal = self.writer(token, &resource.uri)?;
        let mut state = self.write()?;
        state.check_lock(&resource.uri, &principal)?;
        let node = state.node_mut(&resource.uri)?;
        node.resource.properties = resource.properties;
        node.touch(&principal);
        Ok(node.snapshot())
    }

    fn store_content(
        &self,
        token: &Token,
        uri: &RepoPath,
        content: ContentSource,
    ) -> ArborResult<Resource> {
        let principal = self.writer(token, uri)?;
        let mut state = self.write()?;
        state.check_lock(uri, &principal)?;
        if state.node(uri)?.resource.is_collection() {
            return Err(illegal(&format!("{} is a collection", uri)));
        }
        let body = read_source(content)?;
        let node = state.node_mut(uri)?;
        node.resource.content_length = body.len() as u64;
        node.resource.etag = Some(digest(&body));
        node.content = body;
        node.touch(&principal);
        Ok(node.snapshot())
    }

    fn copy(
        &self,
        token: &Token,
        src: &RepoPath,
        dest: &RepoPath,
        overwrite: bool,
        preserve_acl: bool,
    ) -> ArborResult<Resource> {
        let principal = self.writer(token, dest)?;
        let mut state = self.write()?;
        state.node(src)?;
        if src == dest || src.is_ancestor_of(dest) {
            return Err(illegal(&format!("cannot copy {} into itself", src)));
        }
        let dest_parent = state.require_collection_parent(dest)?;
        if state.nodes.contains_key(dest) {
            if !overwrite {
                return Err(RepositoryError::Overwrite { uri: dest.clone() }.into());
            }
            state.check_subtree_locks(dest, &principal)?;
            state.remove_subtree(dest);
        }

        let now = Utc::now();
        let copies: Vec<Node> = state
            .subtree(src)
            .iter()
            .filter_map(|path| {
                let mut node = state.nodes.get(path)?.clone();
                node.resource.uri = path.rebase(src, dest)?;
                node.resource.created_at = now;
                node.resource.modified_at = now;
                node.resource.created_by = principal.clone();
                node.resource.modified_by = principal.clone();
                node.resource.lock = None;
                node.revisions.clear();
                node.comments.clear();
                if !preserve_acl {
                    node.acl = None;
                }
                Some(node)
            })
            .collect();
        for node in copies {
            state.nodes.insert(node.resource.uri.clone(), node);
        }
        state.touch(&dest_parent, &principal);
        Ok(state.node(dest)?.snapshot())
    }

    fn move_resource(
        &self,
        token: &Token,
        src: &RepoPath,
        dest: &RepoPath,
        overwrite: bool,
    ) -> ArborResult<Resource> {
        let principal = self.writer(token, src)?;
        let mut state = self.write()?;
        state.node(src)?;
        if src.is_root() || src == dest || src.is_ancestor_of(dest) {
            return Err(illegal(&format!("cannot move {} to {}", src, dest)));
        }
        let src_parent = state.require_collection_parent(src)?;
        let dest_parent = state.require_collection_parent(dest)?;
        state.check_subtree_locks(src, &principal)?;
        if state.nodes.contains_key(dest) {
            if !overwrite {
                return Err(RepositoryError::Overwrite { uri: dest.clone() }.into());
            }
            state.check_subtree_locks(dest, &principal)?;
            state.remove_subtree(dest);
        }

        for mut node in state.remove_subtree(src) {
            let Some(uri) = node.resource.uri.rebase(src, dest) else {
                continue;
            };
            node.resource.uri = uri.clone();
            node.resource.lock = None;
            state.nodes.insert(uri, node);
        }
        if let Ok(moved) = state.node_mut(dest) {
            moved.touch(&principal);
        }
        state.touch(&src_parent, &principal);
        state.touch(&dest_parent, &principal);
        Ok(state.node(dest)?.snapshot())
    }

    fn delete(&self, token: &Token, uri: &RepoPath, restorable: bool) -> ArborResult<()> {
        let principal = self.writer(token, uri)?;
        let mut state = self.write()?;
        let parent = uri.parent().ok_or_else(|| illegal("cannot delete the root"))?;
        let kind = state.node(uri)?.resource.kind;
        state.check_subtree_locks(uri, &principal)?;

        let subtree = state.remove_subtree(uri);
        if restorable {
            let id = state.next_id();
            state.trash.entry(parent.clone()).or_default().push(TrashEntry {
                item: RecoverableResource {
                    id,
                    parent: parent.clone(),
                    name: uri.name().to_string(),
                    kind,
                    deleted_by: principal.clone(),
                    deleted_at: Utc::now(),
                },
                subtree,
            });
        }
        state.touch(&parent, &principal);
        Ok(())
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
        let principal = self.writer(token, uri)?;
        let mut state = self.write()?;
        let now = Utc::now();
        let node = state.node_mut(uri)?;

        let existing = node.active_lock(now).cloned();
        let lock_id = match existing {
            Some(lock) if lock.principal != principal => {
                return Err(RepositoryError::Locked {
                    uri: uri.clone(),
                    owner: lock.principal,
                }
                .into());
            }
            Some(lock) if lock_token.is_some_and(|t| t != lock.token) => {
                return Err(illegal(&format!("lock token mismatch on {}", uri)));
            }
            Some(lock) => lock.token,
            None => format!("opaquelocktoken:{}", new_entity_id()),
        };

        let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        node.resource.lock = Some(ResourceLock {
            uri: uri.clone(),
            token: lock_id,
            principal,
            owner_info: owner_info.to_string(),
            depth,
            expires_at: now.checked_add_signed(timeout).unwrap_or(Timestamp::MAX_UTC),
        });
        Ok(node.snapshot())
    }

    fn unlock(&self, token: &Token, uri: &RepoPath, lock_token: Option<&str>) -> ArborResult<()> {
        let principal = self.writer(token, uri)?;
        let mut state = self.write()?;
        let now = Utc::now();
        let node = state.node_mut(uri)?;
        if let Some(lock) = node.active_lock(now) {
            let token_matches = lock_token.is_some_and(|t| t == lock.token);
            if lock.principal != principal && !token_matches {
                return Err(RepositoryError::Locked {
                    uri: uri.clone(),
                    owner: lock.principal.clone(),
                }
                .into());
            }
        }
        node.resource.lock = None;
        Ok(())
    }

    fn store_acl(&self, token: &Token, uri: &RepoPath, acl: Acl) -> ArborResult<Resource> {
        let principal = self.writer(token, uri)?;
        let mut state = self.write()?;
        state.check_lock(uri, &principal)?;
        let node = state.node_mut(uri)?;
        node.acl = Some(acl);
        node.touch(&principal);
        Ok(node.snapshot())
    }

    fn delete_acl(&self, token: &Token, uri: &RepoPath) -> ArborResult<Resource> {
        let principal = self.writer(token, uri)?;
        let mut state = self.write()?;
        if uri.is_root() {
            return Err(illegal("the root ACL cannot be removed"));
        }
        state.check_lock(uri, &principal)?;
        let node = state.node_mut(uri)?;
        if node.acl.is_none() {
            return Err(illegal(&format!("{} already inherits its ACL", uri)));
        }
        node.acl = None;
        node.touch(&principal);
        Ok(node.snapshot())
    }

    fn create_revision(
        &self,
        token: &Token,
        uri: &RepoPath,
        kind: RevisionKind,
    ) -> ArborResult<Revision> {
        let principal = self.writer(token, uri)?;
        let mut state = self.write()?;
        state.check_lock(uri, &principal)?;
        if state.node(uri)?.resource.is_collection() {
            return Err(illegal(&format!("{} is a collection", uri)));
        }
        let id = state.next_id();
        let node = state.node_mut(uri)?;
        if kind == RevisionKind::WorkingCopy
            && node.revisions.iter().any(|(r, _)| r.kind == RevisionKind::WorkingCopy)
        {
            return Err(illegal(&format!("{} already has a working copy", uri)));
        }
        let name = match kind {
            RevisionKind::Regular => (node
                .revisions
                .iter()
                .filter(|(r, _)| r.kind == RevisionKind::Regular)
                .count()
                + 1)
            .to_string(),
            RevisionKind::WorkingCopy => "WORKING_COPY".to_string(),
        };
        let revision = Revision {
            id,
            kind,
            name,
            principal,
            created_at: Utc::now(),
            etag: digest(&node.content),
            content_length: node.content.len() as u64,
        };
        node.revisions.push((revision.clone(), node.content.clone()));
        Ok(revision)
    }

    fn delete_revision(&self, token: &Token, uri: &RepoPath, revision_id: u64) -> ArborResult<()> {
        let principal = self.writer(token, uri)?;
        let mut state = self.write()?;
        state.check_lock(uri, &principal)?;
        let node = state.node_mut(uri)?;
        let before = node.revisions.len();
        node.revisions.retain(|(r, _)| r.id != revision_id);
        if node.revisions.len() == before {
            return Err(illegal(&format!("no revision {} on {}", revision_id, uri)));
        }
        Ok(())
    }

    fn recover(
        &self,
        token: &Token,
        parent: &RepoPath,
        recoverable: &RecoverableResource,
    ) -> ArborResult<Resource> {
        let principal = self.writer(token, parent)?;
        let mut state = self.write()?;
        state.node(parent)?;
        let entry = state
            .trash
            .get(parent)
            .and_then(|entries| entries.iter().find(|e| e.item.id == recoverable.id))
            .cloned()
            .ok_or_else(|| illegal(&format!("no recoverable resource {}", recoverable.id)))?;
        let target = parent.extend(&entry.item.name)?;
        if state.nodes.contains_key(&target) {
            return Err(RepositoryError::Overwrite { uri: target }.into());
        }
        if let Some(entries) = state.trash.get_mut(parent) {
            entries.retain(|e| e.item.id != recoverable.id);
        }
        for node in entry.subtree {
            state.nodes.insert(node.resource.uri.clone(), node);
        }
        state.touch(parent, &principal);
        Ok(state.node(&target)?.snapshot())
    }

    fn delete_recoverable(
        &self,
        token: &Token,
        parent: &RepoPath,
        recoverable: &RecoverableResource,
    ) -> ArborResult<()> {
        self.writer(token, parent)?;
        let mut state = self.write()?;
        let entries = state.trash.entry(parent.clone()).or_default();
        let before = entries.len();
        entries.retain(|e| e.item.id != recoverable.id);
        if entries.len() == before {
            return Err(illegal(&format!("no recoverable resource {}", recoverable.id)));
        }
        Ok(())
    }

    fn add_comment(
        &self,
        token: &Token,
        uri: &RepoPath,
        title: &str,
        text: &str,
    ) -> ArborResult<Comment> {
        let principal = self.writer(token, uri)?;
        let mut state = self.write()?;
        let node = state.node_mut(uri)?;
        let comment = Comment {
            id: new_entity_id(),
            uri: uri.clone(),
            author: principal,
            title: title.to_string(),
            content: text.to_string(),
            created_at: Utc::now(),
        };
        node.comments.push(comment.clone());
        Ok(comment)
    }

    fn update_comment(
        &self,
        token: &Token,
        uri: &RepoPath,
        comment: Comment,
    ) -> ArborResult<Comment> {
        self.writer(token, uri)?;
        let mut state = self.write()?;
        let node = state.node_mut(uri)?;
        let existing = node
            .comments
            .iter_mut()
            .find(|c| c.id == comment.id)
            .ok_or_else(|| illegal(&format!("no comment {} on {}", comment.id, uri)))?;
        existing.title = comment.title;
        existing.content = comment.content;
        Ok(existing.clone())
    }

    fn delete_comment(
        &self,
        token: &Token,
        uri: &RepoPath,
        comment_id: EntityId,
    ) -> ArborResult<()> {
        self.writer(token, uri)?;
        let mut state = self.write()?;
        let node = state.node_mut(uri)?;
        let before = node.comments.len();
        node.comments.retain(|c| c.id != comment_id);
        if node.comments.len() == before {
            return Err(illegal(&format!("no comment {} on {}", comment_id, uri)));
        }
        Ok(())
    }

    fn delete_all_comments(&self, token: &Token, uri: &RepoPath) -> ArborResult<()> {
        self.writer(token, uri)?;
        let mut state = self.write()?;
        state.node_mut(uri)?.comments.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InMemoryCache, InMemoryTokenManager};
    use arbor_core::Principal;

    fn p(s: &str) -> RepoPath {
        RepoPath::parse(s).unwrap()
    }

    fn token() -> Token {
        Token::new("alice")
    }

    fn repo_with_docs() -> MockRepository {
        let repo = MockRepository::new();
        repo.create_collection(&token(), &p("/docs")).unwrap();
        repo.create_collection(&token(), &p("/docs/sub")).unwrap();
        repo.create_document(&token(), &p("/docs/a.txt"), ContentSource::bytes("alpha"))
            .unwrap();
        repo.create_document(&token(), &p("/docs/sub/b.txt"), ContentSource::bytes("beta"))
            .unwrap();
        repo
    }

    fn repo_err(result: ArborResult<impl std::fmt::Debug>) -> RepositoryError {
        match result {
            Err(ArborError::Repository(err)) => err,
            other => panic!("expected repository error, got {:?}", other),
        }
    }

    #[test]
    fn test_create_and_retrieve() {
        let repo = repo_with_docs();
        let doc = repo.retrieve(&token(), &p("/docs/a.txt"), false).unwrap();
        assert_eq!(doc.kind, ResourceKind::Document);
        assert_eq!(doc.content_length, 5);
        assert_eq!(doc.etag.as_deref(), Some(digest(b"alpha").as_str()));
        assert_eq!(
            repo.read_content(&token(), &p("/docs/a.txt"), false).unwrap(),
            b"alpha"
        );
    }

    #[test]
    fn test_create_requires_collection_parent() {
        let repo = repo_with_docs();
        assert!(matches!(
            repo_err(repo.create_collection(&token(), &p("/missing/x"))),
            RepositoryError::NotFound { .. }
        ));
        assert!(matches!(
            repo_err(repo.create_collection(&token(), &p("/docs/a.txt/x"))),
            RepositoryError::IllegalOperation { .. }
        ));
        assert!(matches!(
            repo_err(repo.create_collection(&token(), &p("/docs"))),
            RepositoryError::IllegalOperation { .. }
        ));
    }

    #[test]
    fn test_list_children_is_direct_only() {
        let repo = repo_with_docs();
        let children: Vec<RepoPath> = repo
            .list_children(&token(), &p("/docs"), false)
            .unwrap()
            .into_iter()
            .map(|r| r.uri)
            .collect();
        assert_eq!(children, vec![p("/docs/a.txt"), p("/docs/sub")]);
    }

    #[test]
    fn test_copy_subtree_and_overwrite() {
        let repo = repo_with_docs();
        repo.copy(&token(), &p("/docs/sub"), &p("/copy"), false, false)
            .unwrap();
        assert!(repo.exists(&token(), &p("/copy/b.txt")).unwrap());
        assert!(repo.exists(&token(), &p("/docs/sub/b.txt")).unwrap());

        assert!(matches!(
            repo_err(repo.copy(&token(), &p("/docs/sub"), &p("/copy"), false, false)),
            RepositoryError::Overwrite { .. }
        ));
        assert!(matches!(
            repo_err(repo.copy(&token(), &p("/docs"), &p("/docs/sub/x"), false, false)),
            RepositoryError::IllegalOperation { .. }
        ));
        repo.copy(&token(), &p("/docs/a.txt"), &p("/copy"), true, false)
            .unwrap();
        assert!(!repo.exists(&token(), &p("/copy/b.txt")).unwrap());
    }

    #[test]
    fn test_move_subtree() {
        let repo = repo_with_docs();
        let moved = repo
            .move_resource(&token(), &p("/docs/sub"), &p("/moved"), false)
            .unwrap();
        assert_eq!(moved.uri, p("/moved"));
        assert!(repo.exists(&token(), &p("/moved/b.txt")).unwrap());
        assert!(!repo.exists(&token(), &p("/docs/sub")).unwrap());
        assert!(!repo.exists(&token(), &p("/docs/sub/b.txt")).unwrap());
    }

    #[test]
    fn test_delete_and_recover() {
        let repo = repo_with_docs();
        repo.delete(&token(), &p("/docs/sub"), true).unwrap();
        assert!(!repo.exists(&token(), &p("/docs/sub/b.txt")).unwrap());

        let trash = repo.get_recoverable_resources(&token(), &p("/docs")).unwrap();
        assert_eq!(trash.len(), 1);
        assert_eq!(trash[0].name, "sub");

        let restored = repo.recover(&token(), &p("/docs"), &trash[0]).unwrap();
        assert_eq!(restored.uri, p("/docs/sub"));
        assert!(repo.exists(&token(), &p("/docs/sub/b.txt")).unwrap());
        assert!(repo
            .get_recoverable_resources(&token(), &p("/docs"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_delete_root_is_illegal() {
        let repo = MockRepository::new();
        assert!(matches!(
            repo_err(repo.delete(&token(), &RepoPath::root(), false)),
            RepositoryError::IllegalOperation { .. }
        ));
    }

    #[test]
    fn test_locks_block_other_principals() {
        let repo = repo_with_docs();
        let bob = Token::new("bob");
        let locked = repo
            .lock(
                &token(),
                &p("/docs/sub/b.txt"),
                "alice's editor",
                LockDepth::Zero,
                Duration::from_secs(60),
                None,
            )
            .unwrap();
        assert!(locked.lock.is_some());

        assert!(matches!(
            repo_err(repo.store_content(&bob, &p("/docs/sub/b.txt"), ContentSource::bytes("x"))),
            RepositoryError::Locked { .. }
        ));
        assert!(matches!(
            repo_err(repo.delete(&bob, &p("/docs/sub"), false)),
            RepositoryError::FailedDependency { .. }
        ));

        repo.unlock(&token(), &p("/docs/sub/b.txt"), None).unwrap();
        repo.delete(&bob, &p("/docs/sub"), false).unwrap();
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let repo = repo_with_docs();
        repo.set_read_only(true);
        assert!(matches!(
            repo_err(repo.create_collection(&token(), &p("/new"))),
            RepositoryError::ReadOnly { .. }
        ));
        assert!(repo.retrieve(&token(), &p("/docs"), false).is_ok());
    }

    #[test]
    fn test_token_manager_authenticates() {
        let tokens = Arc::new(InMemoryTokenManager::new());
        let valid = tokens.register(Principal::user("carol"));
        let repo = MockRepository::new().with_token_manager(tokens);
        let created = repo.create_collection(&valid, &p("/c")).unwrap();
        assert_eq!(created.created_by, "carol");
        assert!(matches!(
            repo_err(repo.retrieve(&Token::new("nope"), &p("/c"), false)),
            RepositoryError::Authentication { .. }
        ));
    }

    #[test]
    fn test_retrieve_reads_through_cache() {
        let cache = Arc::new(InMemoryCache::default());
        let repo = MockRepository::new().with_cache(cache.clone());
        repo.create_collection(&token(), &p("/a")).unwrap();

        repo.retrieve(&token(), &p("/a"), false).unwrap();
        assert!(cache.contains(&p("/a")));

        // The mock never flushes: a stale entry stays visible until someone does.
        repo.store_acl(&token(), &p("/a"), Acl::new().grant("bob", "read"))
            .unwrap();
        assert!(repo.retrieve(&token(), &p("/a"), false).unwrap().inherits_acl);
        cache.flush_from_cache(&p("/a"), false);
        assert!(!repo.retrieve(&token(), &p("/a"), false).unwrap().inherits_acl);
    }

    #[test]
    fn test_disposable_file_is_consumed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload.bin");
        std::fs::write(&path, b"from disk").unwrap();

        let repo = MockRepository::new();
        repo.create_document(&token(), &p("/f"), ContentSource::disposable_file(&path))
            .unwrap();
        assert!(!path.exists());
        assert_eq!(repo.content_of(&p("/f")).unwrap().unwrap(), b"from disk");
    }

    #[test]
    fn test_revisions_and_comments() {
        let repo = repo_with_docs();
        let uri = p("/docs/a.txt");
        let r1 = repo
            .create_revision(&token(), &uri, RevisionKind::Regular)
            .unwrap();
        assert_eq!(r1.name, "1");
        repo.create_revision(&token(), &uri, RevisionKind::WorkingCopy)
            .unwrap();
        assert!(repo
            .create_revision(&token(), &uri, RevisionKind::WorkingCopy)
            .is_err());
        repo.delete_revision(&token(), &uri, r1.id).unwrap();
        assert_eq!(repo.get_revisions(&token(), &uri).unwrap().len(), 1);

        let mut comment = repo.add_comment(&token(), &uri, "t", "first").unwrap();
        comment.content = "edited".to_string();
        repo.update_comment(&token(), &uri, comment.clone()).unwrap();
        assert_eq!(repo.get_comments(&token(), &uri).unwrap()[0].content, "edited");
        repo.delete_comment(&token(), &uri, comment.id).unwrap();
        assert!(repo.get_comments(&token(), &uri).unwrap().is_empty());
    }

    #[test]
    fn test_search() {
        let repo = repo_with_docs();
        let hits = repo
            .search(&token(), &SearchQuery::under(p("/docs")).with_name(".txt"))
            .unwrap();
        assert_eq!(hits.len(), 2);
        let limited = repo
            .search(&token(), &SearchQuery::under(RepoPath::root()).with_limit(1))
            .unwrap();
        assert_eq!(limited.len(), 1);
    }
}
