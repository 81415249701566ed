//! Arbor Storage - Repository and Cache Traits with Mock Implementations
//!
//! Defines the contracts the concurrency layer is built on:
//!
//! - [`Repository`]: the transactional engine performing resource mutations
//! - [`Cache`]: a path-keyed store of resource snapshots
//! - [`TokenManager`]: session token resolution
//!
//! plus in-memory implementations of each for tests and development.

pub mod cache;
pub mod mock;
pub mod token;

pub use cache::{Cache, CacheStats, InMemoryCache};
pub use mock::MockRepository;
pub use token::{InMemoryTokenManager, TokenManager};

use arbor_core::{
    Acl, ArborResult, Comment, ContentSource, EntityId, LockDepth, RecoverableResource, RepoPath,
    Resource, Revision, RevisionKind, SearchQuery, StoreContext, Token,
};
use std::time::Duration;

// ============================================================================
// REPOSITORY TRAIT
// ============================================================================

/// A content repository.
///
/// Each call either commits its whole effect or fails with an
/// [`ArborError`](arbor_core::ArborError) and leaves no partial effect
/// behind. Implementations must be safe to call from many threads at once.
pub trait Repository: Send + Sync {
    // === Reads ===

    /// Fetch a resource snapshot.
    fn retrieve(&self, token: &Token, uri: &RepoPath, for_processing: bool)
        -> ArborResult<Resource>;

    /// Whether a resource exists at `uri`.
    fn exists(&self, token: &Token, uri: &RepoPath) -> ArborResult<bool>;

    /// Direct children of a collection, in path order.
    fn list_children(
        &self,
        token: &Token,
        uri: &RepoPath,
        for_processing: bool,
    ) -> ArborResult<Vec<Resource>>;

    /// Body of a document.
    fn read_content(&self, token: &Token, uri: &RepoPath, for_processing: bool)
        -> ArborResult<Vec<u8>>;

    /// Revisions of a document, oldest first.
    fn get_revisions(&self, token: &Token, uri: &RepoPath) -> ArborResult<Vec<Revision>>;

    /// Comments on a resource, oldest first.
    fn get_comments(&self, token: &Token, uri: &RepoPath) -> ArborResult<Vec<Comment>>;

    /// Deleted children held in the trash of `parent`.
    fn get_recoverable_resources(
        &self,
        token: &Token,
        parent: &RepoPath,
    ) -> ArborResult<Vec<RecoverableResource>>;

    /// Resources matching `query`.
    fn search(&self, token: &Token, query: &SearchQuery) -> ArborResult<Vec<Resource>>;

    // === Creation ===

    fn create_collection(&self, token: &Token, uri: &RepoPath) -> ArborResult<Resource>;

    fn create_document(
        &self,
        token: &Token,
        uri: &RepoPath,
        content: ContentSource,
    ) -> ArborResult<Resource>;

    // === Modification ===

    /// Store resource metadata.
    fn store(&self, token: &Token, resource: Resource, context: StoreContext)
        -> ArborResult<Resource>;

    /// Replace a document body.
    fn store_content(
        &self,
        token: &Token,
        uri: &RepoPath,
        content: ContentSource,
    ) -> ArborResult<Resource>;

    fn copy(
        &self,
        token: &Token,
        src: &RepoPath,
        dest: &RepoPath,
        overwrite: bool,
        preserve_acl: bool,
    ) -> ArborResult<Resource>;

    fn move_resource(
        &self,
        token: &Token,
        src: &RepoPath,
        dest: &RepoPath,
        overwrite: bool,
    ) -> ArborResult<Resource>;

    /// Delete a resource and its subtree; `restorable` keeps it in the
    /// parent's trash.
    fn delete(&self, token: &Token, uri: &RepoPath, restorable: bool) -> ArborResult<()>;

    // === Resource locks ===

    /// Take or refresh a persistent lock. Passing the current `lock_token`
    /// refreshes it.
    fn lock(
        &self,
        token: &Token,
        uri: &RepoPath,
        owner_info: &str,
        depth: LockDepth,
        timeout: Duration,
        lock_token: Option<&str>,
    ) -> ArborResult<Resource>;

    fn unlock(&self, token: &Token, uri: &RepoPath, lock_token: Option<&str>) -> ArborResult<()>;

    // === ACLs ===

    fn store_acl(&self, token: &Token, uri: &RepoPath, acl: Acl) -> ArborResult<Resource>;

    /// Remove the ACL set on `uri` so it inherits again.
    fn delete_acl(&self, token: &Token, uri: &RepoPath) -> ArborResult<Resource>;

    // === Revisions ===

    fn create_revision(&self, token: &Token, uri: &RepoPath, kind: RevisionKind)
        -> ArborResult<Revision>;

    fn delete_revision(&self, token: &Token, uri: &RepoPath, revision_id: u64) -> ArborResult<()>;

    // === Trash ===

    fn recover(
        &self,
        token: &Token,
        parent: &RepoPath,
        recoverable: &RecoverableResource,
    ) -> ArborResult<Resource>;

    fn delete_recoverable(
        &self,
        token: &Token,
        parent: &RepoPath,
        recoverable: &RecoverableResource,
    ) -> ArborResult<()>;

    // === Comments ===

    fn add_comment(&self, token: &Token, uri: &RepoPath, title: &str, text: &str)
        -> ArborResult<Comment>;

    fn update_comment(&self, token: &Token, uri: &RepoPath, comment: Comment)
        -> ArborResult<Comment>;

    fn delete_comment(&self, token: &Token, uri: &RepoPath, comment_id: EntityId)
        -> ArborResult<()>;

    fn delete_all_comments(&self, token: &Token, uri: &RepoPath) -> ArborResult<()>;
}
