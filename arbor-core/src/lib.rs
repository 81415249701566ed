//! Arbor Core - Entity Types
//!
//! Pure data structures shared by every Arbor crate: repository paths,
//! resource snapshots, lock modes, identities, content sources, errors and
//! configuration. This crate contains no repository behavior.

use chrono::{DateTime, Utc};
use uuid::Uuid;

pub mod config;
pub mod content;
pub mod error;
pub mod identity;
pub mod lock;
pub mod path;
pub mod resource;

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Entity identifier using UUIDv7 for timestamp-sortable IDs.
pub type EntityId = Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Generate a new UUIDv7 EntityId (timestamp-sortable).
pub fn new_entity_id() -> EntityId {
    Uuid::now_v7()
}

pub use config::{BufferConfig, CacheConfig, ClusterConfig, LockConfig, RepositoryConfig};
pub use content::ContentSource;
pub use error::{
    ArborError, ArborResult, ClusterError, ConfigError, LockError, RepositoryError,
    ValidationError,
};
pub use identity::{Principal, PrincipalKind, Token};
pub use lock::{LockDepth, LockMode, LockModeParseError, ResourceLock};
pub use path::RepoPath;
pub use resource::{
    Acl, Comment, RecoverableResource, Resource, ResourceKind, Revision, RevisionKind,
    SearchQuery, StoreContext,
};
