//! Resource records exchanged with a repository.
//!
//! These are plain snapshots. Property evaluation, privilege semantics and
//! revision storage belong to the repository implementation.

use crate::{EntityId, RepoPath, ResourceLock, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Collection or document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Collection,
    Document,
}

/// A snapshot of a resource and its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub uri: RepoPath,
    pub kind: ResourceKind,
    pub created_at: Timestamp,
    pub modified_at: Timestamp,
    pub created_by: String,
    pub modified_by: String,
    pub content_length: u64,
    /// Hex digest of the document body; `None` for collections.
    pub etag: Option<String>,
    pub lock: Option<ResourceLock>,
    /// `true` when no ACL is set on this resource and it inherits one.
    pub inherits_acl: bool,
    pub properties: BTreeMap<String, serde_json::Value>,
}

impl Resource {
    pub fn is_collection(&self) -> bool {
        self.kind == ResourceKind::Collection
    }

    pub fn property(&self, name: &str) -> Option<&serde_json::Value> {
        self.properties.get(name)
    }

    pub fn with_property(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(name.into(), value);
        self
    }
}

/// An access control list: principal name to granted privilege names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acl {
    pub entries: BTreeMap<String, Vec<String>>,
}

impl Acl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(mut self, principal: impl Into<String>, privilege: impl Into<String>) -> Self {
        let privilege = privilege.into();
        let granted = self.entries.entry(principal.into()).or_default();
        if !granted.contains(&privilege) {
            granted.push(privilege);
        }
        self
    }

    pub fn has_privilege(&self, principal: &str, privilege: &str) -> bool {
        self.entries
            .get(principal)
            .is_some_and(|granted| granted.iter().any(|p| p == privilege))
    }
}

/// Kind of revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RevisionKind {
    Regular,
    WorkingCopy,
}

/// A stored revision of a document body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    pub id: u64,
    pub kind: RevisionKind,
    pub name: String,
    pub principal: String,
    pub created_at: Timestamp,
    pub etag: String,
    pub content_length: u64,
}

/// A comment attached to a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: EntityId,
    pub uri: RepoPath,
    pub author: String,
    pub title: String,
    pub content: String,
    pub created_at: Timestamp,
}

/// A deleted resource kept in its parent's trash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoverableResource {
    pub id: u64,
    pub parent: RepoPath,
    pub name: String,
    pub kind: ResourceKind,
    pub deleted_by: String,
    pub deleted_at: Timestamp,
}

/// How a `store` call treats properties.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StoreContext {
    /// Properties apply to the resource alone.
    #[default]
    Plain,
    /// The named properties are inheritable: descendants may derive values
    /// from them, so their cached state can change too.
    InheritableProperties { properties: Vec<String> },
}

impl StoreContext {
    pub fn affects_descendants(&self) -> bool {
        matches!(self, StoreContext::InheritableProperties { .. })
    }
}

/// A simple search: resources under `scope` whose name contains `name_contains`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub scope: RepoPath,
    pub name_contains: Option<String>,
    pub kind: Option<ResourceKind>,
    pub limit: usize,
}

impl SearchQuery {
    pub fn under(scope: RepoPath) -> Self {
        Self {
            scope,
            name_contains: None,
            kind: None,
            limit: 100,
        }
    }

    pub fn with_name(mut self, fragment: impl Into<String>) -> Self {
        self.name_contains = Some(fragment.into());
        self
    }

    pub fn with_kind(mut self, kind: ResourceKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Whether `resource` satisfies everything but the limit.
    pub fn matches(&self, resource: &Resource) -> bool {
        if !(resource.uri == self.scope || self.scope.is_ancestor_of(&resource.uri)) {
            return false;
        }
        if let Some(kind) = self.kind {
            if resource.kind != kind {
                return false;
            }
        }
        match &self.name_contains {
            Some(fragment) => resource.uri.name().contains(fragment.as_str()),
            None => true,
        }
    }
}
