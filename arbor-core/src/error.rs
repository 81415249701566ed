//! Error types for Arbor operations

use crate::RepoPath;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by a repository implementation.
///
/// The concurrency layer passes these through untouched; callers see the
/// same variants whether or not the repository is wrapped.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("Resource not found: {uri}")]
    NotFound { uri: RepoPath },

    #[error("Not authorized to {action} on {uri}")]
    Authorization { uri: RepoPath, action: String },

    #[error("Authentication required: {reason}")]
    Authentication { reason: String },

    #[error("Resource {uri} is locked by {owner}")]
    Locked { uri: RepoPath, owner: String },

    #[error("Illegal operation: {reason}")]
    IllegalOperation { reason: String },

    #[error("Resource already exists and overwrite was not requested: {uri}")]
    Overwrite { uri: RepoPath },

    #[error("Failed dependency on {uri}: {reason}")]
    FailedDependency { uri: RepoPath, reason: String },

    #[error("Repository is read-only: {uri}")]
    ReadOnly { uri: RepoPath },

    #[error("I/O failure: {reason}")]
    Io { reason: String },
}

impl From<std::io::Error> for RepositoryError {
    fn from(err: std::io::Error) -> Self {
        RepositoryError::Io {
            reason: err.to_string(),
        }
    }
}

/// Path lock errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("Timed out after {waited:?} waiting for lock on {path}")]
    Timeout { path: RepoPath, waited: Duration },

    #[error("Another thread is already upgrading {path} to exclusive")]
    UpgradeConflict { path: RepoPath },

    #[error("Lock table poisoned")]
    Poisoned,
}

/// Validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Invalid name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },
}

/// Cluster transport errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClusterError {
    #[error("Failed to encode cluster message: {reason}")]
    Encode { reason: String },

    #[error("Failed to decode cluster message: {reason}")]
    Decode { reason: String },

    #[error("Cluster node {node_id} is not connected")]
    Disconnected { node_id: String },

    #[error("Cluster state poisoned")]
    Poisoned,
}

/// Master error type for all Arbor errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ArborError {
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),
}

impl From<std::io::Error> for ArborError {
    fn from(err: std::io::Error) -> Self {
        ArborError::Repository(err.into())
    }
}

impl ArborError {
    /// The repository error carried by this error, if any.
    pub fn as_repository(&self) -> Option<&RepositoryError> {
        match self {
            ArborError::Repository(err) => Some(err),
            _ => None,
        }
    }
}

/// Result type alias for Arbor operations.
pub type ArborResult<T> = Result<T, ArborError>;

// =============================================================================
// TESTS
// =============================================================================
