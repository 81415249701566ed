//! Arbor Test Utilities
//!
//! Shared test infrastructure for the Arbor workspace:
//! - Proptest generators for paths and path batches
//! - Instrumented fakes: a recording delegate repository, a cache spy and a
//!   cluster transport spy
//! - Fixtures for common repository trees
//! - Tracing initialisation for tests

pub mod generators;
pub mod recording;

// Re-export mocks from their source crate
pub use arbor_storage::{InMemoryCache, InMemoryTokenManager, MockRepository};

// Re-export core types for convenience
pub use arbor_core::{
    ArborError, ArborResult, ContentSource, LockMode, RepoPath, RepositoryConfig, RepositoryError,
    Resource, ResourceKind, Token,
};

pub use recording::{CallRecord, RecordingCache, RecordingRepository, RecordingTransport};

use arbor_storage::Repository;
use tracing_subscriber::EnvFilter;

// ============================================================================
// TRACING
// ============================================================================

/// Install a test-friendly subscriber once per process. `RUST_LOG` overrides
/// the default `warn` filter.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

// ============================================================================
// FIXTURES
// ============================================================================

/// Parse a path, panicking on invalid input.
pub fn path(s: &str) -> RepoPath {
    RepoPath::parse(s).unwrap_or_else(|e| panic!("invalid test path {s:?}: {e}"))
}

/// Token whose string doubles as the principal name when no token manager
/// is configured.
pub fn token(principal: &str) -> Token {
    Token::new(principal)
}

/// Build `/docs`, `/docs/a.txt`, `/docs/sub` and `/docs/sub/b.txt`.
pub fn docs_tree(repo: &dyn Repository, token: &Token) -> ArborResult<()> {
    repo.create_collection(token, &path("/docs"))?;
    repo.create_document(token, &path("/docs/a.txt"), ContentSource::bytes("alpha"))?;
    repo.create_collection(token, &path("/docs/sub"))?;
    repo.create_document(token, &path("/docs/sub/b.txt"), ContentSource::bytes("beta"))?;
    Ok(())
}

/// Build a chain of nested collections, e.g. `["a", "b", "c"]` gives
/// `/a`, `/a/b` and `/a/b/c`.
pub fn nested_collections(
    repo: &dyn Repository,
    token: &Token,
    names: &[&str],
) -> ArborResult<Vec<RepoPath>> {
    let mut current = RepoPath::root();
    let mut created = Vec::with_capacity(names.len());
    for name in names {
        current = current.extend(name)?;
        repo.create_collection(token, &current)?;
        created.push(current.clone());
    }
    Ok(created)
}

/// Retrieve every path so a read-through cache holds them.
pub fn warm(repo: &dyn Repository, token: &Token, paths: &[RepoPath]) -> ArborResult<()> {
    for p in paths {
        repo.retrieve(token, p, false)?;
    }
    Ok(())
}
