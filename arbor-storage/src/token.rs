//! Session token resolution.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use arbor_core::{Principal, Token};

/// Resolves session tokens to principals.
///
/// Every successful lookup counts as activity on the session, so calling
/// [`principal`](TokenManager::principal) periodically keeps a long-running
/// upload from outliving its session.
pub trait TokenManager: Send + Sync {
    fn principal(&self, token: &Token) -> Option<Principal>;
}

#[derive(Debug)]
struct Session {
    principal: Principal,
    last_access: Instant,
}

/// In-memory token manager with idle expiry.
#[derive(Debug)]
pub struct InMemoryTokenManager {
    sessions: RwLock<HashMap<Token, Session>>,
    idle_timeout: Option<Duration>,
    lookups: AtomicU64,
}

impl Default for InMemoryTokenManager {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTokenManager {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            idle_timeout: None,
            lookups: AtomicU64::new(0),
        }
    }

    /// Sessions idle longer than `timeout` are dropped on next lookup.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Open a session for `principal` and return its token.
    pub fn register(&self, principal: Principal) -> Token {
        let token = Token::generate();
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                token.clone(),
                Session {
                    principal,
                    last_access: Instant::now(),
                },
            );
        token
    }

    pub fn revoke(&self, token: &Token) {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(token);
    }

    /// Number of lookups served, successful or not.
    pub fn lookup_count(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }
}

impl TokenManager for InMemoryTokenManager {
    fn principal(&self, token: &Token) -> Option<Principal> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);

        let expired = match (sessions.get(token), self.idle_timeout) {
            (None, _) => return None,
            (Some(session), Some(timeout)) => session.last_access.elapsed() > timeout,
            (Some(_), None) => false,
        };
        if expired {
            sessions.remove(token);
            tracing::debug!("Session expired after idle timeout");
            return None;
        }

        let session = sessions.get_mut(token)?;
        session.last_access = Instant::now();
        Some(session.principal.clone())
    }
}
