//! Session tokens and principals.

use crate::EntityId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// An opaque session token issued to an authenticated caller.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Token(String);

impl Token {
    pub fn new(value: impl Into<String>) -> Self {
        Token(value.into())
    }

    /// A fresh random token.
    pub fn generate() -> Self {
        Token(uuid::Uuid::now_v7().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Tokens are credentials; keep them out of logs.
impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(***)")
    }
}

/// Kind of principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrincipalKind {
    User,
    Group,
    /// Internal system principal allowed to write on replicas.
    System,
}

/// An authenticated identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal {
    pub id: EntityId,
    pub name: String,
    pub kind: PrincipalKind,
}

impl Principal {
    pub fn user(name: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::now_v7(),
            name: name.into(),
            kind: PrincipalKind::User,
        }
    }

    pub fn system(name: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::now_v7(),
            name: name.into(),
            kind: PrincipalKind::System,
        }
    }
}
