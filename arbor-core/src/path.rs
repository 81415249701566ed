//! Hierarchical repository paths.
//!
//! A [`RepoPath`] is always held in canonical form: it starts with `/`, the
//! root is exactly `/`, and no other path ends with a slash or contains
//! empty, `.` or `..` segments.
//!
//! # Ordering
//!
//! Paths are ordered byte-wise on their canonical string. An ancestor is a
//! strict prefix of each of its descendants, so it always sorts first. The
//! lock manager relies on this order to acquire batches deterministically.

use crate::error::ValidationError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

const SEPARATOR: char = '/';

/// A canonical slash-delimited repository path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepoPath(String);

impl RepoPath {
    /// The root path `/`.
    pub fn root() -> Self {
        RepoPath(SEPARATOR.to_string())
    }

    /// Parse and validate a path.
    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        let invalid = |reason: &str| ValidationError::InvalidPath {
            path: s.to_string(),
            reason: reason.to_string(),
        };

        if !s.starts_with(SEPARATOR) {
            return Err(invalid("must start with '/'"));
        }
        if s == "/" {
            return Ok(Self::root());
        }
        if s.ends_with(SEPARATOR) {
            return Err(invalid("must not end with '/'"));
        }
        for segment in s[1..].split(SEPARATOR) {
            validate_name(segment).map_err(|e| match e {
                ValidationError::InvalidName { reason, .. } => invalid(&reason),
                other => other,
            })?;
        }
        Ok(RepoPath(s.to_string()))
    }

    /// Canonical string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.len() == 1
    }

    /// The parent path, or `None` for the root.
    pub fn parent(&self) -> Option<RepoPath> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind(SEPARATOR) {
            Some(0) => Some(Self::root()),
            Some(idx) => Some(RepoPath(self.0[..idx].to_string())),
            None => None,
        }
    }

    /// Last segment; empty for the root.
    pub fn name(&self) -> &str {
        match self.0.rfind(SEPARATOR) {
            Some(idx) => &self.0[idx + 1..],
            None => &self.0,
        }
    }

    /// Append a single child segment.
    pub fn extend(&self, name: &str) -> Result<RepoPath, ValidationError> {
        validate_name(name)?;
        if self.is_root() {
            Ok(RepoPath(format!("/{}", name)))
        } else {
            Ok(RepoPath(format!("{}/{}", self.0, name)))
        }
    }

    /// Path segments from the root down, excluding the root itself.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0[1..].split(SEPARATOR).filter(|s| !s.is_empty())
    }

    /// Number of segments; the root has depth 0.
    pub fn depth(&self) -> usize {
        self.segments().count()
    }

    /// Strict ancestor test: `/a` is an ancestor of `/a/b` but not of itself
    /// or of `/ab`.
    pub fn is_ancestor_of(&self, other: &RepoPath) -> bool {
        if self.is_root() {
            return !other.is_root();
        }
        other.0.len() > self.0.len()
            && other.0.starts_with(&self.0)
            && other.0.as_bytes()[self.0.len()] == b'/'
    }

    pub fn is_descendant_of(&self, other: &RepoPath) -> bool {
        other.is_ancestor_of(self)
    }

    /// Prefix shared by every descendant of this path (`/a/`, or `/` for the root).
    pub fn descendant_prefix(&self) -> String {
        if self.is_root() {
            self.0.clone()
        } else {
            format!("{}/", self.0)
        }
    }

    /// Rebase this path from `from` onto `to`; `None` unless `self` is `from`
    /// or one of its descendants.
    pub fn rebase(&self, from: &RepoPath, to: &RepoPath) -> Option<RepoPath> {
        if self == from {
            return Some(to.clone());
        }
        if !from.is_ancestor_of(self) {
            return None;
        }
        let suffix = &self.0[from.descendant_prefix().len()..];
        if to.is_root() {
            Some(RepoPath(format!("/{}", suffix)))
        } else {
            Some(RepoPath(format!("{}/{}", to.0, suffix)))
        }
    }
}

fn validate_name(name: &str) -> Result<(), ValidationError> {
    let invalid = |reason: &str| ValidationError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    };
    if name.is_empty() {
        return Err(invalid("empty segment"));
    }
    if name == "." || name == ".." {
        return Err(invalid("relative segment"));
    }
    if name.contains(SEPARATOR) {
        return Err(invalid("contains '/'"));
    }
    if name.contains('\\') || name.contains('\0') {
        return Err(invalid("contains a forbidden character"));
    }
    Ok(())
}

impl fmt::Display for RepoPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RepoPath {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for RepoPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Serialize for RepoPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for RepoPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        RepoPath::parse(&s).map_err(serde::de::Error::custom)
    }
}
