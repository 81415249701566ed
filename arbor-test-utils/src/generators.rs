//! Proptest generators.

use arbor_core::{LockMode, RepoPath};
use proptest::prelude::*;

/// A single valid path segment. Includes characters that sort next to `/`
/// so ordering bugs around lookalike siblings (`/a-b`, `/a.b`) show up.
pub fn arb_segment() -> impl Strategy<Value = String> {
    "[a-c][a-c.\\-]{0,3}"
}

/// A path up to `max_depth` segments deep, the root included.
pub fn arb_path(max_depth: usize) -> impl Strategy<Value = RepoPath> {
    prop::collection::vec(arb_segment(), 0..=max_depth).prop_map(|segments| {
        segments
            .iter()
            .try_fold(RepoPath::root(), |path, name| path.extend(name))
            .unwrap_or_else(|_| RepoPath::root())
    })
}

/// A batch of paths, possibly with duplicates, in arbitrary order.
pub fn arb_path_batch(max_len: usize) -> impl Strategy<Value = Vec<RepoPath>> {
    prop::collection::vec(arb_path(3), 0..=max_len)
}

pub fn arb_lock_mode() -> impl Strategy<Value = LockMode> {
    prop_oneof![Just(LockMode::Shared), Just(LockMode::Exclusive)]
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn prop_generated_paths_parse(path in arb_path(4)) {
            prop_assert_eq!(RepoPath::parse(path.as_str()).unwrap(), path);
        }
    }
}
