//! Hierarchical path locks.
//!
//! A [`PathLockManager`] grants SHARED or EXCLUSIVE holds on batches of
//! [`RepoPath`]s. Every batch is collected into a `BTreeSet` before anything
//! is acquired, so duplicates disappear and all batches take their paths in
//! the same global order. Two batches that overlap therefore always meet on
//! their first common path and can never wait on each other in a cycle.
//!
//! Holds are reentrant per thread:
//!
//! - a thread holding EXCLUSIVE may take the same path again in either mode
//! - a thread holding SHARED may take SHARED again, even past waiting writers
//! - SHARED upgrades to EXCLUSIVE only when the caller is the sole reader
//!
//! Only one thread at a time may wait to upgrade a given path. Two readers
//! upgrading together would each wait for the other's shared hold to go
//! away, so the second one fails at once with [`LockError::UpgradeConflict`].
//!
//! New readers queue behind a waiting writer so a steady stream of reads
//! cannot starve writes.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use arbor_core::{ArborResult, LockConfig, LockError, LockMode, RepoPath};

#[derive(Debug, Default)]
struct LockEntry {
    exclusive: Option<ThreadId>,
    exclusive_count: usize,
    shared: HashMap<ThreadId, usize>,
    waiting: usize,
    waiting_writers: usize,
    upgrading: Option<ThreadId>,
}

impl LockEntry {
    fn can_grant(&self, mode: LockMode, thread: ThreadId) -> bool {
        if self.exclusive.is_some_and(|holder| holder != thread) {
            return false;
        }
        match mode {
            LockMode::Exclusive => self.shared.keys().all(|&reader| reader == thread),
            LockMode::Shared => {
                self.exclusive.is_some()
                    || self.shared.contains_key(&thread)
                    || self.waiting_writers == 0
            }
        }
    }

    fn grant(&mut self, mode: LockMode, thread: ThreadId) {
        match mode {
            LockMode::Exclusive => {
                self.exclusive = Some(thread);
                self.exclusive_count += 1;
            }
            LockMode::Shared => *self.shared.entry(thread).or_insert(0) += 1,
        }
    }

    fn release(&mut self, mode: LockMode, thread: ThreadId) {
        match mode {
            LockMode::Exclusive => {
                if self.exclusive == Some(thread) {
                    self.exclusive_count = self.exclusive_count.saturating_sub(1);
                    if self.exclusive_count == 0 {
                        self.exclusive = None;
                    }
                }
            }
            LockMode::Shared => {
                if let Some(count) = self.shared.get_mut(&thread) {
                    *count -= 1;
                    if *count == 0 {
                        self.shared.remove(&thread);
                    }
                }
            }
        }
    }

    fn is_upgrade(&self, mode: LockMode, thread: ThreadId) -> bool {
        mode.is_exclusive() && self.exclusive.is_none() && self.shared.contains_key(&thread)
    }

    fn start_waiting(&mut self, mode: LockMode, thread: ThreadId) {
        if self.is_upgrade(mode, thread) {
            self.upgrading = Some(thread);
        }
        self.waiting += 1;
        if mode.is_exclusive() {
            self.waiting_writers += 1;
        }
    }

    fn stop_waiting(&mut self, mode: LockMode, thread: ThreadId) {
        if self.upgrading == Some(thread) {
            self.upgrading = None;
        }
        self.waiting = self.waiting.saturating_sub(1);
        if mode.is_exclusive() {
            self.waiting_writers = self.waiting_writers.saturating_sub(1);
        }
    }

    fn is_held(&self) -> bool {
        self.exclusive.is_some() || !self.shared.is_empty()
    }

    fn is_idle(&self) -> bool {
        !self.is_held() && self.waiting == 0
    }
}

#[derive(Debug, Default)]
struct LockTable {
    entries: HashMap<RepoPath, LockEntry>,
    stats: LockStats,
}

impl LockTable {
    /// Give up on `path` and release the part of the batch already held.
    fn abandon(
        &mut self,
        path: &RepoPath,
        waited: bool,
        acquired: &[RepoPath],
        mode: LockMode,
        thread: ThreadId,
    ) {
        if let Some(entry) = self.entries.get_mut(path) {
            if waited {
                entry.stop_waiting(mode, thread);
            }
            if entry.is_idle() {
                self.entries.remove(path);
            }
        }
        self.release_all(acquired, mode, thread);
    }

    fn release_all(&mut self, paths: &[RepoPath], mode: LockMode, thread: ThreadId) {
        for path in paths.iter().rev() {
            if let Some(entry) = self.entries.get_mut(path) {
                entry.release(mode, thread);
                if entry.is_idle() {
                    self.entries.remove(path);
                }
            }
        }
    }
}

/// Counters describing lock traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockStats {
    /// Batches granted.
    pub acquisitions: u64,
    /// Paths that had to wait before being granted.
    pub contended: u64,
    /// Batches abandoned after the timeout.
    pub timeouts: u64,
    /// Batches released.
    pub releases: u64,
}

/// Grants SHARED and EXCLUSIVE holds on batches of paths.
///
/// The table is one mutex-guarded map from path to holder state, with a
/// single condition variable signalled on every release. Entries exist only
/// while a path is held or waited on.
#[derive(Debug, Default)]
pub struct PathLockManager {
    table: Mutex<LockTable>,
    released: Condvar,
    timeout: Option<Duration>,
}

impl PathLockManager {
    /// A manager that waits as long as it takes.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &LockConfig) -> Self {
        Self {
            timeout: config.timeout,
            ..Self::default()
        }
    }

    /// Give up on a batch that cannot be granted within `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn table(&self) -> Result<MutexGuard<'_, LockTable>, LockError> {
        self.table.lock().map_err(|_| LockError::Poisoned)
    }

    /// Acquire `mode` on every path in `paths`, in canonical order.
    ///
    /// Blocks until the whole batch is held. With a timeout configured, a
    /// batch that cannot be completed in time releases whatever it already
    /// holds and fails with [`LockError::Timeout`]. An upgrade that would
    /// race another thread's upgrade of the same path fails immediately
    /// with [`LockError::UpgradeConflict`], also releasing the partial batch.
    pub fn lock<I>(&self, paths: I, mode: LockMode) -> ArborResult<PathLockGuard<'_>>
    where
        I: IntoIterator<Item = RepoPath>,
    {
        let ordered: BTreeSet<RepoPath> = paths.into_iter().collect();
        let thread = thread::current().id();
        let started = Instant::now();
        let deadline = self.timeout.map(|timeout| started + timeout);

        let mut table = self.table()?;
        let mut acquired: Vec<RepoPath> = Vec::with_capacity(ordered.len());

        for path in ordered {
            let mut waited = false;
            loop {
                let entry = table.entries.entry(path.clone()).or_default();
                if entry.can_grant(mode, thread) {
                    entry.grant(mode, thread);
                    if waited {
                        entry.stop_waiting(mode, thread);
                        table.stats.contended += 1;
                    }
                    break;
                }
                if !waited {
                    if entry.is_upgrade(mode, thread) && entry.upgrading.is_some() {
                        table.abandon(&path, false, &acquired, mode, thread);
                        drop(table);
                        self.released.notify_all();
                        tracing::warn!(path = %path, "Concurrent upgrade to exclusive refused");
                        return Err(LockError::UpgradeConflict { path }.into());
                    }
                    entry.start_waiting(mode, thread);
                    waited = true;
                    tracing::debug!(path = %path, mode = %mode, "Waiting for path lock");
                }

                table = match deadline {
                    None => self
                        .released
                        .wait(table)
                        .map_err(|_| LockError::Poisoned)?,
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            table.abandon(&path, true, &acquired, mode, thread);
                            table.stats.timeouts += 1;
                            drop(table);
                            self.released.notify_all();

                            let waited = started.elapsed();
                            tracing::warn!(path = %path, mode = %mode, ?waited, "Timed out waiting for path lock");
                            return Err(LockError::Timeout { path, waited }.into());
                        }
                        self.released
                            .wait_timeout(table, deadline - now)
                            .map_err(|_| LockError::Poisoned)?
                            .0
                    }
                };
            }
            acquired.push(path);
        }

        table.stats.acquisitions += 1;
        drop(table);
        tracing::trace!(paths = acquired.len(), mode = %mode, "Acquired path locks");

        Ok(PathLockGuard {
            manager: self,
            paths: acquired,
            mode,
            thread,
            released: false,
        })
    }

    /// Release a batch. Equivalent to dropping the guard.
    pub fn unlock(&self, mut guard: PathLockGuard<'_>) {
        guard.release();
    }

    fn release(&self, paths: &[RepoPath], mode: LockMode, thread: ThreadId) {
        // Release must always succeed, even after a panic elsewhere.
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        table.release_all(paths, mode, thread);
        table.stats.releases += 1;
        drop(table);
        self.released.notify_all();
        tracing::trace!(paths = paths.len(), mode = %mode, "Released path locks");
    }

    /// Paths currently held in any mode, in canonical order.
    pub fn held_paths(&self) -> Vec<RepoPath> {
        let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        let held: BTreeSet<RepoPath> = table
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_held())
            .map(|(path, _)| path.clone())
            .collect();
        held.into_iter().collect()
    }

    pub fn is_locked(&self, path: &RepoPath) -> bool {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .get(path)
            .is_some_and(LockEntry::is_held)
    }

    /// Number of paths with a table entry, held or waited on.
    pub fn table_size(&self) -> usize {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn stats(&self) -> LockStats {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stats
    }
}

/// Scoped hold on a batch of paths. Released in reverse acquisition order
/// when dropped.
#[derive(Debug)]
#[must_use = "path locks are released as soon as the guard is dropped"]
pub struct PathLockGuard<'a> {
    manager: &'a PathLockManager,
    paths: Vec<RepoPath>,
    mode: LockMode,
    thread: ThreadId,
    released: bool,
}

impl PathLockGuard<'_> {
    /// Locked paths in acquisition order.
    pub fn paths(&self) -> &[RepoPath] {
        &self.paths
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Release now. Calling this more than once has no further effect.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if !self.paths.is_empty() {
            self.manager.release(&self.paths, self.mode, self.thread);
        }
    }
}

impl Drop for PathLockGuard<'_> {
    fn drop(&mut self) {
        self.release();
    }
}
