//! Per-path serialization.
//!
//! Mutations that touch the same path (write, release, rename, unlink,
//! time-set) run one at a time. Locking a path also takes a shared lock on
//! each of its ancestors, so an operation holding a directory (a directory
//! rename or removal) excludes everything below it until it finishes.
//!
//! Every acquisition takes its locks in sorted path order. An ancestor sorts
//! before its descendants, so two operations can never wait on each other.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock as AsyncRwLock};

/// Held locks; released on drop.
#[derive(Debug)]
pub struct PathGuard {
    _exclusive: Vec<OwnedRwLockWriteGuard<()>>,
    _shared: Vec<OwnedRwLockReadGuard<()>>,
}

/// Lazily created async lock per path.
///
/// Entries are weak, so a path's lock disappears once nobody holds or
/// waits on it.
#[derive(Debug, Default)]
pub struct PathLocks {
    locks: Mutex<HashMap<String, Weak<AsyncRwLock<()>>>>,
}

impl PathLocks {
    /// Create an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, path: &str) -> Arc<AsyncRwLock<()>> {
        let mut locks = self.locks.lock();
        if let Some(existing) = locks.get(path).and_then(Weak::upgrade) {
            return existing;
        }

        locks.retain(|_, weak| weak.strong_count() > 0);
        let lock: Arc<AsyncRwLock<()>> = Arc::new(AsyncRwLock::new(()));
        locks.insert(path.to_string(), Arc::downgrade(&lock));
        lock
    }

    /// Lock one path exclusively, and its ancestors shared.
    pub async fn lock(&self, path: &str) -> PathGuard {
        self.lock_many(&[path]).await
    }

    /// Lock several paths exclusively, and all their ancestors shared.
    ///
    /// Duplicates are locked once. A path that is both requested and an
    /// ancestor of another requested path is locked exclusively.
    pub async fn lock_many(&self, paths: &[&str]) -> PathGuard {
        // true = exclusive
        let mut plan: BTreeMap<&str, bool> = BTreeMap::new();
        for &path in paths {
            for ancestor in ancestors(path) {
                plan.entry(ancestor).or_insert(false);
            }
            plan.insert(path, true);
        }

        let mut exclusive_guards: Vec<OwnedRwLockWriteGuard<()>> = Vec::new();
        let mut shared_guards: Vec<OwnedRwLockReadGuard<()>> = Vec::new();
        for (path, exclusive) in plan {
            let lock: Arc<AsyncRwLock<()>> = self.entry(path);
            if exclusive {
                exclusive_guards.push(lock.write_owned().await);
            } else {
                shared_guards.push(lock.read_owned().await);
            }
        }
        PathGuard {
            _exclusive: exclusive_guards,
            _shared: shared_guards,
        }
    }

    /// Number of paths with a live lock.
    pub fn active(&self) -> usize {
        self.locks
            .lock()
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }
}

/// Proper, non-root ancestors of a normalized path, shallowest first.
fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    path.match_indices('/').map(move |(i, _)| &path[..i])
}
