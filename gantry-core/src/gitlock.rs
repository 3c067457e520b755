//! Per-repository mutual exclusion for on-disk git mutations.
//!
//! Clone, fetch, and worktree add/remove against the same repository must
//! never interleave. Each repository id maps to one lock; the map itself is
//! guarded so lock creation races are impossible. Callers must not hold two
//! repository locks at once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Process-wide registry of per-repository locks.
#[derive(Default)]
pub struct GitLock {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl GitLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, repository_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().expect("git lock map poisoned");
        locks
            .entry(repository_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run `f` while holding the lock for `repository_id`.
    ///
    /// The lock is released on every exit path, including panics inside `f`
    /// (a poisoned inner lock is treated as free, since the guarded state
    /// lives on disk and each operation re-validates it).
    pub fn with_lock<T>(
        &self,
        repository_id: &str,
        operation: &str,
        f: impl FnOnce() -> T,
    ) -> T {
        let lock = self.lock_for(repository_id);
        let _guard = match lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        log::trace!("git lock held for {repository_id} ({operation})");
        f()
    }
}
