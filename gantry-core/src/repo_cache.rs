//! Lifecycle of cached repository clones.
//!
//! Each repository is cloned once under `<cache_root>/<owner>_<repo>` and
//! reused by every worktree. Fetches are opportunistic: only when a caller
//! asks (`for_fetch`) and the clone is older than the cache timeout. All
//! disk mutation happens under the per-repository git lock.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;

use crate::gitlock::GitLock;
use crate::model::RepositoryState;
use crate::ports::GitPort;

pub struct RepositoryCache {
    cache_root: PathBuf,
    git: Arc<dyn GitPort>,
    locks: Arc<GitLock>,
    clone_depth: Option<u32>,
    cache_timeout: Duration,
    remote_url_template: String,
    repos: Mutex<HashMap<String, RepositoryState>>,
}

impl RepositoryCache {
    pub fn new(
        cache_root: PathBuf,
        git: Arc<dyn GitPort>,
        locks: Arc<GitLock>,
        clone_depth: Option<u32>,
        cache_timeout: Duration,
        remote_url_template: String,
    ) -> Self {
        Self {
            cache_root,
            git,
            locks,
            clone_depth,
            cache_timeout,
            remote_url_template,
            repos: Mutex::new(HashMap::new()),
        }
    }

    fn local_path(&self, repository_id: &str) -> PathBuf {
        self.cache_root.join(repository_id.replace('/', "_"))
    }

    fn remote_url(&self, repository_id: &str) -> String {
        self.remote_url_template.replace("{repository}", repository_id)
    }

    /// Ensure the repository is cloned locally; returns its path.
    ///
    /// With `for_fetch` set, also refreshes the clone when it has not been
    /// fetched within the cache timeout. A failed fetch is logged and
    /// tolerated; a failed clone is an error and leaves no cache entry or
    /// partial checkout behind.
    pub fn ensure_repository(&self, repository_id: &str, for_fetch: bool) -> Result<PathBuf> {
        let local_path = self.local_path(repository_id);

        self.locks.with_lock(repository_id, "ensure_repository", || -> Result<()> {
            let already_cloned = self.is_repository_cloned(repository_id)
                || self.git.is_valid_repository(&local_path);

            if !already_cloned {
                fs::create_dir_all(&self.cache_root).with_context(|| {
                    format!("creating repository cache root {}", self.cache_root.display())
                })?;
                let url = self.remote_url(repository_id);
                log::info!("cloning {repository_id} into {}", local_path.display());
                if let Err(e) = self.git.clone_repository(&url, &local_path, self.clone_depth) {
                    // Roll back: a half-written checkout must not be adopted
                    // on the next call.
                    let _ = fs::remove_dir_all(&local_path);
                    return Err(e.context(format!("cloning {repository_id}")));
                }
                let mut repos = self.repos.lock().expect("repo cache poisoned");
                repos.insert(
                    repository_id.to_string(),
                    RepositoryState {
                        repository_id: repository_id.to_string(),
                        local_path: local_path.clone(),
                        last_fetch_at: Some(Utc::now()),
                        active_worktrees: Default::default(),
                    },
                );
                return Ok(());
            }

            // Adopt a clone left behind by a previous run.
            {
                let mut repos = self.repos.lock().expect("repo cache poisoned");
                repos.entry(repository_id.to_string()).or_insert_with(|| RepositoryState {
                    repository_id: repository_id.to_string(),
                    local_path: local_path.clone(),
                    last_fetch_at: None,
                    active_worktrees: Default::default(),
                });
            }

            if for_fetch && self.is_stale(repository_id) {
                log::debug!("fetching {repository_id}");
                match self.git.fetch(&local_path) {
                    Ok(()) => {
                        let mut repos = self.repos.lock().expect("repo cache poisoned");
                        if let Some(state) = repos.get_mut(repository_id) {
                            state.last_fetch_at = Some(Utc::now());
                        }
                    }
                    Err(e) => log::warn!("fetch failed for {repository_id}: {e:#}"),
                }
            }
            Ok(())
        })?;

        Ok(local_path)
    }

    fn is_stale(&self, repository_id: &str) -> bool {
        let repos = self.repos.lock().expect("repo cache poisoned");
        match repos.get(repository_id).and_then(|s| s.last_fetch_at) {
            Some(at) => {
                let age = Utc::now().signed_duration_since(at);
                age.to_std().map(|age| age > self.cache_timeout).unwrap_or(true)
            }
            None => true,
        }
    }

    pub fn is_repository_cloned(&self, repository_id: &str) -> bool {
        self.repos
            .lock()
            .expect("repo cache poisoned")
            .contains_key(repository_id)
    }

    /// Register a worktree path against the repository. Pure bookkeeping.
    pub fn add_worktree(&self, repository_id: &str, worktree_path: &std::path::Path) {
        let mut repos = self.repos.lock().expect("repo cache poisoned");
        if let Some(state) = repos.get_mut(repository_id) {
            state.active_worktrees.insert(worktree_path.to_path_buf());
        }
    }

    pub fn remove_worktree(&self, repository_id: &str, worktree_path: &std::path::Path) {
        let mut repos = self.repos.lock().expect("repo cache poisoned");
        if let Some(state) = repos.get_mut(repository_id) {
            state.active_worktrees.remove(worktree_path);
        }
    }

    pub fn repository_state(&self, repository_id: &str) -> Option<RepositoryState> {
        self.repos
            .lock()
            .expect("repo cache poisoned")
            .get(repository_id)
            .cloned()
    }
}
