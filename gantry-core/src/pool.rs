//! Bounded pool of workers with lifecycle, recovery, and assignment policy.
//!
//! The pool exclusively owns its workers. The structural map sits behind a
//! single mutex for membership changes; everything per-worker is serialized
//! on the worker record itself. Size stays within `min_workers ..=
//! max_workers`: restore tops up to min, lazy creation stops at max,
//! recovery replaces workers it has to drop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::config::GantryConfig;
use crate::error::OrchestratorError;
use crate::model::{Task, TaskId, WorkerStatus};
use crate::worker::{Worker, WorkerDeps, WorkerSnapshot};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    /// Stopped workers recover after this window; error workers after half.
    pub recovery_timeout: Duration,
    pub idle_timeout: Duration,
    /// Idle reaping never shrinks the pool below this floor.
    pub min_persistent_workers: usize,
    pub developer_type: String,
}

impl PoolConfig {
    pub fn from_config(config: &GantryConfig) -> Self {
        Self {
            min_workers: config.min_workers,
            max_workers: config.max_workers,
            recovery_timeout: config.worker_recovery_timeout,
            idle_timeout: Duration::from_secs(config.idle_timeout_minutes * 60),
            min_persistent_workers: config.min_persistent_workers,
            developer_type: config.developer_type.clone(),
        }
    }
}

/// Counts by status plus per-worker snapshots.
#[derive(Debug, Clone)]
pub struct PoolStatus {
    pub total: usize,
    pub idle: usize,
    pub waiting: usize,
    pub working: usize,
    pub stopped: usize,
    pub error: usize,
    pub workers: Vec<WorkerSnapshot>,
}

pub struct WorkerPool {
    config: PoolConfig,
    deps: WorkerDeps,
    workers: Mutex<HashMap<String, Arc<Worker>>>,
    seq: AtomicU64,
    initialized: AtomicBool,
}

impl WorkerPool {
    pub fn new(config: PoolConfig, deps: WorkerDeps) -> Self {
        Self {
            config,
            deps,
            workers: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(1),
            initialized: AtomicBool::new(false),
        }
    }

    /// Restore workers from durable state, then top up to `min_workers`.
    /// Idempotent: a second call is a no-op.
    pub fn initialize(&self) -> Result<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let records = self.deps.state.list_workers()?;
        {
            let mut workers = self.lock_workers();
            for record in &records {
                let worker = Worker::from_record(record, self.deps.clone());
                // Keep the id sequence ahead of every restored id.
                if let Some(n) = record
                    .worker_id
                    .strip_prefix("worker-")
                    .and_then(|n| n.parse::<u64>().ok())
                {
                    self.seq.fetch_max(n + 1, Ordering::SeqCst);
                }
                workers.insert(record.worker_id.clone(), worker);
            }
        }
        if !records.is_empty() {
            log::info!("restored {} worker(s) from state", records.len());
        }

        self.top_up_to_min()?;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    fn ensure_initialized(&self) -> Result<()> {
        if !self.is_initialized() {
            return Err(
                OrchestratorError::NotAvailable("worker pool not initialized".into()).into(),
            );
        }
        Ok(())
    }

    /// An idle worker, or a freshly created one while below `max_workers`.
    /// `None` means the pool is saturated.
    pub fn get_available_worker(&self) -> Result<Option<Arc<Worker>>> {
        self.ensure_initialized()?;
        let mut workers = self.lock_workers();
        if let Some(worker) = workers
            .values()
            .find(|w| w.status() == WorkerStatus::Idle)
        {
            return Ok(Some(worker.clone()));
        }
        if workers.len() < self.config.max_workers {
            let worker = self.create_worker(&mut workers)?;
            return Ok(Some(worker));
        }
        Ok(None)
    }

    /// The single worker bound to `task_id`, if any.
    pub fn get_worker_by_task_id(&self, task_id: &TaskId) -> Option<Arc<Worker>> {
        self.lock_workers()
            .values()
            .find(|w| w.snapshot().task_id.as_ref() == Some(task_id))
            .cloned()
    }

    pub fn get_worker(&self, worker_id: &str) -> Option<Arc<Worker>> {
        self.lock_workers().get(worker_id).cloned()
    }

    pub fn assign_worker_task(&self, worker_id: &str, task: Task) -> Result<()> {
        self.ensure_initialized()?;
        let worker = self.get_worker(worker_id).ok_or_else(|| {
            OrchestratorError::NotAvailable(format!("no worker {worker_id} in pool"))
        })?;
        worker.assign_task(task)
    }

    /// Clean the worker up and return it to idle.
    pub fn release_worker(&self, worker_id: &str) -> Result<()> {
        let worker = self.get_worker(worker_id).ok_or_else(|| {
            OrchestratorError::NotAvailable(format!("no worker {worker_id} in pool"))
        })?;
        worker.cancel_execution()
    }

    /// Force a worker toward a target status. Only the transitions that
    /// preserve worker invariants are supported.
    pub fn update_worker_status(&self, worker_id: &str, status: WorkerStatus) -> Result<()> {
        let worker = self.get_worker(worker_id).ok_or_else(|| {
            OrchestratorError::NotAvailable(format!("no worker {worker_id} in pool"))
        })?;
        match status {
            WorkerStatus::Idle => worker.cancel_execution(),
            WorkerStatus::Stopped => worker.pause_execution(),
            WorkerStatus::Waiting => worker.recover(),
            other => Err(OrchestratorError::NotAvailable(format!(
                "cannot force worker {worker_id} into {other}"
            ))
            .into()),
        }
    }

    /// Recover stopped workers whose inactivity exceeds the full recovery
    /// window. Returns how many were pushed back to work.
    pub fn recover_stopped_workers(&self) -> usize {
        self.recover_where(WorkerStatus::Stopped, self.config.recovery_timeout)
    }

    /// Recover error workers after half the recovery window.
    pub fn recover_error_workers(&self) -> usize {
        self.recover_where(WorkerStatus::Error, self.config.recovery_timeout / 2)
    }

    fn recover_where(&self, status: WorkerStatus, threshold: Duration) -> usize {
        let candidates: Vec<Arc<Worker>> = self
            .lock_workers()
            .values()
            .filter(|w| w.status() == status)
            .cloned()
            .collect();

        let mut recovered = 0;
        for worker in candidates {
            if worker.seconds_since_active() < threshold.as_secs() as i64 {
                continue;
            }
            match worker.recover() {
                Ok(()) => recovered += 1,
                Err(e) => {
                    // Unrecoverable: drop it and let top-up preserve the
                    // minimum.
                    log::warn!("dropping unrecoverable worker {}: {e:#}", worker.id());
                    self.lock_workers().remove(worker.id());
                    if let Err(e) = self.deps.state.delete_worker(worker.id()) {
                        log::warn!("deleting worker record {}: {e:#}", worker.id());
                    }
                    if let Err(e) = self.top_up_to_min() {
                        log::warn!("replacing dropped worker: {e:#}");
                    }
                }
            }
        }
        recovered
    }

    /// Drop idle workers past the idle timeout, down to the persistence
    /// floor. Returns how many were reaped.
    pub fn reap_idle_workers(&self) -> usize {
        let floor = self.config.min_workers.max(self.config.min_persistent_workers);
        let mut reaped = 0;
        let mut workers = self.lock_workers();
        loop {
            if workers.len() <= floor {
                break;
            }
            let victim = workers
                .values()
                .find(|w| {
                    w.status() == WorkerStatus::Idle
                        && w.seconds_since_active() >= self.config.idle_timeout.as_secs() as i64
                })
                .map(|w| w.id().to_string());
            match victim {
                Some(id) => {
                    workers.remove(&id);
                    if let Err(e) = self.deps.state.delete_worker(&id) {
                        log::warn!("deleting reaped worker record {id}: {e:#}");
                    }
                    log::info!("reaped idle worker {id}");
                    reaped += 1;
                }
                None => break,
            }
        }
        reaped
    }

    pub fn get_pool_status(&self) -> PoolStatus {
        let snapshots: Vec<WorkerSnapshot> = self
            .lock_workers()
            .values()
            .map(|w| w.snapshot())
            .collect();

        let count = |status: WorkerStatus| snapshots.iter().filter(|s| s.status == status).count();
        PoolStatus {
            total: snapshots.len(),
            idle: count(WorkerStatus::Idle),
            waiting: count(WorkerStatus::Waiting),
            working: count(WorkerStatus::Working),
            stopped: count(WorkerStatus::Stopped),
            error: count(WorkerStatus::Error),
            workers: snapshots,
        }
    }

    /// Wait up to `grace` for working workers, then force the rest into
    /// Stopped, persist everything, and clear the pool. Bound tasks stay in
    /// their records so a restart can pick the lifecycle back up.
    pub fn shutdown(&self, grace: Duration) {
        let deadline = Instant::now() + grace;
        loop {
            let working = self.get_pool_status().working;
            if working == 0 || Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        let workers: Vec<Arc<Worker>> = self.lock_workers().values().cloned().collect();
        for worker in &workers {
            match worker.status() {
                WorkerStatus::Working => {
                    log::warn!("force-stopping worker {} at shutdown", worker.id());
                    if let Err(e) = worker.pause_execution() {
                        log::warn!("pausing worker {}: {e:#}", worker.id());
                    }
                }
                _ => {
                    if let Err(e) = self.deps.state.put_worker(&worker.record()) {
                        log::warn!("persisting worker {}: {e:#}", worker.id());
                    }
                }
            }
        }

        self.lock_workers().clear();
        self.initialized.store(false, Ordering::SeqCst);
        log::info!("worker pool shut down ({} worker(s))", workers.len());
    }

    fn top_up_to_min(&self) -> Result<()> {
        let mut workers = self.lock_workers();
        while workers.len() < self.config.min_workers {
            self.create_worker(&mut workers)?;
        }
        Ok(())
    }

    fn create_worker(
        &self,
        workers: &mut HashMap<String, Arc<Worker>>,
    ) -> Result<Arc<Worker>> {
        let id = format!("worker-{}", self.seq.fetch_add(1, Ordering::SeqCst));
        let worker = Worker::new(id.clone(), self.config.developer_type.clone(), self.deps.clone());
        self.deps.state.put_worker(&worker.record())?;
        workers.insert(id.clone(), worker.clone());
        log::debug!("created worker {id}");
        Ok(worker)
    }

    fn lock_workers(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Worker>>> {
        match self.workers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gitlock::GitLock;
    use crate::model::{
        BoardItem, BoardStatus, ContentType, ExecutionResult, WorkerAction, WorkerRecord,
    };
    use crate::ports::{DeveloperPort, GitPort, ProjectBoardPort, StatePort};
    use crate::prompt::PromptBuilder;
    use crate::repo_cache::RepositoryCache;
    use crate::shutdown::ShutdownSignal;
    use crate::store::FileStateStore;
    use crate::workspace::WorkspaceManager;
    use chrono::Utc;
    use std::path::Path;
    use std::sync::mpsc::{channel, Receiver, Sender};
    use tempfile::TempDir;

    struct FakeGit;

    impl GitPort for FakeGit {
        fn clone_repository(&self, _: &str, local_path: &Path, _: Option<u32>) -> Result<()> {
            std::fs::create_dir_all(local_path.join(".git"))?;
            Ok(())
        }
        fn fetch(&self, _: &Path) -> Result<()> {
            Ok(())
        }
        fn pull_main_branch(&self, _: &Path) -> Result<()> {
            Ok(())
        }
        fn create_worktree(
            &self,
            _: &Path,
            _: &str,
            worktree_path: &Path,
            _: Option<&str>,
        ) -> Result<()> {
            std::fs::create_dir_all(worktree_path)?;
            std::fs::write(worktree_path.join(".git"), "gitdir: elsewhere\n")?;
            Ok(())
        }
        fn remove_worktree(&self, _: &Path, _: &Path) -> Result<()> {
            Ok(())
        }
        fn is_valid_repository(&self, path: &Path) -> bool {
            path.join(".git").exists()
        }
    }

    struct FakeBoard;

    impl ProjectBoardPort for FakeBoard {
        fn get_items(&self, _: &str, _: Option<BoardStatus>) -> Result<Vec<BoardItem>> {
            Ok(vec![])
        }
        fn update_item_status(&self, _: &str, _: BoardStatus) -> Result<()> {
            Ok(())
        }
        fn add_pull_request_to_item(&self, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
        fn set_pull_request_to_item(&self, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
        fn get_repository_default_branch(&self, _: &str) -> Result<String> {
            Ok("main".to_string())
        }
    }

    /// Agent double: blocks on a gate when given one, then emits a PR URL.
    struct GatedDeveloper {
        gates: Mutex<Vec<Receiver<()>>>,
        fail: bool,
    }

    impl GatedDeveloper {
        fn instant() -> Self {
            Self {
                gates: Mutex::new(vec![]),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                gates: Mutex::new(vec![]),
                fail: true,
            }
        }

        fn with_gate() -> (Self, Sender<()>) {
            let (tx, rx) = channel();
            (
                Self {
                    gates: Mutex::new(vec![rx]),
                    fail: false,
                },
                tx,
            )
        }
    }

    impl DeveloperPort for GatedDeveloper {
        fn initialize(&self) -> Result<()> {
            Ok(())
        }
        fn execute(&self, _: &str, _: &Path) -> Result<ExecutionResult> {
            let gate = self.gates.lock().unwrap().pop();
            if let Some(rx) = gate {
                let _ = rx.recv_timeout(Duration::from_secs(10));
            }
            if self.fail {
                anyhow::bail!("scripted agent failure");
            }
            Ok(ExecutionResult {
                raw_output: "https://example.test/acme/svc/pull/7\ncompleted".to_string(),
                stderr: String::new(),
                exit_code: 0,
            })
        }
        fn cleanup(&self) -> Result<()> {
            Ok(())
        }
        fn is_available(&self) -> bool {
            true
        }
        fn set_timeout(&self, _: Duration) {}
    }

    struct Fixture {
        _dir: TempDir,
        pool: WorkerPool,
        state: Arc<FileStateStore>,
    }

    fn fixture_with(developer: Arc<dyn DeveloperPort>, config: PoolConfig) -> Fixture {
        let dir = TempDir::new().unwrap();
        let git: Arc<dyn GitPort> = Arc::new(FakeGit);
        let locks = Arc::new(GitLock::new());
        let state = Arc::new(FileStateStore::new(&dir.path().join("state")));
        let cache = Arc::new(RepositoryCache::new(
            dir.path().join("repos"),
            git.clone(),
            locks.clone(),
            None,
            Duration::from_secs(600),
            "https://example.test/{repository}.git".to_string(),
        ));
        let workspace = Arc::new(WorkspaceManager::new(
            dir.path().join("workspaces"),
            cache,
            git,
            locks,
            Arc::new(FakeBoard),
            state.clone(),
        ));
        let deps = WorkerDeps {
            workspace,
            developer,
            prompts: Arc::new(PromptBuilder::new(64_000)),
            state: state.clone(),
            shutdown: ShutdownSignal::new(),
        };
        Fixture {
            _dir: dir,
            pool: WorkerPool::new(config, deps),
            state,
        }
    }

    fn small_pool() -> PoolConfig {
        PoolConfig {
            min_workers: 1,
            max_workers: 2,
            recovery_timeout: Duration::from_secs(600),
            idle_timeout: Duration::from_secs(1800),
            min_persistent_workers: 1,
            developer_type: "claude".to_string(),
        }
    }

    fn task(id: &str) -> Task {
        Task {
            task_id: TaskId::new(id),
            repository_id: "acme/svc".to_string(),
            action: WorkerAction::StartNewTask,
            board_item: Some(BoardItem {
                id: id.to_string(),
                title: format!("Task {id}"),
                description: String::new(),
                status: BoardStatus::Todo,
                labels: vec![],
                pull_request_urls: vec![],
                content_type: Some(ContentType::Issue),
                content_number: None,
                repository: Some("acme/svc".to_string()),
            }),
            pull_request_url: None,
            review_comments: vec![],
            assigned_at: Utc::now(),
        }
    }

    // ── initialize ────────────────────────────────────────────────────────────

    #[test]
    fn initialize_creates_min_workers() {
        let fx = fixture_with(Arc::new(GatedDeveloper::instant()), small_pool());
        fx.pool.initialize().unwrap();

        let status = fx.pool.get_pool_status();
        assert_eq!(status.total, 1);
        assert_eq!(status.idle, 1);
        assert_eq!(fx.state.list_workers().unwrap().len(), 1);
    }

    #[test]
    fn initialize_is_idempotent() {
        let fx = fixture_with(Arc::new(GatedDeveloper::instant()), small_pool());
        fx.pool.initialize().unwrap();
        fx.pool.initialize().unwrap();
        assert_eq!(fx.pool.get_pool_status().total, 1);
    }

    #[test]
    fn initialize_restores_persisted_workers() {
        let fx = fixture_with(Arc::new(GatedDeveloper::instant()), small_pool());
        fx.state
            .put_worker(&WorkerRecord {
                worker_id: "worker-7".to_string(),
                workspace_dir: None,
                developer_type: "claude".to_string(),
                status: WorkerStatus::Idle,
                current_task: None,
                pull_request_url: None,
                created_at: Utc::now(),
                last_active_at: Utc::now(),
            })
            .unwrap();

        fx.pool.initialize().unwrap();
        let status = fx.pool.get_pool_status();
        assert_eq!(status.total, 1);
        assert!(fx.pool.get_worker("worker-7").is_some());

        // The restored idle worker is handed out first; once it is busy,
        // newly created ids continue past the restored sequence.
        let restored = fx.pool.get_available_worker().unwrap().unwrap();
        assert_eq!(restored.id(), "worker-7");
        restored.assign_task(task("T1")).unwrap();
        let created = fx.pool.get_available_worker().unwrap().unwrap();
        assert_eq!(created.id(), "worker-8");
    }

    #[test]
    fn operations_before_initialize_are_rejected() {
        let fx = fixture_with(Arc::new(GatedDeveloper::instant()), small_pool());
        assert!(fx.pool.get_available_worker().is_err());
        assert!(fx.pool.assign_worker_task("worker-1", task("T1")).is_err());
    }

    // ── availability and bounds ───────────────────────────────────────────────

    #[test]
    fn available_worker_is_created_lazily_up_to_max() {
        let fx = fixture_with(Arc::new(GatedDeveloper::instant()), small_pool());
        fx.pool.initialize().unwrap();

        let first = fx.pool.get_available_worker().unwrap().unwrap();
        first.assign_task(task("T1")).unwrap();

        // First worker is busy; a second is created because max_workers = 2.
        let second = fx.pool.get_available_worker().unwrap().unwrap();
        assert_ne!(first.id(), second.id());
        second.assign_task(task("T2")).unwrap();

        // Saturated now.
        assert!(fx.pool.get_available_worker().unwrap().is_none());
        assert_eq!(fx.pool.get_pool_status().total, 2);
    }

    #[test]
    fn release_frees_exactly_one_slot() {
        let fx = fixture_with(Arc::new(GatedDeveloper::instant()), small_pool());
        fx.pool.initialize().unwrap();

        let first = fx.pool.get_available_worker().unwrap().unwrap();
        first.assign_task(task("T1")).unwrap();
        let second = fx.pool.get_available_worker().unwrap().unwrap();
        second.assign_task(task("T2")).unwrap();
        assert!(fx.pool.get_available_worker().unwrap().is_none());

        fx.pool.release_worker(first.id()).unwrap();
        let freed = fx.pool.get_available_worker().unwrap().unwrap();
        assert_eq!(freed.id(), first.id());
    }

    #[test]
    fn worker_lookup_by_task_id() {
        let fx = fixture_with(Arc::new(GatedDeveloper::instant()), small_pool());
        fx.pool.initialize().unwrap();

        let worker = fx.pool.get_available_worker().unwrap().unwrap();
        fx.pool.assign_worker_task(worker.id(), task("T1")).unwrap();

        let found = fx.pool.get_worker_by_task_id(&TaskId::new("T1")).unwrap();
        assert_eq!(found.id(), worker.id());
        assert!(fx.pool.get_worker_by_task_id(&TaskId::new("T2")).is_none());
    }

    // ── accounting ────────────────────────────────────────────────────────────

    #[test]
    fn pool_status_counts_add_up() {
        let (dev, gate) = GatedDeveloper::with_gate();
        let fx = fixture_with(Arc::new(dev), small_pool());
        fx.pool.initialize().unwrap();

        let working = fx.pool.get_available_worker().unwrap().unwrap();
        working.assign_task(task("T1")).unwrap();
        working.start_execution().unwrap();

        let idle = fx.pool.get_available_worker().unwrap().unwrap();
        let _ = idle;

        let status = fx.pool.get_pool_status();
        assert_eq!(
            status.idle + status.waiting + status.working + status.stopped + status.error,
            status.total
        );
        assert_eq!(status.working, 1);

        gate.send(()).unwrap();
        working.join_execution();

        let status = fx.pool.get_pool_status();
        assert_eq!(status.working, 0);
        assert_eq!(status.waiting, 1);
        assert_eq!(
            status.idle + status.waiting + status.working + status.stopped + status.error,
            status.total
        );
    }

    // ── recovery ──────────────────────────────────────────────────────────────

    #[test]
    fn error_worker_recovers_after_half_window() {
        let fx = fixture_with(
            Arc::new(GatedDeveloper::failing()),
            PoolConfig {
                recovery_timeout: Duration::from_secs(0),
                ..small_pool()
            },
        );
        fx.pool.initialize().unwrap();

        let worker = fx.pool.get_available_worker().unwrap().unwrap();
        worker.assign_task(task("T1")).unwrap();
        worker.start_execution().unwrap();
        worker.join_execution();
        assert_eq!(worker.status(), WorkerStatus::Error);

        let recovered = fx.pool.recover_error_workers();
        assert_eq!(recovered, 1);
        worker.join_execution();
        // The retry failed again; the worker is in error but was resumed.
        assert_eq!(worker.snapshot().action, Some(WorkerAction::ResumeTask));
    }

    #[test]
    fn recent_error_worker_is_left_alone() {
        let fx = fixture_with(Arc::new(GatedDeveloper::failing()), small_pool());
        fx.pool.initialize().unwrap();

        let worker = fx.pool.get_available_worker().unwrap().unwrap();
        worker.assign_task(task("T1")).unwrap();
        worker.start_execution().unwrap();
        worker.join_execution();

        // Full recovery window (600s) has not elapsed.
        assert_eq!(fx.pool.recover_error_workers(), 0);
        assert_eq!(fx.pool.recover_stopped_workers(), 0);
    }

    // ── idle reaping ──────────────────────────────────────────────────────────

    #[test]
    fn idle_workers_are_reaped_down_to_floor() {
        let fx = fixture_with(
            Arc::new(GatedDeveloper::instant()),
            PoolConfig {
                min_workers: 1,
                max_workers: 4,
                idle_timeout: Duration::from_secs(0),
                min_persistent_workers: 1,
                ..small_pool()
            },
        );
        fx.pool.initialize().unwrap();

        // Grow to three workers.
        let a = fx.pool.get_available_worker().unwrap().unwrap();
        a.assign_task(task("T1")).unwrap();
        let b = fx.pool.get_available_worker().unwrap().unwrap();
        b.assign_task(task("T2")).unwrap();
        let c = fx.pool.get_available_worker().unwrap().unwrap();
        let _ = c;
        a.cancel_execution().unwrap();
        b.cancel_execution().unwrap();
        assert_eq!(fx.pool.get_pool_status().total, 3);

        let reaped = fx.pool.reap_idle_workers();
        assert_eq!(reaped, 2);
        let status = fx.pool.get_pool_status();
        assert_eq!(status.total, 1);
        assert_eq!(fx.state.list_workers().unwrap().len(), 1);
    }

    // ── shutdown ──────────────────────────────────────────────────────────────

    #[test]
    fn shutdown_waits_for_working_then_clears() {
        let (dev, gate) = GatedDeveloper::with_gate();
        let fx = fixture_with(Arc::new(dev), small_pool());
        fx.pool.initialize().unwrap();

        let worker = fx.pool.get_available_worker().unwrap().unwrap();
        worker.assign_task(task("T1")).unwrap();
        worker.start_execution().unwrap();

        // Let the agent finish quickly, then shut down.
        gate.send(()).unwrap();
        fx.pool.shutdown(Duration::from_secs(5));

        assert_eq!(fx.pool.get_pool_status().total, 0);
        assert!(!fx.pool.is_initialized());
        // The bound record survived for the next start.
        let records = fx.state.list_workers().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].current_task, Some(TaskId::new("T1")));
    }

    #[test]
    fn shutdown_force_stops_stuck_workers() {
        let (dev, gate) = GatedDeveloper::with_gate();
        let fx = fixture_with(Arc::new(dev), small_pool());
        fx.pool.initialize().unwrap();

        let worker = fx.pool.get_available_worker().unwrap().unwrap();
        worker.assign_task(task("T1")).unwrap();
        worker.start_execution().unwrap();

        // Grace elapses while the agent hangs.
        fx.pool.shutdown(Duration::from_millis(200));
        assert_eq!(fx.pool.get_pool_status().total, 0);

        let record = fx.state.get_worker(worker.id()).unwrap().unwrap();
        assert_eq!(record.status, WorkerStatus::Stopped);

        gate.send(()).unwrap();
        worker.join_execution();
    }
}
