//! Per-task worker: a small state machine wrapping one workspace and one
//! agent invocation at a time.
//!
//! ```text
//! Idle → Waiting (assign_task) → Working (start_execution)
//! Working → Waiting  agent succeeded and a PR exists; task stays bound
//! Working → Idle     merge completed; workspace cleaned, worker released
//! Working → Error    agent failed; task kept for diagnosis
//! Stopped/Error → Waiting  after the recovery window (recover)
//! any → Stopped (pause)    any → Idle (cancel/cleanup)
//! ```
//!
//! A worker that produced a PR is deliberately not released: follow-up
//! feedback reuses its prepared workspace.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use crate::error::OrchestratorError;
use crate::model::{
    BoardStatus, Task, TaskId, TaskRecord, WorkerAction, WorkerRecord, WorkerResult, WorkerStatus,
};
use crate::parser;
use crate::ports::{DeveloperPort, StatePort};
use crate::prompt::PromptBuilder;
use crate::shutdown::ShutdownSignal;
use crate::workspace::WorkspaceManager;

/// Everything a worker needs to run, shared across the pool.
#[derive(Clone)]
pub struct WorkerDeps {
    pub workspace: Arc<WorkspaceManager>,
    pub developer: Arc<dyn DeveloperPort>,
    pub prompts: Arc<PromptBuilder>,
    pub state: Arc<dyn StatePort>,
    pub shutdown: ShutdownSignal,
}

/// Read-only view of a worker for the router and pool status.
#[derive(Debug, Clone)]
pub struct WorkerSnapshot {
    pub worker_id: String,
    pub status: WorkerStatus,
    pub task_id: Option<TaskId>,
    pub action: Option<WorkerAction>,
    pub pull_request_url: Option<String>,
    pub last_error: Option<String>,
    pub last_active_at: DateTime<Utc>,
}

struct WorkerInner {
    status: WorkerStatus,
    previous_status: Option<WorkerStatus>,
    task: Option<Task>,
    pull_request_url: Option<String>,
    last_result: Option<WorkerResult>,
    last_error: Option<String>,
    last_active_at: DateTime<Utc>,
    workspace_dir: Option<PathBuf>,
    execution: Option<JoinHandle<()>>,
}

pub struct Worker {
    id: String,
    developer_type: String,
    created_at: DateTime<Utc>,
    deps: WorkerDeps,
    inner: Mutex<WorkerInner>,
}

impl Worker {
    pub fn new(id: impl Into<String>, developer_type: impl Into<String>, deps: WorkerDeps) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            developer_type: developer_type.into(),
            created_at: Utc::now(),
            deps,
            inner: Mutex::new(WorkerInner {
                status: WorkerStatus::Idle,
                previous_status: None,
                task: None,
                pull_request_url: None,
                last_result: None,
                last_error: None,
                last_active_at: Utc::now(),
                workspace_dir: None,
                execution: None,
            }),
        })
    }

    /// Rebuild a worker from its persisted record after a restart.
    ///
    /// A record claiming `Working` cannot be true anymore (the process died
    /// with us), so it is normalized to `Error` and left for the recovery
    /// scan. A bound task id is rehydrated from the task record; when that
    /// is gone, the binding is dropped and the worker comes back idle.
    pub fn from_record(record: &WorkerRecord, deps: WorkerDeps) -> Arc<Self> {
        let mut status = record.status;
        if status == WorkerStatus::Working {
            log::warn!(
                "worker {} was working at shutdown; marking for recovery",
                record.worker_id
            );
            status = WorkerStatus::Error;
        }

        let task = record.current_task.as_ref().and_then(|task_id| {
            match deps.state.get_task(task_id) {
                Ok(Some(task_record)) => Some(Task {
                    task_id: task_id.clone(),
                    repository_id: task_record.repository_id.clone(),
                    action: WorkerAction::ResumeTask,
                    board_item: None,
                    pull_request_url: task_record
                        .pull_request_url
                        .clone()
                        .or_else(|| record.pull_request_url.clone()),
                    review_comments: vec![],
                    assigned_at: Utc::now(),
                }),
                _ => {
                    log::warn!(
                        "worker {} referenced unknown task {task_id}; dropping binding",
                        record.worker_id
                    );
                    None
                }
            }
        });
        if task.is_none() && status.is_bound() {
            status = WorkerStatus::Idle;
        }

        Arc::new(Self {
            id: record.worker_id.clone(),
            developer_type: record.developer_type.clone(),
            created_at: record.created_at,
            deps,
            inner: Mutex::new(WorkerInner {
                status,
                previous_status: None,
                pull_request_url: record.pull_request_url.clone(),
                task,
                last_result: None,
                last_error: None,
                last_active_at: record.last_active_at,
                workspace_dir: record.workspace_dir.clone(),
                execution: None,
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        let inner = self.lock();
        WorkerSnapshot {
            worker_id: self.id.clone(),
            status: inner.status,
            task_id: inner.task.as_ref().map(|t| t.task_id.clone()),
            action: inner.task.as_ref().map(|t| t.action),
            pull_request_url: inner.pull_request_url.clone(),
            last_error: inner.last_error.clone(),
            last_active_at: inner.last_active_at,
        }
    }

    pub fn status(&self) -> WorkerStatus {
        self.lock().status
    }

    pub fn record(&self) -> WorkerRecord {
        let inner = self.lock();
        self.record_from(&inner)
    }

    /// Bind `task` to this worker: Idle → Waiting.
    ///
    /// Rejected while `Working`. Re-assignment of a new action for the task
    /// already bound (feedback after a PR) is allowed. On persistence
    /// failure the previous status and binding are restored.
    pub fn assign_task(&self, task: Task) -> Result<()> {
        let mut inner = self.lock();
        if inner.status == WorkerStatus::Working {
            return Err(OrchestratorError::NotAvailable(format!(
                "worker {} is working and cannot take assignments",
                self.id
            ))
            .into());
        }
        if let Some(existing) = &inner.task {
            if existing.task_id != task.task_id {
                return Err(OrchestratorError::ConsistencyMismatch(format!(
                    "worker {} is bound to task {}, refusing task {}",
                    self.id, existing.task_id, task.task_id
                ))
                .into());
            }
        }

        let prev_status = inner.status;
        let prev_task = inner.task.take();
        inner.status = WorkerStatus::Waiting;
        inner.last_error = None;
        inner.last_active_at = Utc::now();
        if task.pull_request_url.is_some() {
            inner.pull_request_url = task.pull_request_url.clone();
        }
        let task_id = task.task_id.clone();
        let action = task.action;
        inner.task = Some(task);

        if let Err(e) = self.persist(&inner) {
            inner.status = prev_status;
            inner.task = prev_task;
            return Err(e.context("persisting worker assignment"));
        }
        log::info!("worker {}: preparing {action} for task {task_id}", self.id);
        Ok(())
    }

    /// Kick off the bound task on a dedicated thread: Waiting → Working.
    pub fn start_execution(self: &Arc<Self>) -> Result<()> {
        let task = {
            let mut inner = self.lock();
            let task = match (&inner.status, &inner.task) {
                (WorkerStatus::Waiting, Some(task)) => task.clone(),
                _ => {
                    return Err(OrchestratorError::NotAvailable(format!(
                        "worker {} has no pending assignment",
                        self.id
                    ))
                    .into())
                }
            };
            inner.status = WorkerStatus::Working;
            inner.last_active_at = Utc::now();
            if let Err(e) = self.persist(&inner) {
                inner.status = WorkerStatus::Waiting;
                return Err(e.context("persisting worker start"));
            }
            task
        };

        let worker = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name(format!("{}-exec", self.id))
            .spawn(move || {
                let outcome = worker.run_task(&task);
                worker.apply_outcome(&task, outcome);
            })
            .context("spawning worker execution thread")?;
        self.lock().execution = Some(handle);
        Ok(())
    }

    /// Workspace preparation, prompt, agent run, parse. Runs on the
    /// execution thread; every failure bubbles as an error.
    fn run_task(&self, task: &Task) -> Result<WorkerResult> {
        if self.deps.shutdown.is_triggered() {
            return Err(OrchestratorError::NotAvailable("shutting down".into()).into());
        }

        let mut ws = self.deps.workspace.create_workspace(
            &task.task_id,
            &task.repository_id,
            task.board_item.as_ref(),
        )?;
        self.deps
            .workspace
            .setup_worktree(&mut ws, task.board_item.as_ref())?;
        if matches!(
            task.action,
            WorkerAction::StartNewTask | WorkerAction::ResumeTask
        ) {
            self.deps.workspace.setup_instruction_file(&mut ws, task)?;
        }
        self.lock().workspace_dir = Some(ws.workspace_dir.clone());

        let progress = self
            .deps
            .state
            .get_task(&task.task_id)?
            .and_then(|record| record.progress);
        let prompt = self.deps.prompts.build(task, &ws, progress.as_deref())?;

        log::info!("worker {}: running agent for task {}", self.id, task.task_id);
        let execution = self.deps.developer.execute(&prompt, &ws.workspace_dir)?;
        let parsed = parser::parse_output(&execution.raw_output);

        Ok(WorkerResult {
            task_id: task.task_id.clone(),
            action: task.action,
            success: parsed.success,
            pull_request_url: parsed
                .pull_request_url
                .or_else(|| task.pull_request_url.clone()),
            commit_hash: parsed.commit_hash,
            modified_files: parsed.modified_files,
            error: (!parsed.success).then(|| "agent output reported failure".to_string()),
            finished_at: Utc::now(),
        })
    }

    /// Fold the execution outcome back into worker state. Results for a
    /// task the worker no longer holds (canceled or reassigned while the
    /// agent ran) are discarded.
    fn apply_outcome(&self, task: &Task, outcome: Result<WorkerResult>) {
        {
            let inner = self.lock();
            let still_bound = inner
                .task
                .as_ref()
                .is_some_and(|t| t.task_id == task.task_id);
            if !still_bound {
                log::warn!(
                    "worker {}: discarding result for released task {}",
                    self.id,
                    task.task_id
                );
                return;
            }
        }

        match outcome {
            Ok(result) if result.success => self.complete(task, result),
            Ok(result) => {
                let message = result
                    .error
                    .clone()
                    .unwrap_or_else(|| "agent reported failure".to_string());
                self.fail(task, message, Some(result));
            }
            Err(e) => self.fail(task, format!("{e:#}"), None),
        }
    }

    fn complete(&self, task: &Task, result: WorkerResult) {
        if task.action == WorkerAction::MergeRequest {
            self.update_task_record(task, |record| {
                record.merged = true;
                record.progress = Some(progress_summary(&result));
            });
            if let Err(e) = self.deps.workspace.cleanup_workspace(&task.task_id) {
                log::warn!("worker {}: cleanup after merge: {e:#}", self.id);
            }
            let mut inner = self.lock();
            inner.last_result = Some(result);
            if inner.status != WorkerStatus::Stopped {
                inner.status = WorkerStatus::Idle;
            }
            inner.task = None;
            inner.pull_request_url = None;
            inner.workspace_dir = None;
            inner.last_active_at = Utc::now();
            if let Err(e) = self.persist(&inner) {
                log::warn!("worker {}: persisting merge completion: {e:#}", self.id);
            }
            log::info!("worker {}: merge for {} completed", self.id, task.task_id);
            return;
        }

        match result.pull_request_url.clone() {
            Some(url) => {
                self.update_task_record(task, |record| {
                    record.pull_request_url = Some(url.clone());
                    record.progress = Some(progress_summary(&result));
                });
                let mut inner = self.lock();
                inner.pull_request_url = Some(url);
                inner.last_result = Some(result);
                // The worker stays bound: feedback rounds reuse this
                // workspace until the merge lands.
                if inner.status != WorkerStatus::Stopped {
                    inner.status = WorkerStatus::Waiting;
                }
                inner.last_active_at = Utc::now();
                if let Err(e) = self.persist(&inner) {
                    log::warn!("worker {}: persisting completion: {e:#}", self.id);
                }
                log::info!(
                    "worker {}: task {} waiting for review",
                    self.id,
                    task.task_id
                );
            }
            None => {
                // A "successful" run that produced no PR left nothing to
                // review or merge; treat it like a failure.
                self.fail(
                    task,
                    "agent completed without reporting a pull request".to_string(),
                    Some(result),
                );
            }
        }
    }

    fn fail(&self, task: &Task, message: String, result: Option<WorkerResult>) {
        log::warn!("worker {}: task {} failed: {message}", self.id, task.task_id);
        self.update_task_record(task, |record| {
            record.progress = Some(format!("last attempt failed: {message}"));
        });

        let mut inner = self.lock();
        inner.last_error = Some(message.clone());
        inner.last_result = Some(result.unwrap_or(WorkerResult {
            task_id: task.task_id.clone(),
            action: task.action,
            success: false,
            pull_request_url: None,
            commit_hash: None,
            modified_files: vec![],
            error: Some(message),
            finished_at: Utc::now(),
        }));
        if inner.status != WorkerStatus::Stopped {
            inner.status = WorkerStatus::Error;
        }
        inner.last_active_at = Utc::now();
        if let Err(e) = self.persist(&inner) {
            log::warn!("worker {}: persisting failure: {e:#}", self.id);
        }
    }

    /// Restart a recoverable worker: Stopped/Error → Waiting → Working.
    ///
    /// The bound task is retried as a resume so the agent picks up from the
    /// existing worktree instead of starting over.
    pub fn recover(self: &Arc<Self>) -> Result<()> {
        {
            let mut inner = self.lock();
            if !inner.status.is_recoverable() {
                return Err(OrchestratorError::NotAvailable(format!(
                    "worker {} is {} and needs no recovery",
                    self.id, inner.status
                ))
                .into());
            }
            let interrupted = inner.previous_status.take();
            match inner.task.clone() {
                Some(mut task) => {
                    if matches!(
                        task.action,
                        WorkerAction::StartNewTask | WorkerAction::ResumeTask
                    ) {
                        task.action = WorkerAction::ResumeTask;
                    }
                    log::debug!(
                        "worker {}: recovering from {} (interrupted while {:?})",
                        self.id,
                        inner.status,
                        interrupted
                    );
                    inner.task = Some(task);
                    inner.status = WorkerStatus::Waiting;
                    inner.last_error = None;
                    inner.last_active_at = Utc::now();
                    self.persist(&inner)?;
                }
                None => {
                    inner.status = WorkerStatus::Idle;
                    inner.previous_status = None;
                    inner.last_error = None;
                    inner.last_active_at = Utc::now();
                    self.persist(&inner)?;
                    return Ok(());
                }
            }
        }
        log::info!("worker {}: recovered, resuming task", self.id);
        self.start_execution()
    }

    /// Any state → Stopped, remembering where we were.
    pub fn pause_execution(&self) -> Result<()> {
        let mut inner = self.lock();
        if inner.status == WorkerStatus::Stopped {
            return Ok(());
        }
        inner.previous_status = Some(inner.status);
        inner.status = WorkerStatus::Stopped;
        inner.last_active_at = Utc::now();
        self.persist(&inner)
    }

    /// Drop the binding and return to Idle, releasing the workspace
    /// best-effort. Safe to call in any state.
    pub fn cancel_execution(&self) -> Result<()> {
        let task_id = self.lock().task.as_ref().map(|t| t.task_id.clone());
        if let Some(task_id) = &task_id {
            if let Err(e) = self.deps.workspace.cleanup_workspace(task_id) {
                log::warn!("worker {}: workspace cleanup: {e:#}", self.id);
            }
        }

        let mut inner = self.lock();
        inner.status = WorkerStatus::Idle;
        inner.previous_status = None;
        inner.task = None;
        inner.pull_request_url = None;
        inner.workspace_dir = None;
        inner.last_active_at = Utc::now();
        if let Err(e) = self.persist(&inner) {
            log::warn!("worker {}: persisting cancel: {e:#}", self.id);
        }
        Ok(())
    }

    /// Block until the current execution thread (if any) finishes.
    pub fn join_execution(&self) {
        let handle = self.lock().execution.take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    pub fn seconds_since_active(&self) -> i64 {
        Utc::now()
            .signed_duration_since(self.lock().last_active_at)
            .num_seconds()
    }

    fn record_from(&self, inner: &WorkerInner) -> WorkerRecord {
        WorkerRecord {
            worker_id: self.id.clone(),
            workspace_dir: inner.workspace_dir.clone(),
            developer_type: self.developer_type.clone(),
            status: inner.status,
            current_task: inner.task.as_ref().map(|t| t.task_id.clone()),
            pull_request_url: inner.pull_request_url.clone(),
            created_at: self.created_at,
            last_active_at: inner.last_active_at,
        }
    }

    fn persist(&self, inner: &WorkerInner) -> Result<()> {
        self.deps.state.put_worker(&self.record_from(inner))
    }

    /// Load-or-create the task record and apply `mutate`. Best-effort: a
    /// state failure is logged, never propagated from the outcome path.
    fn update_task_record(&self, task: &Task, mutate: impl FnOnce(&mut TaskRecord)) {
        let result = (|| -> Result<()> {
            let mut record = self
                .deps
                .state
                .get_task(&task.task_id)?
                .unwrap_or_else(|| {
                    TaskRecord::new(
                        task.task_id.clone(),
                        task.repository_id.clone(),
                        BoardStatus::InProgress,
                    )
                });
            mutate(&mut record);
            record.touch();
            self.deps.state.put_task(&record)
        })();
        if let Err(e) = result {
            log::warn!("worker {}: updating task record: {e:#}", self.id);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WorkerInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn progress_summary(result: &WorkerResult) -> String {
    let mut parts = Vec::new();
    if !result.modified_files.is_empty() {
        parts.push(format!(
            "modified {} file(s): {}",
            result.modified_files.len(),
            result.modified_files.join(", ")
        ));
    }
    if let Some(hash) = &result.commit_hash {
        parts.push(format!("last commit {hash}"));
    }
    if let Some(url) = &result.pull_request_url {
        parts.push(format!("pull request {url}"));
    }
    if parts.is_empty() {
        "agent run completed with no reported artifacts".to_string()
    } else {
        parts.join("; ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gitlock::GitLock;
    use crate::model::{BoardItem, ContentType, ExecutionResult};
    use crate::ports::{GitPort, ProjectBoardPort};
    use crate::repo_cache::RepositoryCache;
    use crate::store::FileStateStore;
    use std::path::Path;
    use std::sync::mpsc::{channel, Receiver, Sender};
    use std::time::Duration;
    use tempfile::TempDir;

    // ── Mock: GitPort (fabricates worktrees on disk) ─────────────────────────

    struct FakeGit;

    impl GitPort for FakeGit {
        fn clone_repository(&self, _url: &str, local_path: &Path, _depth: Option<u32>) -> Result<()> {
            std::fs::create_dir_all(local_path.join(".git"))?;
            Ok(())
        }

        fn fetch(&self, _local_path: &Path) -> Result<()> {
            Ok(())
        }

        fn pull_main_branch(&self, _local_path: &Path) -> Result<()> {
            Ok(())
        }

        fn create_worktree(
            &self,
            _repo_path: &Path,
            _branch: &str,
            worktree_path: &Path,
            _base_branch: Option<&str>,
        ) -> Result<()> {
            std::fs::create_dir_all(worktree_path)?;
            std::fs::write(worktree_path.join(".git"), "gitdir: elsewhere\n")?;
            Ok(())
        }

        fn remove_worktree(&self, _repo_path: &Path, _worktree_path: &Path) -> Result<()> {
            Ok(())
        }

        fn is_valid_repository(&self, path: &Path) -> bool {
            path.join(".git").exists()
        }
    }

    // ── Mock: ProjectBoardPort ────────────────────────────────────────────────

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

    // ── Mock: DeveloperPort ───────────────────────────────────────────────────

    /// Scripted agent: returns canned output, optionally blocking on a gate
    /// until the test releases it.
    struct ScriptedDeveloper {
        output: Mutex<String>,
        fail: bool,
        gate: Mutex<Option<Receiver<()>>>,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedDeveloper {
        fn succeeding(output: &str) -> Self {
            Self {
                output: Mutex::new(output.to_string()),
                fail: false,
                gate: Mutex::new(None),
                prompts: Mutex::new(vec![]),
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::succeeding("")
            }
        }

        fn gated(output: &str) -> (Self, Sender<()>) {
            let (tx, rx) = channel();
            let dev = Self {
                output: Mutex::new(output.to_string()),
                fail: false,
                gate: Mutex::new(Some(rx)),
                prompts: Mutex::new(vec![]),
            };
            (dev, tx)
        }
    }

    impl DeveloperPort for ScriptedDeveloper {
        fn initialize(&self) -> Result<()> {
            Ok(())
        }

        fn execute(&self, prompt: &str, _workspace_dir: &Path) -> Result<ExecutionResult> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            let gate = self.gate.lock().unwrap().take();
            if let Some(rx) = gate {
                let _ = rx.recv_timeout(Duration::from_secs(10));
            }
            if self.fail {
                return Err(OrchestratorError::ExecutionFailed {
                    exit_code: Some(1),
                    stderr: "scripted failure".to_string(),
                }
                .into());
            }
            Ok(ExecutionResult {
                raw_output: self.output.lock().unwrap().clone(),
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

        fn set_timeout(&self, _timeout: Duration) {}
    }

    // ── Helpers ───────────────────────────────────────────────────────────────

    const PR_OUTPUT: &str =
        "Opened https://example.test/acme/svc/pull/7\nTask completed successfully";

    struct Fixture {
        _dir: TempDir,
        deps: WorkerDeps,
        state: Arc<FileStateStore>,
    }

    fn fixture(developer: Arc<dyn DeveloperPort>) -> Fixture {
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
        Fixture {
            _dir: dir,
            deps: WorkerDeps {
                workspace,
                developer,
                prompts: Arc::new(PromptBuilder::new(64_000)),
                state: state.clone(),
                shutdown: ShutdownSignal::new(),
            },
            state,
        }
    }

    fn start_task(id: &str) -> Task {
        Task {
            task_id: TaskId::new(id),
            repository_id: "acme/svc".to_string(),
            action: WorkerAction::StartNewTask,
            board_item: Some(BoardItem {
                id: id.to_string(),
                title: "Fix the parser".to_string(),
                description: "It breaks on empty input.".to_string(),
                status: BoardStatus::Todo,
                labels: vec![],
                pull_request_urls: vec![],
                content_type: Some(ContentType::Issue),
                content_number: Some(42),
                repository: Some("acme/svc".to_string()),
            }),
            pull_request_url: None,
            review_comments: vec![],
            assigned_at: Utc::now(),
        }
    }

    fn merge_task(id: &str) -> Task {
        Task {
            action: WorkerAction::MergeRequest,
            pull_request_url: Some("https://example.test/acme/svc/pull/7".to_string()),
            board_item: None,
            ..start_task(id)
        }
    }

    // ── Assignment ────────────────────────────────────────────────────────────

    #[test]
    fn assign_moves_idle_worker_to_waiting() {
        let fx = fixture(Arc::new(ScriptedDeveloper::succeeding(PR_OUTPUT)));
        let worker = Worker::new("worker-1", "claude", fx.deps.clone());

        worker.assign_task(start_task("T1")).unwrap();

        let snap = worker.snapshot();
        assert_eq!(snap.status, WorkerStatus::Waiting);
        assert_eq!(snap.task_id, Some(TaskId::new("T1")));

        // Persisted too.
        let record = fx.state.get_worker("worker-1").unwrap().unwrap();
        assert_eq!(record.status, WorkerStatus::Waiting);
        assert_eq!(record.current_task, Some(TaskId::new("T1")));
    }

    #[test]
    fn assign_to_working_worker_is_rejected() {
        let (dev, gate) = ScriptedDeveloper::gated(PR_OUTPUT);
        let fx = fixture(Arc::new(dev));
        let worker = Worker::new("worker-1", "claude", fx.deps.clone());

        worker.assign_task(start_task("T1")).unwrap();
        worker.start_execution().unwrap();

        let err = worker.assign_task(start_task("T2")).unwrap_err();
        assert!(matches!(
            crate::error::kind_of(&err),
            Some(OrchestratorError::NotAvailable(_))
        ));

        gate.send(()).unwrap();
        worker.join_execution();
    }

    #[test]
    fn reassigning_same_task_with_new_action_is_allowed() {
        let fx = fixture(Arc::new(ScriptedDeveloper::succeeding(PR_OUTPUT)));
        let worker = Worker::new("worker-1", "claude", fx.deps.clone());
        worker.assign_task(start_task("T1")).unwrap();

        let mut feedback = start_task("T1");
        feedback.action = WorkerAction::ProcessFeedback;
        feedback.pull_request_url = Some("https://example.test/acme/svc/pull/7".to_string());
        worker.assign_task(feedback).unwrap();

        let snap = worker.snapshot();
        assert_eq!(snap.action, Some(WorkerAction::ProcessFeedback));
    }

    #[test]
    fn assigning_a_different_task_is_rejected() {
        let fx = fixture(Arc::new(ScriptedDeveloper::succeeding(PR_OUTPUT)));
        let worker = Worker::new("worker-1", "claude", fx.deps.clone());
        worker.assign_task(start_task("T1")).unwrap();

        let err = worker.assign_task(start_task("T2")).unwrap_err();
        assert!(matches!(
            crate::error::kind_of(&err),
            Some(OrchestratorError::ConsistencyMismatch(_))
        ));
    }

    // ── Execution outcomes ────────────────────────────────────────────────────

    #[test]
    fn successful_run_with_pr_keeps_worker_bound_and_waiting() {
        let fx = fixture(Arc::new(ScriptedDeveloper::succeeding(PR_OUTPUT)));
        let worker = Worker::new("worker-1", "claude", fx.deps.clone());
        worker.assign_task(start_task("T1")).unwrap();
        worker.start_execution().unwrap();
        worker.join_execution();

        let snap = worker.snapshot();
        assert_eq!(snap.status, WorkerStatus::Waiting);
        assert_eq!(snap.task_id, Some(TaskId::new("T1")));
        assert_eq!(
            snap.pull_request_url.as_deref(),
            Some("https://example.test/acme/svc/pull/7")
        );

        let record = fx.state.get_task(&TaskId::new("T1")).unwrap().unwrap();
        assert_eq!(
            record.pull_request_url.as_deref(),
            Some("https://example.test/acme/svc/pull/7")
        );
        assert!(record.progress.is_some());
    }

    #[test]
    fn merge_success_releases_worker_and_cleans_workspace() {
        let fx = fixture(Arc::new(ScriptedDeveloper::succeeding(
            "Merged. Merge commit 0123456789abcdef0123456789abcdef01234567\ndone",
        )));
        let worker = Worker::new("worker-1", "claude", fx.deps.clone());
        worker.assign_task(merge_task("T1")).unwrap();
        worker.start_execution().unwrap();
        worker.join_execution();

        let snap = worker.snapshot();
        assert_eq!(snap.status, WorkerStatus::Idle);
        assert_eq!(snap.task_id, None);
        assert_eq!(snap.pull_request_url, None);

        let record = fx.state.get_task(&TaskId::new("T1")).unwrap().unwrap();
        assert!(record.merged);
        // Workspace record is gone.
        assert!(fx.state.get_workspace(&TaskId::new("T1")).unwrap().is_none());
    }

    #[test]
    fn failed_run_moves_worker_to_error_and_keeps_task() {
        let fx = fixture(Arc::new(ScriptedDeveloper::failing()));
        let worker = Worker::new("worker-1", "claude", fx.deps.clone());
        worker.assign_task(start_task("T1")).unwrap();
        worker.start_execution().unwrap();
        worker.join_execution();

        let snap = worker.snapshot();
        assert_eq!(snap.status, WorkerStatus::Error);
        assert_eq!(snap.task_id, Some(TaskId::new("T1")));
        assert!(snap.last_error.is_some());
    }

    #[test]
    fn success_without_pr_is_treated_as_failure() {
        let fx = fixture(Arc::new(ScriptedDeveloper::succeeding(
            "All done, looks great",
        )));
        let worker = Worker::new("worker-1", "claude", fx.deps.clone());
        worker.assign_task(start_task("T1")).unwrap();
        worker.start_execution().unwrap();
        worker.join_execution();

        let snap = worker.snapshot();
        assert_eq!(snap.status, WorkerStatus::Error);
        assert!(snap
            .last_error
            .as_deref()
            .unwrap()
            .contains("without reporting a pull request"));
    }

    #[test]
    fn resume_prompt_carries_recorded_progress() {
        let dev = Arc::new(ScriptedDeveloper::succeeding(PR_OUTPUT));
        let fx = fixture(dev.clone());

        // Seed a task record with progress from a previous attempt.
        let mut record = TaskRecord::new(TaskId::new("T1"), "acme/svc", BoardStatus::InProgress);
        record.progress = Some("half the parser is rewritten".to_string());
        fx.state.put_task(&record).unwrap();

        let worker = Worker::new("worker-1", "claude", fx.deps.clone());
        let mut task = start_task("T1");
        task.action = WorkerAction::ResumeTask;
        worker.assign_task(task).unwrap();
        worker.start_execution().unwrap();
        worker.join_execution();

        let prompts = dev.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("half the parser is rewritten"));
    }

    // ── Recovery, pause, cancel ───────────────────────────────────────────────

    #[test]
    fn recover_from_error_resumes_the_task() {
        let fx = fixture(Arc::new(ScriptedDeveloper::failing()));
        let worker = Worker::new("worker-1", "claude", fx.deps.clone());
        worker.assign_task(start_task("T1")).unwrap();
        worker.start_execution().unwrap();
        worker.join_execution();
        assert_eq!(worker.status(), WorkerStatus::Error);

        worker.recover().unwrap();
        worker.join_execution();

        // Second run failed again, but it ran as a resume.
        let snap = worker.snapshot();
        assert_eq!(snap.status, WorkerStatus::Error);
        assert_eq!(snap.action, Some(WorkerAction::ResumeTask));
    }

    #[test]
    fn recover_without_task_returns_to_idle() {
        let fx = fixture(Arc::new(ScriptedDeveloper::succeeding(PR_OUTPUT)));
        let worker = Worker::new("worker-1", "claude", fx.deps.clone());
        worker.pause_execution().unwrap();
        assert_eq!(worker.status(), WorkerStatus::Stopped);

        worker.recover().unwrap();
        assert_eq!(worker.status(), WorkerStatus::Idle);
    }

    #[test]
    fn recover_on_healthy_worker_is_rejected() {
        let fx = fixture(Arc::new(ScriptedDeveloper::succeeding(PR_OUTPUT)));
        let worker = Worker::new("worker-1", "claude", fx.deps.clone());
        assert!(worker.recover().is_err());
    }

    #[test]
    fn cancel_releases_binding_and_workspace() {
        let fx = fixture(Arc::new(ScriptedDeveloper::succeeding(PR_OUTPUT)));
        let worker = Worker::new("worker-1", "claude", fx.deps.clone());
        worker.assign_task(start_task("T1")).unwrap();
        worker.start_execution().unwrap();
        worker.join_execution();
        assert_eq!(worker.status(), WorkerStatus::Waiting);

        worker.cancel_execution().unwrap();
        let snap = worker.snapshot();
        assert_eq!(snap.status, WorkerStatus::Idle);
        assert_eq!(snap.task_id, None);
        assert!(fx.state.get_workspace(&TaskId::new("T1")).unwrap().is_none());
    }

    #[test]
    fn result_for_canceled_task_is_discarded() {
        let (dev, gate) = ScriptedDeveloper::gated(PR_OUTPUT);
        let fx = fixture(Arc::new(dev));
        let worker = Worker::new("worker-1", "claude", fx.deps.clone());
        worker.assign_task(start_task("T1")).unwrap();
        worker.start_execution().unwrap();

        worker.cancel_execution().unwrap();
        gate.send(()).unwrap();
        worker.join_execution();

        // The late result must not resurrect the released binding.
        let snap = worker.snapshot();
        assert_eq!(snap.status, WorkerStatus::Idle);
        assert_eq!(snap.task_id, None);
    }

    // ── Restart restore ───────────────────────────────────────────────────────

    #[test]
    fn from_record_normalizes_working_to_error() {
        let fx = fixture(Arc::new(ScriptedDeveloper::succeeding(PR_OUTPUT)));
        fx.state
            .put_task(&TaskRecord::new(
                TaskId::new("T1"),
                "acme/svc",
                BoardStatus::InProgress,
            ))
            .unwrap();

        let record = WorkerRecord {
            worker_id: "worker-9".to_string(),
            workspace_dir: None,
            developer_type: "claude".to_string(),
            status: WorkerStatus::Working,
            current_task: Some(TaskId::new("T1")),
            pull_request_url: None,
            created_at: Utc::now(),
            last_active_at: Utc::now(),
        };
        let worker = Worker::from_record(&record, fx.deps.clone());

        let snap = worker.snapshot();
        assert_eq!(snap.status, WorkerStatus::Error);
        assert_eq!(snap.task_id, Some(TaskId::new("T1")));
        assert_eq!(snap.action, Some(WorkerAction::ResumeTask));
    }

    #[test]
    fn from_record_drops_binding_for_unknown_task() {
        let fx = fixture(Arc::new(ScriptedDeveloper::succeeding(PR_OUTPUT)));
        let record = WorkerRecord {
            worker_id: "worker-9".to_string(),
            workspace_dir: None,
            developer_type: "claude".to_string(),
            status: WorkerStatus::Waiting,
            current_task: Some(TaskId::new("ghost")),
            pull_request_url: None,
            created_at: Utc::now(),
            last_active_at: Utc::now(),
        };
        let worker = Worker::from_record(&record, fx.deps.clone());

        let snap = worker.snapshot();
        assert_eq!(snap.status, WorkerStatus::Idle);
        assert_eq!(snap.task_id, None);
    }
}
