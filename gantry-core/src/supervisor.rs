//! Lifecycle owner: wires the component graph, runs the planner loop, and
//! tears everything down in order.
//!
//! Startup order: state → git lock → repository cache → workspace manager
//! → worker pool → planner. Teardown: planner first, then the pool, then
//! agent process cleanup. Termination signals call `stop()` exactly once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;

use crate::config::GantryConfig;
use crate::error::OrchestratorError;
use crate::gitlock::GitLock;
use crate::planner::{CycleReport, Planner, PlannerConfig, PlannerStatus};
use crate::pool::{PoolConfig, PoolStatus, WorkerPool};
use crate::ports::{DeveloperPort, GitPort, ProjectBoardPort, PullRequestPort, StatePort};
use crate::prompt::PromptBuilder;
use crate::repo_cache::RepositoryCache;
use crate::router::{TaskRequest, TaskRequestHandler, TaskResponse, TaskRouter};
use crate::shutdown::ShutdownSignal;
use crate::worker::WorkerDeps;
use crate::workspace::WorkspaceManager;

/// The five ports injected at construction.
pub struct SupervisorPorts {
    pub board: Arc<dyn ProjectBoardPort>,
    pub pull_requests: Arc<dyn PullRequestPort>,
    pub git: Arc<dyn GitPort>,
    pub developer: Arc<dyn DeveloperPort>,
    pub state: Arc<dyn StatePort>,
}

#[derive(Debug, Clone)]
pub struct SystemStatus {
    pub is_running: bool,
    pub planner: PlannerStatus,
    pub pool: PoolStatus,
}

pub struct Supervisor {
    config: GantryConfig,
    developer: Arc<dyn DeveloperPort>,
    state: Arc<dyn StatePort>,
    pool: Arc<WorkerPool>,
    router: Arc<TaskRouter>,
    planner: Arc<Planner>,
    shutdown: ShutdownSignal,
    initialized: AtomicBool,
    running: AtomicBool,
    stopped: AtomicBool,
    planner_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(config: GantryConfig, ports: SupervisorPorts) -> Arc<Self> {
        let locks = Arc::new(GitLock::new());
        let repo_cache = Arc::new(RepositoryCache::new(
            config.state_dir.join("repos"),
            ports.git.clone(),
            locks.clone(),
            config.clone_depth,
            config.repository_cache_timeout,
            config.remote_url_template.clone(),
        ));
        let workspace = Arc::new(WorkspaceManager::new(
            config.workspace_root.clone(),
            repo_cache,
            ports.git.clone(),
            locks,
            ports.board.clone(),
            ports.state.clone(),
        ));
        let shutdown = ShutdownSignal::new();
        let deps = WorkerDeps {
            workspace,
            developer: ports.developer.clone(),
            prompts: Arc::new(PromptBuilder::new(config.max_context_length)),
            state: ports.state.clone(),
            shutdown: shutdown.clone(),
        };
        let pool = Arc::new(WorkerPool::new(PoolConfig::from_config(&config), deps));
        let router = Arc::new(TaskRouter::new(
            pool.clone(),
            ports.state.clone(),
            config.default_repository().map(str::to_string),
        ));
        let planner = Arc::new(Planner::new(
            ports.board,
            ports.pull_requests,
            ports.state.clone(),
            router.clone(),
            pool.clone(),
            PlannerConfig::from_config(&config),
        ));

        Arc::new(Self {
            config,
            developer: ports.developer,
            state: ports.state,
            pool,
            router,
            planner,
            shutdown,
            initialized: AtomicBool::new(false),
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            planner_thread: Mutex::new(None),
        })
    }

    /// Validate configuration, probe the agent, restore the pool, load
    /// planner state, and prune stale records. Fatal on failure.
    pub fn initialize(&self) -> Result<()> {
        if self.config.board_id.is_empty() {
            return Err(OrchestratorError::InitializationFailed(
                "board_id is not configured".to_string(),
            )
            .into());
        }
        for dir in [&self.config.state_dir, &self.config.workspace_root] {
            std::fs::create_dir_all(dir).map_err(|e| {
                OrchestratorError::InitializationFailed(format!(
                    "cannot create {}: {e}",
                    dir.display()
                ))
            })?;
        }

        self.developer
            .initialize()
            .context("initializing developer runner")?;
        self.pool.initialize().context("initializing worker pool")?;
        self.planner
            .initialize()
            .context("loading planner state")?;
        self.prune_stale_records();

        self.initialized.store(true, Ordering::SeqCst);
        log::info!("supervisor initialized (board {})", self.config.board_id);
        Ok(())
    }

    /// Spawn the planner loop and install termination-signal handlers.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(
                OrchestratorError::NotAvailable("supervisor not initialized".into()).into(),
            );
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.install_signal_handlers()?;
        let planner = self.planner.clone();
        let shutdown = self.shutdown.clone();
        let handle = std::thread::Builder::new()
            .name("planner".to_string())
            .spawn(move || planner.run_loop(&shutdown))
            .context("spawning planner thread")?;
        *self.planner_thread.lock().expect("planner thread slot poisoned") = Some(handle);
        log::info!("supervisor started");
        Ok(())
    }

    /// Graceful stop, exactly once: planner first, then the pool with its
    /// grace period, then agent process cleanup. Errors during teardown
    /// are logged and teardown continues.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("supervisor stopping");
        self.shutdown.trigger();

        let handle = self.planner_thread.lock().expect("planner thread slot poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }

        self.pool.shutdown(self.config.shutdown_grace_period);

        if let Err(e) = self.developer.cleanup() {
            log::warn!("developer cleanup: {e:#}");
        }

        self.running.store(false, Ordering::SeqCst);
        log::info!("supervisor stopped");
    }

    /// Block until a stop completes (used by the CLI after `start`).
    pub fn wait(&self) {
        let rx = self.shutdown.subscribe();
        let _ = rx.recv();
        while self.running.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    /// Run one reconciliation cycle without starting the loop.
    pub fn run_once(&self) -> Result<CycleReport> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(
                OrchestratorError::NotAvailable("supervisor not initialized".into()).into(),
            );
        }
        let report = self.planner.force_sync()?;
        Ok(report)
    }

    pub fn force_sync(&self) -> Result<CycleReport> {
        self.run_once()
    }

    pub fn handle_task_request(&self, request: TaskRequest) -> TaskResponse {
        if !self.initialized.load(Ordering::SeqCst) {
            return TaskResponse::error("supervisor not initialized", None);
        }
        self.router.handle(request)
    }

    pub fn status(&self) -> SystemStatus {
        SystemStatus {
            is_running: self.running.load(Ordering::SeqCst),
            planner: self.planner.status(),
            pool: self.pool.get_pool_status(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Drop terminal task and workspace records older than the configured
    /// age so the state dir does not grow forever.
    fn prune_stale_records(&self) {
        let max_age = chrono::Duration::days(self.config.state_max_age_days as i64);
        let cutoff = Utc::now() - max_age;

        let tasks = match self.state.list_tasks() {
            Ok(tasks) => tasks,
            Err(e) => {
                log::warn!("listing tasks for pruning: {e:#}");
                return;
            }
        };
        let mut pruned = 0;
        for record in tasks {
            let terminal = record.merged
                || record.failed
                || record.board_status == crate::model::BoardStatus::Done;
            if terminal && record.updated_at < cutoff {
                if let Err(e) = self.state.delete_task(&record.task_id) {
                    log::warn!("pruning task {}: {e:#}", record.task_id);
                    continue;
                }
                let _ = self.state.delete_workspace(&record.task_id);
                pruned += 1;
            }
        }
        if pruned > 0 {
            log::info!("pruned {pruned} stale task record(s)");
        }
    }

    #[cfg(unix)]
    fn install_signal_handlers(self: &Arc<Self>) -> Result<()> {
        use signal_hook::consts::{SIGINT, SIGTERM};
        use signal_hook::iterator::Signals;

        let mut signals =
            Signals::new([SIGINT, SIGTERM]).context("installing signal handlers")?;
        let supervisor = Arc::downgrade(self);
        std::thread::Builder::new()
            .name("signals".to_string())
            .spawn(move || {
                if let Some(signal) = signals.forever().next() {
                    log::info!("received signal {signal}, shutting down");
                    if let Some(supervisor) = supervisor.upgrade() {
                        supervisor.stop();
                    }
                }
            })
            .context("spawning signal thread")?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn install_signal_handlers(self: &Arc<Self>) -> Result<()> {
        Ok(())
    }
}
