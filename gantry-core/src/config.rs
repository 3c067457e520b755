//! Runtime configuration for the orchestrator.
//!
//! Resolution order: **env var > `<state_dir>/config` file > hardcoded default**.
//!
//! ```text
//! Field                      Env Var                          Config Key                  Default
//! ────────────────────────── ──────────────────────────────── ─────────────────────────── ────────
//! board_id                   GANTRY_BOARD_ID                  board_id                    (required)
//! repositories               GANTRY_REPOSITORIES              repositories                (empty; comma-separated)
//! workspace_root             GANTRY_WORKSPACE_ROOT            workspace_root              <state_dir>/workspaces
//! developer_command          GANTRY_DEVELOPER_COMMAND         developer_command           claude --print --dangerously-skip-permissions
//! developer_type             GANTRY_DEVELOPER_TYPE            developer_type              claude
//! developer_timeout          GANTRY_DEVELOPER_TIMEOUT         developer_timeout           1800s
//! git_operation_timeout      GANTRY_GIT_TIMEOUT               git_operation_timeout       300s
//! monitoring_interval        GANTRY_MONITORING_INTERVAL       monitoring_interval         120s
//! planner_timeout            GANTRY_PLANNER_TIMEOUT           planner_timeout             600s
//! shutdown_grace_period      GANTRY_SHUTDOWN_GRACE            shutdown_grace_period       30s
//! worker_recovery_timeout    GANTRY_WORKER_RECOVERY_TIMEOUT   worker_recovery_timeout     600s
//! idle_timeout_minutes       GANTRY_IDLE_TIMEOUT_MINUTES      idle_timeout_minutes        30
//! min_persistent_workers     GANTRY_MIN_PERSISTENT_WORKERS    min_persistent_workers      1
//! min_workers                GANTRY_MIN_WORKERS               min_workers                 1
//! max_workers                GANTRY_MAX_WORKERS               max_workers                 3
//! clone_depth                GANTRY_CLONE_DEPTH               clone_depth                 50 (0 = full clone)
//! repository_cache_timeout   GANTRY_REPO_CACHE_TIMEOUT        repository_cache_timeout    600s
//! max_context_length         GANTRY_MAX_CONTEXT_LENGTH        max_context_length          32000
//! max_retry_attempts         GANTRY_MAX_RETRY_ATTEMPTS        max_retry_attempts          3
//! state_max_age_days         GANTRY_STATE_MAX_AGE_DAYS        state_max_age_days          7
//! remote_url_template        GANTRY_REMOTE_URL_TEMPLATE       remote_url_template         https://github.com/{repository}.git
//! state_dir                  GANTRY_DIR                       —                           ~/.gantry
//! ```
//!
//! All durations are given in whole seconds.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;

pub const DEFAULT_DEVELOPER_COMMAND: &str = "claude --print --dangerously-skip-permissions";
pub const DEFAULT_REMOTE_URL_TEMPLATE: &str = "https://github.com/{repository}.git";

/// Immutable value object holding every tunable of the orchestrator.
#[derive(Debug, Clone)]
pub struct GantryConfig {
    /// Base directory for durable state (`~/.gantry` by default).
    pub state_dir: PathBuf,
    /// Root directory under which per-task workspaces are created.
    pub workspace_root: PathBuf,
    /// Identifier of the project board to poll.
    pub board_id: String,
    /// Repository allow-list in `owner/repo` form. Items from repositories
    /// not listed here are skipped. Empty means allow everything.
    pub repositories: Vec<String>,
    /// Agent CLI invocation, whitespace-split into argv.
    pub developer_command: Vec<String>,
    pub developer_type: String,
    pub developer_timeout: Duration,
    pub git_operation_timeout: Duration,
    /// Sleep between planner reconciliation cycles.
    pub monitoring_interval: Duration,
    /// Deadline for one planner cycle; phases past it are abandoned.
    pub planner_timeout: Duration,
    /// How long shutdown waits for working workers before force-stopping.
    pub shutdown_grace_period: Duration,
    /// Base recovery window. Error workers recover after half of it,
    /// stopped workers after the full window.
    pub worker_recovery_timeout: Duration,
    pub idle_timeout_minutes: u64,
    /// Idle workers are never reaped below this floor.
    pub min_persistent_workers: usize,
    pub min_workers: usize,
    pub max_workers: usize,
    /// Shallow-clone depth; `None` clones full history.
    pub clone_depth: Option<u32>,
    /// A cached repository older than this is re-fetched before use.
    pub repository_cache_timeout: Duration,
    /// Prompt budget in bytes; larger prompts spill sections to files.
    pub max_context_length: usize,
    /// Planner gives up on a task after this many failed cycles.
    pub max_retry_attempts: u32,
    /// Terminal records older than this are pruned at startup.
    pub state_max_age_days: u64,
    /// Clone-URL template; `{repository}` expands to `owner/repo`.
    pub remote_url_template: String,
    /// Run exactly one reconciliation cycle and exit (CLI `--once` flag).
    pub once: bool,
}

impl GantryConfig {
    /// Load config from env vars, `<state_dir>/config`, and defaults.
    pub fn load(state_dir: &Path) -> Result<Self> {
        Self::load_with_env(state_dir, |key| env::var(key).ok())
    }

    fn load_with_env(state_dir: &Path, get_env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = Self::defaults(state_dir);

        let config_file = state_dir.join("config");
        if config_file.exists() {
            let content = fs::read_to_string(&config_file)?;
            for line in content.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if let Some((key, value)) = line.split_once('=') {
                    cfg.apply_entry(key.trim(), value.trim());
                }
            }
        }

        cfg.apply_env_overrides(get_env);
        cfg.validate()?;
        Ok(cfg)
    }

    /// Built-in defaults rooted at `state_dir`.
    pub fn defaults(state_dir: &Path) -> Self {
        Self {
            state_dir: state_dir.to_path_buf(),
            workspace_root: state_dir.join("workspaces"),
            board_id: String::new(),
            repositories: Vec::new(),
            developer_command: split_command(DEFAULT_DEVELOPER_COMMAND),
            developer_type: "claude".to_string(),
            developer_timeout: Duration::from_secs(1800),
            git_operation_timeout: Duration::from_secs(300),
            monitoring_interval: Duration::from_secs(120),
            planner_timeout: Duration::from_secs(600),
            shutdown_grace_period: Duration::from_secs(30),
            worker_recovery_timeout: Duration::from_secs(600),
            idle_timeout_minutes: 30,
            min_persistent_workers: 1,
            min_workers: 1,
            max_workers: 3,
            clone_depth: Some(50),
            repository_cache_timeout: Duration::from_secs(600),
            max_context_length: 32_000,
            max_retry_attempts: 3,
            state_max_age_days: 7,
            remote_url_template: DEFAULT_REMOTE_URL_TEMPLATE.to_string(),
            once: false,
        }
    }

    /// Default state directory: `$GANTRY_DIR`, else `~/.gantry`.
    pub fn default_state_dir() -> PathBuf {
        if let Ok(dir) = env::var("GANTRY_DIR") {
            if !dir.is_empty() {
                return PathBuf::from(dir);
            }
        }
        let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".gantry")
    }

    /// The first allow-listed repository, used when neither the board item
    /// nor a PR URL names one.
    pub fn default_repository(&self) -> Option<&str> {
        self.repositories.first().map(String::as_str)
    }

    pub fn repository_allowed(&self, repository_id: &str) -> bool {
        self.repositories.is_empty() || self.repositories.iter().any(|r| r == repository_id)
    }

    fn apply_entry(&mut self, key: &str, value: &str) {
        match key {
            "board_id" => self.board_id = value.to_string(),
            "repositories" => self.repositories = split_list(value),
            "workspace_root" => self.workspace_root = PathBuf::from(value),
            "developer_command" => self.developer_command = split_command(value),
            "developer_type" => self.developer_type = value.to_string(),
            "developer_timeout" => apply_secs(&mut self.developer_timeout, value),
            "git_operation_timeout" => apply_secs(&mut self.git_operation_timeout, value),
            "monitoring_interval" => apply_secs(&mut self.monitoring_interval, value),
            "planner_timeout" => apply_secs(&mut self.planner_timeout, value),
            "shutdown_grace_period" => apply_secs(&mut self.shutdown_grace_period, value),
            "worker_recovery_timeout" => apply_secs(&mut self.worker_recovery_timeout, value),
            "idle_timeout_minutes" => apply_parse(&mut self.idle_timeout_minutes, value),
            "min_persistent_workers" => apply_parse(&mut self.min_persistent_workers, value),
            "min_workers" => apply_parse(&mut self.min_workers, value),
            "max_workers" => apply_parse(&mut self.max_workers, value),
            "clone_depth" => {
                if let Ok(depth) = value.parse::<u32>() {
                    self.clone_depth = if depth == 0 { None } else { Some(depth) };
                }
            }
            "repository_cache_timeout" => apply_secs(&mut self.repository_cache_timeout, value),
            "max_context_length" => apply_parse(&mut self.max_context_length, value),
            "max_retry_attempts" => apply_parse(&mut self.max_retry_attempts, value),
            "state_max_age_days" => apply_parse(&mut self.state_max_age_days, value),
            "remote_url_template" => self.remote_url_template = value.to_string(),
            _ => {}
        }
    }

    fn apply_env_overrides(&mut self, get_env: impl Fn(&str) -> Option<String>) {
        let pairs: &[(&str, &str)] = &[
            ("GANTRY_BOARD_ID", "board_id"),
            ("GANTRY_REPOSITORIES", "repositories"),
            ("GANTRY_WORKSPACE_ROOT", "workspace_root"),
            ("GANTRY_DEVELOPER_COMMAND", "developer_command"),
            ("GANTRY_DEVELOPER_TYPE", "developer_type"),
            ("GANTRY_DEVELOPER_TIMEOUT", "developer_timeout"),
            ("GANTRY_GIT_TIMEOUT", "git_operation_timeout"),
            ("GANTRY_MONITORING_INTERVAL", "monitoring_interval"),
            ("GANTRY_PLANNER_TIMEOUT", "planner_timeout"),
            ("GANTRY_SHUTDOWN_GRACE", "shutdown_grace_period"),
            ("GANTRY_WORKER_RECOVERY_TIMEOUT", "worker_recovery_timeout"),
            ("GANTRY_IDLE_TIMEOUT_MINUTES", "idle_timeout_minutes"),
            ("GANTRY_MIN_PERSISTENT_WORKERS", "min_persistent_workers"),
            ("GANTRY_MIN_WORKERS", "min_workers"),
            ("GANTRY_MAX_WORKERS", "max_workers"),
            ("GANTRY_CLONE_DEPTH", "clone_depth"),
            ("GANTRY_REPO_CACHE_TIMEOUT", "repository_cache_timeout"),
            ("GANTRY_MAX_CONTEXT_LENGTH", "max_context_length"),
            ("GANTRY_MAX_RETRY_ATTEMPTS", "max_retry_attempts"),
            ("GANTRY_STATE_MAX_AGE_DAYS", "state_max_age_days"),
            ("GANTRY_REMOTE_URL_TEMPLATE", "remote_url_template"),
        ];
        for (env_key, entry_key) in pairs {
            if let Some(value) = get_env(env_key) {
                if !value.is_empty() {
                    self.apply_entry(entry_key, &value);
                }
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.min_workers == 0 {
            anyhow::bail!("min_workers must be at least 1");
        }
        if self.max_workers < self.min_workers {
            anyhow::bail!(
                "max_workers ({}) must be >= min_workers ({})",
                self.max_workers,
                self.min_workers
            );
        }
        if self.developer_command.is_empty() {
            anyhow::bail!("developer_command must not be empty");
        }
        Ok(())
    }

    /// Clone URL for a repository per the configured template.
    pub fn remote_url(&self, repository_id: &str) -> String {
        self.remote_url_template.replace("{repository}", repository_id)
    }
}

fn split_command(value: &str) -> Vec<String> {
    value.split_whitespace().map(str::to_string).collect()
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn apply_secs(target: &mut Duration, value: &str) {
    if let Ok(secs) = value.parse::<u64>() {
        *target = Duration::from_secs(secs);
    }
}

fn apply_parse<T: std::str::FromStr>(target: &mut T, value: &str) {
    if let Ok(parsed) = value.parse::<T>() {
        *target = parsed;
    }
}
