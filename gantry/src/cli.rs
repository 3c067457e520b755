//! Command-line surface wrapping the supervisor.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use gantry_core::config::GantryConfig;
use gantry_core::git_cli::GitCli;
use gantry_core::model::{PlannerState, TaskRecord, WorkerRecord};
use gantry_core::ports::{DeveloperPort, StatePort};
use gantry_core::runner::DeveloperRunner;
use gantry_core::store::FileStateStore;
use gantry_core::supervisor::{Supervisor, SupervisorPorts};

use crate::github::{auth_ok, GhIssueBoard, GhPullRequests};

#[derive(Parser)]
#[command(
    name = "gantry",
    version,
    about = "Autonomous development orchestrator",
    long_about = "gantry polls a project board for work items, hands each one to a coding \
                  agent in an isolated git worktree, opens a pull request, processes review \
                  feedback, and merges on approval."
)]
pub struct Cli {
    /// State directory (default: $GANTRY_DIR or ~/.gantry)
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the orchestrator until a termination signal arrives
    Run {
        /// Run one reconciliation cycle and exit
        #[arg(long)]
        once: bool,
    },

    /// Run one reconciliation cycle synchronously and report it
    Sync,

    /// Show persisted workers, tasks, and planner state
    Status,

    /// Verify the environment: git, the agent CLI, and provider auth
    Check,
}

/// Entry point; returns the process exit code.
pub fn run() -> Result<u8> {
    let cli = Cli::parse();
    let state_dir = cli
        .state_dir
        .clone()
        .unwrap_or_else(GantryConfig::default_state_dir);

    match cli.command {
        Commands::Run { once } => run_orchestrator(&state_dir, once),
        Commands::Sync => run_orchestrator(&state_dir, true),
        Commands::Status => print_status(&state_dir),
        Commands::Check => run_check(&state_dir),
    }
}

fn build_supervisor(state_dir: &PathBuf, once: bool) -> Result<Arc<Supervisor>> {
    let mut config = GantryConfig::load(state_dir)
        .with_context(|| format!("loading config from {}", state_dir.display()))?;
    config.once = once;

    let state = Arc::new(FileStateStore::new(state_dir));
    let git = Arc::new(GitCli::new(config.git_operation_timeout));
    let developer = Arc::new(DeveloperRunner::new(
        config.developer_command.clone(),
        config.developer_timeout,
        credential_env(&config),
    ));

    Ok(Supervisor::new(
        config,
        SupervisorPorts {
            board: GhIssueBoard::new(),
            pull_requests: GhPullRequests::new(),
            git,
            developer,
            state,
        },
    ))
}

/// Extra environment for agent subprocesses. The inherited environment is
/// always kept; this only adds a token read from `<state_dir>/token` when
/// the variable is not already set.
fn credential_env(config: &GantryConfig) -> Vec<(String, String)> {
    let token_file = config.state_dir.join("token");
    if std::env::var("CLAUDE_CODE_OAUTH_TOKEN").is_ok() {
        return vec![];
    }
    match fs::read_to_string(&token_file) {
        Ok(token) if !token.trim().is_empty() => vec![(
            "CLAUDE_CODE_OAUTH_TOKEN".to_string(),
            token.trim().to_string(),
        )],
        _ => vec![],
    }
}

fn run_orchestrator(state_dir: &PathBuf, once: bool) -> Result<u8> {
    let supervisor = build_supervisor(state_dir, once)?;

    if let Err(e) = supervisor.initialize() {
        eprintln!("Initialization failed: {e:#}");
        return Ok(1);
    }

    if once {
        let report = supervisor.run_once()?;
        println!(
            "Cycle complete: {} started, {} checked, {} review action(s), {} completed{}",
            report.started_tasks,
            report.status_checks,
            report.review_actions,
            report.completed_tasks,
            if report.abandoned { " (abandoned at deadline)" } else { "" },
        );
        supervisor.stop();
        return Ok(0);
    }

    supervisor.start()?;
    println!("gantry running; send SIGINT or SIGTERM to stop.");
    supervisor.wait();
    Ok(0)
}

fn print_status(state_dir: &PathBuf) -> Result<u8> {
    let state = FileStateStore::new(state_dir);

    let workers: Vec<WorkerRecord> = state.list_workers()?;
    println!("Workers ({}):", workers.len());
    println!("  {:<12}  {:<8}  {:<24}  LAST ACTIVE", "ID", "STATUS", "TASK");
    for worker in &workers {
        println!(
            "  {:<12}  {:<8}  {:<24}  {}",
            worker.worker_id,
            worker.status,
            worker
                .current_task
                .as_ref()
                .map(|t| t.to_string())
                .unwrap_or_else(|| "-".to_string()),
            worker.last_active_at.format("%Y-%m-%d %H:%M:%S"),
        );
    }

    let tasks: Vec<TaskRecord> = state.list_tasks()?;
    println!("\nTasks ({}):", tasks.len());
    println!("  {:<24}  {:<12}  {:<8}  PR", "ID", "STATUS", "RETRIES");
    for task in &tasks {
        let status = if task.merged {
            "merged".to_string()
        } else if task.failed {
            "failed".to_string()
        } else {
            task.board_status.to_string()
        };
        println!(
            "  {:<24}  {:<12}  {:<8}  {}",
            task.task_id,
            status,
            task.retry_count,
            task.pull_request_url.as_deref().unwrap_or("-"),
        );
    }

    let planner: Option<PlannerState> = state.get_planner_state()?;
    match planner {
        Some(planner) => println!(
            "\nPlanner: last sync {}, {} active, {} processed",
            planner.last_sync_time.format("%Y-%m-%d %H:%M:%S"),
            planner.active_task_ids.len(),
            planner.processed_task_ids.len(),
        ),
        None => println!("\nPlanner: no state recorded yet"),
    }
    Ok(0)
}

fn run_check(state_dir: &PathBuf) -> Result<u8> {
    let config = GantryConfig::load(state_dir)?;
    let mut failures = 0;

    let mut check = |name: &str, ok: bool, hint: &str| {
        if ok {
            println!("ok    {name}");
        } else {
            println!("FAIL  {name} ({hint})");
            failures += 1;
        }
    };

    check(
        "git binary",
        GitCli::new(config.git_operation_timeout).is_available(),
        "install git and make sure it is on PATH",
    );
    let runner = DeveloperRunner::new(
        config.developer_command.clone(),
        config.developer_timeout,
        vec![],
    );
    check(
        &format!("agent CLI ({})", config.developer_command.join(" ")),
        runner.is_available(),
        "set developer_command in the config file",
    );
    check("gh auth", auth_ok(), "run `gh auth login`");
    check(
        "board_id configured",
        !config.board_id.is_empty(),
        "set board_id (owner/repo) in the config file or GANTRY_BOARD_ID",
    );
    check(
        "state dir writable",
        fs::create_dir_all(&config.state_dir).is_ok(),
        "check permissions",
    );

    if failures == 0 {
        println!("\nAll checks passed.");
        Ok(0)
    } else {
        println!("\n{failures} check(s) failed.");
        Ok(1)
    }
}
