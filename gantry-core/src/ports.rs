//! Ports consumed by the core.
//!
//! Everything the orchestrator touches outside its own process goes through
//! one of these traits: the project board, the PR provider, the git binary,
//! the coding-agent CLI, and durable state. Concrete adapters live at the
//! edges (`git_cli`, `runner`, `store`, and the provider adapters in the
//! binary crate); tests inject mocks.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::model::{
    BoardItem, BoardStatus, ExecutionResult, PlannerState, PullRequestInfo, ReviewComment,
    ReviewState, TaskId, TaskRecord, WorkerRecord, WorkspaceInfo,
};

/// Project-management board: the source of work items and the place their
/// lifecycle status is reflected back to.
pub trait ProjectBoardPort: Send + Sync {
    /// Items on the board, optionally filtered to one status column.
    fn get_items(&self, board_id: &str, status: Option<BoardStatus>) -> Result<Vec<BoardItem>>;

    fn update_item_status(&self, item_id: &str, status: BoardStatus) -> Result<()>;

    /// Attach a PR URL to an item, preserving any existing ones.
    fn add_pull_request_to_item(&self, item_id: &str, pr_url: &str) -> Result<()>;

    /// Replace the item's PR URLs with exactly this one.
    fn set_pull_request_to_item(&self, item_id: &str, pr_url: &str) -> Result<()>;

    fn get_repository_default_branch(&self, repository_id: &str) -> Result<String>;
}

/// Pull-request provider: review state, comments, and (optionally) merging.
pub trait PullRequestPort: Send + Sync {
    fn get_pull_request(&self, url: &str) -> Result<PullRequestInfo>;

    /// Comments on the PR, optionally restricted to those created after
    /// `since`.
    fn get_comments(&self, url: &str, since: Option<DateTime<Utc>>) -> Result<Vec<ReviewComment>>;

    fn is_approved(&self, repository_id: &str, pr_number: u64) -> Result<bool>;

    fn get_review_state(&self, url: &str) -> Result<ReviewState>;

    /// Ask the provider to merge the PR directly. Returns `false` when the
    /// provider does not support server-side merges; the planner then routes
    /// a merge task to the agent instead.
    fn request_merge(&self, _url: &str) -> Result<bool> {
        Ok(false)
    }

    /// Record comment ids as handled on the provider side. The default
    /// no-ops; dedup is always enforced locally as well.
    fn mark_comments_processed(&self, _ids: &[String]) -> Result<()> {
        Ok(())
    }
}

/// Git operations against the local disk. All mutations are expected to be
/// called under the per-repository lock.
pub trait GitPort: Send + Sync {
    fn clone_repository(&self, url: &str, local_path: &Path, depth: Option<u32>) -> Result<()>;

    fn fetch(&self, local_path: &Path) -> Result<()>;

    fn pull_main_branch(&self, local_path: &Path) -> Result<()>;

    fn create_worktree(
        &self,
        repo_path: &Path,
        branch: &str,
        worktree_path: &Path,
        base_branch: Option<&str>,
    ) -> Result<()>;

    fn remove_worktree(&self, repo_path: &Path, worktree_path: &Path) -> Result<()>;

    fn is_valid_repository(&self, path: &Path) -> bool;
}

/// The external coding agent, an opaque subprocess.
pub trait DeveloperPort: Send + Sync {
    fn initialize(&self) -> Result<()>;

    /// Run the agent with `prompt` on stdin and `workspace_dir` as its
    /// working directory. Blocks until exit, timeout, or termination.
    fn execute(&self, prompt: &str, workspace_dir: &Path) -> Result<ExecutionResult>;

    /// Terminate any live agent processes and drop runtime resources.
    fn cleanup(&self) -> Result<()>;

    fn is_available(&self) -> bool;

    /// Replace the wall-clock execution timeout for subsequent runs.
    fn set_timeout(&self, timeout: Duration);
}

/// Durable typed state: tasks, workers, workspaces, and the planner
/// singleton. Put/get are atomic per key; reads after writes in the same
/// process see the new value.
pub trait StatePort: Send + Sync {
    fn put_task(&self, record: &TaskRecord) -> Result<()>;
    fn get_task(&self, task_id: &TaskId) -> Result<Option<TaskRecord>>;
    fn list_tasks(&self) -> Result<Vec<TaskRecord>>;
    fn delete_task(&self, task_id: &TaskId) -> Result<()>;

    fn put_worker(&self, record: &WorkerRecord) -> Result<()>;
    fn get_worker(&self, worker_id: &str) -> Result<Option<WorkerRecord>>;
    fn list_workers(&self) -> Result<Vec<WorkerRecord>>;
    fn delete_worker(&self, worker_id: &str) -> Result<()>;

    fn put_workspace(&self, info: &WorkspaceInfo) -> Result<()>;
    fn get_workspace(&self, task_id: &TaskId) -> Result<Option<WorkspaceInfo>>;
    fn list_workspaces(&self) -> Result<Vec<WorkspaceInfo>>;
    fn delete_workspace(&self, task_id: &TaskId) -> Result<()>;

    fn put_planner_state(&self, state: &PlannerState) -> Result<()>;
    fn get_planner_state(&self) -> Result<Option<PlannerState>>;
}
