//! Shared data model: board items, tasks, workers, workspaces, and the
//! persisted records that flow through the state port.
//!
//! Everything here is a plain value type. Behaviour lives in the components
//! that own each record (pool, workspace manager, planner).

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Identifiers ───────────────────────────────────────────────────────────────

/// Opaque task identifier. Equal to the board item id that spawned the task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ── Board-side types ──────────────────────────────────────────────────────────

/// Lifecycle column of a board item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoardStatus {
    Todo,
    InProgress,
    InReview,
    Done,
}

impl BoardStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::InProgress => "in_progress",
            Self::InReview => "in_review",
            Self::Done => "done",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "todo" => Some(Self::Todo),
            "in_progress" => Some(Self::InProgress),
            "in_review" => Some(Self::InReview),
            "done" => Some(Self::Done),
            _ => None,
        }
    }
}

impl fmt::Display for BoardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What kind of content a board item points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Issue,
    PullRequest,
    DraftIssue,
}

/// A unit of work on the external project board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardItem {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: BoardStatus,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub pull_request_urls: Vec<String>,
    #[serde(default)]
    pub content_type: Option<ContentType>,
    #[serde(default)]
    pub content_number: Option<u64>,
    /// Repository the item belongs to, in `owner/repo` form. Items from
    /// board providers that do not attach a repository leave this unset and
    /// fall back to the configured default.
    #[serde(default)]
    pub repository: Option<String>,
}

/// A single reviewer comment on a pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewComment {
    pub id: String,
    pub author: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Approval/feedback status of a pull request as seen by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewState {
    Approved,
    ChangesRequested,
    Pending,
    Merged,
    Closed,
}

impl ReviewState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::ChangesRequested => "changes_requested",
            Self::Pending => "pending",
            Self::Merged => "merged",
            Self::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "approved" => Some(Self::Approved),
            "changes_requested" => Some(Self::ChangesRequested),
            "pending" => Some(Self::Pending),
            "merged" => Some(Self::Merged),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

impl fmt::Display for ReviewState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a pull request returned by the PR provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestInfo {
    pub url: String,
    pub number: u64,
    pub repository_id: String,
    pub title: String,
    pub review_state: ReviewState,
}

// ── Worker-side types ─────────────────────────────────────────────────────────

/// What a worker is asked to do with its bound task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerAction {
    StartNewTask,
    ResumeTask,
    ProcessFeedback,
    MergeRequest,
    CheckStatus,
}

impl WorkerAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StartNewTask => "start_new_task",
            Self::ResumeTask => "resume_task",
            Self::ProcessFeedback => "process_feedback",
            Self::MergeRequest => "merge_request",
            Self::CheckStatus => "check_status",
        }
    }
}

impl fmt::Display for WorkerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unit of work handed to a worker.
///
/// Built by the router from a `TaskRequest`; the worker holds exactly one of
/// these while bound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    /// Repository the change lands in, `owner/repo`.
    pub repository_id: String,
    pub action: WorkerAction,
    #[serde(default)]
    pub board_item: Option<BoardItem>,
    #[serde(default)]
    pub pull_request_url: Option<String>,
    #[serde(default)]
    pub review_comments: Vec<ReviewComment>,
    pub assigned_at: DateTime<Utc>,
}

/// Lifecycle status of a pooled worker.
///
/// State machine:
///   Idle → Waiting (assigned) → Working (executing) → Waiting | Idle | Error
///   Stopped and Error are recoverable back to Waiting after their timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Waiting,
    Working,
    Stopped,
    Error,
}

impl WorkerStatus {
    /// Whether a task may currently be bound to the worker.
    pub fn is_bound(self) -> bool {
        matches!(self, Self::Waiting | Self::Working)
    }

    /// Whether the worker can accept a new assignment right now.
    pub fn is_assignable(self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Whether the worker is waiting on a recovery timer.
    pub fn is_recoverable(self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Waiting => "waiting",
            Self::Working => "working",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(Self::Idle),
            "waiting" => Some(Self::Waiting),
            "working" => Some(Self::Working),
            "stopped" => Some(Self::Stopped),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted worker record, the durable half of a pooled worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub worker_id: String,
    #[serde(default)]
    pub workspace_dir: Option<PathBuf>,
    pub developer_type: String,
    pub status: WorkerStatus,
    #[serde(default)]
    pub current_task: Option<TaskId>,
    #[serde(default)]
    pub pull_request_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

/// Result of the agent outcome produced by one worker execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerResult {
    pub task_id: TaskId,
    pub action: WorkerAction,
    pub success: bool,
    #[serde(default)]
    pub pull_request_url: Option<String>,
    #[serde(default)]
    pub commit_hash: Option<String>,
    #[serde(default)]
    pub modified_files: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

// ── Workspace and repository types ────────────────────────────────────────────

/// Per-task workspace: a git worktree plus a task instruction file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceInfo {
    pub task_id: TaskId,
    pub repository_id: String,
    pub workspace_dir: PathBuf,
    pub branch_name: String,
    /// Whether the worktree has been created. Re-validated against the
    /// filesystem on every setup; a stale `true` triggers recreation.
    pub worktree_created: bool,
    #[serde(default)]
    pub instruction_file_path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
}

/// In-memory bookkeeping for one cached repository clone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryState {
    pub repository_id: String,
    pub local_path: PathBuf,
    pub last_fetch_at: Option<DateTime<Utc>>,
    pub active_worktrees: BTreeSet<PathBuf>,
}

// ── Persisted planner/task records ────────────────────────────────────────────

/// Durable record of one orchestrated task, keyed by board item id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub repository_id: String,
    pub board_status: BoardStatus,
    #[serde(default)]
    pub pull_request_url: Option<String>,
    /// Review comment ids already forwarded to a worker. Prevents acting on
    /// the same comment twice across cycles and restarts.
    #[serde(default)]
    pub processed_comment_ids: BTreeSet<String>,
    #[serde(default)]
    pub retry_count: u32,
    /// Free-form summary of the last execution, fed back into resume prompts.
    #[serde(default)]
    pub progress: Option<String>,
    #[serde(default)]
    pub merged: bool,
    #[serde(default)]
    pub failed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(task_id: TaskId, repository_id: impl Into<String>, board_status: BoardStatus) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            repository_id: repository_id.into(),
            board_status,
            pull_request_url: None,
            processed_comment_ids: BTreeSet::new(),
            retry_count: 0,
            progress: None,
            merged: false,
            failed: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Singleton planner state persisted between cycles and restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannerState {
    pub last_sync_time: DateTime<Utc>,
    /// Tasks that reached a terminal state. Never re-dispatched.
    #[serde(default)]
    pub processed_task_ids: BTreeSet<String>,
    /// Tasks currently owned by a worker somewhere in the lifecycle.
    #[serde(default)]
    pub active_task_ids: BTreeSet<String>,
}

impl Default for PlannerState {
    fn default() -> Self {
        Self {
            last_sync_time: DateTime::<Utc>::UNIX_EPOCH,
            processed_task_ids: BTreeSet::new(),
            active_task_ids: BTreeSet::new(),
        }
    }
}

/// Raw outcome of one agent subprocess invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub raw_output: String,
    pub stderr: String,
    pub exit_code: i32,
}
