//! Routing of board-derived task requests onto the worker pool.
//!
//! The router is the single entry point between the planner and the
//! workers. It enforces one-worker-per-task, resolves repository ids, and
//! converts worker errors into responses instead of letting them escape.

use std::sync::Arc;

use chrono::Utc;

use crate::model::{BoardItem, ReviewComment, Task, TaskId, WorkerAction, WorkerStatus};
use crate::pool::WorkerPool;
use crate::ports::StatePort;
use crate::worker::Worker;

/// Board-derived intent, discriminated by action. Each variant carries only
/// the payload that action needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskRequest {
    StartNewTask {
        task_id: TaskId,
        board_item: BoardItem,
    },
    ResumeTask {
        task_id: TaskId,
        board_item: Option<BoardItem>,
        pull_request_url: Option<String>,
    },
    ProcessFeedback {
        task_id: TaskId,
        pull_request_url: String,
        comments: Vec<ReviewComment>,
    },
    MergeRequest {
        task_id: TaskId,
        pull_request_url: String,
    },
    CheckStatus {
        task_id: TaskId,
    },
}

impl TaskRequest {
    pub fn task_id(&self) -> &TaskId {
        match self {
            Self::StartNewTask { task_id, .. }
            | Self::ResumeTask { task_id, .. }
            | Self::ProcessFeedback { task_id, .. }
            | Self::MergeRequest { task_id, .. }
            | Self::CheckStatus { task_id } => task_id,
        }
    }

    pub fn action(&self) -> WorkerAction {
        match self {
            Self::StartNewTask { .. } => WorkerAction::StartNewTask,
            Self::ResumeTask { .. } => WorkerAction::ResumeTask,
            Self::ProcessFeedback { .. } => WorkerAction::ProcessFeedback,
            Self::MergeRequest { .. } => WorkerAction::MergeRequest,
            Self::CheckStatus { .. } => WorkerAction::CheckStatus,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskResponseStatus {
    Accepted,
    Rejected,
    Completed,
    Error,
    InProgress,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskResponse {
    pub status: TaskResponseStatus,
    pub message: String,
    pub worker_status: Option<String>,
    pub pull_request_url: Option<String>,
}

impl TaskResponse {
    pub fn accepted(message: impl Into<String>, worker_status: &str) -> Self {
        Self {
            status: TaskResponseStatus::Accepted,
            message: message.into(),
            worker_status: Some(worker_status.to_string()),
            pull_request_url: None,
        }
    }

    pub fn rejected(message: impl Into<String>, worker_status: &str) -> Self {
        Self {
            status: TaskResponseStatus::Rejected,
            message: message.into(),
            worker_status: Some(worker_status.to_string()),
            pull_request_url: None,
        }
    }

    pub fn completed(message: impl Into<String>, worker_status: &str) -> Self {
        Self {
            status: TaskResponseStatus::Completed,
            message: message.into(),
            worker_status: Some(worker_status.to_string()),
            pull_request_url: None,
        }
    }

    pub fn in_progress(message: impl Into<String>, worker_status: &str) -> Self {
        Self {
            status: TaskResponseStatus::InProgress,
            message: message.into(),
            worker_status: Some(worker_status.to_string()),
            pull_request_url: None,
        }
    }

    pub fn error(message: impl Into<String>, worker_status: Option<&str>) -> Self {
        Self {
            status: TaskResponseStatus::Error,
            message: message.into(),
            worker_status: worker_status.map(str::to_string),
            pull_request_url: None,
        }
    }

    pub fn with_pull_request(mut self, url: impl Into<String>) -> Self {
        self.pull_request_url = Some(url.into());
        self
    }
}

/// Shared handler contract between the planner and any operator surface.
pub trait TaskRequestHandler: Send + Sync {
    fn handle(&self, request: TaskRequest) -> TaskResponse;
}

/// `owner/repo` out of a PR URL of the form `…/<owner>/<repo>/pull/<n>`.
pub fn repository_from_pr_url(url: &str) -> Option<String> {
    let segments: Vec<&str> = url.split('/').filter(|s| !s.is_empty()).collect();
    let pull_pos = segments.iter().position(|s| *s == "pull")?;
    if pull_pos < 3 || pull_pos + 1 >= segments.len() {
        return None;
    }
    // The segment after `pull` must start with the PR number; fragments and
    // query strings may trail it.
    if !segments[pull_pos + 1].starts_with(|c: char| c.is_ascii_digit()) {
        return None;
    }
    Some(format!("{}/{}", segments[pull_pos - 2], segments[pull_pos - 1]))
}

pub struct TaskRouter {
    pool: Arc<WorkerPool>,
    state: Arc<dyn StatePort>,
    default_repository: Option<String>,
}

impl TaskRouter {
    pub fn new(
        pool: Arc<WorkerPool>,
        state: Arc<dyn StatePort>,
        default_repository: Option<String>,
    ) -> Self {
        Self {
            pool,
            state,
            default_repository,
        }
    }

    fn start_new_task(&self, task_id: TaskId, board_item: BoardItem) -> TaskResponse {
        if self.pool.get_worker_by_task_id(&task_id).is_some() {
            return TaskResponse::rejected(
                format!("task {task_id} already has a worker"),
                "already_assigned",
            );
        }
        let Some(repository_id) = board_item
            .repository
            .clone()
            .or_else(|| self.default_repository.clone())
        else {
            return TaskResponse::error(
                format!("no repository known for task {task_id}"),
                None,
            );
        };

        let task = Task {
            task_id: task_id.clone(),
            repository_id,
            action: WorkerAction::StartNewTask,
            board_item: Some(board_item),
            pull_request_url: None,
            review_comments: vec![],
            assigned_at: Utc::now(),
        };
        self.dispatch(task, "processing")
    }

    fn resume_task(
        &self,
        task_id: TaskId,
        board_item: Option<BoardItem>,
        pull_request_url: Option<String>,
    ) -> TaskResponse {
        let repository_id = board_item
            .as_ref()
            .and_then(|i| i.repository.clone())
            .or_else(|| pull_request_url.as_deref().and_then(repository_from_pr_url))
            .or_else(|| self.default_repository.clone());
        let Some(repository_id) = repository_id else {
            return TaskResponse::error(format!("no repository known for task {task_id}"), None);
        };

        let task = Task {
            task_id,
            repository_id,
            action: WorkerAction::ResumeTask,
            board_item,
            pull_request_url,
            review_comments: vec![],
            assigned_at: Utc::now(),
        };
        self.dispatch(task, "processing")
    }

    fn process_feedback(
        &self,
        task_id: TaskId,
        pull_request_url: String,
        comments: Vec<ReviewComment>,
    ) -> TaskResponse {
        let Some(repository_id) = repository_from_pr_url(&pull_request_url)
            .or_else(|| self.default_repository.clone())
        else {
            return TaskResponse::error(format!("no repository known for task {task_id}"), None);
        };

        let task = Task {
            task_id,
            repository_id,
            action: WorkerAction::ProcessFeedback,
            board_item: None,
            pull_request_url: Some(pull_request_url),
            review_comments: comments,
            assigned_at: Utc::now(),
        };
        self.dispatch(task, "processing_feedback")
    }

    fn merge_request(&self, task_id: TaskId, pull_request_url: String) -> TaskResponse {
        if let Some(worker) = self.pool.get_worker_by_task_id(&task_id) {
            let snapshot = worker.snapshot();
            if snapshot.action == Some(WorkerAction::MergeRequest)
                && snapshot.status == WorkerStatus::Working
            {
                return TaskResponse::accepted(
                    format!("merge for {task_id} is already running"),
                    "already_processing",
                );
            }
        }

        let Some(repository_id) = repository_from_pr_url(&pull_request_url)
            .or_else(|| self.default_repository.clone())
        else {
            return TaskResponse::error(format!("no repository known for task {task_id}"), None);
        };

        let task = Task {
            task_id,
            repository_id,
            action: WorkerAction::MergeRequest,
            board_item: None,
            pull_request_url: Some(pull_request_url),
            review_comments: vec![],
            assigned_at: Utc::now(),
        };
        // Merge requests report saturation as an error: the planner retries
        // them on the next cycle rather than treating it as a refusal.
        match self.find_worker_for(&task.task_id) {
            Ok(Some(worker)) => self.assign_and_start(worker, task, "processing_merge"),
            Ok(None) => TaskResponse::error("no available worker for merge", Some("no_available_worker")),
            Err(message) => TaskResponse::error(message, None),
        }
    }

    fn check_status(&self, task_id: TaskId) -> TaskResponse {
        if let Some(worker) = self.pool.get_worker_by_task_id(&task_id) {
            let snapshot = worker.snapshot();
            return match snapshot.status {
                WorkerStatus::Working => {
                    TaskResponse::in_progress("task is executing", "processing")
                }
                WorkerStatus::Waiting => match snapshot.pull_request_url {
                    Some(url) => TaskResponse::completed(
                        format!("task {task_id} is waiting for review"),
                        "waiting_for_review",
                    )
                    .with_pull_request(url),
                    None => TaskResponse::in_progress("task is prepared", "preparing"),
                },
                WorkerStatus::Stopped => TaskResponse::in_progress("worker is stopped", "stopped"),
                WorkerStatus::Error => TaskResponse::error(
                    snapshot
                        .last_error
                        .unwrap_or_else(|| "worker is in error state".to_string()),
                    Some("error"),
                ),
                WorkerStatus::Idle => {
                    TaskResponse::in_progress("worker is idle", "idle")
                }
            };
        }

        // No live worker: answer from the durable task record. This covers
        // merge completion (worker already released) and restarts.
        match self.state.get_task(&task_id) {
            Ok(Some(record)) if record.merged => {
                TaskResponse::completed(format!("task {task_id} was merged"), "merge_completed")
            }
            Ok(Some(record)) if record.failed => {
                TaskResponse::error(format!("task {task_id} failed"), Some("failed"))
            }
            Ok(Some(record)) => match record.pull_request_url {
                Some(url) => TaskResponse::completed(
                    format!("task {task_id} is waiting for review"),
                    "waiting_for_review",
                )
                .with_pull_request(url),
                None => TaskResponse::error(
                    format!("no worker bound to task {task_id}"),
                    Some("no_worker"),
                ),
            },
            Ok(None) => TaskResponse::error(
                format!("unknown task {task_id}"),
                Some("no_worker"),
            ),
            Err(e) => TaskResponse::error(format!("state lookup failed: {e:#}"), None),
        }
    }

    /// Existing worker for the task, else an available one. `Ok(None)`
    /// means the pool is saturated.
    fn find_worker_for(&self, task_id: &TaskId) -> Result<Option<Arc<Worker>>, String> {
        if let Some(worker) = self.pool.get_worker_by_task_id(task_id) {
            return Ok(Some(worker));
        }
        self.pool
            .get_available_worker()
            .map_err(|e| format!("worker pool unavailable: {e:#}"))
    }

    fn dispatch(&self, task: Task, worker_status: &str) -> TaskResponse {
        match self.find_worker_for(&task.task_id) {
            Ok(Some(worker)) => self.assign_and_start(worker, task, worker_status),
            Ok(None) => TaskResponse::rejected("no available worker", "no_available_worker"),
            Err(message) => TaskResponse::error(message, None),
        }
    }

    fn assign_and_start(
        &self,
        worker: Arc<Worker>,
        task: Task,
        worker_status: &str,
    ) -> TaskResponse {
        let task_id = task.task_id.clone();
        if let Err(e) = worker.assign_task(task) {
            return TaskResponse::error(
                format!("assigning task {task_id}: {e:#}"),
                Some("assignment_failed"),
            );
        }
        if let Err(e) = worker.start_execution() {
            // The assignment went through but execution never started; put
            // the worker back into rotation.
            let _ = worker.cancel_execution();
            return TaskResponse::error(
                format!("starting task {task_id}: {e:#}"),
                Some("start_failed"),
            );
        }
        TaskResponse::accepted(format!("task {task_id} accepted"), worker_status)
    }
}

impl TaskRequestHandler for TaskRouter {
    fn handle(&self, request: TaskRequest) -> TaskResponse {
        match request {
            TaskRequest::StartNewTask { task_id, board_item } => {
                self.start_new_task(task_id, board_item)
            }
            TaskRequest::ResumeTask {
                task_id,
                board_item,
                pull_request_url,
            } => self.resume_task(task_id, board_item, pull_request_url),
            TaskRequest::ProcessFeedback {
                task_id,
                pull_request_url,
                comments,
            } => self.process_feedback(task_id, pull_request_url, comments),
            TaskRequest::MergeRequest {
                task_id,
                pull_request_url,
            } => self.merge_request(task_id, pull_request_url),
            TaskRequest::CheckStatus { task_id } => self.check_status(task_id),
        }
    }
}
