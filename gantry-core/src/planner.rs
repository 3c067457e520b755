//! Periodic reconciliation of board state with internal task state.
//!
//! Each cycle runs a fixed phase order: worker maintenance, new TODO
//! items, in-progress status checks, review handling, then sync-time
//! advance. Phases are fault-isolated: one phase failing is recorded and
//! the next still runs. A cycle that overruns its deadline abandons the
//! remaining phases; state is persisted and the next tick starts fresh.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use crossbeam_channel::{select, tick};

use crate::config::GantryConfig;
use crate::model::{BoardStatus, PlannerState, ReviewState, TaskId, TaskRecord};
use crate::pool::WorkerPool;
use crate::ports::{ProjectBoardPort, PullRequestPort, StatePort};
use crate::router::{TaskRequest, TaskRequestHandler, TaskResponseStatus};
use crate::shutdown::ShutdownSignal;

/// Bounded ring of recorded phase failures.
const MAX_RECORDED_ERRORS: usize = 50;

#[derive(Debug, Clone)]
pub struct PlannerConfig {
    pub board_id: String,
    pub monitoring_interval: Duration,
    /// Per-cycle deadline; later phases are abandoned past it.
    pub cycle_timeout: Duration,
    pub max_retry_attempts: u32,
    /// Repository allow-list; empty allows everything.
    pub repositories: Vec<String>,
}

impl PlannerConfig {
    pub fn from_config(config: &GantryConfig) -> Self {
        Self {
            board_id: config.board_id.clone(),
            monitoring_interval: config.monitoring_interval,
            cycle_timeout: config.planner_timeout,
            max_retry_attempts: config.max_retry_attempts,
            repositories: config.repositories.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlannerPhaseError {
    pub phase: &'static str,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PlannerStatus {
    pub running: bool,
    pub cycles_completed: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub active_tasks: usize,
    pub recent_errors: Vec<PlannerPhaseError>,
}

/// What one reconciliation cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub started_tasks: usize,
    pub status_checks: usize,
    pub review_actions: usize,
    pub completed_tasks: usize,
    pub errors: usize,
    pub abandoned: bool,
}

/// What to do with a task sitting in review.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewAction {
    /// The PR is merged; complete the task.
    CompleteMerged,
    /// Approved; drive a merge.
    Merge,
    /// Changes requested with fresh comments; forward them.
    SendFeedback,
    /// Nothing actionable yet.
    Wait,
    /// The PR was closed without merging; stop tracking the task.
    Abandon,
}

/// Pure decision for one in-review task.
pub fn decide_review_action(review: ReviewState, new_comment_count: usize) -> ReviewAction {
    match review {
        ReviewState::Merged => ReviewAction::CompleteMerged,
        ReviewState::Approved => ReviewAction::Merge,
        ReviewState::ChangesRequested if new_comment_count > 0 => ReviewAction::SendFeedback,
        ReviewState::ChangesRequested | ReviewState::Pending => ReviewAction::Wait,
        ReviewState::Closed => ReviewAction::Abandon,
    }
}

struct PlannerInner {
    state: PlannerState,
    errors: VecDeque<PlannerPhaseError>,
    cycles_completed: u64,
    last_cycle_at: Option<DateTime<Utc>>,
    running: bool,
}

pub struct Planner {
    board: Arc<dyn ProjectBoardPort>,
    pull_requests: Arc<dyn PullRequestPort>,
    state: Arc<dyn StatePort>,
    handler: Arc<dyn TaskRequestHandler>,
    pool: Arc<WorkerPool>,
    config: PlannerConfig,
    inner: Mutex<PlannerInner>,
}

impl Planner {
    pub fn new(
        board: Arc<dyn ProjectBoardPort>,
        pull_requests: Arc<dyn PullRequestPort>,
        state: Arc<dyn StatePort>,
        handler: Arc<dyn TaskRequestHandler>,
        pool: Arc<WorkerPool>,
        config: PlannerConfig,
    ) -> Self {
        Self {
            board,
            pull_requests,
            state,
            handler,
            pool,
            config,
            inner: Mutex::new(PlannerInner {
                state: PlannerState::default(),
                errors: VecDeque::new(),
                cycles_completed: 0,
                last_cycle_at: None,
                running: false,
            }),
        }
    }

    /// Load persisted planner state. Called once at supervisor startup.
    pub fn initialize(&self) -> Result<()> {
        if let Some(persisted) = self.state.get_planner_state()? {
            self.lock().state = persisted;
        }
        Ok(())
    }

    /// Blocking reconciliation loop. Runs one cycle immediately, then one
    /// per monitoring interval until the shutdown signal fires.
    pub fn run_loop(&self, shutdown: &ShutdownSignal) {
        self.lock().running = true;
        log::info!(
            "planner started (board {}, interval {:?})",
            self.config.board_id,
            self.config.monitoring_interval
        );

        let ticker = tick(self.config.monitoring_interval);
        let stop = shutdown.subscribe();

        if let Err(e) = self.run_cycle() {
            log::error!("planner cycle failed: {e:#}");
        }
        loop {
            select! {
                recv(ticker) -> _ => {
                    if shutdown.is_triggered() {
                        break;
                    }
                    if let Err(e) = self.run_cycle() {
                        log::error!("planner cycle failed: {e:#}");
                    }
                }
                recv(stop) -> _ => break,
            }
        }

        self.lock().running = false;
        log::info!("planner stopped");
    }

    /// Run exactly one reconciliation cycle, synchronously.
    pub fn force_sync(&self) -> Result<CycleReport> {
        self.run_cycle()
    }

    pub fn status(&self) -> PlannerStatus {
        let inner = self.lock();
        PlannerStatus {
            running: inner.running,
            cycles_completed: inner.cycles_completed,
            last_cycle_at: inner.last_cycle_at,
            active_tasks: inner.state.active_task_ids.len(),
            recent_errors: inner.errors.iter().cloned().collect(),
        }
    }

    fn run_cycle(&self) -> Result<CycleReport> {
        let cycle_time = Utc::now();
        let deadline = Instant::now() + self.config.cycle_timeout;
        let mut report = CycleReport::default();

        // Worker maintenance first so recovered workers can take this
        // cycle's assignments.
        let recovered = self.pool.recover_error_workers() + self.pool.recover_stopped_workers();
        if recovered > 0 {
            log::info!("recovered {recovered} worker(s)");
        }
        self.pool.reap_idle_workers();

        // Tasks already handled this cycle; phase 3 must not touch a task
        // phase 2 just promoted.
        let mut handled = std::collections::BTreeSet::new();

        if self.within_deadline(deadline, "new_tasks", &mut report) {
            if let Err(e) = self.handle_new_tasks(&mut report) {
                self.record_error("new_tasks", format!("{e:#}"));
                report.errors += 1;
            }
        }
        if self.within_deadline(deadline, "in_progress", &mut report) {
            if let Err(e) = self.handle_in_progress_tasks(&mut report, &mut handled) {
                self.record_error("in_progress", format!("{e:#}"));
                report.errors += 1;
            }
        }
        if self.within_deadline(deadline, "review", &mut report) {
            if let Err(e) = self.handle_review_tasks(&mut report, &handled) {
                self.record_error("review", format!("{e:#}"));
                report.errors += 1;
            }
        }

        // Advance sync time and persist even for abandoned cycles, so the
        // next one starts from a consistent snapshot.
        {
            let mut inner = self.lock();
            inner.state.last_sync_time = cycle_time;
            inner.cycles_completed += 1;
            inner.last_cycle_at = Some(cycle_time);
        }
        self.persist_state();
        Ok(report)
    }

    fn within_deadline(
        &self,
        deadline: Instant,
        phase: &'static str,
        report: &mut CycleReport,
    ) -> bool {
        if Instant::now() >= deadline {
            if !report.abandoned {
                log::warn!("planner cycle deadline hit; abandoning phase {phase} and the rest");
            }
            report.abandoned = true;
            return false;
        }
        true
    }

    // ── Phase 1: new TODO items ───────────────────────────────────────────────

    fn handle_new_tasks(&self, report: &mut CycleReport) -> Result<()> {
        let items = self
            .board
            .get_items(&self.config.board_id, Some(BoardStatus::Todo))?;

        for item in items {
            let task_id = TaskId::new(item.id.clone());

            // Board truth wins: a TODO item we consider active means our
            // internal state is stale. Correct it and re-dispatch.
            let was_active = self.lock().state.active_task_ids.contains(&item.id);
            if was_active {
                log::warn!(
                    "consistency mismatch: board has {task_id} as TODO but it is tracked active; \
                     resetting internal state"
                );
                if let Some(worker) = self.pool.get_worker_by_task_id(&task_id) {
                    let _ = self.pool.release_worker(worker.id());
                }
                self.lock().state.active_task_ids.remove(&item.id);
            }
            if self.lock().state.processed_task_ids.contains(&item.id) {
                continue;
            }
            if let Some(repo) = &item.repository {
                if !self.repository_allowed(repo) {
                    log::debug!("skipping {task_id}: repository {repo} is not allow-listed");
                    continue;
                }
            }

            let response = self.handler.handle(TaskRequest::StartNewTask {
                task_id: task_id.clone(),
                board_item: item.clone(),
            });
            match response.status {
                TaskResponseStatus::Accepted => {
                    report.started_tasks += 1;
                    if let Err(e) = self
                        .board
                        .update_item_status(&item.id, BoardStatus::InProgress)
                    {
                        // The worker is already running; the mismatch path
                        // reconciles the board next cycle.
                        self.record_error("new_tasks", format!("board update for {task_id}: {e:#}"));
                    }
                    self.upsert_task_record(&task_id, &item, BoardStatus::InProgress);
                    self.lock().state.active_task_ids.insert(item.id.clone());
                    log::info!("dispatched new task {task_id}");
                }
                TaskResponseStatus::Rejected
                    if response.worker_status.as_deref() == Some("no_available_worker") =>
                {
                    log::info!("worker pool saturated; remaining TODO items wait for the next cycle");
                    break;
                }
                TaskResponseStatus::Rejected => {
                    log::debug!("task {task_id} rejected: {}", response.message);
                }
                _ => {
                    self.record_error("new_tasks", format!("{task_id}: {}", response.message));
                    self.bump_retry(&task_id);
                }
            }
        }
        Ok(())
    }

    // ── Phase 2: in-progress tasks ────────────────────────────────────────────

    fn handle_in_progress_tasks(
        &self,
        report: &mut CycleReport,
        handled: &mut std::collections::BTreeSet<String>,
    ) -> Result<()> {
        for task_id in self.active_tasks() {
            let Some(mut record) = self.state.get_task(&task_id)? else {
                log::warn!("active task {task_id} has no record; dropping it");
                self.lock().state.active_task_ids.remove(task_id.as_str());
                continue;
            };
            if record.board_status != BoardStatus::InProgress {
                continue;
            }
            handled.insert(task_id.as_str().to_string());

            report.status_checks += 1;
            let response = self.handler.handle(TaskRequest::CheckStatus {
                task_id: task_id.clone(),
            });
            match (response.status, response.worker_status.as_deref()) {
                (TaskResponseStatus::Completed, Some("waiting_for_review")) => {
                    let Some(url) = response.pull_request_url.clone() else {
                        continue;
                    };
                    if let Err(e) = self.board.update_item_status(task_id.as_str(), BoardStatus::InReview)
                    {
                        self.record_error("in_progress", format!("board update {task_id}: {e:#}"));
                        continue;
                    }
                    if let Err(e) = self.board.add_pull_request_to_item(task_id.as_str(), &url) {
                        self.record_error("in_progress", format!("pr link {task_id}: {e:#}"));
                    }
                    record.board_status = BoardStatus::InReview;
                    record.pull_request_url = Some(url.clone());
                    record.retry_count = 0;
                    record.touch();
                    self.put_task_record(&record);
                    log::info!("task {task_id} moved to review with {url}");
                }
                (TaskResponseStatus::Completed, Some("merge_completed")) => {
                    self.finish_on_board(&task_id);
                    self.complete_task(&task_id, &mut record, true, report);
                }
                (TaskResponseStatus::Error, _) => {
                    self.record_error(
                        "in_progress",
                        format!("{task_id}: {}", response.message),
                    );
                    record.retry_count += 1;
                    record.touch();
                    if record.retry_count > self.config.max_retry_attempts {
                        log::error!(
                            "task {task_id} exceeded {} retries; marking it failed",
                            self.config.max_retry_attempts
                        );
                        record.failed = true;
                        self.put_task_record(&record);
                        self.release_bound_worker(&task_id);
                        self.retire_task(&task_id);
                    } else {
                        self.put_task_record(&record);
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    // ── Phase 3: in-review tasks ──────────────────────────────────────────────

    fn handle_review_tasks(
        &self,
        report: &mut CycleReport,
        handled: &std::collections::BTreeSet<String>,
    ) -> Result<()> {
        let since = self.lock().state.last_sync_time;

        for task_id in self.active_tasks() {
            if handled.contains(task_id.as_str()) {
                continue;
            }
            let Some(mut record) = self.state.get_task(&task_id)? else {
                continue;
            };
            if record.board_status != BoardStatus::InReview {
                continue;
            }

            // A merge the worker already performed beats whatever the
            // provider still reports.
            if record.merged {
                self.finish_on_board(&task_id);
                self.complete_task(&task_id, &mut record, true, report);
                continue;
            }

            let Some(url) = record.pull_request_url.clone() else {
                self.record_error(
                    "review",
                    format!("task {task_id} is in review without a PR URL"),
                );
                continue;
            };

            let review = match self.pull_requests.get_review_state(&url) {
                Ok(review) => review,
                Err(e) => {
                    self.record_error("review", format!("review state for {task_id}: {e:#}"));
                    continue;
                }
            };

            // Comments are only fetched when the decision needs them.
            let new_comments = if review == ReviewState::ChangesRequested {
                match self.pull_requests.get_comments(&url, Some(since)) {
                    Ok(comments) => comments
                        .into_iter()
                        .filter(|c| !record.processed_comment_ids.contains(&c.id))
                        .collect(),
                    Err(e) => {
                        self.record_error("review", format!("comments for {task_id}: {e:#}"));
                        continue;
                    }
                }
            } else {
                Vec::new()
            };

            match decide_review_action(review, new_comments.len()) {
                ReviewAction::CompleteMerged => {
                    self.finish_on_board(&task_id);
                    self.complete_task(&task_id, &mut record, true, report);
                }
                ReviewAction::Merge => {
                    match self.pull_requests.request_merge(&url) {
                        Ok(true) => {
                            log::info!("provider merged {url} for task {task_id}");
                            self.finish_on_board(&task_id);
                            self.complete_task(&task_id, &mut record, true, report);
                            continue;
                        }
                        Ok(false) => {}
                        Err(e) => {
                            self.record_error("review", format!("merge request {task_id}: {e:#}"));
                            continue;
                        }
                    }
                    let response = self.handler.handle(TaskRequest::MergeRequest {
                        task_id: task_id.clone(),
                        pull_request_url: url.clone(),
                    });
                    if response.status == TaskResponseStatus::Accepted {
                        report.review_actions += 1;
                        log::info!("merge dispatched for task {task_id}");
                    } else {
                        // Stay in review; retried next cycle.
                        self.record_error("review", format!("merge {task_id}: {}", response.message));
                    }
                }
                ReviewAction::SendFeedback => {
                    let comment_ids: Vec<String> =
                        new_comments.iter().map(|c| c.id.clone()).collect();
                    let response = self.handler.handle(TaskRequest::ProcessFeedback {
                        task_id: task_id.clone(),
                        pull_request_url: url.clone(),
                        comments: new_comments,
                    });
                    if response.status == TaskResponseStatus::Accepted {
                        record
                            .processed_comment_ids
                            .extend(comment_ids.iter().cloned());
                        record.touch();
                        self.put_task_record(&record);
                        if let Err(e) = self.pull_requests.mark_comments_processed(&comment_ids) {
                            log::debug!("marking comments processed: {e:#}");
                        }
                        report.review_actions += 1;
                        log::info!(
                            "forwarded {} comment(s) for task {task_id}",
                            comment_ids.len()
                        );
                    } else {
                        self.record_error(
                            "review",
                            format!("feedback {task_id}: {}", response.message),
                        );
                    }
                }
                ReviewAction::Wait => {}
                ReviewAction::Abandon => {
                    log::warn!("PR for task {task_id} was closed without merging; retiring task");
                    record.failed = true;
                    record.touch();
                    self.put_task_record(&record);
                    self.release_bound_worker(&task_id);
                    self.retire_task(&task_id);
                }
            }
        }
        Ok(())
    }

    // ── Bookkeeping helpers ───────────────────────────────────────────────────

    fn active_tasks(&self) -> Vec<TaskId> {
        self.lock()
            .state
            .active_task_ids
            .iter()
            .map(|id| TaskId::new(id.clone()))
            .collect()
    }

    fn repository_allowed(&self, repository_id: &str) -> bool {
        self.config.repositories.is_empty()
            || self.config.repositories.iter().any(|r| r == repository_id)
    }

    fn upsert_task_record(&self, task_id: &TaskId, item: &crate::model::BoardItem, status: BoardStatus) {
        let repository = item
            .repository
            .clone()
            .unwrap_or_else(|| self.config.repositories.first().cloned().unwrap_or_default());
        let mut record = match self.state.get_task(task_id) {
            Ok(Some(record)) => record,
            _ => TaskRecord::new(task_id.clone(), repository, status),
        };
        record.board_status = status;
        record.touch();
        self.put_task_record(&record);
    }

    fn put_task_record(&self, record: &TaskRecord) {
        if let Err(e) = self.state.put_task(record) {
            self.record_error("state", format!("persisting task {}: {e:#}", record.task_id));
        }
    }

    /// Mark the board item DONE, tolerating provider failures (the merge
    /// already happened; the board catches up next cycle).
    fn finish_on_board(&self, task_id: &TaskId) {
        if let Err(e) = self
            .board
            .update_item_status(task_id.as_str(), BoardStatus::Done)
        {
            self.record_error("review", format!("board done {task_id}: {e:#}"));
        }
    }

    fn complete_task(
        &self,
        task_id: &TaskId,
        record: &mut TaskRecord,
        merged: bool,
        report: &mut CycleReport,
    ) {
        record.board_status = BoardStatus::Done;
        record.merged = merged;
        record.touch();
        self.put_task_record(record);
        self.release_bound_worker(task_id);
        self.retire_task(task_id);
        report.completed_tasks += 1;
        log::info!("task {task_id} is done");
    }

    fn release_bound_worker(&self, task_id: &TaskId) {
        if let Some(worker) = self.pool.get_worker_by_task_id(task_id) {
            if let Err(e) = self.pool.release_worker(worker.id()) {
                log::warn!("releasing worker for {task_id}: {e:#}");
            }
        }
    }

    /// Move a task from active to processed so it is never re-dispatched.
    fn retire_task(&self, task_id: &TaskId) {
        let mut inner = self.lock();
        inner.state.active_task_ids.remove(task_id.as_str());
        inner
            .state
            .processed_task_ids
            .insert(task_id.as_str().to_string());
    }

    fn bump_retry(&self, task_id: &TaskId) {
        if let Ok(Some(mut record)) = self.state.get_task(task_id) {
            record.retry_count += 1;
            record.touch();
            self.put_task_record(&record);
        }
    }

    fn record_error(&self, phase: &'static str, message: String) {
        log::warn!("planner phase {phase}: {message}");
        let mut inner = self.lock();
        inner.errors.push_back(PlannerPhaseError {
            phase,
            message,
            at: Utc::now(),
        });
        while inner.errors.len() > MAX_RECORDED_ERRORS {
            inner.errors.pop_front();
        }
    }

    fn persist_state(&self) {
        let snapshot = self.lock().state.clone();
        if let Err(e) = self.state.put_planner_state(&snapshot) {
            log::warn!("persisting planner state: {e:#}");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PlannerInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ReviewComment;

    // Pure decision tests; the full planner is exercised end to end in
    // tests/lifecycle.rs.

    #[test]
    fn merged_pr_completes() {
        assert_eq!(
            decide_review_action(ReviewState::Merged, 0),
            ReviewAction::CompleteMerged
        );
    }

    #[test]
    fn approved_pr_merges_regardless_of_comments() {
        assert_eq!(decide_review_action(ReviewState::Approved, 0), ReviewAction::Merge);
        assert_eq!(decide_review_action(ReviewState::Approved, 3), ReviewAction::Merge);
    }

    #[test]
    fn changes_requested_with_comments_sends_feedback() {
        assert_eq!(
            decide_review_action(ReviewState::ChangesRequested, 2),
            ReviewAction::SendFeedback
        );
    }

    #[test]
    fn changes_requested_without_new_comments_waits() {
        assert_eq!(
            decide_review_action(ReviewState::ChangesRequested, 0),
            ReviewAction::Wait
        );
    }

    #[test]
    fn pending_waits_and_closed_abandons() {
        assert_eq!(decide_review_action(ReviewState::Pending, 5), ReviewAction::Wait);
        assert_eq!(decide_review_action(ReviewState::Closed, 5), ReviewAction::Abandon);
    }

    #[test]
    fn comment_filtering_matches_processed_set() {
        // Mirrors the dedup the review phase applies before deciding.
        let processed: std::collections::BTreeSet<String> =
            ["c1".to_string()].into_iter().collect();
        let comments = vec![
            ReviewComment {
                id: "c1".to_string(),
                author: "alice".to_string(),
                content: "already handled".to_string(),
                created_at: Utc::now(),
            },
            ReviewComment {
                id: "c2".to_string(),
                author: "alice".to_string(),
                content: "new ask".to_string(),
                created_at: Utc::now(),
            },
        ];
        let fresh: Vec<_> = comments
            .into_iter()
            .filter(|c| !processed.contains(&c.id))
            .collect();
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].id, "c2");
    }
}
