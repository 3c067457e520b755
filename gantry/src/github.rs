//! GitHub adapters for the board and PR ports, backed by the `gh` CLI.
//!
//! Subprocess calls keep gantry free of a GitHub API crate and reuse the
//! operator's existing `gh auth` session. The board is modeled on issues
//! with `status:*` workflow labels: the board id is `owner/repo`, items are
//! open issues, and moving an item between columns swaps its status label.

use std::process::{Command, Stdio};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use gantry_core::error::OrchestratorError;
use gantry_core::model::{
    BoardItem, BoardStatus, ContentType, PullRequestInfo, ReviewComment, ReviewState,
};
use gantry_core::ports::{ProjectBoardPort, PullRequestPort};
use gantry_core::router::repository_from_pr_url;

const STATUS_LABELS: [(BoardStatus, &str); 4] = [
    (BoardStatus::Todo, "status:todo"),
    (BoardStatus::InProgress, "status:in-progress"),
    (BoardStatus::InReview, "status:in-review"),
    (BoardStatus::Done, "status:done"),
];

fn status_label(status: BoardStatus) -> &'static str {
    match status {
        BoardStatus::Todo => "status:todo",
        BoardStatus::InProgress => "status:in-progress",
        BoardStatus::InReview => "status:in-review",
        BoardStatus::Done => "status:done",
    }
}

/// Run a `gh` command and capture stdout.
fn gh_output(args: &[&str]) -> Result<String> {
    let out = Command::new("gh")
        .args(args)
        .stdin(Stdio::null())
        .output()
        .with_context(|| format!("failed to run: gh {}", args.join(" ")))?;
    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr);
        return Err(OrchestratorError::ProviderTransient(format!(
            "gh {} failed: {}",
            args.join(" "),
            stderr.trim()
        ))
        .into());
    }
    Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
}

/// Run a `gh` command, caring only about success.
fn gh_status(args: &[&str]) -> bool {
    Command::new("gh")
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// `gh auth status` succeeds when a usable session exists.
pub fn auth_ok() -> bool {
    gh_status(&["auth", "status"])
}

// ── Board adapter ─────────────────────────────────────────────────────────────

/// Issue-label board: `board_id` is `owner/repo`, columns are `status:*`
/// labels on open issues.
pub struct GhIssueBoard;

impl GhIssueBoard {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl ProjectBoardPort for GhIssueBoard {
    fn get_items(&self, board_id: &str, status: Option<BoardStatus>) -> Result<Vec<BoardItem>> {
        let mut args = vec![
            "issue",
            "list",
            "--repo",
            board_id,
            "--state",
            "open",
            "--json",
            "number,title,body,labels",
            "--limit",
            "100",
        ];
        let label;
        if let Some(status) = status {
            label = status_label(status);
            args.push("--label");
            args.push(label);
        }
        let raw = gh_output(&args)?;
        parse_issue_items(&raw, board_id)
    }

    fn update_item_status(&self, item_id: &str, status: BoardStatus) -> Result<()> {
        let (repo, number) = split_item_id(item_id)?;
        // Swap whatever status label is present for the new one.
        for (other, label) in STATUS_LABELS {
            if other != status {
                let _ = gh_status(&[
                    "issue",
                    "edit",
                    &number,
                    "--repo",
                    &repo,
                    "--remove-label",
                    label,
                ]);
            }
        }
        if !gh_status(&[
            "issue",
            "edit",
            &number,
            "--repo",
            &repo,
            "--add-label",
            status_label(status),
        ]) {
            return Err(OrchestratorError::ProviderTransient(format!(
                "could not set {} on {item_id}",
                status_label(status)
            ))
            .into());
        }
        if status == BoardStatus::Done {
            let _ = gh_status(&["issue", "close", &number, "--repo", &repo]);
        }
        Ok(())
    }

    fn add_pull_request_to_item(&self, item_id: &str, pr_url: &str) -> Result<()> {
        let (repo, number) = split_item_id(item_id)?;
        gh_output(&[
            "issue",
            "comment",
            &number,
            "--repo",
            &repo,
            "--body",
            &format!("Pull request: {pr_url}"),
        ])?;
        Ok(())
    }

    fn set_pull_request_to_item(&self, item_id: &str, pr_url: &str) -> Result<()> {
        self.add_pull_request_to_item(item_id, pr_url)
    }

    fn get_repository_default_branch(&self, repository_id: &str) -> Result<String> {
        gh_output(&[
            "repo",
            "view",
            repository_id,
            "--json",
            "defaultBranchRef",
            "-q",
            ".defaultBranchRef.name",
        ])
    }
}

/// Item ids are `owner/repo#number`, produced by `parse_issue_items`.
fn split_item_id(item_id: &str) -> Result<(String, String)> {
    item_id
        .split_once('#')
        .map(|(repo, number)| (repo.to_string(), number.to_string()))
        .ok_or_else(|| {
            OrchestratorError::ConsistencyMismatch(format!(
                "board item id '{item_id}' is not owner/repo#number"
            ))
            .into()
        })
}

fn parse_issue_items(raw: &str, board_id: &str) -> Result<Vec<BoardItem>> {
    if raw.is_empty() {
        return Ok(vec![]);
    }
    let parsed: serde_json::Value =
        serde_json::from_str(raw).context("parsing gh issue list output")?;
    let mut items = Vec::new();
    for issue in parsed.as_array().into_iter().flatten() {
        let Some(number) = issue["number"].as_u64() else {
            continue;
        };
        let labels: Vec<String> = issue["labels"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|l| l["name"].as_str().map(str::to_string))
            .collect();
        let status = STATUS_LABELS
            .iter()
            .find(|(_, label)| labels.iter().any(|l| l == label))
            .map(|(status, _)| *status)
            .unwrap_or(BoardStatus::Todo);

        items.push(BoardItem {
            id: format!("{board_id}#{number}"),
            title: issue["title"].as_str().unwrap_or("").to_string(),
            description: issue["body"].as_str().unwrap_or("").to_string(),
            status,
            labels,
            pull_request_urls: vec![],
            content_type: Some(ContentType::Issue),
            content_number: Some(number),
            repository: Some(board_id.to_string()),
        });
    }
    Ok(items)
}

// ── Pull-request adapter ──────────────────────────────────────────────────────

pub struct GhPullRequests;

impl GhPullRequests {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl PullRequestPort for GhPullRequests {
    fn get_pull_request(&self, url: &str) -> Result<PullRequestInfo> {
        let raw = gh_output(&[
            "pr",
            "view",
            url,
            "--json",
            "number,title,url,state,reviewDecision,mergedAt",
        ])?;
        let parsed: serde_json::Value =
            serde_json::from_str(&raw).context("parsing gh pr view output")?;
        Ok(PullRequestInfo {
            url: parsed["url"].as_str().unwrap_or(url).to_string(),
            number: parsed["number"].as_u64().unwrap_or(0),
            repository_id: repository_from_pr_url(url).unwrap_or_default(),
            title: parsed["title"].as_str().unwrap_or("").to_string(),
            review_state: review_state_from(&parsed),
        })
    }

    fn get_comments(&self, url: &str, since: Option<DateTime<Utc>>) -> Result<Vec<ReviewComment>> {
        let raw = gh_output(&["pr", "view", url, "--json", "comments,reviews"])?;
        let parsed: serde_json::Value =
            serde_json::from_str(&raw).context("parsing gh pr comments")?;
        Ok(parse_comments(&parsed, since))
    }

    fn is_approved(&self, repository_id: &str, pr_number: u64) -> Result<bool> {
        let raw = gh_output(&[
            "pr",
            "view",
            &pr_number.to_string(),
            "--repo",
            repository_id,
            "--json",
            "reviewDecision",
            "-q",
            ".reviewDecision",
        ])?;
        Ok(raw == "APPROVED")
    }

    fn get_review_state(&self, url: &str) -> Result<ReviewState> {
        let raw = gh_output(&[
            "pr",
            "view",
            url,
            "--json",
            "state,reviewDecision,mergedAt",
        ])?;
        let parsed: serde_json::Value =
            serde_json::from_str(&raw).context("parsing gh pr state")?;
        Ok(review_state_from(&parsed))
    }

    /// Squash-merge through the provider. Falls back to the agent (returns
    /// false) when the provider refuses, e.g. failing checks or missing
    /// permissions.
    fn request_merge(&self, url: &str) -> Result<bool> {
        if gh_status(&["pr", "merge", url, "--squash", "--delete-branch"]) {
            return Ok(true);
        }
        log::info!("provider merge of {url} refused; leaving the merge to the agent");
        Ok(false)
    }
}

fn review_state_from(parsed: &serde_json::Value) -> ReviewState {
    if parsed["mergedAt"].as_str().is_some_and(|s| !s.is_empty()) {
        return ReviewState::Merged;
    }
    match parsed["state"].as_str() {
        Some("MERGED") => return ReviewState::Merged,
        Some("CLOSED") => return ReviewState::Closed,
        _ => {}
    }
    match parsed["reviewDecision"].as_str() {
        Some("APPROVED") => ReviewState::Approved,
        Some("CHANGES_REQUESTED") => ReviewState::ChangesRequested,
        _ => ReviewState::Pending,
    }
}

fn parse_comments(parsed: &serde_json::Value, since: Option<DateTime<Utc>>) -> Vec<ReviewComment> {
    let mut comments = Vec::new();

    // Plain PR comments plus review bodies; both carry actionable feedback.
    let plain = parsed["comments"].as_array().into_iter().flatten();
    let reviews = parsed["reviews"].as_array().into_iter().flatten();
    for (kind, value) in plain
        .map(|v| ("comment", v))
        .chain(reviews.map(|v| ("review", v)))
    {
        let body = value["body"].as_str().unwrap_or("");
        if body.is_empty() {
            continue;
        }
        let created_at = value["createdAt"]
            .as_str()
            .or_else(|| value["submittedAt"].as_str())
            .and_then(|s| s.parse::<DateTime<Utc>>().ok());
        let Some(created_at) = created_at else {
            continue;
        };
        if let Some(since) = since {
            if created_at <= since {
                continue;
            }
        }
        let id = value["id"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| format!("{kind}-{}", created_at.timestamp()));
        comments.push(ReviewComment {
            id,
            author: value["author"]["login"].as_str().unwrap_or("unknown").to_string(),
            content: body.to_string(),
            created_at,
        });
    }

    comments.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    comments
}
