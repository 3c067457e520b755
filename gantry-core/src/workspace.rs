//! Per-task workspaces: a git worktree plus a task instruction file.
//!
//! The workspace directory is named `<owner>_<repo>_<branch>` under the
//! workspace root and is owned by exactly one worker at a time. Worktree
//! state is never trusted blindly: `worktree_created` is re-validated
//! against the filesystem on every setup and the worktree is recreated when
//! the check fails.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;

use crate::gitlock::GitLock;
use crate::model::{BoardItem, ContentType, Task, TaskId, WorkspaceInfo};
use crate::ports::{GitPort, ProjectBoardPort, StatePort};
use crate::repo_cache::RepositoryCache;

/// Fixed name of the task instruction file inside each workspace.
pub const INSTRUCTION_FILE_NAME: &str = "AGENT_TASK.md";

/// Branch names derived from a raw task id are cut to this many characters.
const TASK_ID_BRANCH_LIMIT: usize = 20;

pub struct WorkspaceManager {
    workspace_root: PathBuf,
    repo_cache: Arc<RepositoryCache>,
    git: Arc<dyn GitPort>,
    locks: Arc<GitLock>,
    board: Arc<dyn ProjectBoardPort>,
    state: Arc<dyn StatePort>,
}

impl WorkspaceManager {
    pub fn new(
        workspace_root: PathBuf,
        repo_cache: Arc<RepositoryCache>,
        git: Arc<dyn GitPort>,
        locks: Arc<GitLock>,
        board: Arc<dyn ProjectBoardPort>,
        state: Arc<dyn StatePort>,
    ) -> Self {
        Self {
            workspace_root,
            repo_cache,
            git,
            locks,
            board,
            state,
        }
    }

    /// Create (or re-open) the workspace for a task and persist its record.
    pub fn create_workspace(
        &self,
        task_id: &TaskId,
        repository_id: &str,
        board_item: Option<&BoardItem>,
    ) -> Result<WorkspaceInfo> {
        if task_id.is_empty() {
            bail!("task id must not be empty");
        }
        if repository_id.is_empty() {
            bail!("repository id must not be empty");
        }

        if let Some(existing) = self.state.get_workspace(task_id)? {
            fs::create_dir_all(&existing.workspace_dir)?;
            return Ok(existing);
        }

        let branch_name = branch_name(task_id, board_item);
        let dir_name = format!("{}_{}", repository_id.replace('/', "_"), branch_name);
        let workspace_dir = self.workspace_root.join(dir_name);
        fs::create_dir_all(&workspace_dir)
            .with_context(|| format!("creating workspace dir {}", workspace_dir.display()))?;

        let info = WorkspaceInfo {
            task_id: task_id.clone(),
            repository_id: repository_id.to_string(),
            workspace_dir,
            branch_name,
            worktree_created: false,
            instruction_file_path: None,
            created_at: Utc::now(),
        };
        self.state.put_workspace(&info)?;
        Ok(info)
    }

    pub fn get_workspace_info(&self, task_id: &TaskId) -> Result<Option<WorkspaceInfo>> {
        self.state.get_workspace(task_id)
    }

    /// Ensure the workspace directory is a live worktree of the repository.
    ///
    /// A record claiming `worktree_created` whose directory no longer passes
    /// the filesystem check is recreated with a warning.
    pub fn setup_worktree(
        &self,
        info: &mut WorkspaceInfo,
        board_item: Option<&BoardItem>,
    ) -> Result<()> {
        let repo_path = self
            .repo_cache
            .ensure_repository(&info.repository_id, true)?;

        if info.worktree_created {
            if worktree_is_valid(&info.workspace_dir) {
                return Ok(());
            }
            log::warn!(
                "worktree for {} missing at {}, recreating",
                info.task_id,
                info.workspace_dir.display()
            );
            info.worktree_created = false;
            self.state.put_workspace(info)?;
        }

        let base_branch = self.resolve_base_branch(&info.repository_id, board_item);
        self.locks.with_lock(&info.repository_id, "create_worktree", || {
            self.git.create_worktree(
                &repo_path,
                &info.branch_name,
                &info.workspace_dir,
                Some(&base_branch),
            )
        })?;

        if !worktree_is_valid(&info.workspace_dir) {
            bail!(
                "worktree at {} failed validation after creation",
                info.workspace_dir.display()
            );
        }

        info.worktree_created = true;
        self.repo_cache
            .add_worktree(&info.repository_id, &info.workspace_dir);
        self.state.put_workspace(info)?;
        Ok(())
    }

    /// Write the task instruction file into the workspace, overwriting any
    /// previous content, and record its path.
    pub fn setup_instruction_file(&self, info: &mut WorkspaceInfo, task: &Task) -> Result<()> {
        let path = info.workspace_dir.join(INSTRUCTION_FILE_NAME);
        let content = instruction_file_content(info, task);
        fs::write(&path, content)
            .with_context(|| format!("writing instruction file {}", path.display()))?;

        info.instruction_file_path = Some(path);
        self.state.put_workspace(info)?;
        Ok(())
    }

    /// Tear the workspace down: remove the worktree, unregister it, delete
    /// the directory, and clear the record.
    ///
    /// Best-effort and idempotent: a failing step is logged and the
    /// remaining steps still run, so a second call converges to the same
    /// final state.
    pub fn cleanup_workspace(&self, task_id: &TaskId) -> Result<()> {
        let info = match self.state.get_workspace(task_id)? {
            Some(info) => info,
            None => return Ok(()),
        };

        if let Some(repo_state) = self.repo_cache.repository_state(&info.repository_id) {
            let removed = self.locks.with_lock(&info.repository_id, "remove_worktree", || {
                self.git
                    .remove_worktree(&repo_state.local_path, &info.workspace_dir)
            });
            if let Err(e) = removed {
                log::warn!("removing worktree for {task_id}: {e:#}");
            }
        }

        self.repo_cache
            .remove_worktree(&info.repository_id, &info.workspace_dir);

        if info.workspace_dir.exists() {
            if let Err(e) = fs::remove_dir_all(&info.workspace_dir) {
                log::warn!(
                    "deleting workspace dir {}: {e}",
                    info.workspace_dir.display()
                );
            }
        }

        if let Err(e) = self.state.delete_workspace(task_id) {
            log::warn!("deleting workspace record for {task_id}: {e:#}");
        }
        Ok(())
    }

    /// Base branch for new worktrees: `base:<name>` label, then the
    /// repository default from the board provider, then `main`.
    fn resolve_base_branch(&self, repository_id: &str, board_item: Option<&BoardItem>) -> String {
        if let Some(item) = board_item {
            if let Some(label) = item.labels.iter().find_map(|l| l.strip_prefix("base:")) {
                let label = label.trim();
                if !label.is_empty() {
                    return label.to_string();
                }
            }
        }
        match self.board.get_repository_default_branch(repository_id) {
            Ok(branch) if !branch.is_empty() => branch,
            Ok(_) => "main".to_string(),
            Err(e) => {
                log::debug!("default branch lookup failed for {repository_id}: {e:#}");
                "main".to_string()
            }
        }
    }
}

/// Derive the branch name for a task.
///
/// In order: content number with a type prefix, an issue reference scanned
/// out of the title, then the task id truncated to 20 characters.
pub fn branch_name(task_id: &TaskId, board_item: Option<&BoardItem>) -> String {
    if let Some(item) = board_item {
        if let Some(number) = item.content_number {
            let prefix = match item.content_type {
                Some(ContentType::PullRequest) => "pr",
                _ => "issue",
            };
            return format!("{prefix}-{number}");
        }
        if let Some(number) = scan_issue_reference(&item.title) {
            return format!("issue-{number}");
        }
    }
    task_id.as_str().chars().take(TASK_ID_BRANCH_LIMIT).collect()
}

/// First `#<digits>` reference in a title, if any.
fn scan_issue_reference(title: &str) -> Option<u64> {
    for (i, c) in title.char_indices() {
        if c == '#' {
            let digits: String = title[i + 1..]
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect();
            if !digits.is_empty() {
                return digits.parse().ok();
            }
        }
    }
    None
}

/// A directory is a live worktree when it exists and carries a `.git`
/// marker (a file for worktrees, a directory for plain checkouts).
fn worktree_is_valid(workspace_dir: &Path) -> bool {
    workspace_dir.is_dir() && workspace_dir.join(".git").exists()
}

fn instruction_file_content(info: &WorkspaceInfo, task: &Task) -> String {
    let mut out = String::new();
    out.push_str(&format!("# Task {}\n\n", task.task_id));
    out.push_str(&format!("Repository: {}\n", info.repository_id));
    out.push_str(&format!("Branch: {}\n\n", info.branch_name));

    if let Some(item) = &task.board_item {
        out.push_str(&format!("## {}\n\n", item.title));
        if !item.description.is_empty() {
            out.push_str(&item.description);
            out.push_str("\n\n");
        }
        let requirements = extract_requirements(&item.description);
        if !requirements.is_empty() {
            out.push_str("## Requirements\n\n");
            for req in requirements {
                out.push_str(&format!("- {req}\n"));
            }
            out.push('\n');
        }
    }

    out.push_str("## Testing\n\n");
    out.push_str("Run the project's existing test suite before committing. ");
    out.push_str("Add tests covering the change where the project has them.\n");
    out
}

/// Pull requirement bullets out of a free-form description.
pub fn extract_requirements(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter_map(|line| {
            line.strip_prefix("- ")
                .or_else(|| line.strip_prefix("* "))
                .or_else(|| {
                    let rest = line.trim_start_matches(|c: char| c.is_ascii_digit());
                    if rest.len() < line.len() {
                        rest.strip_prefix(". ").or_else(|| rest.strip_prefix(") "))
                    } else {
                        None
                    }
                })
        })
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
