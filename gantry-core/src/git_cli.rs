//! GitPort adapter over the `git` binary.
//!
//! Subprocess calls with a wall-clock timeout and captured stderr, so a
//! wedged remote cannot hang the orchestrator. Callers serialize mutating
//! operations per repository through the git lock; this adapter only runs
//! the commands.

use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::Result;
use wait_timeout::ChildExt;

use crate::error::OrchestratorError;
use crate::ports::GitPort;

pub struct GitCli {
    timeout: Duration,
}

impl GitCli {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Run `git` with `args`, enforcing the operation timeout. Returns
    /// captured stdout; failure carries the exit code and stderr.
    fn run(&self, args: &[&str]) -> Result<String> {
        let mut stdout_spool = tempfile::tempfile()?;
        let mut stderr_spool = tempfile::tempfile()?;

        let mut child = Command::new("git")
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout_spool.try_clone()?))
            .stderr(Stdio::from(stderr_spool.try_clone()?))
            .spawn()
            .map_err(|e| OrchestratorError::NotAvailable(format!("failed to run git: {e}")))?;

        let status = match child.wait_timeout(self.timeout) {
            Ok(Some(status)) => status,
            Ok(None) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(OrchestratorError::timeout(
                    format!("git {}", args.first().copied().unwrap_or("")),
                    self.timeout,
                )
                .into());
            }
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(
                    OrchestratorError::ProcessCrashed(format!("waiting on git: {e}")).into(),
                );
            }
        };

        let mut stdout = String::new();
        stdout_spool.seek(SeekFrom::Start(0))?;
        stdout_spool.read_to_string(&mut stdout)?;

        if !status.success() {
            let mut stderr = String::new();
            stderr_spool.seek(SeekFrom::Start(0))?;
            stderr_spool.read_to_string(&mut stderr)?;
            anyhow::bail!(
                "git {} failed ({}): {}",
                args.join(" "),
                status,
                stderr.trim()
            );
        }
        Ok(stdout)
    }

    fn run_quiet(&self, args: &[&str]) -> bool {
        self.run(args).is_ok()
    }

    /// Whether a usable `git` binary is on the PATH.
    pub fn is_available(&self) -> bool {
        which::which("git").is_ok() && self.run_quiet(&["--version"])
    }
}

impl GitPort for GitCli {
    fn clone_repository(&self, url: &str, local_path: &Path, depth: Option<u32>) -> Result<()> {
        let path = local_path.display().to_string();
        let depth_arg;
        let mut args = vec!["clone"];
        if let Some(depth) = depth {
            depth_arg = format!("--depth={depth}");
            args.push(&depth_arg);
        }
        args.push(url);
        args.push(&path);
        self.run(&args)?;
        Ok(())
    }

    fn fetch(&self, local_path: &Path) -> Result<()> {
        let path = local_path.display().to_string();
        self.run(&["-C", &path, "fetch", "--all", "--prune"])?;
        Ok(())
    }

    fn pull_main_branch(&self, local_path: &Path) -> Result<()> {
        let path = local_path.display().to_string();
        self.run(&["-C", &path, "pull", "--ff-only"])?;
        Ok(())
    }

    fn create_worktree(
        &self,
        repo_path: &Path,
        branch: &str,
        worktree_path: &Path,
        base_branch: Option<&str>,
    ) -> Result<()> {
        let repo = repo_path.display().to_string();
        let target = worktree_path.display().to_string();
        // -B reuses the branch when it already exists, which is exactly the
        // recreate-after-validation-failure path.
        let mut args = vec!["-C", &repo, "worktree", "add", "-B", branch, &target];
        if let Some(base) = base_branch {
            args.push(base);
        }
        self.run(&args)?;
        Ok(())
    }

    fn remove_worktree(&self, repo_path: &Path, worktree_path: &Path) -> Result<()> {
        let repo = repo_path.display().to_string();
        let target = worktree_path.display().to_string();
        let result = self.run(&["-C", &repo, "worktree", "remove", "--force", &target]);
        if result.is_err() {
            // Drop stale administrative entries so the next add succeeds.
            let _ = self.run(&["-C", &repo, "worktree", "prune"]);
        }
        result.map(|_| ())
    }

    fn is_valid_repository(&self, path: &Path) -> bool {
        if !path.is_dir() {
            return false;
        }
        let repo = path.display().to_string();
        self.run_quiet(&["-C", &repo, "rev-parse", "--git-dir"])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn git_available() -> bool {
        which::which("git").is_ok()
    }

    /// Init a repository with one commit on `main`.
    fn init_repo(path: &Path) {
        let run = |args: &[&str]| {
            let status = Command::new("git")
                .args(args)
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .unwrap();
            assert!(status.success(), "git {args:?} failed");
        };
        let repo = path.display().to_string();
        run(&["init", "-b", "main", &repo]);
        std::fs::write(path.join("README.md"), "seed\n").unwrap();
        run(&["-C", &repo, "add", "."]);
        run(&[
            "-C",
            &repo,
            "-c",
            "user.name=gantry-test",
            "-c",
            "user.email=gantry@test",
            "commit",
            "-m",
            "seed",
        ]);
    }

    #[test]
    fn plain_directory_is_not_a_repository() {
        if !git_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let git = GitCli::new(Duration::from_secs(30));
        assert!(!git.is_valid_repository(dir.path()));
        assert!(!git.is_valid_repository(&dir.path().join("missing")));
    }

    #[test]
    fn clone_fetch_and_validate() {
        if !git_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let upstream = dir.path().join("upstream");
        init_repo(&upstream);

        let git = GitCli::new(Duration::from_secs(30));
        let clone_path = dir.path().join("clone");
        git.clone_repository(&upstream.display().to_string(), &clone_path, None)
            .unwrap();
        assert!(git.is_valid_repository(&clone_path));
        git.fetch(&clone_path).unwrap();
        git.pull_main_branch(&clone_path).unwrap();
    }

    #[test]
    fn clone_from_bad_url_fails() {
        if !git_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let git = GitCli::new(Duration::from_secs(30));
        let result = git.clone_repository(
            &dir.path().join("no-such-upstream").display().to_string(),
            &dir.path().join("clone"),
            Some(1),
        );
        assert!(result.is_err());
    }

    #[test]
    fn worktree_add_and_remove_round_trip() {
        if !git_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let upstream = dir.path().join("upstream");
        init_repo(&upstream);

        let git = GitCli::new(Duration::from_secs(30));
        let clone_path = dir.path().join("clone");
        git.clone_repository(&upstream.display().to_string(), &clone_path, None)
            .unwrap();

        let worktree = dir.path().join("wt-issue-1");
        git.create_worktree(&clone_path, "issue-1", &worktree, Some("main"))
            .unwrap();
        assert!(worktree.join(".git").exists());
        assert!(worktree.join("README.md").exists());

        git.remove_worktree(&clone_path, &worktree).unwrap();
        assert!(!worktree.exists());

        // Same branch again: -B makes recreation idempotent.
        git.create_worktree(&clone_path, "issue-1", &worktree, Some("main"))
            .unwrap();
        assert!(worktree.join(".git").exists());
    }
}
