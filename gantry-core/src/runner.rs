//! Invocation of the external coding-agent CLI.
//!
//! The agent runs as a child process in its own process group with the
//! prompt redirected from a temp file to stdin and both output streams
//! spooled to temp files. Argv is passed directly; no shell is involved.
//! On timeout the whole group gets SIGTERM, a short grace period, then
//! SIGKILL. Live children are tracked so shutdown can terminate them all.

use std::collections::HashSet;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use wait_timeout::ChildExt;

use crate::error::OrchestratorError;
use crate::model::ExecutionResult;
use crate::ports::DeveloperPort;

/// Gap between SIGTERM and SIGKILL when tearing an agent down.
pub const FORCE_KILL_TIMEOUT_MS: u64 = 5_000;

/// Timeout for the `--help` availability probe.
const AVAILABILITY_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct DeveloperRunner {
    /// Agent argv: program followed by fixed arguments.
    command: Vec<String>,
    timeout: Mutex<Duration>,
    /// Extra environment entries appended to (never replacing) the
    /// inherited environment.
    extra_env: Vec<(String, String)>,
    /// Pids of live agent children, for shutdown teardown.
    children: Mutex<HashSet<u32>>,
    initialized: AtomicBool,
}

impl DeveloperRunner {
    pub fn new(command: Vec<String>, timeout: Duration, extra_env: Vec<(String, String)>) -> Self {
        Self {
            command,
            timeout: Mutex::new(timeout),
            extra_env,
            children: Mutex::new(HashSet::new()),
            initialized: AtomicBool::new(false),
        }
    }

    fn program(&self) -> &str {
        self.command.first().map(String::as_str).unwrap_or("")
    }

    fn current_timeout(&self) -> Duration {
        *self.timeout.lock().expect("runner timeout poisoned")
    }

    fn register(&self, pid: u32) {
        self.children.lock().expect("children set poisoned").insert(pid);
    }

    fn unregister(&self, pid: u32) {
        self.children.lock().expect("children set poisoned").remove(&pid);
    }

    /// SIGTERM every live agent group, wait the force-kill gap, SIGKILL the
    /// survivors. Already-exited processes are not an error.
    pub fn terminate_all(&self) {
        let pids: Vec<u32> = self
            .children
            .lock()
            .expect("children set poisoned")
            .iter()
            .copied()
            .collect();
        if pids.is_empty() {
            return;
        }
        log::info!("terminating {} live agent process group(s)", pids.len());
        for &pid in &pids {
            signal_group(pid, TerminationSignal::Term);
        }
        std::thread::sleep(Duration::from_millis(FORCE_KILL_TIMEOUT_MS));
        for &pid in &pids {
            signal_group(pid, TerminationSignal::Kill);
        }
        self.children.lock().expect("children set poisoned").clear();
    }
}

impl DeveloperPort for DeveloperRunner {
    fn initialize(&self) -> Result<()> {
        if self.command.is_empty() {
            return Err(OrchestratorError::InitializationFailed(
                "developer command is empty".to_string(),
            )
            .into());
        }
        if !self.is_available() {
            return Err(OrchestratorError::InitializationFailed(format!(
                "agent CLI '{}' is not available",
                self.program()
            ))
            .into());
        }
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn execute(&self, prompt: &str, workspace_dir: &Path) -> Result<ExecutionResult> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(
                OrchestratorError::NotAvailable("developer runner not initialized".into()).into(),
            );
        }

        // Prompt goes through a temp file so arbitrary content never hits a
        // command line. The file is deleted when this binding drops, on
        // every exit path below.
        let mut prompt_file =
            tempfile::NamedTempFile::new().context("creating prompt temp file")?;
        prompt_file
            .write_all(prompt.as_bytes())
            .context("writing prompt temp file")?;
        prompt_file.flush()?;

        let mut stdout_spool = tempfile::tempfile().context("creating stdout spool")?;
        let mut stderr_spool = tempfile::tempfile().context("creating stderr spool")?;

        let mut cmd = Command::new(self.program());
        cmd.args(&self.command[1..])
            .current_dir(workspace_dir)
            .stdin(Stdio::from(File::open(prompt_file.path())?))
            .stdout(Stdio::from(stdout_spool.try_clone()?))
            .stderr(Stdio::from(stderr_spool.try_clone()?))
            .envs(self.extra_env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let mut child = cmd.spawn().map_err(|e| {
            OrchestratorError::NotAvailable(format!(
                "failed to spawn agent '{}': {e}",
                self.program()
            ))
        })?;
        let pid = child.id();
        self.register(pid);

        let timeout = self.current_timeout();
        let status = match child.wait_timeout(timeout) {
            Ok(Some(status)) => status,
            Ok(None) => {
                log::warn!("agent timed out after {timeout:?}, terminating group {pid}");
                signal_group(pid, TerminationSignal::Term);
                let killed = child
                    .wait_timeout(Duration::from_millis(FORCE_KILL_TIMEOUT_MS))
                    .unwrap_or(None);
                if killed.is_none() {
                    signal_group(pid, TerminationSignal::Kill);
                    let _ = child.wait();
                }
                self.unregister(pid);
                return Err(
                    OrchestratorError::timeout("agent execution", timeout).into()
                );
            }
            Err(e) => {
                self.unregister(pid);
                let _ = child.kill();
                let _ = child.wait();
                return Err(OrchestratorError::ProcessCrashed(format!(
                    "waiting on agent: {e}"
                ))
                .into());
            }
        };
        self.unregister(pid);

        let mut raw_output = String::new();
        stdout_spool.seek(SeekFrom::Start(0))?;
        stdout_spool.read_to_string(&mut raw_output)?;
        let mut stderr = String::new();
        stderr_spool.seek(SeekFrom::Start(0))?;
        stderr_spool.read_to_string(&mut stderr)?;

        match status.code() {
            Some(0) => Ok(ExecutionResult {
                raw_output,
                stderr,
                exit_code: 0,
            }),
            Some(code) => Err(OrchestratorError::ExecutionFailed {
                exit_code: Some(code),
                stderr: stderr.trim().to_string(),
            }
            .into()),
            // Killed by a signal.
            None => Err(OrchestratorError::ProcessCrashed(format!(
                "agent exited on signal ({status}); stderr: {}",
                stderr.trim()
            ))
            .into()),
        }
    }

    fn cleanup(&self) -> Result<()> {
        self.terminate_all();
        self.initialized.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_available(&self) -> bool {
        let program = self.program();
        if program.is_empty() {
            return false;
        }

        // Short --help probe first; a binary that exists but misbehaves
        // still counts via the path lookup fallback.
        let probe = Command::new(program)
            .arg("--help")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        if let Ok(mut child) = probe {
            match child.wait_timeout(AVAILABILITY_PROBE_TIMEOUT) {
                Ok(Some(status)) if status.success() => return true,
                Ok(Some(_)) => {}
                _ => {
                    let _ = child.kill();
                    let _ = child.wait();
                }
            }
        }

        which::which(program).is_ok()
    }

    fn set_timeout(&self, timeout: Duration) {
        *self.timeout.lock().expect("runner timeout poisoned") = timeout;
    }
}

#[derive(Clone, Copy)]
enum TerminationSignal {
    Term,
    Kill,
}

/// Signal the whole process group; falls back to the single pid where
/// process groups are unsupported. A vanished process is not an error.
#[cfg(unix)]
fn signal_group(pid: u32, signal: TerminationSignal) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let sig = match signal {
        TerminationSignal::Term => Signal::SIGTERM,
        TerminationSignal::Kill => Signal::SIGKILL,
    };
    let _ = killpg(Pid::from_raw(pid as i32), sig);
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _signal: TerminationSignal) {}
