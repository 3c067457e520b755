//! Error taxonomy shared across the orchestrator.
//!
//! These are kinds, not component-specific types: every component maps its
//! failures onto one of these so that the router and planner can decide
//! between retry, recovery, and escalation without string matching.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// A required port, path, or credential is missing. Fatal for the
    /// supervisor; the process exits.
    #[error("initialization failed: {0}")]
    InitializationFailed(String),

    /// Operation invoked before initialization, or on a component that
    /// cannot accept it in its current state. Caller bug; surfaced as a
    /// rejection rather than a crash.
    #[error("not available: {0}")]
    NotAvailable(String),

    /// Wall-clock exceeded in an agent, git, or provider call.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    /// The agent returned non-zero or produced output we could not act on.
    #[error("execution failed{}: {stderr}", exit_label(.exit_code))]
    ExecutionFailed {
        exit_code: Option<i32>,
        stderr: String,
    },

    /// The agent subprocess died from a signal or vanished unexpectedly.
    #[error("process crashed: {0}")]
    ProcessCrashed(String),

    /// Rate limit or network blip from a provider. Safe to retry next cycle.
    #[error("transient provider error: {0}")]
    ProviderTransient(String),

    /// Board state disagrees with internal state. The reconciler prefers
    /// board truth and corrects internal records.
    #[error("consistency mismatch: {0}")]
    ConsistencyMismatch(String),
}

impl OrchestratorError {
    /// Whether the failure is expected to clear on its own (retry next cycle
    /// without escalating the task).
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ProviderTransient(_) | Self::Timeout { .. })
    }

    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout,
        }
    }
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!(" (exit {c})"),
        None => String::new(),
    }
}

/// Extract the orchestrator error kind from an `anyhow` chain, if any.
pub fn kind_of(err: &anyhow::Error) -> Option<&OrchestratorError> {
    err.downcast_ref::<OrchestratorError>()
}
