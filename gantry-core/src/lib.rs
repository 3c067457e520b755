//! Core library for gantry: a closed-loop scheduler that polls a project
//! board, dispatches work items to pooled workers, runs an external coding
//! agent in per-task git worktrees, shepherds the resulting pull requests
//! through review, and merges them on approval.
//!
//! The crate is organized around five ports ([`ports`]): project board,
//! pull requests, git, the developer agent, and durable state. Everything
//! else is the scheduling core: [`planner`] reconciles board state each
//! cycle, [`router`] maps task requests onto the [`pool`] of [`worker`]s,
//! and [`supervisor`] owns startup and teardown.

pub mod config;
pub mod error;
pub mod git_cli;
pub mod gitlock;
pub mod model;
pub mod parser;
pub mod planner;
pub mod pool;
pub mod ports;
pub mod prompt;
pub mod repo_cache;
pub mod router;
pub mod runner;
pub mod shutdown;
pub mod store;
pub mod supervisor;
pub mod worker;
pub mod workspace;

pub use config::GantryConfig;
pub use error::OrchestratorError;
pub use supervisor::{Supervisor, SupervisorPorts, SystemStatus};
