//! Execution layer for Overseer deployments.
//!
//! This crate owns everything that touches a single OS process: the
//! `Deployment` descriptor trait and its command-line resolution (`ExecSpec`),
//! `ProcessHandle` with its fork/exec discipline (process groups, signal
//! blocking around `fork`, output redirection), non-blocking reaping, bounded
//! waits and best-effort signal delivery, plus the thin `sys` wrappers around
//! the libc calls involved.

pub mod deployment;
pub mod process;
pub mod sys;

pub use deployment::{CommandDeployment, Deployment, DeploymentResolver, DeploymentTable, ExecSpec};
pub use process::{ProcessHandle, Termination, WaitBudget, EXEC_FAILURE_EXIT_CODE};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("could not resolve command line for deployment '{deployment}': {reason}")]
    Resolution { deployment: String, reason: String },
    #[error("log directory '{}' does not exist", .0.display())]
    LogDirMissing(PathBuf),
    #[error("signal setup failed: {0}")]
    Setup(String),
    #[error("fork failed: {0}")]
    Fork(String),
    #[error("waitpid failed: {0}")]
    Wait(String),
}
