//! Supervision engine for Overseer deployments.
//!
//! This crate ties the execution layer (`overseer-runtime`) to the outside
//! world: the `Supervisor` that tracks spawned deployments by name, polls a
//! `ReadinessDirectory` until every task registered, and tears deployments
//! down with SIGINT → SIGKILL escalation; the process-wide supervisor instance
//! and the signal bridge that runs `kill_all` on SIGINT, SIGQUIT, SIGABRT,
//! SIGSEGV and SIGTERM before letting the signal take its default course;
//! plus configuration, log-directory bundles and test doubles.

pub mod bundle;
pub mod config;
pub mod instance;
pub mod mock;
pub mod readiness;
pub mod shutdown;
pub mod supervisor;

pub use bundle::{Bundle, EnvBundle, FixedBundle};
pub use config::SupervisorConfig;
pub use instance::{global, install_global, try_global};
pub use readiness::{MarkerDirectory, ReadinessDirectory};
pub use shutdown::{install_handlers, SHUTDOWN_SIGNALS};
pub use supervisor::Supervisor;

pub use overseer_runtime::{
    CommandDeployment, Deployment, DeploymentResolver, DeploymentTable, ExecSpec, ProcessHandle,
    RuntimeError, Termination, WaitBudget,
};

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("a deployment with this name already exists: {0}")]
    DuplicateDeployment(String),
    #[error("deployment not found: {0}")]
    DeploymentNotFound(String),
    #[error("timed out after {timeout:?} waiting for tasks to register: {}", pending.join(", "))]
    ReadinessTimeout {
        pending: Vec<String>,
        timeout: Duration,
    },
    #[error("readiness directory unavailable: {0}")]
    Connect(String),
    #[error("signal handling error: {0}")]
    Signal(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("the process-wide supervisor is already initialized")]
    AlreadyInitialized,
}
