//! The process-wide supervisor the signal bridge cleans up through.

use crate::bundle::EnvBundle;
use crate::config::SupervisorConfig;
use crate::readiness::MarkerDirectory;
use crate::shutdown::install_handlers;
use crate::supervisor::Supervisor;
use crate::CoreError;
use std::sync::{Mutex, OnceLock, PoisonError};
use tracing::info;

static SUPERVISOR: OnceLock<Supervisor> = OnceLock::new();
static INIT: Mutex<()> = Mutex::new(());

/// The process-wide supervisor, created on first use from the user config
/// (`~/.config/overseer/overseer.toml`) with a marker-file readiness directory
/// and the environment log bundle. Creating it connects the readiness
/// directory and installs the shutdown signal bridge.
pub fn global() -> Result<&'static Supervisor, CoreError> {
    if let Some(supervisor) = SUPERVISOR.get() {
        return Ok(supervisor);
    }
    let _guard = INIT.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(supervisor) = SUPERVISOR.get() {
        return Ok(supervisor);
    }

    let config = SupervisorConfig::load_default()?;
    let readiness = MarkerDirectory::new(config.registry_dir.clone());
    publish(Supervisor::with_config(readiness, EnvBundle, config))
}

/// Make `supervisor` the process-wide instance. Fails with
/// `AlreadyInitialized` once any instance exists.
pub fn install_global(supervisor: Supervisor) -> Result<&'static Supervisor, CoreError> {
    let _guard = INIT.lock().unwrap_or_else(PoisonError::into_inner);
    if SUPERVISOR.get().is_some() {
        return Err(CoreError::AlreadyInitialized);
    }
    publish(supervisor)
}

/// The process-wide instance if one was created. Never initializes.
pub fn try_global() -> Option<&'static Supervisor> {
    SUPERVISOR.get()
}

fn publish(supervisor: Supervisor) -> Result<&'static Supervisor, CoreError> {
    supervisor.connect()?;
    let supervisor = SUPERVISOR.get_or_init(|| supervisor);
    install_handlers()?;
    info!("process-wide supervisor ready");
    Ok(supervisor)
}
