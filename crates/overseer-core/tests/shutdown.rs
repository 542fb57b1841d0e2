#![allow(unsafe_code, clippy::undocumented_unsafe_blocks)]
//! The child installs a process-wide supervisor, spawns a long-running
//! deployment and sends itself SIGTERM. The bridge must stop the deployment
//! and the child must still die from SIGTERM afterwards.

mod common;

use common::{assert_gone, assert_killed_by, fork_supervisor, read_pid, wait_for_exit};
use overseer_core::mock::ScriptedReadiness;
use overseer_core::{install_global, CommandDeployment, FixedBundle, Supervisor, SupervisorConfig};
use std::path::Path;
use std::sync::Arc;

fn run_child(pid_file: &Path) -> Result<(), String> {
    let config = SupervisorConfig {
        wait_cycles: 200,
        wait_interval_ms: 10,
        ..SupervisorConfig::default()
    };
    let sup = Supervisor::with_config(
        ScriptedReadiness::new(),
        FixedBundle::new("/nonexistent"),
        config,
    );
    let sup = install_global(sup).map_err(|e| e.to_string())?;
    let dpl = CommandDeployment::new("sleeper", "sleep").with_args(["30"]);
    let handle = sup.spawn(Arc::new(dpl), false).map_err(|e| e.to_string())?;
    std::fs::write(pid_file, handle.pid().to_string()).map_err(|e| e.to_string())?;

    unsafe { libc::raise(libc::SIGTERM) };
    Ok(())
}

#[test]
fn sigterm_stops_deployments_then_terminates() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("sleeper.pid");

    // Exit code 2: still alive after SIGTERM, the bridge did not re-raise.
    let child = unsafe { fork_supervisor(2, || run_child(&pid_file)) };
    assert_killed_by(wait_for_exit(child), libc::SIGTERM);
    assert_gone(read_pid(&pid_file));
}
