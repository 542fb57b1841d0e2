#![allow(unsafe_code, clippy::undocumented_unsafe_blocks)]
//! SIGTERM arrives while `kill_all` waits for a deployment that ignores
//! SIGINT. The escalation never resumes, so the bridge has to kill that
//! deployment itself before the process dies.

mod common;

use common::{
    assert_gone, assert_killed_by, fork_supervisor, read_pid, wait_for_exit, wait_for_file,
};
use overseer_core::mock::ScriptedReadiness;
use overseer_core::{install_global, CommandDeployment, FixedBundle, Supervisor, SupervisorConfig};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn run_child(marker: &Path, pid_file: &Path) -> Result<(), String> {
    let config = SupervisorConfig {
        wait_cycles: 1000,
        wait_interval_ms: 10,
        ..SupervisorConfig::default()
    };
    let sup = Supervisor::with_config(
        ScriptedReadiness::new(),
        FixedBundle::new("/nonexistent"),
        config,
    );
    let sup = install_global(sup).map_err(|e| e.to_string())?;

    let script = "trap '' INT; touch \"$0\"; exec sleep 60";
    let marker_arg = marker.display().to_string();
    let dpl =
        CommandDeployment::new("holdout", "sh").with_args(["-c", script, marker_arg.as_str()]);
    let handle = sup.spawn(Arc::new(dpl), false).map_err(|e| e.to_string())?;

    let deadline = Instant::now() + Duration::from_secs(10);
    while !marker.exists() {
        if Instant::now() > deadline {
            return Err("holdout never installed its trap".to_owned());
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    std::fs::write(pid_file, handle.pid().to_string()).map_err(|e| e.to_string())?;

    sup.kill_all();
    Ok(())
}

#[test]
fn sigterm_during_kill_all_kills_what_it_was_stopping() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("trapped");
    let pid_file = dir.path().join("holdout.pid");

    // Exit code 3: kill_all ran to completion, SIGTERM never arrived.
    let child = unsafe { fork_supervisor(3, || run_child(&marker, &pid_file)) };
    wait_for_file(&pid_file);
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(unsafe { libc::kill(child, libc::SIGTERM) }, 0);

    assert_killed_by(wait_for_exit(child), libc::SIGTERM);
    assert_gone(read_pid(&pid_file));
}
