//! Helpers for tests that run a supervisor in a forked child process.
//!
//! Installing the signal bridge is process-wide, so every such test forks and
//! lets the child own the global supervisor. Each test lives in its own file
//! so that the fork happens while the harness runs no other test threads.

#![allow(dead_code)]

use std::path::Path;
use std::time::{Duration, Instant};

/// How long a forked supervisor gets before the parent gives up on it.
pub const CHILD_DEADLINE: Duration = Duration::from_secs(20);

/// Fork and run `child_fn` in the child. `Ok` exits with `ok_code`, an error
/// is printed and exits with 1. Returns the child's pid in the parent.
///
/// # Safety
/// Uses `libc::fork()`. The calling test must be the only thread running in
/// the process.
pub unsafe fn fork_supervisor(
    ok_code: i32,
    child_fn: impl FnOnce() -> Result<(), String>,
) -> libc::pid_t {
    let pid = libc::fork();
    assert!(pid >= 0, "fork() failed");

    if pid == 0 {
        let code = match child_fn() {
            Ok(()) => ok_code,
            Err(e) => {
                eprintln!("supervisor child: {e}");
                1
            }
        };
        libc::_exit(code);
    }
    pid
}

/// Wait for `child` to terminate and return its raw wait status. SIGKILLs it
/// and panics once `CHILD_DEADLINE` passed.
pub fn wait_for_exit(child: libc::pid_t) -> i32 {
    let mut status = 0;
    let deadline = Instant::now() + CHILD_DEADLINE;
    loop {
        // SAFETY: `status` is a valid out-pointer for the duration of the call.
        let reaped = unsafe { libc::waitpid(child, &raw mut status, libc::WNOHANG) };
        assert!(reaped >= 0, "waitpid() failed");
        if reaped == child {
            return status;
        }
        if Instant::now() > deadline {
            // SAFETY: `child` is our own unreaped child.
            unsafe { libc::kill(child, libc::SIGKILL) };
            panic!("supervisor child did not exit");
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Assert that `status` reports death by `signal`.
pub fn assert_killed_by(status: i32, signal: i32) {
    assert!(
        libc::WIFSIGNALED(status),
        "child exited normally with code {}",
        libc::WEXITSTATUS(status)
    );
    assert_eq!(libc::WTERMSIG(status), signal);
}

/// Poll until `path` exists.
pub fn wait_for_file(path: &Path) {
    let deadline = Instant::now() + CHILD_DEADLINE;
    while !path.exists() {
        assert!(Instant::now() < deadline, "{} never appeared", path.display());
        std::thread::sleep(Duration::from_millis(10));
    }
}

pub fn read_pid(path: &Path) -> libc::pid_t {
    std::fs::read_to_string(path)
        .unwrap()
        .trim()
        .parse()
        .unwrap()
}

/// Assert that no process `pid` exists, zombies included.
pub fn assert_gone(pid: libc::pid_t) {
    // SAFETY: signal 0 only checks for existence.
    let ret = unsafe { libc::kill(pid, 0) };
    assert_eq!(ret, -1, "deployment pid {pid} survived its supervisor");
    assert_eq!(
        std::io::Error::last_os_error().raw_os_error(),
        Some(libc::ESRCH)
    );
}
