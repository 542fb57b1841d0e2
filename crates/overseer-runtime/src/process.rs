use crate::deployment::{Deployment, ExecSpec};
use crate::sys::{self, BlockedSignals, Fork, SignalMask, SHUTDOWN_REQUEST_SIGNALS};
use crate::RuntimeError;
use std::ffi::{CStr, CString};
use std::fmt;
use std::os::raw::{c_char, c_int};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Exit code of a forked child whose setup or `exec` failed.
pub const EXEC_FAILURE_EXIT_CODE: c_int = 127;

/// How long `ProcessHandle::wait` polls before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitBudget {
    pub cycles: u32,
    pub interval: Duration,
}

impl WaitBudget {
    pub const fn new(cycles: u32, interval: Duration) -> Self {
        Self { cycles, interval }
    }

    pub fn total(&self) -> Duration {
        self.interval * self.cycles
    }
}

impl Default for WaitBudget {
    /// 2000 polls 10ms apart: twenty seconds, enough for a graceful shutdown.
    fn default() -> Self {
        Self::new(2000, Duration::from_millis(10))
    }
}

/// How a reaped child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited(i32),
    Signaled(i32),
}

impl Termination {
    fn from_wait_status(status: c_int) -> Self {
        if libc::WIFSIGNALED(status) {
            Self::Signaled(libc::WTERMSIG(status))
        } else {
            Self::Exited(libc::WEXITSTATUS(status))
        }
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {code}"),
            Self::Signaled(signal) => {
                write!(f, "killed by {} ({signal})", sys::signal_name(*signal))
            }
        }
    }
}

/// One spawned deployment process. The process leads its own process group,
/// so signals reach everything it started.
pub struct ProcessHandle {
    pid: libc::pid_t,
    deployment: Arc<dyn Deployment>,
    reaped: AtomicBool,
    termination: OnceLock<Termination>,
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("deployment", &self.deployment.name())
            .field("reaped", &self.is_reaped())
            .field("termination", &self.termination.get())
            .finish()
    }
}

/// Everything the forked child needs, built before `fork` so the child never allocates.
struct ChildPlan {
    command: CString,
    _argv_storage: Vec<CString>,
    argv: Vec<*const c_char>,
    log_path: Option<Vec<u8>>,
    exec_failure: Vec<u8>,
}

impl ChildPlan {
    fn new(
        deployment: &dyn Deployment,
        spec: &ExecSpec,
        log_dir: Option<&Path>,
    ) -> Result<Self, RuntimeError> {
        let to_cstring = |value: &str| {
            CString::new(value).map_err(|_| RuntimeError::Resolution {
                deployment: deployment.name().to_owned(),
                reason: format!("argument contains a NUL byte: {value:?}"),
            })
        };

        let command = to_cstring(&spec.command)?;
        let mut argv_storage = Vec::with_capacity(spec.args.len() + 1);
        argv_storage.push(command.clone());
        for arg in &spec.args {
            argv_storage.push(to_cstring(arg)?);
        }
        let mut argv: Vec<*const c_char> = argv_storage.iter().map(|a| a.as_ptr()).collect();
        argv.push(std::ptr::null());

        let log_path = match log_dir {
            Some(dir) => {
                if !dir.is_dir() {
                    return Err(RuntimeError::LogDirMissing(dir.to_path_buf()));
                }
                let prefix = dir.join(format!("{}-", deployment.name()));
                let prefix = prefix.as_os_str().as_bytes();
                if prefix.contains(&0) {
                    return Err(RuntimeError::Resolution {
                        deployment: deployment.name().to_owned(),
                        reason: "log path contains a NUL byte".to_owned(),
                    });
                }
                // pid digits, ".txt" and the terminating NUL are appended in the child
                let mut path = Vec::with_capacity(prefix.len() + 32);
                path.extend_from_slice(prefix);
                Some(path)
            }
            None => None,
        };

        let exec_failure = format!(
            "overseer: start of '{}' for deployment '{}' failed, errno ",
            spec.command,
            deployment.name()
        )
        .into_bytes();

        Ok(Self {
            command,
            _argv_storage: argv_storage,
            argv,
            log_path,
            exec_failure,
        })
    }
}

impl ProcessHandle {
    /// Fork and exec `deployment`. With `log_dir` set, the child's stdout and
    /// stderr go to `<log_dir>/<name>-<pid>.txt`.
    ///
    /// Shutdown-request signals stay blocked from just before `fork` until the
    /// child's process group is in place, so a shutdown cannot observe a child
    /// that is not yet addressable through its group.
    pub fn spawn(
        deployment: Arc<dyn Deployment>,
        log_dir: Option<&Path>,
    ) -> Result<Self, RuntimeError> {
        let blocked = BlockedSignals::new(&SHUTDOWN_REQUEST_SIGNALS)
            .map_err(|e| RuntimeError::Setup(format!("could not block shutdown signals: {e}")))?;
        Self::spawn_blocked(deployment, log_dir, blocked.previous())
    }

    /// `spawn` for a caller that already blocked `SHUTDOWN_REQUEST_SIGNALS`
    /// and keeps them blocked until the handle is stored where the shutdown
    /// path can find it. `child_mask` is the mask from before that block; the
    /// child reinstalls it before exec.
    pub fn spawn_blocked(
        deployment: Arc<dyn Deployment>,
        log_dir: Option<&Path>,
        child_mask: &SignalMask,
    ) -> Result<Self, RuntimeError> {
        let spec = deployment.exec_spec()?;
        let mut plan = ChildPlan::new(deployment.as_ref(), &spec, log_dir)?;

        info!(
            "executing deployment '{}': {} {}",
            deployment.name(),
            spec.command,
            spec.args.join(" ")
        );

        // SAFETY: the child branch only runs `run_child`, which is restricted to
        // async-signal-safe calls on data prepared above and never returns.
        #[allow(unsafe_code)]
        let forked = unsafe { sys::fork() };

        let pid = match forked {
            Ok(Fork::Child) => run_child(&mut plan, child_mask),
            Ok(Fork::Parent(pid)) => pid,
            Err(e) => return Err(RuntimeError::Fork(e.to_string())),
        };

        // The child may already have exec'd, in which case EACCES tells us it
        // placed itself in its own group first.
        if let Err(e) = sys::set_process_group(pid, pid) {
            if e.raw_os_error() != Some(libc::EACCES) {
                let _ = sys::signal_process(pid, libc::SIGKILL);
                let _ = sys::reap(pid);
                return Err(RuntimeError::Fork(format!(
                    "could not move pid {pid} into its own process group: {e}"
                )));
            }
        }

        debug!("deployment '{}' started as pid {pid}", deployment.name());

        Ok(Self {
            pid,
            deployment,
            reaped: AtomicBool::new(false),
            termination: OnceLock::new(),
        })
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn pgid(&self) -> i32 {
        self.pid
    }

    pub fn name(&self) -> &str {
        self.deployment.name()
    }

    pub fn deployment(&self) -> &Arc<dyn Deployment> {
        &self.deployment
    }

    /// Set once the exit status was collected, by us or by someone else.
    pub fn is_reaped(&self) -> bool {
        self.reaped.load(Ordering::SeqCst)
    }

    /// Exit reason, if this handle reaped the process itself.
    pub fn termination(&self) -> Option<Termination> {
        self.termination.get().copied()
    }

    /// Non-blocking liveness probe that reaps the process once it exited.
    pub fn alive(&self) -> Result<bool, RuntimeError> {
        if self.is_reaped() {
            return Ok(false);
        }
        match sys::try_reap(self.pid) {
            Ok(None) => Ok(true),
            Ok(Some(status)) => {
                let termination = Termination::from_wait_status(status);
                let _ = self.termination.set(termination);
                self.reaped.store(true, Ordering::SeqCst);
                debug!("deployment '{}' (pid {}) {termination}", self.name(), self.pid);
                Ok(false)
            }
            Err(e) if e.raw_os_error() == Some(libc::ECHILD) => {
                self.reaped.store(true, Ordering::SeqCst);
                Ok(false)
            }
            Err(e) => Err(RuntimeError::Wait(format!("pid {}: {e}", self.pid))),
        }
    }

    /// Poll `alive()` until the process is gone. Returns false if it is still
    /// running once the budget is spent.
    pub fn wait(&self, budget: WaitBudget) -> Result<bool, RuntimeError> {
        let mut remaining = budget.cycles;
        while self.alive()? {
            if remaining == 0 {
                return Ok(false);
            }
            std::thread::sleep(budget.interval);
            remaining -= 1;
        }
        Ok(true)
    }

    pub fn wait_default(&self) -> Result<bool, RuntimeError> {
        self.wait(WaitBudget::default())
    }

    pub fn send_sigint(&self) {
        self.send_signal(libc::SIGINT);
    }

    pub fn send_sigterm(&self) {
        self.send_signal(libc::SIGTERM);
    }

    pub fn send_sigkill(&self) {
        self.send_signal(libc::SIGKILL);
    }

    /// Best-effort delivery to the process group; failures are only logged.
    fn send_signal(&self, signal: c_int) {
        let label = sys::signal_name(signal);
        if self.is_reaped() {
            debug!(
                "not sending {label} to deployment '{}': pid {} was already reaped",
                self.name(),
                self.pid
            );
            return;
        }
        match sys::signal_group(self.pid, signal) {
            Ok(()) => debug!("sent {label} to deployment '{}' (pgid {})", self.name(), self.pid),
            Err(e) if e.raw_os_error() == Some(libc::ESRCH) => {
                debug!("deployment '{}' (pgid {}) already exited", self.name(), self.pid);
            }
            Err(e) => warn!(
                "sending {label} to deployment '{}' (pgid {}) failed: {e}",
                self.name(),
                self.pid
            ),
        }
    }
}

/// Child side of `ProcessHandle::spawn`. Never returns.
fn run_child(plan: &mut ChildPlan, mask: &SignalMask) -> ! {
    if sys::set_process_group(0, 0).is_err() {
        sys::write_stderr(b"overseer: child could not create its own process group\n");
        sys::exit_immediately(EXEC_FAILURE_EXIT_CODE);
    }

    // Handlers installed by the parent must not run in the child, and the
    // blocked mask would otherwise survive exec.
    for signal in SHUTDOWN_REQUEST_SIGNALS.iter().chain(&[libc::SIGABRT, libc::SIGSEGV]) {
        if matches!(sys::current_disposition(*signal), Ok(d) if d.is_handler()) {
            let _ = sys::reset_to_default(*signal);
        }
    }
    if sys::restore_signal_mask(mask).is_err() {
        sys::write_stderr(b"overseer: child could not restore its signal mask\n");
        sys::exit_immediately(EXEC_FAILURE_EXIT_CODE);
    }

    if let Some(path) = plan.log_path.as_mut() {
        let mut digits = [0u8; 20];
        path.extend_from_slice(sys::format_decimal(i64::from(sys::current_pid()), &mut digits));
        path.extend_from_slice(b".txt\0");
        let redirected = CStr::from_bytes_with_nul(path)
            .ok()
            .is_some_and(|p| sys::redirect_output(p).is_ok());
        if !redirected {
            sys::write_stderr(b"overseer: could not redirect output to ");
            sys::write_stderr(&path[..path.len() - 1]);
            sys::write_stderr(b"\n");
        }
    }

    let err = sys::exec(&plan.command, &plan.argv);
    let mut digits = [0u8; 20];
    sys::write_stderr(&plan.exec_failure);
    sys::write_stderr(sys::format_decimal(
        i64::from(err.raw_os_error().unwrap_or(0)),
        &mut digits,
    ));
    sys::write_stderr(b"\n");
    sys::exit_immediately(EXEC_FAILURE_EXIT_CODE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CommandDeployment;

    fn fast() -> WaitBudget {
        WaitBudget::new(500, Duration::from_millis(10))
    }

    fn spawn(name: &str, command: &str, args: &[&str]) -> ProcessHandle {
        let dpl = CommandDeployment::new(name, command).with_args(args.iter().copied());
        ProcessHandle::spawn(Arc::new(dpl), None).unwrap()
    }

    #[test]
    fn default_budget_is_twenty_seconds() {
        assert_eq!(WaitBudget::default().total(), Duration::from_secs(20));
    }

    #[test]
    fn spawn_leaves_the_callers_mask_alone() {
        let handle = spawn("unmasked", "sleep", &["30"]);
        let mask = sys::current_signal_mask().unwrap();
        for signal in SHUTDOWN_REQUEST_SIGNALS {
            assert!(!mask.contains(signal), "{} left blocked", sys::signal_name(signal));
        }
        handle.send_sigkill();
        assert!(handle.wait(fast()).unwrap());
    }

    #[test]
    fn spawn_blocked_keeps_signals_blocked_but_not_in_the_child() {
        let blocked = BlockedSignals::new(&SHUTDOWN_REQUEST_SIGNALS).unwrap();
        let dpl = CommandDeployment::new("masked", "sleep").with_args(["30"]);
        let handle = ProcessHandle::spawn_blocked(Arc::new(dpl), None, blocked.previous()).unwrap();
        assert!(sys::current_signal_mask().unwrap().contains(libc::SIGTERM));
        drop(blocked);
        assert!(!sys::current_signal_mask().unwrap().contains(libc::SIGTERM));

        handle.send_sigterm();
        assert!(handle.wait(fast()).unwrap());
        assert_eq!(handle.termination(), Some(Termination::Signaled(libc::SIGTERM)));
    }

    #[test]
    fn child_leads_its_own_process_group() {
        let handle = spawn("pgroup", "sleep", &["30"]);
        #[allow(unsafe_code)]
        // SAFETY: getpgid has no memory-safety preconditions.
        let pgid = unsafe { libc::getpgid(handle.pid()) };
        assert_eq!(pgid, handle.pid());
        assert_eq!(handle.pgid(), handle.pid());
        handle.send_sigkill();
        assert!(handle.wait(fast()).unwrap());
    }

    #[test]
    fn alive_until_exit_then_false_forever() {
        let handle = spawn("short", "sleep", &["0.2"]);
        assert!(handle.alive().unwrap());
        assert!(handle.wait_default().unwrap());
        assert!(!handle.alive().unwrap());
        assert!(!handle.alive().unwrap());
        assert_eq!(handle.termination(), Some(Termination::Exited(0)));
    }

    #[test]
    fn exit_code_is_recorded() {
        let handle = spawn("exit3", "sh", &["-c", "exit 3"]);
        assert!(handle.wait(fast()).unwrap());
        assert_eq!(handle.termination(), Some(Termination::Exited(3)));
    }

    #[test]
    fn sigint_terminates_child() {
        let handle = spawn("interruptible", "sleep", &["30"]);
        handle.send_sigint();
        assert!(handle.wait(fast()).unwrap());
        assert_eq!(handle.termination(), Some(Termination::Signaled(libc::SIGINT)));
    }

    #[test]
    fn sigterm_terminates_child() {
        let handle = spawn("terminable", "sleep", &["30"]);
        handle.send_sigterm();
        assert!(handle.wait(fast()).unwrap());
        assert_eq!(handle.termination(), Some(Termination::Signaled(libc::SIGTERM)));
    }

    #[test]
    fn wait_gives_up_when_budget_is_spent() {
        let handle = spawn("stubborn", "sleep", &["30"]);
        assert!(!handle.wait(WaitBudget::new(3, Duration::from_millis(5))).unwrap());
        handle.send_sigkill();
        assert!(handle.wait(fast()).unwrap());
    }

    #[test]
    fn signaling_reaped_process_is_harmless() {
        let handle = spawn("gone", "true", &[]);
        assert!(handle.wait(fast()).unwrap());
        handle.send_sigint();
        handle.send_sigterm();
        handle.send_sigkill();
        assert!(!handle.alive().unwrap());
    }

    #[test]
    fn exec_failure_only_kills_the_child() {
        let handle = spawn("missing", "/nonexistent/overseer-test-binary", &[]);
        assert!(handle.wait(fast()).unwrap());
        assert_eq!(
            handle.termination(),
            Some(Termination::Exited(EXEC_FAILURE_EXIT_CODE))
        );
    }

    #[test]
    fn nul_byte_in_argument_is_a_resolution_error() {
        let dpl = CommandDeployment::new("nul", "echo").with_args(["a\0b"]);
        let err = ProcessHandle::spawn(Arc::new(dpl), None).unwrap_err();
        assert!(matches!(err, RuntimeError::Resolution { .. }));
    }

    #[test]
    fn missing_log_dir_fails_before_fork() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist");
        let dpl = CommandDeployment::new("logged", "true");
        let err = ProcessHandle::spawn(Arc::new(dpl), Some(&missing)).unwrap_err();
        match err {
            RuntimeError::LogDirMissing(path) => assert_eq!(path, missing),
            other => panic!("expected LogDirMissing, got {other:?}"),
        }
    }

    #[test]
    fn termination_display() {
        assert_eq!(Termination::Exited(0).to_string(), "exited with code 0");
        assert_eq!(
            Termination::Signaled(libc::SIGKILL).to_string(),
            "killed by SIGKILL (9)"
        );
    }
}
