//! Signal bridge: run `kill_all` on the process-wide supervisor when this
//! process is asked (or forced) to terminate, then let the signal proceed with
//! the disposition it had before the bridge was installed.
//!
//! The cleanup is best effort. It takes locks, sleeps and logs, none of which
//! is async-signal-safe; the registry is only touched through
//! `Supervisor::kill_all_from_signal`, which refuses to block when another
//! thread holds it.

use crate::instance::try_global;
use crate::CoreError;
use overseer_runtime::sys::{self, Disposition};
use std::os::raw::{c_int, c_void};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};
use tracing::{debug, warn};

/// Signals that trigger cleanup of all supervised deployments.
pub const SHUTDOWN_SIGNALS: [c_int; 5] = [
    libc::SIGINT,
    libc::SIGQUIT,
    libc::SIGABRT,
    libc::SIGSEGV,
    libc::SIGTERM,
];

static ORIGINAL_DISPOSITIONS: OnceLock<Vec<(c_int, Disposition)>> = OnceLock::new();
static INSTALL: Mutex<()> = Mutex::new(());
static HANDLING: AtomicBool = AtomicBool::new(false);

/// Install the bridge for every signal in `SHUTDOWN_SIGNALS`. Calling it again
/// is a no-op.
pub fn install_handlers() -> Result<(), CoreError> {
    let _guard = INSTALL.lock().unwrap_or_else(PoisonError::into_inner);
    if ORIGINAL_DISPOSITIONS.get().is_some() {
        return Ok(());
    }

    // Capture everything before installing anything, so the handler never
    // runs without a disposition to fall back to.
    let mut originals = Vec::with_capacity(SHUTDOWN_SIGNALS.len());
    for signal in SHUTDOWN_SIGNALS {
        let disposition = sys::current_disposition(signal).map_err(|e| {
            CoreError::Signal(format!("cannot query {}: {e}", sys::signal_name(signal)))
        })?;
        originals.push((signal, disposition));
    }
    let originals = ORIGINAL_DISPOSITIONS.get_or_init(|| originals);

    for (installed, &signal) in SHUTDOWN_SIGNALS.iter().enumerate() {
        if let Err(e) = sys::install_signal_action(signal, on_shutdown_signal) {
            for (signal, disposition) in &originals[..installed] {
                let _ = sys::restore_disposition(*signal, disposition);
            }
            return Err(CoreError::Signal(format!(
                "cannot install handler for {}: {e}",
                sys::signal_name(signal)
            )));
        }
    }

    debug!("shutdown handlers installed for {} signals", SHUTDOWN_SIGNALS.len());
    Ok(())
}

fn original_disposition(signal: c_int) -> Option<Disposition> {
    ORIGINAL_DISPOSITIONS
        .get()?
        .iter()
        .find(|(s, _)| *s == signal)
        .map(|(_, d)| *d)
}

extern "C" fn on_shutdown_signal(signal: c_int, _info: *mut libc::siginfo_t, _ctx: *mut c_void) {
    let nested = HANDLING.swap(true, Ordering::SeqCst);
    let fault = signal == libc::SIGSEGV || signal == libc::SIGABRT;

    // A fault raised by the cleanup itself skips straight to termination. Any
    // other nested request runs the cleanup again, which only has to finish
    // off what the interrupted one had detached.
    if !(nested && fault) {
        if let Some(supervisor) = try_global() {
            let _ = panic::catch_unwind(AssertUnwindSafe(|| {
                warn!("received {}, stopping all deployments", sys::signal_name(signal));
                if !supervisor.kill_all_from_signal() {
                    warn!("supervisor was busy, deployments left running");
                }
            }));
        }
    }

    let restored = match original_disposition(signal) {
        Some(disposition) => sys::restore_disposition(signal, &disposition),
        None => sys::reset_to_default(signal),
    };
    if restored.is_err() {
        sys::exit_immediately(128 + signal);
    }
    // Delivered once this handler returns, under the restored disposition.
    let _ = sys::raise(signal);

    // The process lives on if the original disposition ignores or handles
    // the signal; a later request must run the cleanup again.
    if !nested {
        HANDLING.store(false, Ordering::SeqCst);
    }
}
