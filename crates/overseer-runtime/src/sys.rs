//! Thin wrappers around the libc calls used to fork, signal and reap children.
//!
//! Functions documented as *child-safe* are async-signal-safe and never
//! allocate, so they may be called between `fork` and `exec` of a
//! multi-threaded parent.

use std::ffi::CStr;
use std::io;
use std::os::raw::{c_char, c_int, c_void};

/// Signals that ask this process to shut down. They are blocked across `fork`
/// so that a shutdown request cannot be handled while the new child is still
/// outside of its own process group.
pub const SHUTDOWN_REQUEST_SIGNALS: [c_int; 3] = [libc::SIGINT, libc::SIGQUIT, libc::SIGTERM];

/// Permission bits of redirected log files: owner rw, group r, other r.
pub const LOG_FILE_MODE: libc::c_uint = 0o644;

/// Signal handler with the `SA_SIGINFO` calling convention.
pub type SignalAction = extern "C" fn(c_int, *mut libc::siginfo_t, *mut c_void);

/// Signal mask saved by `block_signals`, to be handed back to `restore_signal_mask`.
#[derive(Clone, Copy)]
pub struct SignalMask(libc::sigset_t);

impl SignalMask {
    /// Whether `signal` is a member of the mask.
    #[allow(unsafe_code)]
    pub fn contains(&self, signal: c_int) -> bool {
        // SAFETY: the set was initialised by pthread_sigmask.
        unsafe { libc::sigismember(&self.0, signal) == 1 }
    }
}

/// Keeps a set of signals blocked in the calling thread until dropped, then
/// reinstalls the mask that was in force before.
///
/// Blocks nest: an inner block restores to a mask that still has the outer
/// block's signals in it.
#[must_use = "the signals are unblocked again when the guard is dropped"]
pub struct BlockedSignals {
    previous: SignalMask,
}

impl BlockedSignals {
    pub fn new(signals: &[c_int]) -> io::Result<Self> {
        Ok(Self {
            previous: block_signals(signals)?,
        })
    }

    /// The mask in force before this block.
    pub fn previous(&self) -> &SignalMask {
        &self.previous
    }
}

impl Drop for BlockedSignals {
    fn drop(&mut self) {
        // Pending signals are delivered here.
        let _ = restore_signal_mask(&self.previous);
    }
}

/// A signal disposition captured with `sigaction`.
#[derive(Clone, Copy)]
pub struct Disposition(libc::sigaction);

impl Disposition {
    /// Whether the disposition runs a user handler (as opposed to default or ignore).
    pub fn is_handler(&self) -> bool {
        self.0.sa_sigaction != libc::SIG_DFL && self.0.sa_sigaction != libc::SIG_IGN
    }
}

/// Outcome of `fork` as seen by the calling process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fork {
    Parent(libc::pid_t),
    Child,
}

/// Block `signals` in the calling thread and return the previous mask.
#[allow(unsafe_code)]
pub fn block_signals(signals: &[c_int]) -> io::Result<SignalMask> {
    // SAFETY: sigset_t is plain data; sigemptyset initialises it before any read.
    let mut set: libc::sigset_t = unsafe { std::mem::zeroed() };
    // SAFETY: same as above, the previous mask is written by pthread_sigmask.
    let mut previous: libc::sigset_t = unsafe { std::mem::zeroed() };
    // SAFETY: `set` is a valid, exclusively borrowed sigset_t.
    unsafe { libc::sigemptyset(&mut set) };
    for &signal in signals {
        // SAFETY: `set` is initialised; invalid signal numbers are reported via the return value.
        if unsafe { libc::sigaddset(&mut set, signal) } != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    // SAFETY: both pointers reference valid sigset_t values owned by this frame.
    let ret = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, &set, &mut previous) };
    if ret != 0 {
        return Err(io::Error::from_raw_os_error(ret));
    }
    Ok(SignalMask(previous))
}

/// Reinstall a mask returned by `block_signals`. Child-safe.
#[allow(unsafe_code)]
pub fn restore_signal_mask(mask: &SignalMask) -> io::Result<()> {
    // SAFETY: the mask was produced by pthread_sigmask; a null old-set pointer is allowed.
    let ret =
        unsafe { libc::pthread_sigmask(libc::SIG_SETMASK, &mask.0, std::ptr::null_mut()) };
    if ret != 0 {
        return Err(io::Error::from_raw_os_error(ret));
    }
    Ok(())
}

/// The calling thread's current signal mask.
#[allow(unsafe_code)]
pub fn current_signal_mask() -> io::Result<SignalMask> {
    // SAFETY: sigset_t is plain data and is fully written by pthread_sigmask.
    let mut current: libc::sigset_t = unsafe { std::mem::zeroed() };
    // SAFETY: a null new-set pointer only queries the mask.
    let ret = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, std::ptr::null(), &mut current) };
    if ret != 0 {
        return Err(io::Error::from_raw_os_error(ret));
    }
    Ok(SignalMask(current))
}

/// Fork the calling process.
///
/// # Safety
/// In the child only async-signal-safe operations may run until `exec` or
/// `_exit`: another thread of the parent may have held a lock (including the
/// allocator's) at the time of the fork. The child must never return into
/// code that assumes it is the parent.
#[allow(unsafe_code)]
pub unsafe fn fork() -> io::Result<Fork> {
    match libc::fork() {
        -1 => Err(io::Error::last_os_error()),
        0 => Ok(Fork::Child),
        pid => Ok(Fork::Parent(pid)),
    }
}

/// `setpgid(pid, pgid)`. Child-safe.
#[allow(unsafe_code)]
pub fn set_process_group(pid: libc::pid_t, pgid: libc::pid_t) -> io::Result<()> {
    // SAFETY: setpgid has no memory-safety preconditions.
    if unsafe { libc::setpgid(pid, pgid) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Non-blocking `waitpid`. `Ok(None)` means the child is still running,
/// `Ok(Some(status))` means it exited and has now been reaped.
#[allow(unsafe_code)]
pub fn try_reap(pid: libc::pid_t) -> io::Result<Option<c_int>> {
    loop {
        let mut status: c_int = 0;
        // SAFETY: `status` is a valid out-pointer for the duration of the call.
        let ret = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
        match ret {
            0 => return Ok(None),
            -1 => {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            reaped if reaped == pid => return Ok(Some(status)),
            other => {
                return Err(io::Error::other(format!(
                    "waitpid({pid}) returned undocumented value {other}"
                )))
            }
        }
    }
}

/// Blocking `waitpid`, used to collect a child that is being torn down.
#[allow(unsafe_code)]
pub fn reap(pid: libc::pid_t) -> io::Result<c_int> {
    loop {
        let mut status: c_int = 0;
        // SAFETY: `status` is a valid out-pointer for the duration of the call.
        let ret = unsafe { libc::waitpid(pid, &mut status, 0) };
        if ret == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(status);
    }
}

/// Send `signal` to every process in the group led by `pgid`.
#[allow(unsafe_code)]
pub fn signal_group(pgid: libc::pid_t, signal: c_int) -> io::Result<()> {
    // SAFETY: killpg has no memory-safety preconditions; errors are reported via errno.
    if unsafe { libc::killpg(pgid, signal) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Send `signal` to a single process.
#[allow(unsafe_code)]
pub fn signal_process(pid: libc::pid_t, signal: c_int) -> io::Result<()> {
    // SAFETY: kill has no memory-safety preconditions; errors are reported via errno.
    if unsafe { libc::kill(pid, signal) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Child-safe.
#[allow(unsafe_code)]
pub fn current_pid() -> libc::pid_t {
    // SAFETY: getpid() cannot fail and has no side effects.
    unsafe { libc::getpid() }
}

/// Open `path` for writing (created with `LOG_FILE_MODE` if absent) and make it
/// the target of stdout and stderr. Child-safe.
#[allow(unsafe_code)]
pub fn redirect_output(path: &CStr) -> io::Result<()> {
    // SAFETY: `path` is a valid NUL-terminated string; the mode argument matches
    // the variadic `mode_t` expected when O_CREAT is given.
    let fd = unsafe {
        libc::open(
            path.as_ptr(),
            libc::O_WRONLY | libc::O_CREAT | libc::O_CLOEXEC,
            LOG_FILE_MODE,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    for target in [libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        // SAFETY: `fd` was just opened and `target` is a standard descriptor.
        if unsafe { libc::dup2(fd, target) } == -1 {
            let err = io::Error::last_os_error();
            // SAFETY: `fd` is owned by this function.
            unsafe { libc::close(fd) };
            return Err(err);
        }
    }
    // SAFETY: `fd` is owned by this function; the duplicates stay open.
    unsafe { libc::close(fd) };
    Ok(())
}

/// Replace the process image. Only returns on failure. Child-safe.
///
/// `argv` must be terminated by a null pointer and every other entry must
/// point to a NUL-terminated string that outlives the call.
#[allow(unsafe_code)]
pub fn exec(command: &CStr, argv: &[*const c_char]) -> io::Error {
    debug_assert!(argv.last().is_some_and(|p| p.is_null()));
    // SAFETY: `command` is NUL-terminated and `argv` is a null-terminated array of
    // pointers to NUL-terminated strings, as required by execvp.
    unsafe { libc::execvp(command.as_ptr(), argv.as_ptr()) };
    io::Error::last_os_error()
}

/// Write raw bytes to stderr, ignoring failures. Child-safe.
#[allow(unsafe_code)]
pub fn write_stderr(bytes: &[u8]) {
    let mut remaining = bytes;
    while !remaining.is_empty() {
        // SAFETY: the pointer/length pair describes the live `remaining` slice.
        let written = unsafe {
            libc::write(
                libc::STDERR_FILENO,
                remaining.as_ptr().cast::<c_void>(),
                remaining.len(),
            )
        };
        if written <= 0 {
            return;
        }
        remaining = &remaining[written as usize..];
    }
}

/// Terminate immediately without running destructors or atexit hooks. Child-safe.
#[allow(unsafe_code)]
pub fn exit_immediately(code: c_int) -> ! {
    // SAFETY: _exit never returns and is async-signal-safe.
    unsafe { libc::_exit(code) }
}

/// Format `value` in decimal into `buf` without allocating. Child-safe.
pub fn format_decimal(value: i64, buf: &mut [u8; 20]) -> &[u8] {
    let negative = value < 0;
    let mut magnitude = value.unsigned_abs();
    let mut pos = buf.len();
    loop {
        pos -= 1;
        buf[pos] = b'0' + (magnitude % 10) as u8;
        magnitude /= 10;
        if magnitude == 0 {
            break;
        }
    }
    if negative {
        pos -= 1;
        buf[pos] = b'-';
    }
    &buf[pos..]
}

/// Read the current disposition of `signal` without changing it.
#[allow(unsafe_code)]
pub fn current_disposition(signal: c_int) -> io::Result<Disposition> {
    // SAFETY: sigaction is plain data and is fully written by the call below.
    let mut current: libc::sigaction = unsafe { std::mem::zeroed() };
    // SAFETY: a null new-action pointer only queries the disposition.
    if unsafe { libc::sigaction(signal, std::ptr::null(), &mut current) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(Disposition(current))
}

/// Install `handler` for `signal` with `SA_SIGINFO` and return the previous disposition.
#[allow(unsafe_code)]
pub fn install_signal_action(signal: c_int, handler: SignalAction) -> io::Result<Disposition> {
    // SAFETY: sigaction is plain data; every field we rely on is set below.
    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    action.sa_sigaction = handler as libc::sighandler_t;
    action.sa_flags = libc::SA_SIGINFO;
    // SAFETY: `sa_mask` is a valid, exclusively borrowed sigset_t.
    unsafe { libc::sigemptyset(&mut action.sa_mask) };
    // SAFETY: as above.
    let mut previous: libc::sigaction = unsafe { std::mem::zeroed() };
    // SAFETY: both pointers reference valid sigaction values owned by this frame.
    if unsafe { libc::sigaction(signal, &action, &mut previous) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(Disposition(previous))
}

/// Reinstall a disposition captured earlier. Child-safe.
#[allow(unsafe_code)]
pub fn restore_disposition(signal: c_int, disposition: &Disposition) -> io::Result<()> {
    // SAFETY: the disposition was produced by sigaction; a null old-action pointer is allowed.
    if unsafe { libc::sigaction(signal, &disposition.0, std::ptr::null_mut()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Set `signal` back to its default action. Child-safe.
#[allow(unsafe_code)]
pub fn reset_to_default(signal: c_int) -> io::Result<()> {
    // SAFETY: sigaction is plain data; zeroed means SIG_DFL with no flags and an empty mask.
    let action: libc::sigaction = unsafe { std::mem::zeroed() };
    // SAFETY: `action` is a valid sigaction owned by this frame.
    if unsafe { libc::sigaction(signal, &action, std::ptr::null_mut()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Send `signal` to the calling thread.
#[allow(unsafe_code)]
pub fn raise(signal: c_int) -> io::Result<()> {
    // SAFETY: raise has no memory-safety preconditions.
    if unsafe { libc::raise(signal) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn signal_name(signal: c_int) -> &'static str {
    match signal {
        libc::SIGINT => "SIGINT",
        libc::SIGQUIT => "SIGQUIT",
        libc::SIGABRT => "SIGABRT",
        libc::SIGKILL => "SIGKILL",
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGTERM => "SIGTERM",
        libc::SIGHUP => "SIGHUP",
        libc::SIGPIPE => "SIGPIPE",
        _ => "signal",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_decimal_handles_edges() {
        let mut buf = [0u8; 20];
        assert_eq!(format_decimal(0, &mut buf), b"0");
        assert_eq!(format_decimal(4_194_304, &mut buf), b"4194304");
        assert_eq!(format_decimal(-17, &mut buf), b"-17");
        assert_eq!(
            format_decimal(i64::MIN, &mut buf),
            b"-9223372036854775808".as_slice()
        );
    }

    #[test]
    fn block_and_restore_mask_roundtrip() {
        let mask = block_signals(&[libc::SIGUSR2]).unwrap();
        assert!(current_signal_mask().unwrap().contains(libc::SIGUSR2));
        restore_signal_mask(&mask).unwrap();
        assert!(!current_signal_mask().unwrap().contains(libc::SIGUSR2));
    }

    #[test]
    fn nested_blocks_unblock_with_the_outermost() {
        let outer = BlockedSignals::new(&[libc::SIGUSR1]).unwrap();
        assert!(!outer.previous().contains(libc::SIGUSR1));
        {
            let inner = BlockedSignals::new(&[libc::SIGUSR1]).unwrap();
            assert!(inner.previous().contains(libc::SIGUSR1));
        }
        assert!(current_signal_mask().unwrap().contains(libc::SIGUSR1));
        drop(outer);
        assert!(!current_signal_mask().unwrap().contains(libc::SIGUSR1));
    }

    #[test]
    fn signal_names() {
        assert_eq!(signal_name(libc::SIGINT), "SIGINT");
        assert_eq!(signal_name(libc::SIGKILL), "SIGKILL");
        assert_eq!(signal_name(libc::SIGUSR1), "signal");
    }

    #[test]
    fn try_reap_unknown_child_is_echild() {
        let err = try_reap(i32::MAX - 1).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ECHILD));
    }

    #[test]
    fn signaling_missing_group_is_esrch() {
        let err = signal_group(i32::MAX - 1, 0).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ESRCH));
    }

    #[test]
    fn query_disposition_does_not_change_it() {
        let before = current_disposition(libc::SIGUSR1).unwrap();
        let after = current_disposition(libc::SIGUSR1).unwrap();
        assert_eq!(before.is_handler(), after.is_handler());
    }
}
