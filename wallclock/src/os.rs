//! Thin wrappers over the OS primitives the sampler needs: the monotonic
//! clock, interruptible sleep, per-thread signal delivery and signal handler
//! registration.

use std::io;
use std::mem;
use std::ptr;

/// Kernel thread id (the per-task pid under `/proc/<pid>/task/`).
pub type ThreadId = libc::pid_t;

/// Handler signature required by `SA_SIGINFO` registrations.
pub type SignalHandlerFn = extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void);

/// Notification signal used when the configuration does not request one.
pub const DEFAULT_SIGNAL: libc::c_int = libc::SIGPROF;

/// Signal used only to knock the control thread out of its pacing sleep.
pub const WAKEUP_SIGNAL: libc::c_int = libc::SIGVTALRM;

/// Current monotonic time in nanoseconds.
pub fn now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let _ = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// Sleep for up to `ns` nanoseconds.
///
/// A single `nanosleep`, so a delivered signal ends the sleep early with
/// `EINTR`. `std::thread::sleep` retries on `EINTR` and would swallow the
/// wake-up signal `stop()` relies on.
pub fn sleep_ns(ns: u64) {
    let ts = libc::timespec {
        tv_sec: (ns / 1_000_000_000) as libc::time_t,
        tv_nsec: (ns % 1_000_000_000) as libc::c_long,
    };
    unsafe {
        libc::nanosleep(&ts, ptr::null_mut());
    }
}

/// Kernel id of the calling thread. Async-signal-safe.
pub fn thread_id() -> ThreadId {
    unsafe { libc::syscall(libc::SYS_gettid) as ThreadId }
}

/// Best-effort delivery of `signal` to thread `tid` of this process.
/// Returns false when the thread has exited (or was never ours).
pub fn send_signal(tid: ThreadId, signal: libc::c_int) -> bool {
    unsafe { libc::syscall(libc::SYS_tgkill, libc::getpid(), tid, signal) == 0 }
}

/// Install `handler` for `signal`, returning the previous disposition.
///
/// The signal masks itself while the handler runs. `restart` controls
/// `SA_RESTART`: the notification signal restarts interrupted syscalls in
/// sampled threads, while the wake-up signal must not, since breaking the
/// control thread's `nanosleep` is its entire purpose.
pub fn install_handler(
    signal: libc::c_int,
    handler: SignalHandlerFn,
    restart: bool,
) -> io::Result<libc::sigaction> {
    unsafe {
        let mut sa: libc::sigaction = mem::zeroed();
        sa.sa_sigaction = handler as usize;
        sa.sa_flags = libc::SA_SIGINFO | if restart { libc::SA_RESTART } else { 0 };
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaddset(&mut sa.sa_mask, signal);
        let mut previous: libc::sigaction = mem::zeroed();
        if libc::sigaction(signal, &sa, &mut previous) != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(previous)
    }
}

/// Reinstate a disposition captured by [`install_handler`].
pub fn restore_handler(signal: libc::c_int, previous: &libc::sigaction) -> io::Result<()> {
    unsafe {
        if libc::sigaction(signal, previous, ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_monotonic() {
        let a = now_ns();
        let b = now_ns();
        assert!(b >= a);
        assert!(a > 0);
    }

    #[test]
    fn signal_to_vanished_thread_fails() {
        // No process gets close to this tid (kernel.pid_max caps at 2^22).
        assert!(!send_signal(i32::MAX, DEFAULT_SIGNAL));
    }

    #[test]
    fn thread_id_is_stable_within_a_thread() {
        assert_eq!(thread_id(), thread_id());
    }
}
