// src/utils.rs

//! A collection of utility functions for platform-specific operations.
//!
//! This module provides helpers for:
//! - Selecting values by target bitness.
//! - Reading the kernel thread id.
//! - The signal plumbing of the controller thread: every signal the monitor
//!   consumes is blocked process-wide and unblocked only in the controller's
//!   own mask, with handlers that do nothing but raise a flag.

use std::io::Error;
use std::os::raw::c_int;

// --- Platform-specific Macros ---

/// Selects an expression based on the target pointer width (32-bit vs 64-bit).
#[cfg(target_pointer_width = "64")]
#[macro_export]
macro_rules! lp_select {
    ($lp32:expr, $lp64:expr) => {
        $lp64
    };
}
#[cfg(target_pointer_width = "32")]
#[macro_export]
macro_rules! lp_select {
    ($lp32:expr, $lp64:expr) => {
        $lp32
    };
}

/// The kernel thread id of the calling thread.
pub fn gettid() -> i32 {
    rustix::thread::gettid().as_raw_nonzero().get()
}

// --- Signal plumbing ---

fn monitor_sigset() -> libc::sigset_t {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGIO);
        libc::sigaddset(&mut set, libc::SIGALRM);
        libc::sigaddset(&mut set, crate::constants::sig_term_monitor());
        set
    }
}

/// Blocks the monitor's signals in the calling thread. Called before any
/// thread is spawned so the mask is inherited everywhere.
pub fn block_monitor_signals() {
    let set = monitor_sigset();
    unsafe {
        libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
    }
}

/// Unblocks the monitor's signals in the calling thread only. The controller
/// thread is the sole caller.
pub fn unblock_monitor_signals() {
    let set = monitor_sigset();
    unsafe {
        libc::pthread_sigmask(libc::SIG_UNBLOCK, &set, std::ptr::null_mut());
    }
}

/// Installs a process-wide handler for a single signal. `SA_RESTART` is
/// deliberately not set: the controller relies on `EINTR` to break out of
/// `waitpid` and `nanosleep`.
pub fn set_signal_handler(signum: c_int, handler: extern "C" fn(c_int)) {
    unsafe {
        let mut act: libc::sigaction = std::mem::zeroed();
        act.sa_sigaction = handler as usize;
        libc::sigemptyset(&mut act.sa_mask);
        if libc::sigaction(signum, &act, std::ptr::null_mut()) != 0 {
            log::warn!("sigaction for signal {}: {}", signum, Error::last_os_error());
        }
    }
}

/// Sleeps until a signal arrives. Used when there is nothing to wait for yet.
pub fn interruptible_sleep() {
    let ts = libc::timespec {
        tv_sec: i32::MAX as libc::time_t,
        tv_nsec: 0,
    };
    unsafe {
        libc::nanosleep(&ts, std::ptr::null_mut());
    }
}

// --- FFI for thread-directed SIGIO ---
// `F_SETOWN_EX` and its argument struct are not exposed by the libc crate on
// every target, so they are declared here.

const F_SETOWN_EX: c_int = 15;
const F_OWNER_TID: c_int = 0;

#[repr(C)]
#[allow(non_camel_case_types)]
struct f_owner_ex {
    type_: c_int,
    pid: libc::pid_t,
}

/// Switches an fd to asynchronous mode and directs its `SIGIO` at the
/// calling thread only.
pub fn route_sigio_to_current_thread(fd: std::os::fd::RawFd) {
    unsafe {
        libc::fcntl(fd, libc::F_SETFL, libc::O_ASYNC | libc::O_NONBLOCK);
        let owner = f_owner_ex {
            type_: F_OWNER_TID,
            pid: gettid(),
        };
        libc::fcntl(fd, F_SETOWN_EX, &owner as *const f_owner_ex);
    }
}
