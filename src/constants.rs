// src/constants.rs

//! Defines global constants and enums used throughout the daemon.

use log::LevelFilter;
use num_enum::TryFromPrimitive;
use std::os::raw::c_int;

/// The version of the hidemon daemon itself.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The maximum log level for the daemon. Set to `Trace` for debug builds and `Info` for release builds.
#[cfg(debug_assertions)]
pub const MAX_LOG_LEVEL: LevelFilter = LevelFilter::Trace;
#[cfg(not(debug_assertions))]
pub const MAX_LOG_LEVEL: LevelFilter = LevelFilter::Info;

/// Reserved package name marking a rule that applies to isolated processes.
/// The rule's process name is then matched by prefix instead of equality.
pub const ISOLATED_MAGIC: &str = "isolated";

/// Key under which isolated-process rules are collected in the uid map.
pub const ISOLATED_KEY: i32 = -1;

/// Per-user application data roots. `/data/user_de` exists on modern
/// platforms; older ones only have `/data/user`.
pub const APP_DATA_DIR: &str = "/data/user_de";
pub const APP_DATA_DIR_LEGACY: &str = "/data/user";

/// Directory carrying the platform package database.
pub const SYSTEM_CONFIG_DIR: &str = "/data/system";
/// File rewritten by the platform whenever a package is installed or removed.
pub const PACKAGES_XML: &str = "packages.xml";

/// The binary every zygote (re-)execs through. A fresh zygote opens this
/// file, so an access watch on it signals a possible zygote restart.
pub const APP_PROCESS: &str = "/system/bin/app_process";

/// Process names used by zygote internals. Children still carrying one of
/// these have not specialized into an app yet and are never targets.
pub const ZYGOTE_PROCESS_NAMES: &[&str] = &["zygote", "zygote32", "zygote64", "usap32", "usap64"];

/// Scan interval while not all zygotes are known yet.
pub const ZYGOTE_SCAN_INTERVAL_US: i64 = 250_000;

/// Signal the embedding process sends to terminate the controller thread.
/// Real-time signals are outside the POSIX-defined set, so the number is
/// only available at runtime.
pub fn sig_term_monitor() -> c_int {
    libc::SIGRTMIN()
}

/// Mount entries stripped from a target's namespace by the unmount worker.
pub const SENSITIVE_MOUNT_ROOTS: &[&str] = &["/adb/modules"];
pub const SENSITIVE_MOUNT_POINTS: &[&str] = &["/data/adb/modules"];
pub const SENSITIVE_MOUNT_SOURCES: &[&str] = &["magisk", "KSU", "APatch"];

/// Ptrace stop events as reported in the upper half of a wait status.
#[derive(Debug, Eq, PartialEq, TryFromPrimitive, Copy, Clone)]
#[repr(i32)]
pub enum TraceEvent {
    Fork = libc::PTRACE_EVENT_FORK,
    Vfork = libc::PTRACE_EVENT_VFORK,
    Clone = libc::PTRACE_EVENT_CLONE,
    Exec = libc::PTRACE_EVENT_EXEC,
    VforkDone = libc::PTRACE_EVENT_VFORK_DONE,
    Exit = libc::PTRACE_EVENT_EXIT,
    Seccomp = libc::PTRACE_EVENT_SECCOMP,
}
