// src/monitor.rs

//! The process-lineage monitor.
//!
//! One controller thread owns everything in here. It ptrace-attaches the
//! zygotes, follows every fork they report, and runs the classifier on each
//! child once the child starts creating threads. Identified targets are
//! detached with `SIGSTOP` pending and handed to the unmount worker.
//!
//! Three asynchronous sources feed the thread, all as signals: `SIGIO` from
//! the inotify fd (package database rewrites, zygote restarts), `SIGALRM`
//! from the interval timer driving the initial zygote scan, and the reserved
//! terminate signal. Handlers only raise a flag; the flags are consumed at
//! the top of the `waitpid` loop, which the signals interrupt via `EINTR`.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::os::fd::{AsFd, AsRawFd};
use std::os::raw::c_int;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use log::{debug, error, info, trace, warn};
use nix::errno::Errno;
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify};
use nix::sys::ptrace::{self, Options};
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::constants::{
    APP_PROCESS, PACKAGES_XML, SYSTEM_CONFIG_DIR, TraceEvent, ZYGOTE_SCAN_INTERVAL_US,
    sig_term_monitor,
};
use crate::pid_set::PidSet;
use crate::proc::{self, NsId};
use crate::{classify, lp_select, state, utils};

static INOTIFY_PENDING: AtomicBool = AtomicBool::new(false);
static ALARM_PENDING: AtomicBool = AtomicBool::new(false);
static TERM_PENDING: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigio(_: c_int) {
    INOTIFY_PENDING.store(true, Ordering::Relaxed);
}

extern "C" fn on_sigalrm(_: c_int) {
    ALARM_PENDING.store(true, Ordering::Relaxed);
}

extern "C" fn on_sigterm(_: c_int) {
    TERM_PENDING.store(true, Ordering::Relaxed);
}

/// Everything the controller thread owns. Private to it; no lock needed.
struct Monitor {
    inotify: Option<Inotify>,
    /// Active zygotes and their mount-namespace identity.
    zygotes: BTreeMap<i32, NsId>,
    /// Children currently traced as potential targets.
    attaches: PidSet,
    timer_armed: bool,
}

/// Entry point of the controller thread. Returns only after the terminate
/// signal has been delivered and teardown has run.
pub fn proc_monitor() {
    utils::set_signal_handler(libc::SIGIO, on_sigio);
    utils::set_signal_handler(libc::SIGALRM, on_sigalrm);
    utils::set_signal_handler(sig_term_monitor(), on_sigterm);
    utils::unblock_monitor_signals();

    let mut monitor = Monitor::new();
    if let Err(e) = monitor.setup_inotify() {
        error!("monitor: inotify setup failed: {:?}", e);
        monitor.teardown();
        return;
    }

    // Find the zygotes that are already up; keep scanning until all of them
    // are known.
    monitor.check_zygote();
    if !monitor.zygotes_complete() {
        monitor.arm_timer();
    }

    monitor.run();
}

impl Monitor {
    fn new() -> Self {
        Self {
            inotify: None,
            zygotes: BTreeMap::new(),
            attaches: PidSet::new(),
            timer_armed: false,
        }
    }

    fn run(&mut self) {
        loop {
            if TERM_PENDING.swap(false, Ordering::Relaxed) {
                self.teardown();
                return;
            }
            if INOTIFY_PENDING.swap(false, Ordering::Relaxed) {
                self.handle_inotify();
            }
            if ALARM_PENDING.swap(false, Ordering::Relaxed) {
                self.check_zygote();
            }

            let status = match waitpid(
                None::<Pid>,
                Some(WaitPidFlag::__WALL | WaitPidFlag::__WNOTHREAD),
            ) {
                Ok(status) => status,
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => {
                    // Nothing to trace yet; park until a signal arrives.
                    trace!("monitor: nothing to monitor, waiting for a signal");
                    utils::interruptible_sleep();
                    continue;
                }
                Err(e) => {
                    warn!("monitor: waitpid: {}", e);
                    continue;
                }
            };
            self.dispatch(status);
        }
    }

    fn dispatch(&mut self, status: WaitStatus) {
        match status {
            WaitStatus::PtraceEvent(pid, _, event) => self.handle_trace_event(pid, event),
            WaitStatus::Stopped(pid, Signal::SIGSTOP)
                if !self.zygotes.contains_key(&pid.as_raw()) =>
            {
                self.handle_first_stop(pid)
            }
            WaitStatus::Stopped(pid, signal) => {
                // Not caused by us; hand the signal back.
                trace!("monitor: forwarding signal {} to {}", signal, pid);
                if ptrace::cont(pid, signal).is_err() {
                    detach_pid(&mut self.attaches, pid.as_raw(), None);
                }
            }
            status => {
                // Exit, kill or anything else that is not a ptrace-stop:
                // whatever we knew about the pid is gone.
                if let Some(pid) = status.pid() {
                    self.forget(pid.as_raw());
                }
            }
        }
    }

    /// A `SIGTRAP` stop carrying a ptrace event in the upper status bits.
    fn handle_trace_event(&mut self, pid: Pid, event: i32) {
        let raw = pid.as_raw();
        let msg = match ptrace::getevent(pid) {
            Ok(msg) => msg,
            Err(e) => {
                // The tracee can die between the event-stop and this call.
                warn!("monitor: getevent {}: {}", raw, e);
                self.forget(raw);
                return;
            }
        };

        if self.zygotes.contains_key(&raw) {
            match TraceEvent::try_from(event) {
                Ok(TraceEvent::Fork) | Ok(TraceEvent::Vfork) => {
                    trace!("monitor: zygote {} forked {}", raw, msg);
                    if msg > 0 {
                        self.attaches.insert(msg as i32);
                    }
                }
                other => {
                    if matches!(other, Ok(TraceEvent::Exit)) {
                        debug!("monitor: zygote {} exited with status {}", raw, msg);
                    } else {
                        debug!("monitor: unexpected event {} from zygote {}", event, raw);
                    }
                    self.forget(raw);
                    return;
                }
            }
        } else {
            match TraceEvent::try_from(event) {
                Ok(TraceEvent::Clone) => {
                    trace!("monitor: {} created thread {}", raw, msg);
                    if self.attaches.contains(raw)
                        && classify::check_pid(raw, &mut self.attaches, &self.zygotes)
                    {
                        return;
                    }
                }
                _ => {
                    // Exec, exit, or something we never asked for.
                    trace!("monitor: event {} ends tracing of {}", event, raw);
                    detach_pid(&mut self.attaches, raw, None);
                    return;
                }
            }
        }

        if let Err(e) = ptrace::cont(pid, None) {
            trace!("monitor: cont {}: {}", raw, e);
            detach_pid(&mut self.attaches, raw, None);
        }
    }

    /// The first `SIGSTOP` a fresh fork delivers after we attached it.
    /// Threads also stop here; only thread-group leaders stay monitored.
    fn handle_first_stop(&mut self, pid: Pid) {
        let raw = pid.as_raw();
        if !self.attaches.contains(raw) {
            self.attaches.set(raw, proc::is_process(raw));
        }
        if self.attaches.contains(raw) {
            trace!("monitor: SIGSTOP from process {}", raw);
            let options = Options::PTRACE_O_TRACECLONE
                | Options::PTRACE_O_TRACEEXEC
                | Options::PTRACE_O_TRACEEXIT;
            if let Err(e) = ptrace::setoptions(pid, options).and_then(|_| ptrace::cont(pid, None))
            {
                warn!("monitor: tracing {} failed: {}", raw, e);
                detach_pid(&mut self.attaches, raw, None);
            }
        } else {
            trace!("monitor: SIGSTOP from thread {}", raw);
            detach_pid(&mut self.attaches, raw, None);
        }
    }

    /// Scans `/proc` for zygotes: direct children of init whose command line
    /// starts with "zygote". Idempotent; re-entry only updates namespaces.
    fn check_zygote(&mut self) {
        proc::iterate_pids(|pid| {
            let looks_like_zygote = proc::cmdline(pid)
                .is_some_and(|cmdline| cmdline.starts_with("zygote"))
                && proc::parent_pid(pid) == Some(1);
            if looks_like_zygote {
                self.register_zygote(pid);
            }
        });
        if self.zygotes_complete() {
            self.disarm_timer();
        }
    }

    fn register_zygote(&mut self, pid: i32) {
        let Some(ns) = proc::mnt_ns(pid) else {
            return;
        };
        if let Some(known_ns) = self.zygotes.get_mut(&pid) {
            // Zygote re-entered (restart keeps the pid on some platforms);
            // remember the new namespace.
            *known_ns = ns;
            return;
        }

        debug!("monitor: tracing zygote PID=[{}]", pid);
        self.zygotes.insert(pid, ns);

        let zygote = Pid::from_raw(pid);
        if let Err(e) = ptrace::attach(zygote) {
            warn!("monitor: ptrace attach {}: {}", pid, e);
            self.zygotes.remove(&pid);
            return;
        }
        if let Err(e) = waitpid(
            zygote,
            Some(WaitPidFlag::__WALL | WaitPidFlag::__WNOTHREAD),
        ) {
            warn!("monitor: waiting for zygote {}: {}", pid, e);
        }
        let options = Options::PTRACE_O_TRACEFORK
            | Options::PTRACE_O_TRACEVFORK
            | Options::PTRACE_O_TRACEEXIT;
        if let Err(e) = ptrace::setoptions(zygote, options).and_then(|_| ptrace::cont(zygote, None))
        {
            warn!("monitor: tracing zygote {} failed: {}", pid, e);
            self.forget(pid);
        }
    }

    /// Drops every record of a pid, zygote or child, and detaches it.
    fn forget(&mut self, pid: i32) {
        let was_zygote = self.zygotes.remove(&pid).is_some();
        detach_pid(&mut self.attaches, pid, None);
        // A dead zygote leaves the registry incomplete; resume scanning
        // until its replacement shows up.
        if was_zygote && !self.zygotes_complete() {
            self.arm_timer();
        }
    }

    fn zygotes_complete(&self) -> bool {
        self.zygotes.len() >= lp_select!(1, 2)
    }

    fn setup_inotify(&mut self) -> Result<()> {
        let inotify = Inotify::init(InitFlags::IN_CLOEXEC | InitFlags::IN_NONBLOCK)?;

        // Package installs rewrite the package database.
        inotify.add_watch(SYSTEM_CONFIG_DIR, AddWatchFlags::IN_CLOSE_WRITE)?;

        // A newly spawned zygote reads the app_process binary; watching it
        // catches zygote restarts the moment they happen.
        let app_process_32 = format!("{}32", APP_PROCESS);
        let app_process_64 = format!("{}64", APP_PROCESS);
        if Path::new(&app_process_32).exists() {
            inotify.add_watch(app_process_32.as_str(), AddWatchFlags::IN_ACCESS)?;
            if Path::new(&app_process_64).exists() {
                inotify.add_watch(app_process_64.as_str(), AddWatchFlags::IN_ACCESS)?;
            }
        } else {
            inotify.add_watch(APP_PROCESS, AddWatchFlags::IN_ACCESS)?;
        }

        // Asynchronous delivery, routed to this thread only.
        utils::route_sigio_to_current_thread(inotify.as_fd().as_raw_fd());

        self.inotify = Some(inotify);
        Ok(())
    }

    /// Drains every queued inotify event. A package-database rewrite
    /// refreshes the uid map; any activity at all warrants a zygote rescan.
    fn handle_inotify(&mut self) {
        let mut refresh = false;
        let mut seen_any = false;
        if let Some(inotify) = &self.inotify {
            while let Ok(events) = inotify.read_events() {
                if events.is_empty() {
                    break;
                }
                for event in events {
                    seen_any = true;
                    if event.mask.contains(AddWatchFlags::IN_CLOSE_WRITE)
                        && event.name.as_deref() == Some(OsStr::new(PACKAGES_XML))
                    {
                        refresh = true;
                    }
                }
            }
        }
        if refresh {
            debug!("monitor: package database changed, refreshing uid map");
            state::lock().refresh_uid_map();
        }
        if seen_any {
            self.check_zygote();
        }
    }

    fn arm_timer(&mut self) {
        if self.timer_armed {
            return;
        }
        self.timer_armed = true;
        set_scan_timer(ZYGOTE_SCAN_INTERVAL_US);
    }

    fn disarm_timer(&mut self) {
        if !self.timer_armed {
            return;
        }
        self.timer_armed = false;
        set_scan_timer(0);
    }

    /// Releases every resource and clears all state. Traced children and
    /// zygotes are detached explicitly; the shared state is wiped and hiding
    /// is switched off.
    fn teardown(&mut self) {
        debug!("monitor: cleaning up");
        self.disarm_timer();
        for (&pid, _) in &self.zygotes {
            let _ = ptrace::detach(Pid::from_raw(pid), None);
        }
        self.zygotes.clear();
        self.attaches.reset();
        state::lock().reset();
        self.inotify = None;
        info!("monitor: terminated");
    }
}

/// Stops tracking a pid. `signal` is delivered on detach; handing a target
/// over uses `SIGSTOP` so it stays parked for the unmount worker. Failures
/// only mean the process is already gone.
pub(crate) fn detach_pid(attaches: &mut PidSet, pid: i32, signal: Option<Signal>) {
    attaches.remove(pid);
    if ptrace::detach(Pid::from_raw(pid), signal).is_ok() {
        trace!("monitor: detached {}", pid);
    }
}

fn set_scan_timer(interval_us: i64) {
    let value = libc::timeval {
        tv_sec: 0,
        tv_usec: interval_us as libc::suseconds_t,
    };
    let interval = libc::itimerval {
        it_interval: value,
        it_value: value,
    };
    unsafe {
        libc::setitimer(libc::ITIMER_REAL, &interval, std::ptr::null_mut());
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn teardown_clears_all_monitor_state() {
        let mut monitor = Monitor::new();
        monitor.inotify = Some(Inotify::init(InitFlags::IN_CLOEXEC).unwrap());
        monitor.zygotes.insert(100, (8, 499));
        monitor.zygotes.insert(101, (8, 498));
        for pid in [200, 201, 202] {
            monitor.attaches.insert(pid);
        }
        state::lock().add_rule("com.target", "com.target");
        state::set_hide_state(true);

        monitor.teardown();

        assert!(monitor.inotify.is_none());
        assert!(monitor.zygotes.is_empty());
        assert!(monitor.attaches.is_empty());
        assert!(!monitor.timer_armed);
        assert!(!state::hide_state());
        let shared = state::lock();
        assert_eq!(shared.rules().count(), 0);
        assert!(shared.uid_map().is_empty());
    }

    #[test]
    fn zygote_registry_threshold_matches_bitness() {
        let mut monitor = Monitor::new();
        assert!(!monitor.zygotes_complete());
        monitor.zygotes.insert(100, (8, 499));
        if cfg!(target_pointer_width = "64") {
            assert!(!monitor.zygotes_complete());
            monitor.zygotes.insert(101, (8, 498));
        }
        assert!(monitor.zygotes_complete());
    }
}
