// src/proc.rs

//! Thin readers over `/proc`. Every accessor returns `Option`: a `None`
//! means the process is gone (or was never there), which callers treat the
//! same way regardless of the underlying errno.

use procfs::process::Process;

/// Identity of a mount namespace: `(st_dev, st_ino)` of `/proc/<pid>/ns/mnt`.
/// Two processes share a namespace iff these match.
pub type NsId = (u64, u64);

/// The parent pid, from field 4 of `/proc/<pid>/stat`.
pub fn parent_pid(pid: i32) -> Option<i32> {
    Some(Process::new(pid).ok()?.stat().ok()?.ppid)
}

/// Mount-namespace identity of a process.
pub fn mnt_ns(pid: i32) -> Option<NsId> {
    let st = rustix::fs::stat(format!("/proc/{pid}/ns/mnt")).ok()?;
    Some((st.st_dev as u64, st.st_ino as u64))
}

/// Owner of `/proc/<pid>`, i.e. the uid the process runs as.
pub fn uid(pid: i32) -> Option<u32> {
    let st = rustix::fs::stat(format!("/proc/{pid}")).ok()?;
    Some(st.st_uid)
}

/// First NUL-terminated token of `/proc/<pid>/cmdline` (argv[0]).
pub fn cmdline(pid: i32) -> Option<String> {
    Process::new(pid).ok()?.cmdline().ok()?.into_iter().next()
}

/// Whether the id names a thread-group leader (`Tgid == pid` in
/// `/proc/<pid>/status`). A plain thread, or a dead pid, yields false.
pub fn is_process(pid: i32) -> bool {
    Process::new(pid)
        .and_then(|p| p.status())
        .map(|status| status.tgid == pid)
        .unwrap_or(false)
}

/// Invokes `f` for every pid currently present in `/proc`.
pub fn iterate_pids(mut f: impl FnMut(i32)) {
    let Ok(procs) = procfs::process::all_processes() else {
        return;
    };
    for process in procs.flatten() {
        f(process.pid);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn parent_of_self() {
        let me = std::process::id() as i32;
        assert_eq!(parent_pid(me), Some(std::os::unix::process::parent_id() as i32));
    }

    #[test]
    fn dead_pid_reads_as_none() {
        // Pid 0 has no /proc entry; neither does anything near the i32 cap.
        for pid in [0, i32::MAX - 1] {
            assert_eq!(parent_pid(pid), None);
            assert_eq!(mnt_ns(pid), None);
            assert_eq!(cmdline(pid), None);
            assert_eq!(uid(pid), None);
            assert!(!is_process(pid));
        }
    }

    #[test]
    fn self_is_a_process_with_a_cmdline() {
        let me = std::process::id() as i32;
        assert!(is_process(me));
        let argv0 = cmdline(me).expect("own cmdline");
        assert!(!argv0.is_empty());
        assert!(mnt_ns(me).is_some());
    }

    #[test]
    fn thread_is_not_a_process() {
        let (tid_tx, tid_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let handle = std::thread::spawn(move || {
            tid_tx.send(crate::utils::gettid()).unwrap();
            // Stay alive until the assertion below has run.
            done_rx.recv().unwrap();
        });
        let tid = tid_rx.recv().unwrap();
        assert!(!is_process(tid));
        done_tx.send(()).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn pid_enumeration_sees_self() {
        let me = std::process::id() as i32;
        let mut seen = false;
        iterate_pids(|pid| seen |= pid == me);
        assert!(seen);
    }
}
