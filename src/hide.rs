// src/hide.rs

//! The hand-off side of target hiding.
//!
//! The monitor leaves an identified target stopped and calls
//! [`hide_daemon`]; a short-lived worker process then enters the target's
//! mount namespace, detaches the sensitive mounts and resumes it. From the
//! target's point of view nothing happened before its first instruction.

use anyhow::{Context, Result};
use log::{debug, error};
use procfs::process::{MountInfo, Process};
use rustix::thread::{self as rustix_thread, LinkNameSpaceType};
use std::ffi::CString;
use std::fs::File;
use std::io::Error;
use std::os::fd::AsFd;

use crate::constants;

/// Takes ownership of a stopped target.
///
/// Forks a worker that cleans the target's mount namespace and sends
/// `SIGCONT`. The caller must have left the target in group-stop; the worker
/// resumes it even if the cleaning fails, since a target parked in `T` state
/// would never draw its first frame. The worker's exit is collected by the
/// monitor loop like any other child.
pub fn hide_daemon(pid: i32) {
    match unsafe { libc::fork() } {
        0 => {
            // --- Worker process ---
            if let Err(e) = hide_unmount(pid) {
                error!("hide: cleaning namespace of {} failed: {:?}", pid, e);
            }
            unsafe {
                libc::kill(pid, libc::SIGCONT);
                libc::_exit(0);
            }
        }
        worker if worker > 0 => {
            debug!("hide: worker {} takes over target {}", worker, pid);
        }
        _ => error!("hide: fork failed: {}", Error::last_os_error()),
    }
}

/// Enters the target's mount namespace and unmounts every sensitive mount
/// visible there.
fn hide_unmount(pid: i32) -> Result<()> {
    // The target is stopped, so its namespace cannot change under us. setns
    // clobbers the working directory; put it back afterwards.
    let ns_file = File::open(format!("/proc/{pid}/ns/mnt"))
        .with_context(|| format!("target {pid} has no mount namespace"))?;
    let cwd = std::env::current_dir()?;
    rustix_thread::move_into_link_name_space(ns_file.as_fd(), Some(LinkNameSpaceType::Mount))
        .context("setns failed")?;
    std::env::set_current_dir(cwd)?;

    let mount_infos = Process::myself()?.mountinfo()?;
    let mut unmount_targets: Vec<MountInfo> = mount_infos
        .into_iter()
        .filter(|info| {
            should_unmount(
                &info.root,
                info.mount_point.to_str().unwrap_or(""),
                info.mount_source.as_deref(),
            )
        })
        .collect();

    // Unmount in reverse order of mnt_id to handle nested mounts correctly.
    unmount_targets.sort_by_key(|info| std::cmp::Reverse(info.mnt_id));

    for target in unmount_targets {
        let path = target.mount_point.to_str().unwrap_or("");
        debug!("hide: unmounting {} (mnt_id: {})", path, target.mnt_id);
        if let Ok(path_cstr) = CString::new(path) {
            unsafe {
                if libc::umount2(path_cstr.as_ptr(), libc::MNT_DETACH) == -1 {
                    error!("hide: failed to unmount {}: {}", path, Error::last_os_error());
                }
            }
        }
    }
    Ok(())
}

fn should_unmount(root: &str, mount_point: &str, source: Option<&str>) -> bool {
    constants::SENSITIVE_MOUNT_ROOTS
        .iter()
        .any(|prefix| root.starts_with(prefix))
        || constants::SENSITIVE_MOUNT_POINTS
            .iter()
            .any(|prefix| mount_point.starts_with(prefix))
        || source.is_some_and(|s| constants::SENSITIVE_MOUNT_SOURCES.contains(&s))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn module_mounts_are_selected() {
        assert!(should_unmount("/adb/modules/foo", "/system/lib64/libfoo.so", None));
        assert!(should_unmount("/", "/data/adb/modules", Some("/dev/block/loop7")));
        assert!(should_unmount("/", "/debug_ramdisk", Some("magisk")));
        assert!(should_unmount("/", "/data/misc", Some("KSU")));
    }

    #[test]
    fn ordinary_mounts_are_left_alone() {
        assert!(!should_unmount("/", "/system", Some("/dev/block/dm-0")));
        assert!(!should_unmount("/", "/data", Some("/dev/block/by-name/userdata")));
        assert!(!should_unmount("/", "/proc", Some("proc")));
    }
}
