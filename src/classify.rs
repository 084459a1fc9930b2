// src/classify.rs

//! Decides, for a freshly forked zygote child, whether it belongs to a
//! configured target application. Runs on the controller thread when a
//! traced child spawns its first threads; by then the platform has set the
//! child's uid and process name, but the child has not run any user code.

use std::collections::BTreeMap;

use log::{info, trace};
use nix::sys::signal::Signal;

use crate::constants::ZYGOTE_PROCESS_NAMES;
use crate::monitor::detach_pid;
use crate::pid_set::PidSet;
use crate::proc::{self, NsId};
use crate::{hide, state};

/// Outcome of matching a child against the uid map.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum RuleMatch {
    None,
    /// An isolated-process rule matched by prefix.
    Isolated,
    /// The matched name designates an app zygote.
    AppZygote,
    /// A regular app rule matched exactly; the namespace check decides.
    App,
}

/// Examines a traced child and settles its fate.
///
/// Returns true when the pid is done with (detached, possibly handed to the
/// unmount worker); false when the child is not ready to be judged yet and
/// the engine should keep tracing it.
pub fn check_pid(pid: i32, attaches: &mut PidSet, zygotes: &BTreeMap<i32, NsId>) -> bool {
    let Some(uid) = proc::uid(pid) else {
        // Process died unexpectedly, ignore.
        detach_pid(attaches, pid, None);
        return true;
    };

    // Still running as root: the zygote has not specialized the child yet.
    if uid == 0 {
        return false;
    }

    let Some(cmdline) = proc::cmdline(pid) else {
        detach_pid(attaches, pid, None);
        return true;
    };

    // Zygote-internal fork (usap pool, secondary zygote); keep watching.
    if ZYGOTE_PROCESS_NAMES.contains(&cmdline.as_str()) {
        return false;
    }

    let matched = {
        let state = state::lock();
        match_rules(state.uid_map(), uid, &cmdline)
    };

    match matched {
        RuleMatch::App => match proc::mnt_ns(pid) {
            Some(ns) if !shares_zygote_ns(&ns, zygotes) => {
                // Our target. Detach but leave it stopped; the unmount
                // worker resumes it once its namespace is clean.
                info!("classify: [{}] PID=[{}] UID=[{}]", cmdline, pid, uid);
                detach_pid(attaches, pid, Some(Signal::SIGSTOP));
                hide::hide_daemon(pid);
            }
            _ => {
                // Still inside a zygote namespace (or already gone): this
                // fork is not the one we are after.
                detach_pid(attaches, pid, None);
            }
        },
        RuleMatch::Isolated => {
            info!("classify: (isolated) [{}] PID=[{}] UID=[{}]", cmdline, pid, uid);
            // TODO: hand isolated processes and app zygotes to the unmount
            // worker too; for now they are only released.
            detach_pid(attaches, pid, None);
        }
        RuleMatch::AppZygote => {
            info!("classify: (app zygote) [{}] PID=[{}] UID=[{}]", cmdline, pid, uid);
            detach_pid(attaches, pid, None);
        }
        RuleMatch::None => {
            trace!("classify: [{}] is not a target", cmdline);
            detach_pid(attaches, pid, None);
        }
    }
    true
}

/// Pure rule lookup. An isolated uid (app id above 90000) is tried against
/// the isolated prefix rules; with no isolated rules configured it is never
/// a target, and with unmatched ones it falls through to the regular
/// per-uid list.
pub(crate) fn match_rules(
    map: &BTreeMap<i32, Vec<String>>,
    uid: u32,
    cmdline: &str,
) -> RuleMatch {
    if uid % 100_000 > 90_000 {
        let Some(names) = map.get(&crate::constants::ISOLATED_KEY) else {
            return RuleMatch::None;
        };
        if names.iter().any(|name| cmdline.starts_with(name.as_str())) {
            return RuleMatch::Isolated;
        }
    }

    let Some(names) = map.get(&(uid as i32)) else {
        return RuleMatch::None;
    };
    for name in names {
        if name != cmdline {
            continue;
        }
        if name.ends_with("_zygote") {
            return RuleMatch::AppZygote;
        }
        return RuleMatch::App;
    }
    RuleMatch::None
}

/// True when the child still lives in the mount namespace of any known
/// zygote, i.e. has not unshared yet.
pub(crate) fn shares_zygote_ns(ns: &NsId, zygotes: &BTreeMap<i32, NsId>) -> bool {
    zygotes.values().any(|zygote_ns| zygote_ns == ns)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::constants::ISOLATED_KEY;

    fn map(entries: &[(i32, &[&str])]) -> BTreeMap<i32, Vec<String>> {
        entries
            .iter()
            .map(|(uid, names)| (*uid, names.iter().map(|n| n.to_string()).collect()))
            .collect()
    }

    #[test]
    fn unrelated_app_is_not_a_target() {
        let map = map(&[]);
        assert_eq!(match_rules(&map, 10050, "com.example.unrelated"), RuleMatch::None);
    }

    #[test]
    fn configured_app_matches_exactly() {
        let map = map(&[(10101, &["com.target"])]);
        assert_eq!(match_rules(&map, 10101, "com.target"), RuleMatch::App);
        assert_eq!(match_rules(&map, 10101, "com.target.other"), RuleMatch::None);
        assert_eq!(match_rules(&map, 10102, "com.target"), RuleMatch::None);
    }

    #[test]
    fn app_zygote_is_told_apart_by_suffix() {
        let map = map(&[(10101, &["com.target_zygote"])]);
        assert_eq!(match_rules(&map, 10101, "com.target_zygote"), RuleMatch::AppZygote);
    }

    #[test]
    fn isolated_uid_matches_by_prefix() {
        let map = map(&[(ISOLATED_KEY, &["com.target:iso"])]);
        assert_eq!(match_rules(&map, 99210, "com.target:isolated"), RuleMatch::Isolated);
        assert_eq!(match_rules(&map, 99210, "com.other"), RuleMatch::None);
        // The same cmdline under a regular uid is not isolated.
        assert_eq!(match_rules(&map, 10101, "com.target:isolated"), RuleMatch::None);
    }

    #[test]
    fn isolated_uid_without_isolated_rules_is_never_a_target() {
        // No isolated rules configured: the regular list is not consulted.
        let map = map(&[(99210, &["com.fallthrough"])]);
        assert_eq!(match_rules(&map, 99210, "com.fallthrough"), RuleMatch::None);
    }

    #[test]
    fn unmatched_isolated_uid_falls_through_to_regular_rules() {
        let map = map(&[
            (ISOLATED_KEY, &["com.other:iso"]),
            (99210, &["com.fallthrough"]),
        ]);
        assert_eq!(match_rules(&map, 99210, "com.fallthrough"), RuleMatch::App);
    }

    #[test]
    fn multiuser_uid_is_isolated_by_app_id() {
        // User 1, app id 99210: still an isolated process.
        let map = map(&[(ISOLATED_KEY, &["com.target:iso"])]);
        assert_eq!(match_rules(&map, 199_210, "com.target:iso"), RuleMatch::Isolated);
    }

    #[test]
    fn namespace_sharing_detects_unseparated_children() {
        let zygotes: BTreeMap<i32, NsId> = [(100, (8, 499)), (101, (8, 498))].into();
        assert!(shares_zygote_ns(&(8, 499), &zygotes));
        assert!(shares_zygote_ns(&(8, 498), &zygotes));
        assert!(!shares_zygote_ns(&(8, 500), &zygotes));
        assert!(!shares_zygote_ns(&(9, 499), &zygotes));
    }
}
