// src/state.rs

//! Shared monitor state: the hide rule set and the uid → process-name map
//! derived from it.
//!
//! Everything in here is guarded by a single mutex. The controller thread
//! reads the map while classifying freshly forked children; the control
//! plane mutates the rule set from other threads. `lock()` is that mutex.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, OnceLock};

use log::debug;

use crate::constants::{APP_DATA_DIR, APP_DATA_DIR_LEGACY, ISOLATED_KEY, ISOLATED_MAGIC};

#[derive(Default)]
pub struct MonitorState {
    /// Configured `(package, process)` rules. A package equal to
    /// `ISOLATED_MAGIC` marks an isolated-process rule.
    hide_set: BTreeSet<(String, String)>,
    /// Installed-app uid → process names to look for. Key `ISOLATED_KEY`
    /// collects the isolated rules.
    uid_proc_map: BTreeMap<i32, Vec<String>>,
    /// Whether hiding is active at all.
    enabled: bool,
}

impl MonitorState {
    /// Adds a rule. Returns false if it was already present.
    pub fn add_rule(&mut self, package: &str, process: &str) -> bool {
        self.hide_set.insert((package.to_string(), process.to_string()))
    }

    /// Removes a rule. Returns false if it was not present.
    pub fn remove_rule(&mut self, package: &str, process: &str) -> bool {
        self.hide_set.remove(&(package.to_string(), process.to_string()))
    }

    pub fn rules(&self) -> impl Iterator<Item = &(String, String)> {
        self.hide_set.iter()
    }

    pub(crate) fn uid_map(&self) -> &BTreeMap<i32, Vec<String>> {
        &self.uid_proc_map
    }

    pub fn hide_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, on: bool) {
        self.enabled = on;
    }

    /// Rebuilds the uid map from the rule set and the on-disk per-user
    /// app-data directories.
    pub fn refresh_uid_map(&mut self) {
        self.refresh_uid_map_from(Path::new(app_data_dir()));
    }

    /// Every entry of `data_root` is one multi-user partition; the owning
    /// uid of `<user>/<package>` tells us which uid an installed package
    /// runs under. Isolated rules are collected once, under `ISOLATED_KEY`.
    pub(crate) fn refresh_uid_map_from(&mut self, data_root: &Path) {
        self.uid_proc_map.clear();
        let Ok(entries) = fs::read_dir(data_root) else {
            debug!("state: no app data under {}", data_root.display());
            return;
        };
        let mut first_user = true;
        for entry in entries.flatten() {
            let user_dir = entry.path();
            for (package, process) in &self.hide_set {
                if package == ISOLATED_MAGIC {
                    if first_user {
                        self.uid_proc_map
                            .entry(ISOLATED_KEY)
                            .or_default()
                            .push(process.clone());
                    }
                    continue;
                }
                let Ok(meta) = fs::metadata(user_dir.join(package)) else {
                    continue;
                };
                self.uid_proc_map
                    .entry(meta.uid() as i32)
                    .or_default()
                    .push(process.clone());
            }
            first_user = false;
        }
    }

    /// Teardown clearing: rules, map and the enabled flag all go.
    pub fn reset(&mut self) {
        self.hide_set.clear();
        self.uid_proc_map.clear();
        self.enabled = false;
    }
}

static STATE: OnceLock<Mutex<MonitorState>> = OnceLock::new();

/// The monitor lock. External writers to the rule set must go through this.
pub fn lock() -> MutexGuard<'static, MonitorState> {
    STATE
        .get_or_init(|| Mutex::new(MonitorState::default()))
        .lock()
        .unwrap()
}

pub fn set_hide_state(on: bool) {
    lock().set_enabled(on);
}

pub fn hide_state() -> bool {
    lock().hide_enabled()
}

fn app_data_dir() -> &'static str {
    if Path::new(APP_DATA_DIR).exists() {
        APP_DATA_DIR
    } else {
        APP_DATA_DIR_LEGACY
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn state_with(rules: &[(&str, &str)]) -> MonitorState {
        let mut state = MonitorState::default();
        for (package, process) in rules {
            assert!(state.add_rule(package, process));
        }
        state
    }

    #[test]
    fn rules_can_be_added_and_removed() {
        let mut state = MonitorState::default();
        assert!(state.add_rule("com.target", "com.target"));
        assert!(!state.add_rule("com.target", "com.target"));
        assert!(state.remove_rule("com.target", "com.target"));
        assert!(!state.remove_rule("com.target", "com.target"));
    }

    #[test]
    fn refresh_maps_installed_packages_to_their_uid() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("0/com.target")).unwrap();
        let our_uid = fs::metadata(root.path().join("0/com.target")).unwrap().uid() as i32;

        let mut state = state_with(&[
            ("com.target", "com.target"),
            ("com.target", "com.target:push"),
            ("com.absent", "com.absent"),
        ]);
        state.refresh_uid_map_from(root.path());

        let names = state.uid_map().get(&our_uid).expect("uid entry");
        assert_eq!(names, &["com.target".to_string(), "com.target:push".to_string()]);
        // Packages without a data directory contribute nothing.
        assert_eq!(state.uid_map().len(), 1);
    }

    #[test]
    fn isolated_rules_are_collected_once() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("0")).unwrap();
        fs::create_dir_all(root.path().join("10")).unwrap();

        let mut state = state_with(&[(ISOLATED_MAGIC, "com.target:iso")]);
        state.refresh_uid_map_from(root.path());

        // Two user partitions, but the isolated entry appears exactly once.
        let names = state.uid_map().get(&ISOLATED_KEY).expect("isolated entry");
        assert_eq!(names, &["com.target:iso".to_string()]);
    }

    #[test]
    fn package_installed_for_every_user_is_listed_per_user() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("0/com.target")).unwrap();
        fs::create_dir_all(root.path().join("10/com.target")).unwrap();
        let our_uid = fs::metadata(root.path().join("0/com.target")).unwrap().uid() as i32;

        let mut state = state_with(&[("com.target", "com.target")]);
        state.refresh_uid_map_from(root.path());

        // One appended entry per user directory that carries the package.
        assert_eq!(state.uid_map().get(&our_uid).map(Vec::len), Some(2));
    }

    #[test]
    fn refresh_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("0/com.target")).unwrap();

        let mut state = state_with(&[
            ("com.target", "com.target"),
            (ISOLATED_MAGIC, "com.target:iso"),
        ]);
        state.refresh_uid_map_from(root.path());
        let first = state.uid_map().clone();
        state.refresh_uid_map_from(root.path());
        assert_eq!(&first, state.uid_map());
    }

    #[test]
    fn refresh_against_missing_root_empties_the_map() {
        let mut state = state_with(&[("com.target", "com.target")]);
        state.uid_proc_map.insert(1234, vec!["stale".to_string()]);
        state.refresh_uid_map_from(Path::new("/nonexistent/hidemon-test"));
        assert!(state.uid_map().is_empty());
    }

    #[test]
    fn reset_clears_rules_map_and_flag() {
        let mut state = state_with(&[("com.target", "com.target")]);
        state.set_enabled(true);
        state.uid_proc_map.insert(10001, vec!["com.target".to_string()]);
        state.reset();
        assert_eq!(state.rules().count(), 0);
        assert!(state.uid_map().is_empty());
        assert!(!state.hide_enabled());
    }
}
