// src/lib.rs

//! Process-lineage monitoring for target hiding.
//!
//! The crate traces the Android zygotes over ptrace and watches every fork
//! they report. A forked child that belongs to a configured target
//! application is caught after it has specialized (own uid, process name and
//! mount namespace) but before it runs any user code; the child is left
//! stopped and handed to an unmount worker that cleans its mount namespace
//! and resumes it.
//!
//! The embedding daemon drives the crate through a small surface:
//! [`monitor::proc_monitor`] as the controller thread body, [`state::lock`]
//! to mutate the rule set, [`state::set_hide_state`] to toggle hiding, and
//! the reserved terminate signal ([`constants::sig_term_monitor`]) to shut
//! the controller down.

pub mod classify;
pub mod constants;
pub mod hide;
pub mod monitor;
pub mod pid_set;
pub mod proc;
pub mod state;
pub mod utils;
