// src/main.rs

//! Main entry point for the hidemon daemon.
//!
//! The binary has two modes of operation based on its command-line
//! arguments:
//! - No arguments: runs the monitor until the terminate signal arrives.
//! - `version`: prints the daemon version.

use hidemon::{constants, monitor, state, utils};
use log::error;

/// Initializes the Android logger with a specific tag.
fn init_android_logger(tag: &str) {
    android_logger::init_once(
        android_logger::Config::default()
            .with_max_level(constants::MAX_LOG_LEVEL)
            .with_tag(tag),
    );
}

/// Parses command-line arguments and dispatches to the correct logic.
fn start() {
    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("version") => {
            println!("hidemon {}", constants::VERSION);
        }
        _ => run_monitor(),
    }
}

/// Launches the controller thread and waits for it to terminate.
fn run_monitor() {
    // The monitor's signals must reach only the controller thread; block
    // them here so every thread inherits the mask, the controller unblocks
    // its own.
    utils::block_monitor_signals();
    state::set_hide_state(true);

    let controller = std::thread::Builder::new()
        .name("proc_monitor".to_string())
        .spawn(monitor::proc_monitor);
    match controller {
        Ok(handle) => {
            if handle.join().is_err() {
                error!("Monitor thread panicked");
            }
        }
        Err(e) => error!("Failed to launch the monitor thread: {}", e),
    }
}

fn main() {
    // Use the binary name as the log tag.
    let arg0 = std::env::args().next().unwrap_or_default();
    let process_name = arg0.split('/').next_back().unwrap_or("hidemon");
    init_android_logger(process_name);

    start();
}
