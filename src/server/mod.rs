//! Daemon that keeps the active generation loaded and runs imports
//!
//! - `npsearch daemon start`: opens the data directory, listens on a Unix socket
//! - Client: sends requests, falls back to opening the data directory directly
//!   when no daemon answers

mod client;
pub mod daemon;
pub mod protocol;

pub use client::{ClientError, ExportSummary, IndexClient};

use std::path::PathBuf;

fn runtime_file(name: &str) -> PathBuf {
    // XDG_RUNTIME_DIR is per-user and tmpfs-backed
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir).join(name);
    }
    if let Some(home) = dirs::home_dir() {
        return home.join(".local").join("run").join(name);
    }
    let uid = unsafe { libc::getuid() };
    PathBuf::from(format!("/tmp/{}-{}", uid, name))
}

pub fn get_socket_path() -> PathBuf {
    runtime_file("npsearch.sock")
}

pub fn get_pid_path() -> PathBuf {
    runtime_file("npsearch.pid")
}

/// Whether the process named in the PID file is alive
pub fn is_daemon_running() -> bool {
    let Ok(pid_str) = std::fs::read_to_string(get_pid_path()) else {
        return false;
    };
    match pid_str.trim().parse::<i32>() {
        Ok(pid) => unsafe { libc::kill(pid, 0) == 0 },
        Err(_) => false,
    }
}
