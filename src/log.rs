//! Simple file-based logging.
//!
//! The daemon runs with stdio redirected to /dev/null, so lifecycle
//! events go to `<registry-dir>/sesh.log` as JSONL. Appends are
//! best-effort: a logging failure must never take down a session.

use chrono::Utc;
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;

use crate::config::Config;

/// Log entry structure for safe JSON serialization
#[derive(Serialize)]
struct LogEntry<'a> {
    ts: String,
    level: String,
    subsystem: &'a str,
    event: &'a str,
    pid: u32,
    msg: &'a str,
}

/// Append one entry to the log file.
///
/// The registry directory is never created here; until a session (or any
/// registry operation) has set it up, entries are dropped.
pub fn log(level: &str, subsystem: &str, event: &str, message: &str) {
    let path = crate::registry::log_path();
    if !path.parent().map(|p| p.is_dir()).unwrap_or(false) {
        return;
    }

    let entry = LogEntry {
        ts: Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        level: level.to_uppercase(),
        subsystem,
        event,
        pid: std::process::id(),
        msg: message,
    };

    // Serialize with serde_json for proper escaping
    let log_line = match serde_json::to_string(&entry) {
        Ok(line) => line,
        Err(_) => return,
    };

    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(&path) {
        let _ = writeln!(file, "{}", log_line);
    }
}

/// Log info message
pub fn log_info(subsystem: &str, event: &str, message: &str) {
    log("info", subsystem, event, message);
}

/// Log warning message
pub fn log_warn(subsystem: &str, event: &str, message: &str) {
    log("warn", subsystem, event, message);
}

/// Log error message
pub fn log_error(subsystem: &str, event: &str, message: &str) {
    log("error", subsystem, event, message);
}

/// Log debug message (only when SESH_DEBUG=1)
pub fn log_debug(subsystem: &str, event: &str, message: &str) {
    if Config::get().debug {
        log("debug", subsystem, event, message);
    }
}
