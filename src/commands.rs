//! Command fronts for the registry-facing subcommands.
//!
//! `create`/`open`/`kill` validate first and touch the registry only
//! afterwards; `list` is read-only apart from opportunistic stale
//! cleanup inside enumeration.

use std::time::Duration;

use anyhow::{bail, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::Serialize;

use crate::client;
use crate::registry::{self, SessionRecord};
use crate::server;

/// JSON envelope for `list --json`.
#[derive(Serialize)]
struct SessionList {
    sessions: Vec<SessionRecord>,
}

pub fn create(name: &str, command: Option<&str>) -> Result<()> {
    server::create(name, command)
}

/// Create-or-attach: attach when a live daemon exists, otherwise clean
/// any stale files, create, and attach after a short settle.
pub fn open(name: &str, command: Option<&str>) -> Result<i32> {
    if !registry::is_valid_name(name) {
        bail!("invalid session name '{}'", name);
    }
    registry::ensure_dir()?;

    if registry::socket_path(name).exists() {
        if registry::live(name) {
            return client::attach(name);
        }
        registry::cleanup(name);
    }

    server::create(name, command)?;
    std::thread::sleep(Duration::from_millis(100));
    client::attach(name)
}

pub fn list(json: bool) -> Result<()> {
    let sessions = registry::enumerate()?;

    if json {
        println!("{}", serde_json::to_string(&SessionList { sessions })?);
    } else if sessions.is_empty() {
        println!("No active sessions.");
    } else {
        println!("Active sessions:");
        for s in &sessions {
            println!(
                "  {:<20}  pid={:<8}  clients={}  cmd={}",
                s.name, s.pid, s.clients, s.command
            );
        }
    }
    Ok(())
}

/// Terminate a session daemon, escalating to SIGKILL when it ignores
/// SIGTERM. Stale files are removed even when nothing was running.
pub fn kill_session(name: &str) -> Result<()> {
    if !registry::is_valid_name(name) {
        bail!("invalid session name '{}'", name);
    }
    registry::ensure_dir()?;

    let pid = registry::read_pid(name).unwrap_or(0);
    if !registry::process_alive(pid) {
        registry::cleanup(name);
        bail!("session '{}' not found", name);
    }

    let target = Pid::from_raw(pid);
    let _ = kill(target, Signal::SIGTERM);
    for _ in 0..10 {
        std::thread::sleep(Duration::from_millis(100));
        if !registry::process_alive(pid) {
            registry::cleanup(name);
            println!("Session '{}' killed.", name);
            return Ok(());
        }
    }

    let _ = kill(target, Signal::SIGKILL);
    std::thread::sleep(Duration::from_millis(100));
    registry::cleanup(name);
    println!("Session '{}' killed (SIGKILL).", name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_list_json_shape() {
        let list = SessionList {
            sessions: vec![SessionRecord {
                name: "demo".to_string(),
                clients: 2,
                created: 1700000000,
                command: "watch -n1 \"date\"".to_string(),
                pid: 4242,
            }],
        };
        let json = serde_json::to_string(&list).expect("serialize");
        assert!(json.starts_with("{\"sessions\":["));
        assert!(json.contains("\"name\":\"demo\""));
        assert!(json.contains("\"clients\":2"));
        assert!(json.contains("\"created\":1700000000"));
        assert!(json.contains("\"pid\":4242"));
        // Embedded quotes must be escaped per RFC 8259
        assert!(json.contains("\\\"date\\\""));
        let back: serde_json::Value = serde_json::from_str(&json).expect("well-formed");
        assert_eq!(back["sessions"][0]["command"], "watch -n1 \"date\"");
    }

    #[test]
    fn test_empty_session_list_json() {
        let json = serde_json::to_string(&SessionList { sessions: vec![] }).unwrap();
        assert_eq!(json, "{\"sessions\":[]}");
    }
}
