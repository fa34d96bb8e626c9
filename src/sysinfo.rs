//! Host telemetry for the `info` command.
//!
//! Front-ends parse the KEY:VALUE output, so the key set and order are
//! stable. Fields that cannot be determined report "N/A" rather than
//! failing the whole command; numeric-looking values stay strings for
//! the same reason.

use std::process::Command;

use anyhow::Result;
use nix::sys::statvfs::statvfs;
use serde::Serialize;

use crate::registry;

/// Backend identifier reported to front-ends.
pub const BACKEND: &str = "sesh";

#[derive(Debug, Serialize)]
pub struct HostInfo {
    pub user: String,
    pub conda: String,
    pub load: String,
    pub disk: String,
    pub slurm_jobs: String,
    pub sessions: usize,
    pub backend: &'static str,
}

pub fn collect() -> HostInfo {
    let user = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
    let conda = std::env::var("CONDA_DEFAULT_ENV").unwrap_or_else(|_| "none".to_string());
    let sessions = registry::enumerate().map(|s| s.len()).unwrap_or(0);

    HostInfo {
        load: load_average(),
        disk: home_disk_usage(),
        slurm_jobs: slurm_job_count(&user),
        user,
        conda,
        sessions,
        backend: BACKEND,
    }
}

pub fn info(json: bool) -> Result<()> {
    let host = collect();

    if json {
        println!("{}", serde_json::to_string(&host)?);
    } else {
        println!("USER:{}", host.user);
        println!("CONDA:{}", host.conda);
        println!("LOAD:{}", host.load);
        println!("DISK:{}", host.disk);
        println!("JOBS:{}", host.slurm_jobs);
        println!("MUX:{}", host.backend);
        println!("SESSIONS:{}", host.sessions);
    }
    Ok(())
}

/// One-minute load average.
fn load_average() -> String {
    let mut avgs = [0f64; 3];
    // SAFETY: getloadavg writes at most 3 doubles into the array; the
    // returned sample count is checked before any element is read.
    let n = unsafe { libc::getloadavg(avgs.as_mut_ptr(), 3) };
    if n >= 1 {
        format!("{:.2}", avgs[0])
    } else {
        "N/A".to_string()
    }
}

/// Usage percentage of the filesystem holding $HOME.
fn home_disk_usage() -> String {
    let Ok(home) = std::env::var("HOME") else {
        return "N/A".to_string();
    };
    match statvfs(home.as_str()) {
        Ok(fs) => {
            let frag = fs.fragment_size() as u128;
            let total = fs.blocks() as u128 * frag;
            let avail = fs.blocks_available() as u128 * frag;
            if total == 0 {
                return "N/A".to_string();
            }
            format!("{}%", 100 * (total - avail) / total)
        }
        Err(_) => "N/A".to_string(),
    }
}

/// Count of the user's queued/running SLURM jobs.
///
/// squeue is exec'd directly with an argv, never through a shell, so
/// nothing from the environment is interpolated into a command line.
/// The username is still held to the session-name charset; anything
/// else reports N/A.
fn slurm_job_count(user: &str) -> String {
    let user_safe = !user.is_empty()
        && user
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.');
    if !user_safe {
        return "N/A".to_string();
    }

    match Command::new("squeue").args(["-u", user, "-h"]).output() {
        Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout)
            .lines()
            .filter(|l| !l.trim().is_empty())
            .count()
            .to_string(),
        _ => "N/A".to_string(),
    }
}
