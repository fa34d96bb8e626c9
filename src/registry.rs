//! On-disk session registry.
//!
//! Single source of truth for the per-user registry directory and the
//! three files every live session owns: `<name>.sock`, `<name>.pid`,
//! `<name>.info`. Independent processes discover sessions by scanning
//! this directory; there is no index service.
//!
//! The directory is security-sensitive: sockets in a world-writable
//! temp root are only safe if the directory itself is a real directory,
//! owned by the invoking user, mode 0700. Every operation that touches
//! the registry goes through [`ensure_dir`] first.

use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use nix::sys::signal::kill;
use nix::unistd::{Pid, Uid};
use serde::Serialize;

use crate::config::Config;

/// Maximum session name length in bytes.
pub const MAX_NAME_LEN: usize = 64;

/// A session name is valid iff it is non-empty, at most 64 bytes, not a
/// path dot entry, and contains only `[A-Za-z0-9._-]`. Everything that
/// accepts a name calls this before touching the filesystem.
pub fn is_valid_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return false;
    }
    if name == "." || name == ".." {
        return false;
    }
    name.bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.')
}

/// Registry directory for the invoking user.
///
/// `SESH_DIR` overrides the location entirely (dev trees, tests);
/// otherwise `<temp-root>/sesh-<uid>`.
pub fn socket_dir() -> PathBuf {
    if let Some(dir) = Config::get().dir_override {
        return dir;
    }
    std::env::temp_dir().join(format!("sesh-{}", Uid::current()))
}

pub fn socket_path(name: &str) -> PathBuf {
    socket_dir().join(format!("{}.sock", name))
}

pub fn pid_path(name: &str) -> PathBuf {
    socket_dir().join(format!("{}.pid", name))
}

pub fn info_path(name: &str) -> PathBuf {
    socket_dir().join(format!("{}.info", name))
}

/// Daemon log file path (`sesh.log` has no `.sock` suffix, so the
/// scanner never mistakes it for a session).
pub fn log_path() -> PathBuf {
    socket_dir().join("sesh.log")
}

/// Create the registry directory if needed and verify it is safe to use.
///
/// Refuses a symlink, a non-directory, or a directory owned by another
/// uid. Permissions are forced to 0700 on every call.
pub fn ensure_dir() -> Result<PathBuf> {
    let dir = socket_dir();

    match fs::create_dir(&dir) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
        Err(e) => return Err(e).with_context(|| format!("cannot create {}", dir.display())),
    }

    // lstat, not stat: a symlink planted at this path must be seen as a
    // symlink, not as whatever it points to.
    let meta = fs::symlink_metadata(&dir)
        .with_context(|| format!("cannot stat registry directory {}", dir.display()))?;

    if meta.file_type().is_symlink() {
        bail!("registry directory {} is a symlink", dir.display());
    }
    if !meta.file_type().is_dir() {
        bail!("registry path {} is not a directory", dir.display());
    }
    if meta.uid() != Uid::current().as_raw() {
        bail!(
            "registry directory {} is owned by uid {}, not {}",
            dir.display(),
            meta.uid(),
            Uid::current()
        );
    }

    fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))
        .with_context(|| format!("cannot set permissions on {}", dir.display()))?;

    Ok(dir)
}

/// Whether a path fits in `sockaddr_un.sun_path` (104 bytes on macOS,
/// 108 on Linux, minus family and NUL).
pub fn socket_path_fits(path: &Path) -> bool {
    let max = std::mem::size_of::<libc::sockaddr_un>()
        - std::mem::size_of::<libc::sa_family_t>()
        - 1;
    path.as_os_str().len() < max
}

/// Null-signal probe: does a process with this pid exist (and can we
/// signal it)?
pub fn process_alive(pid: i32) -> bool {
    pid > 0 && kill(Pid::from_raw(pid), None).is_ok()
}

/// Read the daemon pid for a session. Returns None for a missing or
/// malformed pid file.
pub fn read_pid(name: &str) -> Option<i32> {
    let contents = fs::read_to_string(pid_path(name)).ok()?;
    contents.trim().parse::<i32>().ok().filter(|&p| p > 0)
}

/// Write the daemon pid file.
pub fn write_pid(name: &str, pid: i32) -> Result<()> {
    let path = pid_path(name);
    fs::write(&path, format!("{}\n", pid))
        .with_context(|| format!("cannot write pid file {}", path.display()))
}

/// Write the session info file (`key=value` lines).
pub fn write_info(name: &str, pid: i32, clients: usize, created: i64, cmd: &str) -> Result<()> {
    let path = info_path(name);
    let contents = format!(
        "pid={}\nclients={}\ncreated={}\ncmd={}\n",
        pid, clients, created, cmd
    );
    fs::write(&path, contents).with_context(|| format!("cannot write info file {}", path.display()))
}

/// Is there a live daemon for this session?
pub fn live(name: &str) -> bool {
    read_pid(name).map(process_alive).unwrap_or(false)
}

/// Remove the three registry files for a session. Every step is
/// idempotent, so racing cleanups are harmless.
pub fn cleanup(name: &str) {
    let _ = fs::remove_file(socket_path(name));
    let _ = fs::remove_file(pid_path(name));
    let _ = fs::remove_file(info_path(name));
}

/// One live session as discovered in the registry. Field names match
/// the JSON shape `list --json` emits.
#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    pub name: String,
    pub clients: usize,
    pub created: i64,
    pub command: String,
    pub pid: i32,
}

/// Parse an info file's `key=value` lines. Malformed lines are ignored.
fn parse_info(contents: &str) -> (usize, i64, Option<String>) {
    let mut clients = 0usize;
    let mut created = 0i64;
    let mut cmd = None;

    for line in contents.lines() {
        if let Some(v) = line.strip_prefix("clients=") {
            if let Ok(n) = v.trim().parse() {
                clients = n;
            }
        } else if let Some(v) = line.strip_prefix("created=") {
            if let Ok(n) = v.trim().parse() {
                created = n;
            }
        } else if let Some(v) = line.strip_prefix("cmd=") {
            cmd = Some(v.trim_end().to_string());
        }
    }

    (clients, created, cmd)
}

/// Scan the registry for live sessions.
///
/// Entries whose stem fails name validation are skipped outright, so a
/// hostile file in the directory cannot surface as a session. Sessions
/// whose daemon is gone have their three files removed and are omitted.
pub fn enumerate() -> Result<Vec<SessionRecord>> {
    let dir = ensure_dir()?;
    let mut result = Vec::new();

    let entries = match fs::read_dir(&dir) {
        Ok(e) => e,
        Err(_) => return Ok(result),
    };

    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let file_name = file_name.to_string_lossy();
        let Some(name) = file_name.strip_suffix(".sock") else {
            continue;
        };
        if !is_valid_name(name) {
            continue;
        }

        let pid = read_pid(name).unwrap_or(0);
        if !process_alive(pid) {
            cleanup(name);
            continue;
        }

        let (clients, created, cmd) = fs::read_to_string(info_path(name))
            .map(|c| parse_info(&c))
            .unwrap_or((0, 0, None));

        result.push(SessionRecord {
            name: name.to_string(),
            clients,
            created,
            command: cmd.unwrap_or_else(|| "bash".to_string()),
            pid,
        });
    }

    Ok(result)
}
