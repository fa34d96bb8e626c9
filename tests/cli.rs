//! End-to-end scenarios driving the real binary.
//!
//! Every test isolates its registry with a throwaway SESH_DIR and pins
//! SHELL to /bin/sh so session children behave the same on any host.

use std::path::Path;
use std::time::Duration;

use assert_cmd::Command;
use predicates::prelude::*;

fn sesh(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("sesh").expect("sesh binary");
    cmd.env("SESH_DIR", dir);
    cmd.env("SHELL", "/bin/sh");
    cmd
}

fn registry_files(dir: &Path) -> Vec<String> {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .filter(|n| {
                    n.ends_with(".sock") || n.ends_with(".pid") || n.ends_with(".info")
                })
                .collect()
        })
        .unwrap_or_default()
}

fn session_names(dir: &Path) -> Vec<String> {
    let out = sesh(dir)
        .args(["list", "--json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let v: serde_json::Value = serde_json::from_slice(&out).expect("list --json is valid JSON");
    v["sessions"]
        .as_array()
        .expect("sessions array")
        .iter()
        .map(|s| s["name"].as_str().unwrap().to_string())
        .collect()
}

#[test]
fn invalid_names_are_rejected_without_side_effects() {
    let tmp = tempfile::tempdir().unwrap();
    let long_name = "x".repeat(100);

    for name in ["../etc", "a b", "", long_name.as_str()] {
        sesh(tmp.path()).args(["create", name]).assert().failure();
    }
    for name in ["../etc", "a b", ""] {
        sesh(tmp.path()).args(["attach", name]).assert().failure();
        sesh(tmp.path()).args(["kill", name]).assert().failure();
    }

    assert!(registry_files(tmp.path()).is_empty());
}

#[test]
fn create_list_kill_lifecycle() {
    let tmp = tempfile::tempdir().unwrap();

    sesh(tmp.path())
        .args(["create", "test-a", "--", "sleep", "30"])
        .assert()
        .success();
    std::thread::sleep(Duration::from_millis(300));

    let out = sesh(tmp.path())
        .args(["list", "--json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let v: serde_json::Value = serde_json::from_slice(&out).expect("valid JSON");
    let rec = v["sessions"]
        .as_array()
        .unwrap()
        .iter()
        .find(|s| s["name"] == "test-a")
        .expect("test-a listed");
    assert_eq!(rec["clients"], 0);
    assert!(rec["pid"].as_i64().unwrap() > 0);
    assert_eq!(rec["command"], "sleep 30");

    sesh(tmp.path()).args(["kill", "test-a"]).assert().success();
    std::thread::sleep(Duration::from_millis(300));

    assert!(!session_names(tmp.path()).contains(&"test-a".to_string()));
    assert!(registry_files(tmp.path()).is_empty());
}

#[test]
fn valid_name_shapes_are_accepted() {
    let tmp = tempfile::tempdir().unwrap();

    for name in ["test-ok", "my_session", "v1.2", "ABC123"] {
        sesh(tmp.path())
            .args(["create", name, "--", "sleep", "30"])
            .assert()
            .success();
    }
    std::thread::sleep(Duration::from_millis(300));

    let names = session_names(tmp.path());
    for name in ["test-ok", "my_session", "v1.2", "ABC123"] {
        assert!(names.contains(&name.to_string()), "{} missing", name);
        sesh(tmp.path()).args(["kill", name]).assert().success();
    }
}

#[test]
fn duplicate_create_fails_and_leaves_first_running() {
    let tmp = tempfile::tempdir().unwrap();

    sesh(tmp.path())
        .args(["create", "test-b", "--", "sleep", "30"])
        .assert()
        .success();
    std::thread::sleep(Duration::from_millis(300));

    sesh(tmp.path())
        .args(["create", "test-b", "--", "sleep", "30"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));

    assert!(session_names(tmp.path()).contains(&"test-b".to_string()));
    sesh(tmp.path()).args(["kill", "test-b"]).assert().success();
}

#[test]
fn stale_files_are_removed_on_list() {
    let tmp = tempfile::tempdir().unwrap();

    sesh(tmp.path())
        .args(["create", "test-c", "--", "sleep", "30"])
        .assert()
        .success();
    std::thread::sleep(Duration::from_millis(300));

    let pid: i32 = std::fs::read_to_string(tmp.path().join("test-c.pid"))
        .expect("pid file")
        .trim()
        .parse()
        .expect("pid is numeric");
    assert!(pid > 0);

    // Kill the daemon without giving it a chance to clean up
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), nix::sys::signal::Signal::SIGKILL)
        .expect("SIGKILL daemon");
    std::thread::sleep(Duration::from_millis(200));

    assert!(!session_names(tmp.path()).contains(&"test-c".to_string()));
    assert!(registry_files(tmp.path()).is_empty());
}

#[test]
fn nonexistent_attach_and_kill_fail() {
    let tmp = tempfile::tempdir().unwrap();

    sesh(tmp.path())
        .args(["attach", "no-such"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not running"));

    sesh(tmp.path())
        .args(["kill", "no-such"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));

    assert!(registry_files(tmp.path()).is_empty());
}

#[test]
fn kill_is_idempotent_on_stale_files() {
    let tmp = tempfile::tempdir().unwrap();

    // Plant stale files by hand; kill must fail but still clean them
    std::fs::write(tmp.path().join("ghost.sock"), b"").unwrap();
    std::fs::write(tmp.path().join("ghost.pid"), format!("{}\n", i32::MAX)).unwrap();
    std::fs::write(tmp.path().join("ghost.info"), "pid=1\nclients=0\n").unwrap();

    sesh(tmp.path()).args(["kill", "ghost"]).assert().failure();
    assert!(registry_files(tmp.path()).is_empty());

    // A second kill stays a clean failure
    sesh(tmp.path()).args(["kill", "ghost"]).assert().failure();
}

#[test]
fn info_reports_stable_keys() {
    let tmp = tempfile::tempdir().unwrap();

    let out = sesh(tmp.path())
        .args(["info"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8_lossy(&out);
    for key in ["USER:", "CONDA:", "LOAD:", "DISK:", "JOBS:", "MUX:sesh", "SESSIONS:"] {
        assert!(text.contains(key), "missing {} in {}", key, text);
    }

    let out = sesh(tmp.path())
        .args(["info", "--json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let v: serde_json::Value = serde_json::from_slice(&out).expect("info --json is valid JSON");
    assert_eq!(v["backend"], "sesh");
    assert!(v["sessions"].is_number());
}

#[test]
fn version_prints_identity() {
    let tmp = tempfile::tempdir().unwrap();
    sesh(tmp.path())
        .args(["version"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("sesh "));
}
