//! Integration tests for the burrow CLI.
//!
//! These run the real binary against the local backend, with
//! `BURROW_HOME` pointed at a temporary directory.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

// -----------------------------------------------------------------------------
// Test helpers
// -----------------------------------------------------------------------------

#[allow(deprecated)]
fn burrow() -> Command {
    Command::cargo_bin("burrow").expect("failed to find burrow binary")
}

/// A burrow command whose working directory and data home are `dir`.
fn burrow_in(dir: &TempDir) -> Command {
    let mut cmd = burrow();
    cmd.current_dir(dir.path())
        .env("BURROW_HOME", dir.path().join("home"))
        .env_remove("BURROW_CONFIG")
        .env_remove("BURROW_THREAD");
    cmd
}

// -----------------------------------------------------------------------------
// Help and version
// -----------------------------------------------------------------------------

#[test]
fn test_help_shows_all_commands() {
    let output = burrow().arg("--help").output().unwrap();
    assert!(output.status.success());
    let help = String::from_utf8_lossy(&output.stdout);
    for command in [
        "init", "exec", "read", "write", "ls", "replace", "sandbox", "task", "provisioner",
    ] {
        assert!(help.contains(command), "missing {command} in:\n{help}");
    }
}

#[test]
fn test_version_shows_version() {
    burrow()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("burrow"));
}

#[test]
fn test_provisioner_help_shows_env_fallbacks() {
    burrow()
        .args(["provisioner", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("K8S_NAMESPACE"))
        .stdout(predicate::str::contains("KUBECONFIG_PATH"))
        .stdout(predicate::str::contains("--cluster"));
}

#[test]
fn test_exec_requires_thread() {
    burrow()
        .env_remove("BURROW_THREAD")
        .args(["exec", "--", "true"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--thread"));
}

// -----------------------------------------------------------------------------
// Init
// -----------------------------------------------------------------------------

#[test]
fn test_init_creates_config() {
    let dir = TempDir::new().unwrap();

    burrow_in(&dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("Created"));

    let content = fs::read_to_string(dir.path().join("burrow.toml")).unwrap();
    assert!(content.contains("[sandbox]"));
    assert!(content.contains("[subagents]"));
}

#[test]
fn test_init_skips_existing_without_force() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("burrow.toml"), "# existing").unwrap();

    burrow_in(&dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("already exists"));

    let content = fs::read_to_string(dir.path().join("burrow.toml")).unwrap();
    assert_eq!(content, "# existing");
}

#[test]
fn test_init_force_overwrites_existing() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("burrow.toml"), "# existing").unwrap();

    burrow_in(&dir)
        .args(["init", "--force"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Overwrote"));

    let content = fs::read_to_string(dir.path().join("burrow.toml")).unwrap();
    assert!(content.contains("[subagents]"));
}

// -----------------------------------------------------------------------------
// Config
// -----------------------------------------------------------------------------

#[test]
fn test_generated_config_is_usable() {
    let dir = TempDir::new().unwrap();
    burrow_in(&dir).arg("init").assert().success();

    burrow_in(&dir)
        .args(["--config", "burrow.toml", "exec", "--thread", "t1", "--", "echo", "ok"])
        .assert()
        .success()
        .stdout(predicate::str::contains("ok"));
}

#[test]
fn test_missing_explicit_config_fails() {
    let dir = TempDir::new().unwrap();

    burrow_in(&dir)
        .args(["--config", "nope.toml", "exec", "--thread", "t1", "--", "true"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Config file not found"));
}

#[test]
fn test_invalid_config_fails() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("burrow.toml"), "[sandbox]\nbackend = \"mainframe\"\n").unwrap();

    burrow_in(&dir)
        .args(["exec", "--thread", "t1", "--", "true"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to parse config file"));
}

// -----------------------------------------------------------------------------
// Sandbox operations on the local backend
// -----------------------------------------------------------------------------

#[test]
fn test_exec_prints_output() {
    let dir = TempDir::new().unwrap();

    burrow_in(&dir)
        .args(["exec", "--thread", "t1", "--", "echo", "hello"])
        .assert()
        .success()
        .stdout(predicate::str::contains("hello"));
}

#[test]
fn test_exec_propagates_exit_code() {
    let dir = TempDir::new().unwrap();

    burrow_in(&dir)
        .args(["exec", "--thread", "t1", "--", "echo oops >&2; exit 3"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("oops"));
}

#[test]
fn test_exec_rejects_bad_thread_id() {
    let dir = TempDir::new().unwrap();

    burrow_in(&dir)
        .args(["exec", "--thread", "../escape", "--", "true"])
        .assert()
        .failure();
}

#[test]
fn test_file_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = "/mnt/user-data/workspace/notes.md";

    burrow_in(&dir)
        .args(["write", "--thread", "t1", path, "one\ntwo\nthree\n"])
        .assert()
        .success()
        .stdout(predicate::str::contains("OK"));

    // Thread data lives on the host under BURROW_HOME.
    let host = dir
        .path()
        .join("home/threads/t1/user-data/workspace/notes.md");
    assert_eq!(fs::read_to_string(host).unwrap(), "one\ntwo\nthree\n");

    burrow_in(&dir)
        .args(["read", "--thread", "t1", path, "--start", "2", "--end", "2"])
        .assert()
        .success()
        .stdout(predicate::str::diff("two\n"));

    burrow_in(&dir)
        .args(["replace", "--thread", "t1", path, "two", "TWO"])
        .assert()
        .success();

    burrow_in(&dir)
        .args(["read", "--thread", "t1", path])
        .assert()
        .success()
        .stdout(predicate::str::contains("TWO"));

    burrow_in(&dir)
        .args(["ls", "--thread", "t1", "/mnt/user-data/workspace"])
        .assert()
        .success()
        .stdout(predicate::str::contains("notes.md"));
}

#[test]
fn test_read_missing_file_fails() {
    let dir = TempDir::new().unwrap();

    burrow_in(&dir)
        .args(["read", "--thread", "t1", "/mnt/user-data/workspace/absent.md"])
        .assert()
        .failure();
}

#[test]
fn test_ambiguous_replace_fails() {
    let dir = TempDir::new().unwrap();
    let path = "/mnt/user-data/workspace/dup.txt";

    burrow_in(&dir)
        .args(["write", "--thread", "t1", path, "x x"])
        .assert()
        .success();

    burrow_in(&dir)
        .args(["replace", "--thread", "t1", path, "x", "y"])
        .assert()
        .failure();

    burrow_in(&dir)
        .args(["replace", "--thread", "t1", path, "x", "y", "--all"])
        .assert()
        .success();

    burrow_in(&dir)
        .args(["read", "--thread", "t1", path])
        .assert()
        .success()
        .stdout(predicate::str::contains("y y"));
}

#[test]
fn test_sandbox_acquire_and_release() {
    let dir = TempDir::new().unwrap();

    burrow_in(&dir)
        .args(["sandbox", "acquire", "--thread", "t1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Running"));

    burrow_in(&dir)
        .args(["sandbox", "release", "--thread", "t1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Released"));
}

// -----------------------------------------------------------------------------
// Subagent tasks
// -----------------------------------------------------------------------------

#[test]
fn test_bash_task_succeeds() {
    let dir = TempDir::new().unwrap();

    burrow_in(&dir)
        .args([
            "task",
            "--thread",
            "t1",
            "--type",
            "bash",
            "--description",
            "say done",
            "echo done",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "[Subagent: bash] Task Succeeded. Result: done",
        ));
}

#[test]
fn test_unknown_subagent_type_fails() {
    let dir = TempDir::new().unwrap();

    burrow_in(&dir)
        .args(["task", "--thread", "t1", "--type", "coder", "hi"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown subagent type 'coder'"));
}

#[test]
fn test_timed_out_task_exits_nonzero() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("burrow.toml"),
        "[subagents.agents.bash]\ntimeout_seconds = 1\n",
    )
    .unwrap();

    burrow_in(&dir)
        .args(["task", "--thread", "t1", "--type", "bash", "sleep 5"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("Task timed out"));
}

#[test]
fn test_agents_lists_builtin_types() {
    let dir = TempDir::new().unwrap();

    burrow_in(&dir)
        .arg("agents")
        .assert()
        .success()
        .stdout(predicate::str::contains("general-purpose"))
        .stdout(predicate::str::contains("bash"))
        .stdout(predicate::str::contains("Timeout: 300s"));
}
