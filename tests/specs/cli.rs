//! Black-box specs for the `arbor` and `arborw` binaries.

use assert_cmd::cargo::cargo_bin;
use assert_cmd::Command;
use tempfile::TempDir;

#[test]
fn help_names_the_run_subcommand() {
    let output = Command::new(cargo_bin("arbor"))
        .arg("--help")
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("run"));
}

#[test]
fn run_drives_a_shell_tree_over_the_local_backend() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("tree");
    let marker = dir.path().join("done");

    Command::new(cargo_bin("arbor"))
        .arg("run")
        .arg(&root)
        .arg("--command")
        .arg(format!("touch {}", marker.display()))
        .arg("--worker-binary")
        .arg(cargo_bin("arborw"))
        .arg("--max-jobs")
        .arg("2")
        .assert()
        .success();

    assert!(marker.is_file());
    // The tree drained: no record directories remain.
    let jobs = root.join("jobs");
    let remaining: Vec<_> = std::fs::read_dir(&jobs)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().join("job.json").exists())
        .collect();
    assert!(remaining.is_empty());
}

#[test]
fn run_propagates_permanent_failure_in_its_exit_code() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("tree");

    Command::new(cargo_bin("arbor"))
        .arg("run")
        .arg(&root)
        .arg("--command")
        .arg("exit 9")
        .arg("--worker-binary")
        .arg(cargo_bin("arborw"))
        .arg("--retry-count")
        .arg("0")
        .assert()
        .failure();
}

#[test]
fn resubmitting_an_existing_tree_is_rejected() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("tree");

    Command::new(cargo_bin("arbor"))
        .arg("run")
        .arg(&root)
        .arg("--command")
        .arg("true")
        .arg("--worker-binary")
        .arg(cargo_bin("arborw"))
        .assert()
        .success();

    let output = Command::new(cargo_bin("arbor"))
        .arg("run")
        .arg(&root)
        .arg("--command")
        .arg("true")
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("first submission"));
}

#[test]
fn arborw_rejects_malformed_invocations() {
    Command::new(cargo_bin("arborw"))
        .arg("--job")
        .assert()
        .code(2);
}
