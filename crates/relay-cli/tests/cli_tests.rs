//! Integration tests for the `task-relay` binary (spec.md §6).

use assert_cmd::Command;
use predicates::str::contains;

fn task_relay() -> Command {
    #[allow(deprecated)]
    Command::cargo_bin("task-relay").expect("binary `task-relay` should be built")
}

#[test]
fn help_flag_prints_usage() {
    task_relay()
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("task-relay"))
        .stdout(contains("serve"));
}

#[test]
fn version_flag_prints_version() {
    task_relay()
        .arg("--version")
        .assert()
        .success()
        .stdout(contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn unknown_subcommand_gives_error() {
    task_relay()
        .arg("nonexistent")
        .assert()
        .failure()
        .stderr(contains("unrecognized subcommand"));
}

#[test]
fn serve_sqlite_without_path_exits_nonzero() {
    // spec.md §6: "Exit non-zero on invalid combinations". `--storage
    // sqlite` with no `--sqlite <path>` fails relay-config's validation
    // before anything is bound or spawned.
    task_relay()
        .args(["serve", "--storage", "sqlite"])
        .assert()
        .failure()
        .code(1)
        .stderr(contains("--sqlite"));
}

#[test]
fn serve_missing_storage_value_is_a_clap_error() {
    task_relay()
        .args(["serve", "--storage", "postgres"])
        .assert()
        .failure()
        .stderr(contains("invalid value"));
}
