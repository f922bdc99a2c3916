#[path = "common/mod.rs"]
mod common;

use std::fs;

use common::Fleet;
use predicates::prelude::*;

#[test]
fn unknown_target_is_a_usage_error() {
    let fleet = Fleet::new();
    fleet.service(&fleet.stacks, "blog");

    fleet
        .command()
        .arg("--search-path")
        .arg(&fleet.stacks)
        .args(["start", "blog", "nosuch"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("nosuch"));
    assert!(fleet.calls().is_empty(), "nothing may run before resolution");
}

#[test]
fn unknown_subservice_is_a_usage_error() {
    let fleet = Fleet::new();
    fleet.service(&fleet.stacks, "blog");

    fleet
        .command()
        .arg("--search-path")
        .arg(&fleet.stacks)
        .args(["stop", "blog/worker"])
        .assert()
        .code(2);
    assert!(fleet.calls().is_empty());
}

#[test]
fn dependency_cycle_is_reported_before_any_action() {
    let fleet = Fleet::new();
    let a = fleet.service(&fleet.stacks, "a");
    let b = fleet.service(&fleet.stacks, "b");
    fs::write(a.join("dockyard.yml"), "depends_on: [b]\n").unwrap();
    fs::write(b.join("dockyard.yml"), "depends_on: [a]\n").unwrap();

    fleet
        .command()
        .arg("--search-path")
        .arg(&fleet.stacks)
        .args(["start", "a"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("cycle"));
    assert!(fleet.calls().is_empty());
}

#[test]
fn status_alias_matches_info() {
    let fleet = Fleet::new();
    fleet.service(&fleet.stacks, "blog");

    fleet
        .command()
        .arg("--search-path")
        .arg(&fleet.stacks)
        .args(["status", "blog"])
        .assert()
        .success()
        .stdout(predicate::str::contains("blog"))
        .stdout(predicate::str::contains("app"));
}

#[test]
fn invalid_config_is_rejected() {
    let fleet = Fleet::new();
    fs::write(&fleet.config, "compose_comand: [docker]\n").unwrap();

    fleet.command().arg("list").assert().code(2);
}

#[test]
fn missing_subcommand_prints_usage() {
    let fleet = Fleet::new();
    fleet
        .command()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn shell_passes_trailing_command_and_exit_code() {
    let fleet = Fleet::new();
    fleet.service(&fleet.stacks, "blog");

    fleet
        .command()
        .arg("--search-path")
        .arg(&fleet.stacks)
        .args(["shell", "blog", "app", "--", "true"])
        .assert()
        .success();
    assert!(
        fleet
            .calls()
            .iter()
            .any(|call| call.contains("exec app true")),
        "{:?}",
        fleet.calls()
    );
}

#[test]
fn logs_reject_all_as_usage_error() {
    let fleet = Fleet::new();
    fleet.service(&fleet.stacks, "alpha");
    fleet.service(&fleet.stacks, "bravo");

    fleet
        .command()
        .arg("--search-path")
        .arg(&fleet.stacks)
        .args(["logs", "all"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("ambiguous"));
    assert!(fleet.calls().is_empty());
}
