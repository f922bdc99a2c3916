#[path = "common/mod.rs"]
mod common;

use std::fs;

use common::Fleet;
use predicates::prelude::*;

#[test]
fn start_all_attempts_every_service_despite_one_failure() {
    let fleet = Fleet::new();
    for name in ["alpha", "bravo", "charlie", "delta", "echo"] {
        fleet.service(&fleet.stacks, name);
    }
    fs::write(fleet.stacks.join("charlie/fail-up"), "").unwrap();

    let output = fleet
        .command()
        .arg("--search-path")
        .arg(&fleet.stacks)
        .args(["start", "all"])
        .output()
        .expect("failed to run start");

    assert_eq!(output.status.code(), Some(1));
    let stdout = String::from_utf8_lossy(&output.stdout);
    for name in ["alpha", "bravo", "delta", "echo"] {
        assert!(
            stdout.contains(&format!("{name}: started")),
            "missing {name} in {stdout}"
        );
    }
    assert!(stdout.contains("charlie: "), "missing charlie in {stdout}");
    assert!(stdout.contains("pull access denied for charlie"));

    let ups = fleet
        .calls()
        .iter()
        .filter(|call| call.contains(" up -d"))
        .count();
    assert_eq!(ups, 5);

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("1 of 5 target(s) failed"));
}

#[test]
fn start_brings_up_dependencies_first() {
    let fleet = Fleet::new();
    let app = fleet.service(&fleet.stacks, "app");
    fleet.service(&fleet.stacks, "db");
    fs::write(app.join("dockyard.yml"), "depends_on: [db]\n").unwrap();

    fleet
        .command()
        .arg("--search-path")
        .arg(&fleet.stacks)
        .args(["start", "app"])
        .assert()
        .success()
        .stdout(predicate::str::contains("db: started (dependency)"))
        .stdout(predicate::str::contains("app: started"));

    let ups: Vec<String> = fleet
        .calls()
        .into_iter()
        .filter(|call| call.contains(" up -d"))
        .collect();
    assert_eq!(ups.len(), 2);
    assert!(ups[0].contains("/db"));
    assert!(ups[1].contains("/app"));
}

#[test]
fn stop_targets_a_single_subservice() {
    let fleet = Fleet::new();
    fleet.service(&fleet.stacks, "blog");

    fleet
        .command()
        .arg("--search-path")
        .arg(&fleet.stacks)
        .args(["stop", "blog/app"])
        .assert()
        .success()
        .stdout(predicate::str::contains("blog/app: stopped"));

    let calls = fleet.calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].ends_with("stop app"), "{calls:?}");
}

#[test]
fn restart_refuses_anonymous_volumes_without_opt_in() {
    let fleet = Fleet::new();
    let blog = fleet.service(&fleet.stacks, "blog");
    fs::write(
        blog.join("compose.yaml"),
        "services:\n  app:\n    image: nginx\n    volumes:\n      - /var/cache/nginx\n",
    )
    .unwrap();

    fleet
        .command()
        .arg("--search-path")
        .arg(&fleet.stacks)
        .args(["restart", "blog", "--yes"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Restart rebuilds and recreates"))
        .stdout(predicate::str::contains("/var/cache/nginx"));
    assert!(fleet.calls().is_empty());

    fleet
        .command()
        .arg("--search-path")
        .arg(&fleet.stacks)
        .args(["restart", "blog", "--yes", "--allow-orphaned-volumes"])
        .assert()
        .success()
        .stdout(predicate::str::contains("blog: recreated"));
    assert!(
        fleet
            .calls()
            .iter()
            .any(|call| call.contains("up -d --build --force-recreate --renew-anon-volumes"))
    );
}

#[test]
fn info_json_reports_running_subservice() {
    let fleet = Fleet::new();
    fleet.service(&fleet.stacks, "blog");

    let output = fleet
        .command()
        .arg("--search-path")
        .arg(&fleet.stacks)
        .args(["info", "blog", "--json"])
        .output()
        .expect("failed to run info");
    assert!(output.status.success());

    let reports: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(reports[0]["target"], "blog");
    assert_eq!(reports[0]["subservices"][0]["name"], "app");
    assert_eq!(reports[0]["subservices"][0]["running"], true);
    assert_eq!(reports[0]["subservices"][0]["image"], "blog:latest");
}

#[test]
fn snapshot_without_livedata_fails_per_target() {
    let fleet = Fleet::new();
    fleet.service(&fleet.stacks, "blog");

    fleet
        .command()
        .arg("--search-path")
        .arg(&fleet.stacks)
        .args(["snapshot", "blog"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("no livedata/ directory"));
    assert!(!fleet.stacks.join("blog/livedata-snapshots").exists());
}

#[test]
fn clean_with_nothing_to_remove_succeeds() {
    let fleet = Fleet::new();
    fleet.service(&fleet.stacks, "blog");

    fleet
        .command()
        .arg("--search-path")
        .arg(&fleet.stacks)
        .args(["clean", "--yes"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed 0 container(s) and 0 volume(s)"));
}
