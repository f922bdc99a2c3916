#[path = "common/mod.rs"]
mod common;

use std::fs;

use common::Fleet;
use serde_json::Value;

fn list_json(fleet: &Fleet, extra: &[&std::path::Path]) -> Value {
    let mut cmd = fleet.command();
    for path in extra {
        cmd.arg("--search-path").arg(path);
    }
    let output = cmd
        .arg("list")
        .arg("--json")
        .output()
        .expect("failed to run list");
    assert!(
        output.status.success(),
        "list failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("list output is not json")
}

fn service_names(listing: &Value) -> Vec<String> {
    listing["services"]
        .as_array()
        .expect("services array")
        .iter()
        .map(|s| s["name"].as_str().expect("name").to_string())
        .collect()
}

#[test]
fn working_directory_shadows_host_local_service() {
    let fleet = Fleet::new();
    let winner = fleet.service(&fleet.cwd, "blog");
    let loser = fleet.service(&fleet.local_dir(), "blog");
    fleet.service(&fleet.local_dir(), "wiki");

    let listing = list_json(&fleet, &[]);
    assert_eq!(service_names(&listing), vec!["blog", "wiki"]);
    assert_eq!(
        listing["services"][0]["root_path"].as_str(),
        Some(winner.to_str().unwrap())
    );

    let warnings: Vec<&str> = listing["warnings"]
        .as_array()
        .expect("warnings array")
        .iter()
        .filter_map(Value::as_str)
        .collect();
    assert_eq!(warnings.len(), 1, "warnings: {warnings:?}");
    assert!(warnings[0].contains("blog"));
    assert!(warnings[0].contains(loser.to_str().unwrap()));
}

#[test]
fn extra_search_paths_come_after_defaults() {
    let fleet = Fleet::new();
    fleet.service(&fleet.stacks, "blog");
    fleet.service(&fleet.stacks, "mail");
    let local = fleet.service(&fleet.local_dir(), "blog");

    let listing = list_json(&fleet, &[&fleet.stacks]);
    assert_eq!(service_names(&listing), vec!["blog", "mail"]);
    assert_eq!(
        listing["services"][0]["root_path"].as_str(),
        Some(local.to_str().unwrap())
    );
}

#[test]
fn directories_without_compose_definition_are_skipped_silently() {
    let fleet = Fleet::new();
    fleet.service(&fleet.stacks, "blog");
    fs::create_dir_all(fleet.stacks.join("notes")).unwrap();
    fs::write(fleet.stacks.join("notes/README.md"), "not a service").unwrap();
    fs::write(fleet.stacks.join("stray.yaml"), "services: {}").unwrap();

    let listing = list_json(&fleet, &[&fleet.stacks]);
    assert_eq!(service_names(&listing), vec!["blog"]);
    assert!(listing["warnings"].as_array().unwrap().is_empty());
}

#[test]
fn directory_named_all_is_rejected_with_warning() {
    let fleet = Fleet::new();
    fleet.service(&fleet.stacks, "all");
    fleet.service(&fleet.stacks, "blog");

    let listing = list_json(&fleet, &[&fleet.stacks]);
    assert_eq!(service_names(&listing), vec!["blog"]);
    let warnings = listing["warnings"].as_array().unwrap();
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].as_str().unwrap().contains("reserved"));
}

#[test]
fn list_reports_snapshot_readiness_and_subservices() {
    let fleet = Fleet::new();
    let blog = fleet.service(&fleet.stacks, "blog");
    fs::write(
        blog.join("compose.yaml"),
        "services:\n  web:\n    image: nginx\n  db:\n    image: postgres\n",
    )
    .unwrap();
    fleet.service(&fleet.stacks, "mail");

    let listing = list_json(&fleet, &[&fleet.stacks]);
    let blog = &listing["services"][0];
    assert_eq!(blog["subservices"], serde_json::json!(["web", "db"]));
    assert_eq!(blog["snapshot"], "no-livedata");
}

#[test]
fn list_prints_table_by_default() {
    let fleet = Fleet::new();
    fleet.service(&fleet.stacks, "blog");

    fleet
        .command()
        .arg("--search-path")
        .arg(&fleet.stacks)
        .arg("list")
        .assert()
        .success()
        .stdout(predicates::str::contains("SERVICE"))
        .stdout(predicates::str::contains("blog"));
}
