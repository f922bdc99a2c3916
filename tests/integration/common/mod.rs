#![allow(dead_code)]

use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use assert_cmd::Command;
use tempfile::TempDir;

/// Stand-in for `docker compose`.
///
/// Appends every call to `$FAKE_COMPOSE_LOG`, fails `up` for services whose
/// directory contains a `fail-up` marker, and reports one running `app`
/// container from `ps`.
const FAKE_COMPOSE: &str = r#"#!/bin/sh
echo "$@" >> "$FAKE_COMPOSE_LOG"
dir=""
while [ $# -gt 0 ]; do
  case "$1" in
    -f) shift 2 ;;
    --project-directory) dir="$2"; shift 2 ;;
    *) break ;;
  esac
done
name=$(basename "$dir")
case "$1" in
  up)
    if [ -e "$dir/fail-up" ]; then
      echo "pull access denied for $name" >&2
      exit 1
    fi
    ;;
  ps)
    echo "{\"ID\":\"id-$name\",\"Name\":\"$name-app-1\",\"Service\":\"app\",\"State\":\"running\",\"Image\":\"$name:latest\"}"
    ;;
esac
exit 0
"#;

/// Scratch host layout: a working directory, a home directory and a fake compose tool.
pub struct Fleet {
    pub temp: TempDir,
    pub cwd: PathBuf,
    pub home: PathBuf,
    pub stacks: PathBuf,
    pub config: PathBuf,
    pub log: PathBuf,
}

impl Fleet {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().expect("failed to create tempdir");
        let root = temp.path().canonicalize().expect("failed to canonicalize tempdir");
        let cwd = root.join("work");
        let home = root.join("home");
        let stacks = root.join("stacks");
        for dir in [&cwd, &home, &stacks] {
            fs::create_dir_all(dir).expect("failed to create fleet dir");
        }

        let compose = root.join("fake-compose");
        fs::write(&compose, FAKE_COMPOSE).expect("failed to write fake compose");
        fs::set_permissions(&compose, fs::Permissions::from_mode(0o755))
            .expect("failed to chmod fake compose");

        let config = root.join("config.yaml");
        fs::write(
            &config,
            format!(
                "compose_command: [\"{}\"]\nruntime_command: [\"{}\"]\ncommand_timeout: 30s\n",
                compose.display(),
                compose.display()
            ),
        )
        .expect("failed to write config");

        Self {
            log: root.join("compose.log"),
            temp,
            cwd,
            home,
            stacks,
            config,
        }
    }

    /// Creates a service directory with a one-subservice compose file.
    pub fn service(&self, parent: &Path, name: &str) -> PathBuf {
        let dir = parent.join(name);
        fs::create_dir_all(&dir).expect("failed to create service dir");
        fs::write(
            dir.join("compose.yaml"),
            "services:\n  app:\n    image: nginx:alpine\n",
        )
        .expect("failed to write compose file");
        dir
    }

    /// Host-local services directory under the fake home.
    pub fn local_dir(&self) -> PathBuf {
        let dir = self.home.join(".local/share/dockyard");
        fs::create_dir_all(&dir).expect("failed to create local dir");
        dir
    }

    /// A `dockyard` invocation isolated to this fleet.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("dockyard"));
        cmd.current_dir(&self.cwd)
            .env("HOME", &self.home)
            .env("FAKE_COMPOSE_LOG", &self.log)
            .env_remove("DOCKYARD_CONFIG")
            .env_remove("RUST_LOG")
            .arg("--config")
            .arg(&self.config)
            .arg("--no-color");
        cmd
    }

    /// Recorded compose calls, one line per call.
    pub fn calls(&self) -> Vec<String> {
        fs::read_to_string(&self.log)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }
}
