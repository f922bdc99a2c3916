//! Constants and configuration values for dockyard.
//!
//! This module centralizes file names, default commands and timing values used
//! throughout discovery, orchestration and snapshotting.

use std::time::Duration;

// ============================================================================
// Service Layout
// ============================================================================

/// Compose definition file names, in the order they are looked up inside a service directory.
pub const COMPOSE_FILE_NAMES: [&str; 4] = [
    "compose.yaml",
    "compose.yml",
    "docker-compose.yaml",
    "docker-compose.yml",
];

/// Override file names, paired index-by-index with [`COMPOSE_FILE_NAMES`].
pub const COMPOSE_OVERRIDE_FILE_NAMES: [&str; 4] = [
    "compose.override.yaml",
    "compose.override.yml",
    "docker-compose.override.yaml",
    "docker-compose.override.yml",
];

/// Optional per-service advanced configuration file.
pub const SERVICE_CONFIG_FILE_NAME: &str = "dockyard.yml";

/// Read-write data directory of a service.
pub const LIVEDATA_DIR_NAME: &str = "livedata";

/// Directory receiving finalized snapshots.
pub const SNAPSHOTS_DIR_NAME: &str = "livedata-snapshots";

/// Lock file serializing snapshots of one service.
pub const SNAPSHOT_LOCK_FILE_NAME: &str = ".dockyard-snapshot.lock";

/// Prefix of in-flight clones inside the snapshots directory. Never a valid timestamp id.
pub const PENDING_SNAPSHOT_PREFIX: &str = ".pending-";

/// Temporary subvolume used while converting `livedata/`.
pub const CONVERSION_VOLUME_DIR_NAME: &str = ".dockyard-livedata-volume";

/// Where the original `livedata/` is parked during conversion.
pub const CONVERSION_PARKED_DIR_NAME: &str = ".dockyard-livedata-previous";

/// Wildcard target expanding to every discovered service.
pub const ALL_TARGET: &str = "all";

// ============================================================================
// Search Paths and Config
// ============================================================================

/// System-wide shared services directory.
pub const SHARED_SERVICES_DIR: &str = "/usr/share/dockyard";

/// Host-local services directory, relative to `$HOME`.
pub const LOCAL_SERVICES_DIR: &str = ".local/share/dockyard";

/// User config file, relative to `$HOME`.
pub const USER_CONFIG_FILE: &str = ".config/dockyard/config.yaml";

/// System config file.
pub const SYSTEM_CONFIG_FILE: &str = "/etc/dockyard/config.yaml";

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "DOCKYARD_CONFIG";

// ============================================================================
// Collaborator Defaults
// ============================================================================

/// Default compose invocation.
pub const DEFAULT_COMPOSE_COMMAND: [&str; 2] = ["docker", "compose"];

/// Default container runtime invocation.
pub const DEFAULT_RUNTIME_COMMAND: [&str; 1] = ["docker"];

/// Default btrfs helper binary.
pub const DEFAULT_BTRFS_COMMAND: &str = "btrfs";

/// Container states `clean` treats as stopped. `paused` and `restarting` are excluded; the runtime refuses to remove them.
pub const STOPPED_CONTAINER_STATES: [&str; 3] = ["exited", "created", "dead"];

/// Default shell opened by `shell` when neither config nor caller name one.
pub const DEFAULT_SHELL: &str = "/bin/sh";

/// Upper bound for captured collaborator calls.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(600);

/// Polling interval while waiting on a child process.
pub const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Grace period between SIGTERM and SIGKILL when cancelling a child.
pub const CHILD_TERMINATE_GRACE: Duration = Duration::from_secs(5);

// ============================================================================
// Lifecycle Timing
// ============================================================================

/// Number of checks for a running container after `up -d`.
pub const POST_START_VERIFY_ATTEMPTS: usize = 3;

/// Delay between post-start verification attempts.
pub const POST_START_VERIFY_DELAY: Duration = Duration::from_secs(1);

/// btrfs assigns this inode number to the root of every subvolume.
pub const BTRFS_SUBVOLUME_ROOT_INODE: u64 = 256;
