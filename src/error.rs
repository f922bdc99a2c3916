//! Error handling for dockyard.
use std::{path::PathBuf, time::Duration};

use thiserror::Error;

use crate::snapshot::SnapshotRecord;

/// Defines all possible errors raised by the registry, orchestrator and snapshot manager.
#[derive(Debug, Error)]
pub enum DockyardError {
    /// Error reading or accessing a configuration file.
    #[error("Failed to read config file: {0}")]
    ConfigReadError(#[from] std::io::Error),

    /// Error parsing YAML configuration.
    #[error("Invalid YAML format: {0}")]
    ConfigParseError(#[from] serde_yaml::Error),

    /// A configuration value was present but unusable.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A `${VAR}` reference in the configuration has no value in the environment.
    #[error("Missing environment variable referenced by config: {0}")]
    MissingEnvVar(String),

    /// The requested service or `service/subservice` target is unknown.
    #[error("No such service: '{0}'")]
    ServiceNotFound(String),

    /// A target resolved to no service at all.
    #[error("Target '{0}' matches no discovered service")]
    EmptyTarget(String),

    /// A candidate directory lacked a compose definition.
    #[error("No compose definition found in {}", .0.display())]
    DefinitionMissing(PathBuf),

    /// A target resolved to more than one candidate where exactly one is required.
    #[error("Target '{target}' is ambiguous; choose one of: {}", .candidates.join(", "))]
    AmbiguousTarget {
        /// Target as given by the caller.
        target: String,
        /// Candidates that matched.
        candidates: Vec<String>,
    },

    /// The target has no running container to attach to.
    #[error("Target '{0}' has no running container")]
    NotRunning(String),

    /// The operation requires every container of the service to be stopped.
    #[error("Service '{0}' is running; stop it first")]
    ServiceRunning(String),

    /// A restart would orphan volumes whose contents cannot be recreated.
    #[error(
        "Refusing to restart '{service}': recreating would orphan anonymous volume(s) {}; pass --allow-orphaned-volumes to proceed",
        .volumes.join(", ")
    )]
    UnsafeRestart {
        /// Service that was not restarted.
        service: String,
        /// Offending volume mounts (`subservice:container-path`).
        volumes: Vec<String>,
    },

    /// A declared dependency does not name a discovered service.
    #[error("Service '{service}' declares unknown dependency '{dependency}'")]
    UnknownDependency {
        /// The service with an invalid dependency reference.
        service: String,
        /// The missing dependency name.
        dependency: String,
    },

    /// Dependency declarations form a cycle.
    #[error("Detected dependency cycle: {cycle}")]
    DependencyCycle {
        /// Human-readable cycle description (e.g. `a -> b -> a`).
        cycle: String,
    },

    /// Live data cannot be snapshotted.
    #[error("Cannot snapshot '{service}': {reason}")]
    SnapshotUnsupportedFilesystem {
        /// Service whose live data was rejected.
        service: String,
        /// Why the snapshot was refused.
        reason: String,
    },

    /// Another snapshot of the same service holds the lock.
    #[error("A snapshot of '{service}' is already in progress")]
    SnapshotInProgressConflict {
        /// Service being snapshotted elsewhere.
        service: String,
    },

    /// Capture or finalization failed; the record is marked failed and nothing was published.
    #[error("Snapshot {} of '{}' failed: {source}", .record.timestamp_id, .record.service)]
    SnapshotFailed {
        /// The failed attempt.
        record: Box<SnapshotRecord>,
        /// What went wrong.
        #[source]
        source: Box<DockyardError>,
    },

    /// Filesystem operation failed on a specific path.
    #[error("I/O error on {}: {source}", .path.display())]
    PathError {
        /// Path being operated on.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// The compose/runtime collaborator exited non-zero.
    #[error("`{command}` exited with status {}: {stderr}", exit_label(.code))]
    CollaboratorExecutionError {
        /// Rendered command line.
        command: String,
        /// Exit code when the process exited normally.
        code: Option<i32>,
        /// Captured stderr, verbatim.
        stderr: String,
    },

    /// The collaborator could not be launched at all.
    #[error("Failed to run `{command}`: {source}")]
    CollaboratorSpawnError {
        /// Rendered command line.
        command: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// A captured collaborator call exceeded its time bound and was killed.
    #[error("`{command}` timed out after {timeout:?}")]
    CollaboratorTimeout {
        /// Rendered command line.
        command: String,
        /// Configured bound.
        timeout: Duration,
    },

    /// The invocation was cancelled by an interrupt signal.
    #[error("Interrupted while running `{0}`")]
    Interrupted(String),

    /// Collaborator output could not be decoded.
    #[error("Unexpected output from `{command}`: {source}")]
    OutputParseError {
        /// Rendered command line.
        command: String,
        /// The underlying error that occurred.
        #[source]
        source: serde_json::Error,
    },

    /// The service started but nothing stayed running.
    #[error("Service '{0}' has no running container after launch")]
    NothingRunning(String),

    /// Some cleanup removals failed; the others were still attempted.
    #[error("Cleanup partially failed: {}", .failures.join("; "))]
    CleanupPartialFailure {
        /// One message per failed removal.
        failures: Vec<String>,
    },

    /// The operator declined a destructive operation.
    #[error("Aborted by user")]
    Declined,

    /// A concurrent batch worker panicked before reporting its target.
    #[error("Worker for '{0}' panicked")]
    WorkerPanicked(String),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "signal".to_string(),
    }
}

impl DockyardError {
    /// Wraps an I/O error with the path it occurred on.
    pub fn at_path(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DockyardError::PathError {
            path: path.into(),
            source,
        }
    }

    /// Usage errors abort the whole command before any side effect.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            DockyardError::ServiceNotFound(_)
                | DockyardError::EmptyTarget(_)
                | DockyardError::AmbiguousTarget { .. }
                | DockyardError::UnknownDependency { .. }
                | DockyardError::DependencyCycle { .. }
                | DockyardError::InvalidConfig(_)
                | DockyardError::MissingEnvVar(_)
                | DockyardError::ConfigParseError(_)
                | DockyardError::ConfigReadError(_)
        )
    }
}

/// Non-fatal anomalies found while scanning search paths.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryWarning {
    /// A lower-precedence directory reused an already discovered name.
    #[error(
        "Service '{name}' in {} is shadowed by {}",
        .ignored.display(),
        .kept.display()
    )]
    NameConflict {
        /// Service name shared by both directories.
        name: String,
        /// Directory that won by precedence.
        kept: PathBuf,
        /// Directory that was ignored.
        ignored: PathBuf,
    },

    /// The per-service `dockyard.yml` could not be used.
    #[error("Ignoring invalid {} for '{service}': {message}", .path.display())]
    InvalidServiceConfig {
        /// Service owning the file.
        service: String,
        /// Path of the rejected file.
        path: PathBuf,
        /// Parse or read error.
        message: String,
    },

    /// The compose definition could not be read to derive subservices.
    #[error("Could not read subservices of '{service}' from {}: {message}", .path.display())]
    UnreadableDefinition {
        /// Service owning the file.
        service: String,
        /// Path of the definition.
        path: PathBuf,
        /// Parse or read error.
        message: String,
    },

    /// A directory name collides with the `all` wildcard.
    #[error("Ignoring service directory {}: '{name}' is reserved", .path.display())]
    ReservedName {
        /// Reserved name.
        name: String,
        /// Rejected directory.
        path: PathBuf,
    },

    /// A search path exists but could not be listed.
    #[error("Could not scan {}: {message}", .path.display())]
    UnreadableSearchPath {
        /// Search path.
        path: PathBuf,
        /// Underlying error.
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_panic_names_the_target_and_is_not_a_usage_error() {
        let err = DockyardError::WorkerPanicked("blog/db".into());
        assert_eq!(err.to_string(), "Worker for 'blog/db' panicked");
        assert!(!err.is_usage_error());
    }

    #[test]
    fn resolution_failures_are_usage_errors() {
        assert!(DockyardError::ServiceNotFound("nosuch".into()).is_usage_error());
        assert!(
            DockyardError::AmbiguousTarget {
                target: "all".into(),
                candidates: vec!["alpha".into(), "bravo".into()],
            }
            .is_usage_error()
        );
        assert!(!DockyardError::NothingRunning("blog".into()).is_usage_error());
    }
}
