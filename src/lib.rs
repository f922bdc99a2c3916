//! Dockyard manages a fleet of docker-compose services that live as directories under a
//! set of search paths. It discovers services, drives their lifecycle through the
//! compose tool in dependency order, and takes atomic copy-on-write snapshots of each
//! service's live data.

/// Cleanup of stopped containers and dangling volumes.
pub mod cleanup;

/// CLI interface.
pub mod cli;

/// External command execution.
pub mod collaborator;

/// Configuration management.
pub mod config;

/// Well-known file names and defaults.
pub mod constants;

/// Compose definition inspection.
pub mod definition;

/// Error handling.
pub mod error;

/// Logs management.
pub mod logs;

/// Batch lifecycle operations.
pub mod orchestrator;

/// Service discovery.
pub mod registry;

/// Runtime environment.
pub mod runtime;

/// Live-data snapshots.
pub mod snapshot;

/// Status manager.
pub mod status;

#[cfg(test)]
mod test_utils;
