//! Configuration management for dockyard.
//!
//! Two files are recognised: an optional global config that shapes discovery
//! and collaborator invocation, and an optional `dockyard.yml` inside each
//! service directory that overrides what would otherwise be auto-detected.
use regex::Regex;
use serde::Deserialize;
use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::debug;

use crate::{
    constants::{
        DEFAULT_BTRFS_COMMAND, DEFAULT_COMMAND_TIMEOUT, DEFAULT_COMPOSE_COMMAND,
        DEFAULT_RUNTIME_COMMAND,
    },
    error::DockyardError,
    runtime::RuntimeContext,
};

/// Host-wide settings. Every field is optional; an absent file yields the defaults.
#[derive(Debug, Deserialize, Default, Clone)]
#[serde(deny_unknown_fields)]
pub struct GlobalConfig {
    /// Replaces the default search precedence entirely when set.
    #[serde(default)]
    pub search_paths: Option<Vec<String>>,
    /// Directories scanned after the defaults.
    #[serde(default)]
    pub extra_search_paths: Vec<String>,
    /// Compose invocation, e.g. `["docker", "compose"]` or `["docker-compose"]`.
    #[serde(default)]
    pub compose_command: Option<Vec<String>>,
    /// Container runtime invocation used by `clean`.
    #[serde(default)]
    pub runtime_command: Option<Vec<String>>,
    /// Path or name of the btrfs helper.
    #[serde(default)]
    pub btrfs_command: Option<String>,
    /// Bound for captured collaborator calls (`<number>[s|m|h]`).
    #[serde(default)]
    pub command_timeout: Option<String>,
    /// Run batch targets of different services concurrently.
    #[serde(default)]
    pub parallel: bool,
    /// Produce writable snapshots instead of read-only ones.
    #[serde(default)]
    pub writable_snapshots: bool,
    /// File this config was loaded from, if any.
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

impl GlobalConfig {
    /// Compose argv prefix.
    pub fn compose_command(&self) -> Vec<String> {
        non_empty_or(&self.compose_command, &DEFAULT_COMPOSE_COMMAND)
    }

    /// Runtime argv prefix.
    pub fn runtime_command(&self) -> Vec<String> {
        non_empty_or(&self.runtime_command, &DEFAULT_RUNTIME_COMMAND)
    }

    /// btrfs helper binary.
    pub fn btrfs_command(&self) -> String {
        self.btrfs_command
            .as_deref()
            .map(str::trim)
            .filter(|cmd| !cmd.is_empty())
            .unwrap_or(DEFAULT_BTRFS_COMMAND)
            .to_string()
    }

    /// Resolved timeout for captured collaborator calls.
    pub fn command_timeout(&self) -> Result<Duration, DockyardError> {
        match self.command_timeout.as_deref() {
            Some(raw) => parse_duration(raw),
            None => Ok(DEFAULT_COMMAND_TIMEOUT),
        }
    }
}

fn non_empty_or(value: &Option<Vec<String>>, default: &[&str]) -> Vec<String> {
    match value {
        Some(argv) if !argv.is_empty() => argv.clone(),
        _ => default.iter().map(|part| part.to_string()).collect(),
    }
}

/// Owner applied to `livedata/` before launching, by name or numeric uid.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum LivedataOwner {
    /// Numeric uid.
    Uid(u32),
    /// User name resolved through the passwd database.
    Name(String),
}

impl LivedataOwner {
    /// Resolves the owner to a numeric uid.
    pub fn resolve_uid(&self) -> Result<u32, DockyardError> {
        match self {
            LivedataOwner::Uid(uid) => Ok(*uid),
            LivedataOwner::Name(name) => {
                if let Ok(uid) = name.trim().parse::<u32>() {
                    return Ok(uid);
                }
                let user = nix::unistd::User::from_name(name.trim()).map_err(|err| {
                    DockyardError::InvalidConfig(format!(
                        "cannot look up user '{name}': {err}"
                    ))
                })?;
                user.map(|user| user.uid.as_raw()).ok_or_else(|| {
                    DockyardError::InvalidConfig(format!("unknown livedata owner '{name}'"))
                })
            }
        }
    }
}

/// Per-service advanced configuration read from `dockyard.yml`.
#[derive(Debug, Deserialize, Default, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    /// Explicit subservice names; replaces those derived from the compose definition.
    #[serde(default)]
    pub subservices: Option<Vec<String>>,
    /// Forces snapshot support on or off instead of detecting `livedata/`.
    #[serde(default)]
    pub snapshot_enabled: Option<bool>,
    /// Services that must be started before this one.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Owner enforced on `livedata/` before launching.
    #[serde(default)]
    pub livedata_owner: Option<LivedataOwner>,
    /// Shell used by `shell` when no command is given.
    #[serde(default)]
    pub shell: Option<String>,
}

impl ServiceConfig {
    /// Reads `path`, returning `Ok(None)` when the file does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>, DockyardError> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path).map_err(|e| DockyardError::at_path(path, e))?;
        if content.trim().is_empty() {
            return Ok(Some(Self::default()));
        }
        let parsed: ServiceConfig = serde_yaml::from_str(&content)?;
        Ok(Some(parsed))
    }
}

/// Expands `$VAR` and `${VAR}` references from the environment.
fn expand_env_vars(input: &str) -> Result<String, DockyardError> {
    let re = Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?")
        .map_err(|err| DockyardError::InvalidConfig(err.to_string()))?;

    let mut missing = None;
    let result = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => {
                missing.get_or_insert_with(|| var_name.to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(var_name) => Err(DockyardError::MissingEnvVar(var_name)),
        None => Ok(result.to_string()),
    }
}

/// Parses a user-facing duration string in the format `<number>[s|m|h]`.
pub fn parse_duration(raw: &str) -> Result<Duration, DockyardError> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(DockyardError::InvalidConfig(
            "Duration value cannot be empty".into(),
        ));
    }

    let (amount_str, multiplier) = if let Some(stripped) = value.strip_suffix('s') {
        (stripped.trim(), 1)
    } else if let Some(stripped) = value.strip_suffix('m') {
        (stripped.trim(), 60)
    } else if let Some(stripped) = value.strip_suffix('h') {
        (stripped.trim(), 3600)
    } else {
        (value, 1)
    };

    let amount: u64 = amount_str.parse().map_err(|_| {
        DockyardError::InvalidConfig(format!("Invalid duration value: '{raw}'"))
    })?;

    Ok(Duration::from_secs(amount.saturating_mul(multiplier)))
}

/// Loads and parses a global config file, expanding environment variables.
pub fn load_config_file(path: &Path) -> Result<GlobalConfig, DockyardError> {
    let content = fs::read_to_string(path).map_err(|e| {
        DockyardError::ConfigReadError(std::io::Error::new(
            e.kind(),
            format!("{} ({})", e, path.display()),
        ))
    })?;

    let expanded = expand_env_vars(&content)?;
    let mut config: GlobalConfig = if expanded.trim().is_empty() {
        GlobalConfig::default()
    } else {
        serde_yaml::from_str(&expanded)?
    };
    config.source = Some(path.to_path_buf());
    Ok(config)
}

/// Finds and loads the global config.
///
/// An explicit path must exist. Otherwise the first existing candidate from the
/// runtime context is used, and defaults apply when none exists.
pub fn load_global_config(
    explicit: Option<&Path>,
    context: &RuntimeContext,
) -> Result<GlobalConfig, DockyardError> {
    if let Some(path) = explicit {
        return load_config_file(path);
    }

    for candidate in context.config_candidates() {
        if candidate.is_file() {
            debug!("Using config file {}", candidate.display());
            return load_config_file(&candidate);
        }
    }

    debug!("No config file found; using defaults");
    Ok(GlobalConfig::default())
}
