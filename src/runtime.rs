//! Runtime paths: default search locations and config lookup.
//!
//! Everything is derived from an explicit [`RuntimeContext`] built once per
//! invocation, so tests can point discovery at scratch directories.
use std::{env, path::PathBuf};

use crate::{
    config::GlobalConfig,
    constants::{LOCAL_SERVICES_DIR, SHARED_SERVICES_DIR, SYSTEM_CONFIG_FILE, USER_CONFIG_FILE},
    error::DockyardError,
};

/// Process environment the registry and config loader depend on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeContext {
    cwd: PathBuf,
    home: Option<PathBuf>,
    shared_dir: PathBuf,
}

impl RuntimeContext {
    /// Captures the current working directory and `$HOME`.
    pub fn from_env() -> Result<Self, DockyardError> {
        let cwd = env::current_dir().map_err(|e| DockyardError::at_path(".", e))?;
        let home = env::var_os("HOME")
            .filter(|value| !value.is_empty())
            .map(PathBuf::from);
        Ok(Self::new(cwd, home))
    }

    /// Builds a context from explicit directories.
    pub fn new(cwd: PathBuf, home: Option<PathBuf>) -> Self {
        Self {
            cwd,
            home,
            shared_dir: PathBuf::from(SHARED_SERVICES_DIR),
        }
    }

    /// Replaces the system-wide shared directory.
    pub fn with_shared_dir(mut self, shared_dir: PathBuf) -> Self {
        self.shared_dir = shared_dir;
        self
    }

    /// Working directory of this invocation.
    pub fn cwd(&self) -> &PathBuf {
        &self.cwd
    }

    /// Default precedence: working directory, shared directory, host-local directory.
    pub fn default_search_paths(&self) -> Vec<PathBuf> {
        let mut paths = vec![self.cwd.clone(), self.shared_dir.clone()];
        if let Some(home) = &self.home {
            paths.push(home.join(LOCAL_SERVICES_DIR));
        }
        paths
    }

    /// Config files tried in order when no explicit path is given.
    pub fn config_candidates(&self) -> Vec<PathBuf> {
        let mut candidates = Vec::new();
        if let Some(explicit) = env::var_os(crate::constants::CONFIG_ENV_VAR)
            .filter(|value| !value.is_empty())
        {
            candidates.push(self.absolutize(PathBuf::from(explicit)));
        }
        if let Some(home) = &self.home {
            candidates.push(home.join(USER_CONFIG_FILE));
        }
        candidates.push(PathBuf::from(SYSTEM_CONFIG_FILE));
        candidates
    }

    /// Effective ordered search paths.
    ///
    /// `search_paths` in the config replaces the defaults, `extra_search_paths`
    /// follows them, and `cli_extra` comes last. Duplicates keep their first position.
    pub fn search_paths(&self, config: &GlobalConfig, cli_extra: &[PathBuf]) -> Vec<PathBuf> {
        let base = match &config.search_paths {
            Some(paths) => paths
                .iter()
                .map(|p| self.absolutize(PathBuf::from(p)))
                .collect(),
            None => self.default_search_paths(),
        };

        let extras = config
            .extra_search_paths
            .iter()
            .map(|p| self.absolutize(PathBuf::from(p)))
            .chain(cli_extra.iter().map(|p| self.absolutize(p.clone())));

        let mut ordered: Vec<PathBuf> = Vec::new();
        for path in base.into_iter().chain(extras) {
            if !ordered.contains(&path) {
                ordered.push(path);
            }
        }
        ordered
    }

    fn absolutize(&self, path: PathBuf) -> PathBuf {
        if path.is_absolute() {
            path
        } else {
            self.cwd.join(path)
        }
    }
}
