//! Service discovery and target resolution.
//!
//! A service is a directory containing a compose definition. Search paths are
//! scanned in precedence order and the first directory to claim a name wins;
//! later claimants are reported as warnings. The catalog is rebuilt on every
//! invocation and is read-only afterwards.
use serde::Serialize;
use std::{
    collections::HashSet,
    fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::{debug, warn};

use crate::{
    config::{LivedataOwner, ServiceConfig},
    constants::{ALL_TARGET, LIVEDATA_DIR_NAME, SERVICE_CONFIG_FILE_NAME, SNAPSHOTS_DIR_NAME},
    definition::{self, ComposeDefinition},
    error::{DockyardError, RegistryWarning},
};

/// A discovered service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Service {
    /// Directory basename; the CLI target and dedup key.
    pub name: String,
    /// Absolute service directory.
    pub root_path: PathBuf,
    /// Compose definition inside `root_path`.
    pub definition_path: PathBuf,
    /// Compose override file, when present.
    pub override_path: Option<PathBuf>,
    /// Container roles, in declaration order.
    pub subservices: Vec<String>,
    /// `root_path/livedata`, when it exists.
    pub live_data_path: Option<PathBuf>,
    /// `root_path/livedata-snapshots`; created lazily by the snapshot manager.
    pub snapshots_path: PathBuf,
    /// Whether snapshotting is enabled.
    pub snapshot_enabled: bool,
    /// Services that must be running before this one starts.
    pub depends_on: Vec<String>,
    /// Anonymous volumes (`subservice:path`) that a forced recreate would orphan.
    pub anonymous_volumes: Vec<String>,
    /// Owner enforced on live data before launching.
    #[serde(skip)]
    pub livedata_owner: Option<LivedataOwner>,
    /// Shell for `shell` without an explicit command.
    pub shell: Option<String>,
    /// Search path the service was found under.
    pub search_path: PathBuf,
}

impl Service {
    /// Builds a service from a candidate directory.
    ///
    /// Returns [`DockyardError::DefinitionMissing`] when the directory has no
    /// compose definition; discovery treats that as a silent skip.
    pub fn from_dir(
        dir: &Path,
        search_path: &Path,
    ) -> Result<(Self, Vec<RegistryWarning>), DockyardError> {
        let files = definition::locate(dir)
            .ok_or_else(|| DockyardError::DefinitionMissing(dir.to_path_buf()))?;
        let root_path = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
        let name = dir
            .file_name()
            .or_else(|| root_path.file_name())
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let mut warnings = Vec::new();

        let config_path = root_path.join(SERVICE_CONFIG_FILE_NAME);
        let config = match ServiceConfig::load(&config_path) {
            Ok(config) => config.unwrap_or_default(),
            Err(err) => {
                warnings.push(RegistryWarning::InvalidServiceConfig {
                    service: name.clone(),
                    path: config_path,
                    message: err.to_string(),
                });
                ServiceConfig::default()
            }
        };

        let compose = match ComposeDefinition::read_files(&files) {
            Ok(compose) => compose,
            Err(err) => {
                warnings.push(RegistryWarning::UnreadableDefinition {
                    service: name.clone(),
                    path: files.definition.clone(),
                    message: err.to_string(),
                });
                ComposeDefinition::default()
            }
        };

        let subservices = match config.subservices {
            Some(explicit) => explicit,
            None => compose.service_names(),
        };

        let live_data = root_path.join(LIVEDATA_DIR_NAME);
        let live_data_path = live_data.is_dir().then_some(live_data);
        let snapshot_enabled = config
            .snapshot_enabled
            .unwrap_or(live_data_path.is_some());

        let service = Service {
            snapshots_path: root_path.join(SNAPSHOTS_DIR_NAME),
            definition_path: files.definition,
            override_path: files.override_file,
            subservices,
            live_data_path,
            snapshot_enabled,
            depends_on: config.depends_on,
            anonymous_volumes: compose.anonymous_volumes(),
            livedata_owner: config.livedata_owner,
            shell: config.shell,
            search_path: search_path.to_path_buf(),
            name,
            root_path,
        };
        Ok((service, warnings))
    }

    /// Whether `name` is one of this service's subservices.
    pub fn has_subservice(&self, name: &str) -> bool {
        self.subservices.iter().any(|s| s == name)
    }
}

/// A user-supplied target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    /// Every discovered service.
    All,
    /// One service.
    Service(String),
    /// One container role within a service.
    Subservice {
        /// Owning service.
        service: String,
        /// Subservice name.
        subservice: String,
    },
}

impl FromStr for Target {
    type Err = DockyardError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim().trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(DockyardError::ServiceNotFound(raw.to_string()));
        }
        if trimmed == ALL_TARGET {
            return Ok(Target::All);
        }
        match trimmed.split_once('/') {
            Some((service, subservice))
                if !service.is_empty() && !subservice.is_empty() && !subservice.contains('/') =>
            {
                Ok(Target::Subservice {
                    service: service.to_string(),
                    subservice: subservice.to_string(),
                })
            }
            Some(_) => Err(DockyardError::ServiceNotFound(raw.to_string())),
            None => Ok(Target::Service(trimmed.to_string())),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::All => write!(f, "{ALL_TARGET}"),
            Target::Service(name) => write!(f, "{name}"),
            Target::Subservice {
                service,
                subservice,
            } => write!(f, "{service}/{subservice}"),
        }
    }
}

/// A target resolved against the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved<'a> {
    /// The service.
    pub service: &'a Service,
    /// Subservice, for qualified targets.
    pub subservice: Option<String>,
}

impl Resolved<'_> {
    /// `service` or `service/subservice`.
    pub fn label(&self) -> String {
        match &self.subservice {
            Some(sub) => format!("{}/{}", self.service.name, sub),
            None => self.service.name.clone(),
        }
    }
}

/// The catalog of discovered services, in discovery order.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    services: Vec<Service>,
    warnings: Vec<RegistryWarning>,
}

impl Registry {
    /// Scans `search_paths` in order and builds the catalog.
    pub fn discover(search_paths: &[PathBuf]) -> Self {
        let mut registry = Registry::default();

        for search_path in search_paths {
            if !search_path.is_dir() {
                debug!("Skipping missing search path {}", search_path.display());
                continue;
            }

            let entries = match fs::read_dir(search_path) {
                Ok(entries) => entries,
                Err(err) => {
                    registry.warn(RegistryWarning::UnreadableSearchPath {
                        path: search_path.clone(),
                        message: err.to_string(),
                    });
                    continue;
                }
            };

            let mut candidates: Vec<PathBuf> = entries
                .filter_map(Result::ok)
                .map(|entry| entry.path())
                .filter(|path| path.is_dir())
                .collect();
            candidates.sort();

            for candidate in candidates {
                registry.consider(&candidate, search_path);
            }
        }

        registry
    }

    fn consider(&mut self, candidate: &Path, search_path: &Path) {
        let (service, warnings) = match Service::from_dir(candidate, search_path) {
            Ok(found) => found,
            Err(DockyardError::DefinitionMissing(dir)) => {
                debug!("Skipping {}: no compose definition", dir.display());
                return;
            }
            Err(err) => {
                debug!("Skipping {}: {err}", candidate.display());
                return;
            }
        };

        if service.name == ALL_TARGET {
            self.warn(RegistryWarning::ReservedName {
                name: service.name,
                path: service.root_path,
            });
            return;
        }

        if let Some(existing) = self.get(&service.name) {
            if existing.root_path != service.root_path {
                let warning = RegistryWarning::NameConflict {
                    name: service.name.clone(),
                    kept: existing.root_path.clone(),
                    ignored: service.root_path.clone(),
                };
                self.warn(warning);
            }
            return;
        }

        for warning in warnings {
            self.warn(warning);
        }
        debug!(
            "Discovered service '{}' at {}",
            service.name,
            service.root_path.display()
        );
        self.services.push(service);
    }

    fn warn(&mut self, warning: RegistryWarning) {
        warn!("{warning}");
        self.warnings.push(warning);
    }

    /// Services in discovery order.
    pub fn services(&self) -> &[Service] {
        &self.services
    }

    /// Discovery anomalies.
    pub fn warnings(&self) -> &[RegistryWarning] {
        &self.warnings
    }

    /// Looks up a service by name.
    pub fn get(&self, name: &str) -> Option<&Service> {
        self.services.iter().find(|service| service.name == name)
    }

    /// Resolves one target.
    pub fn resolve(&self, target: &Target) -> Result<Vec<Resolved<'_>>, DockyardError> {
        match target {
            Target::All => {
                if self.services.is_empty() {
                    return Err(DockyardError::EmptyTarget(target.to_string()));
                }
                Ok(self
                    .services
                    .iter()
                    .map(|service| Resolved {
                        service,
                        subservice: None,
                    })
                    .collect())
            }
            Target::Service(name) => {
                let service = self
                    .get(name)
                    .ok_or_else(|| DockyardError::ServiceNotFound(name.clone()))?;
                Ok(vec![Resolved {
                    service,
                    subservice: None,
                }])
            }
            Target::Subservice {
                service,
                subservice,
            } => {
                let found = self
                    .get(service)
                    .filter(|found| found.has_subservice(subservice))
                    .ok_or_else(|| DockyardError::ServiceNotFound(target.to_string()))?;
                Ok(vec![Resolved {
                    service: found,
                    subservice: Some(subservice.clone()),
                }])
            }
        }
    }

    /// Resolves several targets, dropping duplicates while keeping first occurrence order.
    ///
    /// Any unknown target fails the whole resolution before anything runs.
    pub fn resolve_all(&self, targets: &[Target]) -> Result<Vec<Resolved<'_>>, DockyardError> {
        let mut resolved: Vec<Resolved<'_>> = Vec::new();
        for target in targets {
            for item in self.resolve(target)? {
                if !resolved.contains(&item) {
                    resolved.push(item);
                }
            }
        }
        if resolved.is_empty() {
            return Err(DockyardError::EmptyTarget(
                targets
                    .iter()
                    .map(Target::to_string)
                    .collect::<Vec<_>>()
                    .join(" "),
            ));
        }
        Ok(resolved)
    }

    /// Orders `services` so that dependencies come first.
    ///
    /// With `expand`, dependencies that were not requested are included too;
    /// the returned flag marks services that were explicitly requested.
    pub fn dependency_order<'a>(
        &'a self,
        services: &[&'a Service],
        expand: bool,
    ) -> Result<Vec<(&'a Service, bool)>, DockyardError> {
        let requested: HashSet<&str> = services.iter().map(|s| s.name.as_str()).collect();
        let mut visited: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&str> = Vec::new();
        let mut ordered: Vec<(&'a Service, bool)> = Vec::new();

        for service in services {
            self.visit(
                service,
                &requested,
                expand,
                &mut visited,
                &mut stack,
                &mut ordered,
            )?;
        }
        Ok(ordered)
    }

    fn visit<'a>(
        &'a self,
        service: &'a Service,
        requested: &HashSet<&str>,
        expand: bool,
        visited: &mut HashSet<&'a str>,
        stack: &mut Vec<&'a str>,
        ordered: &mut Vec<(&'a Service, bool)>,
    ) -> Result<(), DockyardError> {
        let name = service.name.as_str();
        if visited.contains(name) {
            return Ok(());
        }
        if let Some(pos) = stack.iter().position(|entry| *entry == name) {
            let mut cycle: Vec<&str> = stack[pos..].to_vec();
            cycle.push(name);
            return Err(DockyardError::DependencyCycle {
                cycle: cycle.join(" -> "),
            });
        }

        stack.push(name);
        for dependency in &service.depends_on {
            let dep = self
                .get(dependency)
                .ok_or_else(|| DockyardError::UnknownDependency {
                    service: service.name.clone(),
                    dependency: dependency.clone(),
                })?;
            self.visit(dep, requested, expand, visited, stack, ordered)?;
        }
        stack.pop();

        visited.insert(name);
        let is_requested = requested.contains(name);
        if is_requested || expand {
            ordered.push((service, is_requested));
        }
        Ok(())
    }

    /// Whether `service` depends on `other`, directly or through other services.
    pub fn depends_on(&self, service: &Service, other: &str) -> bool {
        let mut pending: Vec<&str> = service.depends_on.iter().map(String::as_str).collect();
        let mut seen: HashSet<&str> = HashSet::new();
        while let Some(name) = pending.pop() {
            if name == other {
                return true;
            }
            if !seen.insert(name) {
                continue;
            }
            if let Some(dep) = self.get(name) {
                pending.extend(dep.depends_on.iter().map(String::as_str));
            }
        }
        false
    }
}
