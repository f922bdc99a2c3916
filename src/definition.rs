//! Minimal reading of compose definitions.
//!
//! Only the pieces dockyard needs are extracted: which compose file a
//! directory uses, the ordered subservice names, and each subservice's volume
//! mounts. Everything else is left to the compose tool.
use serde_yaml::{Mapping, Value};
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::{
    constants::{COMPOSE_FILE_NAMES, COMPOSE_OVERRIDE_FILE_NAMES},
    error::DockyardError,
};

/// Top-level keys of the legacy (un-nested) format that never name a service.
const RESERVED_TOP_LEVEL_KEYS: [&str; 6] =
    ["version", "name", "volumes", "networks", "configs", "secrets"];

/// Compose files found in a service directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefinitionFiles {
    /// Main definition.
    pub definition: PathBuf,
    /// Matching override file, when present.
    pub override_file: Option<PathBuf>,
}

/// Looks for a recognised compose definition directly inside `dir`.
pub fn locate(dir: &Path) -> Option<DefinitionFiles> {
    COMPOSE_FILE_NAMES
        .iter()
        .zip(COMPOSE_OVERRIDE_FILE_NAMES.iter())
        .find_map(|(name, override_name)| {
            let definition = dir.join(name);
            if !definition.is_file() {
                return None;
            }
            let override_file = dir.join(override_name);
            Some(DefinitionFiles {
                definition,
                override_file: override_file.is_file().then_some(override_file),
            })
        })
}

/// A volume entry of one subservice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeMount {
    /// Host path mounted into the container.
    Bind {
        /// Host path as written.
        source: String,
        /// Container path.
        target: String,
    },
    /// Named volume, persisted by the runtime across recreation.
    Named {
        /// Volume name.
        name: String,
        /// Container path.
        target: String,
    },
    /// Volume without a name; a recreated container gets a fresh one.
    Anonymous {
        /// Container path.
        target: String,
    },
}

impl VolumeMount {
    fn parse(entry: &Value) -> Option<Self> {
        match entry {
            Value::String(spec) => Some(Self::parse_short(spec)),
            Value::Mapping(map) => Self::parse_long(map),
            _ => None,
        }
    }

    fn parse_short(spec: &str) -> Self {
        let mut parts = spec.splitn(3, ':');
        let first = parts.next().unwrap_or_default().trim().to_string();
        match parts.next() {
            None => VolumeMount::Anonymous { target: first },
            Some(target) => {
                let target = target.trim().to_string();
                if is_host_path(&first) {
                    VolumeMount::Bind {
                        source: first,
                        target,
                    }
                } else {
                    VolumeMount::Named {
                        name: first,
                        target,
                    }
                }
            }
        }
    }

    fn parse_long(map: &Mapping) -> Option<Self> {
        let field = |key: &str| map.get(key).and_then(Value::as_str).map(str::to_string);
        let target = field("target")?;
        let source = field("source").filter(|s| !s.trim().is_empty());
        match field("type").as_deref().unwrap_or("volume") {
            "bind" => Some(VolumeMount::Bind {
                source: source.unwrap_or_default(),
                target,
            }),
            "volume" => Some(match source {
                Some(name) => VolumeMount::Named { name, target },
                None => VolumeMount::Anonymous { target },
            }),
            _ => None,
        }
    }
}

fn is_host_path(source: &str) -> bool {
    source.starts_with('/') || source.starts_with('.') || source.starts_with('~')
}

/// One service entry of a compose definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeService {
    /// Key of the entry; the subservice name.
    pub name: String,
    /// Declared volume mounts.
    pub volumes: Vec<VolumeMount>,
}

/// The parts of a compose definition dockyard reads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComposeDefinition {
    /// Services in declaration order.
    pub services: Vec<ComposeService>,
}

impl ComposeDefinition {
    /// Reads a compose file.
    pub fn read(path: &Path) -> Result<Self, DockyardError> {
        let content = fs::read_to_string(path).map_err(|e| DockyardError::at_path(path, e))?;
        Self::parse(&content)
    }

    /// Reads a definition and merges its override file, if any.
    pub fn read_files(files: &DefinitionFiles) -> Result<Self, DockyardError> {
        let mut definition = Self::read(&files.definition)?;
        if let Some(override_file) = &files.override_file {
            definition.merge(Self::read(override_file)?);
        }
        Ok(definition)
    }

    /// Parses YAML content. Both the nested `services:` layout and the legacy flat layout work.
    pub fn parse(content: &str) -> Result<Self, DockyardError> {
        let document: Value = serde_yaml::from_str(content)?;
        let Some(root) = document.as_mapping() else {
            return Ok(Self::default());
        };

        let entries: Vec<(&Value, &Value)> = match root.get("services") {
            Some(Value::Mapping(services)) => services.iter().collect(),
            Some(_) => Vec::new(),
            None => root
                .iter()
                .filter(|(key, value)| {
                    key.as_str().is_some_and(|key| {
                        !RESERVED_TOP_LEVEL_KEYS.contains(&key) && !key.starts_with("x-")
                    }) && value.is_mapping()
                })
                .collect(),
        };

        let services = entries
            .into_iter()
            .filter_map(|(key, body)| {
                let name = key.as_str()?.to_string();
                let volumes = body
                    .get("volumes")
                    .and_then(Value::as_sequence)
                    .map(|seq| seq.iter().filter_map(VolumeMount::parse).collect())
                    .unwrap_or_default();
                Some(ComposeService { name, volumes })
            })
            .collect();

        Ok(Self { services })
    }

    /// Adds services from `other`; volumes of services present in both are appended.
    pub fn merge(&mut self, other: ComposeDefinition) {
        for service in other.services {
            match self.services.iter_mut().find(|s| s.name == service.name) {
                Some(existing) => {
                    for volume in service.volumes {
                        if !existing.volumes.contains(&volume) {
                            existing.volumes.push(volume);
                        }
                    }
                }
                None => self.services.push(service),
            }
        }
    }

    /// Subservice names in declaration order.
    pub fn service_names(&self) -> Vec<String> {
        self.services.iter().map(|s| s.name.clone()).collect()
    }

    /// Anonymous volumes as `subservice:container-path`.
    pub fn anonymous_volumes(&self) -> Vec<String> {
        self.services
            .iter()
            .flat_map(|service| {
                service.volumes.iter().filter_map(move |volume| match volume {
                    VolumeMount::Anonymous { target } => {
                        Some(format!("{}:{}", service.name, target))
                    }
                    _ => None,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const NESTED: &str = r#"
services:
  web:
    build: ./web
    volumes:
      - ./livedata/uploads:/srv/uploads
      - cache:/var/cache/app
  db:
    image: postgres:16
    volumes:
      - /var/lib/postgresql/data
      - type: volume
        target: /backups
      - type: tmpfs
        target: /tmp
volumes:
  cache: {}
"#;

    #[test]
    fn nested_layout_keeps_declaration_order_and_classifies_volumes() {
        let definition = ComposeDefinition::parse(NESTED).unwrap();
        assert_eq!(definition.service_names(), vec!["web", "db"]);
        assert_eq!(
            definition.services[0].volumes,
            vec![
                VolumeMount::Bind {
                    source: "./livedata/uploads".into(),
                    target: "/srv/uploads".into()
                },
                VolumeMount::Named {
                    name: "cache".into(),
                    target: "/var/cache/app".into()
                },
            ]
        );
        assert_eq!(
            definition.anonymous_volumes(),
            vec!["db:/var/lib/postgresql/data", "db:/backups"]
        );
    }

    #[test]
    fn legacy_flat_layout_is_understood() {
        let definition = ComposeDefinition::parse(
            "version: '2'\nweb:\n  image: nginx\nx-common:\n  foo: bar\nworker:\n  build: .\n",
        )
        .unwrap();
        assert_eq!(definition.service_names(), vec!["web", "worker"]);
        assert!(definition.anonymous_volumes().is_empty());
    }

    #[test]
    fn locate_prefers_canonical_names_and_pairs_override() {
        let dir = tempdir().unwrap();
        assert_eq!(locate(dir.path()), None);

        std::fs::write(dir.path().join("docker-compose.yml"), "services: {}\n").unwrap();
        std::fs::write(
            dir.path().join("docker-compose.override.yml"),
            "services: {}\n",
        )
        .unwrap();
        let found = locate(dir.path()).unwrap();
        assert_eq!(found.definition, dir.path().join("docker-compose.yml"));
        assert_eq!(
            found.override_file,
            Some(dir.path().join("docker-compose.override.yml"))
        );

        std::fs::write(dir.path().join("compose.yaml"), "services: {}\n").unwrap();
        let found = locate(dir.path()).unwrap();
        assert_eq!(found.definition, dir.path().join("compose.yaml"));
        assert_eq!(found.override_file, None);
    }

    #[test]
    fn override_contributes_new_subservices() {
        let mut base = ComposeDefinition::parse("services:\n  web: {}\n").unwrap();
        base.merge(
            ComposeDefinition::parse(
                "services:\n  web:\n    volumes: [/scratch]\n  debug: {}\n",
            )
            .unwrap(),
        );
        assert_eq!(base.service_names(), vec!["web", "debug"]);
        assert_eq!(base.anonymous_volumes(), vec!["web:/scratch"]);
    }
}
