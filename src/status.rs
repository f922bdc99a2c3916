//! Container state summaries and their terminal rendering.
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

use crate::constants::STOPPED_CONTAINER_STATES;

const GREEN_BOLD: &str = "\x1b[1;32m"; // Bright Green
const RED_BOLD: &str = "\x1b[1;31m"; // Bright Red
const MAGENTA_BOLD: &str = "\x1b[1;35m"; // Magenta
const YELLOW_BOLD: &str = "\x1b[1;33m"; // Yellow/Gold
const RESET: &str = "\x1b[0m"; // Reset color

#[derive(Debug, Deserialize)]
struct RawPublisher {
    #[serde(rename = "URL", default)]
    url: String,
    #[serde(rename = "TargetPort", default)]
    target_port: u32,
    #[serde(rename = "PublishedPort", default)]
    published_port: u32,
    #[serde(rename = "Protocol", default)]
    protocol: String,
}

#[derive(Debug, Deserialize)]
struct RawContainer {
    #[serde(rename = "ID", default)]
    id: String,
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "Service", default)]
    service: String,
    #[serde(rename = "State", default)]
    state: String,
    #[serde(rename = "Image", default)]
    image: String,
    #[serde(rename = "Publishers", default)]
    publishers: Option<Vec<RawPublisher>>,
}

/// One container as reported by the compose tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerSummary {
    /// Runtime container id.
    pub id: String,
    /// Container name.
    pub name: String,
    /// Subservice the container belongs to.
    pub subservice: String,
    /// Runtime state (`running`, `exited`, ...).
    pub state: String,
    /// Image reference.
    pub image: String,
    /// Published ports, e.g. `0.0.0.0:8080->80/tcp`.
    pub ports: Vec<String>,
}

impl ContainerSummary {
    /// Whether the container is running.
    pub fn is_running(&self) -> bool {
        self.state.eq_ignore_ascii_case("running")
    }

    /// Whether the container is stopped and can be removed.
    pub fn is_stopped(&self) -> bool {
        STOPPED_CONTAINER_STATES
            .iter()
            .any(|state| self.state.eq_ignore_ascii_case(state))
    }
}

impl From<RawContainer> for ContainerSummary {
    fn from(raw: RawContainer) -> Self {
        let ports = raw
            .publishers
            .unwrap_or_default()
            .into_iter()
            .map(|p| {
                let protocol = if p.protocol.is_empty() {
                    "tcp".to_string()
                } else {
                    p.protocol
                };
                if p.published_port == 0 {
                    format!("{}/{}", p.target_port, protocol)
                } else {
                    let host = if p.url.is_empty() { "0.0.0.0" } else { &p.url };
                    format!(
                        "{}:{}->{}/{}",
                        host, p.published_port, p.target_port, protocol
                    )
                }
            })
            .collect::<Vec<_>>();

        let mut deduped: Vec<String> = Vec::new();
        for port in ports {
            if !deduped.contains(&port) {
                deduped.push(port);
            }
        }

        Self {
            id: raw.id,
            name: raw.name,
            subservice: raw.service,
            state: raw.state.to_lowercase(),
            image: raw.image,
            ports: deduped,
        }
    }
}

/// Parses `ps --format json` output.
///
/// Newer compose releases print one JSON object per line, older ones a single
/// array; both are accepted. Empty output means no containers.
pub fn parse_ps_output(stdout: &str) -> Result<Vec<ContainerSummary>, serde_json::Error> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    if trimmed.starts_with('[') {
        let raw: Vec<RawContainer> = serde_json::from_str(trimmed)?;
        return Ok(raw.into_iter().map(ContainerSummary::from).collect());
    }

    trimmed
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let value: Value = serde_json::from_str(line)?;
            let raw: RawContainer = serde_json::from_value(value)?;
            Ok(ContainerSummary::from(raw))
        })
        .collect()
}

/// State of one subservice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubserviceStatus {
    /// Subservice name.
    pub name: String,
    /// Whether at least one of its containers is running.
    pub running: bool,
    /// `running`, a runtime state such as `exited`, or `absent` when no container exists.
    pub state: String,
    /// Image of the first container, if any.
    pub image: Option<String>,
    /// Published ports across its containers.
    pub ports: Vec<String>,
    /// Container names.
    pub containers: Vec<String>,
}

/// Structured result of `info` for one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    /// `service` or `service/subservice`.
    pub target: String,
    /// Per-subservice state in declaration order; undeclared containers follow.
    pub subservices: Vec<SubserviceStatus>,
}

impl StatusReport {
    /// Merges the declared subservices with the containers the compose tool reported.
    ///
    /// With `only`, the report is narrowed to that subservice.
    pub fn build(
        target: String,
        declared: &[String],
        only: Option<&str>,
        containers: &[ContainerSummary],
    ) -> Self {
        let mut names: Vec<String> = declared.to_vec();
        for container in containers {
            if !names.contains(&container.subservice) {
                names.push(container.subservice.clone());
            }
        }
        if let Some(only) = only {
            names.retain(|name| name == only);
        }

        let subservices = names
            .into_iter()
            .map(|name| {
                let matching: Vec<&ContainerSummary> = containers
                    .iter()
                    .filter(|c| c.subservice == name)
                    .collect();
                let running = matching.iter().any(|c| c.is_running());
                let state = if running {
                    "running".to_string()
                } else {
                    matching
                        .first()
                        .map(|c| c.state.clone())
                        .unwrap_or_else(|| "absent".to_string())
                };
                let mut ports: Vec<String> = Vec::new();
                for port in matching.iter().flat_map(|c| c.ports.iter()) {
                    if !ports.contains(port) {
                        ports.push(port.clone());
                    }
                }
                SubserviceStatus {
                    running,
                    state,
                    image: matching.first().map(|c| c.image.clone()),
                    ports,
                    containers: matching.iter().map(|c| c.name.clone()).collect(),
                    name,
                }
            })
            .collect();

        Self {
            target,
            subservices,
        }
    }

    /// Whether every subservice has a running container.
    pub fn fully_running(&self) -> bool {
        !self.subservices.is_empty() && self.subservices.iter().all(|s| s.running)
    }
}

fn paint(text: &str, color: &str, enabled: bool) -> String {
    if enabled {
        format!("{color}{text}{RESET}")
    } else {
        text.to_string()
    }
}

fn state_color(state: &str) -> &'static str {
    match state {
        "running" => GREEN_BOLD,
        "absent" => MAGENTA_BOLD,
        "restarting" | "paused" | "created" => YELLOW_BOLD,
        _ => RED_BOLD,
    }
}

/// Renders status reports as an aligned table.
pub fn render_status(reports: &[StatusReport], color: bool) -> String {
    let mut out = String::new();
    for report in reports {
        let headline = if report.fully_running() {
            paint("●", GREEN_BOLD, color)
        } else if report.subservices.iter().any(|s| s.running) {
            paint("●", YELLOW_BOLD, color)
        } else {
            paint("●", RED_BOLD, color)
        };
        out.push_str(&format!("{headline} {}\n", report.target));

        let width = report
            .subservices
            .iter()
            .map(|s| s.name.len())
            .max()
            .unwrap_or(0)
            .max(10);
        for sub in &report.subservices {
            let state = paint(&format!("{:<10}", sub.state), state_color(&sub.state), color);
            let image = sub.image.as_deref().unwrap_or("-");
            let ports = if sub.ports.is_empty() {
                "-".to_string()
            } else {
                sub.ports.join(", ")
            };
            out.push_str(&format!(
                "  {:<width$}  {}  {:<30}  {}\n",
                sub.name,
                state,
                image,
                ports,
                width = width
            ));
        }
    }
    out
}

/// One line of a batch report: a colored marker, the target and a detail message.
pub fn render_result_line(target: &str, ok: bool, detail: &str, color: bool) -> String {
    let marker = if ok {
        paint("●", GREEN_BOLD, color)
    } else {
        paint("●", RED_BOLD, color)
    };
    if detail.is_empty() {
        format!("{marker} {target}")
    } else {
        format!("{marker} {target}: {detail}")
    }
}

/// One row of `list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogEntry {
    /// Service name.
    pub name: String,
    /// Service directory.
    pub root_path: PathBuf,
    /// Declared subservices.
    pub subservices: Vec<String>,
    /// Snapshot readiness label.
    pub snapshot: String,
    /// Declared dependencies.
    pub depends_on: Vec<String>,
}

/// Renders the catalog as an aligned table.
pub fn render_catalog(entries: &[CatalogEntry], color: bool) -> String {
    if entries.is_empty() {
        return "No services found\n".to_string();
    }
    let name_width = entries
        .iter()
        .map(|e| e.name.len())
        .max()
        .unwrap_or(0)
        .max("SERVICE".len());
    let snap_width = entries
        .iter()
        .map(|e| e.snapshot.len())
        .max()
        .unwrap_or(0)
        .max("SNAPSHOT".len());

    let mut out = format!(
        "{:<name_width$}  {:<snap_width$}  {:<24}  {}\n",
        "SERVICE", "SNAPSHOT", "SUBSERVICES", "PATH"
    );
    for entry in entries {
        let snapshot_color = match entry.snapshot.as_str() {
            "ready" => GREEN_BOLD,
            "needs-conversion" => YELLOW_BOLD,
            "unsupported-fs" => RED_BOLD,
            _ => MAGENTA_BOLD,
        };
        let snapshot = paint(
            &format!("{:<snap_width$}", entry.snapshot),
            snapshot_color,
            color,
        );
        out.push_str(&format!(
            "{:<name_width$}  {}  {:<24}  {}\n",
            entry.name,
            snapshot,
            entry.subservices.join(","),
            entry.root_path.display()
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const NDJSON: &str = r#"{"ID":"a1","Name":"blog-web-1","Service":"web","State":"running","Image":"nginx:1.27","Publishers":[{"URL":"0.0.0.0","TargetPort":80,"PublishedPort":8080,"Protocol":"tcp"},{"URL":"::","TargetPort":80,"PublishedPort":8080,"Protocol":"tcp"}]}
{"ID":"b2","Name":"blog-db-1","Service":"db","State":"exited","Image":"postgres:16","Publishers":null}
"#;

    #[test]
    fn parses_line_delimited_and_array_output() {
        let containers = parse_ps_output(NDJSON).unwrap();
        assert_eq!(containers.len(), 2);
        assert_eq!(containers[0].subservice, "web");
        assert!(containers[0].is_running());
        assert_eq!(
            containers[0].ports,
            vec!["0.0.0.0:8080->80/tcp", ":::8080->80/tcp"]
        );
        assert!(!containers[1].is_running());
        assert!(containers[1].is_stopped());
        assert!(!containers[0].is_stopped());

        let array = r#"[{"ID":"c3","Name":"wiki-app-1","Service":"app","State":"Running","Image":"wiki"}]"#;
        let containers = parse_ps_output(array).unwrap();
        assert_eq!(containers.len(), 1);
        assert!(containers[0].is_running());

        assert!(parse_ps_output("  \n").unwrap().is_empty());
        assert!(parse_ps_output("not json").is_err());
    }

    #[test]
    fn report_merges_declared_and_observed() {
        let containers = parse_ps_output(NDJSON).unwrap();
        let declared = vec!["web".to_string(), "db".to_string(), "cache".to_string()];

        let report = StatusReport::build("blog".into(), &declared, None, &containers);
        let states: Vec<_> = report
            .subservices
            .iter()
            .map(|s| (s.name.as_str(), s.state.as_str()))
            .collect();
        assert_eq!(
            states,
            vec![("web", "running"), ("db", "exited"), ("cache", "absent")]
        );
        assert!(!report.fully_running());

        let narrowed = StatusReport::build("blog/web".into(), &declared, Some("web"), &containers);
        assert_eq!(narrowed.subservices.len(), 1);
        assert!(narrowed.fully_running());
        assert_eq!(narrowed.subservices[0].image.as_deref(), Some("nginx:1.27"));
    }

    #[test]
    fn rendering_without_color_has_no_escape_codes() {
        let containers = parse_ps_output(NDJSON).unwrap();
        let report = StatusReport::build(
            "blog".into(),
            &["web".into(), "db".into()],
            None,
            &containers,
        );
        let plain = render_status(std::slice::from_ref(&report), false);
        assert!(!plain.contains('\x1b'));
        assert!(plain.contains("blog"));
        assert!(plain.contains("nginx:1.27"));

        let colored = render_status(&[report], true);
        assert!(colored.contains(GREEN_BOLD));
        assert!(colored.contains(RED_BOLD));
    }

    #[test]
    fn catalog_table_lists_entries() {
        let entries = vec![CatalogEntry {
            name: "blog".into(),
            root_path: PathBuf::from("/srv/blog"),
            subservices: vec!["web".into(), "db".into()],
            snapshot: "ready".into(),
            depends_on: Vec::new(),
        }];
        let table = render_catalog(&entries, false);
        assert!(table.starts_with("SERVICE"));
        assert!(table.contains("web,db"));
        assert!(table.contains("/srv/blog"));
        assert_eq!(render_catalog(&[], false), "No services found\n");
    }

    #[test]
    fn result_lines_mark_success_and_failure() {
        assert_eq!(render_result_line("blog", true, "started", false), "● blog: started");
        assert_eq!(render_result_line("blog", false, "", false), "● blog");
        assert!(render_result_line("blog", false, "boom", true).starts_with(RED_BOLD));
    }
}
