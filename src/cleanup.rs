//! Housekeeping: removal of stopped containers, then dangling volumes.
//!
//! Phase one always finishes before phase two starts, because a stopped
//! container still references its volumes and would keep them from being
//! reported as dangling.
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    collaborator::{Collaborator, Invocation},
    constants::STOPPED_CONTAINER_STATES,
    error::DockyardError,
    registry::Service,
    status::parse_ps_output,
};

/// Outcome of a sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Containers removed in phase one.
    pub containers_removed: usize,
    /// Volumes removed in phase two.
    pub volumes_removed: usize,
    /// One message per failed enumeration or removal.
    pub errors: Vec<String>,
}

impl CleanupReport {
    /// Turns recorded failures into [`DockyardError::CleanupPartialFailure`].
    pub fn into_result(self) -> Result<Self, DockyardError> {
        if self.errors.is_empty() {
            Ok(self)
        } else {
            Err(DockyardError::CleanupPartialFailure {
                failures: self.errors,
            })
        }
    }
}

/// Two-phase sweep over the local container runtime.
pub struct Cleanup<'a> {
    collaborator: &'a dyn Collaborator,
}

impl<'a> Cleanup<'a> {
    /// Creates a sweeper using `collaborator`.
    pub fn new(collaborator: &'a dyn Collaborator) -> Self {
        Self { collaborator }
    }

    /// Removes stopped containers, then dangling volumes.
    ///
    /// Phase one covers the containers of `services`, or every stopped
    /// container on the host when `runtime_wide` is set. Phase two is always
    /// runtime-wide. Failures are recorded and the sweep continues.
    pub fn clean(&self, services: &[&Service], runtime_wide: bool) -> CleanupReport {
        let mut report = CleanupReport::default();

        let stopped = if runtime_wide {
            self.stopped_runtime_containers(&mut report)
        } else {
            self.stopped_service_containers(services, &mut report)
        };
        for id in stopped {
            match self.collaborator.run(&Invocation::runtime(["rm", id.as_str()])) {
                Ok(_) => {
                    debug!("Removed container {id}");
                    report.containers_removed += 1;
                }
                Err(err) => {
                    warn!("Could not remove container {id}: {err}");
                    report.errors.push(format!("container {id}: {err}"));
                }
            }
        }
        info!("Removed {} stopped container(s)", report.containers_removed);

        for volume in self.dangling_volumes(&mut report) {
            match self
                .collaborator
                .run(&Invocation::runtime(["volume", "rm", volume.as_str()]))
            {
                Ok(_) => {
                    debug!("Removed volume {volume}");
                    report.volumes_removed += 1;
                }
                Err(err) => {
                    warn!("Could not remove volume {volume}: {err}");
                    report.errors.push(format!("volume {volume}: {err}"));
                }
            }
        }
        info!("Removed {} dangling volume(s)", report.volumes_removed);

        report
    }

    fn stopped_service_containers(
        &self,
        services: &[&Service],
        report: &mut CleanupReport,
    ) -> Vec<String> {
        let mut ids = Vec::new();
        for service in services {
            let invocation = Invocation::compose(*service, ["ps", "--all", "--format", "json"]);
            let output = match self.collaborator.run(&invocation) {
                Ok(output) => output,
                Err(err) => {
                    report
                        .errors
                        .push(format!("listing containers of '{}': {err}", service.name));
                    continue;
                }
            };
            match parse_ps_output(&output.stdout) {
                Ok(containers) => ids.extend(
                    containers
                        .into_iter()
                        .filter(|c| c.is_stopped() && !c.id.is_empty())
                        .map(|c| c.id),
                ),
                Err(source) => report.errors.push(
                    DockyardError::OutputParseError {
                        command: self.collaborator.render(&invocation),
                        source,
                    }
                    .to_string(),
                ),
            }
        }
        ids
    }

    fn stopped_runtime_containers(&self, report: &mut CleanupReport) -> Vec<String> {
        let mut args: Vec<String> = vec!["ps".into(), "--all".into(), "--quiet".into()];
        for state in STOPPED_CONTAINER_STATES {
            args.push("--filter".into());
            args.push(format!("status={state}"));
        }
        let invocation = Invocation::runtime(args);
        self.list(&invocation, "stopped containers", report)
    }

    fn dangling_volumes(&self, report: &mut CleanupReport) -> Vec<String> {
        let invocation =
            Invocation::runtime(["volume", "ls", "--quiet", "--filter", "dangling=true"]);
        self.list(&invocation, "dangling volumes", report)
    }

    fn list(&self, invocation: &Invocation, what: &str, report: &mut CleanupReport) -> Vec<String> {
        match self.collaborator.run(invocation) {
            Ok(output) => {
                let mut items: Vec<String> = Vec::new();
                for line in output.stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
                    if !items.iter().any(|item| item == line) {
                        items.push(line.to_string());
                    }
                }
                items
            }
            Err(err) => {
                report.errors.push(format!("listing {what}: {err}"));
                Vec::new()
            }
        }
    }
}
