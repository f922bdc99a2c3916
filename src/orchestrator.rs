//! Applies lifecycle operations to resolved targets and aggregates per-target outcomes.
//!
//! Every target of a batch is attempted. A failing target is recorded in the
//! [`BatchReport`] and the batch moves on; only resolution errors abort before
//! anything runs.
use std::{
    fs,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use strum_macros::AsRefStr;
use tracing::{debug, error, info, warn};

use crate::{
    cleanup::{Cleanup, CleanupReport},
    collaborator::{Collaborator, InterruptPolicy, Invocation},
    constants::{DEFAULT_SHELL, POST_START_VERIFY_ATTEMPTS, POST_START_VERIFY_DELAY},
    error::DockyardError,
    logs::{LogWindow, stream_logs},
    registry::{Registry, Resolved, Service, Target},
    snapshot::{CowCloner, SnapshotManager, SnapshotRecord},
    status::{CatalogEntry, ContainerSummary, StatusReport, parse_ps_output},
};

/// Operations applied per target.
#[derive(Debug, Clone, PartialEq, Eq, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum Operation {
    /// `up -d`, then verify something is running.
    Start,
    /// `stop`.
    Stop,
    /// Forced rebuild and recreate of every container.
    Restart {
        /// Proceed even though anonymous volumes will be replaced.
        allow_orphaned_volumes: bool,
    },
    /// Full image rebuild ignoring the build cache, then recreate.
    Rebuild {
        /// Also pull newer base images.
        pull: bool,
    },
    /// Container state summary.
    Info,
    /// Combined container logs.
    Logs(LogWindow),
    /// Interactive session inside one running container.
    Shell {
        /// Command to run instead of the configured shell.
        command: Vec<String>,
    },
    /// Atomic live-data snapshot.
    Snapshot,
    /// Convert `livedata/` into a subvolume.
    SnapshotConvert,
    /// List existing snapshots.
    SnapshotHistory,
}

impl Operation {
    fn runs_in_parallel(&self) -> bool {
        !matches!(self, Operation::Logs(_) | Operation::Shell { .. })
    }

    fn is_service_level(&self) -> bool {
        matches!(
            self,
            Operation::Snapshot | Operation::SnapshotConvert | Operation::SnapshotHistory
        )
    }
}

/// Successful result of one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Completed with a short message.
    Done(String),
    /// State summary from `info`.
    Status(StatusReport),
    /// A finished snapshot.
    Snapshot(SnapshotRecord),
    /// Snapshot history.
    History(Vec<SnapshotRecord>),
    /// Attached session ended with this exit code.
    Exited(i32),
}

/// Result of one target of a batch.
#[derive(Debug)]
pub struct TargetOutcome {
    /// `service` or `service/subservice`.
    pub target: String,
    /// False when the target was only included as a dependency.
    pub requested: bool,
    /// What happened.
    pub result: Result<Outcome, DockyardError>,
}

/// Ordered outcomes of a batch.
#[derive(Debug)]
pub struct BatchReport {
    /// Operation name.
    pub operation: String,
    /// One entry per attempted target, in execution order.
    pub outcomes: Vec<TargetOutcome>,
}

impl BatchReport {
    /// Whether every target succeeded.
    pub fn succeeded(&self) -> bool {
        self.outcomes.iter().all(|outcome| outcome.result.is_ok())
    }

    /// Failed targets.
    pub fn failures(&self) -> impl Iterator<Item = &TargetOutcome> {
        self.outcomes.iter().filter(|outcome| outcome.result.is_err())
    }

    /// Process exit code for this batch.
    ///
    /// Any failure yields `1`; a lone attached session passes its own code through.
    pub fn exit_code(&self) -> u8 {
        if !self.succeeded() {
            return 1;
        }
        match self.outcomes.as_slice() {
            [
                TargetOutcome {
                    result: Ok(Outcome::Exited(code)),
                    ..
                },
            ] => u8::try_from(*code).unwrap_or(1),
            _ => 0,
        }
    }
}

/// One unit of work inside a batch.
#[derive(Debug, Clone)]
struct WorkItem<'r> {
    target: Resolved<'r>,
    requested: bool,
}

/// Applies operations to services of a [`Registry`].
pub struct Orchestrator<'a> {
    registry: &'a Registry,
    collaborator: &'a dyn Collaborator,
    cloner: &'a dyn CowCloner,
    parallel: bool,
    writable_snapshots: bool,
    interrupted: Arc<AtomicBool>,
    verify_attempts: usize,
    verify_delay: Duration,
}

impl<'a> Orchestrator<'a> {
    /// Creates a sequential orchestrator.
    pub fn new(
        registry: &'a Registry,
        collaborator: &'a dyn Collaborator,
        cloner: &'a dyn CowCloner,
    ) -> Self {
        Self {
            registry,
            collaborator,
            cloner,
            parallel: false,
            writable_snapshots: false,
            interrupted: Arc::new(AtomicBool::new(false)),
            verify_attempts: POST_START_VERIFY_ATTEMPTS,
            verify_delay: POST_START_VERIFY_DELAY,
        }
    }

    /// Runs independent services of a batch concurrently.
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Produces writable snapshots.
    pub fn with_writable_snapshots(mut self, writable: bool) -> Self {
        self.writable_snapshots = writable;
        self
    }

    /// Flag set by the interrupt handler; pending targets are skipped once it is set.
    pub fn with_interrupt_flag(mut self, interrupted: Arc<AtomicBool>) -> Self {
        self.interrupted = interrupted;
        self
    }

    /// Overrides the post-start verification schedule.
    pub fn with_verification(mut self, attempts: usize, delay: Duration) -> Self {
        self.verify_attempts = attempts.max(1);
        self.verify_delay = delay;
        self
    }

    fn snapshots(&self) -> SnapshotManager<'a> {
        SnapshotManager::new(self.cloner, self.writable_snapshots)
    }

    /// Catalog rows for `list`. Read-only.
    pub fn catalog(&self) -> Vec<CatalogEntry> {
        let snapshots = self.snapshots();
        self.registry
            .services()
            .iter()
            .map(|service| CatalogEntry {
                name: service.name.clone(),
                root_path: service.root_path.clone(),
                subservices: service.subservices.clone(),
                snapshot: snapshots.readiness(service).to_string(),
                depends_on: service.depends_on.clone(),
            })
            .collect()
    }

    /// Two-phase cleanup over every managed service.
    pub fn clean(&self, runtime_wide: bool) -> CleanupReport {
        let services: Vec<&Service> = self.registry.services().iter().collect();
        Cleanup::new(self.collaborator).clean(&services, runtime_wide)
    }

    /// Applies `operation` to `targets`.
    ///
    /// Resolution and dependency errors are returned before any side effect.
    /// Everything after that is captured per target in the report.
    pub fn apply(
        &self,
        operation: &Operation,
        targets: &[Target],
    ) -> Result<BatchReport, DockyardError> {
        let resolved = self.registry.resolve_all(targets)?;

        if let Operation::Shell { command } = operation {
            return Ok(self.shell_batch(resolved, command));
        }
        if matches!(operation, Operation::Logs(_)) && resolved.len() != 1 {
            let requested: Vec<String> = targets.iter().map(ToString::to_string).collect();
            return Err(DockyardError::AmbiguousTarget {
                target: requested.join(" "),
                candidates: resolved.iter().map(Resolved::label).collect(),
            });
        }

        let items = self.plan(operation, resolved)?;
        debug!(
            "Applying {} to {} target(s)",
            operation.as_ref(),
            items.len()
        );

        let outcomes = if self.parallel && operation.runs_in_parallel() {
            self.run_waves(operation, items)
        } else {
            items
                .into_iter()
                .map(|item| self.run_item(operation, item))
                .collect()
        };

        Ok(BatchReport {
            operation: operation.as_ref().to_string(),
            outcomes,
        })
    }

    /// Orders work items, expanding dependencies where the operation needs them.
    fn plan<'r>(
        &'r self,
        operation: &Operation,
        resolved: Vec<Resolved<'r>>,
    ) -> Result<Vec<WorkItem<'r>>, DockyardError> {
        let resolved: Vec<Resolved<'r>> = if operation.is_service_level() {
            let mut whole: Vec<Resolved<'r>> = Vec::new();
            for item in resolved {
                let item = Resolved {
                    service: item.service,
                    subservice: None,
                };
                if !whole.contains(&item) {
                    whole.push(item);
                }
            }
            whole
        } else {
            resolved
        };

        let (expand, reverse) = match operation {
            Operation::Start | Operation::Restart { .. } => (true, false),
            Operation::Stop => (false, true),
            Operation::Rebuild { .. } => (false, false),
            _ => {
                return Ok(resolved
                    .into_iter()
                    .map(|target| WorkItem {
                        target,
                        requested: true,
                    })
                    .collect());
            }
        };

        let mut services: Vec<&'r Service> = Vec::new();
        for item in &resolved {
            if !services.iter().any(|s| s.name == item.service.name) {
                services.push(item.service);
            }
        }

        let mut items = Vec::new();
        for (service, requested) in self.registry.dependency_order(&services, expand)? {
            if requested {
                items.extend(
                    resolved
                        .iter()
                        .filter(|item| item.service.name == service.name)
                        .cloned()
                        .map(|target| WorkItem {
                            target,
                            requested: true,
                        }),
                );
            } else {
                items.push(WorkItem {
                    target: Resolved {
                        service,
                        subservice: None,
                    },
                    requested: false,
                });
            }
        }
        if reverse {
            items.reverse();
        }
        Ok(items)
    }

    /// Splits ordered items into waves whose members do not depend on each other.
    fn waves<'r>(&self, operation: &Operation, items: Vec<WorkItem<'r>>) -> Vec<Vec<WorkItem<'r>>> {
        let reverse = matches!(operation, Operation::Stop);
        let mut waves: Vec<Vec<WorkItem<'r>>> = Vec::new();
        for item in items {
            let conflicts = waves.last().is_some_and(|wave| {
                wave.iter().any(|other| {
                    let (later, earlier) = if reverse {
                        (other.target.service, item.target.service)
                    } else {
                        (item.target.service, other.target.service)
                    };
                    later.name == earlier.name || self.registry.depends_on(later, &earlier.name)
                })
            });
            match waves.last_mut() {
                Some(wave) if !conflicts => wave.push(item),
                _ => waves.push(vec![item]),
            }
        }
        waves
    }

    fn run_waves(&self, operation: &Operation, items: Vec<WorkItem<'_>>) -> Vec<TargetOutcome> {
        let mut outcomes = Vec::new();
        for wave in self.waves(operation, items) {
            if wave.len() == 1 {
                outcomes.extend(wave.into_iter().map(|item| self.run_item(operation, item)));
                continue;
            }
            debug!("Running wave of {} target(s) concurrently", wave.len());
            let wave_outcomes: Vec<TargetOutcome> = thread::scope(|scope| {
                let handles: Vec<_> = wave
                    .into_iter()
                    .map(|item| {
                        let label = item.target.label();
                        let requested = item.requested;
                        (
                            label,
                            requested,
                            scope.spawn(move || self.run_item(operation, item)),
                        )
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|(target, requested, handle)| {
                        handle.join().unwrap_or_else(|_| TargetOutcome {
                            result: Err(DockyardError::WorkerPanicked(target.clone())),
                            target,
                            requested,
                        })
                    })
                    .collect()
            });
            outcomes.extend(wave_outcomes);
        }
        outcomes
    }

    fn run_item(&self, operation: &Operation, item: WorkItem<'_>) -> TargetOutcome {
        let label = item.target.label();
        let result = if self.interrupted.load(Ordering::SeqCst) {
            Err(DockyardError::Interrupted(label.clone()))
        } else if item.requested {
            self.execute(operation, &item.target)
        } else {
            info!("Starting dependency '{label}'");
            self.start(&item.target)
        };

        match &result {
            Ok(_) => debug!("{} {label}: ok", operation.as_ref()),
            Err(err) => error!("{} {label}: {err}", operation.as_ref()),
        }

        TargetOutcome {
            target: label,
            requested: item.requested,
            result,
        }
    }

    fn execute(
        &self,
        operation: &Operation,
        target: &Resolved<'_>,
    ) -> Result<Outcome, DockyardError> {
        match operation {
            Operation::Start => self.start(target),
            Operation::Stop => {
                self.compose(target, ["stop"])?;
                Ok(Outcome::Done("stopped".into()))
            }
            Operation::Restart {
                allow_orphaned_volumes,
            } => self.restart(target, *allow_orphaned_volumes),
            Operation::Rebuild { pull } => self.rebuild(target, *pull),
            Operation::Info => self.info(target).map(Outcome::Status),
            Operation::Logs(window) => {
                match stream_logs(self.collaborator, target, window)? {
                    0 => Ok(Outcome::Done("logs ended".into())),
                    code => Err(DockyardError::CollaboratorExecutionError {
                        command: format!("logs {}", target.label()),
                        code: Some(code),
                        stderr: String::new(),
                    }),
                }
            }
            Operation::Shell { command } => self.shell(target, command),
            Operation::Snapshot => self
                .snapshots()
                .snapshot(target.service)
                .map(Outcome::Snapshot),
            Operation::SnapshotConvert => self.convert(target.service),
            Operation::SnapshotHistory => self
                .snapshots()
                .history(target.service)
                .map(Outcome::History),
        }
    }

    /// Runs a compose subcommand against the target, appending the subservice when qualified.
    fn compose<const N: usize>(
        &self,
        target: &Resolved<'_>,
        args: [&str; N],
    ) -> Result<(), DockyardError> {
        let mut argv: Vec<String> = args.iter().map(|arg| arg.to_string()).collect();
        if let Some(subservice) = &target.subservice {
            argv.push(subservice.clone());
        }
        self.collaborator
            .run(&Invocation::compose(target.service, argv))?;
        Ok(())
    }

    fn start(&self, target: &Resolved<'_>) -> Result<Outcome, DockyardError> {
        self.ensure_livedata_owner(target.service)?;
        self.compose(target, ["up", "-d"])?;
        self.verify_running(target)?;
        Ok(Outcome::Done("started".into()))
    }

    fn restart(
        &self,
        target: &Resolved<'_>,
        allow_orphaned_volumes: bool,
    ) -> Result<Outcome, DockyardError> {
        let volumes: Vec<String> = target
            .service
            .anonymous_volumes
            .iter()
            .filter(|volume| match &target.subservice {
                Some(sub) => volume.starts_with(&format!("{sub}:")),
                None => true,
            })
            .cloned()
            .collect();

        if !volumes.is_empty() {
            if !allow_orphaned_volumes {
                return Err(DockyardError::UnsafeRestart {
                    service: target.label(),
                    volumes,
                });
            }
            warn!(
                "Restarting '{}' replaces anonymous volume(s) {}; their contents will be lost",
                target.label(),
                volumes.join(", ")
            );
        }

        self.ensure_livedata_owner(target.service)?;
        self.compose(
            target,
            [
                "up",
                "-d",
                "--build",
                "--force-recreate",
                "--renew-anon-volumes",
            ],
        )?;
        self.verify_running(target)?;
        Ok(Outcome::Done("recreated".into()))
    }

    fn rebuild(&self, target: &Resolved<'_>, pull: bool) -> Result<Outcome, DockyardError> {
        self.ensure_livedata_owner(target.service)?;
        if pull {
            self.compose(target, ["build", "--no-cache", "--pull"])?;
        } else {
            self.compose(target, ["build", "--no-cache"])?;
        }
        self.compose(target, ["up", "-d", "--force-recreate"])?;
        self.verify_running(target)?;
        Ok(Outcome::Done("rebuilt".into()))
    }

    /// Containers of `service` as reported by `ps --all`.
    fn containers(&self, service: &Service) -> Result<Vec<ContainerSummary>, DockyardError> {
        let invocation = Invocation::compose(service, ["ps", "--all", "--format", "json"]);
        let output = self.collaborator.run(&invocation)?;
        parse_ps_output(&output.stdout).map_err(|source| DockyardError::OutputParseError {
            command: self.collaborator.render(&invocation),
            source,
        })
    }

    fn running(&self, target: &Resolved<'_>) -> Result<Vec<ContainerSummary>, DockyardError> {
        Ok(self
            .containers(target.service)?
            .into_iter()
            .filter(|c| c.is_running())
            .filter(|c| match &target.subservice {
                Some(sub) => &c.subservice == sub,
                None => true,
            })
            .collect())
    }

    fn verify_running(&self, target: &Resolved<'_>) -> Result<(), DockyardError> {
        for attempt in 1..=self.verify_attempts {
            if !self.verify_delay.is_zero() {
                thread::sleep(self.verify_delay);
            }
            if !self.running(target)?.is_empty() {
                return Ok(());
            }
            debug!(
                "No running container for '{}' yet (check {attempt}/{})",
                target.label(),
                self.verify_attempts
            );
        }
        Err(DockyardError::NothingRunning(target.label()))
    }

    fn info(&self, target: &Resolved<'_>) -> Result<StatusReport, DockyardError> {
        let containers = self.containers(target.service)?;
        Ok(StatusReport::build(
            target.label(),
            &target.service.subservices,
            target.subservice.as_deref(),
            &containers,
        ))
    }

    fn shell_batch(&self, resolved: Vec<Resolved<'_>>, command: &[String]) -> BatchReport {
        let operation = Operation::Shell {
            command: command.to_vec(),
        };
        let outcome = match resolved.as_slice() {
            [target] => self.run_item(
                &operation,
                WorkItem {
                    target: target.clone(),
                    requested: true,
                },
            ),
            _ => {
                let candidates: Vec<String> = resolved.iter().map(Resolved::label).collect();
                TargetOutcome {
                    target: candidates.join(" "),
                    requested: true,
                    result: Err(DockyardError::AmbiguousTarget {
                        target: candidates.join(" "),
                        candidates,
                    }),
                }
            }
        };
        BatchReport {
            operation: operation.as_ref().to_string(),
            outcomes: vec![outcome],
        }
    }

    fn shell(&self, target: &Resolved<'_>, command: &[String]) -> Result<Outcome, DockyardError> {
        let running = self.running(target)?;

        let mut subservices: Vec<&str> = Vec::new();
        for container in &running {
            if !subservices.contains(&container.subservice.as_str()) {
                subservices.push(container.subservice.as_str());
            }
        }

        let subservice = match (subservices.as_slice(), &target.subservice) {
            ([], _) => return Err(DockyardError::NotRunning(target.label())),
            ([_], _) if running.len() > 1 => {
                return Err(DockyardError::AmbiguousTarget {
                    target: target.label(),
                    candidates: running.iter().map(|c| c.name.clone()).collect(),
                });
            }
            ([only], _) => only.to_string(),
            (many, _) => {
                return Err(DockyardError::AmbiguousTarget {
                    target: target.label(),
                    candidates: many
                        .iter()
                        .map(|sub| format!("{}/{sub}", target.service.name))
                        .collect(),
                });
            }
        };

        let mut argv = vec!["exec".to_string(), subservice];
        if command.is_empty() {
            argv.push(
                target
                    .service
                    .shell
                    .clone()
                    .unwrap_or_else(|| DEFAULT_SHELL.to_string()),
            );
        } else {
            argv.extend(command.iter().cloned());
        }

        let code = self.collaborator.attach(
            &Invocation::compose(target.service, argv),
            InterruptPolicy::Passthrough,
        )?;
        Ok(Outcome::Exited(code))
    }

    fn convert(&self, service: &Service) -> Result<Outcome, DockyardError> {
        let whole = Resolved {
            service,
            subservice: None,
        };
        if !self.running(&whole)?.is_empty() {
            return Err(DockyardError::ServiceRunning(service.name.clone()));
        }
        if self.snapshots().convert_to_subvolume(service)? {
            Ok(Outcome::Done("livedata/ converted to a subvolume".into()))
        } else {
            Ok(Outcome::Done("livedata/ already is a subvolume".into()))
        }
    }

    /// Applies the configured owner to `livedata/` without following symlinks.
    fn ensure_livedata_owner(&self, service: &Service) -> Result<(), DockyardError> {
        let (Some(owner), Some(live)) = (&service.livedata_owner, &service.live_data_path) else {
            return Ok(());
        };
        let uid = owner.resolve_uid()?;
        debug!("Ensuring {} is owned by uid {uid}", live.display());
        chown_tree(live, uid)
    }
}

fn chown_tree(path: &Path, uid: u32) -> Result<(), DockyardError> {
    std::os::unix::fs::lchown(path, Some(uid), None)
        .map_err(|e| DockyardError::at_path(path, e))?;
    let metadata = fs::symlink_metadata(path).map_err(|e| DockyardError::at_path(path, e))?;
    if metadata.is_dir() {
        let entries = fs::read_dir(path).map_err(|e| DockyardError::at_path(path, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| DockyardError::at_path(path, e))?;
            chown_tree(&entry.path(), uid)?;
        }
    }
    Ok(())
}
