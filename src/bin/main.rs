use std::{
    io::{self, BufRead, IsTerminal, Write},
    process::ExitCode,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use clap::Parser;
use tracing::{debug, error, warn};
use tracing_subscriber::EnvFilter;

use dockyard::{
    cli::{Cli, Commands, parse_targets, shell_target},
    collaborator::SystemCollaborator,
    config::load_global_config,
    error::DockyardError,
    logs::LogWindow,
    orchestrator::{BatchReport, Operation, Orchestrator, Outcome},
    registry::{Registry, Resolved, Target},
    runtime::RuntimeContext,
    snapshot::BtrfsCloner,
    status::{render_catalog, render_result_line, render_status},
};

fn main() -> ExitCode {
    let args = Cli::parse();
    init_logging(&args);

    let interrupted = Arc::new(AtomicBool::new(false));
    if let Err(err) = register_signal_handler(Arc::clone(&interrupted)) {
        warn!("Could not install interrupt handler: {err}");
    }

    match run(args, interrupted) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("Error: {err}");
            if err.is_usage_error() {
                ExitCode::from(2)
            } else {
                ExitCode::from(1)
            }
        }
    }
}

fn init_logging(args: &Cli) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

/// Marks the invocation as interrupted; running subprocesses are cancelled by the collaborator.
fn register_signal_handler(interrupted: Arc<AtomicBool>) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || {
        if interrupted.swap(true, Ordering::SeqCst) {
            debug!("Interrupt already pending");
        }
    })
}

fn run(args: Cli, interrupted: Arc<AtomicBool>) -> Result<u8, DockyardError> {
    let context = RuntimeContext::from_env()?;
    let config = load_global_config(args.config.as_deref(), &context)?;
    let search_paths = context.search_paths(&config, &args.search_paths);
    debug!("Search paths: {search_paths:?}");

    let registry = Registry::discover(&search_paths);
    let collaborator = SystemCollaborator::new(&config, Arc::clone(&interrupted))?;
    let cloner = BtrfsCloner::new(&collaborator);
    let orchestrator = Orchestrator::new(&registry, &collaborator, &cloner)
        .with_parallel(args.parallel || config.parallel)
        .with_writable_snapshots(config.writable_snapshots)
        .with_interrupt_flag(interrupted);
    let color = !args.no_color && io::stdout().is_terminal();

    match args.command {
        Commands::List { json } => {
            let catalog = orchestrator.catalog();
            if json {
                let warnings: Vec<String> =
                    registry.warnings().iter().map(ToString::to_string).collect();
                print_json(&serde_json::json!({
                    "services": catalog,
                    "warnings": warnings,
                }))?;
            } else {
                print!("{}", render_catalog(&catalog, color));
            }
            Ok(0)
        }
        Commands::Start { targets } => {
            batch(&orchestrator, &Operation::Start, &parse_targets(&targets)?, color)
        }
        Commands::Stop { targets } => {
            batch(&orchestrator, &Operation::Stop, &parse_targets(&targets)?, color)
        }
        Commands::Restart {
            targets,
            allow_orphaned_volumes,
            yes,
        } => {
            let targets = parse_targets(&targets)?;
            let names: Vec<String> = registry
                .resolve_all(&targets)?
                .iter()
                .map(Resolved::label)
                .collect();
            eprintln!(
                "Restart rebuilds and recreates every container of: {}",
                names.join(", ")
            );
            eprintln!(
                "All container state outside declared volumes is discarded; anonymous volumes are replaced."
            );
            if !yes && !confirm("Continue?")? {
                return Err(DockyardError::Declined);
            }
            batch(
                &orchestrator,
                &Operation::Restart {
                    allow_orphaned_volumes,
                },
                &targets,
                color,
            )
        }
        Commands::Rebuild { targets, pull } => batch(
            &orchestrator,
            &Operation::Rebuild { pull },
            &parse_targets(&targets)?,
            color,
        ),
        Commands::Info { targets, json } => {
            let report = orchestrator.apply(&Operation::Info, &parse_targets(&targets)?)?;
            if json {
                let statuses: Vec<_> = report
                    .outcomes
                    .iter()
                    .filter_map(|outcome| match &outcome.result {
                        Ok(Outcome::Status(status)) => Some(status),
                        _ => None,
                    })
                    .collect();
                print_json(&statuses)?;
                print_failures(&report, color);
            } else {
                print_report(&report, color);
            }
            Ok(report.exit_code())
        }
        Commands::Logs {
            target,
            follow,
            tail,
            timestamps,
        } => {
            let window = LogWindow {
                follow,
                tail,
                timestamps,
            };
            let target: Target = target.parse()?;
            let report = orchestrator.apply(&Operation::Logs(window), &[target])?;
            print_failures(&report, color);
            Ok(report.exit_code())
        }
        Commands::Shell {
            target,
            subservice,
            command,
        } => {
            let target = shell_target(&target, subservice.as_deref())?;
            let report = orchestrator.apply(&Operation::Shell { command }, &[target])?;
            print_failures(&report, color);
            Ok(report.exit_code())
        }
        Commands::Snapshot {
            targets,
            convert,
            list,
        } => {
            let operation = if convert {
                Operation::SnapshotConvert
            } else if list {
                Operation::SnapshotHistory
            } else {
                Operation::Snapshot
            };
            batch(&orchestrator, &operation, &parse_targets(&targets)?, color)
        }
        Commands::Clean { runtime_wide, yes } => {
            eprintln!(
                "Clean removes stopped containers{} and then every dangling volume on this host. This cannot be undone.",
                if runtime_wide {
                    " of all projects"
                } else {
                    " of managed services"
                }
            );
            if !yes && !confirm("Continue?")? {
                return Err(DockyardError::Declined);
            }
            let report = orchestrator.clean(runtime_wide);
            println!(
                "Removed {} container(s) and {} volume(s)",
                report.containers_removed, report.volumes_removed
            );
            match report.into_result() {
                Ok(_) => Ok(0),
                Err(err) => {
                    error!("{err}");
                    Ok(1)
                }
            }
        }
    }
}

fn batch(
    orchestrator: &Orchestrator<'_>,
    operation: &Operation,
    targets: &[Target],
    color: bool,
) -> Result<u8, DockyardError> {
    let report = orchestrator.apply(operation, targets)?;
    print_report(&report, color);
    Ok(report.exit_code())
}

fn print_report(report: &BatchReport, color: bool) {
    for outcome in &report.outcomes {
        match &outcome.result {
            Ok(Outcome::Done(message)) => {
                let detail = if outcome.requested {
                    message.clone()
                } else {
                    format!("{message} (dependency)")
                };
                println!("{}", render_result_line(&outcome.target, true, &detail, color));
            }
            Ok(Outcome::Status(status)) => {
                print!("{}", render_status(std::slice::from_ref(status), color))
            }
            Ok(Outcome::Snapshot(record)) => println!(
                "{}",
                render_result_line(
                    &outcome.target,
                    true,
                    &format!("snapshot {} at {}", record.timestamp_id, record.path.display()),
                    color
                )
            ),
            Ok(Outcome::History(records)) => {
                println!(
                    "{}",
                    render_result_line(
                        &outcome.target,
                        true,
                        &format!("{} snapshot(s)", records.len()),
                        color
                    )
                );
                for record in records {
                    println!(
                        "  {}  {:<8}  {}",
                        record.timestamp_id,
                        record.status,
                        record.path.display()
                    );
                }
            }
            Ok(Outcome::Exited(_)) => {}
            Err(err) => println!(
                "{}",
                render_result_line(&outcome.target, false, &err.to_string(), color)
            ),
        }
    }
    print_summary(report);
}

fn print_failures(report: &BatchReport, color: bool) {
    for outcome in report.failures() {
        if let Err(err) = &outcome.result {
            eprintln!(
                "{}",
                render_result_line(&outcome.target, false, &err.to_string(), color)
            );
        }
    }
}

fn print_summary(report: &BatchReport) {
    let failed = report.failures().count();
    if failed > 0 {
        eprintln!(
            "{} of {} target(s) failed during {}",
            failed,
            report.outcomes.len(),
            report.operation
        );
    }
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<(), DockyardError> {
    let rendered = serde_json::to_string_pretty(value).map_err(|source| {
        DockyardError::OutputParseError {
            command: "json output".into(),
            source,
        }
    })?;
    println!("{rendered}");
    Ok(())
}

/// Asks on the terminal. Without a terminal the answer is yes, so scripted runs are not blocked.
fn confirm(question: &str) -> Result<bool, DockyardError> {
    if !io::stdin().is_terminal() {
        return Ok(true);
    }
    eprint!("{question} [y/N] ");
    io::stderr()
        .flush()
        .map_err(|e| DockyardError::at_path("/dev/stderr", e))?;
    let mut answer = String::new();
    io::stdin()
        .lock()
        .read_line(&mut answer)
        .map_err(|e| DockyardError::at_path("/dev/stdin", e))?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}
