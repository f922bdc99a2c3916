//! Command-line interface for dockyard.
use std::{path::PathBuf, str::FromStr};

use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;

use crate::{error::DockyardError, registry::Target};

/// Wrapper around `LevelFilter` so clap can parse log levels from either
/// string names ("info", "debug", etc.) or numeric shorthands (0-5).
#[derive(Clone, Copy, Debug)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// String representation suitable for `RUST_LOG`.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }

        if let Ok(number) = trimmed.parse::<u8>() {
            let level = match number {
                0 => LevelFilter::OFF,
                1 => LevelFilter::ERROR,
                2 => LevelFilter::WARN,
                3 => LevelFilter::INFO,
                4 => LevelFilter::DEBUG,
                5 => LevelFilter::TRACE,
                _ => {
                    return Err(format!(
                        "unsupported log level number '{number}' (expected 0-5)"
                    ));
                }
            };

            return Ok(LogLevelArg(level));
        }

        let lowercase = trimmed.to_ascii_lowercase();
        let level = match lowercase.as_str() {
            "off" => Some(LevelFilter::OFF),
            "error" | "err" => Some(LevelFilter::ERROR),
            "warn" | "warning" => Some(LevelFilter::WARN),
            "info" | "information" => Some(LevelFilter::INFO),
            "debug" => Some(LevelFilter::DEBUG),
            "trace" => Some(LevelFilter::TRACE),
            _ => None,
        }
        .ok_or_else(|| format!("invalid log level '{trimmed}'"))?;

        Ok(LogLevelArg(level))
    }
}

/// Command-line interface for dockyard.
#[derive(Parser, Debug)]
#[command(name = "dockyard", version, author)]
#[command(
    about = "Manage a fleet of docker-compose services with atomic live-data snapshots",
    long_about = None
)]
pub struct Cli {
    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// Global config file (defaults to $DOCKYARD_CONFIG, then ~/.config/dockyard/config.yaml).
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Additional directory to scan for services, after the configured ones.
    #[arg(long = "search-path", value_name = "DIR", global = true)]
    pub search_paths: Vec<PathBuf>,

    /// Run independent services of a batch concurrently.
    #[arg(long, global = true)]
    pub parallel: bool,

    /// Disable colored output.
    #[arg(long, global = true)]
    pub no_color: bool,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for dockyard.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List discovered services.
    List {
        /// Print the catalog and discovery warnings as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Start services (and the services they depend on).
    Start {
        /// Service names, `service/subservice`, or `all`.
        #[arg(required = true, value_name = "TARGET")]
        targets: Vec<String>,
    },

    /// Stop services.
    Stop {
        /// Service names, `service/subservice`, or `all`.
        #[arg(required = true, value_name = "TARGET")]
        targets: Vec<String>,
    },

    /// Rebuild and recreate every container. Container state outside volumes is lost.
    Restart {
        /// Service names, `service/subservice`, or `all`.
        #[arg(required = true, value_name = "TARGET")]
        targets: Vec<String>,

        /// Proceed even when anonymous volumes would be replaced.
        #[arg(long)]
        allow_orphaned_volumes: bool,

        /// Do not ask for confirmation.
        #[arg(short, long)]
        yes: bool,
    },

    /// Rebuild images from scratch and recreate containers.
    Rebuild {
        /// Service names, `service/subservice`, or `all`.
        #[arg(required = true, value_name = "TARGET")]
        targets: Vec<String>,

        /// Also pull newer base images.
        #[arg(long)]
        pull: bool,
    },

    /// Show container state.
    #[command(alias = "status")]
    Info {
        /// Service names, `service/subservice`, or `all`.
        #[arg(required = true, value_name = "TARGET")]
        targets: Vec<String>,

        /// Print the summary as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show container logs.
    Logs {
        /// Service or `service/subservice`.
        #[arg(value_name = "TARGET")]
        target: String,

        /// Keep streaming new output until interrupted.
        #[arg(short, long)]
        follow: bool,

        /// Number of lines to show from the end of each container's log.
        #[arg(short = 'n', long, value_name = "LINES")]
        tail: Option<usize>,

        /// Show timestamps.
        #[arg(short, long)]
        timestamps: bool,
    },

    /// Open an interactive shell in a running container.
    Shell {
        /// `service/subservice`, or a service with a single running subservice.
        #[arg(value_name = "TARGET")]
        target: String,

        /// Subservice, as an alternative to `service/subservice`.
        #[arg(value_name = "SUBSERVICE")]
        subservice: Option<String>,

        /// Command to run instead of the shell.
        #[arg(last = true, value_name = "COMMAND")]
        command: Vec<String>,
    },

    /// Take an atomic snapshot of live data.
    ///
    /// Each snapshot lands in `livedata-snapshots/<id>` inside the service directory.
    /// A `.dockyard-snapshot.lock` file stays in the service directory; it serializes snapshots of
    /// the service and is safe to ignore.
    Snapshot {
        /// Service names or `all`.
        #[arg(required = true, value_name = "TARGET")]
        targets: Vec<String>,

        /// Convert a plain livedata/ directory into a subvolume (service must be stopped).
        #[arg(long, conflicts_with = "list")]
        convert: bool,

        /// List existing snapshots instead of taking one.
        #[arg(long)]
        list: bool,
    },

    /// Remove stopped containers, then dangling volumes.
    Clean {
        /// Also remove stopped containers that do not belong to a managed service.
        #[arg(long)]
        runtime_wide: bool,

        /// Do not ask for confirmation.
        #[arg(short, long)]
        yes: bool,
    },
}

/// Parses raw target arguments.
pub fn parse_targets(raw: &[String]) -> Result<Vec<Target>, DockyardError> {
    raw.iter().map(|target| target.parse()).collect()
}

/// Joins the two-positional shell form into a single target.
pub fn shell_target(target: &str, subservice: Option<&str>) -> Result<Target, DockyardError> {
    match subservice {
        Some(sub) => format!("{}/{}", target.trim_end_matches('/'), sub).parse(),
        None => target.parse(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_level_accepts_names_and_numbers() {
        assert_eq!("4".parse::<LogLevelArg>().unwrap().as_str(), "debug");
        assert_eq!("Warning".parse::<LogLevelArg>().unwrap().as_str(), "warn");
        assert!("9".parse::<LogLevelArg>().is_err());
        assert!("loud".parse::<LogLevelArg>().is_err());
    }

    #[test]
    fn global_flags_work_after_subcommand() {
        let cli = Cli::try_parse_from([
            "dockyard",
            "start",
            "all",
            "--parallel",
            "--search-path",
            "/opt/stacks",
            "--search-path",
            "/mnt/more",
        ])
        .unwrap();
        assert!(cli.parallel);
        assert_eq!(
            cli.search_paths,
            vec![PathBuf::from("/opt/stacks"), PathBuf::from("/mnt/more")]
        );
        match cli.command {
            Commands::Start { targets } => assert_eq!(targets, vec!["all"]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn status_is_an_alias_of_info() {
        let cli = Cli::try_parse_from(["dockyard", "status", "blog/db", "--json"]).unwrap();
        assert!(matches!(cli.command, Commands::Info { json: true, .. }));
    }

    #[test]
    fn shell_accepts_two_positionals_and_trailing_command() {
        let cli = Cli::try_parse_from(["dockyard", "shell", "blog", "db", "--", "psql", "-U", "app"])
            .unwrap();
        match cli.command {
            Commands::Shell {
                target,
                subservice,
                command,
            } => {
                assert_eq!(
                    shell_target(&target, subservice.as_deref()).unwrap(),
                    Target::Subservice {
                        service: "blog".into(),
                        subservice: "db".into()
                    }
                );
                assert_eq!(command, vec!["psql", "-U", "app"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn lifecycle_commands_require_a_target() {
        assert!(Cli::try_parse_from(["dockyard", "start"]).is_err());
        assert!(Cli::try_parse_from(["dockyard", "snapshot", "blog", "--convert", "--list"]).is_err());
    }

    #[test]
    fn snapshot_help_mentions_lock_file() {
        use clap::CommandFactory;

        let mut cli = Cli::command();
        let snapshot = cli.find_subcommand_mut("snapshot").unwrap();
        let help = snapshot.render_long_help().to_string();
        assert!(help.contains("livedata-snapshots/<id>"));
        assert!(help.contains(".dockyard-snapshot.lock"));
    }

    #[test]
    fn target_parsing_rejects_malformed_input() {
        let raw = vec!["blog".to_string(), "a/b/c".to_string()];
        assert!(parse_targets(&raw).is_err());
    }
}
