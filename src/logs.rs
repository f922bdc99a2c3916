//! Container log output through the compose `logs` command.
use crate::{
    collaborator::{Collaborator, Invocation, InterruptPolicy},
    error::DockyardError,
    registry::Resolved,
};

/// How much log output to show.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogWindow {
    /// Keep streaming new output until interrupted.
    pub follow: bool,
    /// Only the last `n` lines per container.
    pub tail: Option<usize>,
    /// Prefix lines with timestamps.
    pub timestamps: bool,
}

/// Builds the compose `logs` arguments for a window and optional subservice.
pub fn logs_args(window: &LogWindow, subservice: Option<&str>) -> Vec<String> {
    let mut args = vec!["logs".to_string()];
    if window.follow {
        args.push("--follow".to_string());
    }
    if let Some(tail) = window.tail {
        args.push("--tail".to_string());
        args.push(tail.to_string());
    }
    if window.timestamps {
        args.push("--timestamps".to_string());
    }
    if let Some(subservice) = subservice {
        args.push(subservice.to_string());
    }
    args
}

/// Streams the combined logs of a target's containers to the terminal.
///
/// # Arguments
/// * `collaborator` - Runs the compose tool.
/// * `target` - Service, or qualified subservice, whose logs to show.
/// * `window` - Follow and tail settings.
///
/// # Returns
/// * The compose tool's exit code, or `Interrupted` when a follow was cancelled.
pub fn stream_logs(
    collaborator: &dyn Collaborator,
    target: &Resolved<'_>,
    window: &LogWindow,
) -> Result<i32, DockyardError> {
    let invocation = Invocation::compose(
        target.service,
        logs_args(window, target.subservice.as_deref()),
    );
    collaborator.attach(&invocation, InterruptPolicy::Terminate)
}
