//! Subprocess seam for the compose tool, the container runtime and the btrfs helper.
//!
//! The core never interprets what these tools do. It hands them arguments,
//! receives exit status and output, and surfaces failures verbatim.
use std::{
    fmt,
    io::Read,
    path::PathBuf,
    process::{Child, Command, ExitStatus, Stdio},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};
use tracing::{debug, warn};

use crate::{
    config::GlobalConfig,
    constants::{CHILD_POLL_INTERVAL, CHILD_TERMINATE_GRACE},
    error::DockyardError,
    registry::Service,
};

/// Which external tool an invocation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    /// The compose tool, scoped to one service definition.
    Compose,
    /// The container runtime CLI.
    Runtime,
    /// The btrfs helper.
    Btrfs,
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tool::Compose => write!(f, "compose"),
            Tool::Runtime => write!(f, "runtime"),
            Tool::Btrfs => write!(f, "btrfs"),
        }
    }
}

/// A single call to an external tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Tool to run.
    pub tool: Tool,
    /// Arguments after the tool's own argv prefix.
    pub args: Vec<String>,
    /// Working directory, if any.
    pub cwd: Option<PathBuf>,
}

impl Invocation {
    /// Compose call against `service`'s definition (and override), run from its root.
    pub fn compose<I, S>(service: &Service, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut argv = vec![
            "-f".to_string(),
            service.definition_path.to_string_lossy().to_string(),
        ];
        if let Some(override_path) = &service.override_path {
            argv.push("-f".to_string());
            argv.push(override_path.to_string_lossy().to_string());
        }
        argv.push("--project-directory".to_string());
        argv.push(service.root_path.to_string_lossy().to_string());
        argv.extend(args.into_iter().map(Into::into));

        Self {
            tool: Tool::Compose,
            args: argv,
            cwd: Some(service.root_path.clone()),
        }
    }

    /// Container runtime call.
    pub fn runtime<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tool: Tool::Runtime,
            args: args.into_iter().map(Into::into).collect(),
            cwd: None,
        }
    }

    /// btrfs helper call.
    pub fn btrfs<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tool: Tool::Btrfs,
            args: args.into_iter().map(Into::into).collect(),
            cwd: None,
        }
    }

    /// Arguments after the compose scoping flags; the whole argv for other tools.
    pub fn operation_args(&self) -> &[String] {
        if self.tool != Tool::Compose {
            return &self.args;
        }
        match self.args.iter().position(|arg| arg == "--project-directory") {
            Some(pos) if pos + 2 <= self.args.len() => &self.args[pos + 2..],
            _ => &self.args,
        }
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tool)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Captured result of a finished invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when the process was killed by a signal.
    pub status_code: Option<i32>,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given code and stderr.
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            status_code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Whether the process exited with status zero.
    pub fn success(&self) -> bool {
        self.status_code == Some(0)
    }
}

/// How an attached invocation reacts to an operator interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptPolicy {
    /// Terminate the subprocess and return [`DockyardError::Interrupted`].
    Terminate,
    /// Leave interrupts to the interactive program; return when it exits.
    Passthrough,
}

/// Narrow synchronous interface to external tools.
pub trait Collaborator: Send + Sync {
    /// Runs to completion with captured output, bounded by the configured timeout.
    fn execute(&self, invocation: &Invocation) -> Result<CommandOutput, DockyardError>;

    /// Runs with the terminal attached and returns the exit code.
    fn attach(
        &self,
        invocation: &Invocation,
        policy: InterruptPolicy,
    ) -> Result<i32, DockyardError>;

    /// Human-readable command line for diagnostics.
    fn render(&self, invocation: &Invocation) -> String {
        invocation.to_string()
    }

    /// Like [`Collaborator::execute`], but a non-zero exit becomes
    /// [`DockyardError::CollaboratorExecutionError`] carrying stderr verbatim.
    fn run(&self, invocation: &Invocation) -> Result<CommandOutput, DockyardError> {
        let output = self.execute(invocation)?;
        if output.success() {
            return Ok(output);
        }
        Err(DockyardError::CollaboratorExecutionError {
            command: self.render(invocation),
            code: output.status_code,
            stderr: output.stderr.trim_end().to_string(),
        })
    }
}

/// Runs the real tools as child processes.
#[derive(Debug, Clone)]
pub struct SystemCollaborator {
    compose: Vec<String>,
    runtime: Vec<String>,
    btrfs: String,
    timeout: Duration,
    interrupted: Arc<AtomicBool>,
}

impl SystemCollaborator {
    /// Builds a collaborator from the global config, observing `interrupted` for cancellation.
    pub fn new(config: &GlobalConfig, interrupted: Arc<AtomicBool>) -> Result<Self, DockyardError> {
        Ok(Self {
            compose: config.compose_command(),
            runtime: config.runtime_command(),
            btrfs: config.btrfs_command(),
            timeout: config.command_timeout()?,
            interrupted,
        })
    }

    fn argv(&self, invocation: &Invocation) -> Vec<String> {
        let mut argv = match invocation.tool {
            Tool::Compose => self.compose.clone(),
            Tool::Runtime => self.runtime.clone(),
            Tool::Btrfs => vec![self.btrfs.clone()],
        };
        argv.extend(invocation.args.iter().cloned());
        argv
    }

    fn command(&self, invocation: &Invocation) -> Result<Command, DockyardError> {
        let argv = self.argv(invocation);
        let (program, args) = argv.split_first().ok_or_else(|| {
            DockyardError::InvalidConfig(format!("empty command for {}", invocation.tool))
        })?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(cwd) = &invocation.cwd {
            cmd.current_dir(cwd);
        }
        Ok(cmd)
    }

    fn spawn(&self, mut cmd: Command, rendered: &str) -> Result<Child, DockyardError> {
        debug!("Running `{rendered}`");
        cmd.spawn()
            .map_err(|source| DockyardError::CollaboratorSpawnError {
                command: rendered.to_string(),
                source,
            })
    }

    fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }
}

impl Collaborator for SystemCollaborator {
    fn execute(&self, invocation: &Invocation) -> Result<CommandOutput, DockyardError> {
        let rendered = self.render(invocation);
        let mut cmd = self.command(invocation)?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = self.spawn(cmd, &rendered)?;

        let stdout_reader = child.stdout.take().map(spawn_reader);
        let stderr_reader = child.stderr.take().map(spawn_reader);

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(source) => {
                    return Err(DockyardError::CollaboratorSpawnError {
                        command: rendered,
                        source,
                    });
                }
            }
            if self.is_interrupted() {
                terminate(&mut child, &rendered);
                return Err(DockyardError::Interrupted(rendered));
            }
            if Instant::now() >= deadline {
                warn!("`{rendered}` exceeded {:?}; terminating", self.timeout);
                terminate(&mut child, &rendered);
                return Err(DockyardError::CollaboratorTimeout {
                    command: rendered,
                    timeout: self.timeout,
                });
            }
            thread::sleep(CHILD_POLL_INTERVAL);
        };

        let stdout = stdout_reader.map(join_reader).unwrap_or_default();
        let stderr = stderr_reader.map(join_reader).unwrap_or_default();
        debug!("`{rendered}` exited with {status}");

        Ok(CommandOutput {
            status_code: status.code(),
            stdout,
            stderr,
        })
    }

    fn attach(
        &self,
        invocation: &Invocation,
        policy: InterruptPolicy,
    ) -> Result<i32, DockyardError> {
        let rendered = self.render(invocation);
        let cmd = self.command(invocation)?;
        let mut child = self.spawn(cmd, &rendered)?;

        let status = match policy {
            InterruptPolicy::Passthrough => {
                child
                    .wait()
                    .map_err(|source| DockyardError::CollaboratorSpawnError {
                        command: rendered.clone(),
                        source,
                    })?
            }
            InterruptPolicy::Terminate => loop {
                match child.try_wait() {
                    Ok(Some(status)) => break status,
                    Ok(None) => {}
                    Err(source) => {
                        return Err(DockyardError::CollaboratorSpawnError {
                            command: rendered,
                            source,
                        });
                    }
                }
                if self.is_interrupted() {
                    terminate(&mut child, &rendered);
                    return Err(DockyardError::Interrupted(rendered));
                }
                thread::sleep(CHILD_POLL_INTERVAL);
            },
        };

        Ok(exit_code(status))
    }

    fn render(&self, invocation: &Invocation) -> String {
        self.argv(invocation).join(" ")
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut source: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        let _ = source.read_to_end(&mut buffer);
        String::from_utf8_lossy(&buffer).into_owned()
    })
}

fn join_reader(handle: thread::JoinHandle<String>) -> String {
    handle.join().unwrap_or_default()
}

fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(1)
}

/// Sends SIGTERM, waits for the grace period, then kills and reaps the child.
fn terminate(child: &mut Child, rendered: &str) {
    let pid = Pid::from_raw(child.id() as i32);
    if let Err(err) = signal::kill(pid, Signal::SIGTERM) {
        debug!("SIGTERM to `{rendered}` failed: {err}");
    }
    if let Ok(Some(_)) = wait_with_timeout(child, CHILD_TERMINATE_GRACE) {
        return;
    }
    warn!("`{rendered}` ignored SIGTERM; killing");
    let _ = child.kill();
    let _ = child.wait();
}

fn wait_with_timeout(child: &mut Child, timeout: Duration) -> std::io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait()? {
            Some(status) => return Ok(Some(status)),
            None => {
                if Instant::now() >= deadline {
                    return Ok(None);
                }
                thread::sleep(CHILD_POLL_INTERVAL);
            }
        }
    }
}
