//! The "run a command inside container X" capability.
//!
//! [`CommandRunner`] is the seam between the bridge and whatever drives the
//! container. [`ContainerCli`] is the production implementation on top of
//! `docker exec` / `podman exec`; tests substitute in-process fakes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};

pub type ByteReader = Box<dyn AsyncRead + Send + Unpin>;
pub type ByteWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Output of a short-lived probe command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("{program} not found in PATH")]
    NotFound {
        program: String,
        #[source]
        source: which::Error,
    },
    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no {0} pipe from spawned process")]
    MissingPipe(&'static str),
    #[error("{0}")]
    Unavailable(String),
}

/// Wait/kill control over a spawned server process.
#[async_trait]
pub trait ProcessControl: Send {
    /// Wait for the process to exit. Must be cancel-safe.
    async fn wait(&mut self) -> std::io::Result<Option<i32>>;

    async fn kill(&mut self) -> std::io::Result<()>;

    fn id(&self) -> Option<u32>;
}

/// Stdio and control of a long-lived server process.
pub struct ServerProcess {
    pub stdin: ByteWriter,
    pub stdout: ByteReader,
    pub stderr: Option<ByteReader>,
    pub control: Box<dyn ProcessControl>,
}

impl std::fmt::Debug for ServerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerProcess")
            .field("pid", &self.control.id())
            .field("stderr", &self.stderr.is_some())
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `argv` inside `container` to completion.
    async fn run(&self, container: &str, argv: &[String]) -> Result<CommandOutput, RunnerError>;

    /// Start `argv` inside `container` with piped stdio.
    ///
    /// Called from within a tokio runtime.
    fn spawn(
        &self,
        container: &str,
        argv: &[String],
        env: &BTreeMap<String, String>,
    ) -> Result<ServerProcess, RunnerError>;
}

/// Runs commands through a container runtime's `exec` subcommand.
#[derive(Debug, Clone)]
pub struct ContainerCli {
    runtime: PathBuf,
    workdir: Option<String>,
}

impl ContainerCli {
    /// Resolve `runtime` (e.g. `docker`, `podman`) on `PATH`.
    pub fn new(runtime: &str) -> Result<Self, RunnerError> {
        let resolved = which::which(runtime).map_err(|source| RunnerError::NotFound {
            program: runtime.to_string(),
            source,
        })?;
        Ok(Self::with_runtime_path(resolved))
    }

    pub fn with_runtime_path(runtime: impl Into<PathBuf>) -> Self {
        Self {
            runtime: runtime.into(),
            workdir: None,
        }
    }

    #[must_use]
    pub fn with_workdir(mut self, workdir: Option<String>) -> Self {
        self.workdir = workdir;
        self
    }

    #[must_use]
    pub fn runtime(&self) -> &Path {
        &self.runtime
    }

    /// Arguments after the runtime binary: `exec [-i] [-w dir] [-e K=V].. container argv..`.
    fn exec_args(
        &self,
        container: &str,
        argv: &[String],
        env: &BTreeMap<String, String>,
        interactive: bool,
    ) -> Vec<String> {
        let mut args = vec![String::from("exec")];
        if interactive {
            args.push(String::from("-i"));
        }
        if let Some(dir) = &self.workdir {
            args.push(String::from("-w"));
            args.push(dir.clone());
        }
        for (key, value) in env {
            args.push(String::from("-e"));
            args.push(format!("{key}={value}"));
        }
        args.push(container.to_string());
        args.extend(argv.iter().cloned());
        args
    }
}

#[async_trait]
impl CommandRunner for ContainerCli {
    async fn run(&self, container: &str, argv: &[String]) -> Result<CommandOutput, RunnerError> {
        let args = self.exec_args(container, argv, &BTreeMap::new(), false);
        tracing::debug!(container = %container, ?argv, "Running probe in container");
        let output = Command::new(&self.runtime)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| RunnerError::Io {
                context: format!("running {} {}", self.runtime.display(), args.join(" ")),
                source,
            })?;
        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn spawn(
        &self,
        container: &str,
        argv: &[String],
        env: &BTreeMap<String, String>,
    ) -> Result<ServerProcess, RunnerError> {
        let args = self.exec_args(container, argv, env, true);
        let mut child = Command::new(&self.runtime)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RunnerError::Io {
                context: format!("spawning {} {}", self.runtime.display(), args.join(" ")),
                source,
            })?;

        let stdin = child.stdin.take().ok_or(RunnerError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(RunnerError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take();

        tracing::info!(
            container = %container,
            pid = ?child.id(),
            ?argv,
            "Spawned server process"
        );

        Ok(ServerProcess {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: stderr.map(|s| Box::new(s) as ByteReader),
            control: Box::new(ChildControl { child }),
        })
    }
}

struct ChildControl {
    child: Child,
}

#[async_trait]
impl ProcessControl for ChildControl {
    async fn wait(&mut self) -> std::io::Result<Option<i32>> {
        let status = self.child.wait().await?;
        Ok(status.code())
    }

    async fn kill(&mut self) -> std::io::Result<()> {
        self.child.kill().await
    }

    fn id(&self) -> Option<u32> {
        self.child.id()
    }
}
