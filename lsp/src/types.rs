//! Public types shared by the bridge, the registry and their callers.
//!
//! Callers build [`ServerConfig`]s (usually through `devbridge-config`),
//! receive [`ClientEvent`]s, and read [`HealthReport`]s for status display.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::message::Message;
use crate::translate::{Strategy, TranslationMode};

/// Raw server descriptor as it appears in a config file.
///
/// Nothing is checked here; [`ServerConfig::from_spec`] is the validated
/// boundary.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerSpec {
    pub command: String,
    pub args: Vec<String>,
    /// Editor filetypes (e.g. `go`, `python`) the server handles.
    pub filetypes: Vec<String>,
    pub extensions: Vec<String>,
    /// Globs marking a workspace root (e.g. `go.mod`, `*.csproj`).
    pub root_patterns: Vec<String>,
    /// Sent to the server as `initializationOptions`.
    pub settings: Option<Value>,
    /// Extra environment for the server process inside the container.
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServerConfigError {
    #[error("server name is empty")]
    EmptyName,
    #[error("server '{name}' has no command")]
    EmptyCommand { name: String },
    #[error("server '{name}' has no filetypes")]
    NoFiletypes { name: String },
}

/// A validated language-server descriptor.
///
/// Fields are private; construction goes through [`ServerConfig::new`] or
/// [`ServerConfig::from_spec`], which reject an empty command or filetype
/// list before anything is spawned.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    name: String,
    command: String,
    args: Vec<String>,
    filetypes: Vec<String>,
    extensions: Vec<String>,
    root_patterns: Vec<String>,
    settings: Option<Value>,
    env: BTreeMap<String, String>,
}

impl ServerConfig {
    pub fn new<I, S>(
        name: impl Into<String>,
        command: impl Into<String>,
        filetypes: I,
    ) -> Result<Self, ServerConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let spec = ServerSpec {
            command: command.into(),
            filetypes: filetypes.into_iter().map(Into::into).collect(),
            ..ServerSpec::default()
        };
        Self::from_spec(name, spec)
    }

    pub fn from_spec(name: impl Into<String>, spec: ServerSpec) -> Result<Self, ServerConfigError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ServerConfigError::EmptyName);
        }
        let command = spec.command.trim().to_string();
        if command.is_empty() {
            return Err(ServerConfigError::EmptyCommand { name });
        }
        let filetypes: Vec<String> = spec
            .filetypes
            .into_iter()
            .map(|ft| ft.trim().to_string())
            .filter(|ft| !ft.is_empty())
            .collect();
        if filetypes.is_empty() {
            return Err(ServerConfigError::NoFiletypes { name });
        }
        Ok(Self {
            name,
            command,
            args: spec.args,
            filetypes,
            extensions: spec.extensions,
            root_patterns: spec.root_patterns,
            settings: spec.settings,
            env: spec.env,
        })
    }

    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extensions = extensions.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_root_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.root_patterns = patterns.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_settings(mut self, settings: Value) -> Self {
        self.settings = Some(settings);
        self
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    #[must_use]
    pub fn filetypes(&self) -> &[String] {
        &self.filetypes
    }

    #[must_use]
    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    #[must_use]
    pub fn root_patterns(&self) -> &[String] {
        &self.root_patterns
    }

    #[must_use]
    pub fn settings(&self) -> Option<&Value> {
        self.settings.as_ref()
    }

    #[must_use]
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    #[must_use]
    pub fn handles_filetype(&self, filetype: &str) -> bool {
        self.filetypes.iter().any(|ft| ft == filetype)
    }

    /// Command followed by its arguments.
    #[must_use]
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.command.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

/// Bounds on the bridge's own waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BridgeTimeouts {
    /// How long the `initialize` handshake may take.
    pub init_timeout_secs: u64,
    /// Upper bound on a whole `stop`, including the kill fallback.
    pub stop_timeout_secs: u64,
}

impl Default for BridgeTimeouts {
    fn default() -> Self {
        Self {
            init_timeout_secs: 30,
            stop_timeout_secs: 5,
        }
    }
}

impl BridgeTimeouts {
    #[must_use]
    pub fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.init_timeout_secs)
    }

    #[must_use]
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

/// Lifecycle state of one bridged client.
///
/// `absent` has no variant: it is the lack of a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientState {
    /// Process launch requested; handshake not started.
    Starting,
    /// `initialize` sent, waiting for the result.
    Initializing,
    Ready,
    Stopping,
    Stopped,
    /// Terminal. Holds a human-readable reason.
    Failed(String),
}

impl ClientState {
    /// Starting, initializing or ready: a process is (supposed to be) running.
    #[must_use]
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Starting | Self::Initializing | Self::Ready)
    }

    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(reason) => write!(f, "failed: {reason}"),
            other => f.write_str(other.label()),
        }
    }
}

/// An event surfaced by the registry.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// A message from the server, already translated into host paths.
    /// Messages from one server arrive in the order it emitted them.
    Message { server: String, message: Message },
    StateChanged { server: String, state: ClientState },
}

/// Result of a health check. Never an error: an unknown server is simply
/// unreachable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub server: String,
    pub reachable: bool,
    pub state: Option<ClientState>,
    pub strategy: Option<Strategy>,
    pub issues: Vec<String>,
}

impl HealthReport {
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.reachable && self.issues.is_empty()
    }
}

/// Editor-side buffer identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferId(pub u64);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What the editor tells the bridge about a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferRef {
    pub id: BufferId,
    /// Host path of the file shown in the buffer.
    pub path: PathBuf,
    pub filetype: String,
}

impl BufferRef {
    pub fn new(id: u64, path: impl Into<PathBuf>, filetype: impl Into<String>) -> Self {
        Self {
            id: BufferId(id),
            path: path.into(),
            filetype: filetype.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    Available,
    Unavailable(String),
}

/// One candidate from [`Registry::detect_available`](crate::Registry::detect_available).
#[derive(Debug, Clone, PartialEq)]
pub struct ServerAvailability {
    pub config: ServerConfig,
    pub availability: Availability,
}

impl ServerAvailability {
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.availability == Availability::Available
    }

    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        match &self.availability {
            Availability::Available => None,
            Availability::Unavailable(reason) => Some(reason),
        }
    }
}

/// Per-client knobs for a single `get_or_create`.
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    /// Host-side `initialize` params from an editor. Translated to the
    /// container before sending; defaults are built when absent.
    pub initialize_params: Option<Value>,
    /// Host workspace root for default params. Falls back to the registry's
    /// workspace root.
    pub root: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct RegistryOptions {
    /// Container the servers are executed in.
    pub container: String,
    pub mode: TranslationMode,
    /// Host workspace root; also bounds root detection.
    pub workspace_root: Option<PathBuf>,
    pub timeouts: BridgeTimeouts,
}

impl RegistryOptions {
    pub fn new(container: impl Into<String>, mode: TranslationMode) -> Self {
        Self {
            container: container.into(),
            mode,
            workspace_root: None,
            timeouts: BridgeTimeouts::default(),
        }
    }

    #[must_use]
    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = Some(root.into());
        self
    }

    #[must_use]
    pub fn with_timeouts(mut self, timeouts: BridgeTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }
}
