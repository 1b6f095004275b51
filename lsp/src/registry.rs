//! Registry facade: the public API used by editor-facing code.
//!
//! One record per server name. `get_or_create` takes `&mut self`, so the
//! check for an existing record and the insert of a new one can't
//! interleave; a second call for a live name returns the first handle.
//!
//! Failed records stay in the table so health checks can explain them.
//! They are replaced, never silently respawned, by the next explicit
//! `get_or_create`.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::bridge::{BridgeEvent, ClientBridge, ClientHandle, Launch};
use crate::error::BridgeError;
use crate::languages::{LanguageRegistry, find_root};
use crate::protocol;
use crate::runner::CommandRunner;
use crate::translate::{MappingError, PathTranslator, TranslationMode, WorkspaceMapping};
use crate::types::{
    Availability, BufferId, BufferRef, ClientEvent, ClientOptions, ClientState, HealthReport,
    RegistryOptions, ServerAvailability, ServerConfig,
};

/// Channel capacity for the event channel between client tasks and the registry.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Probe for an executable on the container's `PATH`. The command name is
/// passed as a positional argument, never spliced into the script.
const PROBE_SCRIPT: &str = "command -v \"$1\"";

pub struct Registry {
    runner: Arc<dyn CommandRunner>,
    languages: Arc<dyn LanguageRegistry>,
    options: RegistryOptions,
    clients: HashMap<String, ClientBridge>,
    next_generation: u64,
    event_tx: mpsc::Sender<BridgeEvent>,
    event_rx: mpsc::Receiver<BridgeEvent>,
    /// State changes produced synchronously, delivered before queued events.
    notices: VecDeque<ClientEvent>,
}

impl Registry {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        languages: Arc<dyn LanguageRegistry>,
        options: RegistryOptions,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            runner,
            languages,
            options,
            clients: HashMap::new(),
            next_generation: 0,
            event_tx,
            event_rx,
            notices: VecDeque::new(),
        }
    }

    #[must_use]
    pub fn options(&self) -> &RegistryOptions {
        &self.options
    }

    /// Number of records, failed ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Return the live client for `config.name()`, starting one if needed.
    ///
    /// Must be called from within a tokio runtime. Returns as soon as the
    /// process is spawned; the handshake continues in the background.
    pub fn get_or_create(&mut self, config: &ServerConfig) -> Result<ClientHandle, BridgeError> {
        self.get_or_create_with(config, ClientOptions::default())
    }

    pub fn get_or_create_with(
        &mut self,
        config: &ServerConfig,
        options: ClientOptions,
    ) -> Result<ClientHandle, BridgeError> {
        let name = config.name();
        if let Some(existing) = self.clients.get(name) {
            if existing.state().is_live() {
                tracing::debug!(server = %name, "Reusing live client");
                return Ok(existing.handle().clone());
            }
            tracing::info!(server = %name, state = %existing.state(), "Replacing client");
        }

        self.next_generation += 1;
        let translator = Arc::new(PathTranslator::new(self.options.mode.clone()));
        let initialize_params = self.initialize_params_for(config, options);
        tracing::info!(
            server = %name,
            container = %self.options.container,
            command = %config.command(),
            strategy = ?translator.strategy(),
            "Starting server"
        );

        let record = ClientBridge::launch(
            self.runner.as_ref(),
            Launch {
                config: config.clone(),
                generation: self.next_generation,
                container: &self.options.container,
                translator,
                initialize_params,
                timeouts: self.options.timeouts,
                events: self.event_tx.clone(),
            },
        );

        let outcome = match record.state() {
            ClientState::Failed(reason) => Err(BridgeError::StartFailed {
                server: name.to_string(),
                reason: reason.clone(),
            }),
            _ => Ok(record.handle().clone()),
        };
        self.notices.push_back(ClientEvent::StateChanged {
            server: name.to_string(),
            state: record.state().clone(),
        });
        self.clients.insert(name.to_string(), record);
        outcome
    }

    /// Start (or reuse) the preferred server for a buffer's filetype and
    /// attach the buffer to it.
    ///
    /// `Ok(None)` when no server handles the filetype.
    pub fn start_for_buffer(&mut self, buffer: BufferRef) -> Result<Option<ClientHandle>, BridgeError> {
        let candidates = self.languages.get_by_filetype(&buffer.filetype);
        let Some(config) = candidates
            .iter()
            .find(|c| self.client_exists(c.name()))
            .or_else(|| candidates.first())
            .cloned()
        else {
            tracing::debug!(filetype = %buffer.filetype, "No server for filetype");
            return Ok(None);
        };

        let boundary = self.host_root();
        let root = find_root(&buffer.path, config.root_patterns(), boundary.as_deref())
            .or(boundary);
        let handle = self.get_or_create_with(
            &config,
            ClientOptions {
                initialize_params: None,
                root,
            },
        )?;
        self.attach_buffer(config.name(), buffer)?;
        Ok(Some(handle))
    }

    /// Record `buffer` as attached. Attaching twice is a no-op; returns
    /// whether it was newly attached.
    pub fn attach_buffer(&mut self, name: &str, buffer: BufferRef) -> Result<bool, BridgeError> {
        match self.clients.get_mut(name) {
            Some(record) if record.state().is_live() => {
                let id = buffer.id;
                let added = record.attach(buffer);
                if added {
                    tracing::debug!(server = %name, buffer = %id, "Buffer attached");
                }
                Ok(added)
            }
            _ => Err(BridgeError::NotRunning {
                server: name.to_string(),
            }),
        }
    }

    pub fn detach_buffer(&mut self, name: &str, id: BufferId) -> bool {
        self.clients
            .get_mut(name)
            .is_some_and(|record| record.detach(id))
    }

    /// Attached buffers, ordered by id.
    #[must_use]
    pub fn buffers(&self, name: &str) -> Vec<BufferRef> {
        self.clients
            .get(name)
            .map(ClientBridge::buffers)
            .unwrap_or_default()
    }

    /// Whether a live (starting, initializing or ready) client exists.
    #[must_use]
    pub fn client_exists(&self, name: &str) -> bool {
        self.clients
            .get(name)
            .is_some_and(|record| record.state().is_live())
    }

    /// `None` means absent.
    #[must_use]
    pub fn get_state(&self, name: &str) -> Option<ClientState> {
        self.clients.get(name).map(|record| record.state().clone())
    }

    #[must_use]
    pub fn handle(&self, name: &str) -> Option<ClientHandle> {
        self.clients
            .get(name)
            .filter(|record| record.state().is_live())
            .map(|record| record.handle().clone())
    }

    /// The server's `InitializeResult`, in host paths, once ready.
    #[must_use]
    pub fn initialize_result(&self, name: &str) -> Option<&Value> {
        self.clients.get(name).and_then(ClientBridge::init_result)
    }

    #[must_use]
    pub fn health_check(&self, name: &str) -> HealthReport {
        match self.clients.get(name) {
            Some(record) => record.health(),
            None => HealthReport {
                server: name.to_string(),
                reachable: false,
                state: None,
                strategy: None,
                issues: vec![format!("no client for '{name}'")],
            },
        }
    }

    /// Point every translator, current and future, at a new mapping.
    pub fn configure_mapping(
        &mut self,
        host_root: &str,
        container_root: &str,
    ) -> Result<(), MappingError> {
        if self.options.mode == TranslationMode::Passthrough {
            return Err(MappingError::Passthrough);
        }
        let mapping = WorkspaceMapping::new(host_root, container_root)?;
        for record in self.clients.values() {
            record
                .translator()
                .configure(mapping.host_root(), mapping.container_root())?;
        }
        self.options.mode = TranslationMode::Rewrite(mapping);
        Ok(())
    }

    /// Stop the client for `name`. A name with no record is a no-op.
    pub async fn stop(&mut self, name: &str) {
        let Some(record) = self.clients.remove(name) else {
            tracing::debug!(server = %name, "Stop requested for absent client");
            return;
        };
        if record.state().is_live() {
            self.notices.push_back(ClientEvent::StateChanged {
                server: name.to_string(),
                state: ClientState::Stopping,
            });
        }
        tracing::info!(server = %name, "Stopping server");
        record.shutdown(self.options.timeouts.stop_timeout()).await;
        self.notices.push_back(ClientEvent::StateChanged {
            server: name.to_string(),
            state: ClientState::Stopped,
        });
    }

    /// Stop everything and return to the freshly constructed state, pending
    /// events included. A mapping set through [`Self::configure_mapping`]
    /// belongs to the session and stays in effect for later clients.
    pub async fn stop_all(&mut self) {
        let mut names: Vec<String> = self.clients.keys().cloned().collect();
        names.sort();
        for name in names {
            self.stop(&name).await;
        }
        while self.event_rx.try_recv().is_ok() {}
        self.notices.clear();
    }

    /// Probe every candidate server for `filetype` inside the container.
    pub async fn detect_available(&self, filetype: &str) -> Vec<ServerAvailability> {
        let mut found = Vec::new();
        for config in self.languages.get_by_filetype(filetype) {
            let availability = self.probe(&config).await;
            tracing::debug!(server = %config.name(), ?availability, "Probed server");
            found.push(ServerAvailability {
                config,
                availability,
            });
        }
        found
    }

    async fn probe(&self, config: &ServerConfig) -> Availability {
        let argv = [
            "sh",
            "-c",
            PROBE_SCRIPT,
            "sh",
            config.command(),
        ]
        .map(String::from);
        match self.runner.run(&self.options.container, &argv).await {
            Ok(output) if output.success() => Availability::Available,
            Ok(output) => {
                let detail = output.stderr.trim();
                if detail.is_empty() {
                    Availability::Unavailable(format!("command not found: {}", config.command()))
                } else {
                    Availability::Unavailable(format!(
                        "command not found: {} ({detail})",
                        config.command()
                    ))
                }
            }
            Err(e) => Availability::Unavailable(e.to_string()),
        }
    }

    /// Drain pending events, up to `budget`. Non-blocking.
    pub fn poll_events(&mut self, budget: usize) -> Vec<ClientEvent> {
        let mut events = Vec::new();
        while events.len() < budget {
            if let Some(notice) = self.notices.pop_front() {
                events.push(notice);
                continue;
            }
            match self.event_rx.try_recv() {
                Ok(event) => {
                    if let Some(event) = self.handle_event(event) {
                        events.push(event);
                    }
                }
                Err(mpsc::error::TryRecvError::Empty | mpsc::error::TryRecvError::Disconnected) => {
                    break;
                }
            }
        }
        events
    }

    /// Wait for the next event. Cancel-safe.
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        loop {
            if let Some(notice) = self.notices.pop_front() {
                return Some(notice);
            }
            let event = self.event_rx.recv().await?;
            if let Some(event) = self.handle_event(event) {
                return Some(event);
            }
        }
    }

    fn handle_event(&mut self, event: BridgeEvent) -> Option<ClientEvent> {
        let Some(record) = self.clients.get_mut(&event.server) else {
            tracing::trace!(server = %event.server, "Event for absent client");
            return None;
        };
        if record.generation() != event.generation {
            tracing::trace!(server = %event.server, "Event from a replaced client");
            return None;
        }
        record.apply(event.kind)
    }

    fn host_root(&self) -> Option<PathBuf> {
        self.options.workspace_root.clone().or_else(|| match &self.options.mode {
            TranslationMode::Rewrite(mapping) => Some(PathBuf::from(mapping.host_root())),
            TranslationMode::Passthrough | TranslationMode::Unconfigured => None,
        })
    }

    fn initialize_params_for(&self, config: &ServerConfig, options: ClientOptions) -> Value {
        let settings = config.settings();
        if let Some(params) = options.initialize_params {
            return protocol::prepare_initialize_params(params, settings);
        }
        let root_uri = options
            .root
            .or_else(|| self.host_root())
            .and_then(|root| match protocol::path_to_file_uri(&root) {
                Ok(uri) => Some(uri.to_string()),
                Err(e) => {
                    tracing::warn!(server = %config.name(), "{e}");
                    None
                }
            });
        protocol::initialize_params(root_uri.as_deref(), settings)
    }
}
