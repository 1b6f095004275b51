//! One bridged client: a server process running in the container, the tasks
//! pumping its stdio, and the lifecycle state machine.
//!
//! ```text
//! starting -> initializing -> ready -> stopping -> stopped
//!     \______________\____________> failed
//! ```
//!
//! Four tasks run per client:
//! - the writer owns the server's stdin. It rewrites caller traffic into
//!   container paths and holds caller requests back until the handshake is
//!   done;
//! - the reader owns stdout. It routes replies to bridge-internal requests
//!   and forwards everything else, rewritten into host paths, as events;
//! - the supervisor owns the process and reports its exit, or terminates it
//!   on request;
//! - the handshake performs `initialize`/`initialized`.
//!
//! All state lives in [`ClientBridge`], which only the registry mutates, by
//! applying [`BridgeEvent`]s in arrival order.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::codec::{FrameReader, FrameWriter};
use crate::error::BridgeError;
use crate::message::{Message, MessageKind, ProtocolError, RequestId};
use crate::protocol;
use crate::rewrite::PayloadRewriter;
use crate::runner::{ByteReader, ByteWriter, CommandRunner, ProcessControl, ServerProcess};
use crate::translate::{Direction, PathTranslator};
use crate::types::{
    BridgeTimeouts, BufferId, BufferRef, ClientEvent, ClientState, HealthReport, ServerConfig,
};

/// Server stderr lines kept for health reports.
const STDERR_TAIL_LINES: usize = 20;

/// How long to wait for the process after a kill.
const KILL_WAIT: Duration = Duration::from_secs(1);

pub(crate) enum WriterCommand {
    /// Bridge-originated and already in container paths. Never held back.
    Control(Message),
    /// Caller traffic in host paths.
    Client(Message),
    /// Handshake finished: flush held-back caller traffic.
    Open,
    /// Stop writing. Held-back traffic is discarded.
    Shutdown,
}

type PendingMap = Arc<tokio::sync::Mutex<HashMap<RequestId, oneshot::Sender<Message>>>>;

#[derive(Debug)]
pub(crate) struct BridgeEvent {
    pub server: String,
    pub generation: u64,
    pub kind: BridgeEventKind,
}

#[derive(Debug)]
pub(crate) enum BridgeEventKind {
    Initializing,
    Initialized(Value),
    InitFailed(String),
    /// Already rewritten into host paths.
    Message(Message),
    /// The server's stdin is gone; nothing more can be delivered.
    WriteFailed(String),
    Exited(Option<i32>),
}

/// Tags events from one client generation.
#[derive(Clone)]
struct Emitter {
    server: String,
    generation: u64,
    tx: mpsc::Sender<BridgeEvent>,
}

impl Emitter {
    /// `false` once the registry is gone.
    async fn emit(&self, kind: BridgeEventKind) -> bool {
        self.tx
            .send(BridgeEvent {
                server: self.server.clone(),
                generation: self.generation,
                kind,
            })
            .await
            .is_ok()
    }
}

#[derive(Debug, Clone, Default)]
struct StderrTail(Arc<Mutex<VecDeque<String>>>);

impl StderrTail {
    fn push(&self, line: String) {
        let mut lines = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if lines.len() == STDERR_TAIL_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    fn lines(&self) -> Vec<String> {
        let lines = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        lines.iter().cloned().collect()
    }
}

/// Caller-facing handle to a bridged client.
///
/// Cheap to clone. Sends never block: until the client is ready, requests
/// and notifications are held back and then delivered in order; if the
/// client fails or stops first they are discarded and later sends return
/// [`BridgeError::Closed`]. Replies to server-initiated requests are never
/// held back.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    server: Arc<str>,
    generation: u64,
    outgoing: mpsc::UnboundedSender<WriterCommand>,
}

impl std::fmt::Debug for WriterCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Control(m) => f.debug_tuple("Control").field(&m.method()).finish(),
            Self::Client(m) => f.debug_tuple("Client").field(&m.method()).finish(),
            Self::Open => f.write_str("Open"),
            Self::Shutdown => f.write_str("Shutdown"),
        }
    }
}

impl ClientHandle {
    fn closed(server: &str, generation: u64) -> Self {
        let (outgoing, _) = mpsc::unbounded_channel();
        Self {
            server: Arc::from(server),
            generation,
            outgoing,
        }
    }

    #[must_use]
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Distinguishes successive clients started under the same name.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.outgoing.is_closed()
    }

    /// Send a message in host paths.
    pub fn send(&self, message: Message) -> Result<(), BridgeError> {
        message.validate()?;
        if let Some(id) = &message.id
            && message.method.is_some()
            && protocol::is_bridge_id(id)
        {
            return Err(ProtocolError::InvalidShape("request id uses the bridge's reserved prefix").into());
        }
        self.outgoing
            .send(WriterCommand::Client(message))
            .map_err(|_| BridgeError::Closed {
                server: self.server.to_string(),
            })
    }

    pub fn request(
        &self,
        id: impl Into<RequestId>,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> Result<(), BridgeError> {
        self.send(Message::request(id, method, params))
    }

    pub fn notify(&self, method: impl Into<String>, params: Option<Value>) -> Result<(), BridgeError> {
        self.send(Message::notification(method, params))
    }

    /// Answer a request the server sent.
    pub fn respond(&self, id: impl Into<RequestId>, result: Value) -> Result<(), BridgeError> {
        self.send(Message::response(id, result))
    }

    fn control(&self, message: Message) -> bool {
        self.outgoing.send(WriterCommand::Control(message)).is_ok()
    }
}

/// Everything needed to launch one client generation.
pub(crate) struct Launch<'a> {
    pub config: ServerConfig,
    pub generation: u64,
    pub container: &'a str,
    pub translator: Arc<PathTranslator>,
    /// Host-side `initialize` params.
    pub initialize_params: Value,
    pub timeouts: BridgeTimeouts,
    pub events: mpsc::Sender<BridgeEvent>,
}

/// Tasks of a running client. Dropping it aborts them all; aborting the
/// supervisor drops the process control, which kills the process.
struct Link {
    pending: PendingMap,
    stop_tx: Option<oneshot::Sender<Duration>>,
    supervisor: JoinHandle<()>,
    tasks: Vec<JoinHandle<()>>,
    next_seq: u64,
}

impl Link {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.supervisor.abort();
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// The record for one server name.
pub(crate) struct ClientBridge {
    config: ServerConfig,
    generation: u64,
    state: ClientState,
    translator: Arc<PathTranslator>,
    buffers: BTreeMap<BufferId, BufferRef>,
    handle: ClientHandle,
    link: Option<Link>,
    stderr: StderrTail,
    last_error: Option<String>,
    init_result: Option<Value>,
}

impl ClientBridge {
    /// Spawn the server and start its tasks.
    ///
    /// Always returns a record; a spawn failure yields one in the `Failed`
    /// state so health checks can report it.
    pub(crate) fn launch(runner: &dyn CommandRunner, launch: Launch<'_>) -> Self {
        let Launch {
            config,
            generation,
            container,
            translator,
            initialize_params,
            timeouts,
            events,
        } = launch;
        let server = config.name().to_string();

        let process = match runner.spawn(container, &config.argv(), config.env()) {
            Ok(process) => process,
            Err(e) => {
                let reason = e.to_string();
                tracing::warn!(server = %server, container = %container, error = %reason, "Failed to spawn server");
                let mut record = Self::detached(config, generation, translator);
                record.last_error = Some(
                    BridgeError::StartFailed {
                        server,
                        reason: reason.clone(),
                    }
                    .to_string(),
                );
                record.state = ClientState::Failed(reason);
                return record;
            }
        };
        tracing::info!(server = %server, container = %container, generation, "Server process started");

        let ServerProcess {
            stdin,
            stdout,
            stderr,
            control,
        } = process;
        let rewriter = PayloadRewriter::new(Arc::clone(&translator));
        let emitter = Emitter {
            server: server.clone(),
            generation,
            tx: events,
        };
        let stderr_tail = StderrTail::default();
        let pending = PendingMap::default();
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();

        let mut tasks = vec![
            tokio::spawn(run_writer(
                FrameWriter::new(stdin),
                outgoing_rx,
                rewriter.clone(),
                emitter.clone(),
            )),
            tokio::spawn(run_reader(
                stdout,
                Arc::clone(&pending),
                rewriter.clone(),
                emitter.clone(),
            )),
        ];
        if let Some(stderr) = stderr {
            tasks.push(tokio::spawn(drain_stderr(
                stderr,
                stderr_tail.clone(),
                server.clone(),
            )));
        }
        let supervisor = tokio::spawn(supervise(control, stop_rx, emitter.clone()));

        let mut link = Link {
            pending: Arc::clone(&pending),
            stop_tx: Some(stop_tx),
            supervisor,
            tasks,
            next_seq: 0,
        };
        let handshake = Handshake {
            outgoing: outgoing.clone(),
            pending,
            params: initialize_params,
            seq: link.next_seq(),
            timeout: timeouts.init_timeout(),
            emitter,
            rewriter,
        };
        link.tasks.push(tokio::spawn(handshake.run()));

        Self {
            handle: ClientHandle {
                server: Arc::from(server.as_str()),
                generation,
                outgoing,
            },
            config,
            generation,
            state: ClientState::Starting,
            translator,
            buffers: BTreeMap::new(),
            link: Some(link),
            stderr: stderr_tail,
            last_error: None,
            init_result: None,
        }
    }

    fn detached(config: ServerConfig, generation: u64, translator: Arc<PathTranslator>) -> Self {
        Self {
            handle: ClientHandle::closed(config.name(), generation),
            config,
            generation,
            state: ClientState::Starting,
            translator,
            buffers: BTreeMap::new(),
            link: None,
            stderr: StderrTail::default(),
            last_error: None,
            init_result: None,
        }
    }

    pub(crate) fn name(&self) -> &str {
        self.config.name()
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn state(&self) -> &ClientState {
        &self.state
    }

    pub(crate) fn handle(&self) -> &ClientHandle {
        &self.handle
    }

    pub(crate) fn translator(&self) -> &PathTranslator {
        &self.translator
    }

    pub(crate) fn init_result(&self) -> Option<&Value> {
        self.init_result.as_ref()
    }

    /// `true` if the buffer was not attached yet.
    pub(crate) fn attach(&mut self, buffer: BufferRef) -> bool {
        self.buffers.insert(buffer.id, buffer).is_none()
    }

    pub(crate) fn detach(&mut self, id: BufferId) -> bool {
        self.buffers.remove(&id).is_some()
    }

    pub(crate) fn buffers(&self) -> Vec<BufferRef> {
        self.buffers.values().cloned().collect()
    }

    /// Apply one event from this client's tasks.
    pub(crate) fn apply(&mut self, kind: BridgeEventKind) -> Option<ClientEvent> {
        match kind {
            BridgeEventKind::Message(message) => {
                tracing::debug!(server = %self.name(), method = ?message.method(), id = ?message.id, "Server message");
                Some(ClientEvent::Message {
                    server: self.name().to_string(),
                    message,
                })
            }
            BridgeEventKind::Initializing => {
                (self.state == ClientState::Starting).then(|| self.transition(ClientState::Initializing))
            }
            BridgeEventKind::Initialized(result) => {
                if self.state != ClientState::Initializing {
                    return None;
                }
                tracing::info!(server = %self.name(), "Server ready");
                self.init_result = Some(result);
                Some(self.transition(ClientState::Ready))
            }
            BridgeEventKind::InitFailed(reason) => {
                if !self.state.is_live() {
                    return None;
                }
                let error = BridgeError::StartFailed {
                    server: self.name().to_string(),
                    reason: reason.clone(),
                };
                Some(self.fail(reason, &error))
            }
            BridgeEventKind::WriteFailed(reason) => {
                if !self.state.is_live() {
                    return None;
                }
                let reason = format!("write to server failed: {reason}");
                let error = BridgeError::RuntimeExit {
                    server: self.name().to_string(),
                    reason: reason.clone(),
                };
                Some(self.fail(reason, &error))
            }
            BridgeEventKind::Exited(code) => {
                if !self.state.is_live() {
                    return None;
                }
                let reason = match code {
                    Some(code) => format!("process exited with code {code}"),
                    None => String::from("process terminated by signal"),
                };
                let error = BridgeError::RuntimeExit {
                    server: self.name().to_string(),
                    reason: reason.clone(),
                };
                Some(self.fail(reason, &error))
            }
        }
    }

    fn transition(&mut self, state: ClientState) -> ClientEvent {
        tracing::debug!(server = %self.name(), from = ?self.state, to = ?state, "Client state changed");
        self.state = state.clone();
        ClientEvent::StateChanged {
            server: self.name().to_string(),
            state,
        }
    }

    /// Move to `Failed`: detach buffers, drop queued traffic, kill the
    /// process. Not respawned.
    fn fail(&mut self, reason: String, error: &BridgeError) -> ClientEvent {
        tracing::warn!(server = %self.name(), error = %error, "Client failed");
        self.last_error = Some(error.to_string());
        self.buffers.clear();
        self.link = None;
        self.transition(ClientState::Failed(reason))
    }

    pub(crate) fn health(&self) -> HealthReport {
        let mut issues = Vec::new();
        if let Some(error) = &self.last_error {
            issues.push(error.clone());
            issues.extend(
                self.stderr
                    .lines()
                    .into_iter()
                    .map(|line| format!("stderr: {line}")),
            );
        }
        if self.translator.intercepts() && !self.translator.is_configured() {
            issues.push(String::from("workspace mapping is not configured"));
        }
        HealthReport {
            server: self.name().to_string(),
            reachable: self.state.is_live() && !self.handle.is_closed(),
            state: Some(self.state.clone()),
            strategy: Some(self.translator.strategy()),
            issues,
        }
    }

    /// Stop the client. Never takes longer than `stop_timeout`.
    ///
    /// A ready server gets `shutdown` and `exit`; then the process has a
    /// grace period to exit before it is killed.
    pub(crate) async fn shutdown(mut self, stop_timeout: Duration) {
        let Some(mut link) = self.link.take() else {
            return;
        };
        let was_ready = self.state == ClientState::Ready;
        self.state = ClientState::Stopping;
        self.buffers.clear();
        let server = self.name().to_string();
        let handle = self.handle.clone();
        let step = stop_timeout / 2;

        let graceful = async {
            if was_ready {
                let seq = link.next_seq();
                let (tx, rx) = oneshot::channel();
                link.pending
                    .lock()
                    .await
                    .insert(protocol::bridge_request_id(seq), tx);
                if handle.control(protocol::shutdown_request(seq)) {
                    match tokio::time::timeout(step, rx).await {
                        Ok(Ok(_)) => {
                            handle.control(protocol::exit_notification());
                        }
                        _ => tracing::debug!(server = %server, "No shutdown reply"),
                    }
                }
            }
            let _ = handle.outgoing.send(WriterCommand::Shutdown);
            if let Some(stop) = link.stop_tx.take() {
                let _ = stop.send(step);
            }
            let _ = (&mut link.supervisor).await;
        };

        if tokio::time::timeout(stop_timeout, graceful).await.is_err() {
            tracing::warn!(server = %server, "Server did not stop in time, abandoning it");
        }
        drop(link);
        tracing::info!(server = %server, "Server stopped");
    }
}

/// `false` once the pipe is broken; the failure has been reported.
async fn write_or_report(
    writer: &mut FrameWriter<ByteWriter>,
    message: &Message,
    emitter: &Emitter,
) -> bool {
    match writer.write_message(message).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(server = %emitter.server, "LSP write error: {e:#}");
            emitter.emit(BridgeEventKind::WriteFailed(format!("{e:#}"))).await;
            false
        }
    }
}

fn is_reply(message: &Message) -> bool {
    matches!(
        message.classify(),
        MessageKind::Response | MessageKind::Error
    )
}

async fn run_writer(
    mut writer: FrameWriter<ByteWriter>,
    mut rx: mpsc::UnboundedReceiver<WriterCommand>,
    rewriter: PayloadRewriter,
    emitter: Emitter,
) {
    let server = emitter.server.clone();
    let mut held = VecDeque::new();
    let mut open = false;
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WriterCommand::Control(message) => {
                if !write_or_report(&mut writer, &message, &emitter).await {
                    break;
                }
            }
            WriterCommand::Client(message) => {
                let message = rewriter.rewrite_owned(message, Direction::ToContainer);
                if open || is_reply(&message) {
                    if !write_or_report(&mut writer, &message, &emitter).await {
                        break;
                    }
                } else {
                    held.push_back(message);
                }
            }
            WriterCommand::Open => {
                open = true;
                if !held.is_empty() {
                    tracing::debug!(server = %server, count = held.len(), "Flushing held-back messages");
                }
                while let Some(message) = held.pop_front() {
                    if !write_or_report(&mut writer, &message, &emitter).await {
                        return;
                    }
                }
            }
            WriterCommand::Shutdown => {
                if !held.is_empty() {
                    tracing::debug!(server = %server, count = held.len(), "Discarding held-back messages");
                }
                break;
            }
        }
    }
}

async fn run_reader(
    stdout: ByteReader,
    pending: PendingMap,
    rewriter: PayloadRewriter,
    emitter: Emitter,
) {
    let mut reader = FrameReader::new(stdout);
    loop {
        match reader.read_message().await {
            Ok(Some(message)) => {
                if message.method.is_none()
                    && let Some(id) = message.id.as_ref().filter(|id| protocol::is_bridge_id(id))
                {
                    let waiter = pending.lock().await.remove(id);
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(rewriter.rewrite_owned(message, Direction::ToHost));
                        }
                        None => tracing::trace!(server = %emitter.server, "Reply to unknown bridge request"),
                    }
                    continue;
                }
                let message = rewriter.rewrite_owned(message, Direction::ToHost);
                if !emitter.emit(BridgeEventKind::Message(message)).await {
                    break;
                }
            }
            Ok(None) => {
                tracing::info!(server = %emitter.server, "Server closed stdout");
                break;
            }
            Err(e) => {
                tracing::warn!(server = %emitter.server, "LSP reader error: {e:#}");
                break;
            }
        }
    }
    // Nobody will answer now; wake up whoever is waiting.
    pending.lock().await.clear();
}

async fn drain_stderr(stderr: ByteReader, tail: StderrTail, server: String) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                tracing::debug!(server = %server, "stderr: {line}");
                tail.push(line);
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(server = %server, "stderr read error: {e}");
                break;
            }
        }
    }
}

/// Report the process exit, or on a stop request wait out the grace period
/// and kill. A dropped stop sender means kill now.
async fn supervise(
    mut control: Box<dyn ProcessControl>,
    mut stop_rx: oneshot::Receiver<Duration>,
    emitter: Emitter,
) {
    let grace = tokio::select! {
        status = control.wait() => {
            let code = match status {
                Ok(code) => code,
                Err(e) => {
                    tracing::warn!(server = %emitter.server, "Waiting for server process failed: {e}");
                    None
                }
            };
            tracing::info!(server = %emitter.server, ?code, "Server process exited");
            emitter.emit(BridgeEventKind::Exited(code)).await;
            return;
        }
        grace = &mut stop_rx => grace.unwrap_or(Duration::ZERO),
    };

    if tokio::time::timeout(grace, control.wait()).await.is_err() {
        tracing::debug!(server = %emitter.server, "Server didn't exit in time, killing");
        if let Err(e) = control.kill().await {
            tracing::warn!(server = %emitter.server, "Killing server process failed: {e}");
        }
        let _ = tokio::time::timeout(KILL_WAIT, control.wait()).await;
    }
}

struct Handshake {
    outgoing: mpsc::UnboundedSender<WriterCommand>,
    pending: PendingMap,
    params: Value,
    seq: u64,
    timeout: Duration,
    emitter: Emitter,
    rewriter: PayloadRewriter,
}

impl Handshake {
    async fn run(self) {
        if !self.emitter.emit(BridgeEventKind::Initializing).await {
            return;
        }
        let kind = match self.initialize().await {
            Ok(result) => {
                let _ = self
                    .outgoing
                    .send(WriterCommand::Control(protocol::initialized_notification()));
                let _ = self.outgoing.send(WriterCommand::Open);
                BridgeEventKind::Initialized(result)
            }
            Err(reason) => BridgeEventKind::InitFailed(reason),
        };
        self.emitter.emit(kind).await;
    }

    async fn initialize(&self) -> Result<Value, String> {
        let id = protocol::bridge_request_id(self.seq);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        let request = self.rewriter.rewrite_owned(
            protocol::initialize_request(self.seq, self.params.clone()),
            Direction::ToContainer,
        );
        if self.outgoing.send(WriterCommand::Control(request)).is_err() {
            self.pending.lock().await.remove(&id);
            return Err(String::from("writer closed"));
        }

        let reply = match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(String::from("server closed before answering initialize")),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                return Err(format!(
                    "initialize timed out after {}s",
                    self.timeout.as_secs()
                ));
            }
        };

        match (reply.result, reply.error) {
            (_, Some(error)) => Err(format!(
                "initialize rejected: {} ({})",
                error.message, error.code
            )),
            (Some(result), None) => Ok(result),
            (None, None) => Err(String::from("empty initialize reply")),
        }
    }
}
