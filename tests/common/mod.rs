//! Shared test utilities and fixtures
//!
//! [`FakeRunner`] stands in for the container runtime: `spawn` starts an
//! in-process language server wired up over `tokio::io::duplex` pipes, and
//! `run` answers availability probes from a fixed list of installed commands.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use devbridge_lsp::codec::{FrameReader, FrameWriter};
use devbridge_lsp::{
    BridgeTimeouts, ClientEvent, ClientState, CommandOutput, CommandRunner, Message, MessageKind,
    ProcessControl, Registry, RegistryOptions, RunnerError, ServerCatalog, ServerConfig,
    ServerProcess, TranslationMode, WorkspaceMapping,
};

pub const HOST_ROOT: &str = "/home/dev/project";
pub const CONTAINER_ROOT: &str = "/workspace";

/// How the fake server behaves once spawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Well-behaved server.
    Healthy,
    /// `spawn` itself fails.
    FailSpawn,
    /// Never answers `initialize`.
    HangOnInitialize,
    /// Exits with code 2 right after `initialized`.
    CrashAfterInitialized,
    /// Writes to stderr and exits with the given code before reading anything.
    ExitImmediately(i32),
    /// Handshakes normally, then never answers `shutdown` and never exits on
    /// its own, not even on EOF. Only a kill ends it.
    IgnoreShutdown,
}

/// Shared record of everything the fake servers received, in order.
#[derive(Debug, Clone, Default)]
pub struct Inbox(Arc<Mutex<Vec<Message>>>);

impl Inbox {
    fn push(&self, message: Message) {
        self.0
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(message);
    }

    pub fn messages(&self) -> Vec<Message> {
        self.0
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn methods(&self) -> Vec<String> {
        self.messages()
            .iter()
            .filter_map(|m| m.method().map(str::to_string))
            .collect()
    }

    pub fn find(&self, method: &str) -> Option<Message> {
        self.messages()
            .into_iter()
            .find(|m| m.method() == Some(method))
    }
}

pub struct FakeRunner {
    behavior: Mutex<Behavior>,
    installed: Vec<String>,
    spawns: AtomicUsize,
    argv: Mutex<Vec<Vec<String>>>,
    next_pid: AtomicU32,
    live: Arc<AtomicUsize>,
    pub inbox: Inbox,
}

/// Counts a fake server as running until its task finishes or is aborted.
struct Running(Arc<AtomicUsize>);

impl Running {
    fn new(live: &Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(live))
    }
}

impl Drop for Running {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeRunner {
    pub fn new(behavior: Behavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            installed: Vec::new(),
            spawns: AtomicUsize::new(0),
            argv: Mutex::new(Vec::new()),
            next_pid: AtomicU32::new(100),
            live: Arc::new(AtomicUsize::new(0)),
            inbox: Inbox::default(),
        }
    }

    pub fn with_installed<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.installed = commands.into_iter().map(Into::into).collect();
        self
    }

    /// Behavior for subsequent spawns.
    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    pub fn spawned_argv(&self) -> Vec<Vec<String>> {
        self.argv.lock().unwrap().clone()
    }

    /// Fake servers whose task is still alive.
    pub fn live_servers(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, _container: &str, argv: &[String]) -> Result<CommandOutput, RunnerError> {
        let command = argv.last().cloned().unwrap_or_default();
        let found = self.installed.contains(&command);
        Ok(CommandOutput {
            exit_code: Some(if found { 0 } else { 1 }),
            stdout: if found {
                format!("/usr/bin/{command}\n")
            } else {
                String::new()
            },
            stderr: String::new(),
        })
    }

    fn spawn(
        &self,
        container: &str,
        argv: &[String],
        _env: &BTreeMap<String, String>,
    ) -> Result<ServerProcess, RunnerError> {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        self.argv.lock().unwrap().push(argv.to_vec());

        let behavior = *self.behavior.lock().unwrap();
        if behavior == Behavior::FailSpawn {
            return Err(RunnerError::Unavailable(format!(
                "container {container} is not running"
            )));
        }

        let (client_stdin, server_stdin) = tokio::io::duplex(64 * 1024);
        let (server_stdout, client_stdout) = tokio::io::duplex(64 * 1024);
        let (server_stderr, client_stderr) = tokio::io::duplex(4 * 1024);
        let (exit_tx, exit_rx) = watch::channel(None);

        let task = tokio::spawn(fake_server(
            server_stdin,
            server_stdout,
            server_stderr,
            behavior,
            self.inbox.clone(),
            exit_tx,
            Running::new(&self.live),
        ));

        Ok(ServerProcess {
            stdin: Box::new(client_stdin),
            stdout: Box::new(client_stdout),
            stderr: Some(Box::new(client_stderr)),
            control: Box::new(FakeControl {
                pid: self.next_pid.fetch_add(1, Ordering::SeqCst),
                exit: exit_rx,
                task,
            }),
        })
    }
}

/// Process control over the fake server task. Killing aborts the task.
struct FakeControl {
    pid: u32,
    exit: watch::Receiver<Option<Option<i32>>>,
    task: JoinHandle<()>,
}

#[async_trait]
impl ProcessControl for FakeControl {
    async fn wait(&mut self) -> std::io::Result<Option<i32>> {
        loop {
            let current = *self.exit.borrow_and_update();
            if let Some(code) = current {
                return Ok(code);
            }
            if self.exit.changed().await.is_err() {
                // Task aborted without reporting: killed.
                return Ok(None);
            }
        }
    }

    async fn kill(&mut self) -> std::io::Result<()> {
        self.task.abort();
        Ok(())
    }

    fn id(&self) -> Option<u32> {
        Some(self.pid)
    }
}

impl Drop for FakeControl {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn fake_server(
    stdin: DuplexStream,
    stdout: DuplexStream,
    mut stderr: DuplexStream,
    behavior: Behavior,
    inbox: Inbox,
    exit: watch::Sender<Option<Option<i32>>>,
    _running: Running,
) {
    if let Behavior::ExitImmediately(code) = behavior {
        let _ = stderr.write_all(b"fatal: no go.mod found\n").await;
        let _ = stderr.write_all(b"exiting\n").await;
        drop(stderr);
        let _ = exit.send(Some(Some(code)));
        return;
    }

    let mut reader = FrameReader::new(stdin);
    let mut writer = FrameWriter::new(stdout);
    let _ = stderr.write_all(b"fake server starting\n").await;

    let code = loop {
        let message = match reader.read_message().await {
            Ok(Some(message)) => message,
            Ok(None) | Err(_) => {
                if behavior == Behavior::IgnoreShutdown {
                    std::future::pending::<()>().await;
                }
                break 0;
            }
        };
        inbox.push(message.clone());

        let kind = message.classify();
        let reply = match message.method() {
            Some("initialize") => {
                if behavior == Behavior::HangOnInitialize {
                    continue;
                }
                let root_uri = message
                    .params
                    .as_ref()
                    .and_then(|p| p.get("rootUri"))
                    .cloned()
                    .unwrap_or(Value::Null);
                Some(json!({
                    "capabilities": {
                        "definitionProvider": true,
                        "hoverProvider": true,
                        "textDocumentSync": 1
                    },
                    "serverInfo": { "name": "fake-ls", "version": "0.1" },
                    "workspace": { "rootUri": root_uri }
                }))
            }
            Some("initialized") => {
                if behavior == Behavior::CrashAfterInitialized {
                    let _ = stderr.write_all(b"panic: index out of range\n").await;
                    break 2;
                }
                None
            }
            Some("textDocument/definition") => {
                let uri = text_document_uri(&message);
                Some(json!([{
                    "uri": uri,
                    "range": {
                        "start": { "line": 3, "character": 5 },
                        "end": { "line": 3, "character": 9 }
                    }
                }]))
            }
            Some("textDocument/didOpen") => {
                let uri = text_document_uri(&message);
                let diagnostics = Message::notification(
                    "textDocument/publishDiagnostics",
                    Some(json!({
                        "uri": uri,
                        "diagnostics": [{
                            "range": {
                                "start": { "line": 0, "character": 0 },
                                "end": { "line": 0, "character": 1 }
                            },
                            "message": format!("unused import in {uri}"),
                            "severity": 2
                        }]
                    })),
                );
                if writer.write_message(&diagnostics).await.is_err() {
                    break 1;
                }
                None
            }
            Some("shutdown" | "exit") if behavior == Behavior::IgnoreShutdown => continue,
            Some("shutdown") => Some(Value::Null),
            Some("exit") => break 0,
            _ => (kind == MessageKind::Request).then_some(Value::Null),
        };

        if let (Some(result), Some(id)) = (reply, message.id.clone())
            && writer.write_message(&Message::response(id, result)).await.is_err()
        {
            break 1;
        }
    };

    drop(writer);
    drop(stderr);
    let _ = exit.send(Some(Some(code)));
}

fn text_document_uri(message: &Message) -> String {
    message
        .params
        .as_ref()
        .and_then(|p| p.pointer("/textDocument/uri"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

pub fn rewrite_mode() -> TranslationMode {
    TranslationMode::Rewrite(WorkspaceMapping::new(HOST_ROOT, CONTAINER_ROOT).unwrap())
}

pub fn gopls() -> ServerConfig {
    ServerConfig::new("gopls", "gopls", ["go", "gomod"]).unwrap()
}

pub fn host_uri(relative: &str) -> String {
    format!("file://{HOST_ROOT}/{relative}")
}

pub fn container_uri(relative: &str) -> String {
    format!("file://{CONTAINER_ROOT}/{relative}")
}

/// Registry over `runner` with the built-in catalog, rewriting between
/// [`HOST_ROOT`] and [`CONTAINER_ROOT`].
pub fn registry(runner: Arc<FakeRunner>) -> Registry {
    registry_with(runner, rewrite_mode(), BridgeTimeouts::default())
}

pub fn registry_with(
    runner: Arc<FakeRunner>,
    mode: TranslationMode,
    timeouts: BridgeTimeouts,
) -> Registry {
    Registry::new(
        runner,
        Arc::new(ServerCatalog::builtin()),
        RegistryOptions::new("devbox", mode)
            .with_workspace_root(HOST_ROOT)
            .with_timeouts(timeouts),
    )
}

const EVENT_WAIT: Duration = Duration::from_secs(10);

/// Collect events until one matches `done`, returning everything seen
/// (the matching event last). Panics after [`EVENT_WAIT`].
pub async fn events_until(
    registry: &mut Registry,
    mut done: impl FnMut(&ClientEvent) -> bool,
) -> Vec<ClientEvent> {
    let mut seen = Vec::new();
    let result = tokio::time::timeout(EVENT_WAIT, async {
        while let Some(event) = registry.next_event().await {
            let finished = done(&event);
            seen.push(event);
            if finished {
                return true;
            }
        }
        false
    })
    .await;
    assert!(
        matches!(result, Ok(true)),
        "expected event never arrived; saw {seen:?}"
    );
    seen
}

pub async fn wait_for_state(
    registry: &mut Registry,
    server: &str,
    wanted: impl Fn(&ClientState) -> bool,
) -> Vec<ClientEvent> {
    events_until(registry, |event| {
        matches!(event, ClientEvent::StateChanged { server: s, state } if s == server && wanted(state))
    })
    .await
}

pub async fn wait_ready(registry: &mut Registry, server: &str) -> Vec<ClientEvent> {
    wait_for_state(registry, server, |state| *state == ClientState::Ready).await
}

/// Poll `condition` until it holds. Panics after [`EVENT_WAIT`].
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let result = tokio::time::timeout(EVENT_WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "condition never held");
}

/// States reported for `server`, in order.
pub fn states(events: &[ClientEvent], server: &str) -> Vec<ClientState> {
    events
        .iter()
        .filter_map(|event| match event {
            ClientEvent::StateChanged { server: s, state } if s == server => Some(state.clone()),
            _ => None,
        })
        .collect()
}
