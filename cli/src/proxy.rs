//! `devbridge proxy`: the editor speaks LSP to us on stdio, we relay to the
//! containerized server through the registry.
//!
//! The registry runs its own `initialize` handshake using the editor's
//! params. The editor's `initialize` is answered with the stored result once
//! the server is ready, and the editor's `initialized` is swallowed since the
//! server has already received one.

use std::process::ExitCode;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite};

use devbridge_config::DevbridgeConfig;
use devbridge_lsp::codec::{FrameReader, FrameWriter};
use devbridge_lsp::message::error_codes;
use devbridge_lsp::{
    ClientEvent, ClientHandle, ClientOptions, ClientState, LanguageRegistry, Message, MessageKind,
    Registry, RequestId, ResponseError,
};

pub(crate) async fn run(
    config: &DevbridgeConfig,
    server: &str,
    container: Option<&str>,
) -> Result<ExitCode> {
    let (registry, catalog) = crate::build_registry(config, container)?;
    let server_config = catalog
        .get(server)
        .with_context(|| format!("unknown server '{server}'"))?;

    let session = Session {
        registry,
        server: server_config.name().to_string(),
        editor_out: FrameWriter::new(tokio::io::stdout()),
        pending_init: None,
        handle: None,
        shutdown_requested: false,
    };
    session
        .serve(FrameReader::new(tokio::io::stdin()), |registry, params| {
            registry.get_or_create_with(
                &server_config,
                ClientOptions {
                    initialize_params: params,
                    root: None,
                },
            )
        })
        .await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit(bool),
}

struct Session<W> {
    registry: Registry,
    server: String,
    editor_out: FrameWriter<W>,
    /// Editor's `initialize` id, answered once the server is ready.
    pending_init: Option<RequestId>,
    handle: Option<ClientHandle>,
    shutdown_requested: bool,
}

impl<W: AsyncWrite + Unpin> Session<W> {
    async fn serve<R, F>(mut self, mut editor_in: FrameReader<R>, mut start: F) -> Result<ExitCode>
    where
        R: AsyncRead + Unpin,
        F: FnMut(&mut Registry, Option<serde_json::Value>) -> Result<ClientHandle, devbridge_lsp::BridgeError>,
    {
        let success = loop {
            let flow = tokio::select! {
                incoming = editor_in.read_message() => match incoming {
                    Ok(Some(message)) => self.from_editor(message, &mut start).await?,
                    Ok(None) => {
                        tracing::info!(server = %self.server, "Editor closed stdin");
                        Flow::Exit(self.shutdown_requested)
                    }
                    Err(e) => {
                        tracing::warn!(server = %self.server, error = %e, "Editor stream failed");
                        Flow::Exit(false)
                    }
                },
                event = self.registry.next_event(), if self.handle.is_some() => match event {
                    Some(event) => self.from_server(event).await?,
                    None => Flow::Exit(false),
                },
            };
            if let Flow::Exit(success) = flow {
                break success;
            }
        };

        self.registry.stop_all().await;
        Ok(if success {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        })
    }

    async fn from_editor<F>(&mut self, message: Message, start: &mut F) -> Result<Flow>
    where
        F: FnMut(&mut Registry, Option<serde_json::Value>) -> Result<ClientHandle, devbridge_lsp::BridgeError>,
    {
        let kind = match message.validate() {
            Ok(kind) => kind,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed editor message");
                return Ok(Flow::Continue);
            }
        };

        match (kind, message.method()) {
            (MessageKind::Request, Some("initialize")) => {
                let id = message.id.clone().unwrap_or(RequestId::Number(0));
                if self.handle.is_some() {
                    self.reply_error(id, error_codes::INVALID_REQUEST, "already initialized")
                        .await?;
                    return Ok(Flow::Continue);
                }
                match start(&mut self.registry, message.params) {
                    Ok(handle) => {
                        self.pending_init = Some(id);
                        self.handle = Some(handle);
                        Ok(Flow::Continue)
                    }
                    Err(e) => {
                        tracing::warn!(server = %self.server, error = %e, "Server failed to start");
                        self.reply_error(id, error_codes::INTERNAL_ERROR, &e.to_string())
                            .await?;
                        Ok(Flow::Exit(false))
                    }
                }
            }
            (MessageKind::Notification, Some("initialized")) => {
                tracing::trace!("Swallowing editor initialized");
                Ok(Flow::Continue)
            }
            (MessageKind::Request, Some("shutdown")) => {
                self.shutdown_requested = true;
                let id = message.id.clone().unwrap_or(RequestId::Number(0));
                self.editor_out
                    .write_message(&Message::response(id, serde_json::Value::Null))
                    .await?;
                Ok(Flow::Continue)
            }
            (MessageKind::Notification, Some("exit")) => {
                tracing::info!(server = %self.server, "Editor sent exit");
                Ok(Flow::Exit(self.shutdown_requested))
            }
            _ => self.forward(message, kind).await,
        }
    }

    async fn forward(&mut self, message: Message, kind: MessageKind) -> Result<Flow> {
        let Some(handle) = &self.handle else {
            if kind == MessageKind::Request
                && let Some(id) = message.id
            {
                self.reply_error(id, error_codes::SERVER_NOT_INITIALIZED, "server not initialized")
                    .await?;
            }
            return Ok(Flow::Continue);
        };

        let id = message.id.clone();
        if let Err(e) = handle.send(message) {
            tracing::warn!(server = %self.server, error = %e, "Failed to forward editor message");
            if kind == MessageKind::Request
                && let Some(id) = id
            {
                self.reply_error(id, error_codes::INTERNAL_ERROR, &e.to_string())
                    .await?;
            }
        }
        Ok(Flow::Continue)
    }

    async fn from_server(&mut self, event: ClientEvent) -> Result<Flow> {
        match event {
            ClientEvent::Message { message, .. } => {
                self.editor_out.write_message(&message).await?;
                Ok(Flow::Continue)
            }
            ClientEvent::StateChanged { state, .. } => match state {
                ClientState::Ready => {
                    if let Some(id) = self.pending_init.take() {
                        let result = self
                            .registry
                            .initialize_result(&self.server)
                            .cloned()
                            .unwrap_or(serde_json::Value::Null);
                        self.editor_out
                            .write_message(&Message::response(id, result))
                            .await?;
                        tracing::info!(server = %self.server, "Editor session initialized");
                    }
                    Ok(Flow::Continue)
                }
                ClientState::Failed(reason) => {
                    tracing::warn!(server = %self.server, reason = %reason, "Server failed");
                    if let Some(id) = self.pending_init.take() {
                        self.reply_error(id, error_codes::INTERNAL_ERROR, &reason)
                            .await?;
                    }
                    Ok(Flow::Exit(false))
                }
                ClientState::Stopped => Ok(Flow::Exit(self.shutdown_requested)),
                other => {
                    tracing::debug!(server = %self.server, state = %other, "Server state");
                    Ok(Flow::Continue)
                }
            },
        }
    }

    async fn reply_error(&mut self, id: RequestId, code: i64, message: &str) -> Result<()> {
        self.editor_out
            .write_message(&Message::error_response(
                Some(id),
                ResponseError::new(code, message),
            ))
            .await
    }
}
