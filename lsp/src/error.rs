use crate::message::ProtocolError;
use crate::types::ServerConfigError;

/// Failures surfaced by the client bridge and the registry.
///
/// Each one concerns a single server; none of them affect other clients.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Rejected before any process was spawned.
    #[error("invalid server config: {0}")]
    ConfigInvalid(#[from] ServerConfigError),
    #[error("failed to start '{server}': {reason}")]
    StartFailed { server: String, reason: String },
    #[error("'{server}' exited: {reason}")]
    RuntimeExit { server: String, reason: String },
    /// The client's outgoing channel is gone (failed or stopped).
    #[error("client '{server}' is closed")]
    Closed { server: String },
    #[error("no active client for '{server}'")]
    NotRunning { server: String },
    /// The caller tried to send a malformed message.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
