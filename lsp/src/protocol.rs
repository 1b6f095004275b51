//! Builders for the messages the bridge originates itself: the handshake and
//! the shutdown sequence.

use std::path::{Path, PathBuf};

use serde_json::{Value, json};

use crate::message::{Message, RequestId};

/// Prefix of every request id the bridge allocates. Caller ids are integers
/// or arbitrary strings; this namespace keeps the two from colliding.
pub const BRIDGE_ID_PREFIX: &str = "devbridge:";

#[derive(Debug, thiserror::Error)]
#[error("cannot convert path to file URI: {}", path.display())]
pub struct PathToUriError {
    path: PathBuf,
}

#[must_use]
pub fn bridge_request_id(seq: u64) -> RequestId {
    RequestId::String(format!("{BRIDGE_ID_PREFIX}{seq}"))
}

#[must_use]
pub fn is_bridge_id(id: &RequestId) -> bool {
    matches!(id, RequestId::String(s) if s.starts_with(BRIDGE_ID_PREFIX))
}

/// Default `initialize` params for a server whose workspace is `root_uri`.
///
/// `processId` is null: the bridge's pid means nothing inside the container.
pub fn initialize_params(root_uri: Option<&str>, settings: Option<&Value>) -> Value {
    let mut params = json!({
        "processId": null,
        "clientInfo": {
            "name": "devbridge",
            "version": env!("CARGO_PKG_VERSION")
        },
        "rootUri": root_uri,
        "capabilities": {
            "workspace": {
                "workspaceFolders": true,
                "configuration": false,
                "applyEdit": true
            },
            "textDocument": {
                "synchronization": {
                    "dynamicRegistration": false,
                    "willSave": false,
                    "willSaveWaitUntil": false,
                    "didSave": true
                },
                "hover": { "contentFormat": ["markdown", "plaintext"] },
                "definition": { "linkSupport": true },
                "publishDiagnostics": {
                    "relatedInformation": true
                }
            }
        },
        "workspaceFolders": root_uri.map(|uri| json!([{
            "uri": uri,
            "name": workspace_name(uri)
        }]))
    });
    if let Some(settings) = settings {
        params["initializationOptions"] = settings.clone();
    }
    params
}

/// Adapt editor-supplied `initialize` params for a bridged server.
///
/// The editor's pid is dropped and the server settings are supplied as
/// `initializationOptions` unless the editor already sent some.
pub fn prepare_initialize_params(mut params: Value, settings: Option<&Value>) -> Value {
    let Value::Object(map) = &mut params else {
        return initialize_params(None, settings);
    };
    map.insert("processId".into(), Value::Null);
    if let Some(settings) = settings {
        map.entry("initializationOptions")
            .or_insert_with(|| settings.clone());
    }
    params
}

pub fn initialize_request(seq: u64, params: Value) -> Message {
    Message::request(bridge_request_id(seq), "initialize", Some(params))
}

pub fn initialized_notification() -> Message {
    Message::notification("initialized", Some(json!({})))
}

pub fn shutdown_request(seq: u64) -> Message {
    Message::request(bridge_request_id(seq), "shutdown", None)
}

pub fn exit_notification() -> Message {
    Message::notification("exit", None)
}

fn workspace_name(uri: &str) -> &str {
    uri.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("workspace")
}

pub fn path_to_file_uri(path: &Path) -> Result<url::Url, PathToUriError> {
    url::Url::from_file_path(path).map_err(|()| PathToUriError {
        path: path.to_path_buf(),
    })
}
