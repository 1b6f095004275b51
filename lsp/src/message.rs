//! JSON-RPC message model.
//!
//! A [`Message`] is one JSON-RPC 2.0 object. The `jsonrpc` member is not
//! stored: it is checked on the way in ([`Message::from_value`]) and stamped
//! on the way out ([`Message::to_value`]).

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const JSONRPC_VERSION: &str = "2.0";

/// Standard JSON-RPC error codes used by the bridge when it answers on the
/// server's behalf.
pub mod error_codes {
    pub const INVALID_REQUEST: i64 = -32600;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const SERVER_NOT_INITIALIZED: i64 = -32002;
}

/// Rejection of a decoded body that is not a well-formed JSON-RPC message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("body is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("expected jsonrpc \"2.0\", found {0}")]
    InvalidVersion(String),
    #[error("malformed message: {0}")]
    InvalidShape(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl From<i32> for RequestId {
    fn from(value: i32) -> Self {
        Self::Number(i64::from(value))
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s:?}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ResponseError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Request,
    Notification,
    Response,
    Error,
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Message {
    pub id: Option<RequestId>,
    pub method: Option<String>,
    pub params: Option<Value>,
    /// `Some(Value::Null)` is a legitimate result (e.g. the `shutdown` reply).
    pub result: Option<Value>,
    pub error: Option<ResponseError>,
}

impl Message {
    pub fn request(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id: Some(id.into()),
            method: Some(method.into()),
            params,
            ..Self::default()
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: Some(method.into()),
            params,
            ..Self::default()
        }
    }

    pub fn response(id: impl Into<RequestId>, result: Value) -> Self {
        Self {
            id: Some(id.into()),
            result: Some(result),
            ..Self::default()
        }
    }

    /// An error reply. `id` is `None` only for failures to parse the request.
    pub fn error_response(id: Option<RequestId>, error: ResponseError) -> Self {
        Self {
            id,
            error: Some(error),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    #[must_use]
    pub fn classify(&self) -> MessageKind {
        self.validate().unwrap_or(MessageKind::Invalid)
    }

    /// Check the shape invariants and return the message kind.
    ///
    /// Exactly one of `method`, `result` and `error` must be present, and the
    /// `id` must agree with the kind: requests and responses carry one,
    /// notifications don't, errors may omit it.
    pub fn validate(&self) -> Result<MessageKind, ProtocolError> {
        let has_id = self.id.is_some();
        let has_method = self.method.is_some();
        let has_result = self.result.is_some();
        let has_error = self.error.is_some();

        if self.params.is_some() && !has_method {
            return Err(ProtocolError::InvalidShape("params without method"));
        }

        match (has_method, has_result, has_error) {
            (true, false, false) if has_id => Ok(MessageKind::Request),
            (true, false, false) => Ok(MessageKind::Notification),
            (false, true, false) if has_id => Ok(MessageKind::Response),
            (false, true, false) => Err(ProtocolError::InvalidShape("result without id")),
            (false, false, true) => Ok(MessageKind::Error),
            (false, false, false) => Err(ProtocolError::InvalidShape(
                "none of method, result or error present",
            )),
            (true, _, _) => Err(ProtocolError::InvalidShape(
                "method present together with result or error",
            )),
            (false, true, true) => Err(ProtocolError::InvalidShape(
                "result and error both present",
            )),
        }
    }

    /// Decode a JSON value, requiring `jsonrpc: "2.0"` and a valid shape.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let Value::Object(mut map) = value else {
            return Err(ProtocolError::InvalidShape("body is not a JSON object"));
        };

        match map.remove("jsonrpc") {
            Some(Value::String(v)) if v == JSONRPC_VERSION => {}
            Some(other) => return Err(ProtocolError::InvalidVersion(other.to_string())),
            None => return Err(ProtocolError::InvalidVersion(String::from("nothing"))),
        }

        let id = match map.remove("id") {
            None | Some(Value::Null) => None,
            Some(Value::Number(n)) => Some(RequestId::Number(
                n.as_i64()
                    .ok_or(ProtocolError::InvalidShape("id must be an integer or string"))?,
            )),
            Some(Value::String(s)) => Some(RequestId::String(s)),
            Some(_) => return Err(ProtocolError::InvalidShape("id must be an integer or string")),
        };

        let method = match map.remove("method") {
            None => None,
            Some(Value::String(s)) => Some(s),
            Some(_) => return Err(ProtocolError::InvalidShape("method must be a string")),
        };

        let params = match map.remove("params") {
            None | Some(Value::Null) => None,
            Some(v) => Some(v),
        };

        let result = map.remove("result");

        let error = match map.remove("error") {
            None => None,
            Some(v) => Some(
                serde_json::from_value::<ResponseError>(v)
                    .map_err(|_| ProtocolError::InvalidShape("malformed error object"))?,
            ),
        };

        let message = Self {
            id,
            method,
            params,
            result,
            error,
        };
        message.validate()?;
        Ok(message)
    }

    /// Encode as a JSON object with `jsonrpc: "2.0"` stamped in.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("jsonrpc".into(), Value::String(JSONRPC_VERSION.into()));
        if let Some(id) = &self.id {
            map.insert("id".into(), id_to_value(id));
        } else if self.error.is_some() {
            map.insert("id".into(), Value::Null);
        }
        if let Some(method) = &self.method {
            map.insert("method".into(), Value::String(method.clone()));
        }
        if let Some(params) = &self.params {
            map.insert("params".into(), params.clone());
        }
        if let Some(result) = &self.result {
            map.insert("result".into(), result.clone());
        }
        if let Some(error) = &self.error {
            let mut err = Map::new();
            err.insert("code".into(), Value::from(error.code));
            err.insert("message".into(), Value::String(error.message.clone()));
            if let Some(data) = &error.data {
                err.insert("data".into(), data.clone());
            }
            map.insert("error".into(), Value::Object(err));
        }
        Value::Object(map)
    }
}

fn id_to_value(id: &RequestId) -> Value {
    match id {
        RequestId::Number(n) => Value::from(*n),
        RequestId::String(s) => Value::String(s.clone()),
    }
}
