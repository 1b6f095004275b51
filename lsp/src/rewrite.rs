//! Payload rewriter: applies the [`PathTranslator`] to every location
//! reference inside a message.
//!
//! Recognized shapes:
//! - URI-valued keys (`uri`, `targetUri`, `rootUri`, ...), which covers
//!   `Location`, `LocationLink`, diagnostics' related information,
//!   `workspaceFolders` and `documentChanges` entries (including file
//!   create/rename/delete operations);
//! - path-valued keys (`rootPath`);
//! - `WorkspaceEdit.changes`, a map keyed by document URI;
//! - `file://` links inside hover `contents` and string command `arguments`.
//!
//! Everything else is copied structurally unchanged.

use std::borrow::Cow;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::message::Message;
use crate::translate::{Direction, PathTranslator};

const URI_KEYS: &[&str] = &[
    "uri",
    "targetUri",
    "oldUri",
    "newUri",
    "rootUri",
    "scopeUri",
    "baseUri",
    // `DocumentLink.target`
    "target",
];

const PATH_KEYS: &[&str] = &["rootPath"];

/// `WorkspaceEdit.changes`: `{ [uri]: TextEdit[] }`.
const URI_MAP_KEY: &str = "changes";

/// Free text that may embed `file://` links.
const TEXT_KEYS: &[&str] = &["contents"];

/// Command arguments; string elements that are file URIs get rewritten.
const ARGUMENT_KEYS: &[&str] = &["arguments"];

fn is_location_key(key: &str) -> bool {
    URI_KEYS.contains(&key)
        || PATH_KEYS.contains(&key)
        || key == URI_MAP_KEY
        || TEXT_KEYS.contains(&key)
        || ARGUMENT_KEYS.contains(&key)
}

/// Allocation-free scan for any key the rewriter would act on.
#[must_use]
pub fn needs_rewrite(value: &Value) -> bool {
    match value {
        Value::Object(map) => map
            .iter()
            .any(|(key, child)| is_location_key(key) || needs_rewrite(child)),
        Value::Array(items) => items.iter().any(needs_rewrite),
        _ => false,
    }
}

#[derive(Debug, Clone)]
pub struct PayloadRewriter {
    translator: Arc<PathTranslator>,
}

impl PayloadRewriter {
    pub fn new(translator: Arc<PathTranslator>) -> Self {
        Self { translator }
    }

    #[must_use]
    pub fn translator(&self) -> &PathTranslator {
        &self.translator
    }

    /// Rewrite a borrowed payload.
    ///
    /// Returns the input untouched (borrowed) when the translator is
    /// passthrough or the payload has no location-bearing keys; otherwise a
    /// rewritten deep copy. The input is never modified.
    pub fn rewrite<'v>(&self, value: &'v Value, direction: Direction) -> Cow<'v, Value> {
        if !self.translator.intercepts() || !needs_rewrite(value) {
            return Cow::Borrowed(value);
        }
        let mut copy = value.clone();
        self.rewrite_in_place(&mut copy, direction);
        Cow::Owned(copy)
    }

    /// `None` rewrites to `None`.
    pub fn rewrite_optional(&self, value: Option<&Value>, direction: Direction) -> Option<Value> {
        value.map(|v| self.rewrite(v, direction).into_owned())
    }

    /// Rewrite a payload the caller owns.
    pub fn rewrite_in_place(&self, value: &mut Value, direction: Direction) {
        if self.translator.intercepts() {
            self.walk(value, direction);
        }
    }

    /// Rewritten copy of `message`; the original is left as it was.
    #[must_use]
    pub fn rewrite_message(&self, message: &Message, direction: Direction) -> Message {
        self.rewrite_owned(message.clone(), direction)
    }

    /// Rewrite `params`, `result` and `error.data` of an owned message.
    #[must_use]
    pub fn rewrite_owned(&self, mut message: Message, direction: Direction) -> Message {
        if !self.translator.intercepts() {
            return message;
        }
        if let Some(params) = message.params.as_mut() {
            self.walk(params, direction);
        }
        if let Some(result) = message.result.as_mut() {
            self.walk(result, direction);
        }
        if let Some(data) = message.error.as_mut().and_then(|e| e.data.as_mut()) {
            self.walk(data, direction);
        }
        message
    }

    fn walk(&self, value: &mut Value, direction: Direction) {
        match value {
            Value::Object(map) => {
                for (key, child) in map.iter_mut() {
                    self.visit_field(key, child, direction);
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.walk(item, direction);
                }
            }
            _ => {}
        }
    }

    fn visit_field(&self, key: &str, child: &mut Value, direction: Direction) {
        let t = &self.translator;
        match child {
            Value::String(s) if URI_KEYS.contains(&key) => {
                *s = t.translate_uri(s, direction);
            }
            Value::String(s) if PATH_KEYS.contains(&key) => {
                *s = t.translate_path(s, direction);
            }
            Value::Object(edits) if key == URI_MAP_KEY => {
                let taken = std::mem::take(edits);
                *edits = taken
                    .into_iter()
                    .map(|(uri, mut list)| {
                        self.walk(&mut list, direction);
                        (t.translate_uri(&uri, direction), list)
                    })
                    .collect::<Map<String, Value>>();
            }
            _ if TEXT_KEYS.contains(&key) => self.rewrite_text(child, direction),
            Value::Array(args) if ARGUMENT_KEYS.contains(&key) => {
                for arg in args {
                    match arg {
                        Value::String(s) if s.starts_with("file://") => {
                            *s = t.translate_uri(s, direction);
                        }
                        other => self.walk(other, direction),
                    }
                }
            }
            other => self.walk(other, direction),
        }
    }

    /// Hover contents: a string, `MarkupContent`, `MarkedString`, or an array
    /// of those.
    fn rewrite_text(&self, value: &mut Value, direction: Direction) {
        match value {
            Value::String(s) => {
                if let Some(rewritten) = self.translator.translate_embedded_uris(s, direction) {
                    *s = rewritten;
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.rewrite_text(item, direction);
                }
            }
            Value::Object(map) => {
                for (key, child) in map.iter_mut() {
                    if key == "value" {
                        self.rewrite_text(child, direction);
                    } else {
                        self.visit_field(key, child, direction);
                    }
                }
            }
            _ => {}
        }
    }
}
