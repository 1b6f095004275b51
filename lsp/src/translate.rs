//! Path and URI translation between the host and container namespaces.
//!
//! Translation is a textual prefix substitution on path-component
//! boundaries: `/h/a` maps under root `/h`, `/ha` does not. Anything outside
//! the source root comes back unchanged, which callers rely on for optional
//! and non-file fields.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard};

use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ToContainer,
    ToHost,
}

/// How a translator treats identifiers crossing the namespace boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Prefix substitution between two different roots.
    Rewrite,
    /// Both namespaces see the same paths; every translation is the identity
    /// and the bridge installs no rewrite hooks.
    Passthrough,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MappingError {
    #[error("{side} root is empty")]
    Empty { side: &'static str },
    #[error("{side} root must be absolute: {root:?}")]
    NotAbsolute { side: &'static str, root: String },
    #[error("a passthrough translator has no mapping to configure")]
    Passthrough,
}

/// An ordered `(host_root, container_root)` pair.
///
/// Both roots are absolute and stored without trailing separators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceMapping {
    host_root: String,
    container_root: String,
}

impl WorkspaceMapping {
    pub fn new(
        host_root: impl Into<String>,
        container_root: impl Into<String>,
    ) -> Result<Self, MappingError> {
        Ok(Self {
            host_root: normalize_root("host", host_root.into())?,
            container_root: normalize_root("container", container_root.into())?,
        })
    }

    #[must_use]
    pub fn host_root(&self) -> &str {
        &self.host_root
    }

    #[must_use]
    pub fn container_root(&self) -> &str {
        &self.container_root
    }

    /// Whether both namespaces use the same root.
    #[must_use]
    pub fn is_identity(&self) -> bool {
        self.host_root == self.container_root
    }
}

fn normalize_root(side: &'static str, raw: String) -> Result<String, MappingError> {
    if raw.trim().is_empty() {
        return Err(MappingError::Empty { side });
    }
    if !raw.starts_with('/') {
        return Err(MappingError::NotAbsolute { side, root: raw });
    }
    let trimmed = raw.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(MappingError::Empty { side });
    }
    Ok(trimmed.to_string())
}

/// What a translator is built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranslationMode {
    Passthrough,
    Rewrite(WorkspaceMapping),
    /// Rewrite strategy whose mapping hasn't been configured yet. Paths pass
    /// through unchanged and the health check reports it.
    Unconfigured,
}

impl TranslationMode {
    /// Passthrough when both roots are equal, rewrite otherwise.
    pub fn for_roots(
        host_root: impl Into<String>,
        container_root: impl Into<String>,
    ) -> Result<Self, MappingError> {
        let mapping = WorkspaceMapping::new(host_root, container_root)?;
        if mapping.is_identity() {
            Ok(Self::Passthrough)
        } else {
            Ok(Self::Rewrite(mapping))
        }
    }
}

/// Active mapping plus the percent-encoded forms used inside `file://` URIs.
#[derive(Debug)]
struct Roots {
    mapping: WorkspaceMapping,
    host_uri_path: String,
    container_uri_path: String,
}

impl Roots {
    fn new(mapping: WorkspaceMapping) -> Self {
        Self {
            host_uri_path: uri_path_for(mapping.host_root()),
            container_uri_path: uri_path_for(mapping.container_root()),
            mapping,
        }
    }

    fn path_roots(&self, direction: Direction) -> (&str, &str) {
        match direction {
            Direction::ToContainer => (self.mapping.host_root(), self.mapping.container_root()),
            Direction::ToHost => (self.mapping.container_root(), self.mapping.host_root()),
        }
    }

    fn uri_roots(&self, direction: Direction) -> (&str, &str) {
        match direction {
            Direction::ToContainer => (&self.host_uri_path, &self.container_uri_path),
            Direction::ToHost => (&self.container_uri_path, &self.host_uri_path),
        }
    }
}

fn uri_path_for(root: &str) -> String {
    url::Url::from_file_path(root)
        .map(|u| u.path().trim_end_matches('/').to_string())
        .unwrap_or_else(|()| root.to_string())
}

#[derive(Debug, Default)]
struct DirectionCache {
    paths: HashMap<String, String>,
    uris: HashMap<String, String>,
}

impl DirectionCache {
    fn clear(&mut self) {
        self.paths.clear();
        self.uris.clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.paths.len() + self.uris.len()
    }
}

#[derive(Debug, Clone, Copy)]
enum Kind {
    Path,
    Uri,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Bidirectional path/URI translator with one lookup cache per direction.
///
/// The caches grow for the lifetime of the translator and are cleared on
/// every [`configure`](Self::configure).
#[derive(Debug)]
pub struct PathTranslator {
    strategy: Strategy,
    roots: RwLock<Option<Roots>>,
    to_container_cache: Mutex<DirectionCache>,
    to_host_cache: Mutex<DirectionCache>,
}

impl PathTranslator {
    pub fn new(mode: TranslationMode) -> Self {
        let (strategy, roots) = match mode {
            TranslationMode::Passthrough => (Strategy::Passthrough, None),
            TranslationMode::Rewrite(mapping) => (Strategy::Rewrite, Some(Roots::new(mapping))),
            TranslationMode::Unconfigured => (Strategy::Rewrite, None),
        };
        Self {
            strategy,
            roots: RwLock::new(roots),
            to_container_cache: Mutex::default(),
            to_host_cache: Mutex::default(),
        }
    }

    pub fn passthrough() -> Self {
        Self::new(TranslationMode::Passthrough)
    }

    pub fn rewrite(mapping: WorkspaceMapping) -> Self {
        Self::new(TranslationMode::Rewrite(mapping))
    }

    #[must_use]
    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Whether payloads need to go through the rewriter at all.
    #[must_use]
    pub fn intercepts(&self) -> bool {
        self.strategy == Strategy::Rewrite
    }

    /// Passthrough is always considered configured.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        match self.strategy {
            Strategy::Passthrough => true,
            Strategy::Rewrite => self.read_roots().is_some(),
        }
    }

    #[must_use]
    pub fn mapping(&self) -> Option<WorkspaceMapping> {
        self.read_roots().as_ref().map(|r| r.mapping.clone())
    }

    /// Replace the active mapping and drop both caches.
    ///
    /// The write lock is held across the cache clear, so no translation made
    /// with the old mapping can land in a cache after this returns.
    pub fn configure(
        &self,
        host_root: impl Into<String>,
        container_root: impl Into<String>,
    ) -> Result<(), MappingError> {
        if self.strategy == Strategy::Passthrough {
            return Err(MappingError::Passthrough);
        }
        let mapping = WorkspaceMapping::new(host_root, container_root)?;
        let mut roots = self.roots.write().unwrap_or_else(PoisonError::into_inner);
        lock(&self.to_container_cache).clear();
        lock(&self.to_host_cache).clear();
        tracing::debug!(
            host_root = mapping.host_root(),
            container_root = mapping.container_root(),
            "Workspace mapping configured"
        );
        *roots = Some(Roots::new(mapping));
        Ok(())
    }

    /// Number of cached entries as `(to_container, to_host)`.
    #[cfg(test)]
    fn cache_sizes(&self) -> (usize, usize) {
        (
            lock(&self.to_container_cache).len(),
            lock(&self.to_host_cache).len(),
        )
    }

    pub fn to_container(&self, host_path: &str) -> String {
        self.translate(host_path, Direction::ToContainer, Kind::Path)
    }

    pub fn to_host(&self, container_path: &str) -> String {
        self.translate(container_path, Direction::ToHost, Kind::Path)
    }

    pub fn to_container_uri(&self, host_uri: &str) -> String {
        self.translate(host_uri, Direction::ToContainer, Kind::Uri)
    }

    pub fn to_host_uri(&self, container_uri: &str) -> String {
        self.translate(container_uri, Direction::ToHost, Kind::Uri)
    }

    pub fn translate_path(&self, path: &str, direction: Direction) -> String {
        self.translate(path, direction, Kind::Path)
    }

    pub fn translate_uri(&self, uri: &str, direction: Direction) -> String {
        self.translate(uri, direction, Kind::Uri)
    }

    /// Rewrite every `file://` URI embedded in free text, such as the
    /// markdown of a hover.
    pub fn translate_embedded_uris(&self, text: &str, direction: Direction) -> Option<String> {
        if !self.intercepts() || !text.contains("file://") {
            return None;
        }
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        let mut changed = false;
        while let Some(start) = rest.find("file://") {
            out.push_str(&rest[..start]);
            let tail = &rest[start..];
            let end = tail
                .find(|c: char| c.is_whitespace() || "()[]<>\"'`".contains(c))
                .unwrap_or(tail.len());
            let uri = &tail[..end];
            let translated = self.translate_uri(uri, direction);
            changed |= translated != uri;
            out.push_str(&translated);
            rest = &tail[end..];
        }
        out.push_str(rest);
        changed.then_some(out)
    }

    fn read_roots(&self) -> RwLockReadGuard<'_, Option<Roots>> {
        self.roots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn cache(&self, direction: Direction) -> &Mutex<DirectionCache> {
        match direction {
            Direction::ToContainer => &self.to_container_cache,
            Direction::ToHost => &self.to_host_cache,
        }
    }

    fn translate(&self, input: &str, direction: Direction, kind: Kind) -> String {
        if input.is_empty() || self.strategy == Strategy::Passthrough {
            return input.to_string();
        }
        let roots = self.read_roots();
        let Some(roots) = roots.as_ref() else {
            return input.to_string();
        };

        let cache = self.cache(direction);
        {
            let cache = lock(cache);
            let hit = match kind {
                Kind::Path => cache.paths.get(input),
                Kind::Uri => cache.uris.get(input),
            };
            if let Some(hit) = hit {
                return hit.clone();
            }
        }

        let translated = match kind {
            Kind::Path => {
                let (from, to) = roots.path_roots(direction);
                substitute(input, from, to)
            }
            Kind::Uri => {
                let (from, to) = roots.uri_roots(direction);
                substitute_uri(input, from, to).or_else(|| {
                    let (from, to) = roots.path_roots(direction);
                    substitute_decoded_uri(input, from, to)
                })
            }
        }
        .unwrap_or_else(|| input.to_string());

        let mut cache = lock(cache);
        let entries = match kind {
            Kind::Path => &mut cache.paths,
            Kind::Uri => &mut cache.uris,
        };
        entries.insert(input.to_string(), translated.clone());
        translated
    }
}

/// Substitute `from` with `to` if `path` equals `from` or continues it at a
/// `/` boundary.
fn substitute(path: &str, from: &str, to: &str) -> Option<String> {
    let rest = path.strip_prefix(from)?;
    if rest.is_empty() || rest.starts_with('/') {
        Some(format!("{to}{rest}"))
    } else {
        None
    }
}

/// Only `file` URIs with an empty authority (`file:///...`) are rewritten.
/// Anything without a `://` separator passes through.
fn substitute_uri(uri: &str, from: &str, to: &str) -> Option<String> {
    let (scheme, rest) = uri.split_once("://")?;
    if !scheme.eq_ignore_ascii_case("file") || !rest.starts_with('/') {
        return None;
    }
    let path_end = rest.find(['?', '#']).unwrap_or(rest.len());
    let (path, suffix) = rest.split_at(path_end);
    substitute(path, from, to).map(|p| format!("{scheme}://{p}{suffix}"))
}

/// Slow path for URIs whose encoding differs from ours, e.g. `%2B` for `+`.
/// Matches on the decoded path and re-encodes the result canonically.
fn substitute_decoded_uri(uri: &str, from: &str, to: &str) -> Option<String> {
    let parsed = url::Url::parse(uri).ok()?;
    if parsed.scheme() != "file" {
        return None;
    }
    let path = parsed.to_file_path().ok()?;
    let translated = substitute(path.to_str()?, from, to)?;
    let mut out = url::Url::from_file_path(translated).ok()?;
    out.set_query(parsed.query());
    out.set_fragment(parsed.fragment());
    Some(out.into())
}
