//! Which servers handle which filetypes, and where their workspace starts.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::types::ServerConfig;

/// The language-to-server mapping consulted by the registry.
pub trait LanguageRegistry: Send + Sync {
    /// Every server configured for `filetype`, in preference order.
    fn get_by_filetype(&self, filetype: &str) -> Vec<ServerConfig>;

    fn get(&self, name: &str) -> Option<ServerConfig>;
}

/// A name-keyed set of server descriptors.
#[derive(Debug, Clone, Default)]
pub struct ServerCatalog {
    servers: BTreeMap<String, ServerConfig>,
}

struct Builtin {
    name: &'static str,
    command: &'static str,
    args: &'static [&'static str],
    filetypes: &'static [&'static str],
    extensions: &'static [&'static str],
    root_patterns: &'static [&'static str],
}

const BUILTINS: &[Builtin] = &[
    Builtin {
        name: "gopls",
        command: "gopls",
        args: &[],
        filetypes: &["go", "gomod", "gowork"],
        extensions: &["go"],
        root_patterns: &["go.work", "go.mod", ".git"],
    },
    Builtin {
        name: "pyright",
        command: "pyright-langserver",
        args: &["--stdio"],
        filetypes: &["python"],
        extensions: &["py", "pyi"],
        root_patterns: &["pyproject.toml", "setup.py", "setup.cfg", "requirements.txt", ".git"],
    },
    Builtin {
        name: "pylsp",
        command: "pylsp",
        args: &[],
        filetypes: &["python"],
        extensions: &["py"],
        root_patterns: &["pyproject.toml", "setup.py", ".git"],
    },
    Builtin {
        name: "rust_analyzer",
        command: "rust-analyzer",
        args: &[],
        filetypes: &["rust"],
        extensions: &["rs"],
        root_patterns: &["Cargo.toml", ".git"],
    },
    Builtin {
        name: "tsserver",
        command: "typescript-language-server",
        args: &["--stdio"],
        filetypes: &["typescript", "typescriptreact", "javascript", "javascriptreact"],
        extensions: &["ts", "tsx", "js", "jsx"],
        root_patterns: &["tsconfig.json", "jsconfig.json", "package.json", ".git"],
    },
    Builtin {
        name: "lua_ls",
        command: "lua-language-server",
        args: &[],
        filetypes: &["lua"],
        extensions: &["lua"],
        root_patterns: &[".luarc.json", ".git"],
    },
    Builtin {
        name: "clangd",
        command: "clangd",
        args: &[],
        filetypes: &["c", "cpp"],
        extensions: &["c", "h", "cc", "cpp", "hpp"],
        root_patterns: &["compile_commands.json", ".clangd", ".git"],
    },
];

/// Rank within a filetype: the built-in order, then everything else by name.
fn builtin_rank(name: &str) -> usize {
    BUILTINS
        .iter()
        .position(|b| b.name == name)
        .unwrap_or(BUILTINS.len())
}

impl ServerCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// The default servers for common languages.
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        for b in BUILTINS {
            match ServerConfig::new(b.name, b.command, b.filetypes.iter().copied()) {
                Ok(config) => catalog.insert(
                    config
                        .with_args(b.args.iter().copied())
                        .with_extensions(b.extensions.iter().copied())
                        .with_root_patterns(b.root_patterns.iter().copied()),
                ),
                Err(e) => tracing::warn!("Skipping built-in server '{}': {e}", b.name),
            }
        }
        catalog
    }

    /// Add or replace a server by name.
    pub fn insert(&mut self, config: ServerConfig) {
        self.servers.insert(config.name().to_string(), config);
    }

    /// Replace entries with the same name; add the rest.
    #[must_use]
    pub fn with_overrides(mut self, overrides: impl IntoIterator<Item = ServerConfig>) -> Self {
        for config in overrides {
            self.insert(config);
        }
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.servers.keys().map(String::as_str)
    }
}

impl LanguageRegistry for ServerCatalog {
    fn get_by_filetype(&self, filetype: &str) -> Vec<ServerConfig> {
        let mut candidates: Vec<&ServerConfig> = self
            .servers
            .values()
            .filter(|c| c.handles_filetype(filetype))
            .collect();
        candidates.sort_by_key(|c| (builtin_rank(c.name()), c.name().to_string()));
        candidates.into_iter().cloned().collect()
    }

    fn get(&self, name: &str) -> Option<ServerConfig> {
        self.servers.get(name).cloned()
    }
}

fn build_globset(patterns: &[String]) -> Option<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    let mut added = 0;
    for pattern in patterns {
        match Glob::new(pattern) {
            Ok(glob) => {
                builder.add(glob);
                added += 1;
            }
            Err(e) => tracing::warn!("Ignoring invalid root pattern '{pattern}': {e}"),
        }
    }
    if added == 0 {
        return None;
    }
    builder.build().ok()
}

fn dir_has_match(dir: &Path, globs: &GlobSet) -> bool {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return false;
    };
    entries
        .flatten()
        .any(|entry| globs.is_match(entry.file_name()))
}

/// Walk up from `start` to the first directory holding an entry matching one
/// of `patterns`.
///
/// `start` may be a file; the search begins at its parent. The walk never
/// goes above `boundary` when one is given, and returns `None` when `start`
/// is outside it.
pub fn find_root(start: &Path, patterns: &[String], boundary: Option<&Path>) -> Option<PathBuf> {
    let globs = build_globset(patterns)?;
    let first = if start.is_dir() {
        start
    } else {
        start.parent()?
    };
    if let Some(boundary) = boundary
        && !first.starts_with(boundary)
    {
        return None;
    }

    for dir in first.ancestors() {
        if dir_has_match(dir, &globs) {
            return Some(dir.to_path_buf());
        }
        if boundary.is_some_and(|b| dir == b) {
            break;
        }
    }
    None
}
