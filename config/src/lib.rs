//! Configuration for devbridge: `~/.devbridge/config.toml`.
//!
//! ```toml
//! [container]
//! id = "my-devcontainer"
//! runtime = "docker"
//!
//! [workspace]
//! host_root = "${HOME}/src/project"
//! container_root = "/workspace"
//! strategy = "auto"
//!
//! [servers.gopls]
//! command = "gopls"
//! filetypes = ["go", "gomod"]
//! ```
//!
//! `${VAR}` references in string values are expanded from the environment
//! after parsing. Server tables are validated when the catalog is built.

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

use devbridge_lsp::{
    BridgeTimeouts, MappingError, RegistryOptions, ServerCatalog, ServerConfig, ServerConfigError,
    ServerSpec, TranslationMode, WorkspaceMapping,
};
use serde::Deserialize;

/// Overrides the config file location.
pub const CONFIG_ENV: &str = "DEVBRIDGE_CONFIG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid server config: {0}")]
    Server(#[from] ServerConfigError),
    #[error("invalid workspace mapping: {0}")]
    Mapping(#[from] MappingError),
    #[error("no container configured; set [container].id or pass --container")]
    MissingContainer,
}

impl ConfigError {
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Read { path, .. } | Self::Parse { path, .. } => Some(path),
            Self::Server(_) | Self::Mapping(_) | Self::MissingContainer => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyChoice {
    /// Passthrough when both roots are equal (or unset), rewrite otherwise.
    #[default]
    Auto,
    Rewrite,
    Passthrough,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    pub id: Option<String>,
    /// `docker`, `podman`, or a path to either.
    pub runtime: String,
    /// Working directory for `exec -w`.
    pub workdir: Option<String>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            id: None,
            runtime: String::from("docker"),
            workdir: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub host_root: Option<String>,
    pub container_root: Option<String>,
    pub strategy: StrategyChoice,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DevbridgeConfig {
    pub container: ContainerConfig,
    pub workspace: WorkspaceConfig,
    pub bridge: BridgeTimeouts,
    /// Keyed by server name; entries replace built-ins of the same name.
    pub servers: BTreeMap<String, ServerSpec>,
}

/// Expand `${VAR}` references. Missing variables expand to nothing; an
/// unterminated `${` is kept as written.
pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let var = &after[..end];
        if !var.is_empty() {
            out.push_str(&env::var(var).unwrap_or_default());
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

fn expand_opt(value: &mut Option<String>) {
    if let Some(v) = value {
        *v = expand_env_vars(v);
    }
}

fn expand_vec(values: &mut [String]) {
    for v in values {
        *v = expand_env_vars(v);
    }
}

impl DevbridgeConfig {
    /// Load from the default location. `Ok(None)` when there is no file.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        let Some(path) = config_path() else {
            return Ok(None);
        };
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file");
            return Ok(None);
        }
        Self::load_from(&path).map(Some)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| {
            tracing::warn!("Failed to read config at {}: {source}", path.display());
            ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }
        })?;
        Self::parse(&content, path)
    }

    /// Parse TOML text; `path` is only used in errors.
    pub fn parse(content: &str, path: &Path) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(content).map_err(|source| {
            tracing::warn!("Failed to parse config at {}: {source}", path.display());
            ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }
        })?;
        config.expand();
        Ok(config)
    }

    #[must_use]
    pub fn path() -> Option<PathBuf> {
        config_path()
    }

    fn expand(&mut self) {
        expand_opt(&mut self.container.id);
        expand_opt(&mut self.container.workdir);
        self.container.runtime = expand_env_vars(&self.container.runtime);
        expand_opt(&mut self.workspace.host_root);
        expand_opt(&mut self.workspace.container_root);
        for spec in self.servers.values_mut() {
            spec.command = expand_env_vars(&spec.command);
            expand_vec(&mut spec.args);
            for value in spec.env.values_mut() {
                *value = expand_env_vars(value);
            }
        }
    }

    /// Resolve the translation mode from `[workspace]`.
    ///
    /// `rewrite` with a missing root yields [`TranslationMode::Unconfigured`];
    /// `auto` with a missing root assumes identical mounts.
    pub fn translation_mode(&self) -> Result<TranslationMode, ConfigError> {
        let ws = &self.workspace;
        let roots = ws.host_root.as_deref().zip(ws.container_root.as_deref());
        let mode = match (ws.strategy, roots) {
            (StrategyChoice::Passthrough, _) | (StrategyChoice::Auto, None) => {
                TranslationMode::Passthrough
            }
            (StrategyChoice::Rewrite, None) => TranslationMode::Unconfigured,
            (StrategyChoice::Auto, Some((host, container))) => {
                TranslationMode::for_roots(host, container)?
            }
            (StrategyChoice::Rewrite, Some((host, container))) => {
                TranslationMode::Rewrite(WorkspaceMapping::new(host, container)?)
            }
        };
        Ok(mode)
    }

    /// Built-in servers overridden by the configured ones.
    pub fn catalog(&self) -> Result<ServerCatalog, ConfigError> {
        let mut overrides = Vec::with_capacity(self.servers.len());
        for (name, spec) in &self.servers {
            overrides.push(ServerConfig::from_spec(name.clone(), spec.clone())?);
        }
        Ok(ServerCatalog::builtin().with_overrides(overrides))
    }

    /// Registry options; `container` overrides `[container].id`.
    pub fn registry_options(&self, container: Option<&str>) -> Result<RegistryOptions, ConfigError> {
        let container = container
            .map(str::to_string)
            .or_else(|| self.container.id.clone())
            .filter(|id| !id.trim().is_empty())
            .ok_or(ConfigError::MissingContainer)?;
        let mut options =
            RegistryOptions::new(container, self.translation_mode()?).with_timeouts(self.bridge);
        if let Some(root) = &self.workspace.host_root {
            options = options.with_workspace_root(root);
        }
        Ok(options)
    }
}

/// `$DEVBRIDGE_CONFIG`, else `~/.devbridge/config.toml`.
pub fn config_path() -> Option<PathBuf> {
    if let Some(path) = env::var_os(CONFIG_ENV).filter(|p| !p.is_empty()) {
        return Some(PathBuf::from(path));
    }
    dirs::home_dir().map(|home| home.join(".devbridge").join("config.toml"))
}
