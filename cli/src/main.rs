//! devbridge CLI - binary entry point.
//!
//! # Commands
//!
//! - `devbridge proxy --server gopls`: speak LSP on stdio to the editor and
//!   relay it to the server running inside the container, translating paths
//!   both ways. Configure the editor to launch this as the server command.
//! - `devbridge detect go`: list the candidate servers for a filetype and
//!   whether each one is installed in the container.
//!
//! stdout carries the protocol in proxy mode, so logs go to
//! `~/.devbridge/logs/devbridge.log` (or stderr when no log file can be
//! opened), never to stdout.

mod proxy;

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use devbridge_config::{DevbridgeConfig, StrategyChoice};
use devbridge_lsp::{ContainerCli, Registry, ServerAvailability, ServerCatalog};

/// Log filter variable, checked before `RUST_LOG`.
const LOG_ENV: &str = "DEVBRIDGE_LOG";

#[derive(Parser, Debug)]
#[command(name = "devbridge", version, about, long_about = None)]
struct Cli {
    /// Config file (default: $DEVBRIDGE_CONFIG or ~/.devbridge/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Relay an editor's LSP session to a server inside the container
    Proxy(ProxyArgs),

    /// Probe which servers for a filetype are installed in the container
    Detect(DetectArgs),
}

#[derive(clap::Args, Debug)]
struct ProxyArgs {
    /// Server name from the catalog (e.g. gopls, pyright)
    #[arg(long)]
    server: String,

    /// Container name or id
    #[arg(long, env = "DEVBRIDGE_CONTAINER")]
    container: Option<String>,

    /// Workspace root as the editor sees it
    #[arg(long)]
    host_root: Option<String>,

    /// Workspace root as the server sees it
    #[arg(long)]
    container_root: Option<String>,

    #[arg(long, value_enum)]
    strategy: Option<StrategyArg>,
}

#[derive(clap::Args, Debug)]
struct DetectArgs {
    /// Editor filetype (e.g. go, python)
    filetype: String,

    /// Container name or id
    #[arg(long, env = "DEVBRIDGE_CONTAINER")]
    container: Option<String>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum StrategyArg {
    Auto,
    Rewrite,
    Passthrough,
}

impl From<StrategyArg> for StrategyChoice {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::Auto => Self::Auto,
            StrategyArg::Rewrite => Self::Rewrite,
            StrategyArg::Passthrough => Self::Passthrough,
        }
    }
}

impl ProxyArgs {
    /// Command-line values win over the config file.
    fn apply(&self, config: &mut DevbridgeConfig) {
        if let Some(root) = &self.host_root {
            config.workspace.host_root = Some(root.clone());
        }
        if let Some(root) = &self.container_root {
            config.workspace.container_root = Some(root.clone());
        }
        if let Some(strategy) = self.strategy {
            config.workspace.strategy = strategy.into();
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e:#}");
            eprintln!("devbridge: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = load_config(cli.config.as_deref())?;
    match cli.command {
        Command::Proxy(args) => {
            args.apply(&mut config);
            proxy::run(&config, &args.server, args.container.as_deref()).await
        }
        Command::Detect(args) => detect(&config, &args).await,
    }
}

fn load_config(path: Option<&Path>) -> Result<DevbridgeConfig> {
    match path {
        Some(path) => DevbridgeConfig::load_from(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(DevbridgeConfig::load()
            .context("loading config")?
            .unwrap_or_default()),
    }
}

/// Registry over the configured container runtime, plus the catalog it uses.
fn build_registry(
    config: &DevbridgeConfig,
    container: Option<&str>,
) -> Result<(Registry, Arc<ServerCatalog>)> {
    let options = config.registry_options(container)?;
    let catalog = Arc::new(config.catalog()?);
    let runner = ContainerCli::new(&config.container.runtime)
        .context("resolving container runtime")?
        .with_workdir(config.container.workdir.clone());
    tracing::info!(
        container = %options.container,
        runtime = %runner.runtime().display(),
        mode = ?options.mode,
        "Registry configured"
    );
    let registry = Registry::new(Arc::new(runner), catalog.clone(), options);
    Ok((registry, catalog))
}

async fn detect(config: &DevbridgeConfig, args: &DetectArgs) -> Result<ExitCode> {
    let (registry, _) = build_registry(config, args.container.as_deref())?;
    let found = registry.detect_available(&args.filetype).await;
    if found.is_empty() {
        eprintln!("no servers configured for filetype '{}'", args.filetype);
        return Ok(ExitCode::FAILURE);
    }

    let mut stdout = std::io::stdout().lock();
    for entry in &found {
        writeln!(stdout, "{}", availability_line(entry))?;
    }
    Ok(ExitCode::SUCCESS)
}

fn availability_line(entry: &ServerAvailability) -> String {
    let status = if entry.is_available() {
        "available"
    } else {
        "unavailable"
    };
    let line = format!("{:<16} {status:<12}", entry.config.name());
    match entry.reason() {
        Some(reason) => format!("{line} {reason}"),
        None => line.trim_end().to_string(),
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let (log_file, init_warnings) = open_log_file();

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    // stdout belongs to the protocol.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
    for warning in init_warnings {
        tracing::warn!("{warning}");
    }
}

fn open_log_file() -> (Option<(PathBuf, fs::File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in log_file_candidates() {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!(
                "Failed to create log dir {}: {e}",
                parent.display()
            ));
            continue;
        }

        match OpenOptions::new().create(true).append(true).open(&candidate) {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => {
                warnings.push(format!(
                    "Failed to open log file {}: {e}",
                    candidate.display()
                ));
            }
        }
    }

    (None, warnings)
}

fn log_file_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    // Primary: ~/.devbridge/logs/devbridge.log
    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join(".devbridge").join("logs").join("devbridge.log"));
    }

    // Fallback: ./.devbridge/logs/devbridge.log
    candidates.push(PathBuf::from(".devbridge").join("logs").join("devbridge.log"));

    candidates
}
