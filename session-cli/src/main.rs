//! # duet
//!
//! Command-line front end for the Duet session runtime.
//!
//! ## Commands
//!
//! - `simulate`: Run an in-process session and check that replicas converge
//! - `config`: Show the effective configuration
//!
//! ## Example
//!
//! ```bash
//! # Three participants, twenty edits each
//! duet simulate --participants 3 --edits 20
//!
//! # Same, with one read-only observer and a JSON report
//! duet simulate --participants 4 --edits 10 --observer --json
//!
//! # Show the configuration in effect
//! duet --config ./duet.toml config
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use session_client::ClientConfig;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{config, simulate};

/// Command-line front end for the Duet session runtime.
#[derive(Parser, Debug)]
#[command(name = "duet")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file (defaults to the per-user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `session_client=trace` (overrides RUST_LOG)
    #[arg(long, global = true)]
    log: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run an in-process session and report whether all replicas converge
    Simulate {
        /// Number of participants, host included
        #[arg(long, short, default_value = "3", value_parser = clap::value_parser!(u16).range(1..=32))]
        participants: u16,

        /// Edits each participant makes
        #[arg(long, short, default_value = "10")]
        edits: u32,

        /// Keep the last participant an observer (its edits must be refused)
        #[arg(long)]
        observer: bool,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,

        /// Give up waiting for convergence after this many seconds
        #[arg(long, default_value = "30")]
        timeout_secs: u64,
    },

    /// Show the effective configuration as TOML
    Config {
        /// Only print where the configuration is read from
        #[arg(long)]
        path: bool,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log.as_deref())?;

    let source = config_source(cli.config)?;
    let client_config = load_config(&source)?;

    match cli.command {
        Commands::Simulate {
            participants,
            edits,
            observer,
            json,
            timeout_secs,
        } => {
            let options = simulate::SimulationOptions {
                participants: usize::from(participants),
                edits,
                observer,
                timeout: std::time::Duration::from_secs(timeout_secs),
            };
            let report = simulate::run(client_config, options).await?;
            report.print(json)?;
            if !report.converged {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Config { path } => {
            config::run(&source, &client_config, path)?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Install the global subscriber. Logs go to stderr so reports stay parseable.
fn init_tracing(filter: Option<&str>) -> Result<()> {
    let filter = match filter {
        Some(directives) => EnvFilter::try_new(directives)
            .with_context(|| format!("Invalid log filter '{directives}'"))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

/// Where the configuration comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Given with `--config`; must exist.
    Explicit(PathBuf),
    /// The per-user default; used only if present.
    Default(PathBuf),
}

impl ConfigSource {
    /// The file path.
    pub fn path(&self) -> &PathBuf {
        match self {
            ConfigSource::Explicit(path) | ConfigSource::Default(path) => path,
        }
    }
}

fn config_source(explicit: Option<PathBuf>) -> Result<ConfigSource> {
    match explicit {
        Some(path) => Ok(ConfigSource::Explicit(path)),
        None => Ok(ConfigSource::Default(default_config_path()?)),
    }
}

fn load_config(source: &ConfigSource) -> Result<ClientConfig> {
    match source {
        ConfigSource::Explicit(path) => Ok(ClientConfig::from_file(path)?),
        ConfigSource::Default(path) if path.exists() => Ok(ClientConfig::from_file(path)?),
        ConfigSource::Default(path) => {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            Ok(ClientConfig::default())
        }
    }
}

/// Get the default configuration file for duet.
fn default_config_path() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("io", "duet", "duet")
        .context("Could not determine home directory")?;
    Ok(dirs.config_dir().join("config.toml"))
}
