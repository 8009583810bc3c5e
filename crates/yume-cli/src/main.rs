use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use yume_core::EngineConfig;

mod commands;

#[derive(Parser)]
#[command(name = "yume")]
#[command(version, about = "Yume - session engine for CLI AI assistants", long_about = None)]
struct Cli {
    /// Configuration file (defaults to <config dir>/yume/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve JSON-lines requests on stdin and write events to stdout
    Serve {
        /// Do not write the daily log file
        #[arg(long)]
        no_file_log: bool,

        /// Do not forward warnings to stdout as diagnostic lines
        #[arg(long)]
        no_diagnostics: bool,
    },
    /// Check configuration and the assistant CLI installation
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve {
            no_file_log,
            no_diagnostics,
        } => {
            let (diagnostics, diagnostics_rx) = if no_diagnostics {
                (None, None)
            } else {
                let (tx, rx) = mpsc::unbounded_channel();
                (Some(tx), Some(rx))
            };
            let _log_guard = commands::logging::init(diagnostics, !no_file_log)?;
            commands::serve::run(config, diagnostics_rx).await?;
        }
        Commands::Doctor => {
            let _log_guard = commands::logging::init(None, false)?;
            commands::doctor::run(&config, cli.config.as_deref()).await?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let config = match path {
        Some(path) => EngineConfig::load_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => EngineConfig::load().context("Failed to load config")?,
    };
    config.validate().context("Invalid configuration")?;
    Ok(config)
}
