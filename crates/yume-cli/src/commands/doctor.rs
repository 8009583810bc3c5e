use anyhow::{Context, Result, bail};
use std::path::Path;
use tokio::process::Command;
use yume_core::{EngineConfig, YumePaths};
use yume_interaction::{AgentLauncher, ClaudeCliLauncher};

/// Prints where configuration and logs live and checks the CLI can be run.
pub async fn run(config: &EngineConfig, config_path: Option<&Path>) -> Result<()> {
    match config_path.map(Path::to_path_buf).or_else(YumePaths::config_file) {
        Some(path) if path.exists() => println!("Config file: {}", path.display()),
        Some(path) => println!("Config file: {} (not found, using defaults)", path.display()),
        None => println!("Config file: (no config directory, using defaults)"),
    }
    println!("Log directory: {}", YumePaths::log_dir().display());
    if let Some(model) = &config.default_model {
        println!("Default model: {model}");
    }
    println!(
        "Titles: {}",
        if config.title.enabled { "enabled" } else { "disabled" }
    );

    let launcher = ClaudeCliLauncher::from_config(config);
    if let Err(e) = launcher.is_available().await {
        println!("✗ {}", e);
        bail!("{} is not usable", launcher.program());
    }

    let output = Command::new(&config.cli_path)
        .arg("--version")
        .output()
        .await
        .with_context(|| format!("Failed to run {} --version", launcher.program()))?;
    let version = String::from_utf8_lossy(&output.stdout);
    println!("✓ {} {}", launcher.program(), version.trim());

    Ok(())
}
