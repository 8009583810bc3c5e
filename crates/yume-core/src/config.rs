//! Engine configuration.
//!
//! Settings are read from `~/.config/yume/config.toml` (platform config dir
//! resolved through `dirs`). Every field has a default, so a missing file or a
//! partial file is valid.
//!
//! ```toml
//! cli_path = "/opt/homebrew/bin/claude"
//! debounce_ms = 500
//!
//! [title]
//! enabled = true
//! model = "claude-3-5-haiku-latest"
//! ```

use crate::error::{Result, YumeError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR: &str = "yume";
const CONFIG_FILE: &str = "config.toml";

/// Tunables for the session engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Executable name or absolute path of the assistant CLI.
    pub cli_path: String,
    /// Model passed with `--model` when a send request carries no hint.
    pub default_model: Option<String>,
    /// Forwarded as `--max-turns` when set.
    pub max_turns: Option<u32>,
    /// A live process younger than this is never killed by a new submit.
    pub spawn_grace_ms: u64,
    /// Time between the group SIGTERM and the forced SIGKILL.
    pub kill_grace_ms: u64,
    /// Settle time after the forced kill before a replacement is spawned.
    pub post_kill_wait_ms: u64,
    /// Delay between a process exit and the idle notification.
    pub debounce_ms: u64,
    /// Outbound batching window.
    pub batch_window_ms: u64,
    /// Carry-over ceiling for the line buffer before a forced flush.
    pub max_line_buffer_bytes: usize,
    /// Transcript cap per session.
    pub max_messages: usize,
    /// Inactivity after which a session is evicted.
    pub session_ttl_secs: u64,
    /// Interval of the eviction sweep.
    pub gc_interval_secs: u64,
    /// Model context window used for pressure warnings.
    pub context_window_tokens: u64,
    pub title: TitleConfig,
}

/// Background title generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TitleConfig {
    pub enabled: bool,
    pub model: Option<String>,
    /// Generated titles are cut to this many characters.
    pub max_chars: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cli_path: "claude".to_string(),
            default_model: None,
            max_turns: None,
            spawn_grace_ms: 1_000,
            kill_grace_ms: 2_000,
            post_kill_wait_ms: 300,
            debounce_ms: 500,
            batch_window_ms: 16,
            max_line_buffer_bytes: 32 * 1024 * 1024,
            max_messages: 1_000,
            session_ttl_secs: 24 * 60 * 60,
            gc_interval_secs: 60 * 60,
            context_window_tokens: 200_000,
            title: TitleConfig::default(),
        }
    }
}

impl Default for TitleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: Some("claude-3-5-haiku-latest".to_string()),
            max_chars: 50,
        }
    }
}

impl EngineConfig {
    /// Loads the configuration from the default location.
    ///
    /// A missing file yields the defaults.
    pub fn load() -> Result<Self> {
        match YumePaths::config_file() {
            Some(path) if path.exists() => Self::load_from(&path),
            Some(path) => {
                tracing::debug!(path = %path.display(), "No config file, using defaults");
                Ok(Self::default())
            }
            None => {
                tracing::warn!("Cannot resolve config directory, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Loads and validates the configuration at `path`.
    ///
    /// # Errors
    ///
    /// Returns `YumeError::Io` when the file cannot be read, a TOML
    /// serialization error when it does not parse, and `YumeError::Config`
    /// when a value is out of range.
    pub fn load_from(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw)?;
        config.validate()?;
        tracing::info!(path = %path.display(), "Loaded engine config");
        Ok(config)
    }

    /// Rejects values that would stall the engine.
    pub fn validate(&self) -> Result<()> {
        if self.cli_path.trim().is_empty() {
            return Err(YumeError::config("cli_path must not be empty"));
        }
        if self.batch_window_ms == 0 {
            return Err(YumeError::config("batch_window_ms must be greater than 0"));
        }
        if self.debounce_ms == 0 {
            return Err(YumeError::config("debounce_ms must be greater than 0"));
        }
        if self.max_messages == 0 {
            return Err(YumeError::config("max_messages must be greater than 0"));
        }
        if self.max_line_buffer_bytes < 1024 {
            return Err(YumeError::config(
                "max_line_buffer_bytes must be at least 1024",
            ));
        }
        if self.gc_interval_secs == 0 {
            return Err(YumeError::config("gc_interval_secs must be greater than 0"));
        }
        Ok(())
    }

    pub fn spawn_grace(&self) -> Duration {
        Duration::from_millis(self.spawn_grace_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn post_kill_wait(&self) -> Duration {
        Duration::from_millis(self.post_kill_wait_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs)
    }
}

/// Well-known locations.
///
/// ```text
/// ~/.config/yume/
/// └── config.toml
///
/// ~/.local/share/yume/
/// └── logs/
///     └── yume.log.YYYY-MM-DD
/// ```
pub struct YumePaths;

impl YumePaths {
    pub fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_DIR))
    }

    pub fn config_file() -> Option<PathBuf> {
        Self::config_dir().map(|dir| dir.join(CONFIG_FILE))
    }

    /// Log directory, falling back to the system temp dir.
    pub fn log_dir() -> PathBuf {
        dirs::data_local_dir()
            .map(|dir| dir.join(APP_DIR))
            .unwrap_or_else(|| std::env::temp_dir().join(APP_DIR))
            .join("logs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.debounce(), Duration::from_millis(500));
        assert_eq!(config.batch_window(), Duration::from_millis(16));
        assert_eq!(config.session_ttl(), Duration::from_secs(86_400));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "cli_path = \"/usr/local/bin/claude\"\n\n[title]\nenabled = false\n",
        )
        .unwrap();

        let config = EngineConfig::load_from(&path).unwrap();
        assert_eq!(config.cli_path, "/usr/local/bin/claude");
        assert!(!config.title.enabled);
        assert_eq!(config.title.max_chars, 50);
        assert_eq!(config.kill_grace_ms, 2_000);
    }

    #[test]
    fn test_zero_window_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "batch_window_ms = 0\n").unwrap();

        let err = EngineConfig::load_from(&path).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_malformed_toml_is_serialization_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "debounce_ms = \"soon\"\n").unwrap();

        let err = EngineConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, YumeError::Serialization { .. }));
    }
}
