//! Launcher for the `claude` CLI in `stream-json` print mode.
//!
//! Each turn runs one CLI process: the prompt is written to stdin, stdin is
//! closed, and the CLI prints newline-delimited JSON records until the reply is
//! complete and exits.

use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Command;
use yume_core::{EngineConfig, Result, YumeError};

/// Everything that varies between two launches of the CLI.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LaunchRequest {
    pub working_directory: PathBuf,
    /// Passed with `--resume`; `None` starts a fresh conversation.
    pub resume_token: Option<String>,
    /// Overrides the launcher's default model.
    pub model: Option<String>,
    pub disallowed_tools: Vec<String>,
    pub max_turns: Option<u32>,
}

impl LaunchRequest {
    pub fn new(working_directory: impl Into<PathBuf>) -> Self {
        Self {
            working_directory: working_directory.into(),
            ..Self::default()
        }
    }
}

/// Builds the command line for one assistant process.
///
/// Implementations only decide program, arguments, environment and working
/// directory. The supervisor owns stdio wiring and process-group setup.
#[async_trait]
pub trait AgentLauncher: Send + Sync {
    /// Program name used in logs and spawn errors.
    fn program(&self) -> String;

    fn command(&self, request: &LaunchRequest) -> Command;

    /// Checks that the program can be started.
    async fn is_available(&self) -> Result<()>;
}

/// Launches the `claude` CLI.
///
/// # Example
///
/// ```rust,ignore
/// use yume_interaction::{AgentLauncher, ClaudeCliLauncher, LaunchRequest};
///
/// let launcher = ClaudeCliLauncher::new().with_model("sonnet");
/// let mut request = LaunchRequest::new("/path/to/project");
/// request.resume_token = Some("0d9c...".to_string());
/// let cmd = launcher.command(&request);
/// ```
#[derive(Debug, Clone)]
pub struct ClaudeCliLauncher {
    /// Path to the `claude` executable. A bare name is looked up in PATH.
    cli_path: PathBuf,
    default_model: Option<String>,
    max_turns: Option<u32>,
}

impl ClaudeCliLauncher {
    /// Creates a launcher that searches for `claude` in PATH.
    pub fn new() -> Self {
        Self::with_path(PathBuf::from("claude"))
    }

    /// Creates a launcher with a custom path to the executable.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            cli_path: path.into(),
            default_model: None,
            max_turns: None,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        let mut launcher = Self::with_path(&config.cli_path);
        launcher.default_model = config.default_model.clone();
        launcher.max_turns = config.max_turns;
        launcher
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = Some(max_turns);
        self
    }
}

impl Default for ClaudeCliLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentLauncher for ClaudeCliLauncher {
    fn program(&self) -> String {
        self.cli_path.to_string_lossy().to_string()
    }

    fn command(&self, request: &LaunchRequest) -> Command {
        let mut cmd = Command::new(&self.cli_path);
        cmd.arg("--print")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose");

        if let Some(token) = &request.resume_token {
            cmd.arg("--resume").arg(token);
        }

        if let Some(model) = request.model.as_ref().or(self.default_model.as_ref()) {
            cmd.arg("--model").arg(model);
        }

        if !request.disallowed_tools.is_empty() {
            cmd.arg("--disallowedTools")
                .arg(request.disallowed_tools.join(","));
        }

        if let Some(max_turns) = request.max_turns.or(self.max_turns) {
            cmd.arg("--max-turns").arg(max_turns.to_string());
        }

        cmd.current_dir(&request.working_directory);

        // macOS .app bundles do not inherit the shell PATH
        #[cfg(target_os = "macos")]
        {
            if let Ok(current_path) = std::env::var("PATH") {
                cmd.env("PATH", enhanced_path(&current_path));
                tracing::debug!("Enhanced PATH for macOS app");
            }
        }

        tracing::debug!(
            program = %self.cli_path.display(),
            resume = request.resume_token.is_some(),
            cwd = %request.working_directory.display(),
            "Built CLI command"
        );
        cmd
    }

    async fn is_available(&self) -> Result<()> {
        if self.cli_path.components().count() > 1 {
            return if self.cli_path.is_file() {
                Ok(())
            } else {
                Err(YumeError::not_found("executable", self.program()))
            };
        }

        #[cfg(unix)]
        let check_cmd = "which";
        #[cfg(windows)]
        let check_cmd = "where";

        let output = Command::new(check_cmd)
            .arg(&self.cli_path)
            .output()
            .await
            .map_err(|e| YumeError::io(format!("Failed to run {check_cmd}: {e}")))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(YumeError::not_found("executable", self.program()))
        }
    }
}

/// Appends the usual user binary locations to `current`.
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn enhanced_path(current: &str) -> String {
    let mut extra = vec![
        PathBuf::from("/usr/local/bin"),
        PathBuf::from("/opt/homebrew/bin"),
    ];
    if let Some(home) = dirs::home_dir() {
        for sub in [".local/bin", "bin", ".cargo/bin", ".volta/bin", ".npm-global/bin"] {
            extra.push(home.join(sub));
        }
    }

    let mut path = current.to_string();
    for dir in extra {
        let dir = dir.to_string_lossy();
        if !path.split(':').any(|p| p == dir) {
            path.push(':');
            path.push_str(&dir);
        }
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect()
    }

    #[test]
    fn test_fresh_turn_arguments() {
        let launcher = ClaudeCliLauncher::new();
        let cmd = launcher.command(&LaunchRequest::new("/tmp/project"));

        assert_eq!(
            args(&cmd),
            vec!["--print", "--output-format", "stream-json", "--verbose"]
        );
        assert_eq!(
            cmd.as_std().get_current_dir(),
            Some(std::path::Path::new("/tmp/project"))
        );
    }

    #[test]
    fn test_resumed_turn_arguments() {
        let launcher = ClaudeCliLauncher::with_path("/usr/local/bin/claude")
            .with_model("sonnet")
            .with_max_turns(8);
        let request = LaunchRequest {
            working_directory: PathBuf::from("/tmp"),
            resume_token: Some("tok-1".to_string()),
            model: None,
            disallowed_tools: vec!["Bash".to_string(), "WebFetch".to_string()],
            max_turns: None,
        };

        let argv = args(&launcher.command(&request));

        assert!(argv.windows(2).any(|w| w == ["--resume", "tok-1"]));
        assert!(argv.windows(2).any(|w| w == ["--model", "sonnet"]));
        assert!(argv.windows(2).any(|w| w == ["--disallowedTools", "Bash,WebFetch"]));
        assert!(argv.windows(2).any(|w| w == ["--max-turns", "8"]));
    }

    #[test]
    fn test_request_model_overrides_default() {
        let launcher = ClaudeCliLauncher::new().with_model("sonnet");
        let mut request = LaunchRequest::new("/tmp");
        request.model = Some("opus".to_string());

        let argv = args(&launcher.command(&request));
        assert!(argv.windows(2).any(|w| w == ["--model", "opus"]));
        assert!(!argv.iter().any(|a| a == "sonnet"));
    }

    #[test]
    fn test_enhanced_path_does_not_duplicate() {
        let path = enhanced_path("/usr/bin:/usr/local/bin");
        assert_eq!(path.matches("/usr/local/bin").count(), 1);
        assert!(path.contains("/opt/homebrew/bin"));
    }

    #[tokio::test]
    async fn test_missing_absolute_path_is_not_found() {
        let dir = tempfile::TempDir::new().unwrap();
        let launcher = ClaudeCliLauncher::with_path(dir.path().join("no-such-claude"));
        let err = launcher.is_available().await.unwrap_err();
        assert!(err.is_not_found());
    }
}
