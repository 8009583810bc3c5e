//! Title Service
//!
//! Generates a short session title from the first user message by running
//! the assistant CLI once, outside the session's own process slot.

use anyhow::{Context, Result, bail};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use yume_core::TitleConfig;
use yume_interaction::{AgentLauncher, LaunchRequest, StreamMessage, StreamParser};

/// Prompt content beyond this many characters is not sent.
const MAX_PROMPT_SOURCE_CHARS: usize = 500;
const TITLE_TIMEOUT: Duration = Duration::from_secs(60);
const TITLE_LINE_LIMIT: usize = 1024 * 1024;

/// Runs title generations. Cheap to clone.
#[derive(Clone)]
pub struct TitleService {
    launcher: Arc<dyn AgentLauncher>,
    config: TitleConfig,
}

impl TitleService {
    pub fn new(launcher: Arc<dyn AgentLauncher>, config: TitleConfig) -> Self {
        Self { launcher, config }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Generates a title for a conversation that starts with `first_message`.
    ///
    /// # Arguments
    ///
    /// * `working_directory` - Directory the CLI runs in
    /// * `first_message` - The first user message of the session
    /// * `cancel` - Cancelling kills the CLI process and returns `Ok(None)`
    ///
    /// # Returns
    ///
    /// * `Ok(Some(title))` - A cleaned title of at most `max_chars` characters
    /// * `Ok(None)` - Cancelled, or the CLI produced no usable text
    pub async fn generate(
        &self,
        working_directory: &Path,
        first_message: &str,
        cancel: CancellationToken,
    ) -> Result<Option<String>> {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("Title generation cancelled");
                Ok(None)
            }
            result = tokio::time::timeout(TITLE_TIMEOUT, self.run(working_directory, first_message)) => {
                let text = result.context("Title generation timed out")??;
                Ok(text.and_then(|text| clean_title(&text, self.config.max_chars)))
            }
        }
    }

    async fn run(&self, working_directory: &Path, first_message: &str) -> Result<Option<String>> {
        let request = LaunchRequest {
            working_directory: working_directory.to_path_buf(),
            model: self.config.model.clone(),
            max_turns: Some(1),
            ..LaunchRequest::default()
        };

        let mut cmd = self.launcher.command(&request);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {} for title", self.launcher.program()))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(title_prompt(first_message, self.config.max_chars).as_bytes())
                .await
                .context("Failed to write title prompt")?;
            stdin.shutdown().await.context("Failed to close stdin")?;
        }

        let Some(mut stdout) = child.stdout.take() else {
            bail!("Title process has no stdout");
        };
        let mut output = Vec::new();
        stdout
            .read_to_end(&mut output)
            .await
            .context("Failed to read title output")?;
        let status = child.wait().await.context("Failed to wait for title process")?;

        let mut parser = StreamParser::new(TITLE_LINE_LIMIT);
        let mut messages = parser.feed(&output);
        messages.extend(parser.finish());

        let text = messages.into_iter().rev().find_map(|message| match message {
            StreamMessage::TurnResult(outcome) if !outcome.is_error => outcome.result,
            _ => None,
        });
        if text.is_none() {
            tracing::debug!(?status, "Title process produced no result");
        }
        Ok(text)
    }
}

fn title_prompt(first_message: &str, max_chars: usize) -> String {
    let source: String = first_message.chars().take(MAX_PROMPT_SOURCE_CHARS).collect();
    format!(
        "Generate a concise title (max {max_chars} characters) for a conversation that starts with: {source}\n\n\
         Reply with the title only, without quotes or punctuation at the end."
    )
}

/// First non-empty line, surrounding quotes removed, capped at `max_chars`.
fn clean_title(text: &str, max_chars: usize) -> Option<String> {
    let line = text.lines().map(str::trim).find(|line| !line.is_empty())?;
    let line = line
        .strip_prefix("Title:")
        .or_else(|| line.strip_prefix("title:"))
        .unwrap_or(line)
        .trim()
        .trim_matches(|c: char| matches!(c, '"' | '\'' | '`' | '*'))
        .trim();
    if line.is_empty() {
        return None;
    }
    let title: String = line.chars().take(max_chars).collect();
    Some(title.trim_end().to_string())
}
