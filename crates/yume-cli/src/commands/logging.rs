//! Tracing subscriber setup for the binary.

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};
use yume_core::YumePaths;
use yume_execution::{DiagnosticEvent, DiagnosticLayer};

/// Environment variable holding the log filter directives.
pub const LOG_ENV: &str = "YUME_LOG";
const LOG_FILE_PREFIX: &str = "yume.log";

/// Installs the global subscriber.
///
/// Human-readable logs go to stderr, so stdout stays reserved for protocol
/// lines. With `file_logging` a JSON copy is appended to a daily file under
/// [`YumePaths::log_dir`]; keep the returned guard alive until exit or the
/// last lines are lost. When `diagnostics` is given, warnings and errors are
/// also forwarded there.
pub fn init(
    diagnostics: Option<mpsc::UnboundedSender<DiagnosticEvent>>,
    file_logging: bool,
) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = if file_logging {
        let dir = YumePaths::log_dir();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
        let appender = tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = fmt::layer().json().with_writer(writer).with_ansi(false);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .with(diagnostics.map(DiagnosticLayer::new))
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}
