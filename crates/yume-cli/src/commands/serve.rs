//! `yume serve`: a JSON-lines bridge over stdio.
//!
//! Each stdin line is one request, `{"id": <any>, "op": "<name>", ...}`.
//! Stdout carries three kinds of lines, told apart by `type`:
//!
//! - `response`: the reply to one request, echoing its `id`
//! - `frame`: an outbound frame of some session
//! - `diagnostic`: a forwarded warning or error log record
//!
//! Requests run concurrently, so an `interrupt` is handled while a
//! `send_message` of the same session is still waiting for its process.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use yume_application::{ChatService, CreateSessionOptions};
use yume_core::{EngineConfig, OutboundFrame, YumeError};
use yume_execution::DiagnosticEvent;
use yume_interaction::{AgentLauncher, ClaudeCliLauncher};

const DRAIN_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Deserialize)]
struct Request {
    #[serde(default)]
    id: Value,
    #[serde(flatten)]
    op: Operation,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Operation {
    CreateSession {
        working_directory: PathBuf,
        #[serde(default)]
        options: CreateSessionOptions,
    },
    SendMessage {
        session_id: String,
        content: String,
        #[serde(default)]
        model: Option<String>,
    },
    Interrupt {
        session_id: String,
    },
    ClearSession {
        session_id: String,
    },
    DeleteSession {
        session_id: String,
    },
    Context {
        session_id: String,
    },
    Session {
        session_id: String,
    },
    Health,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Output<'a> {
    Response {
        id: Value,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
    },
    Frame(&'a OutboundFrame),
    Diagnostic(&'a DiagnosticEvent),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
    kind: YumeError,
}

impl Output<'_> {
    fn success(id: Value, result: Value) -> Self {
        Output::Response {
            id,
            ok: true,
            result: (!result.is_null()).then_some(result),
            error: None,
        }
    }

    fn failure(id: Value, error: YumeError) -> Self {
        Output::Response {
            id,
            ok: false,
            result: None,
            error: Some(ErrorBody {
                message: error.to_string(),
                kind: error,
            }),
        }
    }
}

/// Runs the bridge until stdin closes or Ctrl-C is pressed.
///
/// On end of input the bridge waits for running turns to finish and for their
/// final events to go out; Ctrl-C stops every session immediately.
pub async fn run(
    config: EngineConfig,
    diagnostics: Option<mpsc::UnboundedReceiver<DiagnosticEvent>>,
) -> Result<()> {
    let settle = config.debounce() + config.batch_window() * 2;
    let launcher: Arc<dyn AgentLauncher> = Arc::new(ClaudeCliLauncher::from_config(&config));
    launcher
        .is_available()
        .await
        .context("Assistant CLI is not available")?;

    let (service, mut frames) = ChatService::new(config, launcher);
    let service = Arc::new(service);
    service.start_gc();

    let (out, out_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(write_lines(out_rx));

    let frame_out = out.clone();
    let frame_task = tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            emit(&frame_out, &Output::Frame(&frame));
        }
    });
    let diagnostic_task = diagnostics.map(|mut rx| {
        let out = out.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                emit(&out, &Output::Diagnostic(&event));
            }
        })
    });

    tracing::info!("Serving requests on stdin");
    let interrupted = tokio::select! {
        result = read_requests(&service, &out) => {
            result?;
            false
        }
        _ = tokio::signal::ctrl_c() => true,
    };

    if !interrupted {
        drain(&service, settle).await;
    }
    service.shutdown().await;
    tracing::info!("Bridge stopped");

    frame_task.abort();
    if let Some(task) = diagnostic_task {
        task.abort();
    }
    drop(out);
    writer.await.context("Output writer panicked")?;
    Ok(())
}

async fn read_requests(service: &Arc<ChatService>, out: &mpsc::UnboundedSender<String>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut inflight = JoinSet::new();

    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        while inflight.try_join_next().is_some() {}
        if line.trim().is_empty() {
            continue;
        }
        let service = service.clone();
        let out = out.clone();
        inflight.spawn(async move {
            let response = handle_line(&service, &line).await;
            emit(&out, &response);
        });
    }

    while inflight.join_next().await.is_some() {}
    Ok(())
}

/// Waits until no session has a live process, then lets the last idle
/// notifications flush.
async fn drain(service: &ChatService, settle: Duration) {
    loop {
        let health = service.health().await;
        if health.live_processes == 0 {
            break;
        }
        tracing::debug!(live = health.live_processes, "Waiting for running turns");
        tokio::time::sleep(DRAIN_POLL).await;
    }
    tokio::time::sleep(settle).await;
}

async fn handle_line(service: &ChatService, line: &str) -> Output<'static> {
    let request: Request = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!(error = %e, "Rejected malformed request");
            // Salvage the id so the client can still correlate the failure
            let id = serde_json::from_str::<Value>(line)
                .ok()
                .and_then(|value| value.get("id").cloned())
                .unwrap_or(Value::Null);
            return Output::failure(id, e.into());
        }
    };

    let id = request.id;
    match dispatch(service, request.op).await {
        Ok(result) => Output::success(id, result),
        Err(e) => Output::failure(id, e),
    }
}

async fn dispatch(service: &ChatService, op: Operation) -> yume_core::Result<Value> {
    match op {
        Operation::CreateSession {
            working_directory,
            options,
        } => {
            let session_id = service.create_session(working_directory, options).await?;
            Ok(json!({ "session_id": session_id }))
        }
        Operation::SendMessage {
            session_id,
            content,
            model,
        } => {
            service.send_message(&session_id, &content, model).await?;
            Ok(Value::Null)
        }
        Operation::Interrupt { session_id } => {
            service.interrupt(&session_id).await?;
            Ok(Value::Null)
        }
        Operation::ClearSession { session_id } => {
            service.clear_session(&session_id).await?;
            Ok(Value::Null)
        }
        Operation::DeleteSession { session_id } => {
            service.delete_session(&session_id).await?;
            Ok(Value::Null)
        }
        Operation::Context { session_id } => {
            Ok(serde_json::to_value(service.current_context(&session_id).await?)?)
        }
        Operation::Session { session_id } => {
            Ok(serde_json::to_value(service.session(&session_id).await?)?)
        }
        Operation::Health => Ok(serde_json::to_value(service.health().await)?),
    }
}

fn emit(out: &mpsc::UnboundedSender<String>, output: &Output<'_>) {
    match serde_json::to_string(output) {
        Ok(line) => {
            // A closed channel means the writer is gone; nothing left to do
            let _ = out.send(line);
        }
        Err(e) => tracing::error!(error = %e, "Failed to serialize output line"),
    }
}

async fn write_lines(mut rx: mpsc::UnboundedReceiver<String>) {
    let mut stdout = tokio::io::stdout();
    while let Some(mut line) = rx.recv().await {
        line.push('\n');
        if let Err(e) = stdout.write_all(line.as_bytes()).await {
            tracing::warn!(error = %e, "Stdout closed, dropping output");
            break;
        }
        if let Err(e) = stdout.flush().await {
            tracing::warn!(error = %e, "Failed to flush stdout");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_parses_each_operation() {
        let request: Request = serde_json::from_str(
            r#"{"id":1,"op":"create_session","working_directory":"/tmp","options":{"model":"opus"}}"#,
        )
        .unwrap();
        assert_eq!(request.id, json!(1));
        let Operation::CreateSession {
            working_directory,
            options,
        } = request.op
        else {
            panic!("Expected create_session");
        };
        assert_eq!(working_directory, PathBuf::from("/tmp"));
        assert_eq!(options.model.as_deref(), Some("opus"));

        let request: Request =
            serde_json::from_str(r#"{"id":"a","op":"send_message","session_id":"s","content":"hi"}"#)
                .unwrap();
        assert!(matches!(
            request.op,
            Operation::SendMessage { ref session_id, model: None, .. } if session_id == "s"
        ));

        let request: Request = serde_json::from_str(r#"{"op":"health"}"#).unwrap();
        assert_eq!(request.id, Value::Null);
        assert!(matches!(request.op, Operation::Health));
    }

    #[test]
    fn test_unknown_operation_is_rejected() {
        assert!(serde_json::from_str::<Request>(r#"{"id":1,"op":"reboot"}"#).is_err());
        assert!(serde_json::from_str::<Request>(r#"{"id":1,"op":"interrupt"}"#).is_err());
    }

    #[test]
    fn test_failure_response_carries_error_kind() {
        let output = Output::failure(json!(7), YumeError::not_found("session", "s-1"));
        let value = serde_json::to_value(&output).unwrap();
        assert_eq!(value["type"], "response");
        assert_eq!(value["id"], 7);
        assert_eq!(value["ok"], false);
        assert!(value["error"]["message"].as_str().unwrap().contains("s-1"));
        assert_eq!(value["error"]["kind"]["NotFound"]["entity_type"], "session");
        assert!(value.get("result").is_none());
    }

    #[test]
    fn test_success_without_result_omits_field() {
        let value = serde_json::to_value(Output::success(json!("x"), Value::Null)).unwrap();
        assert_eq!(value, json!({"type": "response", "id": "x", "ok": true}));
    }

    #[tokio::test]
    async fn test_malformed_line_keeps_request_id() {
        let (service, _frames) = ChatService::new(
            EngineConfig::default(),
            Arc::new(ClaudeCliLauncher::new()),
        );
        let value = serde_json::to_value(handle_line(&service, r#"{"id":3,"op":"nope"}"#).await).unwrap();
        assert_eq!(value["id"], 3);
        assert_eq!(value["ok"], false);

        let value = serde_json::to_value(handle_line(&service, "not json").await).unwrap();
        assert_eq!(value["id"], Value::Null);
    }

    #[tokio::test]
    async fn test_unknown_session_is_reported_not_raised() {
        let (service, _frames) = ChatService::new(
            EngineConfig::default(),
            Arc::new(ClaudeCliLauncher::new()),
        );
        let line = r#"{"id":1,"op":"interrupt","session_id":"missing"}"#;
        let value = serde_json::to_value(handle_line(&service, line).await).unwrap();
        assert_eq!(value["ok"], false);
        assert!(value["error"]["kind"].get("NotFound").is_some());

        let value = serde_json::to_value(handle_line(&service, r#"{"id":2,"op":"health"}"#).await).unwrap();
        assert_eq!(value["result"]["sessions"], 0);
    }
}
