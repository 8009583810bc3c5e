//! Tracing layer that forwards engine diagnostics to the client.
//!
//! Warnings and errors logged anywhere in the engine (decode failures, kill
//! escalations, buffer overflows) are converted to [`DiagnosticEvent`]s and
//! pushed onto a channel, so a frontend can surface them next to the session
//! they belong to.

use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id, Record};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;

/// One forwarded log record.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DiagnosticEvent {
    /// Module path of the emitting code (e.g. "yume_execution::supervisor::slot")
    pub target: String,
    pub level: String,
    pub message: String,
    /// Structured fields such as `session_id` or `pid`
    pub fields: HashMap<String, Value>,
    /// Fields of the enclosing spans, innermost last
    pub span: HashMap<String, Value>,
    pub timestamp: String,
}

impl DiagnosticEvent {
    /// The session the record was logged for, if it names one.
    pub fn session_id(&self) -> Option<&str> {
        self.fields
            .get("session_id")
            .or_else(|| self.span.get("session_id"))
            .and_then(Value::as_str)
    }
}

/// Sends every event at or above `min_level` to a channel.
pub struct DiagnosticLayer {
    sender: mpsc::UnboundedSender<DiagnosticEvent>,
    min_level: Level,
}

impl DiagnosticLayer {
    /// Forwards WARN and ERROR.
    pub fn new(sender: mpsc::UnboundedSender<DiagnosticEvent>) -> Self {
        Self::with_min_level(sender, Level::WARN)
    }

    pub fn with_min_level(sender: mpsc::UnboundedSender<DiagnosticEvent>, min_level: Level) -> Self {
        Self { sender, min_level }
    }
}

impl<S> Layer<S> for DiagnosticLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else { return };
        let mut fields = HashMap::new();
        attrs.record(&mut FieldVisitor(&mut fields));
        span.extensions_mut().insert(SpanFields(fields));
    }

    fn on_record(&self, id: &Id, values: &Record<'_>, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else { return };
        let mut extensions = span.extensions_mut();
        if let Some(SpanFields(fields)) = extensions.get_mut::<SpanFields>() {
            values.record(&mut FieldVisitor(fields));
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let metadata = event.metadata();
        // Level ordering is by verbosity: ERROR < WARN < INFO
        if *metadata.level() > self.min_level {
            return;
        }

        let mut fields = HashMap::new();
        event.record(&mut FieldVisitor(&mut fields));

        let mut span_fields = HashMap::new();
        if let Some(scope) = ctx.event_scope(event) {
            for span in scope.from_root() {
                if let Some(SpanFields(stored)) = span.extensions().get::<SpanFields>() {
                    span_fields.extend(stored.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
            }
        }

        let message = match fields.remove("message") {
            Some(Value::String(message)) => message,
            Some(other) => other.to_string(),
            None => String::new(),
        };

        let diagnostic = DiagnosticEvent {
            target: metadata.target().to_string(),
            level: metadata.level().to_string(),
            message,
            fields,
            span: span_fields,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        // The receiver going away must never break logging
        let _ = self.sender.send(diagnostic);
    }
}

struct SpanFields(HashMap<String, Value>);

/// Collects tracing fields as JSON values.
struct FieldVisitor<'a>(&'a mut HashMap<String, Value>);

impl Visit for FieldVisitor<'_> {
    fn record_f64(&mut self, field: &Field, value: f64) {
        self.0.insert(field.name().to_string(), serde_json::json!(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.0.insert(field.name().to_string(), Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.0.insert(field.name().to_string(), Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.0.insert(field.name().to_string(), Value::from(value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name().to_string(), Value::from(value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.0
            .insert(field.name().to_string(), Value::from(format!("{value:?}")));
    }
}
