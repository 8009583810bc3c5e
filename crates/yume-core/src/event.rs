//! Outbound events delivered to the UI layer.

use crate::session::ContentPart;
use crate::token::{TokenState, UsageSnapshot};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Subtypes of `system` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemSubtype {
    /// The CLI announced a session (resume token, model, tools).
    Init,
    Interrupted,
    Cleared,
    /// The turn is finished and no process is expected to follow.
    StreamEnd,
    /// A generated session title is available.
    Title,
    /// The CLI compacted its context on its own.
    CompactBoundary,
    ContextPressure,
    Info,
}

/// Terminal record of one turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnSummary {
    pub subtype: String,
    pub is_error: bool,
    pub result: Option<String>,
    pub usage: Option<UsageSnapshot>,
    pub total_cost_usd: Option<f64>,
    pub duration_ms: Option<u64>,
    pub duration_api_ms: Option<u64>,
    pub num_turns: Option<u32>,
    /// Session totals after this turn was accounted.
    pub context: TokenState,
    pub compacted: bool,
    pub tokens_saved: Option<u64>,
    pub requires_checkpoint_restore: bool,
}

/// One event on a session's outbound stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundEvent {
    /// The rolling assistant reply. Re-sent with the same id as it grows.
    Assistant {
        message_id: String,
        parts: Vec<ContentPart>,
        streaming: bool,
    },
    ToolUse {
        tool_use_id: String,
        name: String,
        input: Value,
        parent_tool_use_id: Option<String>,
    },
    ToolResult {
        tool_use_id: String,
        content: Value,
        is_error: bool,
    },
    Result(TurnSummary),
    System {
        subtype: SystemSubtype,
        message: Option<String>,
        data: Option<Value>,
    },
    Error {
        message: String,
        requires_checkpoint_restore: bool,
    },
}

impl OutboundEvent {
    pub fn system(subtype: SystemSubtype, message: impl Into<String>) -> Self {
        Self::System {
            subtype,
            message: Some(message.into()),
            data: None,
        }
    }

    pub fn system_with_data(subtype: SystemSubtype, data: Value) -> Self {
        Self::System {
            subtype,
            message: None,
            data: Some(data),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            requires_checkpoint_restore: false,
        }
    }

    /// Error telling the client to restore from its own transcript.
    pub fn checkpoint_restore(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            requires_checkpoint_restore: true,
        }
    }

    /// Priority events bypass batching.
    pub fn is_priority(&self) -> bool {
        match self {
            Self::Error { .. } | Self::Result(_) => true,
            Self::System { subtype, .. } => matches!(
                subtype,
                SystemSubtype::Interrupted | SystemSubtype::Cleared | SystemSubtype::StreamEnd
            ),
            _ => false,
        }
    }
}

/// What one frame carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", content = "data", rename_all = "snake_case")]
pub enum OutboundPayload {
    Single(OutboundEvent),
    Batch(Vec<OutboundEvent>),
}

/// Unit of delivery to the UI transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundFrame {
    pub session_id: String,
    pub payload: OutboundPayload,
}

impl OutboundFrame {
    /// Events in delivery order.
    pub fn events(&self) -> Vec<&OutboundEvent> {
        match &self.payload {
            OutboundPayload::Single(event) => vec![event],
            OutboundPayload::Batch(events) => events.iter().collect(),
        }
    }

    pub fn into_events(self) -> Vec<OutboundEvent> {
        match self.payload {
            OutboundPayload::Single(event) => vec![event],
            OutboundPayload::Batch(events) => events,
        }
    }
}
