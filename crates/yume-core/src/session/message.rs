//! Transcript entries reconstructed from the assistant's event stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One textual segment of an assistant reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Thinking { thinking: String },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn thinking(thinking: impl Into<String>) -> Self {
        Self::Thinking {
            thinking: thinking.into(),
        }
    }
}

/// What a transcript entry carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageBody {
    /// Input typed by the user.
    User { content: String },
    /// Rolling assistant reply; rewritten in place while the turn streams.
    Assistant { parts: Vec<ContentPart> },
    /// A tool invocation requested by the assistant.
    ToolUse {
        tool_use_id: String,
        name: String,
        input: Value,
    },
    /// The output of a tool invocation.
    ToolResult {
        tool_use_id: String,
        content: Value,
        is_error: bool,
    },
    /// End-of-turn marker.
    TurnResult {
        subtype: String,
        is_error: bool,
        text: Option<String>,
    },
}

/// A single entry in a session transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub body: MessageBody,
}

impl ChatMessage {
    /// Creates a message stamped with the current time.
    pub fn new(id: impl Into<String>, body: MessageBody) -> Self {
        Self {
            id: id.into(),
            timestamp: Utc::now(),
            body,
        }
    }

    /// Creates a user message with a generated id.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(
            uuid::Uuid::new_v4().to_string(),
            MessageBody::User {
                content: content.into(),
            },
        )
    }

    pub fn is_user(&self) -> bool {
        matches!(self.body, MessageBody::User { .. })
    }

    pub fn is_turn_result(&self) -> bool {
        matches!(self.body, MessageBody::TurnResult { .. })
    }
}
