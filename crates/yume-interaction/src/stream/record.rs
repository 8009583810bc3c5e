//! Wire shapes of the CLI's `stream-json` records.
//!
//! Every field the engine does not strictly need is optional or defaulted so
//! that CLI upgrades adding or dropping fields do not break decoding.

use serde::Deserialize;
use serde_json::Value;
use yume_core::UsageSnapshot;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct WireUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
}

impl WireUsage {
    pub fn per_turn(&self) -> UsageSnapshot {
        UsageSnapshot::per_turn(
            self.input_tokens,
            self.output_tokens,
            self.cache_read_input_tokens,
            self.cache_creation_input_tokens,
        )
    }

    pub fn cumulative(&self) -> UsageSnapshot {
        UsageSnapshot::cumulative(
            self.input_tokens,
            self.output_tokens,
            self.cache_read_input_tokens,
            self.cache_creation_input_tokens,
        )
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct SystemRecord {
    pub subtype: Option<String>,
    pub session_id: Option<String>,
    pub model: Option<String>,
    pub cwd: Option<String>,
    pub tools: Vec<String>,
    #[serde(rename = "permissionMode")]
    pub permission_mode: Option<String>,
    pub compact_metadata: Option<CompactMetadata>,
    pub message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct CompactMetadata {
    pub trigger: Option<String>,
    pub pre_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum ContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
pub(crate) struct AssistantRecord {
    pub message: AssistantMessage,
    #[serde(default)]
    pub parent_tool_use_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct AssistantMessage {
    #[serde(default)]
    pub id: Option<String>,
    /// Blocks are decoded one by one so a bad block does not drop its siblings.
    #[serde(default)]
    pub content: Vec<Value>,
    #[serde(default)]
    pub usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct UserRecord {
    pub message: UserMessage,
}

/// User content is either plain text or a list of blocks.
#[derive(Debug, Deserialize)]
pub(crate) struct UserMessage {
    #[serde(default)]
    pub content: Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct ResultRecord {
    pub subtype: Option<String>,
    pub is_error: bool,
    pub result: Option<String>,
    pub usage: Option<WireUsage>,
    pub total_cost_usd: Option<f64>,
    pub duration_ms: Option<u64>,
    pub duration_api_ms: Option<u64>,
    pub num_turns: Option<u32>,
    pub session_id: Option<String>,
    pub errors: Vec<Value>,
    pub permission_denials: Vec<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct ErrorRecord {
    pub message: Option<String>,
    pub error: Option<Value>,
}

impl ErrorRecord {
    pub fn text(&self) -> String {
        if let Some(message) = &self.message {
            return message.clone();
        }
        self.error
            .as_ref()
            .map(value_text)
            .unwrap_or_else(|| "Unknown error".to_string())
    }
}

/// Renders an `errors` entry, which may be a string or an object.
pub(crate) fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Object(obj) => obj
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| value.to_string()),
        other => other.to_string(),
    }
}
