//! Decoding of `stream-json` records into application messages.

use super::line_buffer::LineBuffer;
use super::record::{
    AssistantRecord, ContentBlock, ErrorRecord, ResultRecord, SystemRecord, UserRecord,
    value_text,
};
use serde_json::{Value, json};
use yume_core::{ContentPart, UsageSnapshot};

const RESUME_FAILURE_MARKER: &str = "No conversation found";

/// Returns true when `text` reports that a `--resume` target does not exist.
pub fn is_resume_failure(text: &str) -> bool {
    text.contains(RESUME_FAILURE_MARKER)
}

/// Session details announced by the CLI's `system/init` record.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InitInfo {
    /// Identifier to pass with `--resume` on the next turn.
    pub resume_token: Option<String>,
    pub model: Option<String>,
    pub cwd: Option<String>,
    pub tools: Vec<String>,
    pub permission_mode: Option<String>,
}

/// End-of-turn details from a `result` record.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TurnOutcome {
    pub subtype: String,
    pub is_error: bool,
    pub result: Option<String>,
    pub usage: Option<UsageSnapshot>,
    pub total_cost_usd: Option<f64>,
    pub duration_ms: Option<u64>,
    pub duration_api_ms: Option<u64>,
    pub num_turns: Option<u32>,
    pub resume_token: Option<String>,
    pub errors: Vec<String>,
    pub permission_denials: usize,
}

/// A discrete message decoded from the stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    Init(InitInfo),
    /// Any other `system` record (`compact_boundary`, hooks, ...).
    System {
        subtype: String,
        message: Option<String>,
        data: Value,
    },
    /// Per-turn usage carried by an assistant record.
    Usage(UsageSnapshot),
    /// Current state of the rolling reply; the same id is re-sent as it grows.
    AssistantReply { id: String, parts: Vec<ContentPart> },
    ToolUse {
        id: String,
        name: String,
        input: Value,
        parent_tool_use_id: Option<String>,
    },
    ToolResult {
        tool_use_id: String,
        content: Value,
        is_error: bool,
    },
    TurnResult(TurnOutcome),
    /// The resume target is gone; the caller must drop its token.
    ResumeFailed { message: String },
    Error { message: String },
}

#[derive(Debug)]
struct RollingReply {
    id: String,
    parts: Vec<ContentPart>,
}

/// Incremental parser for one process's stdout.
///
/// Feed raw chunks in arrival order. Emission order matches byte order.
#[derive(Debug)]
pub struct StreamParser {
    lines: LineBuffer,
    reply: Option<RollingReply>,
}

impl StreamParser {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            lines: LineBuffer::new(max_line_bytes),
            reply: None,
        }
    }

    /// Consumes a chunk and returns the messages it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamMessage> {
        let mut out = Vec::new();
        for line in self.lines.push(chunk) {
            self.decode_line(&line, &mut out);
        }
        out
    }

    /// Decodes the unterminated tail once stdout has closed.
    pub fn finish(&mut self) -> Vec<StreamMessage> {
        let mut out = Vec::new();
        if let Some(line) = self.lines.finish() {
            self.decode_line(&line, &mut out);
        }
        out
    }

    /// Decodes one complete line. Undecodable input is logged and skipped.
    pub fn decode_line(&mut self, line: &str, out: &mut Vec<StreamMessage>) {
        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(error = %e, line = %preview(line), "Skipping undecodable line");
                return;
            }
        };

        let Some(kind) = value.get("type").and_then(Value::as_str).map(str::to_string) else {
            tracing::debug!(line = %preview(line), "Record without type");
            return;
        };

        let decoded = match kind.as_str() {
            "system" => serde_json::from_value::<SystemRecord>(value).map(|r| self.on_system(r, out)),
            "assistant" => serde_json::from_value::<AssistantRecord>(value).map(|r| self.on_assistant(r, out)),
            "user" => serde_json::from_value::<UserRecord>(value).map(|r| on_user(r, out)),
            "result" => serde_json::from_value::<ResultRecord>(value).map(|r| self.on_result(r, out)),
            "error" => serde_json::from_value::<ErrorRecord>(value).map(|r| on_error(r, out)),
            "stream_event" => {
                tracing::trace!("Ignoring partial stream event");
                Ok(())
            }
            other => {
                tracing::debug!(record_type = other, "Ignoring unknown record type");
                Ok(())
            }
        };

        if let Err(e) = decoded {
            tracing::warn!(record_type = %kind, error = %e, "Skipping malformed record");
        }
    }

    fn on_system(&mut self, record: SystemRecord, out: &mut Vec<StreamMessage>) {
        let subtype = record.subtype.unwrap_or_else(|| "unknown".to_string());
        if subtype == "init" {
            out.push(StreamMessage::Init(InitInfo {
                resume_token: record.session_id,
                model: record.model,
                cwd: record.cwd,
                tools: record.tools,
                permission_mode: record.permission_mode,
            }));
            return;
        }

        let data = match record.compact_metadata {
            Some(meta) => json!({ "trigger": meta.trigger, "pre_tokens": meta.pre_tokens }),
            None => Value::Null,
        };
        out.push(StreamMessage::System {
            subtype,
            message: record.message,
            data,
        });
    }

    fn on_assistant(&mut self, record: AssistantRecord, out: &mut Vec<StreamMessage>) {
        let message = record.message;
        if let Some(usage) = &message.usage {
            out.push(StreamMessage::Usage(usage.per_turn()));
        }

        let mut dirty = false;
        let blocks = message.content.into_iter().filter_map(|block| {
            serde_json::from_value::<ContentBlock>(block)
                .map_err(|e| tracing::debug!(error = %e, "Skipping malformed assistant block"))
                .ok()
        });
        for block in blocks {
            match block {
                ContentBlock::Text { text } => {
                    self.append(message.id.as_deref(), ContentPart::Text { text });
                    dirty = true;
                }
                ContentBlock::Thinking { thinking } => {
                    self.append(message.id.as_deref(), ContentPart::Thinking { thinking });
                    dirty = true;
                }
                ContentBlock::ToolUse { id, name, input } => {
                    // Text written before the call goes out first
                    if dirty {
                        out.push(self.reply_snapshot());
                        dirty = false;
                    }
                    out.push(StreamMessage::ToolUse {
                        id,
                        name,
                        input,
                        parent_tool_use_id: record.parent_tool_use_id.clone(),
                    });
                }
                ContentBlock::ToolResult { .. } | ContentBlock::Unknown => {}
            }
        }
        if dirty {
            out.push(self.reply_snapshot());
        }
    }

    fn on_result(&mut self, record: ResultRecord, out: &mut Vec<StreamMessage>) {
        self.reply = None;

        let errors: Vec<String> = record.errors.iter().map(value_text).collect();
        let failed_resume = errors.iter().find(|e| is_resume_failure(e)).cloned().or_else(|| {
            record
                .result
                .as_deref()
                .filter(|text| record.is_error && is_resume_failure(text))
                .map(str::to_string)
        });
        if let Some(message) = failed_resume {
            out.push(StreamMessage::ResumeFailed { message });
        }

        out.push(StreamMessage::TurnResult(TurnOutcome {
            subtype: record.subtype.unwrap_or_else(|| "unknown".to_string()),
            is_error: record.is_error,
            result: record.result,
            usage: record.usage.as_ref().map(|u| u.cumulative()),
            total_cost_usd: record.total_cost_usd,
            duration_ms: record.duration_ms,
            duration_api_ms: record.duration_api_ms,
            num_turns: record.num_turns,
            resume_token: record.session_id,
            errors,
            permission_denials: record.permission_denials.len(),
        }));
    }

    fn append(&mut self, message_id: Option<&str>, part: ContentPart) {
        let reply = self.reply.get_or_insert_with(|| RollingReply {
            id: message_id
                .map(str::to_string)
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            parts: Vec::new(),
        });
        reply.parts.push(part);
    }

    fn reply_snapshot(&self) -> StreamMessage {
        match &self.reply {
            Some(reply) => StreamMessage::AssistantReply {
                id: reply.id.clone(),
                parts: reply.parts.clone(),
            },
            None => StreamMessage::AssistantReply {
                id: uuid::Uuid::new_v4().to_string(),
                parts: Vec::new(),
            },
        }
    }
}

fn on_user(record: UserRecord, out: &mut Vec<StreamMessage>) {
    let Value::Array(blocks) = record.message.content else {
        // Plain-text user echoes carry nothing the client does not already have
        return;
    };
    for block in blocks {
        match serde_json::from_value::<ContentBlock>(block) {
            Ok(ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            }) => out.push(StreamMessage::ToolResult {
                tool_use_id,
                content,
                is_error,
            }),
            Ok(_) => {}
            Err(e) => tracing::debug!(error = %e, "Skipping malformed user block"),
        }
    }
}

fn on_error(record: ErrorRecord, out: &mut Vec<StreamMessage>) {
    let message = record.text();
    if is_resume_failure(&message) {
        out.push(StreamMessage::ResumeFailed { message });
    } else {
        out.push(StreamMessage::Error { message });
    }
}

fn preview(line: &str) -> String {
    const MAX: usize = 200;
    if line.len() <= MAX {
        return line.to_string();
    }
    let mut end = MAX;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... ({} bytes)", &line[..end], line.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    const INIT: &str = r#"{"type":"system","subtype":"init","session_id":"sess-1","model":"claude-sonnet-4","cwd":"/work","tools":["Bash","Read"],"permissionMode":"default"}"#;
    const TEXT_1: &str = r#"{"type":"assistant","message":{"id":"msg_1","content":[{"type":"thinking","thinking":"Let me look"},{"type":"text","text":"Checking files."}],"usage":{"input_tokens":12,"output_tokens":4,"cache_read_input_tokens":100,"cache_creation_input_tokens":50}}}"#;
    const TOOL: &str = r#"{"type":"assistant","message":{"id":"msg_1","content":[{"type":"tool_use","id":"tu_1","name":"Bash","input":{"command":"ls"}}]}}"#;
    const TOOL_RESULT: &str = r#"{"type":"user","message":{"role":"user","content":[{"type":"tool_result","tool_use_id":"tu_1","content":"Cargo.toml\nsrc","is_error":false}]}}"#;
    const TEXT_2: &str = r#"{"type":"assistant","message":{"id":"msg_2","content":[{"type":"text","text":"Found two entries."}]}}"#;
    const RESULT: &str = r#"{"type":"result","subtype":"success","is_error":false,"result":"Found two entries.","usage":{"input_tokens":40,"output_tokens":30,"cache_read_input_tokens":200,"cache_creation_input_tokens":50},"total_cost_usd":0.0123,"duration_ms":1500,"duration_api_ms":1200,"num_turns":2,"session_id":"sess-1"}"#;

    fn transcript() -> String {
        [INIT, TEXT_1, TOOL, TOOL_RESULT, TEXT_2, RESULT]
            .iter()
            .map(|line| format!("{line}\n"))
            .collect()
    }

    fn parse_all(input: &str) -> Vec<StreamMessage> {
        let mut parser = StreamParser::new(1024 * 1024);
        let mut out = parser.feed(input.as_bytes());
        out.extend(parser.finish());
        out
    }

    #[test]
    fn test_full_turn_reconstruction() {
        let messages = parse_all(&transcript());

        assert!(matches!(
            &messages[0],
            StreamMessage::Init(info) if info.resume_token.as_deref() == Some("sess-1")
                && info.tools == vec!["Bash", "Read"]
                && info.permission_mode.as_deref() == Some("default")
        ));
        assert_eq!(
            messages[1],
            StreamMessage::Usage(UsageSnapshot::per_turn(12, 4, 100, 50))
        );
        assert_eq!(
            messages[2],
            StreamMessage::AssistantReply {
                id: "msg_1".to_string(),
                parts: vec![
                    ContentPart::thinking("Let me look"),
                    ContentPart::text("Checking files."),
                ],
            }
        );
        assert!(matches!(&messages[3], StreamMessage::ToolUse { id, name, .. } if id == "tu_1" && name == "Bash"));
        assert!(matches!(&messages[4], StreamMessage::ToolResult { tool_use_id, is_error: false, .. } if tool_use_id == "tu_1"));
        // Later API calls in the same turn extend the same rolling reply
        assert_eq!(
            messages[5],
            StreamMessage::AssistantReply {
                id: "msg_1".to_string(),
                parts: vec![
                    ContentPart::thinking("Let me look"),
                    ContentPart::text("Checking files."),
                    ContentPart::text("Found two entries."),
                ],
            }
        );
        match &messages[6] {
            StreamMessage::TurnResult(outcome) => {
                assert_eq!(outcome.subtype, "success");
                assert_eq!(outcome.usage, Some(UsageSnapshot::cumulative(40, 30, 200, 50)));
                assert_eq!(outcome.total_cost_usd, Some(0.0123));
                assert_eq!(outcome.num_turns, Some(2));
                assert_eq!(outcome.resume_token.as_deref(), Some("sess-1"));
            }
            other => panic!("expected turn result, got {other:?}"),
        }
        assert_eq!(messages.len(), 7);
    }

    #[test]
    fn test_every_split_point_yields_same_messages() {
        let input = transcript();
        let bytes = input.as_bytes();
        let expected = parse_all(&input).len();

        for split in 0..=bytes.len() {
            let mut parser = StreamParser::new(1024 * 1024);
            let mut out = parser.feed(&bytes[..split]);
            out.extend(parser.feed(&bytes[split..]));
            out.extend(parser.finish());

            assert_eq!(out.len(), expected, "split at byte {split}");
            assert!(matches!(out[0], StreamMessage::Init(_)), "split at byte {split}");
            assert!(matches!(out[expected - 1], StreamMessage::TurnResult(_)), "split at byte {split}");
        }
    }

    #[test]
    fn test_byte_at_a_time_preserves_order() {
        let input = transcript();
        let mut parser = StreamParser::new(1024 * 1024);
        let mut out = Vec::new();
        for byte in input.as_bytes() {
            out.extend(parser.feed(std::slice::from_ref(byte)));
        }
        assert_eq!(out, parse_all(&input));
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let input = format!("not json\n{{\"type\":\"assistant\"}}\n{{\"no_type\":1}}\n{RESULT}\n");
        let messages = parse_all(&input);
        assert_eq!(messages.len(), 1);
        assert!(matches!(messages[0], StreamMessage::TurnResult(_)));
    }

    #[test]
    fn test_text_around_tool_use_keeps_order() {
        let line = r#"{"type":"assistant","message":{"id":"m","content":[{"type":"text","text":"Before"},{"type":"tool_use","id":"t","name":"Read","input":{}},{"type":"text","text":"After"}]}}"#;
        let messages = parse_all(&format!("{line}\n"));

        assert_eq!(messages.len(), 3);
        assert!(matches!(&messages[0], StreamMessage::AssistantReply { parts, .. } if parts.len() == 1));
        assert!(matches!(messages[1], StreamMessage::ToolUse { .. }));
        assert!(matches!(&messages[2], StreamMessage::AssistantReply { parts, .. } if parts.len() == 2));
    }

    #[test]
    fn test_malformed_block_keeps_rest_of_record() {
        let line = r#"{"type":"assistant","message":{"id":"m","content":[{"type":"text","text":"Kept"},{"type":"tool_use","id":"t"}],"usage":{"input_tokens":7,"output_tokens":1,"cache_read_input_tokens":0,"cache_creation_input_tokens":0}}}"#;
        let messages = parse_all(&format!("{line}\n"));

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], StreamMessage::Usage(UsageSnapshot::per_turn(7, 1, 0, 0)));
        assert_eq!(
            messages[1],
            StreamMessage::AssistantReply {
                id: "m".to_string(),
                parts: vec![ContentPart::text("Kept")],
            }
        );
    }

    #[test]
    fn test_result_resets_rolling_reply() {
        let next = r#"{"type":"assistant","message":{"id":"msg_9","content":[{"type":"text","text":"New turn"}]}}"#;
        let messages = parse_all(&format!("{TEXT_1}\n{RESULT}\n{next}\n"));
        assert!(matches!(messages.last(), Some(StreamMessage::AssistantReply { id, parts }) if id == "msg_9" && parts.len() == 1));
    }

    #[test]
    fn test_resume_failure_detected_in_result_errors() {
        let line = r#"{"type":"result","subtype":"error_during_execution","is_error":true,"errors":["No conversation found with session ID: abc"]}"#;
        let messages = parse_all(&format!("{line}\n"));

        assert!(matches!(&messages[0], StreamMessage::ResumeFailed { message } if message.contains("abc")));
        assert!(matches!(&messages[1], StreamMessage::TurnResult(outcome) if outcome.is_error));
    }

    #[test]
    fn test_error_record() {
        let messages = parse_all(
            "{\"type\":\"error\",\"error\":{\"message\":\"rate limited\"}}\n{\"type\":\"error\",\"message\":\"No conversation found with session ID: x\"}\n",
        );
        assert_eq!(
            messages[0],
            StreamMessage::Error {
                message: "rate limited".to_string()
            }
        );
        assert!(matches!(messages[1], StreamMessage::ResumeFailed { .. }));
    }

    #[test]
    fn test_compact_boundary_is_forwarded() {
        let line = r#"{"type":"system","subtype":"compact_boundary","compact_metadata":{"trigger":"auto","pre_tokens":150000}}"#;
        let messages = parse_all(&format!("{line}\n"));
        assert_eq!(
            messages[0],
            StreamMessage::System {
                subtype: "compact_boundary".to_string(),
                message: None,
                data: json!({ "trigger": "auto", "pre_tokens": 150000 }),
            }
        );
    }
}
