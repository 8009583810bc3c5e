//! Decoding realistic CLI output delivered in awkward chunk sizes.

use yume_core::{ContentPart, UsageKind};
use yume_interaction::{StreamMessage, StreamParser, is_resume_failure};

const COMPACT_TURN: &[&str] = &[
    r#"{"type":"system","subtype":"init","session_id":"sess-9","model":"claude-sonnet-4","cwd":"/repo","tools":[]}"#,
    r#"{"type":"system","subtype":"compact_boundary","compact_metadata":{"trigger":"manual","pre_tokens":91000}}"#,
    r#"{"type":"result","subtype":"success","is_error":false,"result":"","session_id":"sess-9","usage":{"input_tokens":0,"output_tokens":0,"cache_read_input_tokens":0,"cache_creation_input_tokens":0}}"#,
];

const UNICODE_TURN: &[&str] = &[
    r#"{"type":"assistant","message":{"id":"msg_u","content":[{"type":"text","text":"設定ファイルを確認します 🔍"}],"usage":{"input_tokens":3,"output_tokens":9,"cache_read_input_tokens":0,"cache_creation_input_tokens":0}}}"#,
    r#"{"type":"result","subtype":"success","is_error":false,"result":"設定ファイルを確認します 🔍","session_id":"sess-u"}"#,
];

fn feed_in_chunks(lines: &[&str], chunk: usize) -> Vec<StreamMessage> {
    let input: String = lines.iter().map(|line| format!("{line}\n")).collect();
    let mut parser = StreamParser::new(64 * 1024);
    let mut messages = Vec::new();
    for piece in input.as_bytes().chunks(chunk) {
        messages.extend(parser.feed(piece));
    }
    messages.extend(parser.finish());
    messages
}

#[test]
fn test_compaction_turn_reports_zero_cumulative_usage() {
    let messages = feed_in_chunks(COMPACT_TURN, 7);

    assert!(matches!(&messages[0], StreamMessage::Init(info) if info.resume_token.as_deref() == Some("sess-9")));
    assert!(matches!(&messages[1], StreamMessage::System { subtype, .. } if subtype == "compact_boundary"));
    let Some(StreamMessage::TurnResult(outcome)) = messages.last() else {
        panic!("Expected a turn result, got {messages:?}");
    };
    let usage = outcome.usage.expect("Result carries usage");
    assert_eq!(usage.kind, UsageKind::Cumulative);
    assert!(usage.is_zero());
    assert_eq!(outcome.resume_token.as_deref(), Some("sess-9"));
}

#[test]
fn test_multibyte_text_survives_any_chunking() {
    for chunk in [1, 2, 3, 5, 13, 4096] {
        let messages = feed_in_chunks(UNICODE_TURN, chunk);
        let reply = messages.iter().find_map(|message| match message {
            StreamMessage::AssistantReply { parts, .. } => Some(parts.clone()),
            _ => None,
        });
        assert_eq!(
            reply,
            Some(vec![ContentPart::text("設定ファイルを確認します 🔍")]),
            "chunk size {chunk}"
        );
        assert!(matches!(messages.last(), Some(StreamMessage::TurnResult(outcome)) if !outcome.is_error));
    }
}

#[test]
fn test_resume_failure_marker_on_stderr() {
    assert!(is_resume_failure(
        "Error: No conversation found with session ID: 4b1c"
    ));
    assert!(!is_resume_failure("Error: rate limit exceeded"));
}
