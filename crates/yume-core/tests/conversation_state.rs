//! Session and token accounting driven through a multi-turn conversation.

use std::io::Write;
use yume_core::{
    ChatMessage, ContentPart, ContextPressure, EngineConfig, MessageBody, Observation, Session,
    TokenTracker, UsageSnapshot,
};

fn finish_turn(session: &mut Session, n: usize) {
    session.push_message(ChatMessage::new(
        format!("result-{n}"),
        MessageBody::TurnResult {
            subtype: "success".to_string(),
            is_error: false,
            text: Some(format!("answer {n}")),
        },
    ));
}

#[test]
fn test_long_conversation_until_compaction() {
    let mut session = Session::new("s-1", std::env::temp_dir());
    let mut tokens = TokenTracker::new(10_000);
    let mut pressure_changes = Vec::new();

    // Context grows by 1500 tokens per turn; turn 3 hits an expired cache
    let reported = [1_500, 3_000, 200, 6_000, 6_500];
    for (n, context) in reported.into_iter().enumerate() {
        session.push_message(ChatMessage::user(format!("question {n}")));
        tokens.observe(Some(&UsageSnapshot::per_turn(context, 10, 0, 0)));
        if let Some(level) = tokens.take_pressure_change() {
            pressure_changes.push(level);
        }
        session.upsert_assistant(&format!("m-{n}"), vec![ContentPart::text("partial")]);
        session.upsert_assistant(&format!("m-{n}"), vec![ContentPart::text("partial reply")]);
        tokens.observe(Some(&UsageSnapshot::cumulative(context, 10, 0, 0)));
        finish_turn(&mut session, n);
    }

    assert_eq!(tokens.current().total_context_tokens, 6_500);
    assert_eq!(tokens.current().output_tokens, 50);
    assert_eq!(
        pressure_changes,
        vec![ContextPressure::AutoCompact, ContextPressure::Force]
    );
    assert_eq!(session.user_message_count(), 5);
    assert_eq!(session.messages.len(), 15, "Each rolling reply is stored once");

    session.push_message(ChatMessage::user("/compact"));
    tokens.note_compact_directive();
    let observation = tokens.observe(Some(&UsageSnapshot::cumulative(0, 0, 0, 0)));

    assert_eq!(observation, Observation::Compacted { tokens_saved: 6_500 });
    let state = tokens.current();
    assert_eq!(state.total_context_tokens, 0);
    assert_eq!(state.compaction_count, 1);
    assert_eq!(tokens.pressure(), ContextPressure::Normal);

    // Pressure is reported again once the fresh context fills up
    tokens.observe(Some(&UsageSnapshot::per_turn(7_000, 0, 0, 0)));
    assert_eq!(tokens.take_pressure_change(), Some(ContextPressure::Force));
}

#[test]
fn test_trimmed_transcript_starts_with_a_question() {
    let mut session = Session::new("s-2", std::env::temp_dir());
    for n in 0..40 {
        session.push_message(ChatMessage::user(format!("q{n}")));
        session.upsert_assistant(&format!("m-{n}"), vec![ContentPart::text("a")]);
        finish_turn(&mut session, n);
        session.trim_at_turn_boundary(50);
        assert!(session.messages.len() <= 50);
    }
    assert!(session.messages[0].is_user());
    assert!(session.messages.last().is_some_and(ChatMessage::is_turn_result));
}

#[test]
fn test_config_file_overrides_selected_values() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        "cli_path = \"/usr/local/bin/claude\"\nmax_turns = 8\n\n[title]\nenabled = false\n"
    )
    .unwrap();

    let config = EngineConfig::load_from(file.path()).unwrap();
    assert_eq!(config.cli_path, "/usr/local/bin/claude");
    assert_eq!(config.max_turns, Some(8));
    assert!(!config.title.enabled);
    assert_eq!(config.title.max_chars, EngineConfig::default().title.max_chars);
    assert_eq!(config.debounce_ms, EngineConfig::default().debounce_ms);
}
