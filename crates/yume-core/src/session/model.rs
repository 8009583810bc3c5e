//! Session domain model.

use super::message::{ChatMessage, ContentPart, MessageBody};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

/// One logical conversation with the assistant CLI.
///
/// A session outlives the processes spawned for it: every turn runs in a new
/// child process, and conversational state survives through `resume_token`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Opaque identifier, client-chosen or generated.
    pub id: String,
    /// Directory the child process runs in.
    pub working_directory: PathBuf,
    /// Identifier the CLI accepts with `--resume`. `None` starts a fresh turn.
    pub resume_token: Option<String>,
    /// Bounded transcript, trimmed in bulk at turn boundaries.
    pub messages: Vec<ChatMessage>,
    pub was_interrupted: bool,
    /// Set after a compaction turn; the pre-compaction token is not restorable.
    pub was_compacted: bool,
    pub last_activity: DateTime<Utc>,
    /// Tool names passed to the CLI as `--disallowedTools`.
    pub disallowed_tools: BTreeSet<String>,
    /// Model reported by the last `init` record.
    pub model: Option<String>,
    pub title: Option<String>,
}

impl Session {
    pub fn new(id: impl Into<String>, working_directory: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            working_directory: working_directory.into(),
            resume_token: None,
            messages: Vec::new(),
            was_interrupted: false,
            was_compacted: false,
            last_activity: Utc::now(),
            disallowed_tools: BTreeSet::new(),
            model: None,
            title: None,
        }
    }

    /// Marks the session as active now.
    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    /// Returns true when the session has been idle longer than `ttl` at `now`.
    pub fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => now.signed_duration_since(self.last_activity) > ttl,
            Err(_) => false,
        }
    }

    pub fn push_message(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    /// Inserts or rewrites the rolling assistant reply with the given id.
    pub fn upsert_assistant(&mut self, id: &str, parts: Vec<ContentPart>) {
        if let Some(existing) = self.messages.iter_mut().rev().find(|m| m.id == id) {
            existing.body = MessageBody::Assistant { parts };
            return;
        }
        self.messages
            .push(ChatMessage::new(id, MessageBody::Assistant { parts }));
    }

    pub fn user_message_count(&self) -> usize {
        self.messages.iter().filter(|m| m.is_user()).count()
    }

    /// Trims the oldest messages once the transcript exceeds `max`.
    ///
    /// Must only be called at a turn boundary. Trimming drops a tenth of the
    /// cap at once and then keeps going until the transcript starts with a
    /// user message, so a turn is never split. Returns the number removed.
    pub fn trim_at_turn_boundary(&mut self, max: usize) -> usize {
        if max == 0 || self.messages.len() <= max {
            return 0;
        }
        let target = max - max / 10;
        let mut cut = self.messages.len() - target;
        while cut < self.messages.len() && !self.messages[cut].is_user() {
            cut += 1;
        }
        if cut == self.messages.len() {
            // No turn start left to align on
            cut = self.messages.len() - target;
        }
        self.messages.drain(..cut);
        cut
    }

    /// Resets conversational state. The entity itself stays registered.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.resume_token = None;
        self.was_interrupted = false;
        self.was_compacted = false;
        self.touch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(session: &mut Session, n: usize) {
        session.push_message(ChatMessage::user(format!("question {n}")));
        session.upsert_assistant(&format!("a{n}"), vec![ContentPart::text("answer")]);
        session.push_message(ChatMessage::new(
            format!("r{n}"),
            MessageBody::TurnResult {
                subtype: "success".to_string(),
                is_error: false,
                text: None,
            },
        ));
    }

    #[test]
    fn test_upsert_rewrites_rolling_reply() {
        let mut session = Session::new("s1", "/tmp");
        session.upsert_assistant("msg_1", vec![ContentPart::text("Hel")]);
        session.upsert_assistant("msg_1", vec![ContentPart::text("Hello")]);

        assert_eq!(session.messages.len(), 1);
        assert_eq!(
            session.messages[0].body,
            MessageBody::Assistant {
                parts: vec![ContentPart::text("Hello")]
            }
        );
    }

    #[test]
    fn test_trim_keeps_turns_whole() {
        let mut session = Session::new("s1", "/tmp");
        for n in 0..5 {
            turn(&mut session, n);
        }
        assert_eq!(session.messages.len(), 15);

        let removed = session.trim_at_turn_boundary(10);

        assert!(removed >= 6);
        assert!(session.messages.len() <= 10);
        assert!(session.messages[0].is_user());
    }

    #[test]
    fn test_trim_below_cap_is_noop() {
        let mut session = Session::new("s1", "/tmp");
        turn(&mut session, 0);
        assert_eq!(session.trim_at_turn_boundary(10), 0);
        assert_eq!(session.messages.len(), 3);
    }

    #[test]
    fn test_expiry_uses_last_activity() {
        let mut session = Session::new("s1", "/tmp");
        session.last_activity = Utc::now() - chrono::Duration::hours(25);
        assert!(session.is_expired(Duration::from_secs(86_400), Utc::now()));

        session.touch();
        assert!(!session.is_expired(Duration::from_secs(86_400), Utc::now()));
    }

    #[test]
    fn test_clear_drops_resume_token() {
        let mut session = Session::new("s1", "/tmp");
        session.resume_token = Some("abc".to_string());
        session.was_compacted = true;
        turn(&mut session, 0);

        session.clear();

        assert!(session.messages.is_empty());
        assert!(session.resume_token.is_none());
        assert!(!session.was_compacted);
    }
}
