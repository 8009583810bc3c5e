//! Applies process events to a session and turns them into outbound events.
//!
//! Handlers run synchronously on the task that produced the event (the
//! process reader, a debounce timer or a service call) with the conversation
//! lock held, so events leave in the order the session observed them.

use super::context::{Conversation, SessionContext};
use serde_json::json;
use std::sync::{Arc, Weak};
use yume_core::{
    ChatMessage, MessageBody, Observation, OutboundEvent, SystemSubtype, TurnSummary,
};
use yume_execution::{ProcessEvent, ProcessEventSink};
use yume_interaction::{InitInfo, StreamMessage, TurnOutcome, is_resume_failure};

/// Routes supervisor events of one slot into its session.
pub(crate) struct PumpSink {
    context: Weak<SessionContext>,
}

impl PumpSink {
    pub fn new(context: Weak<SessionContext>) -> Self {
        Self { context }
    }
}

impl ProcessEventSink for PumpSink {
    fn emit(&self, event: ProcessEvent) {
        if let Some(context) = self.context.upgrade() {
            context.on_process_event(event);
        }
    }
}

impl SessionContext {
    pub(crate) fn on_process_event(self: &Arc<Self>, event: ProcessEvent) {
        let mut conversation = self.lock();

        if let ProcessEvent::Spawned { generation, pid } = event {
            self.debouncer.cancel();
            // A reply cut short by a replacement or a quick follow-up is final now
            self.finalize_reply(&mut conversation);
            conversation.generation = generation;
            conversation.saw_result = false;
            conversation.resume_failed = false;
            conversation.stderr_tail.clear();
            tracing::debug!(session_id = %self.id(), generation, pid, "Turn started");
            return;
        }

        if event.generation() != conversation.generation {
            tracing::trace!(
                session_id = %self.id(),
                generation = event.generation(),
                current = conversation.generation,
                "Dropping event of superseded process"
            );
            return;
        }

        match event {
            ProcessEvent::Spawned { .. } => {}
            ProcessEvent::Message { message, .. } => self.on_stream_message(&mut conversation, message),
            ProcessEvent::Stderr { line, .. } => {
                if is_resume_failure(&line) && !conversation.resume_failed {
                    self.on_resume_failed(&mut conversation, line.clone());
                }
                conversation.push_stderr(line);
            }
            ProcessEvent::Exited {
                code,
                interrupted,
                superseded,
                ..
            } => {
                conversation.session.touch();
                if superseded {
                    tracing::debug!(session_id = %self.id(), ?code, "Process replaced by a newer turn");
                    self.finalize_reply(&mut conversation);
                } else if !interrupted && !conversation.saw_result && code != Some(0) {
                    let tail: Vec<&str> = conversation.stderr_tail.iter().map(String::as_str).collect();
                    let message = match code {
                        Some(code) => format!("{} exited with code {code}", self.program),
                        None => format!("{} was terminated by a signal", self.program),
                    };
                    let message = if tail.is_empty() {
                        message
                    } else {
                        format!("{message}: {}", tail.join("\n"))
                    };
                    tracing::warn!(session_id = %self.id(), ?code, "Process ended without a result");
                    self.batcher.enqueue(OutboundEvent::error(message));
                }
                if !interrupted {
                    let context = Arc::downgrade(self);
                    self.debouncer.schedule(move |epoch| {
                        if let Some(context) = context.upgrade() {
                            context.on_idle(epoch);
                        }
                    });
                }
            }
        }
    }

    fn on_stream_message(&self, conversation: &mut Conversation, message: StreamMessage) {
        match message {
            StreamMessage::Init(info) => self.on_init(conversation, info),
            StreamMessage::System {
                subtype,
                message,
                data,
            } => {
                let event = if subtype == "compact_boundary" {
                    tracing::info!(session_id = %self.id(), ?data, "CLI compacted its context");
                    OutboundEvent::System {
                        subtype: SystemSubtype::CompactBoundary,
                        message,
                        data: (!data.is_null()).then_some(data),
                    }
                } else {
                    OutboundEvent::System {
                        subtype: SystemSubtype::Info,
                        message,
                        data: Some(json!({ "subtype": subtype, "data": data })),
                    }
                };
                self.batcher.enqueue(event);
            }
            StreamMessage::Usage(snapshot) => {
                conversation.tokens.observe(Some(&snapshot));
                if let Some(level) = conversation.tokens.take_pressure_change() {
                    let state = conversation.tokens.current();
                    tracing::info!(session_id = %self.id(), ?level, total = state.total_context_tokens, "Context pressure rose");
                    self.batcher.enqueue(OutboundEvent::system_with_data(
                        SystemSubtype::ContextPressure,
                        json!({
                            "level": level,
                            "total_context_tokens": state.total_context_tokens,
                        }),
                    ));
                }
            }
            StreamMessage::AssistantReply { id, parts } => {
                conversation.session.upsert_assistant(&id, parts.clone());
                conversation.last_reply = Some((id.clone(), parts.clone()));
                self.batcher.enqueue(OutboundEvent::Assistant {
                    message_id: id,
                    parts,
                    streaming: true,
                });
            }
            StreamMessage::ToolUse {
                id,
                name,
                input,
                parent_tool_use_id,
            } => {
                conversation.session.push_message(ChatMessage::new(
                    id.clone(),
                    MessageBody::ToolUse {
                        tool_use_id: id.clone(),
                        name: name.clone(),
                        input: input.clone(),
                    },
                ));
                self.batcher.enqueue(OutboundEvent::ToolUse {
                    tool_use_id: id,
                    name,
                    input,
                    parent_tool_use_id,
                });
            }
            StreamMessage::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                conversation.session.push_message(ChatMessage::new(
                    format!("{tool_use_id}:result"),
                    MessageBody::ToolResult {
                        tool_use_id: tool_use_id.clone(),
                        content: content.clone(),
                        is_error,
                    },
                ));
                self.batcher.enqueue(OutboundEvent::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                });
            }
            StreamMessage::TurnResult(outcome) => self.on_turn_result(conversation, outcome),
            StreamMessage::ResumeFailed { message } => {
                if !conversation.resume_failed {
                    self.on_resume_failed(conversation, message);
                }
            }
            StreamMessage::Error { message } => {
                tracing::warn!(session_id = %self.id(), message = %message, "CLI reported an error");
                self.batcher.enqueue(OutboundEvent::error(message));
            }
        }
    }

    fn on_init(&self, conversation: &mut Conversation, info: InitInfo) {
        if let Some(token) = &info.resume_token {
            conversation.session.resume_token = Some(token.clone());
        }
        if info.model.is_some() {
            conversation.session.model = info.model.clone();
        }
        tracing::debug!(session_id = %self.id(), model = ?info.model, "CLI session initialized");
        self.batcher.enqueue(OutboundEvent::system_with_data(
            SystemSubtype::Init,
            json!({
                "resume_token": info.resume_token,
                "model": info.model,
                "cwd": info.cwd,
                "tools": info.tools,
                "permission_mode": info.permission_mode,
            }),
        ));
    }

    fn on_turn_result(&self, conversation: &mut Conversation, outcome: TurnOutcome) {
        conversation.saw_result = true;

        let (compacted, tokens_saved) = match conversation.tokens.observe(outcome.usage.as_ref()) {
            Observation::Compacted { tokens_saved } => {
                // The compacted conversation cannot be resumed
                conversation.session.resume_token = None;
                conversation.session.was_compacted = true;
                (true, Some(tokens_saved))
            }
            Observation::Updated | Observation::Ignored => {
                if !conversation.resume_failed
                    && let Some(token) = &outcome.resume_token
                {
                    conversation.session.resume_token = Some(token.clone());
                }
                (false, None)
            }
        };

        conversation.session.push_message(ChatMessage::new(
            uuid::Uuid::new_v4().to_string(),
            MessageBody::TurnResult {
                subtype: outcome.subtype.clone(),
                is_error: outcome.is_error,
                text: outcome.result.clone(),
            },
        ));
        let trimmed = conversation.session.trim_at_turn_boundary(self.max_messages());
        if trimmed > 0 {
            tracing::debug!(session_id = %self.id(), trimmed, "Trimmed transcript");
        }

        if outcome.permission_denials > 0 {
            tracing::info!(session_id = %self.id(), denials = outcome.permission_denials, "Tool calls were denied");
        }

        self.batcher.enqueue(OutboundEvent::Result(TurnSummary {
            subtype: outcome.subtype,
            is_error: outcome.is_error,
            result: outcome.result,
            usage: outcome.usage,
            total_cost_usd: outcome.total_cost_usd,
            duration_ms: outcome.duration_ms,
            duration_api_ms: outcome.duration_api_ms,
            num_turns: outcome.num_turns,
            context: conversation.tokens.current(),
            compacted,
            tokens_saved,
            requires_checkpoint_restore: conversation.resume_failed,
        }));
    }

    fn on_resume_failed(&self, conversation: &mut Conversation, message: String) {
        tracing::warn!(session_id = %self.id(), message = %message, "Resume target is gone, starting fresh next turn");
        conversation.resume_failed = true;
        conversation.session.resume_token = None;
        self.batcher.enqueue(OutboundEvent::checkpoint_restore(message));
    }

    /// Debounce expiry: the turn is over for good.
    pub(crate) fn on_idle(&self, epoch: u64) {
        let mut conversation = self.lock();
        if !self.debouncer.is_current(epoch) || self.slot.is_live() {
            return;
        }
        self.finalize_reply(&mut conversation);
        self.batcher
            .enqueue(OutboundEvent::system(SystemSubtype::StreamEnd, "turn finished"));
        tracing::debug!(session_id = %self.id(), "Session idle");
    }

    pub(crate) fn on_interrupted(&self) {
        let mut conversation = self.lock();
        self.debouncer.cancel();
        conversation.session.was_interrupted = true;
        conversation.session.touch();
        self.finalize_reply(&mut conversation);
        self.batcher
            .enqueue(OutboundEvent::system(SystemSubtype::Interrupted, "interrupted by user"));
    }

    pub(crate) fn on_cleared(&self) {
        let mut conversation = self.lock();
        self.debouncer.cancel();
        self.batcher.discard();
        conversation.session.clear();
        conversation.session.title = None;
        conversation.tokens.reset();
        conversation.last_reply = None;
        conversation.stderr_tail.clear();
        conversation.resume_failed = false;
        self.batcher
            .enqueue(OutboundEvent::system(SystemSubtype::Cleared, "session cleared"));
    }

    pub(crate) fn on_title(&self, title: String) {
        let mut conversation = self.lock();
        conversation.session.title = Some(title.clone());
        self.batcher
            .enqueue(OutboundEvent::system(SystemSubtype::Title, title));
    }

    /// Re-sends the last reply with `streaming: false`.
    fn finalize_reply(&self, conversation: &mut Conversation) {
        if let Some((message_id, parts)) = conversation.last_reply.take() {
            self.batcher.enqueue(OutboundEvent::Assistant {
                message_id,
                parts,
                streaming: false,
            });
        }
    }
}
