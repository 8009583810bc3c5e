use super::pump::PumpSink;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use yume_core::{ContentPart, EngineConfig, OutboundFrame, Session, TokenState, TokenTracker};
use yume_execution::{OutboundBatcher, ProcessSlot, StreamingDebouncer, SupervisorSettings};
use yume_interaction::{AgentLauncher, LaunchRequest};

/// Mutable per-session state, guarded by one lock.
///
/// Process events, debounce timers and service calls all go through this
/// lock, which keeps transcript, token totals and emitted events consistent.
pub(crate) struct Conversation {
    pub session: Session,
    pub tokens: TokenTracker,
    /// Generation of the newest spawned process; older ones are stale.
    pub generation: u64,
    pub saw_result: bool,
    pub resume_failed: bool,
    /// Last state of the rolling reply, re-sent as final when the turn ends.
    pub last_reply: Option<(String, Vec<ContentPart>)>,
    pub stderr_tail: VecDeque<String>,
}

impl Conversation {
    pub const STDERR_TAIL_LINES: usize = 20;

    fn new(session: Session, context_window: u64) -> Self {
        Self {
            session,
            tokens: TokenTracker::new(context_window),
            generation: 0,
            saw_result: false,
            resume_failed: false,
            last_reply: None,
            stderr_tail: VecDeque::new(),
        }
    }

    pub fn push_stderr(&mut self, line: String) {
        if self.stderr_tail.len() == Self::STDERR_TAIL_LINES {
            self.stderr_tail.pop_front();
        }
        self.stderr_tail.push_back(line);
    }
}

/// Everything that belongs to one session.
///
/// Removing the context from the registry and calling
/// [`teardown`](Self::teardown) releases the process, timers, queued events
/// and the title task together.
pub struct SessionContext {
    id: String,
    pub(crate) conversation: Mutex<Conversation>,
    pub(crate) slot: ProcessSlot,
    pub(crate) batcher: OutboundBatcher,
    pub(crate) debouncer: StreamingDebouncer,
    title_task: Mutex<Option<CancellationToken>>,
    pub(crate) program: String,
    max_messages: usize,
    max_turns: Option<u32>,
}

impl SessionContext {
    pub fn new(
        session: Session,
        launcher: Arc<dyn AgentLauncher>,
        frames: mpsc::UnboundedSender<OutboundFrame>,
        config: &EngineConfig,
    ) -> Arc<Self> {
        let id = session.id.clone();
        let program = launcher.program();
        Arc::new_cyclic(|weak| {
            let sink = Arc::new(PumpSink::new(weak.clone()));
            Self {
                slot: ProcessSlot::new(
                    id.clone(),
                    launcher,
                    sink,
                    SupervisorSettings::from_config(config),
                ),
                batcher: OutboundBatcher::new(id.clone(), frames, config.batch_window()),
                debouncer: StreamingDebouncer::new(config.debounce()),
                conversation: Mutex::new(Conversation::new(session, config.context_window_tokens)),
                title_task: Mutex::new(None),
                program,
                max_messages: config.max_messages,
                max_turns: config.max_turns,
                id,
            }
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Conversation> {
        self.conversation
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn max_messages(&self) -> usize {
        self.max_messages
    }

    /// Copy of the session entity.
    pub fn snapshot(&self) -> Session {
        self.lock().session.clone()
    }

    pub fn token_state(&self) -> TokenState {
        self.lock().tokens.current()
    }

    pub fn working_directory(&self) -> PathBuf {
        self.lock().session.working_directory.clone()
    }

    /// True while a process for this session is alive.
    pub fn is_busy(&self) -> bool {
        self.slot.is_live()
    }

    pub fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        !self.slot.is_live() && self.lock().session.is_expired(ttl, now)
    }

    /// Launch parameters for the next turn, read at spawn time.
    pub(crate) fn launch_request(&self, model_hint: Option<String>, compact: bool) -> LaunchRequest {
        let mut conversation = self.lock();
        if compact {
            // Earlier turns have delivered their results by now
            conversation.tokens.note_compact_directive();
        }
        let session = &conversation.session;
        LaunchRequest {
            working_directory: session.working_directory.clone(),
            resume_token: session.resume_token.clone(),
            model: model_hint.or_else(|| session.model.clone()),
            disallowed_tools: session.disallowed_tools.iter().cloned().collect(),
            max_turns: self.max_turns,
        }
    }

    /// Cancels any running title task and hands out the token for a new one.
    pub(crate) fn begin_title_task(&self) -> CancellationToken {
        let token = CancellationToken::new();
        let previous = self
            .title_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(token.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }
        token
    }

    pub(crate) fn cancel_title_task(&self) {
        let current = self
            .title_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(token) = current {
            token.cancel();
        }
    }

    /// Stops the process and every timer. The context is unusable afterwards.
    pub async fn teardown(&self) {
        self.cancel_title_task();
        self.debouncer.cancel();
        self.slot.teardown().await;
        self.batcher.discard();
        tracing::info!(session_id = %self.id, "Session torn down");
    }
}
