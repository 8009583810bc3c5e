//! Chat service: the inbound API of the engine.
//!
//! `ChatService` owns the session registry and wires each new session to the
//! shared outbound frame channel. Every operation is addressed by session id
//! and touches only that session's [`SessionContext`].

use crate::session::{SessionContext, SessionRegistry};
use crate::title_service::TitleService;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;
use yume_core::{ChatMessage, EngineConfig, OutboundFrame, Result, Session, TokenState, YumeError};
use yume_execution::{InterruptOutcome, SubmitOutcome};
use yume_interaction::AgentLauncher;

/// Prefix of a user message that asks the CLI to compact its context.
const COMPACT_DIRECTIVE: &str = "/compact";

/// Optional parameters of [`ChatService::create_session`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateSessionOptions {
    /// Client-chosen id; a UUID is generated when absent.
    pub id: Option<String>,
    /// Continue an existing CLI conversation.
    pub resume_token: Option<String>,
    pub disallowed_tools: Vec<String>,
    pub model: Option<String>,
    /// Transcript restored from the client's own storage.
    pub messages: Vec<ChatMessage>,
}

/// Liveness summary of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub sessions: usize,
    pub live_processes: usize,
    pub uptime_secs: u64,
}

pub struct ChatService {
    config: EngineConfig,
    launcher: Arc<dyn AgentLauncher>,
    registry: SessionRegistry,
    frames: mpsc::UnboundedSender<OutboundFrame>,
    titles: TitleService,
    started_at: Instant,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl ChatService {
    /// Creates the service and the receiving end of its outbound frames.
    pub fn new(
        config: EngineConfig,
        launcher: Arc<dyn AgentLauncher>,
    ) -> (Self, mpsc::UnboundedReceiver<OutboundFrame>) {
        let (frames, rx) = mpsc::unbounded_channel();
        let titles = TitleService::new(launcher.clone(), config.title.clone());
        let service = Self {
            config,
            launcher,
            registry: SessionRegistry::new(),
            frames,
            titles,
            started_at: Instant::now(),
            sweeper: Mutex::new(None),
        };
        (service, rx)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Registers a new session and returns its id.
    ///
    /// Creating a session with the id of an existing one replaces it; the old
    /// session's process is stopped first.
    pub async fn create_session(
        &self,
        working_directory: impl Into<PathBuf>,
        options: CreateSessionOptions,
    ) -> Result<String> {
        let working_directory = working_directory.into();
        if !working_directory.is_dir() {
            return Err(YumeError::not_found(
                "working directory",
                working_directory.display().to_string(),
            ));
        }

        let id = options.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut session = Session::new(id.clone(), working_directory);
        session.resume_token = options.resume_token;
        session.disallowed_tools = options.disallowed_tools.into_iter().collect();
        session.model = options.model;
        session.messages = options.messages;
        session.trim_at_turn_boundary(self.config.max_messages);

        let context = SessionContext::new(
            session,
            self.launcher.clone(),
            self.frames.clone(),
            &self.config,
        );
        if let Some(previous) = self.registry.insert(context).await {
            tracing::info!(session_id = %id, "Replacing existing session");
            previous.teardown().await;
        }
        tracing::info!(session_id = %id, "Session created");
        Ok(id)
    }

    /// Sends one user message and starts a turn for it.
    ///
    /// Returns once the turn's process has been started (or the submit was
    /// superseded by an interrupt). Output arrives on the frame channel.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown session, `Spawn` when the CLI cannot start.
    pub async fn send_message(
        &self,
        session_id: &str,
        content: &str,
        model_hint: Option<String>,
    ) -> Result<()> {
        let context = self.context(session_id).await?;

        let compact = content.trim_start().starts_with(COMPACT_DIRECTIVE);
        if compact {
            tracing::info!(session_id, "Compact directive sent");
        }
        let first_message = {
            let mut conversation = context.lock();
            conversation.session.push_message(ChatMessage::user(content));
            conversation.session.was_interrupted = false;
            conversation.session.touch();
            conversation.session.title.is_none() && conversation.session.user_message_count() == 1
        };
        if first_message {
            self.spawn_title_task(&context, content);
        }

        let builder = context.clone();
        let outcome = context
            .slot
            .submit_with(
                move || builder.launch_request(model_hint, compact),
                content.to_string(),
            )
            .await?;
        match outcome {
            SubmitOutcome::Started { generation, pid } => {
                tracing::debug!(session_id, generation, pid, "Message submitted");
            }
            SubmitOutcome::Abandoned | SubmitOutcome::Interrupted => {
                tracing::info!(session_id, ?outcome, "Message dropped by interrupt");
            }
        }
        Ok(())
    }

    /// Stops the current turn. Succeeds whether or not anything was running.
    pub async fn interrupt(&self, session_id: &str) -> Result<()> {
        let context = self.context(session_id).await?;
        context.debouncer.cancel();
        let outcome = context.slot.interrupt().await;
        tracing::info!(session_id, ?outcome, "Interrupt handled");
        // The first interrupt reports to the client; later ones only wait
        if outcome != InterruptOutcome::AlreadyPending {
            context.on_interrupted();
        }
        Ok(())
    }

    /// Kills the current process and forgets the conversation.
    pub async fn clear_session(&self, session_id: &str) -> Result<()> {
        let context = self.context(session_id).await?;
        context.cancel_title_task();
        context.slot.clear().await;
        context.on_cleared();
        tracing::info!(session_id, "Session cleared");
        Ok(())
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        let context = self
            .registry
            .remove(session_id)
            .await
            .ok_or_else(|| YumeError::not_found("session", session_id))?;
        context.teardown().await;
        Ok(())
    }

    pub async fn current_context(&self, session_id: &str) -> Result<TokenState> {
        Ok(self.context(session_id).await?.token_state())
    }

    pub async fn session(&self, session_id: &str) -> Result<Session> {
        Ok(self.context(session_id).await?.snapshot())
    }

    pub async fn health(&self) -> HealthReport {
        let contexts = self.registry.contexts().await;
        HealthReport {
            sessions: contexts.len(),
            live_processes: contexts.iter().filter(|c| c.is_busy()).count(),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }

    /// Starts the idle-session sweeper. Calling it again restarts it.
    pub fn start_gc(&self) {
        let handle = self
            .registry
            .spawn_sweeper(self.config.gc_interval(), self.config.session_ttl());
        let previous = self
            .sweeper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Tears down every session and stops the sweeper.
    pub async fn shutdown(&self) {
        let sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }
        for context in self.registry.contexts().await {
            if let Some(context) = self.registry.remove(context.id()).await {
                context.teardown().await;
            }
        }
    }

    async fn context(&self, session_id: &str) -> Result<Arc<SessionContext>> {
        self.registry
            .get(session_id)
            .await
            .ok_or_else(|| YumeError::not_found("session", session_id))
    }

    fn spawn_title_task(&self, context: &Arc<SessionContext>, first_message: &str) {
        if !self.titles.is_enabled() {
            return;
        }
        let cancel = context.begin_title_task();
        let titles = self.titles.clone();
        let context = context.clone();
        let first_message = first_message.to_string();
        tokio::spawn(async move {
            let working_directory = context.working_directory();
            match titles.generate(&working_directory, &first_message, cancel).await {
                Ok(Some(title)) => {
                    tracing::debug!(session_id = %context.id(), title = %title, "Title generated");
                    context.on_title(title);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(session_id = %context.id(), error = %e, "Title generation failed");
                }
            }
        });
    }
}
