//! Per-session child-process supervision.
//!
//! Every session owns one [`ProcessSlot`]. All lifecycle transitions of that
//! session go through the slot, which keeps a small state machine per process:
//!
//! ```text
//! Idle ──submit──▶ Spawning ──registered──▶ Running ──interrupt──▶ Draining
//!  ▲                  │ aborted                 │ exit                │ exit
//!  └──────────────────┴─────────────────────────┴─────────────────────┘
//! ```
//!
//! Output of the running process is decoded on a background task and handed
//! to a [`ProcessEventSink`] tagged with the process generation.

mod signal;
mod slot;

pub use slot::ProcessSlot;

use std::time::Duration;
use yume_core::EngineConfig;
use yume_interaction::StreamMessage;

/// Timing and buffer limits for a slot.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// A live process younger than this is left alone by a new submit.
    pub spawn_grace: Duration,
    /// SIGTERM to SIGKILL escalation delay.
    pub kill_grace: Duration,
    /// How long to wait for the process to be reaped after SIGKILL.
    pub post_kill_wait: Duration,
    pub max_line_bytes: usize,
}

impl SupervisorSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            spawn_grace: config.spawn_grace(),
            kill_grace: config.kill_grace(),
            post_kill_wait: config.post_kill_wait(),
            max_line_bytes: config.max_line_buffer_bytes,
        }
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// Something that happened to a supervised process.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEvent {
    Spawned {
        generation: u64,
        pid: u32,
    },
    Message {
        generation: u64,
        message: StreamMessage,
    },
    Stderr {
        generation: u64,
        line: String,
    },
    /// Emitted after every message of the process has been delivered.
    Exited {
        generation: u64,
        code: Option<i32>,
        /// The process was stopped by `interrupt`.
        interrupted: bool,
        /// A newer submit replaced the process before it finished.
        superseded: bool,
    },
}

impl ProcessEvent {
    pub fn generation(&self) -> u64 {
        match self {
            Self::Spawned { generation, .. }
            | Self::Message { generation, .. }
            | Self::Stderr { generation, .. }
            | Self::Exited { generation, .. } => *generation,
        }
    }
}

/// Receiver of process events. Must not block.
pub trait ProcessEventSink: Send + Sync + 'static {
    fn emit(&self, event: ProcessEvent);
}

impl ProcessEventSink for tokio::sync::mpsc::UnboundedSender<ProcessEvent> {
    fn emit(&self, event: ProcessEvent) {
        // A closed receiver means the session is gone
        let _ = self.send(event);
    }
}

/// How a `submit` call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Started { generation: u64, pid: u32 },
    /// An interrupt arrived while the submit was waiting in the queue.
    Abandoned,
    /// An interrupt arrived while the process was being spawned; nothing runs.
    Interrupted,
}

/// How an `interrupt` call ended. Every variant counts as success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptOutcome {
    /// Nothing was running.
    Idle,
    /// The running process was terminated and has exited.
    Killed { generation: u64 },
    /// A spawn in progress was aborted before its process could run.
    AbortedSpawn,
    /// Another interrupt is already handling the current process.
    AlreadyPending,
}
