//! Token and context-size accounting for one session.
//!
//! The CLI reports usage in two shapes. Assistant records carry a per-turn
//! snapshot with the absolute input and cache figures the model saw for that
//! request. Result records carry the cumulative usage of the whole turn. Only
//! per-turn snapshots feed the context estimate.
//!
//! The context estimate is the running maximum of
//! `cache_read + cache_creation + input`. Prompt caches expire between turns and
//! the reported figures then drop close to zero while the history is unchanged,
//! so the maximum over-reports rather than under-reports. It is an
//! approximation, not an accounting identity.

use serde::{Deserialize, Serialize};

/// Which shape of usage report a snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageKind {
    /// Absolute figures for one model request (assistant records).
    PerTurn,
    /// Totals for a whole turn (result records).
    Cumulative,
}

/// Usage numbers as reported by the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub kind: UsageKind,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
}

impl UsageSnapshot {
    pub fn per_turn(input: u64, output: u64, cache_read: u64, cache_creation: u64) -> Self {
        Self {
            kind: UsageKind::PerTurn,
            input_tokens: input,
            output_tokens: output,
            cache_read_tokens: cache_read,
            cache_creation_tokens: cache_creation,
        }
    }

    pub fn cumulative(input: u64, output: u64, cache_read: u64, cache_creation: u64) -> Self {
        Self {
            kind: UsageKind::Cumulative,
            ..Self::per_turn(input, output, cache_read, cache_creation)
        }
    }

    /// Tokens of history plus new input the model consumed.
    pub fn context_size(&self) -> u64 {
        self.cache_read_tokens + self.cache_creation_tokens + self.input_tokens
    }

    pub fn is_zero(&self) -> bool {
        self.context_size() == 0 && self.output_tokens == 0
    }
}

/// Live totals for a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenState {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
    /// Non-decreasing until a compaction resets it to zero.
    pub total_context_tokens: u64,
    pub compaction_count: u32,
    /// Sum of the context sizes discarded by all compactions so far.
    pub tokens_saved_by_compaction: u64,
}

/// Result of feeding one snapshot to the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// Nothing to record.
    Ignored,
    Updated,
    /// The turn was an explicit compaction; counters were reset.
    Compacted { tokens_saved: u64 },
}

/// How full the context window is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextPressure {
    Normal,
    /// At least 55% used.
    Warning,
    /// At least 60% used; a compaction is advisable.
    AutoCompact,
    /// At least 65% used.
    Force,
}

impl ContextPressure {
    pub fn classify(used: u64, window: u64) -> Self {
        if window == 0 {
            return Self::Normal;
        }
        let ratio = used as f64 / window as f64;
        if ratio >= 0.65 {
            Self::Force
        } else if ratio >= 0.60 {
            Self::AutoCompact
        } else if ratio >= 0.55 {
            Self::Warning
        } else {
            Self::Normal
        }
    }
}

/// Per-session accumulator.
#[derive(Debug, Clone)]
pub struct TokenTracker {
    state: TokenState,
    compact_pending: bool,
    context_window: u64,
    reported_pressure: ContextPressure,
}

impl TokenTracker {
    pub fn new(context_window: u64) -> Self {
        Self {
            state: TokenState::default(),
            compact_pending: false,
            context_window,
            reported_pressure: ContextPressure::Normal,
        }
    }

    /// Records that the next turn was started by a compact directive.
    pub fn note_compact_directive(&mut self) {
        self.compact_pending = true;
    }

    pub fn compact_pending(&self) -> bool {
        self.compact_pending
    }

    /// Feeds one usage snapshot. `None` (no usage in the record) is a no-op.
    pub fn observe(&mut self, snapshot: Option<&UsageSnapshot>) -> Observation {
        let Some(snapshot) = snapshot else {
            return Observation::Ignored;
        };

        match snapshot.kind {
            UsageKind::PerTurn => {
                self.state.input_tokens = snapshot.input_tokens;
                self.state.cache_read_tokens = snapshot.cache_read_tokens;
                self.state.cache_creation_tokens = snapshot.cache_creation_tokens;
                self.state.total_context_tokens = self
                    .state
                    .total_context_tokens
                    .max(snapshot.context_size());
                Observation::Updated
            }
            UsageKind::Cumulative if self.compact_pending && snapshot.is_zero() => {
                let tokens_saved = self.state.total_context_tokens;
                let compaction_count = self.state.compaction_count + 1;
                let saved_total = self.state.tokens_saved_by_compaction + tokens_saved;
                self.state = TokenState {
                    compaction_count,
                    tokens_saved_by_compaction: saved_total,
                    ..TokenState::default()
                };
                self.compact_pending = false;
                self.reported_pressure = ContextPressure::Normal;
                tracing::info!(tokens_saved, compaction_count, "Context compaction detected");
                Observation::Compacted { tokens_saved }
            }
            UsageKind::Cumulative => {
                self.state.output_tokens += snapshot.output_tokens;
                self.compact_pending = false;
                Observation::Updated
            }
        }
    }

    pub fn current(&self) -> TokenState {
        self.state
    }

    pub fn pressure(&self) -> ContextPressure {
        ContextPressure::classify(self.state.total_context_tokens, self.context_window)
    }

    /// Returns the pressure level when it rose since the last report.
    pub fn take_pressure_change(&mut self) -> Option<ContextPressure> {
        let pressure = self.pressure();
        if pressure > self.reported_pressure {
            self.reported_pressure = pressure;
            Some(pressure)
        } else {
            None
        }
    }

    /// Drops all totals, including compaction history.
    pub fn reset(&mut self) {
        self.state = TokenState::default();
        self.compact_pending = false;
        self.reported_pressure = ContextPressure::Normal;
    }
}
