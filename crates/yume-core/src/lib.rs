//! Domain layer for Yume.
//!
//! Holds the session model, token accounting, outbound event types and the
//! shared error and configuration types used by every other crate.

pub mod config;
pub mod error;
pub mod event;
pub mod session;
pub mod token;

pub use config::{EngineConfig, TitleConfig, YumePaths};
pub use error::{Result, YumeError};
pub use event::{OutboundEvent, OutboundFrame, OutboundPayload, SystemSubtype, TurnSummary};
pub use session::{ChatMessage, ContentPart, MessageBody, Session};
pub use token::{ContextPressure, Observation, TokenState, TokenTracker, UsageKind, UsageSnapshot};
