//! Application layer for Yume.
//!
//! This crate ties the process supervisor, the stream parser and the session
//! model together into per-session use cases, exposed through
//! [`ChatService`].

pub mod chat_service;
pub mod session;
pub mod title_service;

pub use chat_service::{ChatService, CreateSessionOptions, HealthReport};
pub use session::{SessionContext, SessionRegistry};
pub use title_service::TitleService;
