//! Session domain module.
//!
//! # Module Structure
//!
//! - `model`: the `Session` entity (one logical conversation)
//! - `message`: transcript entries (`ChatMessage`, `MessageBody`, `ContentPart`)

mod message;
mod model;

pub use message::{ChatMessage, ContentPart, MessageBody};
pub use model::Session;
