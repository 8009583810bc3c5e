//! Error types for the Yume engine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A shared error type for the engine crates.
///
/// Variants are structured so they can be serialized onto the outbound
/// channel and matched on by the bridge layer.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum YumeError {
    /// Entity not found error with type information
    #[error("Entity not found: {entity_type} '{id}'")]
    NotFound {
        entity_type: &'static str,
        id: String,
    },

    /// The assistant CLI could not be started
    #[error("Failed to spawn '{program}': {message}")]
    Spawn { program: String, message: String },

    /// IO error (pipes, file system)
    #[error("IO error: {message}")]
    Io { message: String },

    /// Serialization/deserialization error
    #[error("Serialization error: {format} - {message}")]
    Serialization {
        format: String, // "TOML", "JSON", etc.
        message: String,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A running child process misbehaved (kill failure, broken stdin, ...)
    #[error("Process error: {0}")]
    Process(String),

    /// The session has been torn down and accepts no more work
    #[error("Session '{id}' is closed")]
    SessionClosed { id: String },

    /// Internal error (should not happen in normal operation)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl YumeError {
    // ============================================================================
    // Constructor helpers
    // ============================================================================

    /// Creates a NotFound error
    pub fn not_found(entity_type: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type,
            id: id.into(),
        }
    }

    /// Creates a Spawn error for the given program
    pub fn spawn(program: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Spawn {
            program: program.into(),
            message: message.into(),
        }
    }

    /// Creates an IO error
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Creates a Config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Creates a Process error
    pub fn process(message: impl Into<String>) -> Self {
        Self::Process(message.into())
    }

    /// Creates a SessionClosed error
    pub fn session_closed(id: impl Into<String>) -> Self {
        Self::SessionClosed { id: id.into() }
    }

    /// Creates an Internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    // ============================================================================
    // Type checking methods
    // ============================================================================

    /// Check if this is a NotFound error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Check if this is a Spawn error
    pub fn is_spawn(&self) -> bool {
        matches!(self, Self::Spawn { .. })
    }

    /// Check if this is a config error
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Check if the session was already closed
    pub fn is_session_closed(&self) -> bool {
        matches!(self, Self::SessionClosed { .. })
    }
}

// ============================================================================
// From implementations for automatic conversion
// ============================================================================

impl From<std::io::Error> for YumeError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: format!("{} (kind: {:?})", err, err.kind()),
        }
    }
}

impl From<serde_json::Error> for YumeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            format: "JSON".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<toml::de::Error> for YumeError {
    fn from(err: toml::de::Error) -> Self {
        Self::Serialization {
            format: "TOML".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<toml::ser::Error> for YumeError {
    fn from(err: toml::ser::Error) -> Self {
        Self::Serialization {
            format: "TOML".to_string(),
            message: err.to_string(),
        }
    }
}

/// A type alias for `Result<T, YumeError>`.
pub type Result<T> = std::result::Result<T, YumeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_error_display() {
        let err = YumeError::spawn("claude", "No such file or directory");
        assert!(err.is_spawn());
        assert_eq!(
            err.to_string(),
            "Failed to spawn 'claude': No such file or directory"
        );
    }

    #[test]
    fn test_io_conversion_keeps_kind() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err: YumeError = io.into();
        match err {
            YumeError::Io { message } => assert!(message.contains("BrokenPipe")),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn test_error_serializes_for_transport() {
        let err = YumeError::not_found("session", "abc");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["NotFound"]["id"], "abc");
    }
}
