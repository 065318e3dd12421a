//! Error taxonomy for the session bridge
//!
//! Configuration problems surface synchronously when a session is created.
//! Everything after creation resolves through a command result and, when
//! the engine raised it, is mirrored on the event bus as an EXCEPTION.

use crate::bridge::correlator::CommandKind;
use crate::config::ConfigError;
use crate::engine::EngineError;
use std::time::Duration;
use thiserror::Error;

/// Main error type for bridge commands
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("{command} failed: {message}")]
    OperationFailed {
        command: CommandKind,
        message: String,
    },

    #[error("{command} timed out after {after:?}")]
    Timeout { command: CommandKind, after: Duration },

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("{command} was cancelled by session teardown")]
    Cancelled { command: CommandKind },
}

impl BridgeError {
    /// Create an operation failure for a command
    pub fn operation_failed<S: Into<String>>(command: CommandKind, message: S) -> Self {
        Self::OperationFailed {
            command,
            message: message.into(),
        }
    }

    /// Create a timeout error for a command
    pub fn timeout(command: CommandKind, after: Duration) -> Self {
        Self::Timeout { command, after }
    }

    /// Create a cancellation error for a command
    pub fn cancelled(command: CommandKind) -> Self {
        Self::Cancelled { command }
    }

    /// The command this error resolved, if it came from one
    pub fn command(&self) -> Option<CommandKind> {
        match self {
            Self::OperationFailed { command, .. }
            | Self::Timeout { command, .. }
            | Self::Cancelled { command } => Some(*command),
            Self::Configuration(_) | Self::Engine(_) => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::reason;

    #[test]
    fn test_operation_failed_message() {
        let error = BridgeError::operation_failed(
            CommandKind::Subscribe,
            "Failed to subscribe to topics: a/b",
        );
        assert_eq!(
            error.to_string(),
            "subscribe failed: Failed to subscribe to topics: a/b"
        );
        assert_eq!(error.command(), Some(CommandKind::Subscribe));
        assert!(!error.is_timeout());
    }

    #[test]
    fn test_timeout_carries_command_and_duration() {
        let error = BridgeError::timeout(CommandKind::Connect, Duration::from_secs(30));
        assert!(error.is_timeout());
        assert_eq!(error.command(), Some(CommandKind::Connect));
        assert!(error.to_string().contains("connect timed out"));
    }

    #[test]
    fn test_config_error_conversion() {
        let error: BridgeError = ConfigError::MissingHost.into();
        assert!(matches!(error, BridgeError::Configuration(ConfigError::MissingHost)));
        assert_eq!(error.command(), None);
    }

    #[test]
    fn test_engine_error_conversion() {
        let engine = EngineError::new(reason::NOT_CONNECTED, "Client is not connected");
        let error: BridgeError = engine.into();
        assert!(error.to_string().contains("Client is not connected"));
        assert_eq!(error.command(), None);
    }

    #[test]
    fn test_cancelled_display() {
        let error = BridgeError::cancelled(CommandKind::Disconnect);
        assert_eq!(
            error.to_string(),
            "disconnect was cancelled by session teardown"
        );
    }
}
