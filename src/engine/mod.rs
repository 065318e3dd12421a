//! Interface to the MQTT client engine that executes the wire protocol
//!
//! The bridge never speaks MQTT itself. Each session owns one engine instance
//! created through an [`EngineFactory`]; commands are issued through
//! [`MqttEngine`] and every completion or unsolicited transition comes back
//! through the session's [`EngineListener`], on whatever task the engine
//! chooses.

pub mod rumqtt;

use crate::config::ConfigError;
use crate::protocol::messages::{PublishOptions, Subscription};
use crate::protocol::options::SessionConfig;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use rumqtt::{RumqttEngine, RumqttEngineFactory};

/// Well-known engine reason codes
pub mod reason {
    /// Generic client failure; usually wraps a more specific cause
    pub const CLIENT_EXCEPTION: i32 = 0;
    /// A SUBACK refused at least one topic filter
    pub const SUBSCRIBE_FAILED: i32 = 128;
    pub const CLIENT_TIMEOUT: i32 = 32000;
    pub const CLIENT_CONNECTED: i32 = 32100;
    pub const CLIENT_DISCONNECTING: i32 = 32102;
    pub const SERVER_CONNECT_ERROR: i32 = 32103;
    pub const NOT_CONNECTED: i32 = 32104;
    pub const CONNECTION_LOST: i32 = 32109;
}

/// Failure raised by an engine, possibly wrapping a deeper cause
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct EngineError {
    pub message: String,
    pub reason_code: i32,
    #[source]
    pub cause: Option<Box<EngineError>>,
    /// Human-readable frames describing where the failure surfaced
    pub frames: Vec<String>,
}

impl EngineError {
    pub fn new<S: Into<String>>(reason_code: i32, message: S) -> Self {
        Self {
            message: message.into(),
            reason_code,
            cause: None,
            frames: Vec::new(),
        }
    }

    /// Wrap `cause` in a generic client failure
    pub fn wrapping(cause: EngineError) -> Self {
        Self {
            message: "MqttException".to_string(),
            reason_code: reason::CLIENT_EXCEPTION,
            cause: Some(Box::new(cause)),
            frames: Vec::new(),
        }
    }

    pub fn with_cause(mut self, cause: EngineError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn with_frames<I, S>(mut self, frames: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.frames = frames.into_iter().map(Into::into).collect();
        self
    }

    /// Build an error from any std error, recording its source chain as frames
    pub fn from_error(reason_code: i32, error: &(dyn std::error::Error + 'static)) -> Self {
        let mut frames = Vec::new();
        let mut source = error.source();
        while let Some(inner) = source {
            frames.push(inner.to_string());
            source = inner.source();
        }
        Self::new(reason_code, error.to_string()).with_frames(frames)
    }

    pub fn not_connected() -> Self {
        Self::new(reason::NOT_CONNECTED, "Client is not connected")
    }

    pub fn already_connected() -> Self {
        Self::new(reason::CLIENT_CONNECTED, "Client is connected")
    }
}

/// Outcome of one SUBSCRIBE, split by topic filter
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeAck {
    pub granted: Vec<String>,
    pub failed: Vec<String>,
}

/// Callbacks the engine raises for a session.
///
/// Called from the engine's own task; implementations must not block.
pub trait EngineListener: Send + Sync {
    fn connect_complete(&self, outcome: Result<(), EngineError>);
    fn subscribe_complete(&self, ack: SubscribeAck);
    /// Topics the broker confirmed as unsubscribed
    fn unsubscribe_complete(&self, confirmed: Vec<String>);
    fn publish_complete(&self, outcome: Result<(), EngineError>);
    fn disconnect_complete(&self, outcome: Result<(), EngineError>);
    fn message_arrived(&self, topic: &str, payload: &[u8]);
    fn connection_lost(&self, error: EngineError);
    /// A connection was re-established without a pending connect command
    fn connection_restored(&self, server_uri: &str);
    /// Failure not tied to any pending command
    fn engine_exception(&self, error: EngineError);
}

/// Commands a session issues against its engine.
///
/// Each method only reports whether the command could be issued; the result
/// arrives later through the [`EngineListener`]. `reconnect` has no completion.
#[async_trait]
pub trait MqttEngine: Send + Sync {
    async fn connect(&self, timeout: Duration) -> Result<(), EngineError>;
    async fn subscribe(&self, subscriptions: &[Subscription]) -> Result<(), EngineError>;
    async fn unsubscribe(&self, topics: &[String]) -> Result<(), EngineError>;
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        options: PublishOptions,
    ) -> Result<(), EngineError>;
    async fn disconnect(&self) -> Result<(), EngineError>;
    async fn reconnect(&self) -> Result<(), EngineError>;
    fn is_connected(&self) -> bool;
    /// Stop all network activity immediately; a later `connect` starts over
    fn halt(&self);
}

/// Builds one engine per session
pub trait EngineFactory: Send + Sync {
    fn create(
        &self,
        config: &SessionConfig,
        listener: Arc<dyn EngineListener>,
    ) -> Result<Arc<dyn MqttEngine>, ConfigError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[derive(Debug, Error)]
    #[error("handshake failed")]
    struct Handshake(#[source] io::Error);

    #[test]
    fn test_from_error_collects_source_chain() {
        let error = Handshake(io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer"));
        let engine = EngineError::from_error(reason::SERVER_CONNECT_ERROR, &error);

        assert_eq!(engine.message, "handshake failed");
        assert_eq!(engine.reason_code, reason::SERVER_CONNECT_ERROR);
        assert_eq!(engine.frames, vec!["reset by peer".to_string()]);
    }

    #[test]
    fn test_wrapping_exposes_cause_as_source() {
        let inner = EngineError::new(reason::CONNECTION_LOST, "Connection lost");
        let outer = EngineError::wrapping(inner);

        assert_eq!(outer.reason_code, reason::CLIENT_EXCEPTION);
        let source = std::error::Error::source(&outer).unwrap();
        assert_eq!(source.to_string(), "Connection lost");
    }

    #[test]
    fn test_canned_errors() {
        assert_eq!(EngineError::not_connected().reason_code, reason::NOT_CONNECTED);
        assert_eq!(
            EngineError::already_connected().reason_code,
            reason::CLIENT_CONNECTED
        );
    }
}
