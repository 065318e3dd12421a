//! Events published on the shared event channel
//!
//! Every event is stamped with the reference of the session that raised it.
//! `CLIENT_REF_UNKNOWN` is the exception: it carries the reference the caller
//! asked for, which resolved to nothing. Payload bytes travel as base64 text.

use crate::bridge::registry::ClientReference;
use crate::protocol::messages::encode_payload;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Discriminant of [`BridgeEvent`], used to key caller handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Connecting,
    Connected,
    ConnectionLost,
    ConnectionComplete,
    Subscribed,
    Unsubscribed,
    MessageReceived,
    MessagePublished,
    Disconnected,
    Closed,
    Exception,
    ClientRefUnknown,
}

impl EventKind {
    pub const ALL: [EventKind; 12] = [
        EventKind::Connecting,
        EventKind::Connected,
        EventKind::ConnectionLost,
        EventKind::ConnectionComplete,
        EventKind::Subscribed,
        EventKind::Unsubscribed,
        EventKind::MessageReceived,
        EventKind::MessagePublished,
        EventKind::Disconnected,
        EventKind::Closed,
        EventKind::Exception,
        EventKind::ClientRefUnknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Connecting => "CONNECTING",
            EventKind::Connected => "CONNECTED",
            EventKind::ConnectionLost => "CONNECTION_LOST",
            EventKind::ConnectionComplete => "CONNECTION_COMPLETE",
            EventKind::Subscribed => "SUBSCRIBED",
            EventKind::Unsubscribed => "UNSUBSCRIBED",
            EventKind::MessageReceived => "MESSAGE_RECEIVED",
            EventKind::MessagePublished => "MESSAGE_PUBLISHED",
            EventKind::Disconnected => "DISCONNECTED",
            EventKind::Closed => "CLOSED",
            EventKind::Exception => "EXCEPTION",
            EventKind::ClientRefUnknown => "CLIENT_REF_UNKNOWN",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized engine failure carried by CONNECTION_LOST and EXCEPTION
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(rename = "errMessage")]
    pub error_message: String,
    #[serde(rename = "errCode")]
    pub error_code: i32,
    /// Newline-joined frames; empty when the engine supplied none
    #[serde(rename = "stackTrace")]
    pub stack_trace: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum BridgeEvent {
    Connecting {
        client_ref: ClientReference,
    },
    Connected {
        client_ref: ClientReference,
    },
    ConnectionLost {
        client_ref: ClientReference,
        #[serde(flatten)]
        error: ErrorPayload,
    },
    ConnectionComplete {
        client_ref: ClientReference,
        server_uri: String,
        reconnect: bool,
    },
    Subscribed {
        client_ref: ClientReference,
        topic: String,
    },
    Unsubscribed {
        client_ref: ClientReference,
        topic: String,
    },
    MessageReceived {
        client_ref: ClientReference,
        topic: String,
        /// base64
        payload: String,
    },
    MessagePublished {
        client_ref: ClientReference,
        topic: String,
        /// base64
        payload: String,
    },
    Disconnected {
        client_ref: ClientReference,
    },
    Closed {
        client_ref: ClientReference,
    },
    Exception {
        client_ref: ClientReference,
        #[serde(flatten)]
        error: ErrorPayload,
    },
    ClientRefUnknown {
        client_ref: ClientReference,
    },
}

impl BridgeEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            BridgeEvent::Connecting { .. } => EventKind::Connecting,
            BridgeEvent::Connected { .. } => EventKind::Connected,
            BridgeEvent::ConnectionLost { .. } => EventKind::ConnectionLost,
            BridgeEvent::ConnectionComplete { .. } => EventKind::ConnectionComplete,
            BridgeEvent::Subscribed { .. } => EventKind::Subscribed,
            BridgeEvent::Unsubscribed { .. } => EventKind::Unsubscribed,
            BridgeEvent::MessageReceived { .. } => EventKind::MessageReceived,
            BridgeEvent::MessagePublished { .. } => EventKind::MessagePublished,
            BridgeEvent::Disconnected { .. } => EventKind::Disconnected,
            BridgeEvent::Closed { .. } => EventKind::Closed,
            BridgeEvent::Exception { .. } => EventKind::Exception,
            BridgeEvent::ClientRefUnknown { .. } => EventKind::ClientRefUnknown,
        }
    }

    /// The reference this event is addressed to
    pub fn client_ref(&self) -> &ClientReference {
        match self {
            BridgeEvent::Connecting { client_ref }
            | BridgeEvent::Connected { client_ref }
            | BridgeEvent::ConnectionLost { client_ref, .. }
            | BridgeEvent::ConnectionComplete { client_ref, .. }
            | BridgeEvent::Subscribed { client_ref, .. }
            | BridgeEvent::Unsubscribed { client_ref, .. }
            | BridgeEvent::MessageReceived { client_ref, .. }
            | BridgeEvent::MessagePublished { client_ref, .. }
            | BridgeEvent::Disconnected { client_ref }
            | BridgeEvent::Closed { client_ref }
            | BridgeEvent::Exception { client_ref, .. }
            | BridgeEvent::ClientRefUnknown { client_ref } => client_ref,
        }
    }

    pub fn is_addressed_to(&self, reference: &ClientReference) -> bool {
        self.client_ref() == reference
    }

    pub fn message_received(client_ref: ClientReference, topic: &str, payload: &[u8]) -> Self {
        BridgeEvent::MessageReceived {
            client_ref,
            topic: topic.to_string(),
            payload: encode_payload(payload),
        }
    }

    pub fn message_published(client_ref: ClientReference, topic: &str, payload: &[u8]) -> Self {
        BridgeEvent::MessagePublished {
            client_ref,
            topic: topic.to_string(),
            payload: encode_payload(payload),
        }
    }

    /// Serialize as a single JSON line
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
