//! Normalizes engine failures into event payloads

use crate::bridge::registry::ClientReference;
use crate::engine::{reason, EngineError};
use crate::protocol::events::{BridgeEvent, ErrorPayload};

/// Translate an engine failure, skipping generic wrappers that carry a cause
pub fn translate(error: &EngineError) -> ErrorPayload {
    let mut current = error;
    while current.reason_code == reason::CLIENT_EXCEPTION {
        match current.cause.as_deref() {
            Some(cause) => current = cause,
            None => break,
        }
    }

    ErrorPayload {
        error_message: current.message.clone(),
        error_code: current.reason_code,
        stack_trace: current.frames.join("\n"),
    }
}

pub fn exception_event(client_ref: ClientReference, error: &EngineError) -> BridgeEvent {
    BridgeEvent::Exception {
        client_ref,
        error: translate(error),
    }
}

pub fn connection_lost_event(client_ref: ClientReference, error: &EngineError) -> BridgeEvent {
    BridgeEvent::ConnectionLost {
        client_ref,
        error: translate(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_error() {
        let error = EngineError::new(reason::NOT_CONNECTED, "Client is not connected")
            .with_frames(["publish", "session"]);
        let payload = translate(&error);

        assert_eq!(payload.error_message, "Client is not connected");
        assert_eq!(payload.error_code, reason::NOT_CONNECTED);
        assert_eq!(payload.stack_trace, "publish\nsession");
    }

    #[test]
    fn test_wrapper_is_skipped() {
        let inner = EngineError::new(reason::CONNECTION_LOST, "Connection lost")
            .with_frames(["read loop"]);
        let error = EngineError::wrapping(EngineError::wrapping(inner));
        let payload = translate(&error);

        assert_eq!(payload.error_message, "Connection lost");
        assert_eq!(payload.error_code, reason::CONNECTION_LOST);
        assert_eq!(payload.stack_trace, "read loop");
    }

    #[test]
    fn test_code_zero_without_cause_is_reported() {
        let error = EngineError::new(reason::CLIENT_EXCEPTION, "unexpected");
        let payload = translate(&error);

        assert_eq!(payload.error_message, "unexpected");
        assert_eq!(payload.error_code, 0);
        assert_eq!(payload.stack_trace, "");
    }

    #[test]
    fn test_nonzero_code_keeps_outer_error() {
        let error = EngineError::new(reason::SERVER_CONNECT_ERROR, "Unable to connect to server")
            .with_cause(EngineError::new(5, "Not authorized"));
        let payload = translate(&error);
        assert_eq!(payload.error_code, reason::SERVER_CONNECT_ERROR);
    }

    #[test]
    fn test_event_constructors() {
        let reference = ClientReference::from("r");
        let error = EngineError::new(reason::CONNECTION_LOST, "gone");

        assert_eq!(
            exception_event(reference.clone(), &error).kind(),
            crate::EventKind::Exception
        );
        assert_eq!(
            connection_lost_event(reference, &error).kind(),
            crate::EventKind::ConnectionLost
        );
    }
}
