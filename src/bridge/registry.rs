//! Registry of live sessions keyed by client reference
//!
//! Every command goes through [`SessionRegistry::dispatch`]. An unknown
//! reference never raises: it publishes CLIENT_REF_UNKNOWN and the command
//! resolves to `Ok(None)`.

use crate::bridge::correlator::CommandKind;
use crate::bridge::event_bus::EventBus;
use crate::bridge::session::Session;
use crate::engine::EngineFactory;
use crate::error::{BridgeError, BridgeResult};
use crate::protocol::events::BridgeEvent;
use crate::protocol::messages::{decode_payload, PublishOptions, Subscription};
use crate::protocol::options::SessionConfig;
use crate::session_span;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

/// Opaque identifier of one session for its whole lifetime
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientReference(String);

impl ClientReference {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientReference {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ClientReference {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Result of a command addressed by reference; `None` when the reference is unknown
pub type CommandResult<T = ()> = BridgeResult<Option<T>>;

pub struct SessionRegistry {
    sessions: RwLock<HashMap<ClientReference, Arc<Session>>>,
    bus: EventBus,
    factory: Arc<dyn EngineFactory>,
}

impl SessionRegistry {
    pub fn new(factory: Arc<dyn EngineFactory>) -> Self {
        Self::with_event_bus(factory, EventBus::default())
    }

    pub fn with_event_bus(factory: Arc<dyn EngineFactory>, bus: EventBus) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            bus,
            factory,
        }
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    /// Create a session and its engine; returns a fresh reference
    pub async fn create(&self, config: SessionConfig) -> BridgeResult<ClientReference> {
        let mut sessions = self.sessions.write().await;
        let mut reference = ClientReference::generate();
        while sessions.contains_key(&reference) {
            reference = ClientReference::generate();
        }

        let session = Session::open(
            reference.clone(),
            config,
            self.bus.clone(),
            self.factory.as_ref(),
        )?;
        info!(
            client_ref = %reference,
            broker = %session.config().broker_uri(),
            client_id = %session.config().client_id(),
            "Session created"
        );
        sessions.insert(reference.clone(), Arc::new(session));
        Ok(reference)
    }

    pub async fn get(&self, reference: &ClientReference) -> Option<Arc<Session>> {
        self.sessions.read().await.get(reference).cloned()
    }

    /// Run `operation` against the session behind `reference`.
    ///
    /// The registry lock is released before `operation` runs.
    pub async fn dispatch<T, F, Fut>(&self, reference: &ClientReference, operation: F) -> CommandResult<T>
    where
        F: FnOnce(Arc<Session>) -> Fut,
        Fut: Future<Output = BridgeResult<T>>,
    {
        match self.get(reference).await {
            Some(session) => operation(session)
                .instrument(session_span!(client_ref = %reference))
                .await
                .map(Some),
            None => {
                self.report_unknown(reference);
                Ok(None)
            }
        }
    }

    /// Remove a session; removing twice is a no-op
    pub async fn remove(&self, reference: &ClientReference) -> Option<Arc<Session>> {
        let removed = self.sessions.write().await.remove(reference);
        if removed.is_some() {
            debug!(client_ref = %reference, "Session removed");
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn references(&self) -> Vec<ClientReference> {
        self.sessions.read().await.keys().cloned().collect()
    }

    pub async fn connect(&self, reference: &ClientReference) -> CommandResult {
        self.dispatch(reference, |session| async move { session.connect().await })
            .await
    }

    pub async fn subscribe(
        &self,
        reference: &ClientReference,
        subscriptions: &[Subscription],
    ) -> CommandResult {
        self.dispatch(reference, |session| async move {
            session.subscribe(subscriptions).await
        })
        .await
    }

    pub async fn unsubscribe(&self, reference: &ClientReference, topics: &[String]) -> CommandResult {
        self.dispatch(reference, |session| async move {
            session.unsubscribe(topics).await
        })
        .await
    }

    pub async fn publish(
        &self,
        reference: &ClientReference,
        topic: &str,
        payload: Bytes,
        options: PublishOptions,
    ) -> CommandResult {
        self.dispatch(reference, |session| async move {
            session.publish(topic, payload, options).await
        })
        .await
    }

    /// Publish a payload that arrived base64-encoded
    pub async fn publish_base64(
        &self,
        reference: &ClientReference,
        topic: &str,
        payload_base64: &str,
        options: PublishOptions,
    ) -> CommandResult {
        self.dispatch(reference, |session| async move {
            let payload = decode_payload(payload_base64)
                .map_err(|e| BridgeError::operation_failed(CommandKind::Publish, e.to_string()))?;
            session.publish(topic, payload, options).await
        })
        .await
    }

    pub async fn disconnect(&self, reference: &ClientReference) -> CommandResult {
        self.dispatch(reference, |session| async move { session.disconnect().await })
            .await
    }

    pub async fn reconnect(&self, reference: &ClientReference) -> CommandResult {
        self.dispatch(reference, |session| async move { session.reconnect().await })
            .await
    }

    pub async fn is_connected(&self, reference: &ClientReference) -> Option<bool> {
        match self.get(reference).await {
            Some(session) => Some(session.is_connected()),
            None => {
                self.report_unknown(reference);
                None
            }
        }
    }

    /// Tear a session down, publish CLOSED and drop the registry entry
    pub async fn end(&self, reference: &ClientReference, force: bool) -> CommandResult {
        let ended = self
            .dispatch(reference, |session| async move {
                session.end(force).await;
                Ok(())
            })
            .await?;

        if ended.is_some() {
            self.remove(reference).await;
            self.bus.publish(BridgeEvent::Closed {
                client_ref: reference.clone(),
            });
        }
        Ok(ended)
    }

    /// Same as a graceful [`Self::end`]
    pub async fn close(&self, reference: &ClientReference) -> CommandResult {
        self.end(reference, false).await
    }

    /// End every session, e.g. on shutdown
    pub async fn end_all(&self, force: bool) {
        for reference in self.references().await {
            if let Err(error) = self.end(&reference, force).await {
                warn!(client_ref = %reference, error = %error, "Failed to end session");
            }
        }
    }

    fn report_unknown(&self, reference: &ClientReference) {
        warn!(client_ref = %reference, "Command addressed to unknown client reference");
        self.bus.publish(BridgeEvent::ClientRefUnknown {
            client_ref: reference.clone(),
        });
    }
}
