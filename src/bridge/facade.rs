//! Caller-facing client bound to one session reference
//!
//! The client owns a dispatcher task reading the shared event bus. Events
//! stamped with another reference are skipped; the rest are decoded into
//! [`ClientEvent`] and handed to the handler registered for their kind.

use crate::bridge::registry::{ClientReference, SessionRegistry};
use crate::error::BridgeResult;
use crate::protocol::events::{BridgeEvent, ErrorPayload, EventKind};
use crate::protocol::messages::{decode_payload, PayloadDecodeError, PublishOptions, Subscription};
use crate::protocol::options::SessionConfig;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Event as seen by a caller handler, with payloads decoded to bytes
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connecting,
    Connected,
    ConnectionLost(ErrorPayload),
    ConnectionComplete { server_uri: String, reconnect: bool },
    Subscribed { topic: String },
    Unsubscribed { topic: String },
    MessageReceived { topic: String, payload: Bytes },
    MessagePublished { topic: String, payload: Bytes },
    Disconnected,
    Closed,
    Exception(ErrorPayload),
    ClientRefUnknown { client_ref: ClientReference },
}

impl ClientEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ClientEvent::Connecting => EventKind::Connecting,
            ClientEvent::Connected => EventKind::Connected,
            ClientEvent::ConnectionLost(_) => EventKind::ConnectionLost,
            ClientEvent::ConnectionComplete { .. } => EventKind::ConnectionComplete,
            ClientEvent::Subscribed { .. } => EventKind::Subscribed,
            ClientEvent::Unsubscribed { .. } => EventKind::Unsubscribed,
            ClientEvent::MessageReceived { .. } => EventKind::MessageReceived,
            ClientEvent::MessagePublished { .. } => EventKind::MessagePublished,
            ClientEvent::Disconnected => EventKind::Disconnected,
            ClientEvent::Closed => EventKind::Closed,
            ClientEvent::Exception(_) => EventKind::Exception,
            ClientEvent::ClientRefUnknown { .. } => EventKind::ClientRefUnknown,
        }
    }
}

impl TryFrom<BridgeEvent> for ClientEvent {
    type Error = PayloadDecodeError;

    fn try_from(event: BridgeEvent) -> Result<Self, Self::Error> {
        let decoded = match event {
            BridgeEvent::Connecting { .. } => ClientEvent::Connecting,
            BridgeEvent::Connected { .. } => ClientEvent::Connected,
            BridgeEvent::ConnectionLost { error, .. } => ClientEvent::ConnectionLost(error),
            BridgeEvent::ConnectionComplete {
                server_uri,
                reconnect,
                ..
            } => ClientEvent::ConnectionComplete {
                server_uri,
                reconnect,
            },
            BridgeEvent::Subscribed { topic, .. } => ClientEvent::Subscribed { topic },
            BridgeEvent::Unsubscribed { topic, .. } => ClientEvent::Unsubscribed { topic },
            BridgeEvent::MessageReceived { topic, payload, .. } => ClientEvent::MessageReceived {
                topic,
                payload: decode_payload(&payload)?,
            },
            BridgeEvent::MessagePublished { topic, payload, .. } => {
                ClientEvent::MessagePublished {
                    topic,
                    payload: decode_payload(&payload)?,
                }
            }
            BridgeEvent::Disconnected { .. } => ClientEvent::Disconnected,
            BridgeEvent::Closed { .. } => ClientEvent::Closed,
            BridgeEvent::Exception { error, .. } => ClientEvent::Exception(error),
            BridgeEvent::ClientRefUnknown { client_ref } => {
                ClientEvent::ClientRefUnknown { client_ref }
            }
        };
        Ok(decoded)
    }
}

pub type EventHandler = Arc<dyn Fn(&ClientEvent) + Send + Sync>;

type HandlerMap = Arc<RwLock<HashMap<EventKind, EventHandler>>>;

/// Client bound to one session
pub struct MqttClient {
    reference: ClientReference,
    registry: Arc<SessionRegistry>,
    handlers: HandlerMap,
    shutdown_tx: watch::Sender<bool>,
    dispatcher: Option<JoinHandle<()>>,
}

impl MqttClient {
    /// Create a session from `config` and bind a client to it
    pub async fn create(registry: Arc<SessionRegistry>, config: SessionConfig) -> BridgeResult<Self> {
        let reference = registry.create(config).await?;
        Ok(Self::bind(registry, reference))
    }

    /// Bind a client to an existing reference.
    ///
    /// Must be called inside a tokio runtime; the dispatcher is spawned here.
    pub fn bind(registry: Arc<SessionRegistry>, reference: ClientReference) -> Self {
        let handlers: HandlerMap = Arc::new(RwLock::new(HashMap::new()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatcher = tokio::spawn(run_dispatcher(
            registry.event_bus().subscribe(),
            reference.clone(),
            handlers.clone(),
            shutdown_rx,
        ));

        Self {
            reference,
            registry,
            handlers,
            shutdown_tx,
            dispatcher: Some(dispatcher),
        }
    }

    pub fn reference(&self) -> &ClientReference {
        &self.reference
    }

    /// Register the handler for `kind`, replacing any previous one
    pub fn on<F>(&self, kind: EventKind, handler: F) -> &Self
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        match self.handlers.write() {
            Ok(mut handlers) => {
                if handlers.insert(kind, Arc::new(handler)).is_some() {
                    debug!(client_ref = %self.reference, event = %kind, "Handler replaced");
                }
            }
            Err(_) => warn!(client_ref = %self.reference, "Handler table poisoned"),
        }
        self
    }

    /// Convenience for MESSAGE_RECEIVED with the decoded payload
    pub fn on_message<F>(&self, handler: F) -> &Self
    where
        F: Fn(&str, &[u8]) + Send + Sync + 'static,
    {
        self.on(EventKind::MessageReceived, move |event| {
            if let ClientEvent::MessageReceived { topic, payload } = event {
                handler(topic, payload);
            }
        })
    }

    /// Convenience for CONNECTION_LOST and EXCEPTION
    pub fn on_error<F>(&self, handler: F) -> &Self
    where
        F: Fn(&ErrorPayload) + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        let lost = handler.clone();
        self.on(EventKind::ConnectionLost, move |event| {
            if let ClientEvent::ConnectionLost(error) = event {
                lost(error);
            }
        });
        self.on(EventKind::Exception, move |event| {
            if let ClientEvent::Exception(error) = event {
                handler(error);
            }
        })
    }

    pub async fn connect(&self) -> BridgeResult<()> {
        self.registry.connect(&self.reference).await.map(drop)
    }

    pub async fn subscribe(&self, subscriptions: &[Subscription]) -> BridgeResult<()> {
        self.registry
            .subscribe(&self.reference, subscriptions)
            .await
            .map(drop)
    }

    pub async fn unsubscribe<I, S>(&self, topics: I) -> BridgeResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let topics: Vec<String> = topics.into_iter().map(Into::into).collect();
        self.registry
            .unsubscribe(&self.reference, &topics)
            .await
            .map(drop)
    }

    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        options: PublishOptions,
    ) -> BridgeResult<()> {
        self.registry
            .publish(&self.reference, topic, payload.into(), options)
            .await
            .map(drop)
    }

    pub async fn disconnect(&self) -> BridgeResult<()> {
        self.registry.disconnect(&self.reference).await.map(drop)
    }

    pub async fn reconnect(&self) -> BridgeResult<()> {
        self.registry.reconnect(&self.reference).await.map(drop)
    }

    /// `false` for a session that no longer exists
    pub async fn is_connected(&self) -> bool {
        self.registry
            .is_connected(&self.reference)
            .await
            .unwrap_or(false)
    }

    /// End the session and stop delivering events to this client
    pub async fn end(&mut self, force: bool) -> BridgeResult<()> {
        let result = self.registry.end(&self.reference, force).await.map(drop);
        self.stop_dispatcher().await;
        result
    }

    /// Graceful [`Self::end`]
    pub async fn close(&mut self) -> BridgeResult<()> {
        self.end(false).await
    }

    async fn stop_dispatcher(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.dispatcher.take() {
            if let Err(error) = handle.await {
                if !error.is_cancelled() {
                    warn!(client_ref = %self.reference, error = %error, "Event dispatcher failed");
                }
            }
        }
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.clear();
        }
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.dispatcher.take() {
            handle.abort();
        }
    }
}

async fn run_dispatcher(
    mut events: crate::bridge::event_bus::EventStream,
    reference: ClientReference,
    handlers: HandlerMap,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;

            next = events.next() => {
                let Some(event) = next else { break };
                if event.is_addressed_to(&reference) {
                    deliver(&handlers, &reference, event);
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    drain_until_closed(&mut events, &reference, &handlers);
                    break;
                }
            }
        }
    }
    debug!(client_ref = %reference, "Event dispatcher stopped");
}

/// Deliver what is already queued for this client, stopping after its CLOSED
fn drain_until_closed(
    events: &mut crate::bridge::event_bus::EventStream,
    reference: &ClientReference,
    handlers: &HandlerMap,
) {
    while let Some(event) = events.try_next() {
        if !event.is_addressed_to(reference) {
            continue;
        }
        let closed = event.kind() == EventKind::Closed;
        deliver(handlers, reference, event);
        if closed {
            break;
        }
    }
}

fn deliver(handlers: &HandlerMap, reference: &ClientReference, event: BridgeEvent) {
    let kind = event.kind();
    let handler = match handlers.read() {
        Ok(handlers) => handlers.get(&kind).cloned(),
        Err(_) => None,
    };
    let Some(handler) = handler else {
        return;
    };

    match ClientEvent::try_from(event) {
        Ok(client_event) => handler(&client_event),
        Err(error) => {
            warn!(client_ref = %reference, event = %kind, error = %error, "Dropping undecodable event")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::QoS;
    use crate::protocol::options::Protocol;
    use crate::testing::MockEngineFactory;
    use std::sync::Mutex;
    use std::time::Duration;

    fn config() -> SessionConfig {
        SessionConfig::builder()
            .address("test.broker", 1883, Protocol::Tcp)
            .unwrap()
            .build()
            .unwrap()
    }

    fn registry() -> Arc<SessionRegistry> {
        Arc::new(SessionRegistry::new(Arc::new(MockEngineFactory::default())))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[test]
    fn test_client_event_decodes_payload() {
        let event = BridgeEvent::message_received(ClientReference::from("r"), "a/b", b"Test");
        let decoded = ClientEvent::try_from(event).unwrap();
        assert_eq!(
            decoded,
            ClientEvent::MessageReceived {
                topic: "a/b".to_string(),
                payload: Bytes::from_static(b"Test"),
            }
        );
        assert_eq!(decoded.kind(), EventKind::MessageReceived);
    }

    #[test]
    fn test_client_event_rejects_bad_payload() {
        let event = BridgeEvent::MessagePublished {
            client_ref: ClientReference::from("r"),
            topic: "a".to_string(),
            payload: "***".to_string(),
        };
        assert!(ClientEvent::try_from(event).is_err());
    }

    #[tokio::test]
    async fn test_handlers_receive_own_events() {
        let registry = registry();
        let client = MqttClient::create(registry, config()).await.unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        client.on(EventKind::Connected, move |event| {
            sink.lock().unwrap().push(event.clone());
        });

        client.connect().await.unwrap();
        settle().await;

        assert_eq!(*seen.lock().unwrap(), vec![ClientEvent::Connected]);
    }

    #[tokio::test]
    async fn test_reregistering_replaces_handler() {
        let registry = registry();
        let client = MqttClient::create(registry, config()).await.unwrap();
        let first = Arc::new(Mutex::new(0));
        let second = Arc::new(Mutex::new(0));

        let counter = first.clone();
        client.on(EventKind::Subscribed, move |_| *counter.lock().unwrap() += 1);
        let counter = second.clone();
        client.on(EventKind::Subscribed, move |_| *counter.lock().unwrap() += 1);

        client
            .subscribe(&[Subscription::new("a", QoS::AtMostOnce)])
            .await
            .unwrap();
        settle().await;

        assert_eq!(*first.lock().unwrap(), 0);
        assert_eq!(*second.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_on_message_gets_raw_bytes() {
        let factory = Arc::new(MockEngineFactory::default());
        let registry = Arc::new(SessionRegistry::new(factory.clone()));
        let client = MqttClient::create(registry, config()).await.unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));

        let sink = received.clone();
        client.on_message(move |topic, payload| {
            sink.lock().unwrap().push((topic.to_string(), payload.to_vec()));
        });

        factory.last_engine().unwrap().deliver("sensors/1", &[0, 159, 146, 150]);
        settle().await;

        assert_eq!(
            *received.lock().unwrap(),
            vec![("sensors/1".to_string(), vec![0, 159, 146, 150])]
        );
    }

    #[tokio::test]
    async fn test_end_stops_delivery() {
        let factory = Arc::new(MockEngineFactory::default());
        let registry = Arc::new(SessionRegistry::new(factory.clone()));
        let mut client = MqttClient::create(registry, config()).await.unwrap();
        let count = Arc::new(Mutex::new(0));

        let counter = count.clone();
        client.on(EventKind::MessageReceived, move |_| *counter.lock().unwrap() += 1);

        let engine = factory.last_engine().unwrap();
        client.end(true).await.unwrap();

        engine.deliver("late", b"x");
        settle().await;

        assert_eq!(*count.lock().unwrap(), 0);
        assert!(!client.is_connected().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_end_delivers_closing_events_exactly_once() {
        let registry = registry();
        for _ in 0..100 {
            let mut client = MqttClient::create(registry.clone(), config()).await.unwrap();
            let disconnected = Arc::new(Mutex::new(0));
            let closed = Arc::new(Mutex::new(0));

            let counter = disconnected.clone();
            client.on(EventKind::Disconnected, move |_| *counter.lock().unwrap() += 1);
            let counter = closed.clone();
            client.on(EventKind::Closed, move |_| *counter.lock().unwrap() += 1);

            client.connect().await.unwrap();
            client.end(false).await.unwrap();

            assert_eq!(*disconnected.lock().unwrap(), 1);
            assert_eq!(*closed.lock().unwrap(), 1);
        }
        assert!(registry.is_empty().await);
    }
}
