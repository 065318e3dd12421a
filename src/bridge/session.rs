//! One live broker session: its engine, completion slots and state flag
//!
//! Commands arm the matching completion slot before they reach the engine.
//! The engine reports back through [`SessionListener`], which fires the
//! slot or turns unsolicited transitions into events.

use crate::bridge::correlator::{
    subscribe_verdict, unsubscribe_verdict, CommandKind, CompletionCorrelator,
};
use crate::bridge::error_translator::{connection_lost_event, exception_event};
use crate::bridge::event_bus::EventBus;
use crate::bridge::registry::ClientReference;
use crate::command_span;
use crate::config::ConfigError;
use crate::engine::{
    reason, EngineError, EngineFactory, EngineListener, MqttEngine, SubscribeAck,
};
use crate::error::{BridgeError, BridgeResult};
use crate::protocol::events::BridgeEvent;
use crate::protocol::messages::{PublishOptions, Subscription};
use crate::protocol::options::SessionConfig;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};

#[derive(Debug, Default)]
struct SessionState {
    connected: AtomicBool,
}

impl SessionState {
    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Receives engine callbacks on behalf of one session
struct SessionListener {
    reference: ClientReference,
    bus: EventBus,
    correlator: Arc<CompletionCorrelator>,
    state: Arc<SessionState>,
}

impl EngineListener for SessionListener {
    fn connect_complete(&self, outcome: Result<(), EngineError>) {
        self.correlator.connect.fire(outcome);
    }

    fn subscribe_complete(&self, ack: SubscribeAck) {
        self.correlator.subscribe.fire(ack);
    }

    fn unsubscribe_complete(&self, confirmed: Vec<String>) {
        self.correlator.unsubscribe.fire(confirmed);
    }

    fn publish_complete(&self, outcome: Result<(), EngineError>) {
        self.correlator.publish.fire(outcome);
    }

    fn disconnect_complete(&self, outcome: Result<(), EngineError>) {
        self.correlator.disconnect.fire(outcome);
    }

    fn message_arrived(&self, topic: &str, payload: &[u8]) {
        debug!(client_ref = %self.reference, topic, bytes = payload.len(), "Message arrived");
        self.bus.publish(BridgeEvent::message_received(
            self.reference.clone(),
            topic,
            payload,
        ));
    }

    fn connection_lost(&self, error: EngineError) {
        warn!(client_ref = %self.reference, error = %error, "Connection lost");
        self.state.set_connected(false);
        self.bus
            .publish(connection_lost_event(self.reference.clone(), &error));
    }

    fn connection_restored(&self, server_uri: &str) {
        info!(client_ref = %self.reference, server_uri, "Connection restored");
        self.state.set_connected(true);
        self.bus.publish(BridgeEvent::ConnectionComplete {
            client_ref: self.reference.clone(),
            server_uri: server_uri.to_string(),
            reconnect: true,
        });
    }

    fn engine_exception(&self, error: EngineError) {
        warn!(client_ref = %self.reference, error = %error, "Engine exception");
        self.bus
            .publish(exception_event(self.reference.clone(), &error));
    }
}

/// Runtime object behind one [`ClientReference`]
pub struct Session {
    reference: ClientReference,
    config: SessionConfig,
    engine: Arc<dyn MqttEngine>,
    correlator: Arc<CompletionCorrelator>,
    state: Arc<SessionState>,
    bus: EventBus,
}

impl Session {
    /// Build the engine for `config` and wire its callbacks to `bus`
    pub fn open(
        reference: ClientReference,
        config: SessionConfig,
        bus: EventBus,
        factory: &dyn EngineFactory,
    ) -> Result<Self, ConfigError> {
        let correlator = Arc::new(CompletionCorrelator::new());
        let state = Arc::new(SessionState::default());
        let listener = Arc::new(SessionListener {
            reference: reference.clone(),
            bus: bus.clone(),
            correlator: correlator.clone(),
            state: state.clone(),
        });
        let engine = factory.create(&config, listener)?;

        Ok(Self {
            reference,
            config,
            engine,
            correlator,
            state,
            bus,
        })
    }

    pub fn reference(&self) -> &ClientReference {
        &self.reference
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    /// Connect, bounded by the configured connection timeout
    pub async fn connect(&self) -> BridgeResult<()> {
        let span = command_span!("connect", client_ref = %self.reference);
        async {
            self.bus.publish(BridgeEvent::Connecting {
                client_ref: self.reference.clone(),
            });

            let reference = self.reference.clone();
            let bus = self.bus.clone();
            let state = self.state.clone();
            let server_uri = self.config.broker_uri();
            let pending = self
                .correlator
                .connect
                .arm(move |outcome| match outcome {
                    Ok(()) => {
                        info!(client_ref = %reference, server_uri = %server_uri, "Connected");
                        state.set_connected(true);
                        bus.publish(BridgeEvent::Connected {
                            client_ref: reference.clone(),
                        });
                        bus.publish(BridgeEvent::ConnectionComplete {
                            client_ref: reference,
                            server_uri,
                            reconnect: false,
                        });
                        Ok(())
                    }
                    Err(error) => {
                        bus.publish(exception_event(reference, &error));
                        Err(BridgeError::operation_failed(
                            CommandKind::Connect,
                            error.to_string(),
                        ))
                    }
                })
                .await;

            let timeout = self.config.connection_timeout();
            self.issue(self.engine.connect(timeout).await)?;

            let result = pending.wait_for(timeout).await;
            if let Err(BridgeError::Timeout { .. }) = &result {
                warn!(client_ref = %self.reference, ?timeout, "Connect timed out, halting engine");
                self.engine.halt();
            }
            result
        }
        .instrument(span)
        .await
    }

    /// Subscribe; succeeds when at least one topic is granted
    pub async fn subscribe(&self, subscriptions: &[Subscription]) -> BridgeResult<()> {
        if subscriptions.is_empty() {
            return Err(BridgeError::operation_failed(
                CommandKind::Subscribe,
                "no topics requested",
            ));
        }
        let span = command_span!("subscribe", client_ref = %self.reference, topics = subscriptions.len());
        async {
            let requested = subscriptions.to_vec();
            let reference = self.reference.clone();
            let bus = self.bus.clone();
            let pending = self
                .correlator
                .subscribe
                .arm(move |ack| {
                    let verdict = subscribe_verdict(&requested, &ack);
                    for topic in &verdict.granted {
                        bus.publish(BridgeEvent::Subscribed {
                            client_ref: reference.clone(),
                            topic: topic.clone(),
                        });
                    }
                    if verdict.failed.is_empty() {
                        return Ok(());
                    }

                    let message = verdict.failure_message();
                    warn!(client_ref = %reference, failed = ?verdict.failed, "Subscription refused");
                    let error = EngineError::new(reason::SUBSCRIBE_FAILED, message.clone())
                        .with_frames(verdict.failed.iter().cloned());
                    bus.publish(exception_event(reference, &error));

                    if verdict.succeeded() {
                        Ok(())
                    } else {
                        Err(BridgeError::operation_failed(CommandKind::Subscribe, message))
                    }
                })
                .await;

            self.issue(self.engine.subscribe(subscriptions).await)?;
            pending.wait().await
        }
        .instrument(span)
        .await
    }

    /// Unsubscribe; succeeds only when every requested topic is confirmed
    pub async fn unsubscribe(&self, topics: &[String]) -> BridgeResult<()> {
        let mut requested: Vec<String> = Vec::with_capacity(topics.len());
        for topic in topics {
            if !requested.contains(topic) {
                requested.push(topic.clone());
            }
        }
        if requested.is_empty() {
            return Err(BridgeError::operation_failed(
                CommandKind::Unsubscribe,
                "no topics requested",
            ));
        }

        let span = command_span!("unsubscribe", client_ref = %self.reference, topics = requested.len());
        async {
            let reference = self.reference.clone();
            let bus = self.bus.clone();
            let expected = requested.clone();
            let pending = self
                .correlator
                .unsubscribe
                .arm(move |confirmed| {
                    let verdict = unsubscribe_verdict(&expected, &confirmed);
                    for topic in &verdict.confirmed {
                        bus.publish(BridgeEvent::Unsubscribed {
                            client_ref: reference.clone(),
                            topic: topic.clone(),
                        });
                    }
                    if verdict.succeeded() {
                        Ok(())
                    } else {
                        warn!(client_ref = %reference, failed = ?verdict.failed, "Unsubscribe incomplete");
                        Err(BridgeError::operation_failed(
                            CommandKind::Unsubscribe,
                            verdict.failure_message(),
                        ))
                    }
                })
                .await;

            self.issue(self.engine.unsubscribe(&requested).await)?;
            pending.wait().await
        }
        .instrument(span)
        .await
    }

    pub async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        options: PublishOptions,
    ) -> BridgeResult<()> {
        let span = command_span!("publish", client_ref = %self.reference, topic, qos = %options.qos);
        async {
            let reference = self.reference.clone();
            let bus = self.bus.clone();
            let published_topic = topic.to_string();
            let published_payload = payload.clone();
            let pending = self
                .correlator
                .publish
                .arm(move |outcome| match outcome {
                    Ok(()) => {
                        bus.publish(BridgeEvent::message_published(
                            reference,
                            &published_topic,
                            &published_payload,
                        ));
                        Ok(())
                    }
                    Err(error) => {
                        bus.publish(exception_event(reference, &error));
                        Err(BridgeError::operation_failed(
                            CommandKind::Publish,
                            error.to_string(),
                        ))
                    }
                })
                .await;

            self.issue(self.engine.publish(topic, payload, options).await)?;
            pending.wait().await
        }
        .instrument(span)
        .await
    }

    pub async fn disconnect(&self) -> BridgeResult<()> {
        let span = command_span!("disconnect", client_ref = %self.reference);
        async {
            let reference = self.reference.clone();
            let bus = self.bus.clone();
            let state = self.state.clone();
            let pending = self
                .correlator
                .disconnect
                .arm(move |outcome| match outcome {
                    Ok(()) => {
                        state.set_connected(false);
                        bus.publish(BridgeEvent::Disconnected {
                            client_ref: reference,
                        });
                        Ok(())
                    }
                    Err(error) => {
                        bus.publish(exception_event(reference, &error));
                        Err(BridgeError::operation_failed(
                            CommandKind::Disconnect,
                            error.to_string(),
                        ))
                    }
                })
                .await;

            self.issue(self.engine.disconnect().await)?;
            pending.wait().await
        }
        .instrument(span)
        .await
    }

    /// Ask the engine to re-establish the connection; no completion is awaited
    pub async fn reconnect(&self) -> BridgeResult<()> {
        info!(client_ref = %self.reference, "Reconnecting");
        self.bus.publish(BridgeEvent::Connecting {
            client_ref: self.reference.clone(),
        });
        self.issue(self.engine.reconnect().await)
    }

    /// Tear the session down.
    ///
    /// Without `force` a connected session disconnects gracefully first.
    /// Pending commands resolve as cancelled and later completions are dropped.
    pub async fn end(&self, force: bool) {
        if !force && self.is_connected() {
            if let Err(error) = self.disconnect().await {
                warn!(client_ref = %self.reference, error = %error, "Graceful disconnect failed");
            }
        }
        self.correlator.cancel_all();
        self.engine.halt();
        self.state.set_connected(false);
        info!(client_ref = %self.reference, force, "Session ended");
    }

    /// Mirror an issue-time engine failure on the bus
    fn issue(&self, result: Result<(), EngineError>) -> BridgeResult<()> {
        result.map_err(|error| {
            warn!(client_ref = %self.reference, error = %error, "Engine rejected command");
            self.bus
                .publish(exception_event(self.reference.clone(), &error));
            BridgeError::Engine(error)
        })
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("reference", &self.reference)
            .field("broker", &self.config.broker_uri())
            .field("connected", &self.is_connected())
            .finish()
    }
}
