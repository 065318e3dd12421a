//! Scripted engine for tests
//!
//! [`MockEngine`] completes every command synchronously from inside the
//! issuing call, following a [`MockBehavior`] script, and records what it was
//! asked to do. Unsolicited transitions are triggered by hand.

use crate::config::ConfigError;
use crate::engine::{
    EngineError, EngineFactory, EngineListener, MqttEngine, SubscribeAck,
};
use crate::protocol::messages::{PublishOptions, Subscription};
use crate::protocol::options::SessionConfig;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub type PublishedMessage = (String, Bytes, PublishOptions);

/// What the mock engine does when commands arrive
#[derive(Debug, Clone, Default)]
pub struct MockBehavior {
    /// Complete connect with this failure
    pub connect_error: Option<EngineError>,
    /// Accept connect but never complete it
    pub hang_connect: bool,
    /// Reject subscribe/unsubscribe/publish/disconnect while disconnected
    pub require_connection: bool,
    /// Topic filters the broker refuses in SUBACK
    pub refused_topics: Vec<String>,
    /// Topics left out of the unsubscribe confirmation
    pub unconfirmed_topics: Vec<String>,
    /// Complete publish with this failure
    pub publish_error: Option<EngineError>,
    /// Fail engine construction
    pub reject_creation: bool,
}

pub struct MockEngine {
    listener: Arc<dyn EngineListener>,
    behavior: MockBehavior,
    server_uri: String,
    connected: AtomicBool,
    halted: AtomicBool,
    pub subscriptions: Arc<Mutex<Vec<Subscription>>>,
    pub unsubscribed: Arc<Mutex<Vec<String>>>,
    pub published: Arc<Mutex<Vec<PublishedMessage>>>,
}

impl MockEngine {
    pub fn new(
        config: &SessionConfig,
        listener: Arc<dyn EngineListener>,
        behavior: MockBehavior,
    ) -> Self {
        Self {
            listener,
            behavior,
            server_uri: config.broker_uri(),
            connected: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            subscriptions: Arc::new(Mutex::new(Vec::new())),
            unsubscribed: Arc::new(Mutex::new(Vec::new())),
            published: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub async fn get_subscriptions(&self) -> Vec<Subscription> {
        self.subscriptions.lock().await.clone()
    }

    pub async fn get_unsubscribed(&self) -> Vec<String> {
        self.unsubscribed.lock().await.clone()
    }

    pub async fn get_published(&self) -> Vec<PublishedMessage> {
        self.published.lock().await.clone()
    }

    pub fn was_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Finish a connect the script left hanging
    pub fn complete_connect(&self, outcome: Result<(), EngineError>) {
        if outcome.is_ok() {
            self.connected.store(true, Ordering::SeqCst);
        }
        self.listener.connect_complete(outcome);
    }

    pub fn drop_connection(&self, error: EngineError) {
        self.connected.store(false, Ordering::SeqCst);
        self.listener.connection_lost(error);
    }

    pub fn restore_connection(&self) {
        self.connected.store(true, Ordering::SeqCst);
        self.listener.connection_restored(&self.server_uri);
    }

    /// Simulate an inbound PUBLISH
    pub fn deliver(&self, topic: &str, payload: &[u8]) {
        self.listener.message_arrived(topic, payload);
    }

    pub fn raise(&self, error: EngineError) {
        self.listener.engine_exception(error);
    }

    fn ensure_connected(&self) -> Result<(), EngineError> {
        if self.behavior.require_connection && !self.connected.load(Ordering::SeqCst) {
            return Err(EngineError::not_connected());
        }
        Ok(())
    }
}

#[async_trait]
impl MqttEngine for MockEngine {
    async fn connect(&self, _timeout: Duration) -> Result<(), EngineError> {
        if self.connected.load(Ordering::SeqCst) {
            return Err(EngineError::already_connected());
        }
        self.halted.store(false, Ordering::SeqCst);
        if self.behavior.hang_connect {
            return Ok(());
        }
        match &self.behavior.connect_error {
            Some(error) => self.listener.connect_complete(Err(error.clone())),
            None => {
                self.connected.store(true, Ordering::SeqCst);
                self.listener.connect_complete(Ok(()));
            }
        }
        Ok(())
    }

    async fn subscribe(&self, subscriptions: &[Subscription]) -> Result<(), EngineError> {
        self.ensure_connected()?;
        self.subscriptions
            .lock()
            .await
            .extend(subscriptions.iter().cloned());

        let (failed, granted): (Vec<String>, Vec<String>) = subscriptions
            .iter()
            .map(|subscription| subscription.topic.clone())
            .partition(|topic| self.behavior.refused_topics.contains(topic));
        self.listener
            .subscribe_complete(SubscribeAck { granted, failed });
        Ok(())
    }

    async fn unsubscribe(&self, topics: &[String]) -> Result<(), EngineError> {
        self.ensure_connected()?;
        self.unsubscribed.lock().await.extend(topics.iter().cloned());

        let confirmed = topics
            .iter()
            .filter(|topic| !self.behavior.unconfirmed_topics.contains(topic))
            .cloned()
            .collect();
        self.listener.unsubscribe_complete(confirmed);
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        options: PublishOptions,
    ) -> Result<(), EngineError> {
        self.ensure_connected()?;
        self.published
            .lock()
            .await
            .push((topic.to_string(), payload, options));

        let outcome = match &self.behavior.publish_error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        };
        self.listener.publish_complete(outcome);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), EngineError> {
        self.ensure_connected()?;
        self.connected.store(false, Ordering::SeqCst);
        self.listener.disconnect_complete(Ok(()));
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), EngineError> {
        self.halted.store(false, Ordering::SeqCst);
        self.restore_connection();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }
}

/// Factory handing out [`MockEngine`]s and keeping them for inspection
#[derive(Default)]
pub struct MockEngineFactory {
    behavior: MockBehavior,
    engines: std::sync::Mutex<Vec<Arc<MockEngine>>>,
}

impl MockEngineFactory {
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            behavior,
            engines: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn engines(&self) -> Vec<Arc<MockEngine>> {
        self.engines
            .lock()
            .map(|engines| engines.clone())
            .unwrap_or_default()
    }

    pub fn last_engine(&self) -> Option<Arc<MockEngine>> {
        self.engines().last().cloned()
    }
}

impl EngineFactory for MockEngineFactory {
    fn create(
        &self,
        config: &SessionConfig,
        listener: Arc<dyn EngineListener>,
    ) -> Result<Arc<dyn MqttEngine>, ConfigError> {
        if self.behavior.reject_creation {
            return Err(ConfigError::InvalidCertificate(
                "mock engine rejected certificate material".to_string(),
            ));
        }
        let engine = Arc::new(MockEngine::new(config, listener, self.behavior.clone()));
        if let Ok(mut engines) = self.engines.lock() {
            engines.push(engine.clone());
        }
        Ok(engine)
    }
}
