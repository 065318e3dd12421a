//! Engine backed by the rumqttc MQTT 3.1.1 client
//!
//! Commands are handed to an [`AsyncClient`]; a driver task polls the
//! [`EventLoop`] and turns acknowledgements into listener callbacks. rumqttc
//! reports acks by packet id only, so [`AckTracker`] remembers which topics
//! each outgoing packet carried.

use super::{reason, EngineError, EngineFactory, EngineListener, MqttEngine, SubscribeAck};
use crate::config::ConfigError;
use crate::protocol::messages::{PublishOptions, QoS, Subscription};
use crate::protocol::options::{CertificateMaterial, Protocol, SessionConfig};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, LastWill, MqttOptions,
    Outgoing, Packet, SubscribeFilter, SubscribeReasonCode, TlsConfiguration, Transport,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Capacity of the request channel between client and event loop
const REQUEST_CAPACITY: usize = 64;
/// Pause between automatic reconnection attempts
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

fn engine_qos(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

/// Translate a resolved session configuration into rumqttc options
pub fn configure_mqtt_options(config: &SessionConfig) -> Result<MqttOptions, ConfigError> {
    if config.protocol_version() != 4 {
        return Err(ConfigError::UnsupportedProtocolVersion(
            config.protocol_version(),
        ));
    }

    // rumqttc expects the full URL as host for websocket transports
    let host = if config.protocol().is_websocket() {
        config.broker_uri()
    } else {
        config.host().to_string()
    };
    let mut options = MqttOptions::new(config.client_id(), host, config.port());
    options.set_keep_alive(config.keepalive());
    options.set_clean_session(config.clean_session());

    if let Some(username) = config.username() {
        options.set_credentials(username, config.password().unwrap_or_default());
    }

    if let Some(will) = config.will() {
        options.set_last_will(LastWill::new(
            will.topic.clone(),
            will.payload.to_vec(),
            engine_qos(will.qos),
            will.retain,
        ));
    }

    match config.protocol() {
        Protocol::Tcp => {}
        Protocol::TcpTls => {
            let transport = match tls_configuration(config.certificates())? {
                Some(tls) => Transport::Tls(tls),
                None => Transport::tls_with_default_config(),
            };
            options.set_transport(transport);
        }
        Protocol::Ws => {
            options.set_transport(Transport::Ws);
        }
        Protocol::Wss => {
            let transport = match tls_configuration(config.certificates())? {
                Some(tls) => Transport::Wss(tls),
                None => Transport::wss_with_default_config(),
            };
            options.set_transport(transport);
        }
    }

    Ok(options)
}

/// Decode certificate material; `None` means the platform trust roots apply.
///
/// rumqttc only accepts client authentication alongside an explicit CA, so
/// mutual TLS needs `ca_base64` even when the broker chains to a platform
/// root. Such a session is rejected when it is created.
fn tls_configuration(
    certificates: &CertificateMaterial,
) -> Result<Option<TlsConfiguration>, ConfigError> {
    let client_auth = match (
        &certificates.certificate_base64,
        &certificates.private_key_base64,
    ) {
        (Some(certificate), Some(key)) => Some((
            decode_material("client certificate", certificate)?,
            decode_material("private key", key)?,
        )),
        (None, None) => None,
        _ => {
            return Err(ConfigError::InvalidCertificate(
                "client certificate and private key must be supplied together".to_string(),
            ))
        }
    };

    if certificates.keystore_password.is_some() {
        debug!("Keystore password ignored; key material is expected unencrypted");
    }

    let Some(ca) = &certificates.ca_base64 else {
        if client_auth.is_some() {
            return Err(ConfigError::InvalidCertificate(
                "client certificate authentication requires an explicit CA certificate; \
                 platform trust roots apply only without client material"
                    .to_string(),
            ));
        }
        return Ok(None);
    };

    Ok(Some(TlsConfiguration::Simple {
        ca: decode_material("CA certificate", ca)?,
        alpn: None,
        client_auth,
    }))
}

fn decode_material(what: &str, encoded: &str) -> Result<Vec<u8>, ConfigError> {
    STANDARD
        .decode(encoded.trim())
        .map_err(|e| ConfigError::InvalidCertificate(format!("{what} is not valid base64: {e}")))
}

/// CONNACK return code as carried on the wire
fn refused_code(code: ConnectReturnCode) -> i32 {
    match code {
        ConnectReturnCode::Success => 0,
        ConnectReturnCode::RefusedProtocolVersion => 1,
        ConnectReturnCode::BadClientId => 2,
        ConnectReturnCode::ServiceUnavailable => 3,
        ConnectReturnCode::BadUserNamePassword => 4,
        ConnectReturnCode::NotAuthorized => 5,
    }
}

fn connect_failure(error: &ConnectionError) -> EngineError {
    let cause = match error {
        ConnectionError::ConnectionRefused(code) => {
            EngineError::new(refused_code(*code), format!("Connection refused: {code:?}"))
        }
        ConnectionError::NetworkTimeout => EngineError::new(
            reason::CLIENT_TIMEOUT,
            "Timed out waiting for a response from the server",
        ),
        other => EngineError::from_error(reason::SERVER_CONNECT_ERROR, other),
    };
    EngineError::wrapping(cause)
}

fn connection_lost(error: &ConnectionError) -> EngineError {
    EngineError::wrapping(
        EngineError::new(reason::CONNECTION_LOST, "Connection lost")
            .with_cause(EngineError::from_error(reason::CLIENT_EXCEPTION, error)),
    )
}

#[derive(Debug, Default)]
struct UnsubscribeBatch {
    remaining: usize,
    confirmed: Vec<String>,
}

/// Work abandoned when the connection dropped
#[derive(Debug, Default, PartialEq)]
struct Abandoned {
    subscribes: Vec<Vec<String>>,
    unsubscribed: Option<Vec<String>>,
    publishes: usize,
}

/// Maps packet ids back to the commands that produced them
#[derive(Debug, Default)]
struct AckTracker {
    queued_subscribes: VecDeque<Vec<String>>,
    subscribes: HashMap<u16, Vec<String>>,
    queued_unsubscribes: VecDeque<String>,
    unsubscribes: HashMap<u16, String>,
    unsubscribe_batch: Option<UnsubscribeBatch>,
    queued_publishes: VecDeque<QoS>,
    publishes: HashMap<u16, QoS>,
}

impl AckTracker {
    fn queue_subscribe(&mut self, topics: Vec<String>) {
        self.queued_subscribes.push_back(topics);
    }

    fn subscribe_sent(&mut self, pkid: u16) {
        if let Some(topics) = self.queued_subscribes.pop_front() {
            self.subscribes.insert(pkid, topics);
        }
    }

    fn suback(&mut self, pkid: u16, codes: &[SubscribeReasonCode]) -> Option<SubscribeAck> {
        let topics = self.subscribes.remove(&pkid)?;
        let mut ack = SubscribeAck::default();
        for (index, topic) in topics.into_iter().enumerate() {
            match codes.get(index) {
                Some(SubscribeReasonCode::Success(_)) => ack.granted.push(topic),
                _ => ack.failed.push(topic),
            }
        }
        Some(ack)
    }

    /// One UNSUBSCRIBE packet goes out per topic; completion waits for all
    fn queue_unsubscribe(&mut self, topics: &[String]) {
        self.unsubscribe_batch = Some(UnsubscribeBatch {
            remaining: topics.len(),
            confirmed: Vec::with_capacity(topics.len()),
        });
        self.queued_unsubscribes.extend(topics.iter().cloned());
    }

    fn unsubscribe_sent(&mut self, pkid: u16) {
        if let Some(topic) = self.queued_unsubscribes.pop_front() {
            self.unsubscribes.insert(pkid, topic);
        }
    }

    fn unsuback(&mut self, pkid: u16) -> Option<Vec<String>> {
        let topic = self.unsubscribes.remove(&pkid)?;
        let batch = self.unsubscribe_batch.as_mut()?;
        batch.confirmed.push(topic);
        batch.remaining = batch.remaining.saturating_sub(1);
        if batch.remaining > 0 {
            return None;
        }
        self.unsubscribe_batch.take().map(|batch| batch.confirmed)
    }

    fn queue_publish(&mut self, qos: QoS) {
        self.queued_publishes.push_back(qos);
    }

    /// Returns true when the publish is complete on send (QoS 0)
    fn publish_sent(&mut self, pkid: u16) -> bool {
        match self.queued_publishes.pop_front() {
            Some(QoS::AtMostOnce) => true,
            Some(qos) => {
                self.publishes.insert(pkid, qos);
                false
            }
            None => false,
        }
    }

    fn publish_acked(&mut self, pkid: u16, qos: QoS) -> bool {
        if self.publishes.get(&pkid) == Some(&qos) {
            self.publishes.remove(&pkid);
            return true;
        }
        false
    }

    fn abandon(&mut self) -> Abandoned {
        let mut subscribes: Vec<Vec<String>> = self.subscribes.drain().map(|(_, t)| t).collect();
        subscribes.extend(self.queued_subscribes.drain(..));
        let publishes = self.publishes.drain().count() + self.queued_publishes.drain(..).count();
        self.unsubscribes.clear();
        self.queued_unsubscribes.clear();
        Abandoned {
            subscribes,
            unsubscribed: self.unsubscribe_batch.take().map(|batch| batch.confirmed),
            publishes,
        }
    }

    fn clear(&mut self) {
        *self = Self::default();
    }
}

/// State shared between the engine handle and its driver task
struct Shared {
    listener: Arc<dyn EngineListener>,
    eventloop: tokio::sync::Mutex<EventLoop>,
    tracker: Mutex<AckTracker>,
    server_uri: String,
    auto_reconnect: bool,
    connected: AtomicBool,
    connect_pending: AtomicBool,
    disconnecting: AtomicBool,
}

impl Shared {
    fn track<R>(&self, f: impl FnOnce(&mut AckTracker) -> R) -> Option<R> {
        match self.tracker.lock() {
            Ok(mut tracker) => Some(f(&mut tracker)),
            Err(_) => {
                warn!("Ack tracker lock poisoned");
                None
            }
        }
    }

    /// Handle one event; returns false when the driver should stop
    fn on_event(&self, event: Event) -> bool {
        trace!(?event, server = %self.server_uri, "Engine event");
        match event {
            Event::Incoming(Packet::ConnAck(_)) => {
                self.connected.store(true, Ordering::SeqCst);
                if self.connect_pending.swap(false, Ordering::SeqCst) {
                    info!(server = %self.server_uri, "Connected to broker");
                    self.listener.connect_complete(Ok(()));
                } else {
                    info!(server = %self.server_uri, "Connection to broker restored");
                    self.listener.connection_restored(&self.server_uri);
                }
            }
            Event::Incoming(Packet::Publish(publish)) => {
                self.listener.message_arrived(&publish.topic, &publish.payload);
            }
            Event::Incoming(Packet::SubAck(suback)) => {
                if let Some(Some(ack)) =
                    self.track(|t| t.suback(suback.pkid, &suback.return_codes))
                {
                    self.listener.subscribe_complete(ack);
                }
            }
            Event::Incoming(Packet::UnsubAck(unsuback)) => {
                if let Some(Some(confirmed)) = self.track(|t| t.unsuback(unsuback.pkid)) {
                    self.listener.unsubscribe_complete(confirmed);
                }
            }
            Event::Incoming(Packet::PubAck(puback)) => {
                if self.track(|t| t.publish_acked(puback.pkid, QoS::AtLeastOnce)) == Some(true) {
                    self.listener.publish_complete(Ok(()));
                }
            }
            Event::Incoming(Packet::PubComp(pubcomp)) => {
                if self.track(|t| t.publish_acked(pubcomp.pkid, QoS::ExactlyOnce)) == Some(true) {
                    self.listener.publish_complete(Ok(()));
                }
            }
            Event::Outgoing(Outgoing::Subscribe(pkid)) => {
                self.track(|t| t.subscribe_sent(pkid));
            }
            Event::Outgoing(Outgoing::Unsubscribe(pkid)) => {
                self.track(|t| t.unsubscribe_sent(pkid));
            }
            Event::Outgoing(Outgoing::Publish(pkid)) => {
                if self.track(|t| t.publish_sent(pkid)) == Some(true) {
                    self.listener.publish_complete(Ok(()));
                }
            }
            Event::Outgoing(Outgoing::Disconnect) => {
                self.connected.store(false, Ordering::SeqCst);
                self.disconnecting.store(false, Ordering::SeqCst);
                info!(server = %self.server_uri, "Disconnected from broker");
                self.listener.disconnect_complete(Ok(()));
                return false;
            }
            _ => {}
        }
        true
    }

    /// Handle a poll failure; returns true when the driver should retry
    fn on_error(&self, error: ConnectionError) -> bool {
        let was_connected = self.connected.swap(false, Ordering::SeqCst);
        self.fail_in_flight(&error);

        if self.connect_pending.swap(false, Ordering::SeqCst) {
            warn!(server = %self.server_uri, error = %error, "Connect failed");
            self.listener.connect_complete(Err(connect_failure(&error)));
            return false;
        }

        if self.disconnecting.swap(false, Ordering::SeqCst) {
            debug!(server = %self.server_uri, error = %error, "Connection closed while disconnecting");
            self.listener.disconnect_complete(Ok(()));
            return false;
        }

        if was_connected {
            warn!(server = %self.server_uri, error = %error, "Connection lost");
            self.listener.connection_lost(connection_lost(&error));
        } else if !self.auto_reconnect {
            self.listener.engine_exception(connect_failure(&error));
        } else {
            debug!(server = %self.server_uri, error = %error, "Reconnect attempt failed");
        }
        self.auto_reconnect
    }

    fn fail_in_flight(&self, error: &ConnectionError) {
        let Some(abandoned) = self.track(AckTracker::abandon) else {
            return;
        };
        for topics in abandoned.subscribes {
            self.listener.subscribe_complete(SubscribeAck {
                granted: Vec::new(),
                failed: topics,
            });
        }
        if let Some(confirmed) = abandoned.unsubscribed {
            self.listener.unsubscribe_complete(confirmed);
        }
        for _ in 0..abandoned.publishes {
            self.listener.publish_complete(Err(connection_lost(error)));
        }
    }
}

async fn drive(shared: Arc<Shared>) {
    let mut eventloop = shared.eventloop.lock().await;
    loop {
        match eventloop.poll().await {
            Ok(event) => {
                if !shared.on_event(event) {
                    break;
                }
            }
            Err(error) => {
                if !shared.on_error(error) {
                    break;
                }
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
    debug!(server = %shared.server_uri, "Engine driver stopped");
}

pub struct RumqttEngine {
    client: AsyncClient,
    shared: Arc<Shared>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl RumqttEngine {
    pub fn new(
        config: &SessionConfig,
        listener: Arc<dyn EngineListener>,
    ) -> Result<Self, ConfigError> {
        let options = configure_mqtt_options(config)?;
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        Ok(Self {
            client,
            shared: Arc::new(Shared {
                listener,
                eventloop: tokio::sync::Mutex::new(eventloop),
                tracker: Mutex::new(AckTracker::default()),
                server_uri: config.broker_uri(),
                auto_reconnect: config.auto_reconnect(),
                connected: AtomicBool::new(false),
                connect_pending: AtomicBool::new(false),
                disconnecting: AtomicBool::new(false),
            }),
            driver: Mutex::new(None),
        })
    }

    fn stop_driver(&self) {
        if let Ok(mut driver) = self.driver.lock() {
            if let Some(handle) = driver.take() {
                handle.abort();
            }
        }
    }

    fn start_driver(&self) {
        let handle = tokio::spawn(drive(self.shared.clone()));
        if let Ok(mut driver) = self.driver.lock() {
            if let Some(previous) = driver.replace(handle) {
                previous.abort();
            }
        }
    }

    fn ensure_connected(&self) -> Result<(), EngineError> {
        if self.shared.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EngineError::not_connected())
        }
    }
}

fn client_error(error: rumqttc::ClientError) -> EngineError {
    EngineError::from_error(reason::CLIENT_EXCEPTION, &error)
}

#[async_trait]
impl MqttEngine for RumqttEngine {
    async fn connect(&self, timeout: Duration) -> Result<(), EngineError> {
        if self.shared.connected.load(Ordering::SeqCst) {
            return Err(EngineError::already_connected());
        }
        self.stop_driver();
        self.shared
            .eventloop
            .lock()
            .await
            .network_options
            .set_connection_timeout(timeout.as_secs().max(1));
        self.shared.connect_pending.store(true, Ordering::SeqCst);
        debug!(server = %self.shared.server_uri, ?timeout, "Starting connect");
        self.start_driver();
        Ok(())
    }

    async fn subscribe(&self, subscriptions: &[Subscription]) -> Result<(), EngineError> {
        self.ensure_connected()?;
        let topics = subscriptions.iter().map(|s| s.topic.clone()).collect();
        self.shared.track(|t| t.queue_subscribe(topics));

        let filters = subscriptions
            .iter()
            .map(|s| SubscribeFilter::new(s.topic.clone(), engine_qos(s.qos)));
        if let Err(error) = self.client.subscribe_many(filters).await {
            self.shared.track(|t| t.queued_subscribes.pop_back());
            return Err(client_error(error));
        }
        Ok(())
    }

    async fn unsubscribe(&self, topics: &[String]) -> Result<(), EngineError> {
        self.ensure_connected()?;
        if topics.is_empty() {
            self.shared.listener.unsubscribe_complete(Vec::new());
            return Ok(());
        }
        self.shared.track(|t| t.queue_unsubscribe(topics));
        for topic in topics {
            if let Err(error) = self.client.unsubscribe(topic.clone()).await {
                self.shared.track(|t| {
                    t.queued_unsubscribes.clear();
                    t.unsubscribe_batch = None;
                });
                return Err(client_error(error));
            }
        }
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        options: PublishOptions,
    ) -> Result<(), EngineError> {
        self.ensure_connected()?;
        self.shared.track(|t| t.queue_publish(options.qos));
        if let Err(error) = self
            .client
            .publish_bytes(topic, engine_qos(options.qos), options.retain, payload)
            .await
        {
            self.shared.track(|t| t.queued_publishes.pop_back());
            return Err(client_error(error));
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), EngineError> {
        self.ensure_connected()?;
        if self.shared.disconnecting.swap(true, Ordering::SeqCst) {
            return Err(EngineError::new(
                reason::CLIENT_DISCONNECTING,
                "Client is currently disconnecting",
            ));
        }
        if let Err(error) = self.client.disconnect().await {
            self.shared.disconnecting.store(false, Ordering::SeqCst);
            return Err(client_error(error));
        }
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), EngineError> {
        if self.shared.connected.load(Ordering::SeqCst) {
            return Err(EngineError::already_connected());
        }
        debug!(server = %self.shared.server_uri, "Starting reconnect");
        self.stop_driver();
        self.start_driver();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn halt(&self) {
        self.stop_driver();
        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.connect_pending.store(false, Ordering::SeqCst);
        self.shared.disconnecting.store(false, Ordering::SeqCst);
        self.shared.track(AckTracker::clear);
    }
}

impl Drop for RumqttEngine {
    fn drop(&mut self) {
        self.stop_driver();
    }
}

/// Default factory used by the bridge binary
#[derive(Debug, Clone, Copy, Default)]
pub struct RumqttEngineFactory;

impl EngineFactory for RumqttEngineFactory {
    fn create(
        &self,
        config: &SessionConfig,
        listener: Arc<dyn EngineListener>,
    ) -> Result<Arc<dyn MqttEngine>, ConfigError> {
        Ok(Arc::new(RumqttEngine::new(config, listener)?))
    }
}
