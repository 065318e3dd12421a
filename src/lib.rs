//! MQTT session bridge
//!
//! Keeps any number of independent MQTT client sessions behind opaque
//! [`ClientReference`]s. Commands are addressed by reference and resolve
//! once the broker has answered; everything that happens on a session is
//! published as a [`BridgeEvent`] on one shared channel.
//!
//! # Quick Start
//!
//! ```no_run
//! use mqtt_bridge::{
//!     MqttClient, PublishOptions, QoS, RumqttEngineFactory, SessionConfig, SessionRegistry,
//!     Subscription,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Arc::new(SessionRegistry::new(Arc::new(RumqttEngineFactory)));
//! let config = SessionConfig::builder()
//!     .uri("mqtt://localhost:1883")?
//!     .client_id("example")
//!     .build()?;
//!
//! let client = MqttClient::create(registry, config).await?;
//! client.on_message(|topic, payload| println!("{topic}: {} bytes", payload.len()));
//! client.connect().await?;
//! client
//!     .subscribe(&[Subscription::new("sensors/#", QoS::AtLeastOnce)])
//!     .await?;
//! client
//!     .publish("sensors/kitchen", b"21.5".to_vec(), PublishOptions::default())
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod config;
pub mod engine;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod testing;

pub use bridge::{ClientEvent, ClientReference, EventBus, EventStream, MqttClient, SessionRegistry};
pub use config::{BridgeConfig, ConfigError};
pub use engine::{
    EngineError, EngineFactory, EngineListener, MqttEngine, RumqttEngineFactory, SubscribeAck,
};
pub use error::{BridgeError, BridgeResult};
pub use protocol::{
    BridgeEvent, ErrorPayload, EventKind, Protocol, PublishOptions, QoS, SessionConfig,
    Subscription, Will,
};
