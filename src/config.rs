//! Bridge configuration file
//!
//! A TOML file lists the sessions the bridge runner opens at start-up. Each
//! `[[sessions]]` table resolves through [`SessionConfigBuilder`], so the
//! file obeys the same address, TLS and certificate rules as programmatic
//! callers. Secrets are referenced by environment variable name.

use crate::protocol::messages::{QoS, Subscription};
use crate::protocol::options::{Protocol, SessionConfig, SessionConfigBuilder, Will};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Top-level bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeConfig {
    /// Capacity of the shared event channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    #[serde(default)]
    pub sessions: Vec<SessionSection>,
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            event_capacity: default_event_capacity(),
            sessions: Vec::new(),
        }
    }
}

/// One session to open
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SessionSection {
    /// Label used in logs
    pub name: String,
    /// Broker URI, e.g. `mqtts://broker:8883`; exclusive with `host`
    pub broker_url: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub protocol: Option<Protocol>,
    pub tls: Option<bool>,
    pub client_id: Option<String>,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    pub keepalive_secs: Option<u16>,
    pub protocol_version: Option<u8>,
    pub clean_session: Option<bool>,
    pub connection_timeout_secs: Option<u64>,
    #[serde(default)]
    pub auto_reconnect: bool,
    pub path: Option<String>,
    pub will: Option<WillSection>,
    pub certificates: Option<CertificateSection>,
    #[serde(default)]
    pub subscriptions: Vec<Subscription>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WillSection {
    pub topic: String,
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub qos: QoS,
    #[serde(default)]
    pub retain: bool,
}

/// Certificate material, base64 of the PEM content
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CertificateSection {
    pub ca_base64: Option<String>,
    pub certificate_base64: Option<String>,
    pub private_key_base64: Option<String>,
    /// Environment variable containing the keystore password
    pub keystore_password_env: Option<String>,
}

/// Configuration errors, raised synchronously before any session exists
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("No broker host has been set")]
    MissingHost,
    #[error("Broker address '{0}' has no protocol; use scheme://host[:port]")]
    MissingProtocol(String),
    #[error("Invalid broker URL '{url}': {reason}")]
    InvalidBrokerUrl { url: String, reason: String },
    #[error("Unsupported broker URL scheme: {0}")]
    UnsupportedScheme(String),
    #[error("Broker address '{0}' is ambiguous; set either a URI or discrete host fields")]
    RedundantAddress(String),
    #[error("tls={tls} conflicts with protocol {protocol}")]
    TlsConflict { protocol: Protocol, tls: bool },
    #[error("Client certificate material requires a keystore password")]
    MissingKeystorePassword,
    #[error("Invalid certificate material: {0}")]
    InvalidCertificate(String),
    #[error("Unsupported MQTT protocol version {0}")]
    UnsupportedProtocolVersion(u8),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl BridgeConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: BridgeConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.event_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "event_capacity must be greater than zero".to_string(),
            ));
        }
        let mut names = std::collections::HashSet::new();
        for session in &self.sessions {
            if session.name.is_empty() {
                return Err(ConfigError::InvalidConfig(
                    "every session needs a name".to_string(),
                ));
            }
            if !names.insert(session.name.as_str()) {
                return Err(ConfigError::InvalidConfig(format!(
                    "duplicate session name '{}'",
                    session.name
                )));
            }
        }
        Ok(())
    }

    pub fn session(&self, name: &str) -> Option<&SessionSection> {
        self.sessions.iter().find(|session| session.name == name)
    }
}

impl SessionSection {
    /// Resolve this section into a [`SessionConfig`], reading referenced env vars
    pub fn to_session_config(&self) -> Result<SessionConfig, ConfigError> {
        let mut builder = SessionConfigBuilder::default();

        if let Some(tls) = self.tls {
            builder = builder.tls(tls)?;
        }

        builder = match (&self.broker_url, &self.host) {
            (Some(_), Some(_)) => {
                return Err(ConfigError::InvalidConfig(format!(
                    "session '{}' sets both broker_url and host",
                    self.name
                )))
            }
            (Some(url), None) => builder.uri(url)?,
            (None, Some(host)) => {
                let protocol = self
                    .protocol
                    .ok_or_else(|| ConfigError::MissingProtocol(host.clone()))?;
                let port = self.port.unwrap_or_else(|| protocol.default_port());
                builder.address(host.as_str(), port, protocol)?
            }
            (None, None) => builder,
        };

        if let Some(client_id) = &self.client_id {
            builder = builder.client_id(client_id.as_str());
        }
        if let Some(username) = get_env_var_optional(self.username_env.as_ref()) {
            builder = builder.username(username);
        }
        if let Some(password) = get_env_var_optional(self.password_env.as_ref()) {
            builder = builder.password(password);
        }
        if let Some(secs) = self.keepalive_secs {
            builder = builder.keepalive_secs(secs);
        }
        if let Some(version) = self.protocol_version {
            builder = builder.protocol_version(version);
        }
        if let Some(clean) = self.clean_session {
            builder = builder.clean_session(clean);
        }
        if let Some(secs) = self.connection_timeout_secs {
            builder = builder.connection_timeout(Duration::from_secs(secs));
        }
        if let Some(path) = &self.path {
            builder = builder.path(path.as_str());
        }
        if let Some(will) = &self.will {
            builder = builder.will(
                Will::new(will.topic.as_str(), will.payload.clone().into_bytes())
                    .with_qos(will.qos)
                    .with_retain(will.retain),
            );
        }
        if let Some(certificates) = &self.certificates {
            if let Some(ca) = &certificates.ca_base64 {
                builder = builder.ca_base64(ca.as_str());
            }
            if let (Some(cert), Some(key)) = (
                &certificates.certificate_base64,
                &certificates.private_key_base64,
            ) {
                let password = match &certificates.keystore_password_env {
                    Some(name) => Some(get_env_var_required(name)?),
                    None => None,
                };
                builder = builder.client_certificate(cert.as_str(), key.as_str(), password);
            } else if certificates.certificate_base64.is_some()
                || certificates.private_key_base64.is_some()
            {
                return Err(ConfigError::InvalidCertificate(
                    "certificate_base64 and private_key_base64 must be set together".to_string(),
                ));
            }
        }

        builder.auto_reconnect(self.auto_reconnect).build()
    }
}

fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
    env_var_name.and_then(|name| std::env::var(name).ok())
}

fn get_env_var_required(env_var_name: &str) -> Result<String, ConfigError> {
    std::env::var(env_var_name).map_err(|_| ConfigError::EnvVarNotFound(env_var_name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sessions() {
        let toml_content = r#"
event_capacity = 64

[[sessions]]
name = "telemetry"
broker_url = "mqtts://broker.example.com:8883"
keepalive_secs = 30
auto_reconnect = true

[[sessions.subscriptions]]
topic = "sensors/+/temperature"
qos = 1

[[sessions]]
name = "web"
host = "test.broker"
port = 8080
protocol = "WS"
path = "/mqtt"
"#;

        let config: BridgeConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.event_capacity, 64);
        assert_eq!(config.sessions.len(), 2);

        let telemetry = config.session("telemetry").unwrap().to_session_config().unwrap();
        assert_eq!(telemetry.protocol(), Protocol::TcpTls);
        assert!(telemetry.tls());
        assert_eq!(telemetry.keepalive(), Duration::from_secs(30));
        assert!(telemetry.auto_reconnect());
        assert_eq!(config.sessions[0].subscriptions[0].qos, QoS::AtLeastOnce);

        let web = config.session("web").unwrap().to_session_config().unwrap();
        assert_eq!(web.broker_uri(), "ws://test.broker:8080/mqtt");
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config: BridgeConfig = toml::from_str("").unwrap();
        assert_eq!(config.event_capacity, 1024);
        assert!(config.sessions.is_empty());
    }

    #[test]
    fn test_both_url_and_host_rejected() {
        let section = SessionSection {
            name: "both".to_string(),
            broker_url: Some("mqtt://a".to_string()),
            host: Some("b".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            section.to_session_config(),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_section_without_address_fails() {
        let section = SessionSection {
            name: "empty".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            section.to_session_config(),
            Err(ConfigError::MissingHost)
        ));
    }

    #[test]
    fn test_host_without_protocol_fails() {
        let section = SessionSection {
            name: "bare".to_string(),
            host: Some("broker".to_string()),
            port: Some(1883),
            ..Default::default()
        };
        assert!(matches!(
            section.to_session_config(),
            Err(ConfigError::MissingProtocol(host)) if host == "broker"
        ));
    }

    #[test]
    fn test_tls_conflict_from_file() {
        let section = SessionSection {
            name: "conflict".to_string(),
            broker_url: Some("mqtts://broker".to_string()),
            tls: Some(false),
            ..Default::default()
        };
        assert!(matches!(
            section.to_session_config(),
            Err(ConfigError::TlsConflict { .. })
        ));
    }

    #[test]
    fn test_credentials_from_env() {
        std::env::set_var("MQTT_BRIDGE_TEST_USER", "alice");
        std::env::set_var("MQTT_BRIDGE_TEST_PASS", "s3cret");
        let section = SessionSection {
            name: "creds".to_string(),
            host: Some("broker".to_string()),
            protocol: Some(Protocol::Tcp),
            username_env: Some("MQTT_BRIDGE_TEST_USER".to_string()),
            password_env: Some("MQTT_BRIDGE_TEST_PASS".to_string()),
            ..Default::default()
        };
        let config = section.to_session_config().unwrap();
        assert_eq!(config.username(), Some("alice"));
        assert_eq!(config.password(), Some("s3cret"));
        assert_eq!(config.port(), 1883);
    }

    #[test]
    fn test_missing_keystore_password_env() {
        let section = SessionSection {
            name: "mtls".to_string(),
            broker_url: Some("mqtts://broker".to_string()),
            certificates: Some(CertificateSection {
                certificate_base64: Some("Y2VydA==".to_string()),
                private_key_base64: Some("a2V5".to_string()),
                keystore_password_env: Some("MQTT_BRIDGE_TEST_UNSET_KEYSTORE".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(matches!(
            section.to_session_config(),
            Err(ConfigError::EnvVarNotFound(name)) if name == "MQTT_BRIDGE_TEST_UNSET_KEYSTORE"
        ));
    }

    #[test]
    fn test_certificate_without_password_env() {
        let section = SessionSection {
            name: "mtls".to_string(),
            broker_url: Some("mqtts://broker".to_string()),
            certificates: Some(CertificateSection {
                certificate_base64: Some("Y2VydA==".to_string()),
                private_key_base64: Some("a2V5".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(matches!(
            section.to_session_config(),
            Err(ConfigError::MissingKeystorePassword)
        ));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let config = BridgeConfig {
            event_capacity: 16,
            sessions: vec![
                SessionSection {
                    name: "a".to_string(),
                    ..Default::default()
                },
                SessionSection {
                    name: "a".to_string(),
                    ..Default::default()
                },
            ],
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_will_section() {
        let toml_content = r#"
[[sessions]]
name = "will"
host = "broker"
protocol = "tcp"

[sessions.will]
topic = "clients/will/status"
payload = "offline"
qos = 1
retain = true
"#;
        let config: BridgeConfig = toml::from_str(toml_content).unwrap();
        let session = config.sessions[0].to_session_config().unwrap();
        let will = session.will().unwrap();
        assert_eq!(will.topic, "clients/will/status");
        assert_eq!(&will.payload[..], b"offline");
        assert_eq!(will.qos, QoS::AtLeastOnce);
        assert!(will.retain);
    }
}
