//! Session configuration and its resolver
//!
//! A [`SessionConfig`] is built once through [`SessionConfigBuilder`] and never
//! mutated afterwards. The builder accepts either a broker URI or discrete
//! host/port/protocol fields and keeps the TLS flag consistent with the
//! protocol.

use crate::config::ConfigError;
use crate::protocol::messages::QoS;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

pub const DEFAULT_KEEPALIVE_SECS: u16 = 60;
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_PROTOCOL_VERSION: u8 = 4;

/// Transport used to reach the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Protocol {
    #[default]
    #[serde(alias = "tcp")]
    Tcp,
    #[serde(alias = "tcp_tls")]
    TcpTls,
    #[serde(alias = "ws")]
    Ws,
    #[serde(alias = "wss")]
    Wss,
}

impl Protocol {
    /// Whether this transport mandates TLS
    pub fn requires_tls(self) -> bool {
        matches!(self, Protocol::TcpTls | Protocol::Wss)
    }

    pub fn is_websocket(self) -> bool {
        matches!(self, Protocol::Ws | Protocol::Wss)
    }

    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Tcp => 1883,
            Protocol::TcpTls => 8883,
            Protocol::Ws => 80,
            Protocol::Wss => 443,
        }
    }

    /// Scheme used when rendering a broker URI
    pub fn scheme(self) -> &'static str {
        match self {
            Protocol::Tcp => "mqtt",
            Protocol::TcpTls => "mqtts",
            Protocol::Ws => "ws",
            Protocol::Wss => "wss",
        }
    }

    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "mqtt" | "tcp" => Some(Protocol::Tcp),
            "mqtts" | "ssl" | "tls" => Some(Protocol::TcpTls),
            "ws" => Some(Protocol::Ws),
            "wss" => Some(Protocol::Wss),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Protocol::Tcp => "TCP",
            Protocol::TcpTls => "TCP_TLS",
            Protocol::Ws => "WS",
            Protocol::Wss => "WSS",
        };
        f.write_str(name)
    }
}

/// Message the broker publishes on the session's behalf after an unclean disconnect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

impl Will {
    pub fn new<T: Into<String>, P: Into<Bytes>>(topic: T, payload: P) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}

/// Certificate and keystore material, kept as base64 text.
///
/// Content is not validated here; the engine adapter decodes it when the
/// session is created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertificateMaterial {
    pub ca_base64: Option<String>,
    pub certificate_base64: Option<String>,
    pub private_key_base64: Option<String>,
    pub keystore_password: Option<String>,
}

impl CertificateMaterial {
    /// Whether any client-side certificate material was supplied
    pub fn has_client_certificate(&self) -> bool {
        self.certificate_base64.is_some() || self.private_key_base64.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.ca_base64.is_none() && !self.has_client_certificate()
    }
}

/// Fully resolved, immutable configuration of one session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    client_id: String,
    host: String,
    port: u16,
    protocol: Protocol,
    tls: bool,
    username: Option<String>,
    password: Option<String>,
    keepalive: Duration,
    protocol_version: u8,
    clean_session: bool,
    connection_timeout: Duration,
    will: Option<Will>,
    certificates: CertificateMaterial,
    auto_reconnect: bool,
    path: String,
}

impl SessionConfig {
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn tls(&self) -> bool {
        self.tls
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub fn keepalive(&self) -> Duration {
        self.keepalive
    }

    pub fn protocol_version(&self) -> u8 {
        self.protocol_version
    }

    pub fn clean_session(&self) -> bool {
        self.clean_session
    }

    pub fn connection_timeout(&self) -> Duration {
        self.connection_timeout
    }

    pub fn will(&self) -> Option<&Will> {
        self.will.as_ref()
    }

    pub fn certificates(&self) -> &CertificateMaterial {
        &self.certificates
    }

    pub fn auto_reconnect(&self) -> bool {
        self.auto_reconnect
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Render the broker address as `<scheme>://host:port<path>`
    pub fn broker_uri(&self) -> String {
        let path = if self.protocol.is_websocket() {
            self.path.as_str()
        } else {
            ""
        };
        format!(
            "{}://{}:{}{}",
            self.protocol.scheme(),
            self.host,
            self.port,
            path
        )
    }
}

/// Broker address extracted from a URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
    pub path: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Parse `scheme://[user[:pass]@]host[:port][/path]` into a broker address
pub fn parse_broker_url(uri: &str) -> Result<BrokerAddress, ConfigError> {
    if !uri.contains("://") {
        return Err(ConfigError::MissingProtocol(uri.to_string()));
    }

    let url = Url::parse(uri).map_err(|e| ConfigError::InvalidBrokerUrl {
        url: uri.to_string(),
        reason: e.to_string(),
    })?;

    let protocol = Protocol::from_scheme(url.scheme())
        .ok_or_else(|| ConfigError::UnsupportedScheme(url.scheme().to_string()))?;

    let host = url
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| ConfigError::InvalidBrokerUrl {
            url: uri.to_string(),
            reason: "missing host".to_string(),
        })?
        .to_string();

    let path = match url.path() {
        "/" => String::new(),
        other => other.to_string(),
    };

    let username = Some(url.username())
        .filter(|name| !name.is_empty())
        .map(str::to_string);

    Ok(BrokerAddress {
        host,
        port: url.port().unwrap_or_else(|| protocol.default_port()),
        protocol,
        path,
        username,
        password: url.password().map(str::to_string),
    })
}

/// Resolver that turns partial caller input into a [`SessionConfig`]
#[derive(Debug, Clone, Default)]
pub struct SessionConfigBuilder {
    client_id: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    protocol: Option<Protocol>,
    tls: Option<bool>,
    username: Option<String>,
    password: Option<String>,
    keepalive_secs: Option<u16>,
    protocol_version: Option<u8>,
    clean_session: Option<bool>,
    connection_timeout: Option<Duration>,
    will: Option<Will>,
    certificates: CertificateMaterial,
    auto_reconnect: bool,
    path: Option<String>,
}

impl SessionConfigBuilder {
    /// Take host, port, protocol, path and credentials from a broker URI
    pub fn uri(mut self, uri: &str) -> Result<Self, ConfigError> {
        if self.host.is_some() {
            return Err(ConfigError::RedundantAddress(uri.to_string()));
        }
        let address = parse_broker_url(uri)?;
        self.check_tls(address.protocol, self.tls)?;

        self.host = Some(address.host);
        self.port = Some(address.port);
        self.protocol = Some(address.protocol);
        if !address.path.is_empty() {
            self.path = Some(address.path);
        }
        if address.username.is_some() {
            self.username = address.username;
            self.password = address.password;
        }
        Ok(self)
    }

    /// Set the broker address from discrete fields.
    ///
    /// A host that already carries a scheme is rejected; use [`Self::uri`].
    pub fn address<H: Into<String>>(
        mut self,
        host: H,
        port: u16,
        protocol: Protocol,
    ) -> Result<Self, ConfigError> {
        let host = host.into();
        if host.contains("://") {
            return Err(ConfigError::RedundantAddress(host));
        }
        if host.is_empty() {
            return Err(ConfigError::MissingHost);
        }
        if self.host.is_some() {
            return Err(ConfigError::RedundantAddress(host));
        }
        self.check_tls(protocol, self.tls)?;

        self.host = Some(host);
        self.port = Some(port);
        self.protocol = Some(protocol);
        Ok(self)
    }

    /// Request TLS explicitly; must agree with the protocol
    pub fn tls(mut self, tls: bool) -> Result<Self, ConfigError> {
        if let Some(protocol) = self.protocol {
            self.check_tls(protocol, Some(tls))?;
        }
        self.tls = Some(tls);
        Ok(self)
    }

    pub fn client_id<S: Into<String>>(mut self, client_id: S) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn credentials<U: Into<String>, P: Into<String>>(mut self, username: U, password: P) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn username<S: Into<String>>(mut self, username: S) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn password<S: Into<String>>(mut self, password: S) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn keepalive_secs(mut self, secs: u16) -> Self {
        self.keepalive_secs = Some(secs);
        self
    }

    pub fn protocol_version(mut self, version: u8) -> Self {
        self.protocol_version = Some(version);
        self
    }

    pub fn clean_session(mut self, clean: bool) -> Self {
        self.clean_session = Some(clean);
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = Some(timeout);
        self
    }

    pub fn will(mut self, will: Will) -> Self {
        self.will = Some(will);
        self
    }

    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Websocket path, e.g. `/mqtt`
    pub fn path<S: Into<String>>(mut self, path: S) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Trust anchor in base64 (PEM content)
    pub fn ca_base64<S: Into<String>>(mut self, ca: S) -> Self {
        self.certificates.ca_base64 = Some(ca.into());
        self
    }

    /// Trust anchor from raw PEM bytes
    pub fn ca_pem(self, pem: &[u8]) -> Self {
        self.ca_base64(STANDARD.encode(pem))
    }

    /// Client certificate, private key and the keystore password protecting them
    pub fn client_certificate<C, K>(mut self, certificate: C, private_key: K, password: Option<String>) -> Self
    where
        C: Into<String>,
        K: Into<String>,
    {
        self.certificates.certificate_base64 = Some(certificate.into());
        self.certificates.private_key_base64 = Some(private_key.into());
        self.certificates.keystore_password = password;
        self
    }

    pub fn keystore_password<S: Into<String>>(mut self, password: S) -> Self {
        self.certificates.keystore_password = Some(password.into());
        self
    }

    /// Validate the collected input and produce an immutable config
    pub fn build(self) -> Result<SessionConfig, ConfigError> {
        let host = self.host.clone().ok_or(ConfigError::MissingHost)?;
        let protocol = self.protocol.unwrap_or_default();
        self.check_tls(protocol, self.tls)?;

        if self.certificates.has_client_certificate()
            && self.certificates.keystore_password.is_none()
        {
            return Err(ConfigError::MissingKeystorePassword);
        }

        let client_id = self
            .client_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Ok(SessionConfig {
            client_id,
            host,
            port: self.port.unwrap_or_else(|| protocol.default_port()),
            protocol,
            tls: protocol.requires_tls(),
            username: self.username,
            password: self.password,
            keepalive: Duration::from_secs(u64::from(
                self.keepalive_secs.unwrap_or(DEFAULT_KEEPALIVE_SECS),
            )),
            protocol_version: self.protocol_version.unwrap_or(DEFAULT_PROTOCOL_VERSION),
            clean_session: self.clean_session.unwrap_or(true),
            connection_timeout: self.connection_timeout.unwrap_or(DEFAULT_CONNECTION_TIMEOUT),
            will: self.will,
            certificates: self.certificates,
            auto_reconnect: self.auto_reconnect,
            path: self.path.unwrap_or_default(),
        })
    }

    fn check_tls(&self, protocol: Protocol, requested: Option<bool>) -> Result<(), ConfigError> {
        match requested {
            Some(tls) if tls != protocol.requires_tls() => {
                Err(ConfigError::TlsConflict { protocol, tls })
            }
            _ => Ok(()),
        }
    }
}
