//! Broker configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::publisher::{ExchangeSpec, ExchangeType, PublisherConfig, TlsBundle};

/// AMQP broker settings.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct AmqpConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    pub exchange: String,
    pub exchange_type: ExchangeType,
    pub routing_key: String,
    /// Publish without broker confirmations.
    pub skip_confirms: bool,
    pub reconnect_interval_ms: u64,
    pub reply_to: Option<String>,
    pub tls: TlsConfig,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            user: "guest".to_string(),
            password: "guest".to_string(),
            vhost: "/".to_string(),
            exchange: "conntrack".to_string(),
            exchange_type: ExchangeType::Direct,
            routing_key: String::new(),
            skip_confirms: false,
            reconnect_interval_ms: 1000,
            reply_to: None,
            tls: TlsConfig::default(),
        }
    }
}

impl std::fmt::Debug for AmqpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("vhost", &self.vhost)
            .field("exchange", &self.exchange)
            .field("exchange_type", &self.exchange_type)
            .field("routing_key", &self.routing_key)
            .field("skip_confirms", &self.skip_confirms)
            .field("reconnect_interval_ms", &self.reconnect_interval_ms)
            .field("reply_to", &self.reply_to)
            .field("tls", &self.tls)
            .finish()
    }
}

impl AmqpConfig {
    pub fn publisher_config(&self) -> PublisherConfig {
        PublisherConfig {
            exchange: ExchangeSpec {
                name: self.exchange.clone(),
                kind: self.exchange_type.clone(),
            },
            confirms: !self.skip_confirms,
            reconnect_interval: Duration::from_millis(self.reconnect_interval_ms),
            reply_to: self.reply_to.clone(),
        }
    }

    #[cfg(feature = "amqp")]
    pub fn endpoint(&self) -> crate::publisher::AmqpEndpoint {
        crate::publisher::AmqpEndpoint {
            host: self.host.clone(),
            port: self.port,
            vhost: self.vhost.clone(),
        }
    }
}

/// Client TLS files. Used only when both `ca` and `identity` are set.
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// PEM CA certificate(s) trusted for the broker.
    pub ca: Option<PathBuf>,
    /// PKCS#12 archive with the client certificate and key.
    pub identity: Option<PathBuf>,
    /// Password of the `identity` archive; empty when unset.
    pub identity_password: Option<String>,
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig")
            .field("ca", &self.ca)
            .field("identity", &self.identity)
            .field(
                "identity_password",
                &self.identity_password.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

impl TlsConfig {
    /// The complete bundle, or `None` for a plaintext dial.
    pub fn bundle(&self) -> Option<TlsBundle> {
        match (&self.ca, &self.identity) {
            (Some(ca), Some(identity)) => Some(TlsBundle {
                ca: ca.clone(),
                identity: identity.clone(),
                password: self.identity_password.clone().unwrap_or_default(),
            }),
            (None, None) => None,
            _ => {
                warn!(
                    ca = self.ca.is_some(),
                    identity = self.identity.is_some(),
                    "Incomplete TLS bundle, connecting without TLS"
                );
                None
            }
        }
    }
}
