//! Resilient message publishing to a broker exchange.
//!
//! The broker is abstracted behind three small traits so the reconnect state
//! machine can be driven by RabbitMQ (`amqp` feature) or by the in-memory
//! [`mock::MockBroker`] in tests:
//!
//! - [`Broker`]: dials a connection and reports its loss through a [`CloseHandle`]
//! - [`BrokerConnection`]: opens logical channels
//! - [`BrokerChannel`]: declares the exchange, arms confirms, publishes
//!
//! [`ResilientPublisher`] owns the state machine and exposes the
//! [`Publisher`] contract to the bridge.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Deserialize;
use tokio::sync::mpsc;

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod credentials;
pub mod mock;
pub mod resilient;
pub mod signal;

#[cfg(feature = "amqp")]
pub use amqp::{AmqpEndpoint, LapinBroker};
pub use credentials::{CredentialSource, Credentials, StaticCredentials};
pub use resilient::{ConfirmCounts, ResilientPublisher};
pub use signal::{close_signal, CloseHandle, CloseListener};

/// Content type of every published message.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Default pause between reconnect attempts.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

/// Result type for publisher operations.
pub type Result<T> = std::result::Result<T, PublisherError>;

/// Errors from publisher operations.
#[derive(Debug, thiserror::Error)]
pub enum PublisherError {
    /// No usable channel right now. Transient; see [`Publisher::wait_until_ready`].
    #[error("Publisher not ready")]
    NotReady,

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Exchange declaration failed: {0}")]
    Declare(String),

    #[error("Confirm mode failed: {0}")]
    Confirm(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("Credentials unavailable: {0}")]
    Credentials(String),
}

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherState {
    Disconnected,
    Connecting,
    /// Channel open and exchange declared.
    Connected,
    /// Connected, with publisher confirms enabled.
    ConfirmArmed,
}

impl PublisherState {
    pub fn is_ready(&self) -> bool {
        matches!(self, PublisherState::Connected | PublisherState::ConfirmArmed)
    }
}

impl fmt::Display for PublisherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PublisherState::Disconnected => "disconnected",
            PublisherState::Connecting => "connecting",
            PublisherState::Connected => "connected",
            PublisherState::ConfirmArmed => "confirm-armed",
        };
        f.write_str(name)
    }
}

/// String-valued message headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// One outgoing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub headers: Headers,
    pub content_type: String,
    pub reply_to: Option<String>,
}

/// Exchange type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeType {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
    /// Plugin-provided type such as `x-consistent-hash`.
    #[serde(untagged)]
    Custom(String),
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeType::Direct => f.write_str("direct"),
            ExchangeType::Fanout => f.write_str("fanout"),
            ExchangeType::Topic => f.write_str("topic"),
            ExchangeType::Headers => f.write_str("headers"),
            ExchangeType::Custom(kind) => f.write_str(kind),
        }
    }
}

/// Exchange declared on every new channel. Always durable, never
/// auto-deleted or internal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeType,
}

/// Settings for [`ResilientPublisher`].
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub exchange: ExchangeSpec,
    /// Arm publisher confirms on each channel.
    pub confirms: bool,
    pub reconnect_interval: Duration,
    /// Attached to every message when set.
    pub reply_to: Option<String>,
}

impl PublisherConfig {
    pub fn new(exchange: ExchangeSpec) -> Self {
        Self {
            exchange,
            confirms: true,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            reply_to: None,
        }
    }
}

/// Client TLS material on disk.
///
/// `ca` is a PEM CA chain. `identity` is a PKCS#12 archive holding the client
/// certificate and its private key, sealed with `password` (may be empty).
#[derive(Clone, PartialEq, Eq)]
pub struct TlsBundle {
    pub ca: PathBuf,
    pub identity: PathBuf,
    pub password: String,
}

impl fmt::Debug for TlsBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsBundle")
            .field("ca", &self.ca)
            .field("identity", &self.identity)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Broker verdict on one published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmOutcome {
    Ack,
    Nack,
    /// The channel went away before the broker answered.
    Lost(String),
}

/// A publish awaiting its broker confirmation.
pub struct PendingConfirm {
    pub delivery_tag: u64,
    pub outcome: BoxFuture<'static, ConfirmOutcome>,
}

impl fmt::Debug for PendingConfirm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingConfirm")
            .field("delivery_tag", &self.delivery_tag)
            .finish_non_exhaustive()
    }
}

/// Confirmations in publish order.
pub type ConfirmStream = mpsc::UnboundedReceiver<PendingConfirm>;

/// Dials broker connections.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Open a connection. The implementation must fire `on_close` when the
    /// connection is lost for any reason after this returns.
    async fn connect(
        &self,
        credentials: &Credentials,
        on_close: CloseHandle,
    ) -> Result<Box<dyn BrokerConnection>>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>>;

    /// Best-effort graceful close.
    async fn close(&self);
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Idempotent declaration.
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<()>;

    /// Switch the channel into confirm mode. Every later publish yields one
    /// [`PendingConfirm`] on the returned stream.
    async fn enable_confirms(&self) -> Result<ConfirmStream>;

    async fn publish(&self, message: &Message) -> Result<()>;
}

/// What the bridge needs from a publisher.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish one JSON body. Fails fast with [`PublisherError::NotReady`]
    /// while no channel is usable; never waits for reconnection.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        headers: &Headers,
    ) -> Result<()>;

    /// Resolve once the publisher is connected.
    async fn wait_until_ready(&self);
}
