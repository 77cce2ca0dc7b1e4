//! RabbitMQ broker adapter built on lapin.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures::FutureExt;
use lapin::{
    options::{BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions},
    publisher_confirm::Confirmation,
    tcp::{OwnedIdentity, OwnedTLSConfig},
    types::{AMQPValue, FieldTable, LongString, ShortString},
    uri::{AMQPAuthority, AMQPScheme, AMQPUri, AMQPUserInfo},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use super::{
    Broker, BrokerChannel, BrokerConnection, CloseHandle, ConfirmOutcome, ConfirmStream,
    Credentials, ExchangeSpec, ExchangeType, Message, PendingConfirm, PublisherError, Result,
    TlsBundle,
};

/// AMQP delivery mode for messages that survive a broker restart.
const PERSISTENT: u8 = 2;

/// Where the broker lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmqpEndpoint {
    pub host: String,
    pub port: u16,
    pub vhost: String,
}

/// Dials RabbitMQ, with mutual TLS when a complete bundle is configured.
#[derive(Debug, Clone)]
pub struct LapinBroker {
    endpoint: AmqpEndpoint,
    tls: Option<TlsBundle>,
}

impl LapinBroker {
    pub fn new(endpoint: AmqpEndpoint, tls: Option<TlsBundle>) -> Self {
        Self { endpoint, tls }
    }

    fn uri(&self, credentials: &Credentials) -> AMQPUri {
        let vhost = if self.endpoint.vhost.is_empty() {
            "/".to_string()
        } else {
            self.endpoint.vhost.clone()
        };

        AMQPUri {
            scheme: if self.tls.is_some() {
                AMQPScheme::AMQPS
            } else {
                AMQPScheme::AMQP
            },
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: credentials.user.clone(),
                    password: credentials.password.clone(),
                },
                host: self.endpoint.host.clone(),
                port: self.endpoint.port,
            },
            vhost,
            ..Default::default()
        }
    }

    /// Loggable location, without the password.
    fn display_url(&self, credentials: &Credentials) -> String {
        let scheme = if self.tls.is_some() { "amqps" } else { "amqp" };
        format!(
            "{scheme}://{}@{}:{}/{}",
            credentials.user,
            self.endpoint.host,
            self.endpoint.port,
            self.endpoint.vhost.trim_start_matches('/')
        )
    }
}

#[async_trait]
impl Broker for LapinBroker {
    async fn connect(
        &self,
        credentials: &Credentials,
        on_close: CloseHandle,
    ) -> Result<Box<dyn BrokerConnection>> {
        let uri = self.uri(credentials);
        let url = self.display_url(credentials);
        debug!(url = %url, "Dialing AMQP broker");

        let connection = match &self.tls {
            Some(bundle) => {
                let tls = load_tls(bundle).await?;
                Connection::connect_uri_with_config(uri, ConnectionProperties::default(), tls).await
            }
            None => Connection::connect_uri(uri, ConnectionProperties::default()).await,
        }
        .map_err(|e| PublisherError::Connection(format!("Failed to connect to {url}: {e}")))?;

        let closed = on_close.clone();
        connection.on_error(move |e| {
            closed.fire(format!("connection error: {e}"));
        });

        info!(url = %url, "Connected to AMQP");
        Ok(Box::new(LapinConnection {
            connection,
            closed: on_close,
        }))
    }
}

struct LapinConnection {
    connection: Connection,
    closed: CloseHandle,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| PublisherError::Channel(format!("Failed to create channel: {e}")))?;

        // A channel-level error (e.g. a conflicting exchange declaration)
        // leaves the connection up but the channel useless.
        let closed = self.closed.clone();
        channel.on_error(move |e| {
            closed.fire(format!("channel error: {e}"));
        });

        Ok(Box::new(LapinChannel {
            channel,
            confirms: RwLock::new(None),
            next_tag: AtomicU64::new(1),
        }))
    }

    async fn close(&self) {
        self.closed.fire("closed by client");
        if let Err(e) = self.connection.close(200, "Normal shutdown").await {
            debug!(error = %e, "AMQP connection close failed");
        }
    }
}

struct LapinChannel {
    channel: Channel,
    confirms: RwLock<Option<mpsc::UnboundedSender<PendingConfirm>>>,
    next_tag: AtomicU64,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<()> {
        self.channel
            .exchange_declare(
                &exchange.name,
                exchange_kind(&exchange.kind),
                ExchangeDeclareOptions {
                    durable: true,
                    auto_delete: false,
                    internal: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                PublisherError::Declare(format!(
                    "Failed to declare exchange '{}': {e}",
                    exchange.name
                ))
            })
    }

    async fn enable_confirms(&self) -> Result<ConfirmStream> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| PublisherError::Confirm(format!("Failed to enable confirms: {e}")))?;

        let (tx, rx) = mpsc::unbounded_channel();
        *self.confirms.write().await = Some(tx);
        Ok(rx)
    }

    async fn publish(&self, message: &Message) -> Result<()> {
        let confirm = self
            .channel
            .basic_publish(
                &message.exchange,
                &message.routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties(message),
            )
            .await
            .map_err(|e| PublisherError::Publish(e.to_string()))?;

        if let Some(confirms) = self.confirms.read().await.as_ref() {
            let delivery_tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
            let outcome = async move {
                match confirm.await {
                    Ok(Confirmation::Nack(_)) => ConfirmOutcome::Nack,
                    Ok(_) => ConfirmOutcome::Ack,
                    Err(e) => ConfirmOutcome::Lost(e.to_string()),
                }
            }
            .boxed();
            if confirms.send(PendingConfirm { delivery_tag, outcome }).is_err() {
                warn!(delivery_tag, "Confirm consumer is gone");
            }
        }

        Ok(())
    }
}

fn exchange_kind(kind: &ExchangeType) -> ExchangeKind {
    match kind {
        ExchangeType::Direct => ExchangeKind::Direct,
        ExchangeType::Fanout => ExchangeKind::Fanout,
        ExchangeType::Topic => ExchangeKind::Topic,
        ExchangeType::Headers => ExchangeKind::Headers,
        ExchangeType::Custom(name) => ExchangeKind::Custom(name.clone()),
    }
}

fn properties(message: &Message) -> BasicProperties {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();

    let mut properties = BasicProperties::default()
        .with_content_type(ShortString::from(message.content_type.clone()))
        .with_delivery_mode(PERSISTENT)
        .with_timestamp(timestamp);

    if !message.headers.is_empty() {
        let mut table = FieldTable::default();
        for (key, value) in message.headers.iter() {
            table.insert(
                ShortString::from(key.to_string()),
                AMQPValue::LongString(LongString::from(value.to_string())),
            );
        }
        properties = properties.with_headers(table);
    }

    if let Some(reply_to) = &message.reply_to {
        properties = properties.with_reply_to(ShortString::from(reply_to.clone()));
    }

    properties
}

async fn read_file(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .map_err(|e| PublisherError::Tls(format!("Failed to read {}: {e}", path.display())))
}

/// Build the lapin TLS settings from files on disk.
pub async fn load_tls(bundle: &TlsBundle) -> Result<OwnedTLSConfig> {
    let ca = String::from_utf8(read_file(&bundle.ca).await?).map_err(|_| {
        PublisherError::Tls(format!("{} is not a PEM file", bundle.ca.display()))
    })?;

    let identity = OwnedIdentity {
        der: read_file(&bundle.identity).await?,
        password: bundle.password.clone(),
    };

    Ok(OwnedTLSConfig {
        identity: Some(identity),
        cert_chain: Some(ca),
    })
}
