//! Self-healing publisher.
//!
//! A single watcher task owns every connection replacement:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> ConfirmArmed
//!       ^              |             |             |
//!       +--------------+-------------+-------------+  (close / failure)
//! ```
//!
//! After a close or a failed attempt the watcher sleeps a fixed `backon`
//! interval and tries again, forever. Publishing never waits on the watcher:
//! it either uses the installed channel or fails with `NotReady`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use backon::{BackoffBuilder, ConstantBuilder};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use super::{
    close_signal, Broker, BrokerChannel, BrokerConnection, CloseHandle, CloseListener,
    ConfirmOutcome, ConfirmStream, CredentialSource, Headers, Message, Publisher,
    PublisherConfig, PublisherError, PublisherState, Result, CONTENT_TYPE_JSON,
};

/// Confirmation tallies since startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfirmCounts {
    pub acked: u64,
    pub nacked: u64,
    pub lost: u64,
}

#[derive(Debug, Default)]
struct ConfirmStats {
    acked: AtomicU64,
    nacked: AtomicU64,
    lost: AtomicU64,
}

impl ConfirmStats {
    fn snapshot(&self) -> ConfirmCounts {
        ConfirmCounts {
            acked: self.acked.load(Ordering::Relaxed),
            nacked: self.nacked.load(Ordering::Relaxed),
            lost: self.lost.load(Ordering::Relaxed),
        }
    }
}

struct Session {
    connection: Box<dyn BrokerConnection>,
    channel: Box<dyn BrokerChannel>,
    closed: CloseHandle,
}

struct Inner {
    broker: Arc<dyn Broker>,
    credentials: Arc<dyn CredentialSource>,
    config: PublisherConfig,
    session: Mutex<Option<Session>>,
    state: watch::Sender<PublisherState>,
    stats: Arc<ConfirmStats>,
}

/// Cloneable handle to a publisher whose connection heals itself.
#[derive(Clone)]
pub struct ResilientPublisher {
    inner: Arc<Inner>,
}

impl ResilientPublisher {
    /// Create the publisher and spawn its connection watcher.
    ///
    /// Returns immediately in `Disconnected`/`Connecting`; use
    /// [`Publisher::wait_until_ready`] to wait for the first connection.
    pub fn start(
        broker: Arc<dyn Broker>,
        credentials: Arc<dyn CredentialSource>,
        config: PublisherConfig,
    ) -> Self {
        let (state, _) = watch::channel(PublisherState::Disconnected);
        let inner = Arc::new(Inner {
            broker,
            credentials,
            config,
            session: Mutex::new(None),
            state,
            stats: Arc::new(ConfirmStats::default()),
        });

        tokio::spawn(watch_connection(inner.clone()));

        Self { inner }
    }

    pub fn state(&self) -> PublisherState {
        *self.inner.state.borrow()
    }

    /// Subscribe to state transitions.
    pub fn subscribe(&self) -> watch::Receiver<PublisherState> {
        self.inner.state.subscribe()
    }

    pub fn confirm_counts(&self) -> ConfirmCounts {
        self.inner.stats.snapshot()
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.inner.config
    }

    /// Publish a fully built message on the current channel.
    pub async fn publish_message(&self, message: Message) -> Result<()> {
        if !self.state().is_ready() {
            return Err(PublisherError::NotReady);
        }

        let session = self.inner.session.lock().await;
        let Some(session) = session.as_ref() else {
            return Err(PublisherError::NotReady);
        };
        if session.closed.is_closed() {
            // Closed under us; the watcher has not torn it down yet.
            self.inner.set_state(PublisherState::Disconnected);
            return Err(PublisherError::NotReady);
        }

        match session.channel.publish(&message).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // The channel is unusable; hand it to the watcher. The broker
                // may already have fired the signal, so the state moves here
                // regardless, before the lock is released.
                session.closed.fire(format!("publish failed: {e}"));
                self.inner.set_state(PublisherState::Disconnected);
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Publisher for ResilientPublisher {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        headers: &Headers,
    ) -> Result<()> {
        self.publish_message(Message {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body,
            headers: headers.clone(),
            content_type: CONTENT_TYPE_JSON.to_string(),
            reply_to: self.inner.config.reply_to.clone(),
        })
        .await
    }

    async fn wait_until_ready(&self) {
        let mut state = self.inner.state.subscribe();
        // The sender lives in `inner`, which `self` keeps alive.
        let _ = state.wait_for(PublisherState::is_ready).await;
    }
}

impl Inner {
    fn set_state(&self, next: PublisherState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(from = %previous, to = %next, "Publisher state changed");
        }
    }

    /// Dial, open a channel, declare the exchange and arm confirms.
    ///
    /// The session is installed only after every step succeeded, so
    /// publishers never observe a half-built connection.
    async fn establish(&self) -> Result<CloseListener> {
        self.set_state(PublisherState::Connecting);

        let credentials = self.credentials.current().await?;
        let (closed, listener) = close_signal();
        let connection = self.broker.connect(&credentials, closed.clone()).await?;

        let (channel, confirms) = match self.start_channel(connection.as_ref()).await {
            Ok(started) => started,
            Err(e) => {
                closed.fire(format!("channel setup failed: {e}"));
                connection.close().await;
                return Err(e);
            }
        };

        let armed = confirms.is_some();
        if let Some(confirms) = confirms {
            tokio::spawn(consume_confirms(
                confirms,
                listener.clone(),
                self.stats.clone(),
            ));
        }

        *self.session.lock().await = Some(Session {
            connection,
            channel,
            closed,
        });

        info!(
            exchange = %self.config.exchange.name,
            kind = %self.config.exchange.kind,
            confirms = armed,
            "Publisher connected"
        );
        self.set_state(if armed {
            PublisherState::ConfirmArmed
        } else {
            PublisherState::Connected
        });

        Ok(listener)
    }

    async fn start_channel(
        &self,
        connection: &dyn BrokerConnection,
    ) -> Result<(Box<dyn BrokerChannel>, Option<ConfirmStream>)> {
        let channel = connection.open_channel().await?;
        channel.declare_exchange(&self.config.exchange).await?;

        let confirms = if self.config.confirms {
            Some(channel.enable_confirms().await?)
        } else {
            None
        };

        Ok((channel, confirms))
    }

    /// Drop the current session after its close signal fired.
    async fn teardown(&self) {
        self.set_state(PublisherState::Disconnected);
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            session.connection.close().await;
        }
    }
}

/// The reconnect watcher. Runs for the lifetime of the process.
///
/// The first dial is immediate. Every later attempt waits one fixed interval,
/// and the delay sequence restarts after each successful connect.
async fn watch_connection(inner: Arc<Inner>) {
    let backoff_builder = ConstantBuilder::default()
        .with_delay(inner.config.reconnect_interval)
        .without_max_times();
    let mut backoff_iter = backoff_builder.build();
    let mut attempt: u64 = 0;

    loop {
        attempt += 1;

        let mut listener = match inner.establish().await {
            Ok(listener) => {
                attempt = 0;
                // Reset backoff on successful connection
                backoff_iter = backoff_builder.build();
                listener
            }
            Err(e) => {
                inner.set_state(PublisherState::Disconnected);
                let delay = backoff_iter
                    .next()
                    .unwrap_or(inner.config.reconnect_interval);
                error!(
                    error = %e,
                    attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    "Broker connection attempt failed"
                );
                tokio::time::sleep(delay).await;
                continue;
            }
        };

        let reason = listener.wait().await;
        warn!(reason = %reason, "Broker connection closed, reconnecting");
        inner.teardown().await;

        let delay = backoff_iter
            .next()
            .unwrap_or(inner.config.reconnect_interval);
        tokio::time::sleep(delay).await;
    }
}

/// Log broker confirmations until the connection closes.
async fn consume_confirms(
    mut confirms: ConfirmStream,
    mut closed: CloseListener,
    stats: Arc<ConfirmStats>,
) {
    loop {
        let pending = tokio::select! {
            reason = closed.wait() => {
                debug!(reason = %reason, "Confirm consumer stopping");
                return;
            }
            pending = confirms.recv() => match pending {
                Some(pending) => pending,
                None => return,
            },
        };

        let tag = pending.delivery_tag;
        let outcome = tokio::select! {
            reason = closed.wait() => ConfirmOutcome::Lost(reason),
            outcome = pending.outcome => outcome,
        };

        match outcome {
            ConfirmOutcome::Ack => {
                stats.acked.fetch_add(1, Ordering::Relaxed);
                debug!(delivery_tag = tag, "Broker acknowledged message");
            }
            ConfirmOutcome::Nack => {
                stats.nacked.fetch_add(1, Ordering::Relaxed);
                warn!(delivery_tag = tag, "Broker rejected message");
            }
            ConfirmOutcome::Lost(reason) => {
                stats.lost.fetch_add(1, Ordering::Relaxed);
                warn!(delivery_tag = tag, reason = %reason, "Confirmation lost");
                return;
            }
        }
    }
}
