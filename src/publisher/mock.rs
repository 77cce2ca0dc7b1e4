//! In-memory broker for testing the publisher and bridge without RabbitMQ.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{mpsc, RwLock};

use super::{
    Broker, BrokerChannel, BrokerConnection, CloseHandle, ConfirmOutcome, ConfirmStream,
    Credentials, ExchangeSpec, Message, PendingConfirm, PublisherError, Result,
};

#[derive(Default)]
struct MockState {
    unavailable: RwLock<bool>,
    nack: RwLock<bool>,
    fail_next_publish: RwLock<bool>,
    connects: RwLock<usize>,
    credentials: RwLock<Vec<Credentials>>,
    declared: RwLock<Vec<ExchangeSpec>>,
    published: RwLock<Vec<Message>>,
    open: RwLock<Vec<CloseHandle>>,
}

/// Mock broker. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<MockState>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse (false) or accept (true) new connections.
    pub async fn set_available(&self, available: bool) {
        *self.state.unavailable.write().await = !available;
    }

    /// Answer later confirms with a nack.
    pub async fn set_nack(&self, nack: bool) {
        *self.state.nack.write().await = nack;
    }

    /// Fail the next publish as if the channel had died.
    pub async fn fail_next_publish(&self) {
        *self.state.fail_next_publish.write().await = true;
    }

    /// Close every open connection, as a broker restart would.
    pub async fn drop_connections(&self) {
        for handle in self.state.open.write().await.drain(..) {
            handle.fire("connection reset by mock broker");
        }
    }

    pub async fn connect_count(&self) -> usize {
        *self.state.connects.read().await
    }

    pub async fn credentials_seen(&self) -> Vec<Credentials> {
        self.state.credentials.read().await.clone()
    }

    pub async fn declared(&self) -> Vec<ExchangeSpec> {
        self.state.declared.read().await.clone()
    }

    pub async fn published(&self) -> Vec<Message> {
        self.state.published.read().await.clone()
    }

    pub async fn published_count(&self) -> usize {
        self.state.published.read().await.len()
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn connect(
        &self,
        credentials: &Credentials,
        on_close: CloseHandle,
    ) -> Result<Box<dyn BrokerConnection>> {
        self.state.credentials.write().await.push(credentials.clone());

        if *self.state.unavailable.read().await {
            return Err(PublisherError::Connection(
                "Mock broker unavailable".to_string(),
            ));
        }

        *self.state.connects.write().await += 1;
        self.state.open.write().await.push(on_close.clone());

        Ok(Box::new(MockConnection {
            state: self.state.clone(),
            closed: on_close,
        }))
    }
}

struct MockConnection {
    state: Arc<MockState>,
    closed: CloseHandle,
}

#[async_trait]
impl BrokerConnection for MockConnection {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>> {
        if self.closed.is_closed() {
            return Err(PublisherError::Channel("Connection closed".to_string()));
        }
        Ok(Box::new(MockChannel {
            state: self.state.clone(),
            closed: self.closed.clone(),
            confirms: RwLock::new(None),
            next_tag: AtomicU64::new(1),
        }))
    }

    async fn close(&self) {
        self.closed.fire("closed by client");
    }
}

struct MockChannel {
    state: Arc<MockState>,
    closed: CloseHandle,
    confirms: RwLock<Option<mpsc::UnboundedSender<PendingConfirm>>>,
    next_tag: AtomicU64,
}

#[async_trait]
impl BrokerChannel for MockChannel {
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<()> {
        self.state.declared.write().await.push(exchange.clone());
        Ok(())
    }

    async fn enable_confirms(&self) -> Result<ConfirmStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.confirms.write().await = Some(tx);
        Ok(rx)
    }

    async fn publish(&self, message: &Message) -> Result<()> {
        if self.closed.is_closed() {
            return Err(PublisherError::Publish("Channel closed".to_string()));
        }

        let fail = std::mem::take(&mut *self.state.fail_next_publish.write().await);
        if fail {
            self.closed.fire("mock channel failure");
            return Err(PublisherError::Publish("Mock publish failure".to_string()));
        }

        self.state.published.write().await.push(message.clone());

        if let Some(confirms) = self.confirms.read().await.as_ref() {
            let outcome = if *self.state.nack.read().await {
                ConfirmOutcome::Nack
            } else {
                ConfirmOutcome::Ack
            };
            let _ = confirms.send(PendingConfirm {
                delivery_tag: self.next_tag.fetch_add(1, Ordering::SeqCst),
                outcome: futures::future::ready(outcome).boxed(),
            });
        }

        Ok(())
    }
}
