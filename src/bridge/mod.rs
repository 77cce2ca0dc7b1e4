//! Bridge loop: drains the flow queue into the publisher.
//!
//! Delivery is at-most-once. A flow whose publish fails is dropped (or, when
//! configured, retried exactly once after the publisher is ready again), and
//! the loop always waits for readiness before taking the next flow.

use tracing::{debug, error, info, warn};

use crate::flow::Flow;
use crate::publisher::{Headers, Publisher};
use crate::queue::FlowReceiver;

/// Counters returned when the loop ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub published: u64,
    /// Publish attempts that failed, including failed retries.
    pub failed: u64,
    /// Flows lost after their last failed attempt.
    pub dropped: u64,
    /// Unparsed flows that never reached the publisher.
    pub skipped: u64,
}

pub struct Bridge<P> {
    publisher: P,
    queue: FlowReceiver,
    exchange: String,
    routing_key: String,
    headers: Headers,
    retry_once: bool,
}

impl<P: Publisher> Bridge<P> {
    pub fn new(
        publisher: P,
        queue: FlowReceiver,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            publisher,
            queue,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            headers: Headers::new(),
            retry_once: false,
        }
    }

    /// Headers attached to every message.
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    /// Retry a failed flow once after the publisher reconnects.
    pub fn with_retry_once(mut self, retry_once: bool) -> Self {
        self.retry_once = retry_once;
        self
    }

    /// Run until every queue producer is gone.
    pub async fn run(mut self) -> BridgeStats {
        let mut stats = BridgeStats::default();
        info!(
            exchange = %self.exchange,
            routing_key = %self.routing_key,
            retry_once = self.retry_once,
            "Bridge started"
        );

        while let Some(flow) = self.queue.recv().await {
            self.forward(flow, &mut stats).await;
        }

        info!(
            published = stats.published,
            failed = stats.failed,
            dropped = stats.dropped,
            skipped = stats.skipped,
            "Flow queue closed, bridge stopped"
        );
        stats
    }

    async fn forward(&self, flow: Flow, stats: &mut BridgeStats) {
        if !flow.is_valid() {
            stats.skipped += 1;
            debug!("Skipping unparsed flow");
            return;
        }

        let body = match serde_json::to_vec(&flow) {
            Ok(body) => body,
            Err(e) => {
                stats.dropped += 1;
                error!(id = flow.id, error = %e, "Failed to serialize flow");
                return;
            }
        };

        if self.attempt(&flow, body.clone(), stats).await {
            return;
        }

        self.publisher.wait_until_ready().await;

        if self.retry_once {
            if self.attempt(&flow, body, stats).await {
                debug!(id = flow.id, "Flow published on retry");
                return;
            }
            self.publisher.wait_until_ready().await;
        }

        stats.dropped += 1;
        warn!(id = flow.id, event = %flow.event_type, "Dropped flow after failed publish");
    }

    /// One publish. Returns true on success.
    async fn attempt(&self, flow: &Flow, body: Vec<u8>, stats: &mut BridgeStats) -> bool {
        match self
            .publisher
            .publish(&self.exchange, &self.routing_key, body, &self.headers)
            .await
        {
            Ok(()) => {
                stats.published += 1;
                debug!(id = flow.id, event = %flow.event_type, "Published flow");
                true
            }
            Err(e) => {
                stats.failed += 1;
                warn!(id = flow.id, error = %e, "Publish failed, waiting for publisher");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests;
