//! Conntrack event sources.
//!
//! This module contains:
//! - `EventSource` trait: one run of a producer of raw event lines
//! - `LineSink`: parses each line and enqueues valid flows
//! - `supervise`: restarts a source forever
//! - Implementations: `conntrack` subprocess, ctnetlink multicast socket (Linux)

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::flow::{EventType, Flow, FlowParser};
use crate::queue::FlowSender;

pub mod ctnetlink;
#[cfg(target_os = "linux")]
pub mod netlink;
pub mod subprocess;

#[cfg(target_os = "linux")]
pub use netlink::{NetlinkHandle, NetlinkSource};
pub use subprocess::SubprocessSource;

/// Result type for source operations.
pub type Result<T> = std::result::Result<T, SourceError>;

/// Errors that end one run of an event source.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Read failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Event process exited: {0}")]
    Exited(String),

    #[error("Netlink error: {0}")]
    Netlink(String),

    #[error("Flow queue closed")]
    QueueClosed,

    #[error("Event source was shut down")]
    Stopped,
}

/// Which events a source reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFilter {
    pub event_types: Vec<EventType>,
    /// Only report flows whose reply tuple was rewritten by NAT.
    pub nat_only: bool,
}

impl Default for EventFilter {
    fn default() -> Self {
        Self {
            event_types: vec![EventType::New, EventType::Destroy],
            nat_only: false,
        }
    }
}

impl EventFilter {
    pub fn accepts(&self, event_type: EventType) -> bool {
        self.event_types.contains(&event_type)
    }

    /// Comma-joined tags, e.g. `NEW,DESTROY`.
    pub fn joined(&self) -> String {
        self.event_types
            .iter()
            .map(EventType::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Hands raw lines to the parser and valid flows to the queue.
///
/// Unparseable lines produce an empty flow which is discarded here, so only
/// flows with an event type ever reach the queue.
#[derive(Clone, Debug)]
pub struct LineSink {
    parser: FlowParser,
    queue: FlowSender,
}

impl LineSink {
    pub fn new(parser: FlowParser, queue: FlowSender) -> Self {
        Self { parser, queue }
    }

    fn parse(&self, line: &str) -> Option<Flow> {
        let flow = self.parser.parse(line);
        if flow.is_valid() {
            Some(flow)
        } else {
            debug!("Discarding unparsed event line");
            None
        }
    }

    /// Parse and enqueue, waiting while the queue is full.
    pub async fn push_line(&self, line: &str) -> Result<()> {
        match self.parse(line) {
            Some(flow) => self
                .queue
                .push(flow)
                .await
                .map_err(|_| SourceError::QueueClosed),
            None => Ok(()),
        }
    }

    /// Parse and enqueue from a dispatch thread, blocking while full.
    pub fn blocking_push_line(&self, line: &str) -> Result<()> {
        match self.parse(line) {
            Some(flow) => self
                .queue
                .blocking_push(flow)
                .map_err(|_| SourceError::QueueClosed),
            None => Ok(()),
        }
    }
}

/// A producer of raw conntrack event lines.
///
/// Implementations:
/// - `SubprocessSource`: reads `conntrack -E` standard output
/// - `NetlinkSource`: subscribes to ctnetlink multicast groups
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Human-readable name for logging.
    fn name(&self) -> &str;

    /// Feed lines into `sink` until the underlying producer stops.
    ///
    /// Every return is treated as a failure of the whole producer; the
    /// supervisor starts a new run.
    async fn run(&self, sink: &LineSink) -> Result<()>;
}

/// Run `source` forever, restarting it whenever it stops.
///
/// Only returns when the flow queue has been closed by the consumer or the
/// source reports it was shut down.
pub async fn supervise(source: Arc<dyn EventSource>, sink: LineSink, restart_delay: Duration) {
    let mut restarts: u64 = 0;

    loop {
        info!(source = %source.name(), restarts, "Starting event source");

        match source.run(&sink).await {
            Ok(()) => {
                warn!(source = %source.name(), "Event source stopped, restarting");
            }
            Err(SourceError::QueueClosed) => {
                info!(source = %source.name(), "Flow queue closed, stopping event source");
                return;
            }
            Err(SourceError::Stopped) => {
                info!(source = %source.name(), "Event source shut down");
                return;
            }
            Err(e) => {
                error!(source = %source.name(), error = %e, "Event source failed, restarting");
            }
        }

        restarts += 1;
        if restart_delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(restart_delay).await;
        }
    }
}
