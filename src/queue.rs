//! Bounded FIFO between ingestion and publishing.
//!
//! Producers wait when the queue is full. That wait is the only backpressure
//! in the pipeline: nothing is dropped here and memory stays bounded.

use tokio::sync::mpsc;

use crate::flow::Flow;

/// Default queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 128;

/// The consumer side went away.
#[derive(Debug, thiserror::Error)]
#[error("Flow queue closed")]
pub struct QueueClosed;

/// Create a bounded flow queue.
///
/// # Panics
/// Panics if `capacity` is zero. Configuration validation rejects that
/// before the queue is built.
pub fn flow_queue(capacity: usize) -> (FlowSender, FlowReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (FlowSender { tx }, FlowReceiver { rx })
}

/// Producer handle. Cloneable; one per ingestion task.
#[derive(Clone, Debug)]
pub struct FlowSender {
    tx: mpsc::Sender<Flow>,
}

impl FlowSender {
    /// Enqueue a flow, waiting while the queue is full.
    pub async fn push(&self, flow: Flow) -> Result<(), QueueClosed> {
        self.tx.send(flow).await.map_err(|_| QueueClosed)
    }

    /// Enqueue from a non-async thread, blocking while the queue is full.
    ///
    /// Must not be called from within an async context.
    pub fn blocking_push(&self, flow: Flow) -> Result<(), QueueClosed> {
        self.tx.blocking_send(flow).map_err(|_| QueueClosed)
    }

    /// Free slots right now.
    pub fn available(&self) -> usize {
        self.tx.capacity()
    }
}

/// Consumer handle, owned by the bridge loop.
#[derive(Debug)]
pub struct FlowReceiver {
    rx: mpsc::Receiver<Flow>,
}

impl FlowReceiver {
    /// Next flow in FIFO order; `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<Flow> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Flow> {
        self.rx.try_recv().ok()
    }
}
