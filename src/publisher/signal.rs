//! One-shot close notification for a broker connection.

use std::sync::Arc;

use tokio::sync::watch;

/// Create a linked close handle and listener.
pub fn close_signal() -> (CloseHandle, CloseListener) {
    let (tx, rx) = watch::channel(None);
    (CloseHandle { tx: Arc::new(tx) }, CloseListener { rx })
}

/// Fires the close notification. Only the first reason is kept.
#[derive(Debug, Clone)]
pub struct CloseHandle {
    tx: Arc<watch::Sender<Option<String>>>,
}

impl CloseHandle {
    /// Returns true if this call closed the connection.
    pub fn fire(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn listener(&self) -> CloseListener {
        CloseListener {
            rx: self.tx.subscribe(),
        }
    }
}

/// Waits for the close notification.
#[derive(Debug, Clone)]
pub struct CloseListener {
    rx: watch::Receiver<Option<String>>,
}

impl CloseListener {
    /// Resolve with the close reason. Also resolves if every handle is
    /// dropped, since nothing can report the connection's state any more.
    pub async fn wait(&mut self) -> String {
        match self.rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            Err(_) => "close handle dropped".to_string(),
        }
    }
}
