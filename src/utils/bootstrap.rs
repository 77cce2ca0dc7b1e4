//! Bootstrap utilities for the relay binary.

use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LoggingConfig, LOG_ENV_VAR};

/// Level used when `CTRELAY_LOG` is not set.
pub fn default_directive(logging: &LoggingConfig) -> &'static str {
    if logging.verbose {
        "debug"
    } else {
        "info"
    }
}

/// Initialize tracing with the CTRELAY_LOG environment variable.
///
/// Falls back to `debug` when `logging.verbose` is set, `info` otherwise.
/// `logging.json` switches to one JSON object per line.
pub fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_env(LOG_ENV_VAR)
        .unwrap_or_else(|_| EnvFilter::new(default_directive(logging)));

    let json = logging.json.then(|| tracing_subscriber::fmt::layer().json());
    let text = (!logging.json).then(tracing_subscriber::fmt::layer);

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(text)
        .init();
}

/// SIGINT/SIGTERM listeners, registered with the OS on construction.
pub struct ShutdownSignal {
    interrupt: Signal,
    terminate: Signal,
}

impl ShutdownSignal {
    /// Register both handlers. Signals delivered after this returns are
    /// observed by [`ShutdownSignal::recv`].
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// Name of the first signal received.
    pub async fn recv(mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
        }
    }
}
