//! conntrack-relay: connection tracking events to RabbitMQ
//!
//! ## Architecture
//! ```text
//! [conntrack -E | ctnetlink] --lines--> [parser] --Flow--> [queue] --> [bridge] --JSON--> [exchange]
//! ```
//!
//! ## Usage
//! - `conntrack-relay [CONFIG]`: run until SIGINT/SIGTERM
//! - `conntrack-relay version`: print the version and exit
//!
//! ## Configuration
//! - CTRELAY_CONFIG: config file (when no CONFIG argument is given)
//! - CTRELAY__<SECTION>__<KEY>: per-key overrides, e.g. CTRELAY__AMQP__HOST
//! - CTRELAY_LOG: tracing filter directive

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use conntrack_relay::bridge::Bridge;
use conntrack_relay::config::{Config, SourceType};
use conntrack_relay::flow::FlowParser;
use conntrack_relay::host::{HostIdentity, HOST_ID_HEADER};
use conntrack_relay::publisher::{Headers, LapinBroker, ResilientPublisher, StaticCredentials};
use conntrack_relay::queue::flow_queue;
use conntrack_relay::source::{self, EventSource, LineSink, SubprocessSource};
use conntrack_relay::utils::bootstrap::{init_tracing, ShutdownSignal};

/// How long a closed netlink source may take to release its socket.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let arg = std::env::args().nth(1);
    if arg.as_deref() == Some("version") {
        println!("{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config = Config::load(arg.as_deref())?;
    init_tracing(&config.logging);
    let shutdown = ShutdownSignal::install()?;

    let host = HostIdentity::detect();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        host_id = %host.id,
        derived_from = %host.derived_from,
        "conntrack-relay starting"
    );

    let filter = config.source.event_filter()?;
    let (tx, rx) = flow_queue(config.queue.capacity);

    let broker = LapinBroker::new(config.amqp.endpoint(), config.amqp.tls.bundle());
    let credentials = StaticCredentials::new(&config.amqp.user, &config.amqp.password);
    let publisher = ResilientPublisher::start(
        Arc::new(broker),
        Arc::new(credentials),
        config.amqp.publisher_config(),
    );

    let mut headers = Headers::new();
    if config.bridge.host_header {
        headers.insert(HOST_ID_HEADER, host.id.to_string());
    }
    let bridge = Bridge::new(
        publisher,
        rx,
        config.amqp.exchange.clone(),
        config.amqp.routing_key.clone(),
    )
    .with_headers(headers)
    .with_retry_once(config.bridge.retry_once_after_reconnect);
    tokio::spawn(bridge.run());

    #[cfg(target_os = "linux")]
    let mut netlink_handle = None;

    let source: Arc<dyn EventSource> = match config.source.source_type {
        SourceType::Subprocess => Arc::new(SubprocessSource::conntrack(
            config.source.program.clone(),
            config.source.buffer_size,
            &filter,
        )),
        #[cfg(target_os = "linux")]
        SourceType::Netlink => {
            let netlink = source::NetlinkSource::new(filter, config.source.buffer_size);
            netlink_handle = Some(netlink.handle());
            Arc::new(netlink)
        }
        #[cfg(not(target_os = "linux"))]
        SourceType::Netlink => {
            return Err("source.type netlink is only available on Linux".into());
        }
    };
    info!(source = source.name(), "Event source selected");

    let sink = LineSink::new(FlowParser::new(config.parser.mode), tx);
    let supervisor = tokio::spawn(source::supervise(
        source,
        sink,
        config.source.restart_delay(),
    ));

    let signal = shutdown.recv().await;
    info!(signal, "Shutting down");

    #[cfg(target_os = "linux")]
    if let Some(handle) = netlink_handle {
        handle.close();
        // The dispatch thread drops the socket before supervise returns.
        match tokio::time::timeout(SHUTDOWN_GRACE, supervisor).await {
            Ok(_) => info!("Netlink socket closed"),
            Err(_) => warn!(
                grace_ms = SHUTDOWN_GRACE.as_millis() as u64,
                "Netlink dispatch did not stop in time"
            ),
        }
    }
    #[cfg(not(target_os = "linux"))]
    drop(supervisor);

    std::process::exit(0);
}
