//! Event source subscribed to ctnetlink multicast groups.
//!
//! A `NETLINK_NETFILTER` socket is bound to the conntrack event groups and
//! read on a blocking dispatch thread. Each datagram is decoded, filtered,
//! rendered into the event line grammar and handed to the sink.

use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::socket::{
    bind, recv, setsockopt, socket, sockopt, AddressFamily, MsgFlags, NetlinkAddr, SockFlag,
    SockProtocol, SockType,
};
use nix::sys::time::{TimeVal, TimeValLike};
use tracing::{debug, info, warn};

use super::ctnetlink::{self, DecodeError};
use super::{EventFilter, EventSource, LineSink, Result, SourceError};

/// How often the dispatch thread checks whether the handle was closed.
const CLOSE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Large enough for any single ctnetlink datagram.
const RECV_BUFFER: usize = 64 * 1024;

/// Shared close switch for a netlink source.
///
/// Closing stops the dispatch thread within one poll interval; the thread
/// releases the socket on its way out. Later runs refuse to reopen it.
#[derive(Debug, Clone, Default)]
pub struct NetlinkHandle {
    closed: Arc<AtomicBool>,
}

impl NetlinkHandle {
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!("Closing conntrack netlink handle");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Reads conntrack events straight from the kernel.
#[derive(Debug, Clone)]
pub struct NetlinkSource {
    filter: EventFilter,
    buffer_size: usize,
    handle: NetlinkHandle,
}

impl NetlinkSource {
    pub fn new(filter: EventFilter, buffer_size: usize) -> Self {
        Self {
            filter,
            buffer_size,
            handle: NetlinkHandle::default(),
        }
    }

    /// Handle for closing this source from a signal handler.
    pub fn handle(&self) -> NetlinkHandle {
        self.handle.clone()
    }
}

#[async_trait]
impl EventSource for NetlinkSource {
    fn name(&self) -> &str {
        "ctnetlink"
    }

    async fn run(&self, sink: &LineSink) -> Result<()> {
        if self.handle.is_closed() {
            return Err(SourceError::Stopped);
        }

        let socket = open_socket(&self.filter, self.buffer_size)?;
        let filter = self.filter.clone();
        let handle = self.handle.clone();
        let sink = sink.clone();

        tokio::task::spawn_blocking(move || dispatch(socket, &filter, &handle, &sink))
            .await
            .map_err(|e| SourceError::Netlink(format!("dispatch thread failed: {e}")))?
    }
}

fn netlink_error(context: &str, errno: Errno) -> SourceError {
    SourceError::Netlink(format!("{context}: {errno}"))
}

fn open_socket(filter: &EventFilter, buffer_size: usize) -> Result<OwnedFd> {
    let fd = socket(
        AddressFamily::Netlink,
        SockType::Raw,
        SockFlag::SOCK_CLOEXEC,
        SockProtocol::NetlinkNetFilter,
    )
    .map_err(|e| netlink_error("socket", e))?;

    let groups = ctnetlink::group_mask(&filter.event_types);
    bind(fd.as_raw_fd(), &NetlinkAddr::new(0, groups)).map_err(|e| netlink_error("bind", e))?;

    // Forcing past rmem_max needs CAP_NET_ADMIN, which the relay normally has.
    if let Err(e) = setsockopt(&fd, sockopt::RcvBufForce, &buffer_size) {
        debug!(error = %e, "SO_RCVBUFFORCE refused, falling back to SO_RCVBUF");
        if let Err(e) = setsockopt(&fd, sockopt::RcvBuf, &buffer_size) {
            warn!(error = %e, buffer_size, "Could not set netlink receive buffer");
        }
    }

    let timeout = TimeVal::milliseconds(CLOSE_POLL_INTERVAL.as_millis() as i64);
    setsockopt(&fd, sockopt::ReceiveTimeout, &timeout)
        .map_err(|e| netlink_error("SO_RCVTIMEO", e))?;

    info!(groups, buffer_size, "Subscribed to conntrack netlink events");
    Ok(fd)
}

fn dispatch(
    socket: OwnedFd,
    filter: &EventFilter,
    handle: &NetlinkHandle,
    sink: &LineSink,
) -> Result<()> {
    let mut buf = vec![0u8; RECV_BUFFER];

    loop {
        if handle.is_closed() {
            return Err(SourceError::Stopped);
        }

        let len = match recv(socket.as_raw_fd(), &mut buf, MsgFlags::empty()) {
            Ok(len) => len,
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => continue,
            Err(Errno::ENOBUFS) => {
                warn!("Netlink receive buffer overrun, events were lost");
                continue;
            }
            Err(e) => return Err(netlink_error("recv", e)),
        };

        let events = match ctnetlink::decode_datagram(&buf[..len]) {
            Ok(events) => events,
            Err(DecodeError::Overrun) => {
                warn!("Netlink receive buffer overrun, events were lost");
                continue;
            }
            Err(e) => {
                warn!(error = %e, len, "Skipping undecodable netlink datagram");
                continue;
            }
        };

        for event in events {
            if !filter.accepts(event.event_type) || (filter.nat_only && !event.is_nat()) {
                continue;
            }
            sink.blocking_push_line(&event.render(SystemTime::now()))?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowParser;
    use crate::queue::flow_queue;

    #[tokio::test]
    async fn test_closed_handle_stops_source() {
        let source = NetlinkSource::new(EventFilter::default(), 1024);
        let (tx, _rx) = flow_queue(1);
        let sink = LineSink::new(FlowParser::default(), tx);

        let handle = source.handle();
        handle.close();
        assert!(handle.is_closed());

        let result = source.run(&sink).await;
        assert!(matches!(result, Err(SourceError::Stopped)));
    }

    #[tokio::test]
    async fn test_close_stops_live_run() {
        let source = Arc::new(NetlinkSource::new(EventFilter::default(), 64 * 1024));
        let (tx, mut rx) = flow_queue(16);
        let sink = LineSink::new(FlowParser::default(), tx);
        let handle = source.handle();

        // Keep the queue moving so dispatch never blocks on a full queue.
        tokio::spawn(async move { while rx.recv().await.is_some() {} });

        let run = tokio::spawn({
            let source = source.clone();
            async move { source.run(&sink).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        if run.is_finished() {
            // Subscribing needs CAP_NET_ADMIN and nf_conntrack_netlink.
            let result = run.await.unwrap();
            assert!(matches!(result, Err(SourceError::Netlink(_))), "{result:?}");
            return;
        }

        handle.close();
        let result = tokio::time::timeout(CLOSE_POLL_INTERVAL * 8, run)
            .await
            .expect("dispatch thread did not observe close")
            .unwrap();
        assert!(matches!(result, Err(SourceError::Stopped)));
    }

    #[test]
    fn test_handles_share_state() {
        let source = NetlinkSource::new(EventFilter::default(), 1024);
        let a = source.handle();
        let b = source.handle();
        b.close();
        assert!(a.is_closed());
    }
}
