//! ctnetlink message decoding.
//!
//! Pure byte-level decoding of conntrack event datagrams received on a
//! `NETLINK_NETFILTER` socket. Platform independent so it can be tested
//! anywhere; the socket itself lives in `netlink`.
//!
//! Decoded events are rendered back into the same line grammar that
//! `conntrack -E -o timestamp,extended,id` prints, so both sources share
//! one parser.

use std::fmt::Write as _;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::flow::{Counter, EventType};

// Netlink framing
pub const NLMSG_HDRLEN: usize = 16;
pub const NLMSG_NOOP: u16 = 1;
pub const NLMSG_ERROR: u16 = 2;
pub const NLMSG_DONE: u16 = 3;
pub const NLMSG_OVERRUN: u16 = 4;
const NFGENMSG_LEN: usize = 4;
const NLA_HDRLEN: usize = 4;
const NLA_F_NESTED: u16 = 0x8000;
const NLA_F_NET_BYTEORDER: u16 = 0x4000;
const NLA_TYPE_MASK: u16 = !(NLA_F_NESTED | NLA_F_NET_BYTEORDER);

pub const NLM_F_EXCL: u16 = 0x200;
pub const NLM_F_CREATE: u16 = 0x400;

// nfnetlink
pub const NFNL_SUBSYS_CTNETLINK: u8 = 1;
pub const IPCTNL_MSG_CT_NEW: u8 = 0;
pub const IPCTNL_MSG_CT_DELETE: u8 = 2;

/// Multicast group bits for `bind(2)` on a netfilter socket.
pub const NF_NETLINK_CONNTRACK_NEW: u32 = 0x0000_0001;
pub const NF_NETLINK_CONNTRACK_UPDATE: u32 = 0x0000_0002;
pub const NF_NETLINK_CONNTRACK_DESTROY: u32 = 0x0000_0004;

// Top-level conntrack attributes
const CTA_TUPLE_ORIG: u16 = 1;
const CTA_TUPLE_REPLY: u16 = 2;
const CTA_COUNTERS_ORIG: u16 = 9;
const CTA_COUNTERS_REPLY: u16 = 10;
const CTA_ID: u16 = 12;

const CTA_TUPLE_IP: u16 = 1;
const CTA_TUPLE_PROTO: u16 = 2;

const CTA_IP_V4_SRC: u16 = 1;
const CTA_IP_V4_DST: u16 = 2;
const CTA_IP_V6_SRC: u16 = 3;
const CTA_IP_V6_DST: u16 = 4;

const CTA_PROTO_NUM: u16 = 1;
const CTA_PROTO_SRC_PORT: u16 = 2;
const CTA_PROTO_DST_PORT: u16 = 3;
const CTA_PROTO_ICMP_ID: u16 = 4;
const CTA_PROTO_ICMP_TYPE: u16 = 5;
const CTA_PROTO_ICMP_CODE: u16 = 6;
const CTA_PROTO_ICMPV6_ID: u16 = 7;
const CTA_PROTO_ICMPV6_TYPE: u16 = 8;
const CTA_PROTO_ICMPV6_CODE: u16 = 9;

const CTA_COUNTERS_PACKETS: u16 = 1;
const CTA_COUNTERS_BYTES: u16 = 2;
const CTA_COUNTERS32_PACKETS: u16 = 3;
const CTA_COUNTERS32_BYTES: u16 = 4;

const AF_INET: u8 = 2;
const AF_INET6: u8 = 10;

/// Errors decoding a datagram.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Truncated netlink message")]
    Truncated,

    /// The kernel dropped events because the receive buffer was full.
    #[error("Netlink receive buffer overrun")]
    Overrun,

    #[error("Netlink error reply: errno {0}")]
    Netlink(i32),
}

/// Multicast group mask for the requested event types.
pub fn group_mask(event_types: &[EventType]) -> u32 {
    event_types.iter().fold(0, |mask, t| {
        mask | match t {
            EventType::New => NF_NETLINK_CONNTRACK_NEW,
            EventType::Update => NF_NETLINK_CONNTRACK_UPDATE,
            EventType::Destroy => NF_NETLINK_CONNTRACK_DESTROY,
        }
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcmpInfo {
    pub kind: u8,
    pub code: u8,
    pub id: u16,
}

/// One direction of a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tuple {
    pub src: Option<IpAddr>,
    pub dst: Option<IpAddr>,
    pub protonum: u8,
    pub sport: Option<u16>,
    pub dport: Option<u16>,
    pub icmp: Option<IcmpInfo>,
}

/// A decoded conntrack event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConntrackEvent {
    pub event_type: EventType,
    pub family: u8,
    pub id: Option<u32>,
    pub original: Tuple,
    pub reply: Tuple,
    pub counters_original: Option<Counter>,
    pub counters_reply: Option<Counter>,
}

impl ConntrackEvent {
    fn empty(event_type: EventType, family: u8) -> Self {
        Self {
            event_type,
            family,
            id: None,
            original: Tuple::default(),
            reply: Tuple::default(),
            counters_original: None,
            counters_reply: None,
        }
    }

    /// Reply tuple differs from the mirrored original.
    pub fn is_nat(&self) -> bool {
        self.original.src != self.reply.dst
            || self.original.dst != self.reply.src
            || self.original.sport != self.reply.dport
            || self.original.dport != self.reply.sport
    }

    /// Render as a `conntrack -E -o timestamp,extended,id` line.
    pub fn render(&self, at: SystemTime) -> String {
        let since = at.duration_since(UNIX_EPOCH).unwrap_or_default();
        let l4 = self.original.protonum;

        let mut line = format!(
            "[{}.{:06}] [{}] {} {} {} {}",
            since.as_secs(),
            since.subsec_micros(),
            self.event_type,
            l3_name(self.family),
            self.family,
            l4_name(l4),
            l4,
        );

        render_tuple(&mut line, &self.original, self.counters_original);
        render_tuple(&mut line, &self.reply, self.counters_reply);

        if let Some(id) = self.id {
            let _ = write!(line, " id={id}");
        }
        line
    }
}

fn render_tuple(line: &mut String, tuple: &Tuple, counter: Option<Counter>) {
    let _ = write!(line, " src={} dst={}", display_ip(tuple.src), display_ip(tuple.dst));
    if let (Some(sport), Some(dport)) = (tuple.sport, tuple.dport) {
        let _ = write!(line, " sport={sport} dport={dport}");
    }
    if let Some(icmp) = tuple.icmp {
        let _ = write!(line, " type={} code={} id={}", icmp.kind, icmp.code, icmp.id);
    }
    if let Some(counter) = counter {
        let _ = write!(line, " packets={} bytes={}", counter.packets, counter.bytes);
    }
}

fn display_ip(ip: Option<IpAddr>) -> String {
    ip.map(|ip| ip.to_string()).unwrap_or_else(|| "?".to_string())
}

pub fn l3_name(family: u8) -> &'static str {
    match family {
        AF_INET => "ipv4",
        AF_INET6 => "ipv6",
        _ => "unknown",
    }
}

pub fn l4_name(protonum: u8) -> &'static str {
    match protonum {
        1 => "icmp",
        6 => "tcp",
        17 => "udp",
        33 => "dccp",
        47 => "gre",
        58 => "icmpv6",
        132 => "sctp",
        136 => "udplite",
        _ => "unknown",
    }
}

/// Decode every conntrack event in one datagram.
///
/// Non-conntrack messages, acks and `NLMSG_DONE` are skipped.
pub fn decode_datagram(buf: &[u8]) -> Result<Vec<ConntrackEvent>, DecodeError> {
    let mut events = Vec::new();
    let mut offset = 0;

    while buf.len() - offset >= NLMSG_HDRLEN {
        let msg = &buf[offset..];
        let len = read_u32_ne(msg, 0)? as usize;
        if len < NLMSG_HDRLEN || len > msg.len() {
            return Err(DecodeError::Truncated);
        }
        let kind = read_u16_ne(msg, 4)?;
        let flags = read_u16_ne(msg, 6)?;
        let payload = &msg[NLMSG_HDRLEN..len];

        match kind {
            NLMSG_NOOP | NLMSG_DONE => {}
            NLMSG_OVERRUN => return Err(DecodeError::Overrun),
            NLMSG_ERROR => {
                let errno = read_u32_ne(payload, 0)? as i32;
                if errno != 0 {
                    return Err(DecodeError::Netlink(errno.wrapping_neg()));
                }
            }
            _ => {
                if let Some(event) = decode_message(kind, flags, payload)? {
                    events.push(event);
                }
            }
        }

        offset += align(len);
        if offset >= buf.len() {
            break;
        }
    }

    Ok(events)
}

fn decode_message(
    kind: u16,
    flags: u16,
    payload: &[u8],
) -> Result<Option<ConntrackEvent>, DecodeError> {
    let [subsys, msg] = kind.to_be_bytes();
    if subsys != NFNL_SUBSYS_CTNETLINK {
        return Ok(None);
    }

    let event_type = match msg {
        IPCTNL_MSG_CT_NEW if flags & (NLM_F_CREATE | NLM_F_EXCL) != 0 => EventType::New,
        IPCTNL_MSG_CT_NEW => EventType::Update,
        IPCTNL_MSG_CT_DELETE => EventType::Destroy,
        _ => return Ok(None),
    };

    if payload.len() < NFGENMSG_LEN {
        return Err(DecodeError::Truncated);
    }
    let mut event = ConntrackEvent::empty(event_type, payload[0]);

    for (kind, value) in Attributes::new(&payload[NFGENMSG_LEN..]) {
        let value = value?;
        match kind {
            CTA_TUPLE_ORIG => event.original = decode_tuple(value)?,
            CTA_TUPLE_REPLY => event.reply = decode_tuple(value)?,
            CTA_COUNTERS_ORIG => event.counters_original = Some(decode_counters(value)?),
            CTA_COUNTERS_REPLY => event.counters_reply = Some(decode_counters(value)?),
            CTA_ID => event.id = Some(read_u32_be(value)?),
            _ => {}
        }
    }

    Ok(Some(event))
}

fn decode_tuple(buf: &[u8]) -> Result<Tuple, DecodeError> {
    let mut tuple = Tuple::default();

    for (kind, value) in Attributes::new(buf) {
        let value = value?;
        match kind {
            CTA_TUPLE_IP => {
                for (kind, value) in Attributes::new(value) {
                    let value = value?;
                    match kind {
                        CTA_IP_V4_SRC => tuple.src = Some(read_ipv4(value)?),
                        CTA_IP_V4_DST => tuple.dst = Some(read_ipv4(value)?),
                        CTA_IP_V6_SRC => tuple.src = Some(read_ipv6(value)?),
                        CTA_IP_V6_DST => tuple.dst = Some(read_ipv6(value)?),
                        _ => {}
                    }
                }
            }
            CTA_TUPLE_PROTO => decode_proto(value, &mut tuple)?,
            _ => {}
        }
    }

    Ok(tuple)
}

fn decode_proto(buf: &[u8], tuple: &mut Tuple) -> Result<(), DecodeError> {
    let (mut icmp_type, mut code, mut id) = (None, None, None);

    for (kind, value) in Attributes::new(buf) {
        let value = value?;
        match kind {
            CTA_PROTO_NUM => tuple.protonum = read_u8(value)?,
            CTA_PROTO_SRC_PORT => tuple.sport = Some(read_u16_be(value)?),
            CTA_PROTO_DST_PORT => tuple.dport = Some(read_u16_be(value)?),
            CTA_PROTO_ICMP_TYPE | CTA_PROTO_ICMPV6_TYPE => icmp_type = Some(read_u8(value)?),
            CTA_PROTO_ICMP_CODE | CTA_PROTO_ICMPV6_CODE => code = Some(read_u8(value)?),
            CTA_PROTO_ICMP_ID | CTA_PROTO_ICMPV6_ID => id = Some(read_u16_be(value)?),
            _ => {}
        }
    }

    if let Some(kind) = icmp_type {
        tuple.icmp = Some(IcmpInfo {
            kind,
            code: code.unwrap_or_default(),
            id: id.unwrap_or_default(),
        });
    }
    Ok(())
}

fn decode_counters(buf: &[u8]) -> Result<Counter, DecodeError> {
    let mut counter = Counter::default();
    for (kind, value) in Attributes::new(buf) {
        let value = value?;
        match kind {
            CTA_COUNTERS_PACKETS => counter.packets = read_u64_be(value)?,
            CTA_COUNTERS_BYTES => counter.bytes = read_u64_be(value)?,
            CTA_COUNTERS32_PACKETS => counter.packets = u64::from(read_u32_be(value)?),
            CTA_COUNTERS32_BYTES => counter.bytes = u64::from(read_u32_be(value)?),
            _ => {}
        }
    }
    Ok(counter)
}

/// Iterator over `nlattr` TLVs. Yields the masked attribute type and payload.
struct Attributes<'a> {
    buf: &'a [u8],
    failed: bool,
}

impl<'a> Attributes<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, failed: false }
    }
}

impl<'a> Iterator for Attributes<'a> {
    type Item = (u16, Result<&'a [u8], DecodeError>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.buf.len() < NLA_HDRLEN {
            return None;
        }
        let len = u16::from_ne_bytes([self.buf[0], self.buf[1]]) as usize;
        let kind = u16::from_ne_bytes([self.buf[2], self.buf[3]]) & NLA_TYPE_MASK;

        if len < NLA_HDRLEN || len > self.buf.len() {
            self.failed = true;
            return Some((kind, Err(DecodeError::Truncated)));
        }

        let value = &self.buf[NLA_HDRLEN..len];
        self.buf = &self.buf[align(len).min(self.buf.len())..];
        Some((kind, Ok(value)))
    }
}

const fn align(len: usize) -> usize {
    (len + 3) & !3
}

fn bytes<const N: usize>(buf: &[u8], at: usize) -> Result<[u8; N], DecodeError> {
    buf.get(at..at + N)
        .and_then(|s| s.try_into().ok())
        .ok_or(DecodeError::Truncated)
}

fn read_u8(buf: &[u8]) -> Result<u8, DecodeError> {
    buf.first().copied().ok_or(DecodeError::Truncated)
}

fn read_u16_ne(buf: &[u8], at: usize) -> Result<u16, DecodeError> {
    bytes(buf, at).map(u16::from_ne_bytes)
}

fn read_u32_ne(buf: &[u8], at: usize) -> Result<u32, DecodeError> {
    bytes(buf, at).map(u32::from_ne_bytes)
}

fn read_u16_be(buf: &[u8]) -> Result<u16, DecodeError> {
    bytes(buf, 0).map(u16::from_be_bytes)
}

fn read_u32_be(buf: &[u8]) -> Result<u32, DecodeError> {
    bytes(buf, 0).map(u32::from_be_bytes)
}

fn read_u64_be(buf: &[u8]) -> Result<u64, DecodeError> {
    bytes(buf, 0).map(u64::from_be_bytes)
}

fn read_ipv4(buf: &[u8]) -> Result<IpAddr, DecodeError> {
    bytes::<4>(buf, 0).map(|b| IpAddr::V4(Ipv4Addr::from(b)))
}

fn read_ipv6(buf: &[u8]) -> Result<IpAddr, DecodeError> {
    bytes::<16>(buf, 0).map(|b| IpAddr::V6(Ipv6Addr::from(b)))
}
