//! Connection-tracking flow records.
//!
//! A [`Flow`] is one lifecycle event (creation, update or teardown) of a
//! tracked connection, with per-direction metadata for the original and
//! reply tuples. Flows are produced by the [`parser`] and serialized to JSON
//! for the broker with fixed field names.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

pub mod parser;

pub use parser::{FlowParser, ParseMode};

/// Conntrack event types as reported by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    New,
    Update,
    Destroy,
}

impl EventType {
    pub const ALL: [EventType; 3] = [EventType::New, EventType::Update, EventType::Destroy];

    /// Tag used on the wire and in `conntrack -e` filters.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::New => "NEW",
            EventType::Update => "UPDATE",
            EventType::Destroy => "DESTROY",
        }
    }

    /// Parse a tag, case-insensitively.
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(tag))
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One connection-tracking event.
///
/// An empty `event_type` marks a line that could not be parsed. Such flows
/// must never be queued or published; see [`Flow::is_valid`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flow {
    /// Kernel event time, whole seconds.
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Kernel-assigned conntrack id (0 when not reported).
    pub id: u64,
    pub original: Meta,
    pub reply: Meta,
}

impl Flow {
    /// The sentinel returned for unparseable input.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        !self.event_type.is_empty()
    }

    /// True when the reply tuple is not the mirror of the original tuple,
    /// i.e. the kernel applied source or destination NAT.
    pub fn is_nat(&self) -> bool {
        self.original.layer3.src != self.reply.layer3.dst
            || self.original.layer3.dst != self.reply.layer3.src
            || self.original.layer4.sport != self.reply.layer4.dport
            || self.original.layer4.dport != self.reply.layer4.sport
    }
}

/// Per-direction projection of a flow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    pub layer3: Layer3,
    pub layer4: Layer4,
    pub counter: Counter,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layer3 {
    pub protonum: u32,
    pub protoname: String,
    #[serde(with = "ip_or_empty")]
    pub src: Option<IpAddr>,
    #[serde(with = "ip_or_empty")]
    pub dst: Option<IpAddr>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layer4 {
    pub protonum: u32,
    pub protoname: String,
    pub sport: u16,
    pub dport: u16,
}

/// Cumulative counters at event time. Only present when the kernel has
/// `nf_conntrack_acct` enabled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    pub packets: u64,
    pub bytes: u64,
}

/// Addresses serialize as strings, with `""` standing in for an address the
/// parser could not read.
mod ip_or_empty {
    use std::net::IpAddr;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ip: &Option<IpAddr>, s: S) -> Result<S::Ok, S::Error> {
        match ip {
            Some(ip) => s.collect_str(ip),
            None => s.serialize_str(""),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<IpAddr>, D::Error> {
        let raw = String::deserialize(d)?;
        if raw.is_empty() {
            return Ok(None);
        }
        raw.parse().map(Some).map_err(serde::de::Error::custom)
    }
}
