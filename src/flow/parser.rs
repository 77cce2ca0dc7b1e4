//! Line parser for `conntrack -E -o timestamp,extended,id` output.
//!
//! A line looks like:
//!
//! ```text
//! [1623430000.123456]     [NEW] ipv4     2 tcp      6 120 SYN_SENT src=10.0.0.1 dst=10.0.0.2 sport=1234 dport=80 [UNREPLIED] src=10.0.0.2 dst=10.0.0.1 sport=80 dport=1234 id=3054561728
//! ```
//!
//! The grammar is one composite pattern built from three named sub-patterns:
//! a header (timestamp, event type, layer 3/4 names and numbers), the
//! original-direction tuple and the reply-direction tuple, followed by an
//! optional trailing `id=`. Ports and counters are optional in both tuples.

use std::net::IpAddr;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{Counter, Flow, Layer3, Layer4, Meta};

const HEADER_PATTERN: &str = r"^\s*(?:\[(?P<timestamp>\d+)(?:\.\d+)?\]\s+)?\[(?P<type>NEW|UPDATE|DESTROY)\]\s+(?P<l3name>\S+)\s+(?P<l3num>\d+)\s+(?P<l4name>\S+)(?:\s+(?P<l4num>\d+))?";

/// Skips protocol state tokens (timeout, `SYN_SENT`, ...) up to the first tuple.
const HEADER_SKIP: &str = r"(?:\s+\S+)*?\s+";

const TRAILER_PATTERN: &str = r"(?:.*\sid=(?P<id>\d+))?";

/// Tuple sub-pattern; `dir` prefixes every group name.
fn tuple_pattern(dir: &str) -> String {
    format!(
        r"src=(?P<{dir}_src>\S+)\s+dst=(?P<{dir}_dst>\S+)(?:\s+sport=(?P<{dir}_sport>\d+)\s+dport=(?P<{dir}_dport>\d+))?(?:\s+type=\d+\s+code=\d+\s+id=\d+)?(?:\s+packets=(?P<{dir}_packets>\d+)\s+bytes=(?P<{dir}_bytes>\d+))?(?:\s+\[[A-Z_]+\])*"
    )
}

static FLOW_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    let pattern = format!(
        "{HEADER_PATTERN}{HEADER_SKIP}{original}\\s+{reply}{TRAILER_PATTERN}",
        original = tuple_pattern("orig"),
        reply = tuple_pattern("reply"),
    );
    Regex::new(&pattern).expect("flow pattern is valid")
});

/// How field-level conversion failures are treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParseMode {
    /// Unconvertible numbers and addresses become zero / empty.
    #[default]
    Lenient,
    /// Any unconvertible field invalidates the whole record.
    Strict,
}

/// Converts raw event lines into [`Flow`] records.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlowParser {
    mode: ParseMode,
}

impl FlowParser {
    pub fn new(mode: ParseMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> ParseMode {
        self.mode
    }

    /// Parse one line. Returns [`Flow::empty`] when the line does not match
    /// the grammar, or (in strict mode) when a field fails to convert.
    pub fn parse(&self, line: &str) -> Flow {
        let Some(caps) = FLOW_PATTERN.captures(line) else {
            warn!(line = %line, "Unrecognized conntrack event line");
            return Flow::empty();
        };

        let mut fields = Fields {
            caps,
            rejected: Vec::new(),
        };

        let flow = Flow {
            timestamp: fields.number("timestamp"),
            event_type: fields.text("type"),
            id: fields.number("id"),
            original: fields.meta("orig"),
            reply: fields.meta("reply"),
        };

        if fields.rejected.is_empty() {
            return flow;
        }

        match self.mode {
            ParseMode::Lenient => {
                debug!(fields = ?fields.rejected, "Zeroed unconvertible fields");
                flow
            }
            ParseMode::Strict => {
                warn!(line = %line, fields = ?fields.rejected, "Rejected event with unconvertible fields");
                Flow::empty()
            }
        }
    }
}

/// Parse one line with the lenient default.
pub fn parse(line: &str) -> Flow {
    FlowParser::default().parse(line)
}

struct Fields<'h> {
    caps: Captures<'h>,
    rejected: Vec<String>,
}

impl Fields<'_> {
    fn text(&self, name: &str) -> String {
        self.caps
            .name(name)
            .map(|m| m.as_str().to_string())
            .unwrap_or_default()
    }

    fn number<T: FromStr + Default>(&mut self, name: &str) -> T {
        self.convert(name).unwrap_or_default()
    }

    fn address(&mut self, name: &str) -> Option<IpAddr> {
        self.convert(name)
    }

    fn convert<T: FromStr>(&mut self, name: &str) -> Option<T> {
        let raw = self.caps.name(name)?.as_str();
        match raw.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                self.rejected.push(format!("{}={}", name, raw));
                None
            }
        }
    }

    fn meta(&mut self, dir: &str) -> Meta {
        Meta {
            layer3: Layer3 {
                protonum: self.number("l3num"),
                protoname: self.text("l3name"),
                src: self.address(&format!("{}_src", dir)),
                dst: self.address(&format!("{}_dst", dir)),
            },
            layer4: Layer4 {
                protonum: self.number("l4num"),
                protoname: self.text("l4name"),
                sport: self.number(&format!("{}_sport", dir)),
                dport: self.number(&format!("{}_dport", dir)),
            },
            counter: Counter {
                packets: self.number(&format!("{}_packets", dir)),
                bytes: self.number(&format!("{}_bytes", dir)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "[1623430000.123456] [NEW] tcp 6 tcp  sport=0 dport=0 src=10.0.0.1 dst=10.0.0.2 sport=1234 dport=80 packets=3 bytes=180 src=10.0.0.2 dst=10.0.0.1 sport=80 dport=1234 packets=2 bytes=120";

    fn ip(s: &str) -> Option<IpAddr> {
        Some(s.parse().unwrap())
    }

    #[test]
    fn test_parse_full_tuple_sample() {
        let flow = parse(SAMPLE);

        assert_eq!(flow.timestamp, 1623430000);
        assert_eq!(flow.event_type, "NEW");
        assert_eq!(flow.id, 0);
        assert_eq!(flow.original.layer3.src, ip("10.0.0.1"));
        assert_eq!(flow.original.layer3.dst, ip("10.0.0.2"));
        assert_eq!(flow.original.layer4.sport, 1234);
        assert_eq!(flow.original.layer4.dport, 80);
        assert_eq!(flow.original.counter.packets, 3);
        assert_eq!(flow.original.counter.bytes, 180);
        assert_eq!(flow.reply.layer3.src, ip("10.0.0.2"));
        assert_eq!(flow.reply.layer3.dst, ip("10.0.0.1"));
        assert_eq!(flow.reply.layer4.sport, 80);
        assert_eq!(flow.reply.layer4.dport, 1234);
        assert_eq!(flow.reply.counter.packets, 2);
        assert_eq!(flow.reply.counter.bytes, 120);
    }

    #[test]
    fn test_parse_extended_output_with_state_and_id() {
        let line = "[1623430005.000001]\t    [NEW] ipv4     2 tcp      6 120 SYN_SENT src=192.168.1.20 dst=93.184.216.34 sport=51000 dport=443 [UNREPLIED] src=93.184.216.34 dst=203.0.113.7 sport=443 dport=51000 id=3054561728";
        let flow = parse(line);

        assert_eq!(flow.timestamp, 1623430005);
        assert_eq!(flow.event_type, "NEW");
        assert_eq!(flow.id, 3054561728);
        assert_eq!(flow.original.layer3.protoname, "ipv4");
        assert_eq!(flow.original.layer3.protonum, 2);
        assert_eq!(flow.original.layer4.protoname, "tcp");
        assert_eq!(flow.original.layer4.protonum, 6);
        assert_eq!(flow.original.layer4.dport, 443);
        assert_eq!(flow.reply.layer3.dst, ip("203.0.113.7"));
        assert_eq!(flow.original.counter, Counter::default());
        assert!(flow.is_nat());
    }

    #[test]
    fn test_parse_destroy_with_counters_and_flags() {
        let line = "[1623430100.5] [DESTROY] ipv4 2 udp 17 src=10.0.0.5 dst=1.1.1.1 sport=40000 dport=53 packets=1 bytes=70 src=1.1.1.1 dst=10.0.0.5 sport=53 dport=40000 packets=1 bytes=120 [ASSURED] mark=0 use=1 id=99";
        let flow = parse(line);

        assert_eq!(flow.event_type, "DESTROY");
        assert_eq!(flow.id, 99);
        assert_eq!(flow.original.layer4.protoname, "udp");
        assert_eq!(flow.original.counter.bytes, 70);
        assert_eq!(flow.reply.counter.bytes, 120);
        assert!(!flow.is_nat());
    }

    #[test]
    fn test_parse_icmp_without_ports_or_counters() {
        let line = "[1623430001.000000] [UPDATE] ipv4 2 icmp 1 src=192.168.1.10 dst=8.8.8.8 src=8.8.8.8 dst=192.168.1.10";
        let flow = parse(line);

        assert_eq!(flow.event_type, "UPDATE");
        assert_eq!(flow.original.layer3.src, ip("192.168.1.10"));
        assert_eq!(flow.reply.layer3.src, ip("8.8.8.8"));
        assert_eq!(flow.original.layer4.sport, 0);
        assert_eq!(flow.original.layer4.dport, 0);
        assert_eq!(flow.reply.layer4.dport, 0);
        assert_eq!(flow.original.counter, Counter::default());
        assert_eq!(flow.reply.counter, Counter::default());
    }

    #[test]
    fn test_parse_icmp_echo_ids_do_not_leak_into_conntrack_id() {
        let line = "[1623430002.000000] [NEW] ipv4 2 icmp 1 30 src=192.168.1.10 dst=8.8.8.8 type=8 code=0 id=4242 [UNREPLIED] src=8.8.8.8 dst=192.168.1.10 type=0 code=0 id=4242";
        let flow = parse(line);

        assert_eq!(flow.event_type, "NEW");
        assert_eq!(flow.id, 0);
        assert_eq!(flow.reply.layer3.dst, ip("192.168.1.10"));
    }

    #[test]
    fn test_parse_ipv6() {
        let line = "[1623430003.0] [NEW] ipv6 10 tcp 6 120 SYN_SENT src=2001:db8::1 dst=2001:db8::2 sport=50000 dport=22 [UNREPLIED] src=2001:db8::2 dst=2001:db8::1 sport=22 dport=50000 id=7";
        let flow = parse(line);

        assert_eq!(flow.original.layer3.protonum, 10);
        assert_eq!(flow.original.layer3.src, ip("2001:db8::1"));
        assert_eq!(flow.reply.layer4.sport, 22);
        assert_eq!(flow.id, 7);
    }

    #[test]
    fn test_parse_without_timestamp() {
        let line = "    [DESTROY] ipv4 2 tcp 6 src=10.0.0.1 dst=10.0.0.2 sport=1 dport=2 src=10.0.0.2 dst=10.0.0.1 sport=2 dport=1";
        let flow = parse(line);

        assert_eq!(flow.event_type, "DESTROY");
        assert_eq!(flow.timestamp, 0);
    }

    #[test]
    fn test_unmatched_line_yields_empty_flow() {
        for line in [
            "",
            "conntrack v1.4.6 (conntrack-tools): 12 flow events have been shown.",
            "[1623430000.1] [EXPIRED] ipv4 2 tcp 6 src=1.1.1.1 dst=2.2.2.2",
            "[NEW] ipv4 2 tcp 6 src=10.0.0.1 dst=10.0.0.2 sport=1 dport=2",
        ] {
            let flow = parse(line);
            assert!(!flow.is_valid(), "line should not parse: {:?}", line);
            assert_eq!(flow, Flow::empty());
        }
    }

    #[test]
    fn test_lenient_mode_zeroes_overflowing_fields() {
        let line = "[1623430000.1] [NEW] ipv4 2 tcp 6 src=10.0.0.1 dst=10.0.0.2 sport=70000 dport=80 src=10.0.0.2 dst=10.0.0.1 sport=80 dport=70000";
        let flow = FlowParser::new(ParseMode::Lenient).parse(line);

        assert!(flow.is_valid());
        assert_eq!(flow.original.layer4.sport, 0);
        assert_eq!(flow.original.layer4.dport, 80);
        assert_eq!(flow.reply.layer4.dport, 0);
    }

    #[test]
    fn test_strict_mode_rejects_overflowing_fields() {
        let line = "[1623430000.1] [NEW] ipv4 2 tcp 6 src=10.0.0.1 dst=10.0.0.2 sport=70000 dport=80 src=10.0.0.2 dst=10.0.0.1 sport=80 dport=70000";
        let flow = FlowParser::new(ParseMode::Strict).parse(line);

        assert!(!flow.is_valid());
    }

    #[test]
    fn test_malformed_address_lenient_vs_strict() {
        let line = "[1623430000.1] [NEW] ipv4 2 tcp 6 src=10.0.0.999 dst=10.0.0.2 sport=1 dport=2 src=10.0.0.2 dst=10.0.0.1 sport=2 dport=1";

        let lenient = FlowParser::new(ParseMode::Lenient).parse(line);
        assert!(lenient.is_valid());
        assert_eq!(lenient.original.layer3.src, None);
        assert_eq!(lenient.original.layer3.dst, ip("10.0.0.2"));

        let strict = FlowParser::new(ParseMode::Strict).parse(line);
        assert!(!strict.is_valid());
    }

    #[test]
    fn test_strict_mode_accepts_well_formed_lines() {
        let flow = FlowParser::new(ParseMode::Strict).parse(SAMPLE);
        assert_eq!(flow, parse(SAMPLE));
    }
}
