//! Ingestion-side configuration: event source, parser, queue and bridge.

use std::time::Duration;

use serde::Deserialize;

use super::ConfigError;
use crate::flow::{EventType, ParseMode};
use crate::queue::DEFAULT_QUEUE_CAPACITY;
use crate::source::subprocess::{DEFAULT_BUFFER_SIZE, DEFAULT_PROGRAM};
use crate::source::EventFilter;

/// Event source discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    /// `conntrack -E` child process.
    #[default]
    Subprocess,
    /// Kernel ctnetlink multicast socket.
    Netlink,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    #[serde(rename = "type")]
    pub source_type: SourceType,
    /// Tags from `NEW`, `UPDATE`, `DESTROY`.
    pub event_types: Vec<String>,
    pub nat_only: bool,
    /// Kernel receive buffer, bytes.
    pub buffer_size: usize,
    /// Pause before restarting a failed source.
    pub restart_delay_ms: u64,
    /// Subprocess strategy only.
    pub program: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            source_type: SourceType::default(),
            event_types: vec!["NEW".to_string(), "DESTROY".to_string()],
            nat_only: false,
            buffer_size: DEFAULT_BUFFER_SIZE,
            restart_delay_ms: 0,
            program: DEFAULT_PROGRAM.to_string(),
        }
    }
}

impl SourceConfig {
    pub fn event_filter(&self) -> Result<EventFilter, ConfigError> {
        let mut event_types = Vec::with_capacity(self.event_types.len());
        for tag in &self.event_types {
            let event_type = EventType::from_tag(tag.trim()).ok_or_else(|| {
                ConfigError::Invalid(format!("source.event_types: unknown event type '{tag}'"))
            })?;
            if !event_types.contains(&event_type) {
                event_types.push(event_type);
            }
        }
        if event_types.is_empty() {
            return Err(ConfigError::Invalid(
                "source.event_types must not be empty".to_string(),
            ));
        }

        Ok(EventFilter {
            event_types,
            nat_only: self.nat_only,
        })
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ParserConfig {
    pub mode: ParseMode,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// After a failed publish and a successful reconnect, try the same flow
    /// once more instead of dropping it.
    pub retry_once_after_reconnect: bool,
    /// Attach the `host_id` header to every message.
    pub host_header: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            retry_once_after_reconnect: false,
            host_header: true,
        }
    }
}
