//! conntrack-relay - kernel connection tracking to AMQP
//!
//! Reads conntrack events from the `conntrack` tool or straight from the
//! ctnetlink multicast groups, parses them into [`flow::Flow`] records and
//! publishes each one as JSON to a RabbitMQ exchange.

pub mod bridge;
pub mod config;
pub mod flow;
pub mod host;
pub mod publisher;
pub mod queue;
pub mod source;
pub mod utils;
