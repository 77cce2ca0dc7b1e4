use std::io::Write;

use serial_test::serial;

use super::*;
use crate::flow::{EventType, ParseMode};
use crate::publisher::ExchangeType;

fn yaml(body: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    file.write_all(body.as_bytes()).unwrap();
    file
}

/// Clears every variable the loader reads, runs `f`, clears again.
fn with_env<T>(vars: &[(&str, &str)], f: impl FnOnce() -> T) -> T {
    let clear = || {
        for (key, _) in std::env::vars() {
            if key.starts_with("CTRELAY") {
                std::env::remove_var(key);
            }
        }
    };
    clear();
    for (key, value) in vars {
        std::env::set_var(key, value);
    }
    let result = f();
    clear();
    result
}

#[test]
fn test_defaults() {
    let config = Config::default();

    assert_eq!(config.source.source_type, SourceType::Subprocess);
    assert_eq!(config.source.event_types, vec!["NEW", "DESTROY"]);
    assert_eq!(config.source.program, "conntrack");
    assert_eq!(config.queue.capacity, 128);
    assert_eq!(config.parser.mode, ParseMode::Lenient);
    assert_eq!(config.amqp.port, 5672);
    assert_eq!(config.amqp.exchange_type, ExchangeType::Direct);
    assert_eq!(config.amqp.reconnect_interval_ms, 1000);
    assert!(!config.amqp.skip_confirms);
    assert!(config.bridge.host_header);
    assert!(!config.bridge.retry_once_after_reconnect);
    assert!(config.validate().is_ok());
}

#[test]
#[serial]
fn test_load_from_file() {
    let file = yaml(
        r#"
source:
  type: netlink
  event_types: [NEW, UPDATE, DESTROY]
  nat_only: true
  buffer_size: 4194304
parser:
  mode: strict
queue:
  capacity: 16
amqp:
  host: rabbit.internal
  exchange: flows
  exchange_type: topic
  routing_key: conntrack.events
  skip_confirms: true
logging:
  verbose: true
"#,
    );

    let config = with_env(&[], || Config::load(file.path().to_str())).unwrap();

    assert_eq!(config.source.source_type, SourceType::Netlink);
    assert!(config.source.nat_only);
    assert_eq!(config.source.buffer_size, 4_194_304);
    assert_eq!(config.parser.mode, ParseMode::Strict);
    assert_eq!(config.queue.capacity, 16);
    assert_eq!(config.amqp.host, "rabbit.internal");
    assert_eq!(config.amqp.exchange_type, ExchangeType::Topic);
    assert!(config.logging.verbose);

    let filter = config.source.event_filter().unwrap();
    assert_eq!(filter.event_types, EventType::ALL.to_vec());

    let publisher = config.amqp.publisher_config();
    assert!(!publisher.confirms);
    assert_eq!(publisher.exchange.name, "flows");
}

#[test]
#[serial]
fn test_env_overrides_file() {
    let file = yaml("amqp:\n  host: from-file\n  port: 5672\n");

    let config = with_env(
        &[
            ("CTRELAY__AMQP__HOST", "from-env"),
            ("CTRELAY__AMQP__PORT", "5671"),
            ("CTRELAY__SOURCE__EVENT_TYPES", "NEW,UPDATE"),
        ],
        || Config::load(file.path().to_str()),
    )
    .unwrap();

    assert_eq!(config.amqp.host, "from-env");
    assert_eq!(config.amqp.port, 5671);
    assert_eq!(config.source.event_types, vec!["NEW", "UPDATE"]);
}

#[test]
#[serial]
fn test_config_env_var_names_file() {
    let file = yaml("queue:\n  capacity: 7\n");
    let path = file.path().to_str().unwrap().to_string();

    let config = with_env(&[("CTRELAY_CONFIG", path.as_str())], || Config::load(None)).unwrap();
    assert_eq!(config.queue.capacity, 7);
}

#[test]
#[serial]
fn test_missing_explicit_file_is_an_error() {
    let result = with_env(&[], || Config::load(Some("/nonexistent/relay.yaml")));
    assert!(matches!(result, Err(ConfigError::Load(_))));
}

#[test]
fn test_unknown_event_type_is_rejected() {
    let mut config = Config::default();
    config.source.event_types = vec!["NEW".to_string(), "EXPIRED".to_string()];

    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("EXPIRED"), "{err}");
}

#[test]
fn test_zero_capacity_is_rejected() {
    let mut config = Config::default();
    config.queue.capacity = 0;
    assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
}

#[test]
fn test_event_types_are_case_insensitive_and_deduplicated() {
    let mut config = Config::default();
    config.source.event_types = vec!["new".into(), "NEW".into(), "destroy".into()];

    let filter = config.source.event_filter().unwrap();
    assert_eq!(filter.event_types, vec![EventType::New, EventType::Destroy]);
}

#[test]
fn test_tls_bundle_requires_ca_and_identity() {
    let mut tls = TlsConfig::default();
    assert!(tls.bundle().is_none());

    tls.identity = Some("/etc/relay/client.p12".into());
    assert!(tls.bundle().is_none(), "partial bundle dials plaintext");

    tls.ca = Some("/etc/relay/ca.pem".into());
    let bundle = tls.bundle().expect("complete bundle");
    assert_eq!(bundle.identity.to_str(), Some("/etc/relay/client.p12"));
    assert_eq!(bundle.password, "");

    tls.identity_password = Some("p12-secret".to_string());
    assert_eq!(tls.bundle().unwrap().password, "p12-secret");
}

#[test]
fn test_debug_redacts_secrets() {
    let mut config = AmqpConfig::default();
    config.password = "hunter2".to_string();
    config.tls.identity_password = Some("p12-secret".to_string());

    let rendered = format!("{config:?}");
    assert!(!rendered.contains("hunter2"));
    assert!(!rendered.contains("p12-secret"));
}
