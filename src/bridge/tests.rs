use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::*;
use crate::flow::FlowParser;
use crate::publisher::mock::MockBroker;
use crate::publisher::{
    ExchangeSpec, ExchangeType, PublisherConfig, PublisherError, ResilientPublisher,
    StaticCredentials,
};
use crate::queue::flow_queue;
use crate::source::LineSink;

const SAMPLE: &str = "[1623430000.123456] [NEW] tcp 6 tcp  sport=0 dport=0 src=10.0.0.1 dst=10.0.0.2 sport=1234 dport=80 packets=3 bytes=180 src=10.0.0.2 dst=10.0.0.1 sport=80 dport=1234 packets=2 bytes=120";

#[derive(Debug, Clone)]
struct Published {
    exchange: String,
    routing_key: String,
    body: Vec<u8>,
    headers: Headers,
}

/// Records publishes; fails the calls scripted in `failures`.
#[derive(Clone, Default)]
struct RecordingPublisher {
    published: Arc<Mutex<Vec<Published>>>,
    failures: Arc<Mutex<VecDeque<bool>>>,
    waits: Arc<Mutex<usize>>,
}

impl RecordingPublisher {
    async fn fail_next(&self, outcomes: &[bool]) {
        self.failures.lock().await.extend(outcomes.iter().copied());
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        headers: &Headers,
    ) -> crate::publisher::Result<()> {
        if self.failures.lock().await.pop_front().unwrap_or(false) {
            return Err(PublisherError::NotReady);
        }
        self.published.lock().await.push(Published {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body,
            headers: headers.clone(),
        });
        Ok(())
    }

    async fn wait_until_ready(&self) {
        *self.waits.lock().await += 1;
    }
}

fn flow(id: u64) -> Flow {
    Flow {
        event_type: "NEW".to_string(),
        id,
        ..Default::default()
    }
}

async fn run_with(publisher: RecordingPublisher, retry_once: bool, flows: Vec<Flow>) -> BridgeStats {
    let (tx, rx) = flow_queue(flows.len().max(1));
    for flow in flows {
        tx.push(flow).await.unwrap();
    }
    drop(tx);

    Bridge::new(publisher, rx, "conntrack", "flows")
        .with_retry_once(retry_once)
        .run()
        .await
}

#[tokio::test]
async fn test_publishes_json_in_queue_order() {
    let publisher = RecordingPublisher::default();
    let stats = run_with(publisher.clone(), false, vec![flow(1), flow(2), flow(3)]).await;

    assert_eq!(stats.published, 3);
    let published = publisher.published.lock().await;
    let ids: Vec<u64> = published
        .iter()
        .map(|p| serde_json::from_slice::<Flow>(&p.body).unwrap().id)
        .collect();
    assert_eq!(ids, vec![1, 2, 3]);
    assert_eq!(published[0].exchange, "conntrack");
    assert_eq!(published[0].routing_key, "flows");
}

#[tokio::test]
async fn test_unparsed_flows_are_never_published() {
    let publisher = RecordingPublisher::default();
    let stats = run_with(publisher.clone(), false, vec![Flow::empty(), flow(7), Flow::empty()]).await;

    assert_eq!(stats.skipped, 2);
    assert_eq!(stats.published, 1);
    assert_eq!(publisher.published.lock().await.len(), 1);
}

#[tokio::test]
async fn test_failed_flow_is_dropped_after_waiting() {
    let publisher = RecordingPublisher::default();
    publisher.fail_next(&[true]).await;

    let stats = run_with(publisher.clone(), false, vec![flow(1), flow(2)]).await;

    assert_eq!(stats.failed, 1);
    assert_eq!(stats.dropped, 1);
    assert_eq!(stats.published, 1);
    assert_eq!(*publisher.waits.lock().await, 1);

    let published = publisher.published.lock().await;
    let survivor: Flow = serde_json::from_slice(&published[0].body).unwrap();
    assert_eq!(survivor.id, 2);
}

#[tokio::test]
async fn test_retry_once_republishes_same_flow() {
    let publisher = RecordingPublisher::default();
    publisher.fail_next(&[true, false]).await;

    let stats = run_with(publisher.clone(), true, vec![flow(1)]).await;

    assert_eq!(stats.failed, 1);
    assert_eq!(stats.published, 1);
    assert_eq!(stats.dropped, 0);
    let published = publisher.published.lock().await;
    assert_eq!(serde_json::from_slice::<Flow>(&published[0].body).unwrap().id, 1);
}

#[tokio::test]
async fn test_retry_happens_at_most_once() {
    let publisher = RecordingPublisher::default();
    publisher.fail_next(&[true, true]).await;

    let stats = run_with(publisher.clone(), true, vec![flow(1), flow(2)]).await;

    assert_eq!(stats.failed, 2);
    assert_eq!(stats.dropped, 1);
    assert_eq!(stats.published, 1);
    assert_eq!(*publisher.waits.lock().await, 2);
}

#[tokio::test]
async fn test_headers_are_attached() {
    let publisher = RecordingPublisher::default();
    let (tx, rx) = flow_queue(1);
    tx.push(flow(1)).await.unwrap();
    drop(tx);

    Bridge::new(publisher.clone(), rx, "conntrack", "")
        .with_headers(Headers::new().with("host_id", "7c0f"))
        .run()
        .await;

    let published = publisher.published.lock().await;
    assert_eq!(published[0].headers.get("host_id"), Some("7c0f"));
}

#[tokio::test]
async fn test_end_to_end_sample_line() {
    let broker = MockBroker::new();
    let publisher = ResilientPublisher::start(
        Arc::new(broker.clone()),
        Arc::new(StaticCredentials::new("guest", "guest")),
        PublisherConfig {
            exchange: ExchangeSpec {
                name: "conntrack".to_string(),
                kind: ExchangeType::Fanout,
            },
            confirms: true,
            reconnect_interval: Duration::from_millis(10),
            reply_to: None,
        },
    );
    tokio::time::timeout(Duration::from_secs(5), publisher.wait_until_ready())
        .await
        .unwrap();

    let (tx, rx) = flow_queue(4);
    let sink = LineSink::new(FlowParser::default(), tx);
    sink.push_line(SAMPLE).await.unwrap();
    sink.push_line("this is not a conntrack event").await.unwrap();
    drop(sink);

    let stats = Bridge::new(publisher, rx, "conntrack", "").run().await;
    assert_eq!(stats.published, 1);

    let messages = broker.published().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].exchange, "conntrack");
    assert_eq!(messages[0].content_type, "application/json");

    let body: serde_json::Value = serde_json::from_slice(&messages[0].body).unwrap();
    assert_eq!(body["timestamp"], 1623430000);
    assert_eq!(body["type"], "NEW");
    assert_eq!(body["original"]["layer3"]["src"], "10.0.0.1");
    assert_eq!(body["original"]["layer4"]["dport"], 80);
    assert_eq!(body["original"]["counter"]["bytes"], 180);
    assert_eq!(body["reply"]["layer3"]["src"], "10.0.0.2");
    assert_eq!(body["reply"]["counter"]["bytes"], 120);
}

#[tokio::test]
async fn test_channel_failure_drops_only_the_failed_flow() {
    let broker = MockBroker::new();
    let publisher = ResilientPublisher::start(
        Arc::new(broker.clone()),
        Arc::new(StaticCredentials::new("guest", "guest")),
        PublisherConfig {
            exchange: ExchangeSpec {
                name: "conntrack".to_string(),
                kind: ExchangeType::Direct,
            },
            confirms: true,
            reconnect_interval: Duration::from_millis(10),
            reply_to: None,
        },
    );
    tokio::time::timeout(Duration::from_secs(5), publisher.wait_until_ready())
        .await
        .unwrap();

    // The broker closes the channel itself before the publish call returns.
    broker.fail_next_publish().await;

    let (tx, rx) = flow_queue(3);
    for id in 1..=3 {
        tx.push(flow(id)).await.unwrap();
    }
    drop(tx);

    let stats = tokio::time::timeout(
        Duration::from_secs(5),
        Bridge::new(publisher, rx, "conntrack", "").run(),
    )
    .await
    .unwrap();

    assert_eq!(stats.failed, 1);
    assert_eq!(stats.dropped, 1);
    assert_eq!(stats.published, 2);

    let ids: Vec<u64> = broker
        .published()
        .await
        .iter()
        .map(|m| serde_json::from_slice::<Flow>(&m.body).unwrap().id)
        .collect();
    assert_eq!(ids, vec![2, 3]);
    assert_eq!(broker.connect_count().await, 2);
}

#[tokio::test]
async fn test_recovers_after_broker_drop() {
    let broker = MockBroker::new();
    let publisher = ResilientPublisher::start(
        Arc::new(broker.clone()),
        Arc::new(StaticCredentials::new("guest", "guest")),
        PublisherConfig {
            exchange: ExchangeSpec {
                name: "conntrack".to_string(),
                kind: ExchangeType::Fanout,
            },
            confirms: false,
            reconnect_interval: Duration::from_millis(10),
            reply_to: None,
        },
    );
    tokio::time::timeout(Duration::from_secs(5), publisher.wait_until_ready())
        .await
        .unwrap();

    let (tx, rx) = flow_queue(4);
    let bridge = tokio::spawn(Bridge::new(publisher, rx, "conntrack", "").run());

    tx.push(flow(1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    broker.drop_connections().await;
    // Lost: published while the connection is gone.
    tx.push(flow(2)).await.unwrap();
    tx.push(flow(3)).await.unwrap();
    drop(tx);

    let stats = tokio::time::timeout(Duration::from_secs(5), bridge)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(stats.published, 2);
    assert_eq!(stats.dropped, 1);
    assert_eq!(broker.connect_count().await, 2);
}
