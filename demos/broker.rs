//! Three-broker walkthrough over an in-process coordination store.
//!
//! Starts three brokers sharing one [`MockCoordinator`], creates a topic,
//! publishes and consumes through the message envelope, then stops the topic
//! leader and waits for another broker to take over.
//!
//! ## Running
//!
//! ```bash
//! cargo run --example broker --features test-utilities
//! ```
//!
//! With JSON logging:
//! ```bash
//! LOG_FORMAT=json RUST_LOG=debug cargo run --example broker --features test-utilities
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dream_stream::cluster::{Broker, BrokerConfig, MockCoordinator, metrics};
use dream_stream::message::{GroupPartition, Message, MessageHeader, USE_COMMITTED_OFFSET};
use dream_stream::telemetry::{LogFormat, init_logging};
use tracing::info;

const TOPIC: &str = "orders";
const GROUP: &str = "billing";

async fn wait_for_leader(brokers: &[Arc<Broker>]) -> Option<usize> {
    for _ in 0..100 {
        for (i, broker) in brokers.iter().enumerate() {
            if broker.is_leader(TOPIC).await {
                return Some(i);
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    None
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging(LogFormat::from_env()).map_err(|e| -> Box<dyn std::error::Error> { e })?;

    let data = tempfile::tempdir()?;
    let store = Arc::new(MockCoordinator::new());

    let mut brokers = Vec::new();
    for index in 0..3 {
        let config = BrokerConfig {
            broker_name: "demo".to_string(),
            broker_index: index,
            data_dir: data.path().join(format!("demo-{}", index)),
            lease_ttl: Duration::from_secs(2),
            keepalive_interval: Duration::from_millis(200),
            ..Default::default()
        };
        brokers.push(Broker::start(config, store.clone()).await?);
    }

    brokers[0].create_topic(TOPIC, 6).await?;
    let leader = wait_for_leader(&brokers).await.ok_or("no leader elected")?;
    info!(leader = %brokers[leader].identity(), "Topic leader elected");

    for partition in 0..6 {
        let owner = brokers[0].partition_owner(TOPIC, partition).await?;
        info!(partition, owner = ?owner.map(|o| o.to_string()), "Partition owner");
    }

    // Publish through the wire format, as a producer would.
    let publish = Message::Publish {
        header: MessageHeader::new(TOPIC, 0),
        messages: vec![
            Bytes::from_static(b"order-1"),
            Bytes::from_static(b"order-2"),
            Bytes::from_static(b"order-3"),
        ],
    };
    let reply = brokers[1].handle_bytes(publish.encode()?).await?;
    info!(reply = ?reply.map(Message::decode), "Publish acknowledged");

    brokers[2].register_consumer(TOPIC, GROUP, "consumer-a").await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let assigned = brokers[2]
        .consumer_assignment(TOPIC, GROUP, "consumer-a")
        .await?;
    info!(?assigned, "Consumer assignment");

    let target = GroupPartition {
        consumer_group: GROUP.to_string(),
        topic: TOPIC.to_string(),
        partition: 0,
    };
    let fetch = Message::FetchRequest {
        target: target.clone(),
        offset: USE_COMMITTED_OFFSET,
        read_size: 4096,
    };
    let committed = brokers[1].read_offset(GROUP, TOPIC, 0).await? as i64;
    if let Some(Message::FetchResponse {
        offset: consumed,
        messages,
        ..
    }) = brokers[1].handle(fetch).await
    {
        let next = committed + consumed;
        info!(records = messages.len(), next, "Fetched from committed offset");
        brokers[1]
            .handle(Message::StoreOffset {
                target,
                offset: next,
            })
            .await;
    }

    info!(leader = %brokers[leader].identity(), "Stopping leader");
    brokers[leader].shutdown().await;
    let survivors: Vec<Arc<Broker>> = brokers
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != leader)
        .map(|(_, b)| b.clone())
        .collect();
    let next = wait_for_leader(&survivors).await.ok_or("no failover")?;
    info!(leader = %survivors[next].identity(), "Leadership moved");

    for broker in &survivors {
        broker.shutdown().await;
    }

    println!("{}", metrics::encode_metrics()?);
    Ok(())
}
