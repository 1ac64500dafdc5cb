//! End-to-end tests of the [`Broker`] facade: envelope handling, sentinel
//! fallbacks and multi-broker coordination over a shared in-memory store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tempfile::TempDir;

use dream_stream::cluster::{
    Broker, BrokerConfig, BrokerError, BrokerResult, CoordinationClient, FileOffsetStore,
    LogStore, MockCoordinator, ReadResult, StorageBackend,
};
use dream_stream::message::{GroupPartition, Message, MessageHeader, USE_COMMITTED_OFFSET};
use dream_stream::protocol::framed_len;
use dream_stream::types::{Offset, PartitionIndex};

// ============================================================================
// Test Infrastructure
// ============================================================================

fn config(dir: &TempDir, index: u32) -> BrokerConfig {
    BrokerConfig {
        broker_index: index,
        data_dir: dir.path().join(format!("broker-{}", index)),
        lease_ttl: Duration::from_secs(1),
        keepalive_interval: Duration::from_millis(50),
        ..Default::default()
    }
}

async fn broker(dir: &TempDir, store: &Arc<MockCoordinator>, index: u32) -> Arc<Broker> {
    Broker::start(config(dir, index), store.clone()).await.unwrap()
}

fn target(group: &str, topic: &str, partition: PartitionIndex) -> GroupPartition {
    GroupPartition {
        consumer_group: group.to_string(),
        topic: topic.to_string(),
        partition,
    }
}

fn publish(topic: &str, partition: PartitionIndex, payloads: &[&'static [u8]]) -> Message {
    Message::Publish {
        header: MessageHeader::new(topic, partition),
        messages: payloads.iter().map(|p| Bytes::from_static(p)).collect(),
    }
}

fn fetch(group: &str, topic: &str, offset: i64, read_size: i32) -> Message {
    Message::FetchRequest {
        target: target(group, topic, 0),
        offset,
        read_size,
    }
}

async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

/// Log store whose every operation fails.
struct BrokenLog;

#[async_trait]
impl LogStore for BrokenLog {
    async fn append(&self, _: &str, _: PartitionIndex, _: &[u8]) -> BrokerResult<Offset> {
        Err(BrokerError::Io(std::io::Error::other("disk on fire")))
    }

    async fn read(
        &self,
        _: &str,
        _: &str,
        _: PartitionIndex,
        _: Offset,
        _: usize,
    ) -> BrokerResult<ReadResult> {
        Err(BrokerError::Io(std::io::Error::other("disk on fire")))
    }

    async fn end_offset(&self, _: &str, _: PartitionIndex) -> BrokerResult<Offset> {
        Err(BrokerError::Io(std::io::Error::other("disk on fire")))
    }
}

// ============================================================================
// Envelope handling
// ============================================================================

#[tokio::test]
async fn test_publish_then_fetch() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MockCoordinator::new());
    let broker = broker(&dir, &store, 0).await;

    let reply = broker.handle(publish("orders", 0, &[b"a", b"bb", b"ccc"])).await;
    assert_eq!(reply, Some(Message::MessageReceived));

    let reply = broker.handle(fetch("billing", "orders", 0, 1024)).await;
    let expected_end = (framed_len(1) + framed_len(2) + framed_len(3)) as i64;
    match reply {
        Some(Message::FetchResponse {
            header,
            offset,
            messages,
        }) => {
            assert_eq!(header, MessageHeader::new("orders", 0));
            assert_eq!(offset, expected_end);
            assert_eq!(
                messages,
                vec![
                    Bytes::from_static(b"a"),
                    Bytes::from_static(b"bb"),
                    Bytes::from_static(b"ccc")
                ]
            );
        }
        other => panic!("unexpected reply: {:?}", other),
    }

    let reply = broker
        .handle(fetch("billing", "orders", expected_end, 1024))
        .await;
    assert_eq!(
        reply,
        Some(Message::NoNewMessage {
            header: MessageHeader::new("orders", 0)
        })
    );
    broker.shutdown().await;
}

#[tokio::test]
async fn test_fetch_from_committed_offset() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MockCoordinator::new());
    let broker = broker(&dir, &store, 0).await;

    broker.handle(publish("orders", 0, &[b"first", b"second"])).await;
    let committed = framed_len(5) as i64;
    let reply = broker
        .handle(Message::StoreOffset {
            target: target("billing", "orders", 0),
            offset: committed,
        })
        .await;
    assert_eq!(reply, None);

    let reply = broker
        .handle(fetch("billing", "orders", USE_COMMITTED_OFFSET, 1024))
        .await;
    match reply {
        Some(Message::FetchResponse {
            offset, messages, ..
        }) => {
            assert_eq!(messages, vec![Bytes::from_static(b"second")]);
            // Bytes consumed, same as an explicit-offset fetch.
            assert_eq!(offset, framed_len(6) as i64);
        }
        other => panic!("unexpected reply: {:?}", other),
    }
    broker.shutdown().await;
}

#[tokio::test]
async fn test_offset_request_defaults_to_zero() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MockCoordinator::new());
    let broker = broker(&dir, &store, 0).await;

    let reply = broker
        .handle(Message::OffsetRequest(target("fresh", "orders", 2)))
        .await;
    assert_eq!(
        reply,
        Some(Message::OffsetResponse {
            header: MessageHeader::new("orders", 2),
            offset: 0
        })
    );

    broker
        .handle(Message::StoreOffset {
            target: target("fresh", "orders", 2),
            offset: 77,
        })
        .await;
    assert_eq!(broker.read_offset("fresh", "orders", 2).await.unwrap(), 77);
    broker.shutdown().await;
}

#[tokio::test]
async fn test_invalid_fetch_and_commit_are_rejected() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MockCoordinator::new());
    let broker = broker(&dir, &store, 0).await;
    broker.handle(publish("orders", 0, &[b"x"])).await;

    for request in [
        fetch("g", "orders", 0, 0),
        fetch("g", "orders", 0, -5),
        fetch("g", "orders", -7, 1024),
    ] {
        assert!(matches!(
            broker.handle(request).await,
            Some(Message::NoNewMessage { .. })
        ));
    }

    broker
        .handle(Message::StoreOffset {
            target: target("g", "orders", 0),
            offset: -3,
        })
        .await;
    assert_eq!(broker.read_offset("g", "orders", 0).await.unwrap(), 0);
    broker.shutdown().await;
}

#[tokio::test]
async fn test_response_variants_get_no_reply() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MockCoordinator::new());
    let broker = broker(&dir, &store, 0).await;

    assert_eq!(broker.handle(Message::MessageReceived).await, None);
    assert_eq!(
        broker
            .handle(Message::NoNewMessage {
                header: MessageHeader::new("t", 0)
            })
            .await,
        None
    );
    broker.shutdown().await;
}

#[tokio::test]
async fn test_handle_bytes_round_trip() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MockCoordinator::new());
    let broker = broker(&dir, &store, 0).await;

    let wire = publish("orders", 0, &[b"wire"]).encode().unwrap();
    let reply = broker.handle_bytes(wire).await.unwrap().unwrap();
    assert_eq!(Message::decode(reply).unwrap(), Message::MessageReceived);

    assert!(broker.handle_bytes(Bytes::from_static(&[0xff])).await.is_err());
    broker.shutdown().await;
}

#[tokio::test]
async fn test_reads_are_served_from_cache_after_append() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MockCoordinator::new());
    let broker = broker(&dir, &store, 0).await;

    let offset = broker.append("orders", 1, Bytes::from_static(b"hot")).await;
    let from_cache = broker.read("g", "orders", 1, offset, 1024).await;
    assert_eq!(from_cache.records, vec![Bytes::from_static(b"hot")]);
    assert_eq!(from_cache.bytes_consumed, framed_len(3) as u64);
    broker.shutdown().await;
}

// ============================================================================
// Sentinels and startup
// ============================================================================

#[tokio::test]
async fn test_storage_failures_degrade_to_sentinels() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MockCoordinator::new());
    let offsets = Arc::new(FileOffsetStore::new(dir.path()));
    let broker = Broker::start_with_stores(config(&dir, 0), store, Arc::new(BrokenLog), offsets)
        .await
        .unwrap();

    assert_eq!(broker.append("t", 0, Bytes::from_static(b"lost")).await, 0);
    assert!(broker.try_append("t", 0, Bytes::from_static(b"lost")).await.is_err());
    assert_eq!(broker.read("g", "t", 0, 0, 1024).await, ReadResult::empty());
    assert!(matches!(
        broker.handle(fetch("g", "t", 0, 1024)).await,
        Some(Message::NoNewMessage { .. })
    ));
    broker.shutdown().await;
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MockCoordinator::new());
    let mut bad = config(&dir, 0);
    bad.broker_name = String::new();

    let result = Broker::start(bad, store).await;
    assert!(matches!(result, Err(BrokerError::Config(_))));
}

#[tokio::test]
async fn test_uncreatable_data_dir_is_fatal() {
    let dir = TempDir::new().unwrap();
    let blocker = dir.path().join("file");
    std::fs::write(&blocker, b"not a directory").unwrap();

    let store = Arc::new(MockCoordinator::new());
    let mut cfg = config(&dir, 0);
    cfg.data_dir = blocker.join("data");

    let result = Broker::start(cfg, store).await;
    assert!(matches!(result, Err(BrokerError::Fatal(_))));
}

#[tokio::test]
async fn test_memory_backend() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MockCoordinator::new());
    let mut cfg = config(&dir, 0);
    cfg.storage = StorageBackend::Memory;
    let broker = Broker::start(cfg, store).await.unwrap();

    let first = broker.append("t", 0, Bytes::from_static(b"one")).await;
    let second = broker.append("t", 0, Bytes::from_static(b"two")).await;
    assert_eq!(first, 0);
    assert_eq!(second, framed_len(3) as u64);

    broker.store_offset("g", "t", 0, second).await.unwrap();
    assert_eq!(broker.read_offset("g", "t", 0).await.unwrap(), second);
    broker.shutdown().await;
}

// ============================================================================
// Coordination
// ============================================================================

#[tokio::test]
async fn test_broker_registers_and_deregisters() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MockCoordinator::new());
    let broker = broker(&dir, &store, 4).await;

    assert!(store.get("Broker/broker-4").await.unwrap().is_some());
    broker.shutdown().await;
    assert!(store.get("Broker/broker-4").await.unwrap().is_none());
    assert!(broker.elect("orders").await.is_err());
}

#[tokio::test]
async fn test_one_leader_per_topic_and_failover() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MockCoordinator::new());
    let a = broker(&dir, &store, 0).await;
    let b = broker(&dir, &store, 1).await;

    assert!(a.create_topic("orders", 4).await.unwrap());

    let (a_ref, b_ref, store_ref) = (&a, &b, &store);
    assert!(
        eventually(|| async move {
            let leaders = a_ref.is_leader("orders").await as u8 + b_ref.is_leader("orders").await as u8;
            leaders == 1 && store_ref.get_range("Topic/orders/").await.unwrap().len() == 4
        })
        .await
    );

    let (leader, follower) = if a.is_leader("orders").await { (a, b) } else { (b, a) };
    leader.shutdown().await;

    let (follower_ref, store_ref) = (&follower, &store);
    let survivor = follower.identity().to_string();
    let survivor_ref = &survivor;
    assert!(
        eventually(|| async move {
            follower_ref.is_leader("orders").await
                && store_ref
                    .get_range("Topic/orders/")
                    .await
                    .unwrap()
                    .iter()
                    .all(|kv| &kv.value == survivor_ref)
        })
        .await
    );
    for partition in 0..4 {
        assert_eq!(
            follower
                .partition_owner("orders", partition)
                .await
                .unwrap()
                .map(|id| id.to_string()),
            Some(survivor.clone())
        );
    }
    follower.shutdown().await;
}

#[tokio::test]
async fn test_registered_consumers_receive_assignments() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MockCoordinator::new());
    let broker = broker(&dir, &store, 0).await;
    broker.create_topic("orders", 4).await.unwrap();

    let broker_ref = &broker;
    assert!(eventually(|| async move { broker_ref.is_leader("orders").await }).await);

    broker.register_consumer("orders", "billing", "c1").await.unwrap();
    broker.register_consumer("orders", "billing", "c2").await.unwrap();

    assert!(
        eventually(|| async move {
            broker_ref
                .consumer_assignment("orders", "billing", "c1")
                .await
                .unwrap()
                == vec![0, 1]
                && broker_ref
                    .consumer_assignment("orders", "billing", "c2")
                    .await
                    .unwrap()
                    == vec![2, 3]
        })
        .await
    );

    broker
        .deregister_consumer("orders", "billing", "c2")
        .await
        .unwrap();
    assert!(
        eventually(|| async move {
            broker_ref
                .consumer_assignment("orders", "billing", "c1")
                .await
                .unwrap()
                == vec![0, 1, 2, 3]
        })
        .await
    );
    broker.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_topic_releases_leadership() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MockCoordinator::new());
    let broker = broker(&dir, &store, 0).await;
    broker.create_topic("orders", 2).await.unwrap();

    let broker_ref = &broker;
    assert!(eventually(|| async move { broker_ref.is_leader("orders").await }).await);

    broker.shutdown_topic("orders").await;
    assert!(!broker.is_leader("orders").await);
    assert!(store.get("Leader/orders").await.unwrap().is_none());

    assert!(broker.elect("orders").await.unwrap());
    assert!(broker.is_leader("orders").await);
    broker.shutdown().await;
}
