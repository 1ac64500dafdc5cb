//! Process-level broker facade.
//!
//! [`Broker`] wires the storage engine and the coordination subsystems
//! together:
//!
//! ```text
//!            append ──▶ LogStore ──▶ RecordCache (write-through)
//!            read   ──▶ RecordCache ──miss──▶ LogStore
//!            offsets──▶ OffsetStore
//!
//!   TopicList watch ──▶ LeaderElector per topic ──▶ PartitionAssigner
//!                                              └──▶ ConsumerGroupAssigner
//!   MembershipRegistry ──▶ Broker/<name>-<index> (+ consumer members)
//! ```
//!
//! The data-path entry points degrade failures into sentinels so a client
//! always gets an answer: a failed append reports offset 0 and a failed read
//! returns nothing. The `try_` variants expose the underlying error.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::Mutex;

use super::background_tasks::BackgroundTaskRegistry;
use super::config::{BrokerConfig, StorageBackend};
use super::error::{BrokerError, BrokerResult};
use super::keys;
use super::leader_election::{ElectionConfig, LeaderElector};
use super::log_store::FileLogStore;
use super::membership::MembershipRegistry;
use super::metrics;
use super::object_store::{ObjectStoreLog, create_object_store};
use super::offset_store::FileOffsetStore;
use super::record_cache::RecordCache;
use super::topic_list::TopicList;
use super::traits::{CoordinationClient, LogStore, OffsetStore, ReadResult};
use crate::message::{Message, MessageHeader, USE_COMMITTED_OFFSET};
use crate::types::{BrokerId, Offset, PartitionIndex};

/// One broker process.
pub struct Broker {
    config: BrokerConfig,
    identity: BrokerId,
    client: Arc<dyn CoordinationClient>,
    log: Arc<dyn LogStore>,
    offsets: Arc<dyn OffsetStore>,
    cache: RecordCache,
    membership: MembershipRegistry,
    topics: TopicList,
    electors: DashMap<String, Arc<LeaderElector>>,
    tasks: Mutex<BackgroundTaskRegistry>,
    shutting_down: AtomicBool,
}

impl Broker {
    /// Validate `config`, open the configured storage backend, register this
    /// broker and start following the topic list.
    ///
    /// Fails with [`BrokerError::Fatal`] if the data directory can't be
    /// created.
    pub async fn start(
        config: BrokerConfig,
        client: Arc<dyn CoordinationClient>,
    ) -> BrokerResult<Arc<Self>> {
        if let Err(errors) = config.validate() {
            return Err(BrokerError::Config(errors.join("; ")));
        }

        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .map_err(|e| {
                BrokerError::Fatal(format!(
                    "cannot create data directory {}: {}",
                    config.data_dir.display(),
                    e
                ))
            })?;

        match config.storage.clone() {
            StorageBackend::Local => {
                let file_log = Arc::new(FileLogStore::new(
                    config.data_dir.clone(),
                    config.handle_idle_timeout,
                ));
                let offsets = Arc::new(FileOffsetStore::new(&config.data_dir));
                let broker = Self::launch(config, client, file_log.clone(), offsets).await?;

                let interval = broker.config.handle_sweep_interval;
                broker
                    .tasks
                    .lock()
                    .await
                    .spawn_periodic("handle_sweeper", interval, move |_| {
                        let file_log = file_log.clone();
                        async move {
                            file_log.sweep_idle().await;
                        }
                    });
                Ok(broker)
            }
            StorageBackend::Memory | StorageBackend::S3 { .. } => {
                let store = create_object_store(&config)?;
                let remote = Arc::new(ObjectStoreLog::new(store, config.remote_timeout));
                Self::launch(config, client, remote.clone(), remote).await
            }
        }
    }

    /// Start with caller-supplied stores. No idle-handle sweeper is run.
    pub async fn start_with_stores(
        config: BrokerConfig,
        client: Arc<dyn CoordinationClient>,
        log: Arc<dyn LogStore>,
        offsets: Arc<dyn OffsetStore>,
    ) -> BrokerResult<Arc<Self>> {
        if let Err(errors) = config.validate() {
            return Err(BrokerError::Config(errors.join("; ")));
        }
        Self::launch(config, client, log, offsets).await
    }

    async fn launch(
        config: BrokerConfig,
        client: Arc<dyn CoordinationClient>,
        log: Arc<dyn LogStore>,
        offsets: Arc<dyn OffsetStore>,
    ) -> BrokerResult<Arc<Self>> {
        metrics::init_metrics();

        let identity = config.broker_id();
        let broker = Arc::new(Self {
            cache: RecordCache::new(config.cache_max_bytes),
            membership: MembershipRegistry::new(
                client.clone(),
                identity.clone(),
                config.lease_ttl,
                config.keepalive_interval,
            ),
            topics: TopicList::new(client.clone()),
            electors: DashMap::new(),
            tasks: Mutex::new(BackgroundTaskRegistry::new()),
            shutting_down: AtomicBool::new(false),
            identity,
            client,
            log,
            offsets,
            config,
        });

        broker.membership.register_broker().await?;
        broker.follow_topics().await?;

        tracing::info!(
            broker = %broker.identity,
            data_dir = %broker.config.data_dir.display(),
            storage = broker.config.storage.name(),
            "Broker started"
        );
        Ok(broker)
    }

    /// Start an elector for every known topic and for each topic created
    /// later.
    async fn follow_topics(self: &Arc<Self>) -> BrokerResult<()> {
        let mut watch = self.topics.watch().await?;

        for (topic, _) in self.topics.topics().await? {
            self.elect_quietly(&topic).await;
        }

        let weak = Arc::downgrade(self);
        self.tasks.lock().await.spawn("topic_watch", async move {
            while let Some(event) = watch.recv().await {
                let Some(topic) = TopicList::created_topic(&event) else {
                    continue;
                };
                let Some(broker) = weak.upgrade() else {
                    break;
                };
                broker.elect_quietly(topic).await;
            }
        });
        Ok(())
    }

    async fn elect_quietly(self: &Arc<Self>, topic: &str) {
        match self.elect(topic).await {
            Ok(true) => {}
            Ok(false) => tracing::debug!(topic = %topic, "Following existing leader"),
            Err(e) => tracing::warn!(topic = %topic, error = %e, "Election attempt failed"),
        }
    }

    pub fn identity(&self) -> &BrokerId {
        &self.identity
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn coordination(&self) -> &Arc<dyn CoordinationClient> {
        &self.client
    }

    // ========================================================================
    // Data path
    // ========================================================================

    /// Append one record. A failure is logged and reported as offset 0.
    pub async fn append(&self, topic: &str, partition: PartitionIndex, payload: Bytes) -> Offset {
        match self.try_append(topic, partition, payload).await {
            Ok(offset) => offset,
            Err(e) => {
                metrics::record_storage_fallback("append");
                tracing::warn!(topic = %topic, partition, error = %e, "Append failed");
                0
            }
        }
    }

    /// Append one record, then cache it under its offset.
    pub async fn try_append(
        &self,
        topic: &str,
        partition: PartitionIndex,
        payload: Bytes,
    ) -> BrokerResult<Offset> {
        let offset = self.log.append(topic, partition, &payload).await?;
        self.cache.put(topic, partition, offset, payload);
        Ok(offset)
    }

    /// Read records at `offset`. A failure is logged and reported as empty.
    pub async fn read(
        &self,
        consumer_group: &str,
        topic: &str,
        partition: PartitionIndex,
        offset: Offset,
        max_bytes: usize,
    ) -> ReadResult {
        match self
            .try_read(consumer_group, topic, partition, offset, max_bytes)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                metrics::record_storage_fallback("read");
                tracing::warn!(topic = %topic, partition, offset, error = %e, "Read failed");
                ReadResult::empty()
            }
        }
    }

    /// Serve from the record cache when the first record is cached,
    /// otherwise from the log.
    pub async fn try_read(
        &self,
        consumer_group: &str,
        topic: &str,
        partition: PartitionIndex,
        offset: Offset,
        max_bytes: usize,
    ) -> BrokerResult<ReadResult> {
        let started = Instant::now();
        let cached = self.cache.scan(topic, partition, offset, max_bytes);
        if !cached.is_empty() {
            metrics::record_storage_operation("cache_read", started.elapsed().as_secs_f64());
            metrics::record_read(
                topic,
                partition,
                "cache",
                cached.records.len() as u64,
                cached.bytes_consumed,
            );
            return Ok(cached);
        }
        self.log
            .read(consumer_group, topic, partition, offset, max_bytes)
            .await
    }

    pub async fn store_offset(
        &self,
        consumer_group: &str,
        topic: &str,
        partition: PartitionIndex,
        offset: Offset,
    ) -> BrokerResult<()> {
        self.offsets
            .store_offset(consumer_group, topic, partition, offset)
            .await
    }

    pub async fn read_offset(
        &self,
        consumer_group: &str,
        topic: &str,
        partition: PartitionIndex,
    ) -> BrokerResult<Offset> {
        self.offsets
            .read_offset(consumer_group, topic, partition)
            .await
    }

    // ========================================================================
    // Control plane
    // ========================================================================

    pub async fn create_topic(&self, topic: &str, partitions: PartitionIndex) -> BrokerResult<bool> {
        self.topics.create_topic(topic, partitions).await
    }

    pub async fn partition_count(&self, topic: &str) -> BrokerResult<PartitionIndex> {
        self.topics.partition_count(topic).await
    }

    /// Broker currently assigned to a partition.
    pub async fn partition_owner(
        &self,
        topic: &str,
        partition: PartitionIndex,
    ) -> BrokerResult<Option<BrokerId>> {
        Ok(self
            .client
            .get(&keys::partition_owner_key(topic, partition))
            .await?
            .and_then(|kv| kv.value.parse().ok()))
    }

    pub async fn register_consumer(
        &self,
        topic: &str,
        group: &str,
        consumer_id: &str,
    ) -> BrokerResult<()> {
        self.membership
            .register_consumer(topic, group, consumer_id)
            .await
    }

    pub async fn deregister_consumer(
        &self,
        topic: &str,
        group: &str,
        consumer_id: &str,
    ) -> BrokerResult<()> {
        self.membership
            .deregister_consumer(topic, group, consumer_id)
            .await
    }

    pub async fn consumer_assignment(
        &self,
        topic: &str,
        group: &str,
        consumer_id: &str,
    ) -> BrokerResult<Vec<PartitionIndex>> {
        self.membership
            .consumer_assignment(topic, group, consumer_id)
            .await
    }

    async fn elector(&self, topic: &str) -> BrokerResult<Arc<LeaderElector>> {
        if let Some(elector) = self.electors.get(topic) {
            return Ok(elector.clone());
        }

        let elector = match self.electors.entry(topic.to_string()) {
            Entry::Occupied(existing) => return Ok(existing.get().clone()),
            Entry::Vacant(slot) => {
                let elector = LeaderElector::new(
                    topic,
                    self.identity.to_string(),
                    self.client.clone(),
                    ElectionConfig::from_broker_config(&self.config),
                );
                slot.insert(elector.clone());
                elector
            }
        };
        if let Err(e) = elector.start().await {
            // Let the next call build and start a fresh elector.
            self.electors
                .remove_if(topic, |_, existing| Arc::ptr_eq(existing, &elector));
            return Err(e);
        }
        Ok(elector)
    }

    /// Try to become leader of `topic`.
    pub async fn elect(&self, topic: &str) -> BrokerResult<bool> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(BrokerError::Shutdown);
        }
        let elector = self.elector(topic).await?;
        elector.elect().await
    }

    pub async fn is_leader(&self, topic: &str) -> bool {
        let elector = self.electors.get(topic).map(|e| e.clone());
        match elector {
            Some(elector) => elector.is_leader().await,
            None => false,
        }
    }

    /// Run both assigners for `topic` now if this broker leads it.
    pub async fn rebalance(&self, topic: &str) -> bool {
        let elector = self.electors.get(topic).map(|e| e.clone());
        match elector {
            Some(elector) => elector.rebalance().await,
            None => false,
        }
    }

    /// Stop electing for `topic`, releasing leadership if held.
    pub async fn shutdown_topic(&self, topic: &str) {
        if let Some((_, elector)) = self.electors.remove(topic) {
            elector.shutdown().await;
            tracing::info!(topic = %topic, "Topic elector stopped");
        }
    }

    // ========================================================================
    // Envelope handling
    // ========================================================================

    /// Serve one decoded envelope. Returns the reply, if the variant has one.
    pub async fn handle(&self, message: Message) -> Option<Message> {
        match message {
            Message::Publish { header, messages } => {
                for payload in messages {
                    self.append(&header.topic, header.partition, payload).await;
                }
                Some(Message::MessageReceived)
            }
            Message::FetchRequest {
                target,
                offset,
                read_size,
            } => {
                let header = MessageHeader::new(target.topic.clone(), target.partition);
                if read_size <= 0 || (offset < 0 && offset != USE_COMMITTED_OFFSET) {
                    tracing::warn!(
                        topic = %target.topic,
                        partition = target.partition,
                        offset,
                        read_size,
                        "Rejecting fetch with invalid bounds"
                    );
                    return Some(Message::NoNewMessage { header });
                }

                let start = if offset == USE_COMMITTED_OFFSET {
                    self.read_offset_or_zero(&target.consumer_group, &target.topic, target.partition)
                        .await
                } else {
                    offset as Offset
                };

                let result = self
                    .read(
                        &target.consumer_group,
                        &target.topic,
                        target.partition,
                        start,
                        read_size as usize,
                    )
                    .await;
                if result.is_empty() {
                    return Some(Message::NoNewMessage { header });
                }

                // Always bytes consumed; the consumer adds it to where it started.
                Some(Message::FetchResponse {
                    header,
                    offset: result.bytes_consumed as i64,
                    messages: result.records,
                })
            }
            Message::OffsetRequest(target) => {
                let offset = self
                    .read_offset_or_zero(&target.consumer_group, &target.topic, target.partition)
                    .await;
                Some(Message::OffsetResponse {
                    header: MessageHeader::new(target.topic, target.partition),
                    offset: offset as i64,
                })
            }
            Message::StoreOffset { target, offset } => {
                if offset < 0 {
                    tracing::warn!(topic = %target.topic, offset, "Ignoring negative offset commit");
                    return None;
                }
                if let Err(e) = self
                    .store_offset(
                        &target.consumer_group,
                        &target.topic,
                        target.partition,
                        offset as Offset,
                    )
                    .await
                {
                    metrics::record_storage_fallback("store_offset");
                    tracing::warn!(
                        group = %target.consumer_group,
                        topic = %target.topic,
                        partition = target.partition,
                        error = %e,
                        "Offset commit failed"
                    );
                }
                None
            }
            reply @ (Message::FetchResponse { .. }
            | Message::NoNewMessage { .. }
            | Message::MessageReceived
            | Message::OffsetResponse { .. }) => {
                tracing::warn!(kind = reply.kind(), "Ignoring response-only message");
                None
            }
        }
    }

    /// Decode an envelope, serve it and encode the reply.
    pub async fn handle_bytes(&self, data: Bytes) -> crate::error::Result<Option<Bytes>> {
        let message = Message::decode(data)?;
        match self.handle(message).await {
            Some(reply) => Ok(Some(reply.encode()?)),
            None => Ok(None),
        }
    }

    async fn read_offset_or_zero(
        &self,
        consumer_group: &str,
        topic: &str,
        partition: PartitionIndex,
    ) -> Offset {
        match self.read_offset(consumer_group, topic, partition).await {
            Ok(offset) => offset,
            Err(e) => {
                metrics::record_storage_fallback("read_offset");
                tracing::warn!(group = %consumer_group, topic = %topic, partition, error = %e, "Offset read failed");
                0
            }
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Stop background work, release every leadership and deregister.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(broker = %self.identity, "Shutting down broker");

        self.tasks.lock().await.shutdown_all().await;

        let electors: Vec<Arc<LeaderElector>> =
            self.electors.iter().map(|e| e.value().clone()).collect();
        self.electors.clear();
        for elector in electors {
            elector.shutdown().await;
        }

        self.membership.shutdown().await;
        tracing::info!(broker = %self.identity, "Broker stopped");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("identity", &self.identity)
            .field("topics", &self.electors.len())
            .field("cache", &self.cache)
            .finish()
    }
}
