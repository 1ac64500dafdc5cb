//! Object store backend for partition logs and committed offsets.
//!
//! [`create_object_store`] builds an `object_store` client from the broker
//! configuration. [`ObjectStoreLog`] layers both [`LogStore`] and
//! [`OffsetStore`] on top of it:
//!
//! - each record is one object holding its complete frame, named by the byte
//!   offset at which it starts: `logs/<topic>/<partition>/<offset:020>`
//! - each cursor is one 8-byte little-endian object:
//!   `offsets/<group>/<topic>/<partition>`
//!
//! Offsets therefore mean exactly what they mean in the file log. Every
//! remote call is bounded by the configured timeout and retried once.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use object_store::ObjectStore;
use object_store::memory::InMemory;
use object_store::path::Path;
use tokio::sync::Mutex;
use tracing::info;

use super::config::{BrokerConfig, StorageBackend};
use super::error::{BrokerError, BrokerResult};
use super::log_store::check_path_component;
use super::metrics;
use super::retry::with_remote_policy;
use super::traits::{LogStore, OffsetStore, ReadResult};
use crate::constants::MAX_READ_BYTES;
use crate::protocol::{encode_frame, framed_len, split_frames};
use crate::types::{Offset, PartitionIndex};

/// Create an object store client for the configured remote backend.
///
/// `Local` storage is served by the file log and has no object store.
pub fn create_object_store(config: &BrokerConfig) -> BrokerResult<Arc<dyn ObjectStore>> {
    match &config.storage {
        StorageBackend::Local => Err(BrokerError::Config(
            "local storage uses the file log, not an object store".to_string(),
        )),
        StorageBackend::Memory => {
            info!("Using in-memory object store");
            Ok(Arc::new(InMemory::new()))
        }
        StorageBackend::S3 {
            bucket,
            region,
            endpoint,
            access_key_id,
            secret_access_key,
        } => {
            use object_store::aws::AmazonS3Builder;

            let mut builder = AmazonS3Builder::new()
                .with_bucket_name(bucket)
                .with_region(region);

            if let Some(ep) = endpoint {
                builder = builder.with_endpoint(ep).with_allow_http(true);
            }

            if let (Some(key), Some(secret)) = (access_key_id, secret_access_key) {
                builder = builder
                    .with_access_key_id(key)
                    .with_secret_access_key(secret);
            }

            let store = builder.build().map_err(|e| {
                BrokerError::Config(format!("Failed to create S3 object store: {}", e))
            })?;

            info!(bucket = %bucket, region = %region, "Using S3 object store");
            Ok(Arc::new(store))
        }
    }
}

type PartitionSlot = Arc<Mutex<Option<Offset>>>;

/// [`LogStore`] and [`OffsetStore`] over an object store.
pub struct ObjectStoreLog {
    store: Arc<dyn ObjectStore>,
    timeout: Duration,
    /// Known end offset per partition, recovered lazily from a listing.
    ends: DashMap<(Arc<str>, PartitionIndex), PartitionSlot>,
}

impl ObjectStoreLog {
    pub fn new(store: Arc<dyn ObjectStore>, timeout: Duration) -> Self {
        Self {
            store,
            timeout,
            ends: DashMap::new(),
        }
    }

    fn partition_prefix(topic: &str, partition: PartitionIndex) -> Path {
        Path::from(format!("logs/{}/{}", topic, partition))
    }

    fn record_path(topic: &str, partition: PartitionIndex, offset: Offset) -> Path {
        Path::from(format!("logs/{}/{}/{:020}", topic, partition, offset))
    }

    fn offset_path(group: &str, topic: &str, partition: PartitionIndex) -> Path {
        Path::from(format!("offsets/{}/{}/{}", group, topic, partition))
    }

    fn slot(&self, topic: &str, partition: PartitionIndex) -> PartitionSlot {
        self.ends
            .entry((Arc::from(topic), partition))
            .or_default()
            .clone()
    }

    /// Record objects of a partition as (start offset, object size), sorted.
    async fn list_records(
        &self,
        topic: &str,
        partition: PartitionIndex,
    ) -> BrokerResult<Vec<(Offset, usize)>> {
        let prefix = Self::partition_prefix(topic, partition);
        let listing = with_remote_policy("list", self.timeout, || async {
            Ok(self.store.list_with_delimiter(Some(&prefix)).await?)
        })
        .await?;

        let mut records: Vec<(Offset, usize)> = listing
            .objects
            .iter()
            .filter_map(|meta| {
                let offset = meta.location.filename()?.parse::<Offset>().ok()?;
                Some((offset, meta.size))
            })
            .collect();
        records.sort_unstable();
        Ok(records)
    }

    async fn recover_end(&self, topic: &str, partition: PartitionIndex) -> BrokerResult<Offset> {
        let records = self.list_records(topic, partition).await?;
        let end = records
            .last()
            .map(|(offset, size)| offset + *size as u64)
            .unwrap_or(0);
        tracing::debug!(topic = %topic, partition, end, "Recovered object log end offset");
        Ok(end)
    }

    async fn get_object(&self, operation: &str, path: &Path) -> BrokerResult<Option<Bytes>> {
        with_remote_policy(operation, self.timeout, || async {
            match self.store.get(path).await {
                Ok(result) => Ok(Some(result.bytes().await?)),
                Err(object_store::Error::NotFound { .. }) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn put_object(&self, operation: &str, path: &Path, body: Bytes) -> BrokerResult<()> {
        with_remote_policy(operation, self.timeout, || async {
            self.store.put(path, body.clone().into()).await?;
            Ok(())
        })
        .await
    }
}

impl std::fmt::Debug for ObjectStoreLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStoreLog")
            .field("store", &self.store.to_string())
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[async_trait]
impl LogStore for ObjectStoreLog {
    async fn append(
        &self,
        topic: &str,
        partition: PartitionIndex,
        payload: &[u8],
    ) -> BrokerResult<Offset> {
        check_path_component("topic", topic)?;
        if payload.is_empty() {
            return Err(BrokerError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty records cannot be framed",
            )));
        }

        let started = Instant::now();
        let slot = self.slot(topic, partition);
        let mut end = slot.lock().await;

        let offset = match *end {
            Some(offset) => offset,
            None => self.recover_end(topic, partition).await?,
        };

        let frame = encode_frame(payload);
        let framed = frame.len() as u64;
        self.put_object("put_record", &Self::record_path(topic, partition, offset), frame)
            .await?;
        *end = Some(offset + framed);
        drop(end);

        metrics::record_storage_operation("remote_append", started.elapsed().as_secs_f64());
        metrics::record_append(topic, partition, payload.len() as u64);
        Ok(offset)
    }

    async fn read(
        &self,
        _consumer_group: &str,
        topic: &str,
        partition: PartitionIndex,
        offset: Offset,
        max_bytes: usize,
    ) -> BrokerResult<ReadResult> {
        check_path_component("topic", topic)?;
        let max_bytes = max_bytes.min(MAX_READ_BYTES);
        let started = Instant::now();

        // Record paths follow from offsets, so walk forward object by object
        // instead of listing the partition.
        let mut records = Vec::new();
        let mut consumed = 0usize;
        while consumed + framed_len(1) <= max_bytes {
            let start = offset + consumed as u64;
            let Some(body) = self
                .get_object("get_record", &Self::record_path(topic, partition, start))
                .await?
            else {
                break;
            };
            if consumed + body.len() > max_bytes {
                break;
            }

            let split = split_frames(body);
            let payload = match <[Bytes; 1]>::try_from(split.records) {
                Ok([payload]) => payload,
                Err(_) => {
                    metrics::CORRUPT_FRAMES.inc();
                    tracing::warn!(
                        topic = %topic,
                        partition,
                        offset = start,
                        "Record object does not hold exactly one frame"
                    );
                    break;
                }
            };
            consumed += framed_len(payload.len());
            records.push(payload);
        }

        metrics::record_storage_operation("remote_read", started.elapsed().as_secs_f64());
        metrics::record_read(topic, partition, "log", records.len() as u64, consumed as u64);
        Ok(ReadResult {
            records,
            bytes_consumed: consumed as u64,
        })
    }

    async fn end_offset(&self, topic: &str, partition: PartitionIndex) -> BrokerResult<Offset> {
        check_path_component("topic", topic)?;
        let slot = self.slot(topic, partition);
        let mut end = slot.lock().await;
        match *end {
            Some(offset) => Ok(offset),
            None => {
                let offset = self.recover_end(topic, partition).await?;
                *end = Some(offset);
                Ok(offset)
            }
        }
    }
}

#[async_trait]
impl OffsetStore for ObjectStoreLog {
    async fn store_offset(
        &self,
        consumer_group: &str,
        topic: &str,
        partition: PartitionIndex,
        offset: Offset,
    ) -> BrokerResult<()> {
        check_path_component("consumer group", consumer_group)?;
        check_path_component("topic", topic)?;
        let path = Self::offset_path(consumer_group, topic, partition);
        self.put_object(
            "put_offset",
            &path,
            Bytes::copy_from_slice(&offset.to_le_bytes()),
        )
        .await
    }

    async fn read_offset(
        &self,
        consumer_group: &str,
        topic: &str,
        partition: PartitionIndex,
    ) -> BrokerResult<Offset> {
        check_path_component("consumer group", consumer_group)?;
        check_path_component("topic", topic)?;
        let path = Self::offset_path(consumer_group, topic, partition);

        match self.get_object("get_offset", &path).await? {
            Some(body) => {
                let raw: [u8; 8] = body.as_ref().try_into().map_err(|_| {
                    BrokerError::Io(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("offset object holds {} bytes, expected 8", body.len()),
                    ))
                })?;
                Ok(u64::from_le_bytes(raw))
            }
            None => {
                self.put_object("put_offset", &path, Bytes::copy_from_slice(&0u64.to_le_bytes()))
                    .await?;
                Ok(0)
            }
        }
    }
}
