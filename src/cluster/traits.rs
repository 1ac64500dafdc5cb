//! Traits at the seams of the engine.
//!
//! - [`CoordinationClient`]: the shared distributed key/value store (etcd-like)
//! - [`LogStore`]: append-only per-partition logs
//! - [`OffsetStore`]: committed consumer offsets
//!
//! # Available Implementations
//!
//! | Trait | Implementations |
//! |-------|-----------------|
//! | [`CoordinationClient`] | [`MockCoordinator`](super::MockCoordinator) (in-memory, tests and demos) |
//! | [`LogStore`] | [`FileLogStore`](super::FileLogStore), [`ObjectStoreLog`](super::ObjectStoreLog) |
//! | [`OffsetStore`] | [`FileOffsetStore`](super::FileOffsetStore), [`ObjectStoreLog`](super::ObjectStoreLog) |
//!
//! A production coordination client wraps a real etcd v3 connection; the
//! engine only ever talks to `Arc<dyn CoordinationClient>`.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use super::error::BrokerResult;
use crate::types::{Offset, PartitionIndex};

/// Lease handle issued by the coordination store.
pub type LeaseId = i64;

/// A stored key with its metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
    /// Number of puts since the key was created. Absent keys have version 0.
    pub version: i64,
    pub lease: Option<LeaseId>,
}

/// Kind of change delivered by a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Put,
    Delete,
}

/// One change under a watched prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub key: String,
    /// New value for `Put`, empty for `Delete`.
    pub value: String,
}

/// Push stream of watch events. Dropping the receiver cancels the watch.
pub type WatchStream = mpsc::UnboundedReceiver<WatchEvent>;

/// Client for the shared coordination store.
///
/// One instance is shared by every subsystem of a broker process and must be
/// safe to call concurrently.
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    // ========================================================================
    // Key/Value
    // ========================================================================

    /// Get a single key.
    async fn get(&self, key: &str) -> BrokerResult<Option<KeyValue>>;

    /// Get every key starting with `prefix`, ordered by key.
    async fn get_range(&self, prefix: &str) -> BrokerResult<Vec<KeyValue>>;

    /// Write a key, optionally attached to a lease.
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> BrokerResult<()>;

    /// Delete a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> BrokerResult<bool>;

    /// Transactionally write `key` only if its current version equals
    /// `expected_version` (0 means "absent"). Returns whether it succeeded.
    async fn compare_and_put(
        &self,
        key: &str,
        expected_version: i64,
        value: &str,
        lease: Option<LeaseId>,
    ) -> BrokerResult<bool>;

    // ========================================================================
    // Watches
    // ========================================================================

    /// Watch every key starting with `prefix`. Events may arrive while other
    /// watchers are being served; consumers must tolerate concurrency.
    async fn watch_range(&self, prefix: &str) -> BrokerResult<WatchStream>;

    // ========================================================================
    // Leases
    // ========================================================================

    /// Grant a lease with the given TTL.
    async fn lease_grant(&self, ttl: Duration) -> BrokerResult<LeaseId>;

    /// Refresh a lease. Returns the TTL the store now reports, which is zero
    /// when the lease no longer exists.
    async fn lease_keep_alive(&self, lease: LeaseId) -> BrokerResult<Duration>;

    /// Revoke a lease and delete every key attached to it.
    async fn lease_revoke(&self, lease: LeaseId) -> BrokerResult<()>;
}

/// Records returned by a read together with the bytes they occupied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadResult {
    pub records: Vec<Bytes>,
    /// Framed size of `records`; add to the read offset for the next read.
    pub bytes_consumed: u64,
}

impl ReadResult {
    /// The "no new data" result.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Append-only byte log per (topic, partition).
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Append one record and return the offset at which it begins.
    async fn append(
        &self,
        topic: &str,
        partition: PartitionIndex,
        payload: &[u8],
    ) -> BrokerResult<Offset>;

    /// Read complete records starting at `offset`, using at most `max_bytes`
    /// of log. Reading at or past the end is not an error.
    async fn read(
        &self,
        consumer_group: &str,
        topic: &str,
        partition: PartitionIndex,
        offset: Offset,
        max_bytes: usize,
    ) -> BrokerResult<ReadResult>;

    /// Current end of the log (0 if it was never written).
    async fn end_offset(&self, topic: &str, partition: PartitionIndex) -> BrokerResult<Offset>;
}

/// Durable committed offset per (consumer group, topic, partition).
///
/// Writes are last-write-wins. Two members of one group committing the same
/// partition concurrently can overwrite each other's progress.
#[async_trait]
pub trait OffsetStore: Send + Sync {
    async fn store_offset(
        &self,
        consumer_group: &str,
        topic: &str,
        partition: PartitionIndex,
        offset: Offset,
    ) -> BrokerResult<()>;

    /// Read the committed offset. An absent offset is stored as 0 and returned.
    async fn read_offset(
        &self,
        consumer_group: &str,
        topic: &str,
        partition: PartitionIndex,
    ) -> BrokerResult<Offset>;
}
