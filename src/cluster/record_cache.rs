//! Size-bounded write-through cache of recently appended records.
//!
//! Entries are keyed by the byte offset at which the record's frame starts,
//! so a run of consecutive hits can be assembled by stepping over each
//! frame's header and payload. Entries are only ever evicted by the size
//! policy; appends never invalidate anything because the log is append-only.

use std::sync::Arc;

use bytes::Bytes;
use moka::sync::Cache;

use super::metrics;
use super::traits::ReadResult;
use crate::protocol::framed_len;
use crate::types::{Offset, PartitionIndex};

type RecordKey = (Arc<str>, PartitionIndex, Offset);

/// Write-through record cache in front of a [`LogStore`](super::LogStore).
#[derive(Clone)]
pub struct RecordCache {
    inner: Cache<RecordKey, Bytes>,
}

impl RecordCache {
    /// Cache holding at most `max_bytes` of payload.
    pub fn new(max_bytes: u64) -> Self {
        let inner = Cache::builder()
            .max_capacity(max_bytes)
            .weigher(|_key: &RecordKey, payload: &Bytes| -> u32 {
                payload.len().try_into().unwrap_or(u32::MAX)
            })
            .build();
        Self { inner }
    }

    /// Remember the record appended at `offset`.
    pub fn put(&self, topic: &str, partition: PartitionIndex, offset: Offset, payload: Bytes) {
        self.inner.insert((Arc::from(topic), partition, offset), payload);
    }

    pub fn get(&self, topic: &str, partition: PartitionIndex, offset: Offset) -> Option<Bytes> {
        self.inner.get(&(Arc::from(topic), partition, offset))
    }

    /// Collect consecutive cached records starting at `offset`.
    ///
    /// Stops at the first miss or before the frame that would push the
    /// framed total past `max_bytes`. An empty result means the first lookup
    /// missed (or the first frame alone is too large) and the caller should
    /// read from the log.
    pub fn scan(
        &self,
        topic: &str,
        partition: PartitionIndex,
        offset: Offset,
        max_bytes: usize,
    ) -> ReadResult {
        let topic: Arc<str> = Arc::from(topic);
        let mut records = Vec::new();
        let mut consumed = 0usize;

        loop {
            let at = offset + consumed as u64;
            let Some(payload) = self.inner.get(&(topic.clone(), partition, at)) else {
                metrics::record_cache_lookup(false);
                break;
            };
            metrics::record_cache_lookup(true);

            let step = framed_len(payload.len());
            if consumed + step > max_bytes {
                break;
            }
            consumed += step;
            records.push(payload);
        }

        ReadResult {
            records,
            bytes_consumed: consumed as u64,
        }
    }

    /// Approximate payload bytes held.
    pub fn weighted_size(&self) -> u64 {
        self.inner.run_pending_tasks();
        self.inner.weighted_size()
    }
}

impl std::fmt::Debug for RecordCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordCache")
            .field("entries", &self.inner.entry_count())
            .finish()
    }
}
