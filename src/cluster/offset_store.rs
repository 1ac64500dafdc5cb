//! Local file implementation of [`OffsetStore`].
//!
//! Each committed offset is an 8-byte little-endian u64 at
//! `{data_dir}/offsets/{group}/{topic}/{partition}.offset`.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;

use super::error::BrokerResult;
use super::log_store::check_path_component;
use super::traits::OffsetStore;
use crate::constants::OFFSETS_DIR;
use crate::types::{Offset, PartitionIndex};

type OffsetKey = (Arc<str>, Arc<str>, PartitionIndex);

/// File-per-cursor offset store.
///
/// Writes to one cursor are serialised so a reader never observes a
/// half-written file, but there is no compare-and-swap: the last commit wins.
#[derive(Debug)]
pub struct FileOffsetStore {
    root: PathBuf,
    locks: DashMap<OffsetKey, Arc<Mutex<()>>>,
}

impl FileOffsetStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            root: data_dir.as_ref().join(OFFSETS_DIR),
            locks: DashMap::new(),
        }
    }

    pub fn offset_path(&self, group: &str, topic: &str, partition: PartitionIndex) -> PathBuf {
        self.root
            .join(group)
            .join(topic)
            .join(format!("{}.offset", partition))
    }

    fn lock_for(&self, group: &str, topic: &str, partition: PartitionIndex) -> Arc<Mutex<()>> {
        self.locks
            .entry((Arc::from(group), Arc::from(topic), partition))
            .or_default()
            .clone()
    }

    async fn write_cursor(path: &Path, offset: Offset) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, offset.to_le_bytes()).await
    }

    async fn read_cursor(path: &Path) -> io::Result<Option<Offset>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("offset file holds {} bytes, expected 8", bytes.len()),
                    )
                })?;
                Ok(Some(u64::from_le_bytes(raw)))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl OffsetStore for FileOffsetStore {
    async fn store_offset(
        &self,
        consumer_group: &str,
        topic: &str,
        partition: PartitionIndex,
        offset: Offset,
    ) -> BrokerResult<()> {
        check_path_component("consumer group", consumer_group)?;
        check_path_component("topic", topic)?;

        let path = self.offset_path(consumer_group, topic, partition);
        let lock = self.lock_for(consumer_group, topic, partition);
        let _guard = lock.lock().await;
        Self::write_cursor(&path, offset).await?;

        tracing::trace!(group = consumer_group, topic = %topic, partition, offset, "Stored offset");
        Ok(())
    }

    async fn read_offset(
        &self,
        consumer_group: &str,
        topic: &str,
        partition: PartitionIndex,
    ) -> BrokerResult<Offset> {
        check_path_component("consumer group", consumer_group)?;
        check_path_component("topic", topic)?;

        let path = self.offset_path(consumer_group, topic, partition);
        let lock = self.lock_for(consumer_group, topic, partition);
        let _guard = lock.lock().await;

        match Self::read_cursor(&path).await? {
            Some(offset) => Ok(offset),
            None => {
                Self::write_cursor(&path, 0).await?;
                tracing::debug!(group = consumer_group, topic = %topic, partition, "Initialised offset at 0");
                Ok(0)
            }
        }
    }
}
