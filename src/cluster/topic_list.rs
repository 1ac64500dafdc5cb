//! Topic registry under `TopicList/`.
//!
//! A topic exists once `TopicList/<topic>` holds its partition count. The
//! count is written once and never changed; an absent or unreadable count is
//! treated as zero partitions.

use std::sync::Arc;

use super::error::{BrokerError, BrokerResult};
use super::keys;
use super::log_store::check_path_component;
use super::traits::{CoordinationClient, WatchEvent, WatchEventKind, WatchStream};
use crate::constants::TOPIC_LIST_PREFIX;
use crate::types::PartitionIndex;

/// Desired partition count of `topic`, or 0 if unknown.
pub async fn read_partition_count(
    client: &dyn CoordinationClient,
    topic: &str,
) -> BrokerResult<PartitionIndex> {
    let Some(kv) = client.get(&keys::topic_list_key(topic)).await? else {
        return Ok(0);
    };
    match kv.value.trim().parse::<PartitionIndex>() {
        Ok(count) if count >= 0 => Ok(count),
        _ => {
            tracing::warn!(topic = %topic, value = %kv.value, "Unparsable partition count, using 0");
            Ok(0)
        }
    }
}

pub struct TopicList {
    client: Arc<dyn CoordinationClient>,
}

impl TopicList {
    pub fn new(client: Arc<dyn CoordinationClient>) -> Self {
        Self { client }
    }

    /// Register `topic` with `partitions` partitions.
    ///
    /// Returns `Ok(true)` if the topic was created and `Ok(false)` if it
    /// already existed with the same count. An existing topic with a
    /// different count is a configuration error; counts are immutable.
    pub async fn create_topic(&self, topic: &str, partitions: PartitionIndex) -> BrokerResult<bool> {
        check_path_component("topic", topic).map_err(|e| BrokerError::Config(e.to_string()))?;
        if partitions <= 0 {
            return Err(BrokerError::Config(format!(
                "topic '{}' needs at least one partition, got {}",
                topic, partitions
            )));
        }

        let key = keys::topic_list_key(topic);
        if self
            .client
            .compare_and_put(&key, 0, &partitions.to_string(), None)
            .await?
        {
            tracing::info!(topic = %topic, partitions, "Created topic");
            return Ok(true);
        }

        let existing = read_partition_count(self.client.as_ref(), topic).await?;
        if existing == partitions {
            Ok(false)
        } else {
            Err(BrokerError::Config(format!(
                "topic '{}' already exists with {} partitions",
                topic, existing
            )))
        }
    }

    pub async fn partition_count(&self, topic: &str) -> BrokerResult<PartitionIndex> {
        read_partition_count(self.client.as_ref(), topic).await
    }

    /// Every registered topic with its partition count, sorted by name.
    pub async fn topics(&self) -> BrokerResult<Vec<(String, PartitionIndex)>> {
        Ok(self
            .client
            .get_range(TOPIC_LIST_PREFIX)
            .await?
            .into_iter()
            .filter_map(|kv| {
                let topic = keys::parse_topic_list_key(&kv.key)?.to_string();
                let count = kv.value.trim().parse().ok().filter(|c: &PartitionIndex| *c >= 0);
                Some((topic, count.unwrap_or(0)))
            })
            .collect())
    }

    /// Watch topic registrations.
    pub async fn watch(&self) -> BrokerResult<WatchStream> {
        self.client.watch_range(TOPIC_LIST_PREFIX).await
    }

    /// Topic created (or re-written) by a watch event.
    pub fn created_topic(event: &WatchEvent) -> Option<&str> {
        match event.kind {
            WatchEventKind::Put => keys::parse_topic_list_key(&event.key),
            WatchEventKind::Delete => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockCoordinator;

    fn topics() -> (Arc<MockCoordinator>, TopicList) {
        let store = Arc::new(MockCoordinator::new());
        let list = TopicList::new(store.clone());
        (store, list)
    }

    #[tokio::test]
    async fn test_create_and_read() {
        let (_store, list) = topics();
        assert!(list.create_topic("orders", 6).await.unwrap());
        assert_eq!(list.partition_count("orders").await.unwrap(), 6);
        assert_eq!(list.topics().await.unwrap(), vec![("orders".to_string(), 6)]);
    }

    #[tokio::test]
    async fn test_count_is_immutable() {
        let (_store, list) = topics();
        list.create_topic("orders", 6).await.unwrap();
        assert!(!list.create_topic("orders", 6).await.unwrap());
        assert!(matches!(
            list.create_topic("orders", 8).await,
            Err(BrokerError::Config(_))
        ));
        assert_eq!(list.partition_count("orders").await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_missing_or_garbage_count_is_zero() {
        let (store, list) = topics();
        assert_eq!(list.partition_count("nope").await.unwrap(), 0);
        store.put("TopicList/bad", "many", None).await.unwrap();
        assert_eq!(list.partition_count("bad").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_invalid_topics_rejected() {
        let (_store, list) = topics();
        assert!(list.create_topic("a/b", 1).await.is_err());
        assert!(list.create_topic("ok", 0).await.is_err());
    }

    #[tokio::test]
    async fn test_watch_reports_created_topics() {
        let (_store, list) = topics();
        let mut watch = list.watch().await.unwrap();
        list.create_topic("orders", 3).await.unwrap();
        let event = watch.recv().await.unwrap();
        assert_eq!(TopicList::created_topic(&event), Some("orders"));
    }
}
