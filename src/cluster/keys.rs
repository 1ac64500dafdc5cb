//! Coordination store key layout.
//!
//! | Key | Value |
//! |-----|-------|
//! | `TopicList/<topic>` | desired partition count (decimal) |
//! | `Leader/<topic>` | leader identity, lease-bound |
//! | `Broker/<name>-<index>` | liveness marker |
//! | `Topic/<topic>/<partition>` | `<name>-<index>` of the owning broker |
//! | `ConsumerGroup/<topic>/<group>/<consumerId>` | comma-separated partitions |
//!
//! Builders and parsers live together so the layout is defined in one place.

use crate::constants::{
    BROKER_PREFIX, CONSUMER_GROUP_PREFIX, LEADER_PREFIX, TOPIC_LIST_PREFIX, TOPIC_PREFIX,
};
use crate::types::{BrokerId, PartitionIndex};

pub fn topic_list_key(topic: &str) -> String {
    format!("{}{}", TOPIC_LIST_PREFIX, topic)
}

pub fn leader_key(topic: &str) -> String {
    format!("{}{}", LEADER_PREFIX, topic)
}

pub fn broker_key(broker: &BrokerId) -> String {
    format!("{}{}", BROKER_PREFIX, broker)
}

/// Prefix holding every partition owner of `topic`.
pub fn topic_assignment_prefix(topic: &str) -> String {
    format!("{}{}/", TOPIC_PREFIX, topic)
}

pub fn partition_owner_key(topic: &str, partition: PartitionIndex) -> String {
    format!("{}{}/{}", TOPIC_PREFIX, topic, partition)
}

/// Prefix holding every consumer group member of `topic`.
pub fn consumer_group_prefix(topic: &str) -> String {
    format!("{}{}/", CONSUMER_GROUP_PREFIX, topic)
}

pub fn consumer_member_key(topic: &str, group: &str, consumer_id: &str) -> String {
    format!("{}{}/{}/{}", CONSUMER_GROUP_PREFIX, topic, group, consumer_id)
}

/// Topic name from a `TopicList/<topic>` key.
pub fn parse_topic_list_key(key: &str) -> Option<&str> {
    key.strip_prefix(TOPIC_LIST_PREFIX)
        .filter(|topic| !topic.is_empty() && !topic.contains('/'))
}

/// Broker identity from a `Broker/<name>-<index>` key.
pub fn parse_broker_key(key: &str) -> Option<BrokerId> {
    key.strip_prefix(BROKER_PREFIX)?.parse().ok()
}

/// Partition index from a `Topic/<topic>/<partition>` key.
pub fn parse_partition_owner_key(topic: &str, key: &str) -> Option<PartitionIndex> {
    key.strip_prefix(&topic_assignment_prefix(topic))?
        .parse()
        .ok()
        .filter(|p: &PartitionIndex| *p >= 0)
}

/// `(group, consumer_id)` from a `ConsumerGroup/<topic>/<group>/<consumerId>` key.
pub fn parse_consumer_member_key<'a>(topic: &str, key: &'a str) -> Option<(&'a str, &'a str)> {
    let rest = key.strip_prefix(CONSUMER_GROUP_PREFIX)?;
    let rest = rest.strip_prefix(topic)?.strip_prefix('/')?;
    let (group, consumer_id) = rest.split_once('/')?;
    if group.is_empty() || consumer_id.is_empty() || consumer_id.contains('/') {
        return None;
    }
    Some((group, consumer_id))
}

/// Parse a comma-separated partition list. Empty input is an empty list.
pub fn parse_partition_list(value: &str) -> Option<Vec<PartitionIndex>> {
    if value.is_empty() {
        return Some(Vec::new());
    }
    value.split(',').map(|p| p.trim().parse().ok()).collect()
}

pub fn format_partition_list(partitions: &[PartitionIndex]) -> String {
    partitions
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(",")
}
