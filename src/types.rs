//! Shared primitive types.
//!
//! Offsets in this crate are byte positions inside a partition's log, not
//! record sequence numbers. A read returns the number of bytes it consumed and
//! the caller adds that to its previous offset.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Byte position inside a partition log.
pub type Offset = u64;

/// Index of a partition inside its topic.
pub type PartitionIndex = i32;

/// Map key for per-partition state (topic_name, partition_index).
pub type PartitionKey = (Arc<str>, PartitionIndex);

/// A topic-partition pair with a readable `topic/partition` display form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: Arc<str>,
    pub partition: PartitionIndex,
}

impl TopicPartition {
    pub fn new(topic: impl Into<Arc<str>>, partition: PartitionIndex) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }

    /// Convert into the tuple form used as a map key.
    pub fn key(&self) -> PartitionKey {
        (self.topic.clone(), self.partition)
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.partition)
    }
}

impl From<(&str, PartitionIndex)> for TopicPartition {
    fn from((topic, partition): (&str, PartitionIndex)) -> Self {
        Self::new(topic, partition)
    }
}

/// Identity of a broker process: `<name>-<index>`.
///
/// The index is the numeric suffix after the last `-`, so names may contain
/// dashes themselves (`eu-west-broker-3` is name `eu-west-broker`, index 3).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BrokerId {
    pub name: String,
    pub index: u32,
}

impl BrokerId {
    pub fn new(name: impl Into<String>, index: u32) -> Self {
        Self {
            name: name.into(),
            index,
        }
    }
}

impl fmt::Display for BrokerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.name, self.index)
    }
}

impl FromStr for BrokerId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, index) = s
            .rsplit_once('-')
            .ok_or_else(|| format!("broker id '{}' has no '-<index>' suffix", s))?;
        if name.is_empty() {
            return Err(format!("broker id '{}' has an empty name", s));
        }
        let index = index
            .parse()
            .map_err(|e| format!("broker id '{}' has an invalid index: {}", s, e))?;
        Ok(Self::new(name, index))
    }
}

impl Ord for BrokerId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.index
            .cmp(&other.index)
            .then_with(|| self.name.cmp(&other.name))
    }
}

impl PartialOrd for BrokerId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_id_parse_and_display() {
        let id: BrokerId = "broker-3".parse().unwrap();
        assert_eq!(id, BrokerId::new("broker", 3));
        assert_eq!(id.to_string(), "broker-3");
    }

    #[test]
    fn test_broker_id_name_with_dashes() {
        let id: BrokerId = "eu-west-broker-12".parse().unwrap();
        assert_eq!(id.name, "eu-west-broker");
        assert_eq!(id.index, 12);
    }

    #[test]
    fn test_broker_id_rejects_malformed() {
        assert!("broker".parse::<BrokerId>().is_err());
        assert!("broker-x".parse::<BrokerId>().is_err());
        assert!("-4".parse::<BrokerId>().is_err());
    }

    #[test]
    fn test_broker_id_orders_by_index_first() {
        let mut ids = vec![
            BrokerId::new("b", 2),
            BrokerId::new("a", 10),
            BrokerId::new("c", 0),
        ];
        ids.sort();
        let indexes: Vec<u32> = ids.iter().map(|b| b.index).collect();
        assert_eq!(indexes, vec![0, 2, 10]);
    }

    #[test]
    fn test_topic_partition_display() {
        let tp = TopicPartition::from(("orders", 4));
        assert_eq!(tp.to_string(), "orders/4");
        assert_eq!(tp.key(), (Arc::from("orders"), 4));
    }
}
