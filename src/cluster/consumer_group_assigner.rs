//! Consumer-side partition assignment.
//!
//! Every group registered under `ConsumerGroup/<topic>/` gets the topic's
//! partitions dealt out in order, `ceil(P / members)` per member, members in
//! key order. The list is written back onto the member's own key, keeping the
//! member's lease so the key still disappears when the consumer does. Writes
//! are compare-and-put on the version read at the start of the pass.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::error::BrokerResult;
use super::keys;
use super::metrics;
use super::traits::{CoordinationClient, KeyValue};
use crate::types::PartitionIndex;

/// Deal `partition_count` partitions over `member_count` members.
///
/// Returns one list per member. Trailing members may get fewer partitions,
/// or none.
pub fn plan_member_assignment(
    partition_count: PartitionIndex,
    member_count: usize,
) -> Vec<Vec<PartitionIndex>> {
    let mut lists = vec![Vec::new(); member_count];
    if member_count == 0 || partition_count <= 0 {
        return lists;
    }

    let target = (partition_count as usize).div_ceil(member_count);
    for partition in 0..partition_count {
        lists[partition as usize / target].push(partition);
    }
    lists
}

pub struct ConsumerGroupAssigner {
    client: Arc<dyn CoordinationClient>,
}

impl ConsumerGroupAssigner {
    pub fn new(client: Arc<dyn CoordinationClient>) -> Self {
        Self { client }
    }

    /// Member keys of `topic` grouped by consumer group, in key order.
    pub async fn groups(&self, topic: &str) -> BrokerResult<BTreeMap<String, Vec<KeyValue>>> {
        let mut groups: BTreeMap<String, Vec<KeyValue>> = BTreeMap::new();
        for kv in self
            .client
            .get_range(&keys::consumer_group_prefix(topic))
            .await?
        {
            let Some((group, _member)) = keys::parse_consumer_member_key(topic, &kv.key) else {
                tracing::warn!(topic = %topic, key = %kv.key, "Skipping malformed consumer member key");
                continue;
            };
            groups.entry(group.to_string()).or_default().push(kv);
        }
        for members in groups.values_mut() {
            members.sort_by(|a, b| a.key.cmp(&b.key));
        }
        Ok(groups)
    }

    /// Run one pass over every group. Returns the number of member keys
    /// written.
    pub async fn rebalance(&self, topic: &str, partition_count: PartitionIndex) -> BrokerResult<usize> {
        let groups = self.groups(topic).await?;
        let mut written = 0;

        for (group, members) in &groups {
            let lists = plan_member_assignment(partition_count, members.len());

            for (member, partitions) in members.iter().zip(lists) {
                let value = keys::format_partition_list(&partitions);
                if member.value == value {
                    continue;
                }
                // A member that left after the read must not be recreated.
                match self
                    .client
                    .compare_and_put(&member.key, member.version, &value, member.lease)
                    .await
                {
                    Ok(true) => written += 1,
                    Ok(false) => {
                        tracing::debug!(
                            topic = %topic,
                            group = %group,
                            key = %member.key,
                            "Member changed during pass; skipping"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(
                            topic = %topic,
                            group = %group,
                            key = %member.key,
                            error = %e,
                            "Failed to write member assignment"
                        );
                    }
                }
            }

            tracing::debug!(
                topic = %topic,
                group = %group,
                members = members.len(),
                partitions = partition_count,
                "Consumer group assignment computed"
            );
        }

        if written > 0 {
            metrics::MEMBER_ASSIGNMENTS
                .with_label_values(&[topic])
                .inc_by(written as u64);
            tracing::info!(topic = %topic, written, "Consumer assignments updated");
        }
        Ok(written)
    }
}
