//! Broker-side partition assignment.
//!
//! Spreads a topic's partitions over the live brokers, at most
//! `ceil(P / brokers)` each. Placements that are still valid (owner alive and
//! under the target) are kept; the rest are filled from the highest-ordered
//! broker downward. Only changed owner keys are written, so a second pass
//! over an unchanged cluster writes nothing.

use std::collections::HashMap;
use std::sync::Arc;

use super::error::{BrokerError, BrokerResult};
use super::keys;
use super::metrics;
use super::traits::CoordinationClient;
use crate::constants::BROKER_PREFIX;
use crate::types::{BrokerId, PartitionIndex};

/// Outcome of planning one topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignmentPlan {
    /// Owner of every partition, indexed by partition.
    pub owners: Vec<BrokerId>,
    /// Partitions whose owner differs from the current assignment.
    pub changed: Vec<(PartitionIndex, BrokerId)>,
}

impl AssignmentPlan {
    /// Partitions per broker in the planned assignment.
    pub fn load(&self) -> HashMap<&BrokerId, usize> {
        let mut load = HashMap::new();
        for owner in &self.owners {
            *load.entry(owner).or_default() += 1;
        }
        load
    }
}

/// Plan the owners of `partition_count` partitions.
///
/// `live` may be in any order; it is sorted by (index, name). Entries of
/// `current` outside `0..partition_count` are ignored.
pub fn plan_partition_assignment(
    topic: &str,
    partition_count: PartitionIndex,
    live: &[BrokerId],
    current: &HashMap<PartitionIndex, BrokerId>,
) -> BrokerResult<AssignmentPlan> {
    if partition_count <= 0 {
        return Ok(AssignmentPlan {
            owners: Vec::new(),
            changed: Vec::new(),
        });
    }
    if live.is_empty() {
        return Err(BrokerError::AssignmentImpossible {
            topic: topic.to_string(),
            reason: "no live brokers".to_string(),
        });
    }

    let mut brokers = live.to_vec();
    brokers.sort();
    brokers.dedup();

    let partitions = partition_count as usize;
    let target = partitions.div_ceil(brokers.len());
    let slot_of: HashMap<&BrokerId, usize> =
        brokers.iter().enumerate().map(|(i, b)| (b, i)).collect();

    let mut counts = vec![0usize; brokers.len()];
    let mut owners: Vec<Option<usize>> = vec![None; partitions];

    for (partition, owner) in owners.iter_mut().enumerate() {
        let Some(&slot) = current
            .get(&(partition as PartitionIndex))
            .and_then(|broker| slot_of.get(broker))
        else {
            continue;
        };
        if counts[slot] < target {
            counts[slot] += 1;
            *owner = Some(slot);
        }
    }

    // Backward fill: the cursor only moves down, skipping full brokers.
    let mut cursor = brokers.len();
    let mut changed = Vec::new();
    for (partition, owner) in owners.iter_mut().enumerate() {
        if owner.is_some() {
            continue;
        }
        while cursor > 0 && counts[cursor - 1] >= target {
            cursor -= 1;
        }
        if cursor == 0 {
            return Err(BrokerError::AssignmentImpossible {
                topic: topic.to_string(),
                reason: format!("ran out of capacity at partition {}", partition),
            });
        }
        let slot = cursor - 1;
        counts[slot] += 1;
        *owner = Some(slot);
        changed.push((partition as PartitionIndex, brokers[slot].clone()));
    }

    let owners = owners
        .into_iter()
        .map(|slot| slot.map(|s| brokers[s].clone()))
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| BrokerError::AssignmentImpossible {
            topic: topic.to_string(),
            reason: "unplaced partition after fill".to_string(),
        })?;

    Ok(AssignmentPlan { owners, changed })
}

/// Reads membership and the current assignment, plans, and writes changes.
pub struct PartitionAssigner {
    client: Arc<dyn CoordinationClient>,
}

impl PartitionAssigner {
    pub fn new(client: Arc<dyn CoordinationClient>) -> Self {
        Self { client }
    }

    /// Live brokers, sorted by (index, name).
    pub async fn live_brokers(&self) -> BrokerResult<Vec<BrokerId>> {
        let mut brokers: Vec<BrokerId> = self
            .client
            .get_range(BROKER_PREFIX)
            .await?
            .iter()
            .filter_map(|kv| {
                let parsed = keys::parse_broker_key(&kv.key);
                if parsed.is_none() {
                    tracing::warn!(key = %kv.key, "Ignoring malformed broker key");
                }
                parsed
            })
            .collect();
        brokers.sort();
        Ok(brokers)
    }

    /// Current owner of each partition. Unparsable owners are omitted so the
    /// partition gets reassigned.
    pub async fn current_assignment(
        &self,
        topic: &str,
    ) -> BrokerResult<HashMap<PartitionIndex, BrokerId>> {
        let prefix = keys::topic_assignment_prefix(topic);
        Ok(self
            .client
            .get_range(&prefix)
            .await?
            .into_iter()
            .filter_map(|kv| {
                let partition = keys::parse_partition_owner_key(topic, &kv.key)?;
                let owner = kv.value.parse::<BrokerId>().ok()?;
                Some((partition, owner))
            })
            .collect())
    }

    /// Run one assignment pass. Returns the number of owner keys written.
    pub async fn rebalance(&self, topic: &str, partition_count: PartitionIndex) -> BrokerResult<usize> {
        let live = self.live_brokers().await?;
        let current = self.current_assignment(topic).await?;
        let plan = plan_partition_assignment(topic, partition_count, &live, &current)?;

        for (partition, owner) in &plan.changed {
            self.client
                .put(
                    &keys::partition_owner_key(topic, *partition),
                    &owner.to_string(),
                    None,
                )
                .await?;
        }

        if !plan.changed.is_empty() {
            metrics::PARTITION_REASSIGNMENTS
                .with_label_values(&[topic])
                .inc_by(plan.changed.len() as u64);
            tracing::info!(
                topic = %topic,
                partitions = partition_count,
                brokers = live.len(),
                reassigned = plan.changed.len(),
                "Partition assignment updated"
            );
        }
        Ok(plan.changed.len())
    }
}
