//! Liveness registration for this broker and its consumers.
//!
//! The broker key `Broker/<name>-<index>` and every consumer member key
//! `ConsumerGroup/<topic>/<group>/<consumerId>` registered through this
//! broker share one lease. A keepalive loop renews it; if the store reports
//! the lease gone, a fresh lease is granted and every key is written again.
//! Member keys are registered with an empty value, which is what tells the
//! topic leader a member joined.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use super::background_tasks::BackgroundTaskRegistry;
use super::error::BrokerResult;
use super::keys;
use super::retry;
use super::traits::{CoordinationClient, LeaseId};
use crate::types::{BrokerId, PartitionIndex};

struct Registration {
    client: Arc<dyn CoordinationClient>,
    broker: BrokerId,
    ttl: Duration,
    lease: Mutex<Option<LeaseId>>,
    members: Mutex<BTreeSet<String>>,
}

impl Registration {
    /// Grant a lease and write the broker key plus every member key.
    async fn register_all(&self) -> BrokerResult<LeaseId> {
        let lease = retry::with_coordination_policy(|| async {
            let lease = self.client.lease_grant(self.ttl).await?;
            self.client
                .put(&keys::broker_key(&self.broker), "", Some(lease))
                .await?;
            Ok(lease)
        })
        .await?;

        let members = self.members.lock().await.clone();
        for key in &members {
            self.client.put(key, "", Some(lease)).await?;
        }

        *self.lease.lock().await = Some(lease);
        tracing::info!(broker = %self.broker, lease, members = members.len(), "Registered broker");
        Ok(lease)
    }

    async fn renew(&self) {
        let Some(lease) = *self.lease.lock().await else {
            return;
        };
        match self.client.lease_keep_alive(lease).await {
            Ok(ttl) if ttl == self.ttl => {}
            Ok(_) => {
                tracing::warn!(broker = %self.broker, lease, "Membership lease lost, re-registering");
                if let Err(e) = self.register_all().await {
                    tracing::error!(broker = %self.broker, error = %e, "Re-registration failed");
                }
            }
            Err(e) => {
                tracing::warn!(broker = %self.broker, lease, error = %e, "Membership keepalive failed");
            }
        }
    }
}

/// Lease-bound membership of one broker process.
pub struct MembershipRegistry {
    registration: Arc<Registration>,
    keepalive_interval: Duration,
    tasks: Mutex<BackgroundTaskRegistry>,
}

impl MembershipRegistry {
    pub fn new(
        client: Arc<dyn CoordinationClient>,
        broker: BrokerId,
        ttl: Duration,
        keepalive_interval: Duration,
    ) -> Self {
        Self {
            registration: Arc::new(Registration {
                client,
                broker,
                ttl,
                lease: Mutex::new(None),
                members: Mutex::new(BTreeSet::new()),
            }),
            keepalive_interval,
            tasks: Mutex::new(BackgroundTaskRegistry::new()),
        }
    }

    pub fn broker(&self) -> &BrokerId {
        &self.registration.broker
    }

    /// Write the broker key and start the keepalive loop.
    pub async fn register_broker(&self) -> BrokerResult<LeaseId> {
        let lease = self.registration.register_all().await?;

        let registration = self.registration.clone();
        self.tasks.lock().await.spawn_periodic(
            "membership_keepalive",
            self.keepalive_interval,
            move |_| {
                let registration = registration.clone();
                async move { registration.renew().await }
            },
        );
        Ok(lease)
    }

    /// Register a consumer group member for `topic`. Requires a registered
    /// broker.
    pub async fn register_consumer(
        &self,
        topic: &str,
        group: &str,
        consumer_id: &str,
    ) -> BrokerResult<()> {
        let key = keys::consumer_member_key(topic, group, consumer_id);
        let lease = *self.registration.lease.lock().await;
        self.registration.client.put(&key, "", lease).await?;
        self.registration.members.lock().await.insert(key);
        tracing::debug!(topic = %topic, group = %group, consumer = %consumer_id, "Registered consumer");
        Ok(())
    }

    pub async fn deregister_consumer(
        &self,
        topic: &str,
        group: &str,
        consumer_id: &str,
    ) -> BrokerResult<()> {
        let key = keys::consumer_member_key(topic, group, consumer_id);
        self.registration.members.lock().await.remove(&key);
        self.registration.client.delete(&key).await?;
        Ok(())
    }

    /// Partitions currently assigned to a registered consumer.
    pub async fn consumer_assignment(
        &self,
        topic: &str,
        group: &str,
        consumer_id: &str,
    ) -> BrokerResult<Vec<PartitionIndex>> {
        let key = keys::consumer_member_key(topic, group, consumer_id);
        Ok(self
            .registration
            .client
            .get(&key)
            .await?
            .and_then(|kv| keys::parse_partition_list(&kv.value))
            .unwrap_or_default())
    }

    pub async fn lease(&self) -> Option<LeaseId> {
        *self.registration.lease.lock().await
    }

    /// Stop the keepalive and revoke the lease, removing every key.
    pub async fn shutdown(&self) {
        self.tasks.lock().await.shutdown_all().await;
        let lease = self.registration.lease.lock().await.take();
        if let Some(lease) = lease {
            if let Err(e) = self.registration.client.lease_revoke(lease).await {
                tracing::warn!(error = %e, "Failed to revoke membership lease");
            }
        }
        tracing::info!(broker = %self.registration.broker, "Deregistered broker");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockCoordinator;

    fn registry(store: &Arc<MockCoordinator>) -> MembershipRegistry {
        MembershipRegistry::new(
            store.clone(),
            BrokerId::new("broker", 2),
            Duration::from_secs(1),
            Duration::from_millis(20),
        )
    }

    #[tokio::test]
    async fn test_register_writes_lease_bound_key() {
        let store = Arc::new(MockCoordinator::new());
        let members = registry(&store);
        let lease = members.register_broker().await.unwrap();

        let kv = store.get("Broker/broker-2").await.unwrap().unwrap();
        assert_eq!(kv.lease, Some(lease));

        members.shutdown().await;
        assert!(store.get("Broker/broker-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_consumer_registration_is_empty_put() {
        let store = Arc::new(MockCoordinator::new());
        let members = registry(&store);
        members.register_broker().await.unwrap();
        members.register_consumer("t", "g", "c1").await.unwrap();

        let kv = store.get("ConsumerGroup/t/g/c1").await.unwrap().unwrap();
        assert_eq!(kv.value, "");
        assert_eq!(kv.lease, members.lease().await);

        members.deregister_consumer("t", "g", "c1").await.unwrap();
        assert!(store.get("ConsumerGroup/t/g/c1").await.unwrap().is_none());
        members.shutdown().await;
    }

    #[tokio::test]
    async fn test_lost_lease_is_re_registered() {
        let store = Arc::new(MockCoordinator::new());
        let members = registry(&store);
        let first = members.register_broker().await.unwrap();
        members.register_consumer("t", "g", "c1").await.unwrap();

        store.expire_lease(first).await;
        assert!(store.get("Broker/broker-2").await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(100)).await;
        let second = members.lease().await.unwrap();
        assert_ne!(first, second);
        assert!(store.get("Broker/broker-2").await.unwrap().is_some());
        assert!(store.get("ConsumerGroup/t/g/c1").await.unwrap().is_some());

        members.shutdown().await;
    }
}
