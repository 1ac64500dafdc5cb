//! Per-topic leader election over the coordination store.
//!
//! # State machine
//!
//! ```text
//!            elect() wins CAS on Leader/<topic>
//!  Candidate ───────────────────────────────────▶ Leader
//!      ▲                                            │
//!      └──── lease lost / leader key deleted ───────┘
//! ```
//!
//! Leadership is a lease-bound `Leader/<topic>` key created with a
//! compare-and-put on version 0, so at most one broker holds it at a time.
//! While leader, the elector runs:
//!
//! - a keepalive ticker at `lease_ttl / 10`; a keepalive reporting any TTL
//!   other than the granted one, or no successful renewal for a whole TTL,
//!   means the lease is gone and the elector steps down on its own
//! - one initial pass of both assigners
//! - watches on `Broker/` and `ConsumerGroup/<topic>/` that re-run them
//!
//! A watch on the leader key runs in both states; a delete triggers a new
//! election. Leader-only tasks live in their own [`BackgroundTaskRegistry`]
//! which is shut down on step-down. Keepalive and watch tasks report to a
//! per-elector control task over a channel rather than touching state.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;

use super::background_tasks::BackgroundTaskRegistry;
use super::config::BrokerConfig;
use super::consumer_group_assigner::ConsumerGroupAssigner;
use super::error::{BrokerError, BrokerResult};
use super::keys;
use super::metrics;
use super::partition_assigner::PartitionAssigner;
use super::retry;
use super::single_flight::SingleFlight;
use super::topic_list::read_partition_count;
use super::traits::{CoordinationClient, LeaseId, WatchEventKind};
use crate::constants::BROKER_PREFIX;
use crate::types::PartitionIndex;

/// Lease timing for an elector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElectionConfig {
    pub lease_ttl: Duration,
    pub keepalive_interval: Duration,
}

impl ElectionConfig {
    pub fn from_broker_config(config: &BrokerConfig) -> Self {
        Self {
            lease_ttl: config.lease_ttl,
            keepalive_interval: config.keepalive_interval,
        }
    }
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self::from_broker_config(&BrokerConfig::default())
    }
}

/// Pause in `[0, max)` before a re-election attempt.
fn election_jitter(max: Duration) -> Duration {
    Duration::from_secs_f64(max.as_secs_f64() * fastrand::f64())
}

/// Messages from background tasks to the control task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ElectionEvent {
    /// Keepalive for this lease reported it expired, or could not renew it
    /// within one TTL.
    LeaseLost(LeaseId),
    /// `Leader/<topic>` was deleted.
    LeaderKeyDeleted,
}

enum ElectionState {
    Candidate,
    Leader {
        lease: LeaseId,
        tasks: BackgroundTaskRegistry,
    },
}

/// Rebalance passes for one topic, each collapsed through its own
/// [`SingleFlight`].
struct Rebalancer {
    topic: Arc<str>,
    partition_count: AtomicI32,
    partitions: PartitionAssigner,
    consumers: ConsumerGroupAssigner,
    partition_flight: SingleFlight,
    consumer_flight: SingleFlight,
}

impl Rebalancer {
    fn report(kind: &str, topic: &str, result: BrokerResult<usize>) {
        match result {
            Ok(written) => {
                metrics::record_rebalance(kind, "ok");
                tracing::debug!(topic = %topic, kind, written, "Rebalance pass complete");
            }
            Err(e @ BrokerError::AssignmentImpossible { .. }) => {
                metrics::record_rebalance(kind, "impossible");
                tracing::debug!(topic = %topic, kind, error = %e, "Assignment not possible yet");
            }
            Err(e) => {
                metrics::record_rebalance(kind, "error");
                tracing::warn!(topic = %topic, kind, error = %e, "Rebalance pass failed");
            }
        }
    }

    async fn rebalance_partitions(&self) {
        self.partition_flight
            .run(|| async {
                let count = self.partition_count.load(Ordering::SeqCst);
                let result = self.partitions.rebalance(&self.topic, count).await;
                Self::report("partition", &self.topic, result);
            })
            .await;
    }

    async fn rebalance_consumers(&self) {
        self.consumer_flight
            .run(|| async {
                let count = self.partition_count.load(Ordering::SeqCst);
                let result = self.consumers.rebalance(&self.topic, count).await;
                Self::report("consumer", &self.topic, result);
            })
            .await;
    }
}

/// Leader elector for one topic.
pub struct LeaderElector {
    topic: Arc<str>,
    identity: String,
    leader_key: String,
    client: Arc<dyn CoordinationClient>,
    config: ElectionConfig,
    rebalancer: Arc<Rebalancer>,
    state: Mutex<ElectionState>,
    background: Mutex<BackgroundTaskRegistry>,
    events_tx: mpsc::UnboundedSender<ElectionEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ElectionEvent>>>,
    stopped: AtomicBool,
}

impl LeaderElector {
    pub fn new(
        topic: &str,
        identity: impl Into<String>,
        client: Arc<dyn CoordinationClient>,
        config: ElectionConfig,
    ) -> Arc<Self> {
        let topic: Arc<str> = Arc::from(topic);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let rebalancer = Arc::new(Rebalancer {
            topic: topic.clone(),
            partition_count: AtomicI32::new(0),
            partitions: PartitionAssigner::new(client.clone()),
            consumers: ConsumerGroupAssigner::new(client.clone()),
            partition_flight: SingleFlight::new(),
            consumer_flight: SingleFlight::new(),
        });

        Arc::new(Self {
            leader_key: keys::leader_key(&topic),
            topic,
            identity: identity.into(),
            client,
            config,
            rebalancer,
            state: Mutex::new(ElectionState::Candidate),
            background: Mutex::new(BackgroundTaskRegistry::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Start the leader-key watch and the control task. Idempotent once it
    /// has succeeded; a failed start can be retried.
    pub async fn start(self: &Arc<Self>) -> BrokerResult<()> {
        let mut slot = self.events_rx.lock().await;
        if slot.is_none() {
            return Ok(());
        }

        let mut watch = self.client.watch_range(&self.leader_key).await?;
        let Some(mut events_rx) = slot.take() else {
            return Ok(());
        };
        drop(slot);

        let leader_key = self.leader_key.clone();
        let events_tx = self.events_tx.clone();

        let mut background = self.background.lock().await;
        background.spawn("leader_key_watch", async move {
            while let Some(event) = watch.recv().await {
                // Prefix watch; `Leader/a` also sees `Leader/ab`.
                if event.key == leader_key && event.kind == WatchEventKind::Delete {
                    let _ = events_tx.send(ElectionEvent::LeaderKeyDeleted);
                }
            }
        });

        let weak = Arc::downgrade(self);
        background.spawn("election_control", async move {
            while let Some(event) = events_rx.recv().await {
                let Some(elector) = weak.upgrade() else {
                    break;
                };
                elector.on_event(event).await;
            }
        });

        tracing::debug!(topic = %self.topic, identity = %self.identity, "Leader elector started");
        Ok(())
    }

    /// Try to become leader. Returns `Ok(false)` if another broker holds the
    /// key, and `Ok(true)` if this broker is (or already was) leader.
    pub async fn elect(self: &Arc<Self>) -> BrokerResult<bool> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(BrokerError::Shutdown);
        }

        let mut state = self.state.lock().await;
        if matches!(*state, ElectionState::Leader { .. }) {
            return Ok(true);
        }

        let count = read_partition_count(self.client.as_ref(), &self.topic).await?;
        self.rebalancer.partition_count.store(count, Ordering::SeqCst);

        let lease = self.client.lease_grant(self.config.lease_ttl).await?;
        let won = match self
            .client
            .compare_and_put(&self.leader_key, 0, &self.identity, Some(lease))
            .await
        {
            Ok(won) => won,
            Err(e) => {
                self.revoke_quietly(lease).await;
                return Err(e);
            }
        };

        if !won {
            self.revoke_quietly(lease).await;
            metrics::record_election(false);
            tracing::debug!(topic = %self.topic, "Leader key already held");
            return Ok(false);
        }

        let tasks = match self.spawn_leader_tasks(lease).await {
            Ok(tasks) => tasks,
            Err(e) => {
                let _ = self.client.delete(&self.leader_key).await;
                self.revoke_quietly(lease).await;
                return Err(e);
            }
        };
        *state = ElectionState::Leader { lease, tasks };

        metrics::record_election(true);
        metrics::LEADER_TOPICS.inc();
        tracing::info!(
            topic = %self.topic,
            identity = %self.identity,
            lease,
            partitions = count,
            "Became leader"
        );
        Ok(true)
    }

    async fn spawn_leader_tasks(&self, lease: LeaseId) -> BrokerResult<BackgroundTaskRegistry> {
        let mut tasks = BackgroundTaskRegistry::new();

        let client = self.client.clone();
        let events_tx = self.events_tx.clone();
        let ttl = self.config.lease_ttl;
        let topic = self.topic.clone();
        let lost = Arc::new(AtomicBool::new(false));
        let granted_at = Instant::now();
        // Millis after `granted_at` of the last keepalive that saw our TTL.
        let renewed_ms = Arc::new(AtomicU64::new(0));
        tasks.spawn_periodic("keepalive", self.config.keepalive_interval, move |_| {
            let client = client.clone();
            let events_tx = events_tx.clone();
            let topic = topic.clone();
            let lost = lost.clone();
            let renewed_ms = renewed_ms.clone();
            async move {
                if lost.load(Ordering::SeqCst) {
                    return;
                }
                match client.lease_keep_alive(lease).await {
                    Ok(reported) if reported == ttl => {
                        renewed_ms.store(granted_at.elapsed().as_millis() as u64, Ordering::SeqCst);
                    }
                    Ok(reported) => {
                        tracing::warn!(
                            topic = %topic,
                            lease,
                            reported_ms = reported.as_millis() as u64,
                            "Leadership lease lost"
                        );
                        lost.store(true, Ordering::SeqCst);
                        let _ = events_tx.send(ElectionEvent::LeaseLost(lease));
                    }
                    Err(e) => {
                        let renewed = Duration::from_millis(renewed_ms.load(Ordering::SeqCst));
                        let silent = granted_at.elapsed().saturating_sub(renewed);
                        if silent < ttl {
                            tracing::warn!(topic = %topic, lease, error = %e, "Lease keepalive failed");
                            return;
                        }
                        tracing::warn!(
                            topic = %topic,
                            lease,
                            error = %e,
                            silent_ms = silent.as_millis() as u64,
                            "No lease renewal within TTL, stepping down"
                        );
                        lost.store(true, Ordering::SeqCst);
                        let _ = events_tx.send(ElectionEvent::LeaseLost(lease));
                    }
                }
            }
        });

        // Watch before the first pass so no membership change is missed.
        let mut brokers = self.client.watch_range(BROKER_PREFIX).await?;
        let mut members = self
            .client
            .watch_range(&keys::consumer_group_prefix(&self.topic))
            .await?;

        let rebalancer = self.rebalancer.clone();
        tasks.spawn("initial_rebalance", async move {
            rebalancer.rebalance_partitions().await;
            rebalancer.rebalance_consumers().await;
        });

        let rebalancer = self.rebalancer.clone();
        tasks.spawn("broker_watch", async move {
            while brokers.recv().await.is_some() {
                rebalancer.rebalance_partitions().await;
            }
        });

        let rebalancer = self.rebalancer.clone();
        tasks.spawn("consumer_watch", async move {
            while let Some(event) = members.recv().await {
                // Registrations are empty puts; non-empty puts are our own
                // assignment writes.
                let membership_changed = match event.kind {
                    WatchEventKind::Put => event.value.is_empty(),
                    WatchEventKind::Delete => true,
                };
                if membership_changed {
                    rebalancer.rebalance_consumers().await;
                }
            }
        });

        Ok(tasks)
    }

    async fn on_event(self: &Arc<Self>, event: ElectionEvent) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }

        match event {
            ElectionEvent::LeaseLost(lost) => {
                if self.current_lease().await != Some(lost) {
                    return;
                }
                metrics::LEASE_LOSSES
                    .with_label_values(&[self.topic.as_ref()])
                    .inc();
                self.step_down().await;
            }
            ElectionEvent::LeaderKeyDeleted => {
                if let Some(lease) = self.current_lease().await {
                    if self.holds_leader_key(lease).await {
                        // Stale delete from an earlier term.
                        return;
                    }
                    tracing::warn!(topic = %self.topic, "Leader key deleted while leader");
                    self.step_down().await;
                }
            }
        }

        // Every candidate sees the same delete; spread their attempts.
        tokio::time::sleep(election_jitter(self.config.keepalive_interval)).await;
        let result = retry::with_coordination_policy(|| self.elect()).await;
        match result {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(topic = %self.topic, "Re-election lost");
            }
            Err(BrokerError::Shutdown) => {}
            Err(e) => {
                tracing::warn!(topic = %self.topic, error = %e, "Re-election failed");
            }
        }
    }

    async fn holds_leader_key(&self, lease: LeaseId) -> bool {
        match self.client.get(&self.leader_key).await {
            Ok(Some(kv)) => kv.value == self.identity && kv.lease == Some(lease),
            Ok(None) => false,
            // Can't tell; keep leadership until keepalive decides.
            Err(_) => true,
        }
    }

    async fn current_lease(&self) -> Option<LeaseId> {
        match &*self.state.lock().await {
            ElectionState::Leader { lease, .. } => Some(*lease),
            ElectionState::Candidate => None,
        }
    }

    /// Return to candidate, stopping leader-only work and revoking the lease.
    /// Does nothing when already a candidate.
    pub async fn step_down(&self) {
        let previous = {
            let mut state = self.state.lock().await;
            std::mem::replace(&mut *state, ElectionState::Candidate)
        };

        if let ElectionState::Leader { lease, mut tasks } = previous {
            tasks.shutdown_all().await;
            metrics::LEADER_TOPICS.dec();
            self.revoke_quietly(lease).await;
            tracing::info!(topic = %self.topic, lease, "Stepped down from leadership");
        }
    }

    /// Run both assigners now if leader. Returns whether a pass ran.
    pub async fn rebalance(&self) -> bool {
        if !self.is_leader().await {
            return false;
        }
        self.rebalancer.rebalance_partitions().await;
        self.rebalancer.rebalance_consumers().await;
        true
    }

    /// Stop all loops. If leader, delete the leader key and revoke the lease.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.background.lock().await.shutdown_all().await;

        let previous = {
            let mut state = self.state.lock().await;
            std::mem::replace(&mut *state, ElectionState::Candidate)
        };
        if let ElectionState::Leader { lease, mut tasks } = previous {
            tasks.shutdown_all().await;
            metrics::LEADER_TOPICS.dec();
            if let Err(e) = self.client.delete(&self.leader_key).await {
                tracing::warn!(topic = %self.topic, error = %e, "Failed to delete leader key");
            }
            self.revoke_quietly(lease).await;
            tracing::info!(topic = %self.topic, "Released leadership on shutdown");
        }
    }

    pub async fn is_leader(&self) -> bool {
        matches!(*self.state.lock().await, ElectionState::Leader { .. })
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Identity currently stored under `Leader/<topic>`, if any.
    pub async fn leader_identity(&self) -> BrokerResult<Option<String>> {
        Ok(self.client.get(&self.leader_key).await?.map(|kv| kv.value))
    }

    /// Partition count read at the last election attempt.
    pub fn partition_count(&self) -> PartitionIndex {
        self.rebalancer.partition_count.load(Ordering::SeqCst)
    }

    async fn revoke_quietly(&self, lease: LeaseId) {
        if let Err(e) = self.client.lease_revoke(lease).await {
            tracing::debug!(topic = %self.topic, lease, error = %e, "Lease revoke failed");
        }
    }
}

impl std::fmt::Debug for LeaderElector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderElector")
            .field("topic", &self.topic)
            .field("identity", &self.identity)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockCoordinator;

    fn fast() -> ElectionConfig {
        ElectionConfig {
            lease_ttl: Duration::from_secs(1),
            keepalive_interval: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn test_first_elector_wins() {
        let store = Arc::new(MockCoordinator::new());
        let a = LeaderElector::new("t", "a-0", store.clone(), fast());
        let b = LeaderElector::new("t", "b-1", store.clone(), fast());

        assert!(a.elect().await.unwrap());
        assert!(!b.elect().await.unwrap());
        assert!(a.elect().await.unwrap());
        assert_eq!(b.leader_identity().await.unwrap().as_deref(), Some("a-0"));

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_losing_candidate_revokes_its_lease() {
        let store = Arc::new(MockCoordinator::new());
        let a = LeaderElector::new("t", "a-0", store.clone(), fast());
        let b = LeaderElector::new("t", "b-1", store.clone(), fast());

        a.elect().await.unwrap();
        b.elect().await.unwrap();
        assert_eq!(store.lease_count().await, 1);

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_releases_key() {
        let store = Arc::new(MockCoordinator::new());
        let a = LeaderElector::new("t", "a-0", store.clone(), fast());
        a.start().await.unwrap();
        assert!(a.elect().await.unwrap());

        a.shutdown().await;
        assert!(!a.is_leader().await);
        assert!(store.get("Leader/t").await.unwrap().is_none());
        assert_eq!(store.lease_count().await, 0);
        assert!(matches!(a.elect().await, Err(BrokerError::Shutdown)));
    }

    #[tokio::test]
    async fn test_step_down_when_candidate_is_noop() {
        let store = Arc::new(MockCoordinator::new());
        let a = LeaderElector::new("t", "a-0", store.clone(), fast());
        a.step_down().await;
        assert!(!a.is_leader().await);
    }
}
