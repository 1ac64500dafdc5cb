//! In-memory coordination store for tests and demos.
//!
//! Implements [`CoordinationClient`] with the subset of etcd semantics the
//! engine depends on: versioned keys, compare-and-put, TTL leases that delete
//! their keys when they expire, and prefix watches.
//!
//! # Usage
//!
//! This module is available when the `test-utilities` feature is enabled,
//! or during unit tests:
//!
//! ```toml
//! [dev-dependencies]
//! dream-stream = { path = ".", features = ["test-utilities"] }
//! ```
//!
//! Clones share state, so several brokers in one process can be pointed at
//! the same "cluster".

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{RwLock, mpsc};

use super::error::{BrokerError, BrokerResult};
use super::traits::{
    CoordinationClient, KeyValue, LeaseId, WatchEvent, WatchEventKind, WatchStream,
};

#[derive(Debug, Clone)]
struct StoredKey {
    value: String,
    version: i64,
    lease: Option<LeaseId>,
}

#[derive(Debug, Clone)]
struct MockLease {
    ttl: Duration,
    expires_at: Instant,
}

#[derive(Debug)]
struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

#[derive(Debug, Default)]
struct MockState {
    keys: BTreeMap<String, StoredKey>,
    leases: HashMap<LeaseId, MockLease>,
    watchers: Vec<Watcher>,
}

impl MockState {
    fn notify(&mut self, event: WatchEvent) {
        self.watchers.retain(|w| {
            if !event.key.starts_with(&w.prefix) {
                return !w.tx.is_closed();
            }
            w.tx.send(event.clone()).is_ok()
        });
    }

    fn put_key(&mut self, key: &str, value: &str, lease: Option<LeaseId>) {
        let version = self.keys.get(key).map(|k| k.version).unwrap_or(0) + 1;
        self.keys.insert(
            key.to_string(),
            StoredKey {
                value: value.to_string(),
                version,
                lease,
            },
        );
        self.notify(WatchEvent {
            kind: WatchEventKind::Put,
            key: key.to_string(),
            value: value.to_string(),
        });
    }

    fn delete_key(&mut self, key: &str) -> bool {
        if self.keys.remove(key).is_some() {
            self.notify(WatchEvent {
                kind: WatchEventKind::Delete,
                key: key.to_string(),
                value: String::new(),
            });
            true
        } else {
            false
        }
    }

    fn drop_lease(&mut self, lease: LeaseId) {
        self.leases.remove(&lease);
        let attached: Vec<String> = self
            .keys
            .iter()
            .filter(|(_, k)| k.lease == Some(lease))
            .map(|(key, _)| key.clone())
            .collect();
        for key in attached {
            self.delete_key(&key);
        }
    }

    fn reap_expired(&mut self) {
        let now = Instant::now();
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, l)| l.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for lease in expired {
            tracing::debug!(lease, "Mock lease expired");
            self.drop_lease(lease);
        }
    }

    fn check_lease(&self, lease: Option<LeaseId>) -> BrokerResult<()> {
        match lease {
            Some(id) if !self.leases.contains_key(&id) => Err(BrokerError::Coordination(
                format!("lease {} not found", id),
            )),
            _ => Ok(()),
        }
    }
}

/// In-memory [`CoordinationClient`].
#[derive(Debug, Clone, Default)]
pub struct MockCoordinator {
    state: Arc<RwLock<MockState>>,
    next_lease: Arc<AtomicI64>,
    puts: Arc<AtomicU64>,
}

impl MockCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expire a lease immediately, deleting its keys and notifying watchers.
    pub async fn expire_lease(&self, lease: LeaseId) {
        let mut state = self.state.write().await;
        state.drop_lease(lease);
    }

    /// Lease attached to `key`, if any.
    pub async fn lease_of(&self, key: &str) -> Option<LeaseId> {
        let state = self.state.read().await;
        state.keys.get(key).and_then(|k| k.lease)
    }

    pub async fn lease_count(&self) -> usize {
        let mut state = self.state.write().await;
        state.reap_expired();
        state.leases.len()
    }

    pub async fn watcher_count(&self) -> usize {
        let mut state = self.state.write().await;
        state.watchers.retain(|w| !w.tx.is_closed());
        state.watchers.len()
    }

    /// Number of successful writes (puts and compare-and-puts) so far.
    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CoordinationClient for MockCoordinator {
    async fn get(&self, key: &str) -> BrokerResult<Option<KeyValue>> {
        let mut state = self.state.write().await;
        state.reap_expired();
        Ok(state.keys.get(key).map(|k| KeyValue {
            key: key.to_string(),
            value: k.value.clone(),
            version: k.version,
            lease: k.lease,
        }))
    }

    async fn get_range(&self, prefix: &str) -> BrokerResult<Vec<KeyValue>> {
        let mut state = self.state.write().await;
        state.reap_expired();
        Ok(state
            .keys
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, k)| KeyValue {
                key: key.clone(),
                value: k.value.clone(),
                version: k.version,
                lease: k.lease,
            })
            .collect())
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> BrokerResult<()> {
        let mut state = self.state.write().await;
        state.reap_expired();
        state.check_lease(lease)?;
        state.put_key(key, value, lease);
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, key: &str) -> BrokerResult<bool> {
        let mut state = self.state.write().await;
        state.reap_expired();
        Ok(state.delete_key(key))
    }

    async fn compare_and_put(
        &self,
        key: &str,
        expected_version: i64,
        value: &str,
        lease: Option<LeaseId>,
    ) -> BrokerResult<bool> {
        let mut state = self.state.write().await;
        state.reap_expired();
        state.check_lease(lease)?;

        let current = state.keys.get(key).map(|k| k.version).unwrap_or(0);
        if current != expected_version {
            return Ok(false);
        }
        state.put_key(key, value, lease);
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn watch_range(&self, prefix: &str) -> BrokerResult<WatchStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.write().await;
        state.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(rx)
    }

    async fn lease_grant(&self, ttl: Duration) -> BrokerResult<LeaseId> {
        let id = self.next_lease.fetch_add(1, Ordering::SeqCst) + 1;
        let mut state = self.state.write().await;
        state.reap_expired();
        state.leases.insert(
            id,
            MockLease {
                ttl,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(id)
    }

    async fn lease_keep_alive(&self, lease: LeaseId) -> BrokerResult<Duration> {
        let mut state = self.state.write().await;
        state.reap_expired();
        match state.leases.get_mut(&lease) {
            Some(l) => {
                l.expires_at = Instant::now() + l.ttl;
                Ok(l.ttl)
            }
            None => Ok(Duration::ZERO),
        }
    }

    async fn lease_revoke(&self, lease: LeaseId) -> BrokerResult<()> {
        let mut state = self.state.write().await;
        state.reap_expired();
        state.drop_lease(lease);
        Ok(())
    }
}
