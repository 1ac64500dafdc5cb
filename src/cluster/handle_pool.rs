//! Pool of open log file handles with idle eviction.
//!
//! Each handle lives in a slot guarded by its own `tokio::sync::Mutex`. The
//! same lock serialises I/O on the handle and the sweeper closing it, so a
//! handle is never closed under an in-flight read or write.
//!
//! Writers use one slot per (topic, partition). Readers get one slot per
//! (topic, partition, group) so each group keeps its own cursor handle.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::fs::File;
use tokio::sync::Mutex;

use super::metrics;

/// Identity of a pooled handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandleKey {
    pub topic: Arc<str>,
    pub partition: i32,
    /// `None` for the writer handle, the consumer group for reader handles.
    pub group: Option<Arc<str>>,
}

impl HandleKey {
    pub fn writer(topic: &str, partition: i32) -> Self {
        Self {
            topic: Arc::from(topic),
            partition,
            group: None,
        }
    }

    pub fn reader(topic: &str, partition: i32, group: &str) -> Self {
        Self {
            topic: Arc::from(topic),
            partition,
            group: Some(Arc::from(group)),
        }
    }
}

/// A possibly-closed handle and when it was last used.
#[derive(Debug)]
pub struct HandleSlot {
    file: Option<File>,
    last_used: Instant,
}

impl HandleSlot {
    fn new() -> Self {
        Self {
            file: None,
            last_used: Instant::now(),
        }
    }

    /// Return the open handle, opening it with `open` if it was closed.
    pub async fn open_with<F, Fut>(&mut self, open: F) -> io::Result<&mut File>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = io::Result<File>>,
    {
        self.last_used = Instant::now();
        if self.file.is_none() {
            self.file = Some(open().await?);
            metrics::OPEN_HANDLES.inc();
        }
        match self.file.as_mut() {
            Some(file) => Ok(file),
            None => Err(io::Error::other("handle slot emptied while locked")),
        }
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn close(&mut self) -> bool {
        if self.file.take().is_some() {
            metrics::OPEN_HANDLES.dec();
            true
        } else {
            false
        }
    }
}

impl Drop for HandleSlot {
    fn drop(&mut self) {
        self.close();
    }
}

/// Sharded map of handle slots.
#[derive(Debug)]
pub struct HandlePool {
    slots: DashMap<HandleKey, Arc<Mutex<HandleSlot>>>,
    idle_timeout: Duration,
}

impl HandlePool {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            slots: DashMap::new(),
            idle_timeout,
        }
    }

    /// Slot for `key`, created on first use. Concurrent callers for the same
    /// key always receive the same slot.
    pub fn slot(&self, key: HandleKey) -> Arc<Mutex<HandleSlot>> {
        self.slots
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(HandleSlot::new())))
            .clone()
    }

    /// Close every handle idle for longer than the idle timeout and forget
    /// slots nobody else references. Returns the number of handles closed.
    pub async fn sweep(&self) -> usize {
        let snapshot: Vec<(HandleKey, Arc<Mutex<HandleSlot>>)> = self
            .slots
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut closed = 0;
        let mut idle_keys = Vec::new();
        for (key, slot) in snapshot {
            let mut guard = slot.lock().await;
            if guard.last_used.elapsed() >= self.idle_timeout {
                if guard.close() {
                    closed += 1;
                    metrics::HANDLE_EVICTIONS.inc();
                    tracing::debug!(
                        topic = %key.topic,
                        partition = key.partition,
                        group = key.group.as_deref().unwrap_or("-"),
                        "Closed idle log handle"
                    );
                }
                idle_keys.push(key);
            }
        }

        for key in idle_keys {
            self.slots.remove_if(&key, |_, slot| {
                Arc::strong_count(slot) == 1
                    && slot.try_lock().map(|s| !s.is_open()).unwrap_or(false)
            });
        }

        closed
    }

    /// Number of slots currently tracked, open or closed.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots holding an open handle. Slots locked by in-flight I/O
    /// count as open.
    pub fn open_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .try_lock()
                    .map(|slot| slot.is_open())
                    .unwrap_or(true)
            })
            .count()
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }
}
