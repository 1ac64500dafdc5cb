//! Named background tasks with a shared shutdown signal.
//!
//! Every long-running loop in the engine (lease keepalives, prefix watches,
//! the idle handle sweeper) is spawned through a [`BackgroundTaskRegistry`].
//! A registry is owned by the component whose lifetime bounds the tasks: a
//! leader owns one for its leader-only work and drops it on step-down; the
//! broker owns one for process-wide loops.
//!
//! # Example
//!
//! ```rust,no_run
//! use dream_stream::cluster::BackgroundTaskRegistry;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut registry = BackgroundTaskRegistry::new();
//!
//!     registry.spawn_periodic("sweeper", Duration::from_secs(1), |_tick| async {
//!         // sweep idle handles
//!     });
//!
//!     for (name, status) in registry.health_check() {
//!         println!("{}: {:?}", name, status);
//!     }
//!
//!     registry.shutdown_all().await;
//! }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Status of a background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Task is currently running.
    Running,
    /// Task returned or panicked.
    Finished,
}

impl TaskStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, TaskStatus::Running)
    }
}

struct TaskInfo {
    handle: JoinHandle<()>,
}

/// Registry of named background tasks.
///
/// Tasks race against a broadcast shutdown signal inside `tokio::select!`, so
/// a task body does not need to watch for shutdown itself. Dropping the
/// registry aborts everything still running.
pub struct BackgroundTaskRegistry {
    tasks: HashMap<&'static str, TaskInfo>,
    shutdown_tx: broadcast::Sender<()>,
    shutting_down: bool,
}

impl BackgroundTaskRegistry {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            tasks: HashMap::new(),
            shutdown_tx,
            shutting_down: false,
        }
    }

    /// Spawn a named background task.
    ///
    /// A task already registered under `name` is aborted and replaced.
    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.shutting_down {
            tracing::warn!(task = name, "Ignoring spawn during shutdown");
            return;
        }

        if let Some(old_info) = self.tasks.remove(name) {
            old_info.handle.abort();
            tracing::debug!(task = name, "Aborted previous task instance");
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = task => {
                    tracing::debug!(task = name, "Task completed");
                }
                _ = shutdown_rx.recv() => {
                    tracing::debug!(task = name, "Task received shutdown signal");
                }
            }
        });

        tracing::debug!(task = name, "Spawned background task");

        self.tasks.insert(
            name,
            TaskInfo { handle },
        );
    }

    /// Spawn a task that runs `task` every `interval`.
    ///
    /// The first run happens one interval after spawning. Missed ticks are
    /// delayed rather than bursted.
    pub fn spawn_periodic<F, Fut>(&mut self, name: &'static str, interval: Duration, mut task: F)
    where
        F: FnMut(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        self.spawn(name, async move {
            let mut tick = 0u64;
            let mut timer =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                timer.tick().await;
                task(tick).await;
                tick = tick.wrapping_add(1);
            }
        });
    }

    /// Status of every task.
    pub fn health_check(&self) -> Vec<(&'static str, TaskStatus)> {
        self.tasks
            .iter()
            .map(|(name, info)| {
                let status = if info.handle.is_finished() {
                    TaskStatus::Finished
                } else {
                    TaskStatus::Running
                };
                (*name, status)
            })
            .collect()
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.tasks
            .get(name)
            .is_some_and(|info| !info.handle.is_finished())
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn running_count(&self) -> usize {
        self.tasks
            .values()
            .filter(|info| !info.handle.is_finished())
            .count()
    }

    /// Signal every task to stop and wait for them, aborting stragglers after
    /// five seconds.
    pub async fn shutdown_all(&mut self) {
        self.shutdown_all_with_timeout(Duration::from_secs(5)).await;
    }

    pub async fn shutdown_all_with_timeout(&mut self, timeout: Duration) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;

        tracing::debug!(task_count = self.tasks.len(), "Stopping background tasks");

        let _ = self.shutdown_tx.send(());

        let deadline = tokio::time::Instant::now() + timeout;

        for (name, info) in self.tasks.drain() {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());

            if remaining.is_zero() {
                tracing::warn!(task = name, "Aborting task (timeout exceeded)");
                info.handle.abort();
                continue;
            }

            let abort = info.handle.abort_handle();
            match tokio::time::timeout(remaining, info.handle).await {
                Ok(Ok(())) => {
                    tracing::debug!(task = name, "Task shutdown complete");
                }
                Ok(Err(e)) => {
                    tracing::warn!(task = name, error = %e, "Task panicked during shutdown");
                }
                Err(_) => {
                    tracing::warn!(task = name, "Task did not respond to shutdown, aborting");
                    abort.abort();
                }
            }
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }
}

impl Default for BackgroundTaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BackgroundTaskRegistry {
    fn drop(&mut self) {
        if !self.shutting_down {
            let _ = self.shutdown_tx.send(());
            for (name, info) in self.tasks.drain() {
                tracing::debug!(task = name, "Aborting task on registry drop");
                info.handle.abort();
            }
        }
    }
}

impl std::fmt::Debug for BackgroundTaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundTaskRegistry")
            .field("tasks", &self.tasks.keys().collect::<Vec<_>>())
            .field("shutting_down", &self.shutting_down)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[tokio::test]
    async fn test_spawn_and_health_check() {
        let mut registry = BackgroundTaskRegistry::new();
        registry.spawn("forever", std::future::pending());

        assert_eq!(registry.task_count(), 1);
        assert!(registry.is_running("forever"));
        assert_eq!(
            registry.health_check(),
            vec![("forever", TaskStatus::Running)]
        );

        registry.shutdown_all().await;
        assert_eq!(registry.task_count(), 0);
        assert!(registry.is_shutting_down());
    }

    #[tokio::test]
    async fn test_finished_task_reported() {
        let mut registry = BackgroundTaskRegistry::new();
        registry.spawn("quick", async {});
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!registry.is_running("quick"));
        assert_eq!(registry.running_count(), 0);
    }

    #[tokio::test]
    async fn test_respawn_replaces_task() {
        let mut registry = BackgroundTaskRegistry::new();
        registry.spawn("loop", std::future::pending());
        registry.spawn("loop", std::future::pending());
        assert_eq!(registry.task_count(), 1);
        registry.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_spawn_after_shutdown_ignored() {
        let mut registry = BackgroundTaskRegistry::new();
        registry.shutdown_all().await;
        registry.spawn("late", std::future::pending());
        assert_eq!(registry.task_count(), 0);
    }

    #[tokio::test]
    async fn test_periodic_task_ticks_and_stops() {
        let ticks = Arc::new(AtomicU64::new(0));
        let mut registry = BackgroundTaskRegistry::new();

        let counter = ticks.clone();
        registry.spawn_periodic("tick", Duration::from_millis(10), move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(80)).await;
        registry.shutdown_all().await;
        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected at least 2 ticks, saw {}", seen);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn test_drop_aborts_tasks() {
        let ticks = Arc::new(AtomicU64::new(0));
        {
            let mut registry = BackgroundTaskRegistry::new();
            let counter = ticks.clone();
            registry.spawn_periodic("tick", Duration::from_millis(5), move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            });
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        let seen = ticks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }
}
