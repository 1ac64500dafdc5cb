//! Collapse overlapping triggers of an idempotent pass.
//!
//! A trigger that arrives while a pass is running marks the guard dirty and
//! returns immediately; the running caller then does one more pass. Many
//! triggers during one pass collapse into a single follow-up pass.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct SingleFlight {
    running: AtomicBool,
    dirty: AtomicBool,
    passes: AtomicU64,
}

/// Clears `running` even if the pass future is dropped mid-flight.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a pass. Returns `true` if this call ran at least one pass,
    /// `false` if it was absorbed by a pass already in flight.
    pub async fn run<F, Fut>(&self, mut pass: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ()>,
    {
        self.dirty.store(true, Ordering::SeqCst);
        let mut ran = false;

        loop {
            if self
                .running
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return ran;
            }

            {
                let _running = RunningGuard(&self.running);
                while self.dirty.swap(false, Ordering::SeqCst) {
                    pass().await;
                    self.passes.fetch_add(1, Ordering::Relaxed);
                    ran = true;
                }
            }

            // A trigger may have set `dirty` after the last swap but before
            // `running` was cleared, and returned without running it.
            if !self.dirty.load(Ordering::SeqCst) {
                return ran;
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Total passes completed.
    pub fn pass_count(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }
}
