//! Retry policies built on `backon`.
//!
//! | Policy | Min Delay | Max Delay | Retries | Use Case |
//! |--------|-----------|-----------|---------|----------|
//! | `remote_policy` | 50ms | 50ms | 1 | Remote storage backend calls |
//! | `coordination_policy` | 50ms | 2s | 5 | Membership registration at startup |
//!
//! Remote storage calls get exactly one retry. After that the failure is
//! surfaced and the broker degrades it to an empty or zero result.
//!
//! # Example
//!
//! ```rust,no_run
//! use dream_stream::cluster::retry;
//! use std::time::Duration;
//!
//! async fn example() -> dream_stream::cluster::BrokerResult<()> {
//!     retry::with_remote_policy("put", Duration::from_secs(5), || async {
//!         // your fallible remote operation
//!         Ok(())
//!     })
//!     .await
//! }
//! ```

use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};

use super::error::{BrokerError, BrokerResult};

/// Policy for remote storage calls: one retry after a short pause.
pub fn remote_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_millis(50))
        .with_max_times(1)
}

/// Policy for coordination store writes that must eventually land, such as
/// registering this broker at startup.
pub fn coordination_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(5)
        .with_jitter()
}

/// Run `operation` under `timeout`, retrying once on a transient failure.
///
/// A timed-out attempt counts as a transient [`BrokerError::Timeout`].
pub async fn with_remote_policy<F, Fut, T>(
    operation_name: &str,
    timeout: Duration,
    mut operation: F,
) -> BrokerResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BrokerResult<T>>,
{
    let result = (|| {
        let attempt = operation();
        async move {
            match tokio::time::timeout(timeout, attempt).await {
                Ok(result) => result,
                Err(_) => Err(BrokerError::Timeout {
                    operation: operation_name.to_string(),
                }),
            }
        }
    })
    .retry(remote_policy())
    .when(BrokerError::is_transient)
    .notify(|err, delay| {
        record_retry_attempt("remote", delay);
        tracing::debug!(operation = operation_name, error = %err, "Retrying remote call");
    })
    .await;

    match &result {
        Ok(_) => {}
        Err(e) if e.is_transient() => record_retry_exhausted("remote"),
        Err(_) => {}
    }
    result
}

/// Run a coordination store call with [`coordination_policy`].
pub async fn with_coordination_policy<F, Fut, T>(operation: F) -> BrokerResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BrokerResult<T>>,
{
    operation
        .retry(coordination_policy())
        .when(BrokerError::is_transient)
        .notify(|err, delay| {
            record_retry_attempt("coordination", delay);
            tracing::debug!(error = %err, "Retrying coordination call");
        })
        .await
}

/// Record a retry attempt for metrics.
pub fn record_retry_attempt(policy_name: &str, delay: Duration) {
    super::metrics::record_retry_attempt(policy_name, "attempt");
    tracing::debug!(
        policy = policy_name,
        delay_ms = delay.as_millis() as u64,
        "Retry attempt"
    );
}

/// Record a retry exhaustion (all retries failed).
pub fn record_retry_exhausted(policy_name: &str) {
    super::metrics::record_retry_attempt(policy_name, "exhausted");
    tracing::warn!(policy = policy_name, "Retry policy exhausted");
}
