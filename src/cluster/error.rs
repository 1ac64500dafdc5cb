//! Error types for the storage and coordination engine.
//!
//! # Error Handling Patterns
//!
//! Two patterns are used depending on where an operation sits.
//!
//! ## Fail-Fast (Propagate Errors)
//!
//! Inside a component, every failure is returned with `?`:
//! - Log appends and reads
//! - Offset writes
//! - Coordination store calls made by the assigners and the elector
//!
//! ## Best-Effort (Log and Continue)
//!
//! At the [`Broker`](super::Broker) facade and in background loops, failures
//! are absorbed and replaced with a sentinel:
//! - A failed read returns no records and zero bytes consumed
//! - A failed rebalance pass is logged and retried on the next watch event
//! - Keepalives that fail for a whole lease TTL are treated as lease loss
//!
//! Only [`BrokerError::Fatal`] is allowed to abort startup.
//!
//! ## States, not errors
//!
//! Losing an election or a lease is reported as `Ok(false)` or a state
//! change, never as an error. Having nobody to assign partitions to
//! ([`BrokerError::AssignmentImpossible`]) is an error, but the elector logs
//! it at debug level and counts it apart from real failures.

use thiserror::Error;

/// Result type for storage and coordination operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Errors raised by the storage and coordination engine.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Local disk I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Remote object store failure.
    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    /// A bounded remote call ran out of time.
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    /// The coordination store rejected or failed a call.
    #[error("Coordination store error: {0}")]
    Coordination(String),

    /// No live broker or member can take partitions.
    #[error("Cannot assign partitions for topic {topic}: {reason}")]
    AssignmentImpossible { topic: String, reason: String },

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unrecoverable startup failure.
    #[error("Fatal error: {0}")]
    Fatal(String),

    /// The component is shutting down.
    #[error("Shutting down")]
    Shutdown,
}

impl BrokerError {
    /// Whether a single retry might succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            BrokerError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ),
            BrokerError::ObjectStore(e) => !matches!(
                e,
                object_store::Error::NotFound { .. }
                    | object_store::Error::AlreadyExists { .. }
                    | object_store::Error::NotSupported { .. }
                    | object_store::Error::NotImplemented
            ),
            BrokerError::Timeout { .. } | BrokerError::Coordination(_) => true,
            _ => false,
        }
    }

    /// Short label for metrics.
    pub fn as_metric_label(&self) -> &'static str {
        match self {
            BrokerError::Io(_) => "io",
            BrokerError::ObjectStore(_) => "object_store",
            BrokerError::Timeout { .. } => "timeout",
            BrokerError::Coordination(_) => "coordination",
            BrokerError::AssignmentImpossible { .. } => "assignment_impossible",
            BrokerError::Config(_) => "config",
            BrokerError::Fatal(_) => "fatal",
            BrokerError::Shutdown => "shutdown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_transience_depends_on_kind() {
        let transient = BrokerError::Io(std::io::Error::from(std::io::ErrorKind::TimedOut));
        let permanent = BrokerError::Io(std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        assert!(transient.is_transient());
        assert!(!permanent.is_transient());
    }

    #[test]
    fn test_state_errors_are_not_transient() {
        let impossible = BrokerError::AssignmentImpossible {
            topic: "t".to_string(),
            reason: "no live brokers".to_string(),
        };
        assert!(!impossible.is_transient());
        assert!(!BrokerError::Shutdown.is_transient());
        assert!(!BrokerError::Fatal("disk".to_string()).is_transient());
    }

    #[test]
    fn test_timeout_is_transient() {
        let err = BrokerError::Timeout {
            operation: "put".to_string(),
        };
        assert!(err.is_transient());
        assert_eq!(err.as_metric_label(), "timeout");
        assert!(err.to_string().contains("put"));
    }

    #[test]
    fn test_object_store_not_found_is_permanent() {
        let err = BrokerError::ObjectStore(object_store::Error::NotFound {
            path: "a/b".to_string(),
            source: "missing".into(),
        });
        assert!(!err.is_transient());
    }

    #[test]
    fn test_display_messages() {
        let err = BrokerError::AssignmentImpossible {
            topic: "orders".to_string(),
            reason: "no live brokers".to_string(),
        };
        assert!(err.to_string().contains("no live brokers"));
    }
}
