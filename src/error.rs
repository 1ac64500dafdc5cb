//! Envelope-level errors.
//!
//! # Error Hierarchy
//!
//! The crate uses a two-layer error hierarchy:
//!
//! ## Envelope Layer (`crate::error`)
//!
//! - [`Error`]: message decoding and caller-facing failures
//!
//! ## Storage/Coordination Layer (`crate::cluster::error`)
//!
//! - [`BrokerError`]: log store, offset store, coordination store, election
//!   and assignment failures
//!
//! [`BrokerError`] converts into [`Error`] via `From`, so storage errors can
//! propagate through the message boundary.
//!
//! [`BrokerError`]: crate::cluster::BrokerError

use bytes::Bytes;
use std::{io, result};
use thiserror::Error as ThisError;

pub type Result<T> = result::Result<T, Error>;

/// Message boundary errors.
///
/// For storage and coordination errors, see [`crate::cluster::BrokerError`].
#[derive(Clone, Debug, ThisError)]
pub enum Error {
    /// An I/O error underneath the message boundary.
    #[error("IO error: {0:?}")]
    IoError(io::ErrorKind),

    /// Could not parse the data.
    #[error("Parsing error: invalid data ({} bytes)", .0.len())]
    ParsingError(Bytes),

    /// Missing data or truncated input.
    #[error("Missing data: {0}")]
    MissingData(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Error::IoError(a), Error::IoError(b)) => a == b,
            (Error::ParsingError(a), Error::ParsingError(b)) => a == b,
            (Error::MissingData(a), Error::MissingData(b)) => a == b,
            (Error::Config(a), Error::Config(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::IoError(e.kind())
    }
}

impl From<crate::cluster::BrokerError> for Error {
    fn from(e: crate::cluster::BrokerError) -> Self {
        use crate::cluster::BrokerError;
        match e {
            BrokerError::Io(io_err) => Error::IoError(io_err.kind()),
            BrokerError::Timeout { .. } => Error::IoError(io::ErrorKind::TimedOut),
            BrokerError::Config(msg) => Error::Config(msg),
            other => Error::Config(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::BrokerError;

    #[test]
    fn test_error_io_error() {
        let err = Error::IoError(io::ErrorKind::ConnectionRefused);
        assert_eq!(err, Error::IoError(io::ErrorKind::ConnectionRefused));
    }

    #[test]
    fn test_error_parsing_error() {
        let data = Bytes::from("bad data");
        let err = Error::ParsingError(data.clone());
        assert_eq!(err, Error::ParsingError(data));
        assert!(err.to_string().contains("8 bytes"));
    }

    #[test]
    fn test_error_display() {
        let err = Error::MissingData("test".to_string());
        let display = format!("{}", err);
        assert!(display.contains("Missing data"));
        assert!(display.contains("test"));
    }

    #[test]
    fn test_from_io_error_keeps_kind() {
        let err: Error = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert_eq!(err, Error::IoError(io::ErrorKind::NotFound));
    }

    #[test]
    fn test_from_broker_error() {
        let err: Error = BrokerError::Config("bad".to_string()).into();
        assert_eq!(err, Error::Config("bad".to_string()));

        let err: Error = BrokerError::Timeout {
            operation: "get".to_string(),
        }
        .into();
        assert_eq!(err, Error::IoError(io::ErrorKind::TimedOut));

        let err: Error = BrokerError::Io(io::Error::other("disk")).into();
        assert_eq!(err, Error::IoError(io::ErrorKind::Other));
    }

    #[test]
    fn test_variants_differ() {
        assert_ne!(
            Error::Config("a".to_string()),
            Error::MissingData("a".to_string())
        );
    }
}
