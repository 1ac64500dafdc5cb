//! Configuration for a Dream-Stream broker process.
//!
//! ```rust,no_run
//! use dream_stream::cluster::BrokerConfig;
//!
//! let config = BrokerConfig::from_env().expect("invalid environment");
//! if let Err(errors) = config.validate() {
//!     for e in errors {
//!         eprintln!("config error: {}", e);
//!     }
//! }
//! ```

use std::path::PathBuf;
use std::time::Duration;

use crate::constants::{
    DEFAULT_CACHE_MAX_BYTES, DEFAULT_DATA_PATH, DEFAULT_HANDLE_IDLE_TIMEOUT,
    DEFAULT_HANDLE_SWEEP_INTERVAL, DEFAULT_LEASE_TTL, DEFAULT_REMOTE_TIMEOUT, KEEPALIVE_DIVISOR,
};
use crate::types::BrokerId;

/// Where partition logs and committed offsets live.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StorageBackend {
    /// Append-only files under `data_dir` (reference backend).
    #[default]
    Local,
    /// In-process object store. Nothing survives a restart.
    Memory,
    /// Amazon S3 or S3-compatible storage (MinIO, etc.).
    S3 {
        /// S3 bucket name.
        bucket: String,
        /// AWS region (e.g., "us-east-1").
        region: String,
        /// Optional custom endpoint for S3-compatible services.
        endpoint: Option<String>,
        /// Optional access key ID (if not using environment/IAM).
        access_key_id: Option<String>,
        /// Optional secret access key.
        secret_access_key: Option<String>,
    },
}

impl StorageBackend {
    pub fn name(&self) -> &'static str {
        match self {
            StorageBackend::Local => "local",
            StorageBackend::Memory => "memory",
            StorageBackend::S3 { .. } => "s3",
        }
    }
}

/// Broker process configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Broker name; the registered identity is `<broker_name>-<broker_index>`.
    pub broker_name: String,

    /// Numeric suffix of the identity. Must be unique among live brokers.
    pub broker_index: u32,

    /// Base directory for partition logs and offsets.
    pub data_dir: PathBuf,

    /// TTL of leadership and membership leases.
    pub lease_ttl: Duration,

    /// Interval between lease keepalives.
    pub keepalive_interval: Duration,

    /// Open handles idle for this long are closed.
    pub handle_idle_timeout: Duration,

    /// How often idle handles are swept.
    pub handle_sweep_interval: Duration,

    /// Total payload bytes the record cache may hold.
    pub cache_max_bytes: u64,

    /// Timeout for a single remote storage call.
    pub remote_timeout: Duration,

    /// Storage backend for logs and offsets.
    pub storage: StorageBackend,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            broker_name: "broker".to_string(),
            broker_index: 0,
            data_dir: PathBuf::from(DEFAULT_DATA_PATH),
            lease_ttl: DEFAULT_LEASE_TTL,
            keepalive_interval: DEFAULT_LEASE_TTL / KEEPALIVE_DIVISOR,
            handle_idle_timeout: DEFAULT_HANDLE_IDLE_TIMEOUT,
            handle_sweep_interval: DEFAULT_HANDLE_SWEEP_INTERVAL,
            cache_max_bytes: DEFAULT_CACHE_MAX_BYTES,
            remote_timeout: DEFAULT_REMOTE_TIMEOUT,
            storage: StorageBackend::Local,
        }
    }
}

impl BrokerConfig {
    /// Identity this broker registers under.
    pub fn broker_id(&self) -> BrokerId {
        BrokerId::new(self.broker_name.clone(), self.broker_index)
    }

    /// Validate the configuration and return every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.broker_name.is_empty() {
            errors.push("broker_name must not be empty".to_string());
        }
        if self.broker_name.contains('/') {
            errors.push(format!(
                "broker_name ({}) must not contain '/'",
                self.broker_name
            ));
        }

        // Lease TTLs are whole seconds in the coordination store
        if self.lease_ttl < Duration::from_secs(1) || self.lease_ttl.subsec_nanos() != 0 {
            errors.push(format!(
                "lease_ttl ({:?}) must be a whole number of seconds, at least 1s",
                self.lease_ttl
            ));
        }

        if self.keepalive_interval.is_zero() || self.keepalive_interval >= self.lease_ttl {
            errors.push(format!(
                "keepalive_interval ({:?}) must be non-zero and less than lease_ttl ({:?})",
                self.keepalive_interval, self.lease_ttl
            ));
        }

        if self.handle_sweep_interval.is_zero() {
            errors.push("handle_sweep_interval must be non-zero".to_string());
        }

        if self.handle_idle_timeout.is_zero() {
            errors.push("handle_idle_timeout must be non-zero".to_string());
        }

        if self.cache_max_bytes == 0 {
            errors.push("cache_max_bytes must be at least 1".to_string());
        }

        if self.remote_timeout.is_zero() {
            errors.push("remote_timeout must be non-zero".to_string());
        }

        if matches!(&self.storage, StorageBackend::S3 { bucket, .. } if bucket.is_empty()) {
            errors.push("S3 bucket must not be empty".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Load configuration from environment variables.
    ///
    /// - `BROKER_NAME`: broker name (default: `broker`)
    /// - `BROKER_INDEX`: numeric identity suffix (default: 0)
    /// - `DATA_PATH`: data directory (default: `/tmp/dream-stream-data`)
    /// - `LEASE_TTL_SECS`: lease TTL (default: 5)
    /// - `KEEPALIVE_INTERVAL_MS`: keepalive interval (default: TTL / 10)
    /// - `HANDLE_IDLE_TIMEOUT_SECS`: idle handle timeout (default: 10)
    /// - `HANDLE_SWEEP_INTERVAL_MS`: idle sweep interval (default: 1000)
    /// - `CACHE_MAX_BYTES`: record cache budget (default: 1 GiB)
    /// - `REMOTE_TIMEOUT_MS`: remote storage timeout (default: 5000)
    /// - `STORAGE_BACKEND`: `local`, `memory` or `s3` (default: `local`)
    ///
    /// For S3:
    /// - `S3_BUCKET`: Bucket name (required)
    /// - `S3_REGION`: Region (default: `us-east-1`)
    /// - `S3_ENDPOINT`: Custom endpoint (optional)
    /// - `S3_ACCESS_KEY_ID` / `S3_SECRET_ACCESS_KEY`: Credentials (optional)
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let defaults = Self::default();

        let broker_name = std::env::var("BROKER_NAME").unwrap_or(defaults.broker_name);

        let broker_index: u32 = std::env::var("BROKER_INDEX")
            .unwrap_or_else(|_| "0".to_string())
            .parse()
            .map_err(|e| format!("Invalid BROKER_INDEX: {}", e))?;

        let data_dir = std::env::var("DATA_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);

        let lease_ttl = match std::env::var("LEASE_TTL_SECS") {
            Ok(v) => Duration::from_secs(
                v.parse()
                    .map_err(|e| format!("Invalid LEASE_TTL_SECS: {}", e))?,
            ),
            Err(_) => defaults.lease_ttl,
        };

        let keepalive_interval = match std::env::var("KEEPALIVE_INTERVAL_MS") {
            Ok(v) => Duration::from_millis(
                v.parse()
                    .map_err(|e| format!("Invalid KEEPALIVE_INTERVAL_MS: {}", e))?,
            ),
            Err(_) => lease_ttl / KEEPALIVE_DIVISOR,
        };

        let handle_idle_timeout = std::env::var("HANDLE_IDLE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.handle_idle_timeout);

        let handle_sweep_interval = std::env::var("HANDLE_SWEEP_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.handle_sweep_interval);

        let cache_max_bytes: u64 = std::env::var("CACHE_MAX_BYTES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.cache_max_bytes);

        let remote_timeout = std::env::var("REMOTE_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.remote_timeout);

        let backend = std::env::var("STORAGE_BACKEND").unwrap_or_else(|_| "local".to_string());
        let storage = match backend.to_lowercase().as_str() {
            "local" => StorageBackend::Local,
            "memory" => StorageBackend::Memory,
            "s3" => StorageBackend::S3 {
                bucket: std::env::var("S3_BUCKET")
                    .map_err(|_| "S3_BUCKET is required when STORAGE_BACKEND=s3")?,
                region: std::env::var("S3_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
                endpoint: std::env::var("S3_ENDPOINT").ok(),
                access_key_id: std::env::var("S3_ACCESS_KEY_ID").ok(),
                secret_access_key: std::env::var("S3_SECRET_ACCESS_KEY").ok(),
            },
            other => {
                return Err(format!(
                    "Invalid STORAGE_BACKEND '{}'. Valid values: local, memory, s3",
                    other
                )
                .into());
            }
        };

        Ok(Self {
            broker_name,
            broker_index,
            data_dir,
            lease_ttl,
            keepalive_interval,
            handle_idle_timeout,
            handle_sweep_interval,
            cache_max_bytes,
            remote_timeout,
            storage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = BrokerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.lease_ttl, Duration::from_secs(5));
        assert_eq!(config.keepalive_interval, Duration::from_millis(500));
        assert_eq!(config.handle_idle_timeout, Duration::from_secs(10));
        assert_eq!(config.cache_max_bytes, 1024 * 1024 * 1024);
        assert_eq!(config.storage, StorageBackend::Local);
    }

    #[test]
    fn test_broker_id() {
        let config = BrokerConfig {
            broker_name: "node".to_string(),
            broker_index: 4,
            ..Default::default()
        };
        assert_eq!(config.broker_id().to_string(), "node-4");
    }

    #[test]
    fn test_keepalive_must_be_shorter_than_ttl() {
        let config = BrokerConfig {
            keepalive_interval: Duration::from_secs(5),
            ..Default::default()
        };
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("keepalive_interval"));
    }

    #[test]
    fn test_fractional_lease_ttl_rejected() {
        let config = BrokerConfig {
            lease_ttl: Duration::from_millis(1500),
            keepalive_interval: Duration::from_millis(150),
            ..Default::default()
        };
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("lease_ttl")));
    }

    #[test]
    fn test_multiple_errors_reported() {
        let config = BrokerConfig {
            broker_name: String::new(),
            cache_max_bytes: 0,
            remote_timeout: Duration::ZERO,
            ..Default::default()
        };
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_empty_s3_bucket_rejected() {
        let config = BrokerConfig {
            storage: StorageBackend::S3 {
                bucket: String::new(),
                region: "us-east-1".to_string(),
                endpoint: None,
                access_key_id: None,
                secret_access_key: None,
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backend_names() {
        assert_eq!(StorageBackend::Local.name(), "local");
        assert_eq!(StorageBackend::Memory.name(), "memory");
    }
}
