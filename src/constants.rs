//! Centralized storage, coordination and framing constants.
//!
//! Having the magic numbers in one place keeps the on-disk format, the
//! coordination key layout and the default timings consistent across modules.
//!
//! # Categories
//!
//! - **Frame Constants**: on-disk record framing
//! - **Coordination Constants**: key prefixes and lease timings
//! - **Storage Constants**: handle eviction, cache and read limits

use std::time::Duration;

// =============================================================================
// Frame Constants
// =============================================================================

/// Size of the fixed-width header that precedes every record on disk.
///
/// Layout:
/// - bytes 0..4: payload length (u32, little-endian)
/// - bytes 4..10: reserved, always written as zero
pub const FRAME_HEADER_SIZE: usize = 10;

/// Number of header bytes that carry the payload length.
pub const FRAME_LENGTH_FIELD_SIZE: usize = 4;

/// Largest payload a single frame can describe.
pub const MAX_FRAME_PAYLOAD: usize = u32::MAX as usize;

// =============================================================================
// Coordination Constants
// =============================================================================

/// Prefix of the topic registry (`TopicList/<topic>` -> partition count).
pub const TOPIC_LIST_PREFIX: &str = "TopicList/";

/// Prefix of the per-topic leader keys (`Leader/<topic>`).
pub const LEADER_PREFIX: &str = "Leader/";

/// Prefix of broker liveness markers (`Broker/<name>-<index>`).
pub const BROKER_PREFIX: &str = "Broker/";

/// Prefix of broker-side partition ownership (`Topic/<topic>/<partition>`).
pub const TOPIC_PREFIX: &str = "Topic/";

/// Prefix of consumer group membership and assignment
/// (`ConsumerGroup/<topic>/<group>/<consumerId>`).
pub const CONSUMER_GROUP_PREFIX: &str = "ConsumerGroup/";

/// Default leadership lease TTL.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(5);

/// Keepalive fires this many times per lease TTL.
pub const KEEPALIVE_DIVISOR: u32 = 10;

// =============================================================================
// Storage Constants
// =============================================================================

/// Open file handles idle for longer than this are closed.
pub const DEFAULT_HANDLE_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// How often the handle sweeper looks for idle handles.
pub const DEFAULT_HANDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Default record cache budget in bytes (1 GiB).
pub const DEFAULT_CACHE_MAX_BYTES: u64 = 1024 * 1024 * 1024;

/// Default timeout for a single remote storage call.
pub const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default data directory for the local log store.
pub const DEFAULT_DATA_PATH: &str = "/tmp/dream-stream-data";

/// Directory under the data path that holds committed consumer offsets.
pub const OFFSETS_DIR: &str = "offsets";

/// Upper bound on a single read request, regardless of what the caller asks for.
pub const MAX_READ_BYTES: usize = 16 * 1024 * 1024;

/// Upper bound on array lengths accepted by the message decoder.
pub const MAX_PROTOCOL_ARRAY_SIZE: i32 = 100_000;
