//! # Dream-Stream
//!
//! A distributed, partitioned, append-only log broker.
//!
//! Producers append opaque records to numbered partitions of named topics.
//! Consumers, organised in consumer groups, read records back by byte offset
//! and commit the offset they have consumed up to. Brokers coordinate through
//! an etcd-style key-value store with leases: per topic one broker wins a
//! leader key and assigns partitions to live brokers and to consumer group
//! members.
//!
//! ## Layout
//!
//! - [`protocol`]: on-disk record framing (10-byte header + payload)
//! - [`message`]: the client envelope (publish, fetch, offsets)
//! - [`cluster`]: storage engine, membership, leader election and assignment
//! - [`telemetry`]: `tracing` subscriber setup
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dream_stream::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
//!     let config = cluster::BrokerConfig::from_env()?;
//!     let broker = cluster::Broker::start(config, Arc::new(cluster::MockCoordinator::new())).await?;
//!
//!     broker.create_topic("orders", 3).await?;
//!     let offset = broker.append("orders", 0, bytes::Bytes::from_static(b"hello")).await;
//!     let read = broker.read("billing", "orders", 0, offset, 1024).await;
//!     assert_eq!(read.records.len(), 1);
//!
//!     broker.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! See `demos/broker.rs` for a three-broker walkthrough.

#![forbid(unsafe_code)]

mod encode;
pub mod error;
pub mod message;
mod parser;
pub mod protocol;
pub mod types;

pub mod cluster;
pub mod constants;
pub mod telemetry;

pub mod prelude {
    //! Main exports.
    //!
    //! ```rust,no_run
    //! use dream_stream::prelude::*;
    //!
    //! let header = MessageHeader::new("orders", 0);
    //! let publish = Message::Publish {
    //!     header,
    //!     messages: vec![bytes::Bytes::from_static(b"hello")],
    //! };
    //! let wire = publish.encode().unwrap();
    //! assert_eq!(Message::decode(wire).unwrap(), publish);
    //! ```
    pub use crate::error::{Error, Result};
    pub use crate::message::{GroupPartition, Message, MessageHeader, USE_COMMITTED_OFFSET};
    pub use crate::protocol::{FrameStop, SplitFrames, encode_frame, framed_len, split_frames};
    pub use crate::types::{BrokerId, Offset, PartitionIndex, TopicPartition};

    pub use bytes;

    pub mod cluster {
        //! Broker, storage and coordination.
        pub use crate::cluster::*;
    }
}
