//! Broker storage engine and cluster coordination.
//!
//! This module holds everything behind the message envelope:
//! - **Storage**: framed append-only partition logs, per-group committed
//!   offsets and a write-through record cache
//! - **Coordination**: lease-bound broker membership, per-topic leader
//!   election and the two assigners the leader drives
//!
//! # Architecture
//!
//! ```text
//!                      ┌─────────────────────┐
//!                      │ Coordination store  │ ← etcd-style KV with leases
//!                      └──────────┬──────────┘
//!            ┌────────────────────┼────────────────────┐
//!            ▼                    ▼                    ▼
//!      ┌──────────┐         ┌──────────┐         ┌──────────┐
//!      │ broker-0 │         │ broker-1 │         │ broker-2 │
//!      │ leads t1 │         │ leads t2 │         │          │
//!      └────┬─────┘         └────┬─────┘         └────┬─────┘
//!           │                    │                    │
//!           ▼                    ▼                    ▼
//!      ┌──────────┐         ┌──────────┐         ┌──────────┐
//!      │ t1/0.log │         │ t1/1.log │         │ t2/0.log │
//!      │ t2/1.log │         │ t2/2.log │         │ t1/2.log │
//!      └──────────┘         └──────────┘         └──────────┘
//! ```
//!
//! Each topic has at most one leader, which writes `Topic/<topic>/<p>`
//! (partition owner) and `ConsumerGroup/<topic>/<group>/<member>`
//! (member partition list) keys. Every broker serves appends and reads for
//! whatever partitions clients send it.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dream_stream::cluster::{Broker, BrokerConfig, MockCoordinator};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BrokerConfig::from_env()?;
//!     let broker = Broker::start(config, Arc::new(MockCoordinator::new())).await?;
//!     broker.create_topic("orders", 6).await?;
//!     broker.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod background_tasks;
mod broker;
mod config;
mod consumer_group_assigner;
mod error;
mod handle_pool;
pub mod keys;
mod leader_election;
mod log_store;
mod membership;
pub mod metrics;
mod object_store;
mod offset_store;
mod partition_assigner;
mod record_cache;
pub mod retry;
mod single_flight;
mod topic_list;
mod traits;

#[cfg(any(test, feature = "test-utilities"))]
pub mod mock_coordinator;

pub use background_tasks::{BackgroundTaskRegistry, TaskStatus};
pub use broker::Broker;
pub use config::{BrokerConfig, StorageBackend};
pub use consumer_group_assigner::{ConsumerGroupAssigner, plan_member_assignment};
pub use error::{BrokerError, BrokerResult};
pub use handle_pool::{HandleKey, HandlePool};
pub use leader_election::{ElectionConfig, LeaderElector};
pub use log_store::FileLogStore;
pub use membership::MembershipRegistry;
#[cfg(any(test, feature = "test-utilities"))]
pub use mock_coordinator::MockCoordinator;
pub use object_store::{ObjectStoreLog, create_object_store};
pub use offset_store::FileOffsetStore;
pub use partition_assigner::{AssignmentPlan, PartitionAssigner, plan_partition_assignment};
pub use record_cache::RecordCache;
pub use single_flight::SingleFlight;
pub use topic_list::{TopicList, read_partition_count};
pub use traits::{
    CoordinationClient, KeyValue, LeaseId, LogStore, OffsetStore, ReadResult, WatchEvent,
    WatchEventKind, WatchStream,
};
