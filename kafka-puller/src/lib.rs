//! Resilient Kafka consumption for long-lived services.
//!
//! A `PullConsumer` subscribes to a set of topics in a consumer group and
//! dispatches every message to a user handler under one of three
//! scheduling strategies (unordered worker pool, per-partition ordered with
//! retry, or ordered with a one-time offset replay) and one of two commit
//! policies (mark at pull time, or mark after handler completion with
//! out-of-order tolerance).
//!
//! ```no_run
//! use std::sync::Arc;
//! use kafka_puller::{Config, Message, PullConsumer};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = Config::new(
//!     vec!["localhost:9092".to_string()],
//!     "my-service".to_string(),
//!     vec!["events".to_string()],
//! )
//! .with_handler(Arc::new(|message: Message| async move {
//!     println!("{} bytes from {}", message.value().len(), message.topic());
//!     Ok::<(), anyhow::Error>(())
//! }));
//!
//! let consumer = PullConsumer::new(config)?;
//! consumer.pull();
//! // ... until shutdown:
//! consumer.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod client;
pub mod codes;
pub mod commit;
pub mod config;
mod context;
pub mod consumer;
pub mod error;
pub mod handler;
pub mod health;
pub mod message;
pub mod metrics_consts;
mod pool;
mod strategy;
pub mod test_utils;

pub use broker::{
    BrokerClient, BrokerProbe, BrokerStreams, ClaimPeek, MonotonicMarker, OffsetMarker,
    PartitionClaim, RebalanceKind, RebalanceNotification,
};
pub use config::{CommitMode, Config, ConsumerMode, EnvConfig, InitialOffset};
pub use consumer::PullConsumer;
pub use error::ConfigError;
pub use handler::{ErrorCallback, MessageHandler, NotificationCallback, OffsetStashProvider};
pub use crate::health::Health;
pub use message::{Message, OffsetStash, TRANSACTION_ID_HEADER};
