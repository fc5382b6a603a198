//! # Blueprint Kafka
//!
//! High-level async clients for Apache Kafka built on librdkafka.
//!
//! ## Features
//!
//! - **Producer**: ordered per-record delivery reports, async callbacks, JSON helpers
//! - **Transactions**: buffered exactly-once publishing with automatic abort on failure or panic
//! - **Consumer**: record, batch, raw fetch and channel consume loops with clean shutdown
//! - **Admin**: topic, broker and consumer group management
//! - **Authentication**: SASL PLAIN/SCRAM, OAuth and AWS MSK IAM, with zeroized secrets
//! - **Observability**: `tracing` spans per client and per-client metrics
//! - **Testing**: an in-process [`MemoryBroker`] that stands in for a cluster
//!
//! Every blocking operation takes a [`CancellationToken`]; cancelling it makes
//! the operation return promptly.
//!
//! ## Quick Start
//!
//! ### Producer Example
//!
//! ```rust,no_run
//! use blueprint_kafka::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let producer = ProducerBuilder::new()
//!         .brokers(["localhost:9092"])
//!         .default_topic("my-topic")
//!         .build()
//!         .await?;
//!
//!     let token = CancellationToken::new();
//!     let record = Record::new("Hello Kafka!").with_key("user-123");
//!     for result in producer.produce(&token, [record]).await? {
//!         let result = result.into_result()?;
//!         println!("Record sent to partition {} at offset {}", result.partition, result.offset);
//!     }
//!
//!     producer.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ### Consumer Example
//!
//! ```rust,no_run
//! use blueprint_kafka::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let consumer = ConsumerBuilder::new()
//!         .brokers(["localhost:9092"])
//!         .group_id("my-consumer-group")
//!         .topics(["my-topic"])
//!         .build()
//!         .await?;
//!
//!     let token = CancellationToken::new();
//!     consumer
//!         .consume(&token, |record| async move {
//!             println!("Received: key={:?}, value={:?}", record.key, record.value);
//!             Ok(())
//!         })
//!         .await
//! }
//! ```

pub mod admin;
pub mod client;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod credential;
pub mod error;
mod iam;
pub mod logger;
pub mod memory;
pub mod message;
pub mod metrics;
pub mod producer;
pub mod transaction;

pub use admin::*;
pub use client::{AdminClient, ConsumerClient, ProducerClient};
pub use crate::config::*;
pub use consumer::*;
pub use credential::CredentialConfig;
pub use error::*;
pub use memory::MemoryBroker;
pub use message::*;
pub use metrics::{ClientMetrics, MetricsSnapshot};
pub use producer::*;
pub use transaction::Transaction;
pub use tokio_util::sync::CancellationToken;

/// Client library result type
pub type Result<T> = std::result::Result<T, KafkaClientError>;

/// Client library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
