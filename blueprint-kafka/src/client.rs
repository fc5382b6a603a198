//! Backend interfaces behind the producer, consumer and admin facades
//!
//! The facades own exactly one backend each. [`crate::connection`] provides
//! the librdkafka implementations, [`crate::memory`] an in-process broker.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use rdkafka::error::RDKafkaErrorCode;
use rdkafka::message::OwnedMessage;
use tokio_util::sync::CancellationToken;

use crate::admin::{BrokerInfo, GroupInfo, TopicConfig, TopicInfo};
use crate::error::KafkaClientError;
use crate::message::{FetchError, TopicPartitions};
use crate::Result;

/// Resolves with the `(partition, offset)` a message was written at
pub type DeliveryFuture = BoxFuture<'static, Result<(i32, i64)>>;

/// How a transaction ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionEnd {
    Commit,
    Abort,
}

impl fmt::Display for TransactionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Commit => f.write_str("commit"),
            Self::Abort => f.write_str("abort"),
        }
    }
}

/// Raw outcome of one poll: messages in arrival order plus errors
#[derive(Debug, Default)]
pub struct Fetches {
    pub messages: Vec<OwnedMessage>,
    pub errors: Vec<FetchError>,
    /// Current leader epoch per `(topic, partition)`, where known
    pub leader_epochs: HashMap<(String, i32), i32>,
}

impl Fetches {
    /// A poll that produced nothing but `error`
    pub fn from_error(error: KafkaClientError) -> Self {
        Self {
            errors: vec![FetchError::client(error)],
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.errors.is_empty()
    }
}

/// Offset to commit for one partition; `offset` is the next one to read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOffset {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub leader_epoch: Option<i32>,
}

/// Per-item outcome of a batched admin request
#[derive(Debug)]
pub struct ItemResult {
    pub name: String,
    pub error: Option<KafkaClientError>,
}

impl ItemResult {
    pub fn ok<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            error: None,
        }
    }

    pub fn failed<S: Into<String>>(name: S, error: KafkaClientError) -> Self {
        Self {
            name: name.into(),
            error: Some(error),
        }
    }
}

/// Brokers and topics known to the cluster
#[derive(Debug, Clone, Default)]
pub struct ClusterMetadata {
    pub brokers: Vec<BrokerInfo>,
    pub topics: Vec<TopicInfo>,
    /// Topics that were requested but reported an error
    pub missing: Vec<(String, RDKafkaErrorCode)>,
}

impl ClusterMetadata {
    /// Keep only `topics`, in request order; requested topics the cluster
    /// does not report become `UnknownTopicOrPartition`. An empty request
    /// keeps everything.
    pub fn select(mut self, topics: &[String]) -> Self {
        if topics.is_empty() {
            return self;
        }
        let mut known: HashMap<String, TopicInfo> =
            self.topics.drain(..).map(|topic| (topic.name.clone(), topic)).collect();
        let mut failed: HashMap<String, RDKafkaErrorCode> = self.missing.drain(..).collect();

        for name in topics {
            if let Some(topic) = known.remove(name) {
                self.topics.push(topic);
            } else {
                let code = failed.remove(name).unwrap_or(RDKafkaErrorCode::UnknownTopicOrPartition);
                self.missing.push((name.clone(), code));
            }
        }
        self
    }
}

/// Producing side of a backend
#[async_trait]
pub trait ProducerClient: Send + Sync {
    /// Hand `message` to the client. Messages are enqueued in call order; the
    /// returned future resolves once the broker acknowledged or rejected it.
    fn send(&self, message: OwnedMessage) -> DeliveryFuture;

    /// Wait until every enqueued message has been delivered or failed
    async fn flush(&self, timeout: Duration) -> Result<()>;

    async fn begin_transaction(&self) -> Result<()>;

    async fn end_transaction(&self, end: TransactionEnd, timeout: Duration) -> Result<()>;

    /// Drop messages that were enqueued but not yet sent
    async fn abort_buffered_records(&self) -> Result<()>;

    /// Flush outstanding messages and release the connection
    async fn close(&self, timeout: Duration);
}

/// Consuming side of a backend
#[async_trait]
pub trait ConsumerClient: Send + Sync {
    /// Wait for messages and return up to `max_records` of them. Returns a
    /// `ClientClosed` error once the client is closed, also to a poll that is
    /// already waiting.
    async fn poll_fetches(&self, max_records: usize) -> Fetches;

    /// Commit the positions of everything returned by previous polls
    async fn commit_uncommitted_offsets(&self) -> Result<()>;

    async fn commit_offsets(&self, offsets: &[CommitOffset]) -> Result<()>;

    fn pause_topics(&self, topics: &[String]) -> Result<()>;

    fn resume_topics(&self, topics: &[String]) -> Result<()>;

    fn pause_partitions(&self, partitions: &TopicPartitions) -> Result<()>;

    fn resume_partitions(&self, partitions: &TopicPartitions) -> Result<()>;

    /// Leave the group and release the connection
    async fn close(&self);
}

/// Cluster administration side of a backend
#[async_trait]
pub trait AdminClient: Send + Sync {
    async fn create_topics(&self, topics: &[TopicConfig]) -> Result<Vec<ItemResult>>;

    async fn delete_topics(&self, topics: &[String]) -> Result<Vec<ItemResult>>;

    /// Metadata for `topics`, or for every topic when empty
    async fn metadata(&self, topics: &[String]) -> Result<ClusterMetadata>;

    async fn list_groups(&self) -> Result<Vec<GroupInfo>>;

    async fn describe_groups(&self, groups: &[String]) -> Result<Vec<GroupInfo>>;

    async fn delete_groups(&self, groups: &[String]) -> Result<Vec<ItemResult>>;

    async fn close(&self);
}

/// The backend of a facade together with its closed flag.
///
/// Operations copy the backend handle out under the read lock and do their
/// I/O after releasing it; `close` takes the handle out under the write lock.
pub(crate) struct ClientSlot<C: ?Sized> {
    state: RwLock<SlotState<C>>,
}

struct SlotState<C: ?Sized> {
    client: Option<Arc<C>>,
    closed: bool,
}

impl<C: ?Sized> ClientSlot<C> {
    pub(crate) fn new(client: Arc<C>) -> Self {
        Self {
            state: RwLock::new(SlotState {
                client: Some(client),
                closed: false,
            }),
        }
    }

    /// The backend, or `ClientClosed`
    pub(crate) fn snapshot(&self) -> Result<Arc<C>> {
        let state = self.state.read();
        match (&state.client, state.closed) {
            (Some(client), false) => Ok(client.clone()),
            _ => Err(KafkaClientError::ClientClosed),
        }
    }

    /// Mark closed and hand out the backend; `None` when already closed
    pub(crate) fn take(&self) -> Option<Arc<C>> {
        let mut state = self.state.write();
        state.closed = true;
        state.client.take()
    }

    pub(crate) fn is_connected(&self) -> bool {
        let state = self.state.read();
        !state.closed && state.client.is_some()
    }
}

/// Run `operation` unless `token` fires first
pub(crate) async fn cancellable<T, F>(token: &CancellationToken, operation: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(KafkaClientError::Cancelled),
        result = operation => result,
    }
}
