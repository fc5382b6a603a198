//! Consumer client for receiving records from Kafka

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Span};

use crate::client::{cancellable, ClientSlot, CommitOffset, ConsumerClient, Fetches};
use crate::config::{ConsumerConfig, IsolationLevel, StartOffset};
use crate::connection;
use crate::error::KafkaClientError;
use crate::logger;
use crate::message::{fetches_to_result, Batch, ConsumedRecord, FetchResult, TopicPartitions};
use crate::metrics::ClientMetrics;
use crate::Result;

/// High-level consumer client for receiving records
pub struct Consumer {
    config: Arc<ConsumerConfig>,
    slot: ClientSlot<dyn ConsumerClient>,
    metrics: Arc<ClientMetrics>,
    span: Span,
}

impl Consumer {
    /// Create a new consumer with the given configuration
    pub async fn new(config: ConsumerConfig) -> Result<Self> {
        config.validate()?;
        let client = connection::connect_consumer(&config).await?;
        Self::build(config, client, None)
    }

    /// Consumer over an existing backend
    pub fn with_client(config: ConsumerConfig, client: Arc<dyn ConsumerClient>) -> Result<Self> {
        Self::build(config, client, None)
    }

    fn build(config: ConsumerConfig, client: Arc<dyn ConsumerClient>, parent: Option<&Span>) -> Result<Self> {
        config.validate()?;
        let span = logger::consumer_span(parent, &config.topics, &config.group);
        info!(parent: &span, brokers = %config.base.brokers, "Consumer connected");

        Ok(Self {
            config: Arc::new(config),
            slot: ClientSlot::new(client),
            metrics: Arc::new(ClientMetrics::default()),
            span,
        })
    }

    pub fn builder() -> ConsumerBuilder {
        ConsumerBuilder::new()
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<ClientMetrics> {
        self.metrics.clone()
    }

    /// Fetch one round.
    ///
    /// Waits until records are available, a fetch fails or `token` is
    /// cancelled; cancellation shows up as a `Cancelled` fetch error.
    pub async fn poll(&self, token: &CancellationToken) -> Result<FetchResult> {
        self.fetch(token, self.config.max_poll_records).await
    }

    /// Like [`Consumer::poll`] with at most `max` records; any fetch error is
    /// returned as the error
    pub async fn poll_records(&self, token: &CancellationToken, max: usize) -> Result<Vec<ConsumedRecord>> {
        let mut result = self.fetch(token, max).await?;
        if !result.errors.is_empty() {
            return Err(result.errors.swap_remove(0).error);
        }
        Ok(result.into_records())
    }

    async fn fetch(&self, token: &CancellationToken, max: usize) -> Result<FetchResult> {
        let client = self.slot.snapshot()?;
        let fetches = tokio::select! {
            biased;
            _ = token.cancelled() => Fetches::from_error(KafkaClientError::Cancelled),
            fetches = client.poll_fetches(max) => fetches,
        };

        let result = fetches_to_result(fetches);
        let bytes = result
            .batches
            .iter()
            .flat_map(|batch| &batch.records)
            .map(|record| record.size() as u64)
            .sum::<u64>();
        self.metrics
            .record_poll(result.record_count() as u64, bytes, result.errors.len() as u64);
        Ok(result)
    }

    /// Next poll of a consume loop, raw; `None` ends the loop cleanly
    async fn next_fetch(&self, token: &CancellationToken) -> Result<Option<FetchResult>> {
        if token.is_cancelled() {
            info!(parent: &self.span, "Stopping consumer: context cancelled");
            return Ok(None);
        }
        let result = match self.poll(token).await {
            Ok(result) => result,
            Err(err) if err.is_closed() => {
                info!(parent: &self.span, reason = %err, "Stopping consumer");
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        if let Some(closed) = result.errors.iter().find(|e| e.error.is_closed()) {
            info!(parent: &self.span, reason = %closed.error, "Stopping consumer");
            return Ok(None);
        }
        Ok(Some(result))
    }

    /// Next poll of a record or batch loop; fetch errors end the loop
    async fn next_records(&self, token: &CancellationToken) -> Result<Option<FetchResult>> {
        let Some(mut result) = self.next_fetch(token).await? else {
            return Ok(None);
        };
        if result.errors.is_empty() {
            return Ok(Some(result));
        }

        let fetch_error = result.errors.swap_remove(0);
        error!(
            parent: &self.span,
            kafka_topic = %fetch_error.topic,
            kafka_partition = fetch_error.partition,
            error = %fetch_error.error,
            "Fetch error"
        );
        Err(fetch_error.error)
    }

    /// Call `handler` for every record, in offset order per partition.
    ///
    /// Returns `Ok` when `token` is cancelled or the consumer is closed, and
    /// the error otherwise when a fetch or the handler fails.
    pub async fn consume<H, Fut>(&self, token: &CancellationToken, mut handler: H) -> Result<()>
    where
        H: FnMut(ConsumedRecord) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        while let Some(result) = self.next_records(token).await? {
            for record in result.into_records() {
                let (topic, partition, offset) = (record.topic.clone(), record.partition, record.offset);
                if let Err(err) = handler(record).await {
                    error!(
                        parent: &self.span,
                        kafka_topic = %topic,
                        kafka_partition = partition,
                        kafka_offset = offset,
                        error = %err,
                        "Record handler failed"
                    );
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Like [`Consumer::consume`], one partition's batch at a time
    pub async fn consume_batches<H, Fut>(&self, token: &CancellationToken, mut handler: H) -> Result<()>
    where
        H: FnMut(Batch) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        while let Some(result) = self.next_records(token).await? {
            for batch in result.batches {
                let (topic, partition, offset) = (batch.topic.clone(), batch.partition, batch.first_offset());
                if let Err(err) = handler(batch).await {
                    error!(
                        parent: &self.span,
                        kafka_topic = %topic,
                        kafka_partition = partition,
                        kafka_offset = offset,
                        error = %err,
                        "Batch handler failed"
                    );
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Hand every poll's whole result, errors included, to `handler`
    pub async fn consume_fetches<H, Fut>(&self, token: &CancellationToken, mut handler: H) -> Result<()>
    where
        H: FnMut(FetchResult) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        while let Some(result) = self.next_fetch(token).await? {
            if let Err(err) = handler(result).await {
                error!(parent: &self.span, error = %err, "Fetch handler failed");
                return Err(err);
            }
        }
        Ok(())
    }

    /// Send every record to `sender`. A dropped receiver ends the loop cleanly.
    pub async fn consume_channel(&self, token: &CancellationToken, sender: mpsc::Sender<ConsumedRecord>) -> Result<()> {
        while let Some(result) = self.next_records(token).await? {
            for record in result.into_records() {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        info!(parent: &self.span, "Stopping consumer: context cancelled");
                        return Ok(());
                    }
                    sent = sender.send(record) => {
                        if sent.is_err() {
                            info!(parent: &self.span, "Record channel closed, stopping consumer");
                            return Ok(());
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Commit the positions of everything polled so far
    pub async fn commit_offsets(&self, token: &CancellationToken) -> Result<()> {
        let client = self.slot.snapshot()?;
        self.require_group()?;
        let result = cancellable(token, client.commit_uncommitted_offsets()).await;
        self.record_commit(result)
    }

    /// Commit `record` as processed; the group resumes after it
    pub async fn commit_record(&self, token: &CancellationToken, record: &ConsumedRecord) -> Result<()> {
        let offsets = [CommitOffset {
            topic: record.topic.clone(),
            partition: record.partition,
            offset: record.offset + 1,
            leader_epoch: record.leader_epoch,
        }];
        let client = self.slot.snapshot()?;
        self.require_group()?;
        let result = cancellable(token, client.commit_offsets(&offsets)).await;
        debug!(
            parent: &self.span,
            kafka_topic = %record.topic,
            kafka_partition = record.partition,
            kafka_offset = record.offset,
            "Committed record"
        );
        self.record_commit(result)
    }

    /// Commit the last record of `batch`; an empty batch commits nothing
    pub async fn commit_batch(&self, token: &CancellationToken, batch: &Batch) -> Result<()> {
        match batch.last() {
            Some(record) => self.commit_record(token, record).await,
            None => Ok(()),
        }
    }

    fn require_group(&self) -> Result<()> {
        match self.config.group_id() {
            Some(_) => Ok(()),
            None => Err(KafkaClientError::MissingGroup),
        }
    }

    fn record_commit(&self, result: Result<()>) -> Result<()> {
        self.metrics.record_commit(result.is_ok());
        if let Err(err) = &result {
            error!(parent: &self.span, error = %err, "Failed to commit offsets");
        }
        result
    }

    /// Stop fetching from `topics` without leaving the group
    pub fn pause<I, S>(&self, topics: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let topics: Vec<String> = topics.into_iter().map(Into::into).collect();
        self.slot.snapshot()?.pause_topics(&topics)?;
        info!(parent: &self.span, kafka_topics = %topics.join(","), "Paused topics");
        Ok(())
    }

    pub fn resume<I, S>(&self, topics: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let topics: Vec<String> = topics.into_iter().map(Into::into).collect();
        self.slot.snapshot()?.resume_topics(&topics)?;
        info!(parent: &self.span, kafka_topics = %topics.join(","), "Resumed topics");
        Ok(())
    }

    pub fn pause_partitions(&self, partitions: &TopicPartitions) -> Result<()> {
        self.slot.snapshot()?.pause_partitions(partitions)?;
        info!(parent: &self.span, partitions = ?partitions, "Paused partitions");
        Ok(())
    }

    pub fn resume_partitions(&self, partitions: &TopicPartitions) -> Result<()> {
        self.slot.snapshot()?.resume_partitions(partitions)?;
        info!(parent: &self.span, partitions = ?partitions, "Resumed partitions");
        Ok(())
    }

    /// Leave the group and release the client. Further calls are no-ops.
    pub async fn close(&self) {
        let Some(client) = self.slot.take() else {
            return;
        };
        client.close().await;
        info!(parent: &self.span, "Consumer closed");
    }

    pub fn is_connected(&self) -> bool {
        self.slot.is_connected()
    }
}

/// Builder for Consumer
pub struct ConsumerBuilder {
    config: ConsumerConfig,
    parent: Option<Span>,
    client: Option<Arc<dyn ConsumerClient>>,
}

impl ConsumerBuilder {
    /// Create a new consumer builder
    pub fn new() -> Self {
        Self {
            config: ConsumerConfig::default(),
            parent: None,
            client: None,
        }
    }

    /// Start from an existing configuration
    pub fn config(mut self, config: ConsumerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the broker addresses
    pub fn brokers<I, S>(mut self, brokers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.config.base.brokers = brokers
            .into_iter()
            .map(|b| b.as_ref().to_string())
            .collect::<Vec<_>>()
            .join(",");
        self
    }

    pub fn client_id<S: Into<String>>(mut self, client_id: S) -> Self {
        self.config.base.client_id = client_id.into();
        self
    }

    /// Set the consumer group ID
    pub fn group_id<S: Into<String>>(mut self, group_id: S) -> Self {
        self.config.group = group_id.into();
        self
    }

    /// Set the topics to consume from
    pub fn topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.topics = topics.into_iter().map(Into::into).collect();
        self
    }

    pub fn start_offset(mut self, start_offset: StartOffset) -> Self {
        self.config.start_offset = start_offset;
        self
    }

    pub fn isolation_level(mut self, isolation_level: IsolationLevel) -> Self {
        self.config.isolation_level = isolation_level;
        self
    }

    pub fn auto_commit(mut self, enabled: bool) -> Self {
        self.config.auto_commit = enabled;
        self
    }

    /// Set the session timeout
    pub fn session_timeout(mut self, timeout: Duration) -> Self {
        self.config.session_timeout = timeout;
        self
    }

    /// Set the maximum poll records
    pub fn max_poll_records(mut self, max_records: usize) -> Self {
        self.config.max_poll_records = max_records;
        self
    }

    /// Parent span for the consumer's log events
    pub fn span(mut self, parent: Span) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Use `client` instead of connecting with librdkafka
    pub fn client(mut self, client: Arc<dyn ConsumerClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Build the consumer
    pub async fn build(self) -> Result<Consumer> {
        let client = match self.client {
            Some(client) => client,
            None => {
                self.config.validate()?;
                connection::connect_consumer(&self.config).await?
            }
        };
        Consumer::build(self.config, client, self.parent.as_ref())
    }
}

impl Default for ConsumerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
