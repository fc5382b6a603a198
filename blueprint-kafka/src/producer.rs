//! Producer client for sending records to Kafka

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Span};

use crate::client::{cancellable, ClientSlot, DeliveryFuture, ProducerClient};
use crate::config::{Acks, Compression, ProducerConfig};
use crate::connection;
use crate::error::KafkaClientError;
use crate::logger;
use crate::message::{record_to_message, ProduceResult, Record};
use crate::metrics::{ClientMetrics, Timer};
use crate::Result;

/// High-level producer client for sending records
pub struct Producer {
    pub(crate) config: Arc<ProducerConfig>,
    pub(crate) slot: ClientSlot<dyn ProducerClient>,
    /// Set while a [`crate::Transaction`] of this producer is open
    pub(crate) transaction_active: Arc<AtomicBool>,
    pub(crate) metrics: Arc<ClientMetrics>,
    pub(crate) span: Span,
}

impl Producer {
    /// Create a new producer with the given configuration
    pub async fn new(config: ProducerConfig) -> Result<Self> {
        config.validate()?;
        let client = connection::connect_producer(&config).await?;
        Self::build(config, client, None)
    }

    /// Producer over an existing backend
    pub fn with_client(config: ProducerConfig, client: Arc<dyn ProducerClient>) -> Result<Self> {
        Self::build(config, client, None)
    }

    fn build(config: ProducerConfig, client: Arc<dyn ProducerClient>, parent: Option<&Span>) -> Result<Self> {
        config.validate()?;
        let span = logger::producer_span(parent, &config.default_topic);
        info!(
            parent: &span,
            brokers = %config.base.brokers,
            transactional = config.transactional_id().is_some(),
            "Producer connected"
        );

        Ok(Self {
            config: Arc::new(config),
            slot: ClientSlot::new(client),
            transaction_active: Arc::new(AtomicBool::new(false)),
            metrics: Arc::new(ClientMetrics::default()),
            span,
        })
    }

    pub fn builder() -> ProducerBuilder {
        ProducerBuilder::new()
    }

    pub fn config(&self) -> &ProducerConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<ClientMetrics> {
        self.metrics.clone()
    }

    /// Produce `records` and wait for every acknowledgement.
    ///
    /// Results come back in input order. Per-record failures are reported in
    /// the results; cancelling `token` fails the records still in flight with
    /// `Cancelled` and keeps the ones already acknowledged.
    pub async fn produce<I>(&self, token: &CancellationToken, records: I) -> Result<Vec<ProduceResult>>
    where
        I: IntoIterator<Item = Record>,
    {
        let client = self.slot.snapshot()?;
        if token.is_cancelled() {
            return Err(KafkaClientError::Cancelled);
        }

        let pending: Vec<_> = records
            .into_iter()
            .map(|record| {
                let record = self.resolve_topic(record);
                let delivery = enqueue(client.as_ref(), &record, &self.config.default_topic);
                (record, delivery, Timer::start())
            })
            .collect();

        let mut results = Vec::with_capacity(pending.len());
        for (record, delivery, timer) in pending {
            let outcome = await_delivery(token, delivery).await;
            results.push(complete(&self.metrics, &self.span, record, outcome, timer));
        }
        Ok(results)
    }

    /// Enqueue `record` and return immediately.
    ///
    /// `callback` runs exactly once on the runtime with the delivery report,
    /// also when the producer is closed while the record is in flight. Must be
    /// called from within a Tokio runtime.
    pub fn produce_async<F>(&self, token: &CancellationToken, record: Record, callback: F) -> Result<()>
    where
        F: FnOnce(ProduceResult) + Send + 'static,
    {
        let client = self.slot.snapshot()?;
        if token.is_cancelled() {
            return Err(KafkaClientError::Cancelled);
        }

        let record = self.resolve_topic(record);
        let timer = Timer::start();
        let delivery = enqueue(client.as_ref(), &record, &self.config.default_topic);
        drop(client);

        let token = token.clone();
        let metrics = self.metrics.clone();
        let span = self.span.clone();
        tokio::spawn(async move {
            let outcome = await_delivery(&token, delivery).await;
            let result = complete(&metrics, &span, record, outcome, timer);
            callback(result);
        });
        Ok(())
    }

    /// Serialize `value` as JSON and produce it to the default topic. A failed
    /// delivery is returned as the error.
    pub async fn produce_json<T>(&self, token: &CancellationToken, key: Option<Bytes>, value: &T) -> Result<ProduceResult>
    where
        T: Serialize + ?Sized,
    {
        let record = json_record(key, value)?;
        let mut results = self.produce(token, [record]).await?;
        match results.pop() {
            Some(result) => result.into_result(),
            None => Err(KafkaClientError::MissingTopic),
        }
    }

    /// JSON counterpart of [`Producer::produce_async`]
    pub fn produce_json_async<T, F>(
        &self,
        token: &CancellationToken,
        key: Option<Bytes>,
        value: &T,
        callback: F,
    ) -> Result<()>
    where
        T: Serialize + ?Sized,
        F: FnOnce(ProduceResult) + Send + 'static,
    {
        let record = json_record(key, value)?;
        self.produce_async(token, record, callback)
    }

    /// Wait until every enqueued record is acknowledged or failed
    pub async fn flush(&self, token: &CancellationToken) -> Result<()> {
        let client = self.slot.snapshot()?;
        cancellable(token, client.flush(self.config.delivery_timeout)).await
    }

    /// Flush and release the client. Further calls are no-ops.
    pub async fn close(&self) {
        let Some(client) = self.slot.take() else {
            return;
        };
        client.close(self.config.delivery_timeout).await;
        info!(parent: &self.span, "Producer closed");
    }

    pub fn is_connected(&self) -> bool {
        self.slot.is_connected()
    }

    fn resolve_topic(&self, mut record: Record) -> Record {
        if record.topic.is_empty() {
            record.topic = self.config.default_topic.clone();
        }
        record
    }
}

fn json_record<T: Serialize + ?Sized>(key: Option<Bytes>, value: &T) -> Result<Record> {
    let payload = serde_json::to_vec(value)?;
    Ok(Record {
        key,
        ..Record::new(payload)
    })
}

/// Hand `record` to the client; records without any topic never reach it
pub(crate) fn enqueue(client: &dyn ProducerClient, record: &Record, default_topic: &str) -> Result<DeliveryFuture> {
    if record.topic.is_empty() && default_topic.is_empty() {
        return Err(KafkaClientError::MissingTopic);
    }
    Ok(client.send(record_to_message(record, default_topic)))
}

async fn await_delivery(token: &CancellationToken, delivery: Result<DeliveryFuture>) -> Result<(i32, i64)> {
    cancellable(token, delivery?).await
}

/// Turn a delivery outcome into a [`ProduceResult`], counting and logging it
pub(crate) fn complete(
    metrics: &ClientMetrics,
    span: &Span,
    record: Record,
    outcome: Result<(i32, i64)>,
    timer: Timer,
) -> ProduceResult {
    match outcome {
        Ok((partition, offset)) => {
            metrics.record_produce(record.size() as u64, timer.elapsed());
            ProduceResult::delivered(record, partition, offset)
        }
        Err(err) => {
            metrics.record_produce_error();
            error!(
                parent: span,
                kafka_topic = %record.topic,
                kafka_partition = record.partition,
                error = %err,
                "Failed to produce record"
            );
            ProduceResult::failed(record, err)
        }
    }
}

/// Builder for Producer
pub struct ProducerBuilder {
    config: ProducerConfig,
    parent: Option<Span>,
    client: Option<Arc<dyn ProducerClient>>,
}

impl ProducerBuilder {
    /// Create a new producer builder
    pub fn new() -> Self {
        Self {
            config: ProducerConfig::default(),
            parent: None,
            client: None,
        }
    }

    /// Start from an existing configuration
    pub fn config(mut self, config: ProducerConfig) -> Self {
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

    pub fn default_topic<S: Into<String>>(mut self, topic: S) -> Self {
        self.config.default_topic = topic.into();
        self
    }

    /// Set the acknowledgment level
    pub fn acks(mut self, acks: Acks) -> Self {
        self.config.acks = acks;
        self
    }

    pub fn compression(mut self, compression: Compression) -> Self {
        self.config.compression = compression;
        self
    }

    pub fn transactional_id<S: Into<String>>(mut self, id: S) -> Self {
        self.config.transactional_id = Some(id.into());
        self
    }

    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.config.idempotent = idempotent;
        self
    }

    pub fn linger(mut self, linger: Duration) -> Self {
        self.config.linger = linger;
        self
    }

    /// Set the delivery timeout
    pub fn delivery_timeout(mut self, timeout: Duration) -> Self {
        self.config.delivery_timeout = timeout;
        self
    }

    /// Parent span for the producer's log events
    pub fn span(mut self, parent: Span) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Use `client` instead of connecting with librdkafka
    pub fn client(mut self, client: Arc<dyn ProducerClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Build the producer
    pub async fn build(self) -> Result<Producer> {
        let client = match self.client {
            Some(client) => client,
            None => {
                self.config.validate()?;
                connection::connect_producer(&self.config).await?
            }
        };
        Producer::build(self.config, client, self.parent.as_ref())
    }
}

impl Default for ProducerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;

    async fn producer(broker: &MemoryBroker, default_topic: &str) -> Producer {
        let config = ProducerConfig {
            default_topic: default_topic.to_string(),
            ..ProducerConfig::new("localhost:9092")
        };
        Producer::builder()
            .config(config.clone())
            .client(broker.producer_client(&config))
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_produce_uses_default_topic() {
        let broker = MemoryBroker::new();
        let producer = producer(&broker, "events").await;
        let token = CancellationToken::new();

        let results = producer
            .produce(&token, [Record::new("a"), Record::new("b").with_topic("other")])
            .await
            .unwrap();

        assert!(results.iter().all(ProduceResult::is_ok));
        assert_eq!(results[0].record.topic, "events");
        assert_eq!(results[1].record.topic, "other");
        assert_eq!(broker.high_watermark("events", 0), Some(1));
        assert_eq!(producer.metrics().snapshot().records_produced, 2);
    }

    #[tokio::test]
    async fn test_missing_topic_is_per_record() {
        let broker = MemoryBroker::new();
        let producer = producer(&broker, "").await;
        let token = CancellationToken::new();

        let results = producer
            .produce(&token, [Record::new("a"), Record::new("b").with_topic("t")])
            .await
            .unwrap();

        assert!(matches!(results[0].error, Some(KafkaClientError::MissingTopic)));
        assert!(results[1].is_ok());
        assert_eq!(producer.metrics().snapshot().produce_errors, 1);
    }

    #[tokio::test]
    async fn test_cancelled_token() {
        let broker = MemoryBroker::new();
        let producer = producer(&broker, "t").await;
        let token = CancellationToken::new();
        token.cancel();

        let result = producer.produce(&token, [Record::new("a")]).await;
        assert!(matches!(result, Err(KafkaClientError::Cancelled)));
        assert!(matches!(producer.flush(&token).await, Err(KafkaClientError::Cancelled)));
    }

    #[tokio::test]
    async fn test_json_marshal_error_before_io() {
        let broker = MemoryBroker::new();
        let producer = producer(&broker, "t").await;
        let token = CancellationToken::new();

        // Maps with non-string keys cannot be encoded as JSON objects.
        let value: std::collections::HashMap<(i32, i32), i32> = [((1, 2), 3)].into_iter().collect();
        let result = producer.produce_json(&token, None, &value).await;
        assert!(matches!(result, Err(KafkaClientError::Json(_))));
        assert_eq!(broker.high_watermark("t", 0), None);

        let result = producer
            .produce_json(&token, Some(Bytes::from_static(b"k")), &serde_json::json!({"id": 1}))
            .await
            .unwrap();
        assert_eq!(result.offset, 0);
        assert_eq!(result.record.key.as_deref(), Some(&b"k"[..]));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let broker = MemoryBroker::new();
        let producer = producer(&broker, "t").await;
        let token = CancellationToken::new();

        assert!(producer.is_connected());
        producer.close().await;
        producer.close().await;
        assert!(!producer.is_connected());

        let result = producer.produce(&token, [Record::new("a")]).await;
        assert!(matches!(result, Err(KafkaClientError::ClientClosed)));
        let result = producer.produce_async(&token, Record::new("a"), |_| {});
        assert!(matches!(result, Err(KafkaClientError::ClientClosed)));
    }

    #[tokio::test]
    async fn test_async_callback() {
        let broker = MemoryBroker::new();
        let producer = producer(&broker, "t").await;
        let token = CancellationToken::new();

        let (tx, rx) = tokio::sync::oneshot::channel();
        producer
            .produce_async(&token, Record::new("a"), move |result| {
                let _ = tx.send(result);
            })
            .unwrap();

        let result = rx.await.unwrap();
        assert!(result.is_ok());
        assert_eq!((result.partition, result.offset), (0, 0));
    }

    #[test]
    fn test_producer_builder() {
        let builder = ProducerBuilder::new()
            .brokers(["a:9092", "b:9092"])
            .acks(Acks::All)
            .compression(Compression::Zstd)
            .transactional_id("tx")
            .linger(Duration::from_millis(5));

        assert_eq!(builder.config.base.brokers, "a:9092,b:9092");
        assert_eq!(builder.config.acks, Acks::All);
        assert_eq!(builder.config.transactional_id(), Some("tx"));
    }
}
