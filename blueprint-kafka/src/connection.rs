//! librdkafka-backed clients
//!
//! librdkafka runs its own threads; calls that block on them are moved off the
//! async workers with `spawn_blocking`.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use parking_lot::Mutex;
use rdkafka::admin::{AdminClient as RdAdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::{ClientContext, OAuthToken};
use rdkafka::config::{ClientConfig, RDKafkaLogLevel};
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, StreamConsumer};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::message::{Message, OwnedMessage};
use rdkafka::metadata::Metadata;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer, PurgeConfig};
use rdkafka::{Offset, TopicPartitionList};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::admin::{BrokerInfo, GroupInfo, GroupMember, PartitionInfo, TopicConfig, TopicInfo};
use crate::client::{
    AdminClient, ClusterMetadata, CommitOffset, ConsumerClient, DeliveryFuture, Fetches,
    ItemResult, ProducerClient, TransactionEnd,
};
use crate::config::{AdminConfig, AuthType, BaseConfig, ConsumerConfig, ProducerConfig, StartOffset};
use crate::error::KafkaClientError;
use crate::iam::{self, AwsCredentials};
use crate::message::{FetchError, TopicPartitions};
use crate::Result;

const QUEUE_FULL_BACKOFF_MIN: Duration = Duration::from_millis(1);
const QUEUE_FULL_BACKOFF_MAX: Duration = Duration::from_millis(100);

fn join_error(err: JoinError) -> KafkaClientError {
    KafkaClientError::Io(io::Error::new(io::ErrorKind::Other, err))
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> KafkaResult<T> + Send + 'static,
    T: Send + 'static,
{
    Ok(tokio::task::spawn_blocking(f).await.map_err(join_error)??)
}

fn forward_log(component: &'static str, level: RDKafkaLogLevel, facility: &str, message: &str) {
    match level {
        RDKafkaLogLevel::Emerg
        | RDKafkaLogLevel::Alert
        | RDKafkaLogLevel::Critical
        | RDKafkaLogLevel::Error => error!(component, facility, "{}", message),
        RDKafkaLogLevel::Warning => warn!(component, facility, "{}", message),
        RDKafkaLogLevel::Notice | RDKafkaLogLevel::Info => info!(component, facility, "{}", message),
        RDKafkaLogLevel::Debug => debug!(component, facility, "{}", message),
    }
}

/// Client context forwarding librdkafka logs and errors to `tracing`
#[derive(Debug, Clone)]
pub struct KafkaContext {
    component: &'static str,
}

impl KafkaContext {
    pub fn new(component: &'static str) -> Self {
        Self { component }
    }
}

impl ClientContext for KafkaContext {
    fn log(&self, level: RDKafkaLogLevel, fac: &str, log_message: &str) {
        forward_log(self.component, level, fac, log_message);
    }

    fn error(&self, error: KafkaError, reason: &str) {
        error!(component = self.component, error = %error, "librdkafka error: {}", reason);
    }
}

impl ConsumerContext for KafkaContext {}

/// Client context that also signs AWS MSK IAM tokens when librdkafka asks
pub struct IamContext {
    component: &'static str,
    region: String,
    credentials: AwsCredentials,
}

impl IamContext {
    pub fn new(base: &BaseConfig, component: &'static str) -> Result<Self> {
        Ok(Self {
            component,
            region: base.aws_region.clone(),
            credentials: AwsCredentials::resolve(base)?,
        })
    }
}

impl fmt::Debug for IamContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IamContext")
            .field("component", &self.component)
            .field("region", &self.region)
            .field("credentials", &self.credentials)
            .finish()
    }
}

impl ClientContext for IamContext {
    const ENABLE_REFRESH_OAUTH_TOKEN: bool = true;

    fn log(&self, level: RDKafkaLogLevel, fac: &str, log_message: &str) {
        forward_log(self.component, level, fac, log_message);
    }

    fn error(&self, error: KafkaError, reason: &str) {
        error!(component = self.component, error = %error, "librdkafka error: {}", reason);
    }

    fn generate_oauth_token(
        &self,
        _oauthbearer_config: Option<&str>,
    ) -> std::result::Result<OAuthToken, Box<dyn std::error::Error>> {
        let token = iam::sign_token(&self.region, &self.credentials, Utc::now())?;
        debug!(component = self.component, region = %self.region, "Signed MSK IAM token");
        Ok(OAuthToken {
            token: token.token,
            principal_name: self.credentials.access_key.clone(),
            lifetime_ms: token.expires_at_ms,
        })
    }
}

impl ConsumerContext for IamContext {}

/// Connect a producer backend for `config`
pub async fn connect_producer(config: &ProducerConfig) -> Result<Arc<dyn ProducerClient>> {
    let properties = config.client_config()?;
    let init_timeout = config.transactional_id().map(|_| config.base.request_timeout);

    let client: Arc<dyn ProducerClient> = if config.base.auth_type == AuthType::AwsMskIam {
        let context = IamContext::new(&config.base, "producer")?;
        Arc::new(KafkaProducerClient::connect(&properties, context, init_timeout, config.delivery_timeout).await?)
    } else {
        let context = KafkaContext::new("producer");
        Arc::new(KafkaProducerClient::connect(&properties, context, init_timeout, config.delivery_timeout).await?)
    };
    Ok(client)
}

/// Connect a consumer backend for `config`
pub async fn connect_consumer(config: &ConsumerConfig) -> Result<Arc<dyn ConsumerClient>> {
    let properties = config.client_config()?;

    let client: Arc<dyn ConsumerClient> = if config.base.auth_type == AuthType::AwsMskIam {
        let context = IamContext::new(&config.base, "consumer")?;
        Arc::new(KafkaConsumerClient::connect(config, &properties, context).await?)
    } else {
        let context = KafkaContext::new("consumer");
        Arc::new(KafkaConsumerClient::connect(config, &properties, context).await?)
    };
    Ok(client)
}

/// Connect an admin backend for `config`
pub async fn connect_admin(config: &AdminConfig) -> Result<Arc<dyn AdminClient>> {
    let properties = config.client_config()?;
    let timeout = config.base.request_timeout;

    let client: Arc<dyn AdminClient> = if config.base.auth_type == AuthType::AwsMskIam {
        let context = IamContext::new(&config.base, "admin")?;
        Arc::new(KafkaAdminClient::connect(&properties, context, timeout)?)
    } else {
        Arc::new(KafkaAdminClient::connect(&properties, KafkaContext::new("admin"), timeout)?)
    };
    Ok(client)
}

fn future_record(message: &OwnedMessage) -> FutureRecord<'_, [u8], [u8]> {
    let mut record = FutureRecord::to(message.topic());
    if let Some(key) = message.key() {
        record = record.key(key);
    }
    if let Some(payload) = message.payload() {
        record = record.payload(payload);
    }
    if message.partition() >= 0 {
        record = record.partition(message.partition());
    }
    if let Some(timestamp) = message.timestamp().to_millis() {
        record = record.timestamp(timestamp);
    }
    if let Some(headers) = message.headers() {
        record = record.headers(headers.clone());
    }
    record
}

/// Producer backed by an rdkafka `FutureProducer`
pub struct KafkaProducerClient<C: ClientContext + 'static> {
    producer: FutureProducer<C>,
    queue_timeout: Duration,
}

impl<C: ClientContext + 'static> KafkaProducerClient<C> {
    /// Create the producer; transactional producers are initialised with the
    /// coordinator before this returns.
    pub async fn connect(
        properties: &ClientConfig,
        context: C,
        init_transactions: Option<Duration>,
        queue_timeout: Duration,
    ) -> Result<Self> {
        let producer: FutureProducer<C> = properties.create_with_context(context)?;

        if let Some(timeout) = init_transactions {
            let handle = producer.clone();
            blocking(move || handle.init_transactions(timeout)).await?;
            info!("Transactional producer initialized");
        }

        Ok(Self {
            producer,
            queue_timeout,
        })
    }
}

/// Block the calling thread for `pause` without stalling other tasks of a
/// multi-threaded runtime
fn wait_for_room(pause: Duration) {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(|| std::thread::sleep(pause))
        }
        _ => std::thread::sleep(pause),
    }
}

#[async_trait]
impl<C: ClientContext + 'static> ProducerClient for KafkaProducerClient<C> {
    /// A full local queue blocks the caller until librdkafka has room, so a
    /// message is always queued before the next one is handed over.
    fn send(&self, message: OwnedMessage) -> DeliveryFuture {
        let started = Instant::now();
        let mut pause = QUEUE_FULL_BACKOFF_MIN;
        let enqueued = loop {
            match self.producer.send_result(future_record(&message)) {
                Err((KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull), _))
                    if started.elapsed() < self.queue_timeout =>
                {
                    wait_for_room(pause);
                    pause = (pause * 2).min(QUEUE_FULL_BACKOFF_MAX);
                }
                other => break other.map_err(|(err, _)| err),
            }
        };

        match enqueued {
            Ok(delivery) => async move {
                match delivery.await {
                    Ok(Ok((partition, offset))) => Ok((partition, offset)),
                    Ok(Err((err, _))) => Err(err.into()),
                    Err(_) => Err(KafkaClientError::ClientClosed),
                }
            }
            .boxed(),
            Err(err) => {
                if matches!(err, KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull)) {
                    warn!(
                        kafka_topic = %message.topic(),
                        waited_ms = started.elapsed().as_millis() as u64,
                        "Producer queue still full, giving up on record"
                    );
                }
                futures::future::ready(Err(err.into())).boxed()
            }
        }
    }

    async fn flush(&self, timeout: Duration) -> Result<()> {
        let producer = self.producer.clone();
        blocking(move || producer.flush(timeout)).await
    }

    async fn begin_transaction(&self) -> Result<()> {
        Ok(self.producer.begin_transaction()?)
    }

    async fn end_transaction(&self, end: TransactionEnd, timeout: Duration) -> Result<()> {
        let producer = self.producer.clone();
        match end {
            TransactionEnd::Commit => blocking(move || producer.commit_transaction(timeout)).await,
            TransactionEnd::Abort => blocking(move || producer.abort_transaction(timeout)).await,
        }
    }

    async fn abort_buffered_records(&self) -> Result<()> {
        self.producer.purge(PurgeConfig::default().queue());
        Ok(())
    }

    async fn close(&self, timeout: Duration) {
        if let Err(err) = self.flush(timeout).await {
            warn!(error = %err, "Failed to flush producer on close");
        }
    }
}

/// Consumer backed by an rdkafka `StreamConsumer`
pub struct KafkaConsumerClient<C: ConsumerContext + 'static> {
    consumer: Arc<StreamConsumer<C>>,
    grouped: bool,
    paused_topics: Mutex<HashSet<String>>,
    closed: CancellationToken,
}

impl<C: ConsumerContext + 'static> KafkaConsumerClient<C> {
    /// Create the consumer and subscribe it, or assign every partition of the
    /// configured topics when no group is set
    pub async fn connect(config: &ConsumerConfig, properties: &ClientConfig, context: C) -> Result<Self> {
        let consumer: Arc<StreamConsumer<C>> = Arc::new(properties.create_with_context(context)?);
        let grouped = config.group_id().is_some();

        if grouped {
            let topics: Vec<&str> = config.topics.iter().map(String::as_str).collect();
            consumer.subscribe(&topics)?;
        } else {
            let handle = consumer.clone();
            let topics = config.topics.clone();
            let start = config.start_offset;
            let timeout = config.base.request_timeout;
            blocking(move || assign_all(handle.as_ref(), &topics, start, timeout)).await?;
        }

        Ok(Self {
            consumer,
            grouped,
            paused_topics: Mutex::new(HashSet::new()),
            closed: CancellationToken::new(),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(KafkaClientError::ClientClosed);
        }
        Ok(())
    }

    /// Assigned partitions of `topics`
    fn assigned(&self, topics: &HashSet<String>) -> Result<TopicPartitionList> {
        let assignment = self.consumer.assignment()?;
        let mut selected = TopicPartitionList::new();
        for elem in assignment.elements() {
            if topics.contains(elem.topic()) {
                selected.add_partition(elem.topic(), elem.partition());
            }
        }
        Ok(selected)
    }

    /// Partitions assigned after a pause (rebalance) are paused as well
    fn apply_paused(&self) -> Result<()> {
        let paused = self.paused_topics.lock().clone();
        if paused.is_empty() {
            return Ok(());
        }
        let partitions = self.assigned(&paused)?;
        if partitions.count() > 0 {
            self.consumer.pause(&partitions)?;
        }
        Ok(())
    }
}

fn assign_all<C: ConsumerContext + 'static>(
    consumer: &StreamConsumer<C>,
    topics: &[String],
    start: StartOffset,
    timeout: Duration,
) -> KafkaResult<()> {
    let offset = match start {
        StartOffset::Earliest => Offset::Beginning,
        StartOffset::Latest => Offset::End,
    };

    let mut assignment = TopicPartitionList::new();
    for topic in topics {
        let metadata = consumer.fetch_metadata(Some(topic.as_str()), timeout)?;
        for entry in metadata.topics() {
            if let Some(err) = entry.error() {
                return Err(KafkaError::MetadataFetch(err.into()));
            }
            for partition in entry.partitions() {
                assignment.add_partition_offset(entry.name(), partition.id(), offset)?;
            }
        }
    }
    consumer.assign(&assignment)
}

fn partition_list(partitions: &TopicPartitions) -> TopicPartitionList {
    let mut list = TopicPartitionList::new();
    for (topic, ids) in partitions {
        for id in ids {
            list.add_partition(topic, *id);
        }
    }
    list
}

/// Leader epoch of every position librdkafka knows one for
fn leader_epochs(positions: &TopicPartitionList) -> HashMap<(String, i32), i32> {
    positions
        .elements()
        .iter()
        .filter_map(|elem| {
            elem.leader_epoch()
                .map(|epoch| ((elem.topic().to_string(), elem.partition()), epoch))
        })
        .collect()
}

fn push_message(fetches: &mut Fetches, result: KafkaResult<OwnedMessage>) {
    match result {
        Ok(message) => fetches.messages.push(message),
        Err(KafkaError::PartitionEOF(_)) => {}
        Err(err) => fetches.errors.push(FetchError::client(err.into())),
    }
}

#[async_trait]
impl<C: ConsumerContext + 'static> ConsumerClient for KafkaConsumerClient<C> {
    async fn poll_fetches(&self, max_records: usize) -> Fetches {
        if self.ensure_open().is_err() {
            return Fetches::from_error(KafkaClientError::ClientClosed);
        }
        if let Err(err) = self.apply_paused() {
            warn!(error = %err, "Failed to re-apply paused topics");
        }

        let mut fetches = Fetches::default();
        let first = tokio::select! {
            _ = self.closed.cancelled() => return Fetches::from_error(KafkaClientError::ClientClosed),
            result = self.consumer.recv() => result.map(|message| message.detach()),
        };
        push_message(&mut fetches, first);

        // Drain what is already buffered without waiting again; 0 means no limit.
        while fetches.errors.is_empty() && (max_records == 0 || fetches.messages.len() < max_records) {
            match self.consumer.recv().now_or_never() {
                Some(result) => push_message(&mut fetches, result.map(|message| message.detach())),
                None => break,
            }
        }

        if !fetches.messages.is_empty() {
            match self.consumer.position() {
                Ok(positions) => fetches.leader_epochs = leader_epochs(&positions),
                Err(err) => debug!(error = %err, "Failed to read leader epochs"),
            }
        }
        fetches
    }

    async fn commit_uncommitted_offsets(&self) -> Result<()> {
        self.ensure_open()?;
        let consumer = self.consumer.clone();
        match blocking(move || consumer.commit_consumer_state(CommitMode::Sync)).await {
            Err(KafkaClientError::Kafka(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset))) => Ok(()),
            other => other,
        }
    }

    async fn commit_offsets(&self, offsets: &[CommitOffset]) -> Result<()> {
        self.ensure_open()?;
        let mut list = TopicPartitionList::new();
        for commit in offsets {
            let mut elem = list.add_partition(&commit.topic, commit.partition);
            elem.set_offset(Offset::Offset(commit.offset))?;
            elem.set_leader_epoch(commit.leader_epoch);
        }
        let consumer = self.consumer.clone();
        blocking(move || consumer.commit(&list, CommitMode::Sync)).await
    }

    fn pause_topics(&self, topics: &[String]) -> Result<()> {
        self.ensure_open()?;
        let topics: HashSet<String> = topics.iter().cloned().collect();
        self.paused_topics.lock().extend(topics.iter().cloned());
        let partitions = self.assigned(&topics)?;
        if partitions.count() > 0 {
            self.consumer.pause(&partitions)?;
        }
        Ok(())
    }

    fn resume_topics(&self, topics: &[String]) -> Result<()> {
        self.ensure_open()?;
        let topics: HashSet<String> = topics.iter().cloned().collect();
        self.paused_topics.lock().retain(|topic| !topics.contains(topic));
        let partitions = self.assigned(&topics)?;
        if partitions.count() > 0 {
            self.consumer.resume(&partitions)?;
        }
        Ok(())
    }

    fn pause_partitions(&self, partitions: &TopicPartitions) -> Result<()> {
        self.ensure_open()?;
        Ok(self.consumer.pause(&partition_list(partitions))?)
    }

    fn resume_partitions(&self, partitions: &TopicPartitions) -> Result<()> {
        self.ensure_open()?;
        Ok(self.consumer.resume(&partition_list(partitions))?)
    }

    async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        if self.grouped {
            let consumer = self.consumer.clone();
            if let Err(err) = tokio::task::spawn_blocking(move || consumer.unsubscribe()).await {
                warn!(error = %err, "Failed to leave consumer group");
            }
        }
    }
}

/// Admin backend backed by an rdkafka `AdminClient`
pub struct KafkaAdminClient<C: ClientContext + 'static> {
    admin: Arc<RdAdminClient<C>>,
    timeout: Duration,
}

impl<C: ClientContext + 'static> KafkaAdminClient<C> {
    pub fn connect(properties: &ClientConfig, context: C, timeout: Duration) -> Result<Self> {
        let admin: RdAdminClient<C> = properties.create_with_context(context)?;
        Ok(Self {
            admin: Arc::new(admin),
            timeout,
        })
    }

    fn options(&self) -> AdminOptions {
        AdminOptions::new()
            .operation_timeout(Some(self.timeout))
            .request_timeout(Some(self.timeout))
    }

    async fn fetch_metadata(&self) -> Result<Metadata> {
        let admin = self.admin.clone();
        let timeout = self.timeout;
        blocking(move || admin.inner().fetch_metadata(None, timeout)).await
    }

    async fn fetch_groups(&self, group: Option<String>) -> Result<Vec<GroupInfo>> {
        let admin = self.admin.clone();
        let timeout = self.timeout;
        blocking(move || {
            let list = admin.inner().fetch_group_list(group.as_deref(), timeout)?;
            Ok(list
                .groups()
                .iter()
                .map(|group| GroupInfo {
                    name: group.name().to_string(),
                    state: group.state().to_string(),
                    protocol_type: group.protocol_type().to_string(),
                    protocol: group.protocol().to_string(),
                    members: group
                        .members()
                        .iter()
                        .map(|member| GroupMember {
                            id: member.id().to_string(),
                            client_id: member.client_id().to_string(),
                            client_host: member.client_host().to_string(),
                        })
                        .collect(),
                })
                .collect())
        })
        .await
    }
}

fn broker_infos(metadata: &Metadata) -> Vec<BrokerInfo> {
    metadata
        .brokers()
        .iter()
        .map(|broker| BrokerInfo {
            id: broker.id(),
            host: broker.host().to_string(),
            port: broker.port(),
            rack: None,
        })
        .collect()
}

fn collect_topics(metadata: &Metadata, into: &mut ClusterMetadata) {
    for topic in metadata.topics() {
        if let Some(err) = topic.error() {
            into.missing.push((topic.name().to_string(), err.into()));
            continue;
        }
        into.topics.push(TopicInfo {
            name: topic.name().to_string(),
            internal: topic.name().starts_with("__"),
            partitions: topic
                .partitions()
                .iter()
                .map(|partition| PartitionInfo {
                    id: partition.id(),
                    leader: partition.leader(),
                    replicas: partition.replicas().to_vec(),
                    isr: partition.isr().to_vec(),
                })
                .collect(),
        });
    }
}

fn item_results(results: Vec<std::result::Result<String, (String, RDKafkaErrorCode)>>) -> Vec<ItemResult> {
    results
        .into_iter()
        .map(|result| match result {
            Ok(name) => ItemResult::ok(name),
            Err((name, code)) => ItemResult::failed(name, KafkaClientError::from_code(code)),
        })
        .collect()
}

#[async_trait]
impl<C: ClientContext + 'static> AdminClient for KafkaAdminClient<C> {
    async fn create_topics(&self, topics: &[TopicConfig]) -> Result<Vec<ItemResult>> {
        let new_topics: Vec<NewTopic<'_>> = topics
            .iter()
            .map(|topic| {
                topic.configs.iter().fold(
                    NewTopic::new(
                        &topic.name,
                        topic.partitions,
                        TopicReplication::Fixed(i32::from(topic.replication_factor)),
                    ),
                    |new_topic, (key, value)| new_topic.set(key, value),
                )
            })
            .collect();

        let results = self.admin.create_topics(&new_topics, &self.options()).await?;
        Ok(item_results(results))
    }

    async fn delete_topics(&self, topics: &[String]) -> Result<Vec<ItemResult>> {
        let names: Vec<&str> = topics.iter().map(String::as_str).collect();
        let results = self.admin.delete_topics(&names, &self.options()).await?;
        Ok(item_results(results))
    }

    async fn metadata(&self, topics: &[String]) -> Result<ClusterMetadata> {
        // Always the full listing: a metadata request naming a topic may
        // auto-create it on the broker.
        let metadata = self.fetch_metadata().await?;
        let mut cluster = ClusterMetadata {
            brokers: broker_infos(&metadata),
            ..Default::default()
        };
        collect_topics(&metadata, &mut cluster);
        Ok(cluster.select(topics))
    }

    async fn list_groups(&self) -> Result<Vec<GroupInfo>> {
        self.fetch_groups(None).await
    }

    async fn describe_groups(&self, groups: &[String]) -> Result<Vec<GroupInfo>> {
        let mut described = Vec::with_capacity(groups.len());
        for group in groups {
            described.extend(self.fetch_groups(Some(group.clone())).await?);
        }
        Ok(described)
    }

    async fn delete_groups(&self, groups: &[String]) -> Result<Vec<ItemResult>> {
        let names: Vec<&str> = groups.iter().map(String::as_str).collect();
        let results = self.admin.delete_groups(&names, &self.options()).await?;
        Ok(item_results(results))
    }

    async fn close(&self) {
        debug!("Admin client closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{record_to_message, Record};

    /// Producer with room for one queued message and no reachable broker
    async fn single_slot_producer(message_timeout: &str, queue_timeout: Duration) -> KafkaProducerClient<KafkaContext> {
        let mut properties = ClientConfig::new();
        properties
            .set("bootstrap.servers", "127.0.0.1:1")
            .set("queue.buffering.max.messages", "1")
            .set("message.timeout.ms", message_timeout);
        KafkaProducerClient::connect(&properties, KafkaContext::new("producer"), None, queue_timeout)
            .await
            .unwrap()
    }

    fn message(value: &str) -> OwnedMessage {
        record_to_message(&Record::new(value.to_string()).with_partition(0), "t")
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_full_queue_waits_for_room_in_order() {
        let client = single_slot_producer("500", Duration::from_secs(30)).await;

        let first = client.send(message("a"));
        let started = Instant::now();
        // Only gets queued once the first message has left the queue.
        let second = client.send(message("b"));
        assert!(started.elapsed() >= Duration::from_millis(400));

        let first = first.await.unwrap_err();
        assert_eq!(first.code(), Some(RDKafkaErrorCode::MessageTimedOut));
        let second = second.await.unwrap_err();
        assert_eq!(second.code(), Some(RDKafkaErrorCode::MessageTimedOut));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_full_queue_gives_up_after_queue_timeout() {
        let client = single_slot_producer("60000", Duration::from_millis(200)).await;

        let _first = client.send(message("a"));
        let started = Instant::now();
        let second = client.send(message("b"));
        assert!(started.elapsed() >= Duration::from_millis(200));

        let err = second.await.unwrap_err();
        assert_eq!(err.code(), Some(RDKafkaErrorCode::QueueFull));
        client.abort_buffered_records().await.unwrap();
    }
}
