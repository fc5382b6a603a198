//! In-process broker
//!
//! Implements the three backend traits over shared in-memory partition logs so
//! producers, consumers and admin clients can run without a cluster. Records
//! are written on `send`; transactional records stay pending until their
//! transaction ends. Consumers in the same group split partitions round-robin.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use murmur2::{murmur2, KAFKA_SEED};
use parking_lot::Mutex;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Message, OwnedMessage};
use rdkafka::Timestamp;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::admin::{BrokerInfo, GroupInfo, GroupMember, PartitionInfo, TopicConfig, TopicInfo};
use crate::client::{
    AdminClient, ClusterMetadata, CommitOffset, ConsumerClient, DeliveryFuture, Fetches,
    ItemResult, ProducerClient, TransactionEnd,
};
use crate::config::{ConsumerConfig, IsolationLevel, ProducerConfig, StartOffset};
use crate::error::KafkaClientError;
use crate::message::{FetchError, TopicPartitions};
use crate::Result;

const BROKER_ID: i32 = 0;
const BROKER_HOST: &str = "localhost";
const BROKER_PORT: i32 = 9092;

type TopicPartition = (String, i32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnStatus {
    Committed,
    Pending(u64),
    Aborted,
}

struct Entry {
    message: OwnedMessage,
    status: TxnStatus,
}

#[derive(Default)]
struct PartitionLog {
    entries: Vec<Entry>,
    leader_epoch: i32,
}

struct Topic {
    partitions: Vec<PartitionLog>,
    next_partition: usize,
}

impl Topic {
    fn new(partitions: i32) -> Self {
        Self {
            partitions: (0..partitions).map(|_| PartitionLog::default()).collect(),
            next_partition: 0,
        }
    }

    /// Explicit partition, murmur2 of the key, or round-robin
    fn choose_partition(&mut self, requested: i32, key: Option<&[u8]>) -> Result<usize> {
        let count = self.partitions.len();
        if requested >= 0 {
            let requested = requested as usize;
            if requested >= count {
                return Err(KafkaError::MessageProduction(RDKafkaErrorCode::UnknownPartition).into());
            }
            return Ok(requested);
        }
        match key {
            Some(key) if !key.is_empty() => {
                let hash = murmur2(key, KAFKA_SEED) & 0x7fff_ffff;
                Ok(hash as usize % count)
            }
            _ => {
                let partition = self.next_partition % count;
                self.next_partition = self.next_partition.wrapping_add(1);
                Ok(partition)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CommittedOffset {
    offset: i64,
    leader_epoch: Option<i32>,
}

#[derive(Default)]
struct Group {
    members: BTreeMap<String, String>,
    committed: HashMap<TopicPartition, CommittedOffset>,
}

impl Group {
    fn state(&self) -> &'static str {
        if self.members.is_empty() {
            "Empty"
        } else {
            "Stable"
        }
    }
}

struct BrokerState {
    topics: BTreeMap<String, Topic>,
    groups: BTreeMap<String, Group>,
    default_partitions: i32,
    auto_create: bool,
    next_txn: u64,
    next_member: u64,
    /// Handed to the next consumer poll
    fetch_errors: Vec<FetchError>,
    ack_delay: Duration,
}

impl BrokerState {
    fn append(&mut self, message: OwnedMessage, txn: Option<u64>) -> Result<(i32, i64)> {
        if !self.topics.contains_key(message.topic()) {
            if !self.auto_create {
                return Err(KafkaError::MessageProduction(RDKafkaErrorCode::UnknownTopicOrPartition).into());
            }
            debug!(kafka_topic = %message.topic(), "Auto-creating topic");
            self.topics
                .insert(message.topic().to_string(), Topic::new(self.default_partitions));
        }
        let topic = self
            .topics
            .get_mut(message.topic())
            .ok_or(KafkaError::MessageProduction(RDKafkaErrorCode::UnknownTopicOrPartition))?;

        let partition = topic.choose_partition(message.partition(), message.key())?;
        let log = &mut topic.partitions[partition];
        let offset = log.entries.len() as i64;
        let timestamp = match message.timestamp() {
            Timestamp::NotAvailable => Timestamp::LogAppendTime(Utc::now().timestamp_millis()),
            timestamp => timestamp,
        };

        let stored = OwnedMessage::new(
            message.payload().map(<[u8]>::to_vec),
            message.key().map(<[u8]>::to_vec),
            message.topic().to_string(),
            timestamp,
            partition as i32,
            offset,
            message.headers().cloned(),
        );
        log.entries.push(Entry {
            message: stored,
            status: txn.map_or(TxnStatus::Committed, TxnStatus::Pending),
        });
        Ok((partition as i32, offset))
    }

    fn finish_transaction(&mut self, txn: u64, touched: &HashSet<TopicPartition>, commit: bool) {
        let status = if commit {
            TxnStatus::Committed
        } else {
            TxnStatus::Aborted
        };
        for (topic, partition) in touched {
            let Some(log) = self.log_mut(topic, *partition) else {
                continue;
            };
            for entry in &mut log.entries {
                if entry.status == TxnStatus::Pending(txn) {
                    entry.status = status;
                }
            }
        }
    }

    fn log(&self, topic: &str, partition: i32) -> Option<&PartitionLog> {
        self.topics.get(topic)?.partitions.get(usize::try_from(partition).ok()?)
    }

    fn leader_epoch(&self, tp: &TopicPartition) -> Option<i32> {
        self.log(&tp.0, tp.1).map(|log| log.leader_epoch)
    }

    fn log_mut(&mut self, topic: &str, partition: i32) -> Option<&mut PartitionLog> {
        self.topics
            .get_mut(topic)?
            .partitions
            .get_mut(usize::try_from(partition).ok()?)
    }

    /// Partitions of `topics` owned by `member`
    fn assignment(&self, topics: &[String], group: Option<&str>, member: &str) -> Vec<TopicPartition> {
        let mut all: Vec<TopicPartition> = topics
            .iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .filter_map(|name| self.topics.get(name).map(|topic| (name, topic.partitions.len())))
            .flat_map(|(name, count)| (0..count as i32).map(move |p| (name.clone(), p)))
            .collect();

        let Some(group) = group.and_then(|g| self.groups.get(g)) else {
            return all;
        };
        let Some(index) = group.members.keys().position(|id| id == member) else {
            return Vec::new();
        };
        let members = group.members.len();
        let mut position = 0;
        all.retain(|_| {
            let keep = position % members == index;
            position += 1;
            keep
        });
        all
    }
}

struct Shared {
    state: Mutex<BrokerState>,
    changed: Notify,
}

/// Kafka broker living in the current process
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Broker that auto-creates single-partition topics
    pub fn new() -> Self {
        Self::with_partitions(1)
    }

    /// Broker that auto-creates topics with `partitions` partitions
    pub fn with_partitions(partitions: i32) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState {
                    topics: BTreeMap::new(),
                    groups: BTreeMap::new(),
                    default_partitions: partitions.max(1),
                    auto_create: true,
                    next_txn: 0,
                    next_member: 0,
                    fetch_errors: Vec::new(),
                    ack_delay: Duration::ZERO,
                }),
                changed: Notify::new(),
            }),
        }
    }

    pub fn set_auto_create_topics(&self, enabled: bool) {
        self.shared.state.lock().auto_create = enabled;
    }

    pub fn create_topic(&self, name: &str, partitions: i32) -> Result<()> {
        let mut state = self.shared.state.lock();
        if partitions <= 0 {
            return Err(KafkaClientError::from_code(RDKafkaErrorCode::InvalidPartitions));
        }
        if state.topics.contains_key(name) {
            return Err(KafkaClientError::from_code(RDKafkaErrorCode::TopicAlreadyExists));
        }
        state.topics.insert(name.to_string(), Topic::new(partitions));
        drop(state);
        self.shared.changed.notify_waiters();
        Ok(())
    }

    /// Delay acknowledgements of produced records by `delay`. Records are
    /// still written, and offsets assigned, when they are sent.
    pub fn set_ack_delay(&self, delay: Duration) {
        self.shared.state.lock().ack_delay = delay;
    }

    /// Make the next consumer poll return `error`, alongside any records
    pub fn inject_fetch_error(&self, error: FetchError) {
        self.shared.state.lock().fetch_errors.push(error);
        self.notify();
    }

    /// Move leadership of `topic`/`partition`, bumping its leader epoch
    pub fn elect_leader(&self, topic: &str, partition: i32) -> Option<i32> {
        let mut state = self.shared.state.lock();
        let log = state.log_mut(topic, partition)?;
        log.leader_epoch += 1;
        Some(log.leader_epoch)
    }

    /// Offset the next record written to `topic`/`partition` will get
    pub fn high_watermark(&self, topic: &str, partition: i32) -> Option<i64> {
        let state = self.shared.state.lock();
        state.log(topic, partition).map(|log| log.entries.len() as i64)
    }

    /// Offset committed by `group` for `topic`/`partition`
    pub fn committed_offset(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        let state = self.shared.state.lock();
        state
            .groups
            .get(group)?
            .committed
            .get(&(topic.to_string(), partition))
            .map(|committed| committed.offset)
    }

    /// Leader epoch stored with the offset committed by `group`
    pub fn committed_leader_epoch(&self, group: &str, topic: &str, partition: i32) -> Option<i32> {
        let state = self.shared.state.lock();
        state
            .groups
            .get(group)?
            .committed
            .get(&(topic.to_string(), partition))?
            .leader_epoch
    }

    pub fn producer_client(&self, config: &ProducerConfig) -> Arc<dyn ProducerClient> {
        Arc::new(MemoryProducerClient {
            broker: self.clone(),
            transactional: config.transactional_id().is_some(),
            transaction: Mutex::new(None),
            in_flight: Arc::new(InFlight::default()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn consumer_client(&self, config: &ConsumerConfig) -> Arc<dyn ConsumerClient> {
        let group = config.group_id().map(str::to_string);
        let member_id = {
            let mut state = self.shared.state.lock();
            state.next_member += 1;
            let member_id = format!("{}-{}", config.base.client_id, state.next_member);
            if let Some(group) = &group {
                state
                    .groups
                    .entry(group.clone())
                    .or_default()
                    .members
                    .insert(member_id.clone(), config.base.client_id.clone());
            }
            member_id
        };
        self.shared.changed.notify_waiters();

        Arc::new(MemoryConsumerClient {
            broker: self.clone(),
            member_id,
            group,
            topics: config.topics.clone(),
            start_offset: config.start_offset,
            read_committed: config.isolation_level == IsolationLevel::ReadCommitted,
            auto_commit: config.auto_commit,
            positions: Mutex::new(ConsumerPositions::default()),
            closed: CancellationToken::new(),
        })
    }

    pub fn admin_client(&self) -> Arc<dyn AdminClient> {
        Arc::new(MemoryAdminClient { broker: self.clone() })
    }

    fn notify(&self) {
        self.shared.changed.notify_waiters();
    }
}

struct OpenTransaction {
    id: u64,
    touched: HashSet<TopicPartition>,
}

/// Count of sent records whose acknowledgement is still pending
#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    acked: Notify,
}

/// Held by a delivery until it resolves or is dropped
struct InFlightGuard(Arc<InFlight>);

impl InFlightGuard {
    fn new(in_flight: &Arc<InFlight>) -> Self {
        in_flight.count.fetch_add(1, Ordering::AcqRel);
        Self(in_flight.clone())
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.acked.notify_waiters();
        }
    }
}

/// Producer writing straight into a [`MemoryBroker`]
pub struct MemoryProducerClient {
    broker: MemoryBroker,
    transactional: bool,
    transaction: Mutex<Option<OpenTransaction>>,
    in_flight: Arc<InFlight>,
    closed: AtomicBool,
}

impl MemoryProducerClient {
    fn write(&self, message: OwnedMessage) -> Result<(i32, i64)> {
        if self.closed.load(Ordering::Acquire) {
            return Err(KafkaClientError::ClientClosed);
        }

        let mut transaction = self.transaction.lock();
        if self.transactional && transaction.is_none() {
            return Err(KafkaError::MessageProduction(RDKafkaErrorCode::State).into());
        }

        let topic = message.topic().to_string();
        let written = self
            .broker
            .shared
            .state
            .lock()
            .append(message, transaction.as_ref().map(|txn| txn.id))?;
        if let Some(txn) = transaction.as_mut() {
            txn.touched.insert((topic, written.0));
        }
        drop(transaction);

        self.broker.notify();
        Ok(written)
    }

    fn finish(&self, commit: bool) -> Result<()> {
        let Some(txn) = self.transaction.lock().take() else {
            if commit {
                return Err(KafkaClientError::from_code(RDKafkaErrorCode::State));
            }
            return Ok(());
        };
        self.broker
            .shared
            .state
            .lock()
            .finish_transaction(txn.id, &txn.touched, commit);
        self.broker.notify();
        Ok(())
    }
}

#[async_trait]
impl ProducerClient for MemoryProducerClient {
    fn send(&self, message: OwnedMessage) -> DeliveryFuture {
        let written = self.write(message);
        let delay = self.broker.shared.state.lock().ack_delay;
        if delay.is_zero() {
            return futures::future::ready(written).boxed();
        }

        let guard = InFlightGuard::new(&self.in_flight);
        async move {
            tokio::time::sleep(delay).await;
            drop(guard);
            written
        }
        .boxed()
    }

    async fn flush(&self, timeout: Duration) -> Result<()> {
        let drained = async {
            loop {
                let acked = self.in_flight.acked.notified();
                tokio::pin!(acked);
                acked.as_mut().enable();
                if self.in_flight.count.load(Ordering::Acquire) == 0 {
                    return;
                }
                acked.await;
            }
        };
        tokio::time::timeout(timeout, drained)
            .await
            .map_err(|_| KafkaClientError::from(KafkaError::Flush(RDKafkaErrorCode::OperationTimedOut)))
    }

    async fn begin_transaction(&self) -> Result<()> {
        if !self.transactional {
            return Err(KafkaClientError::NoTransactionalId);
        }
        let mut transaction = self.transaction.lock();
        if transaction.is_some() {
            return Err(KafkaClientError::TransactionInProgress);
        }
        let id = {
            let mut state = self.broker.shared.state.lock();
            state.next_txn += 1;
            state.next_txn
        };
        *transaction = Some(OpenTransaction {
            id,
            touched: HashSet::new(),
        });
        Ok(())
    }

    async fn end_transaction(&self, end: TransactionEnd, _timeout: Duration) -> Result<()> {
        self.finish(end == TransactionEnd::Commit)
    }

    async fn abort_buffered_records(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self, timeout: Duration) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(err) = self.flush(timeout).await {
            warn!(error = %err, "Failed to flush producer on close");
        }
        // An open transaction dies with its producer.
        if let Err(err) = self.finish(false) {
            warn!(error = %err, "Failed to abort open transaction on close");
        }
    }
}

#[derive(Default)]
struct ConsumerPositions {
    next: HashMap<TopicPartition, i64>,
    paused_topics: HashSet<String>,
    paused_partitions: HashSet<TopicPartition>,
}

/// Consumer reading from a [`MemoryBroker`]
pub struct MemoryConsumerClient {
    broker: MemoryBroker,
    member_id: String,
    group: Option<String>,
    topics: Vec<String>,
    start_offset: StartOffset,
    read_committed: bool,
    auto_commit: bool,
    positions: Mutex<ConsumerPositions>,
    closed: CancellationToken,
}

impl MemoryConsumerClient {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(KafkaClientError::ClientClosed);
        }
        Ok(())
    }

    /// Read what is visible right now, at most `max_records` messages
    /// (0 for no limit) interleaved across partitions, plus injected errors
    fn collect(&self, max_records: usize) -> Fetches {
        let mut state = self.broker.shared.state.lock();
        let mut positions = self.positions.lock();

        if self.auto_commit {
            let current = committed_positions(&state, &positions.next);
            if let Some(group) = self.group.as_ref().and_then(|g| state.groups.get_mut(g)) {
                group.committed.extend(current);
            }
        }

        let assigned = state.assignment(&self.topics, self.group.as_deref(), &self.member_id);
        positions.next.retain(|tp, _| assigned.contains(tp));

        let mut budget = if max_records == 0 { usize::MAX } else { max_records };
        let mut leader_epochs = HashMap::new();
        let mut per_partition: Vec<Vec<OwnedMessage>> = Vec::new();
        for tp in assigned {
            if budget == 0 {
                break;
            }
            if positions.paused_topics.contains(&tp.0) || positions.paused_partitions.contains(&tp) {
                continue;
            }
            let Some(log) = state.log(&tp.0, tp.1) else {
                continue;
            };

            let start = match positions.next.get(&tp) {
                Some(offset) => *offset,
                None => self
                    .group
                    .as_ref()
                    .and_then(|g| state.groups.get(g))
                    .and_then(|group| group.committed.get(&tp))
                    .map(|committed| committed.offset)
                    .unwrap_or(match self.start_offset {
                        StartOffset::Earliest => 0,
                        StartOffset::Latest => log.entries.len() as i64,
                    }),
            };

            let mut next = start;
            let mut messages = Vec::new();
            while budget > 0 {
                let Some(entry) = usize::try_from(next).ok().and_then(|i| log.entries.get(i)) else {
                    break;
                };
                match entry.status {
                    TxnStatus::Pending(_) if self.read_committed => break,
                    TxnStatus::Aborted if self.read_committed => {}
                    _ => {
                        messages.push(entry.message.clone());
                        budget -= 1;
                    }
                }
                next += 1;
            }
            if !messages.is_empty() {
                leader_epochs.insert(tp.clone(), log.leader_epoch);
                per_partition.push(messages);
            }
            positions.next.insert(tp, next);
        }

        Fetches {
            messages: interleave(per_partition),
            errors: std::mem::take(&mut state.fetch_errors),
            leader_epochs,
        }
    }
}

/// Consumer positions as commits, with each partition's current leader epoch
fn committed_positions(
    state: &BrokerState,
    next: &HashMap<TopicPartition, i64>,
) -> Vec<(TopicPartition, CommittedOffset)> {
    next.iter()
        .map(|(tp, offset)| {
            let committed = CommittedOffset {
                offset: *offset,
                leader_epoch: state.leader_epoch(tp),
            };
            (tp.clone(), committed)
        })
        .collect()
}

fn interleave(per_partition: Vec<Vec<OwnedMessage>>) -> Vec<OwnedMessage> {
    let total = per_partition.iter().map(Vec::len).sum::<usize>();
    let mut queues: Vec<_> = per_partition.into_iter().map(Vec::into_iter).collect();
    let mut messages = Vec::with_capacity(total);
    while messages.len() < total {
        for queue in &mut queues {
            if let Some(message) = queue.next() {
                messages.push(message);
            }
        }
    }
    messages
}

#[async_trait]
impl ConsumerClient for MemoryConsumerClient {
    async fn poll_fetches(&self, max_records: usize) -> Fetches {
        loop {
            if self.ensure_open().is_err() {
                return Fetches::from_error(KafkaClientError::ClientClosed);
            }

            let notified = self.broker.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let fetches = self.collect(max_records);
            if !fetches.is_empty() {
                return fetches;
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = self.closed.cancelled() => {
                    return Fetches::from_error(KafkaClientError::ClientClosed);
                }
            }
        }
    }

    async fn commit_uncommitted_offsets(&self) -> Result<()> {
        self.ensure_open()?;
        let group = self.group.as_ref().ok_or(KafkaClientError::MissingGroup)?;
        let mut state = self.broker.shared.state.lock();
        let current = committed_positions(&state, &self.positions.lock().next);
        state.groups.entry(group.clone()).or_default().committed.extend(current);
        Ok(())
    }

    async fn commit_offsets(&self, offsets: &[CommitOffset]) -> Result<()> {
        self.ensure_open()?;
        let group = self.group.as_ref().ok_or(KafkaClientError::MissingGroup)?;
        let mut state = self.broker.shared.state.lock();
        let committed = &mut state.groups.entry(group.clone()).or_default().committed;
        for commit in offsets {
            let offset = CommittedOffset {
                offset: commit.offset,
                leader_epoch: commit.leader_epoch,
            };
            committed.insert((commit.topic.clone(), commit.partition), offset);
        }
        Ok(())
    }

    fn pause_topics(&self, topics: &[String]) -> Result<()> {
        self.ensure_open()?;
        self.positions.lock().paused_topics.extend(topics.iter().cloned());
        Ok(())
    }

    fn resume_topics(&self, topics: &[String]) -> Result<()> {
        self.ensure_open()?;
        self.positions
            .lock()
            .paused_topics
            .retain(|topic| !topics.contains(topic));
        self.broker.notify();
        Ok(())
    }

    fn pause_partitions(&self, partitions: &TopicPartitions) -> Result<()> {
        self.ensure_open()?;
        let mut positions = self.positions.lock();
        for (topic, ids) in partitions {
            positions
                .paused_partitions
                .extend(ids.iter().map(|id| (topic.clone(), *id)));
        }
        Ok(())
    }

    fn resume_partitions(&self, partitions: &TopicPartitions) -> Result<()> {
        self.ensure_open()?;
        {
            let mut positions = self.positions.lock();
            for (topic, ids) in partitions {
                for id in ids {
                    positions.paused_partitions.remove(&(topic.clone(), *id));
                }
            }
        }
        self.broker.notify();
        Ok(())
    }

    async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        if let Some(group) = &self.group {
            let mut state = self.broker.shared.state.lock();
            if let Some(group) = state.groups.get_mut(group) {
                group.members.remove(&self.member_id);
            }
        }
        self.broker.notify();
    }
}

/// Admin client over a [`MemoryBroker`]
pub struct MemoryAdminClient {
    broker: MemoryBroker,
}

fn topic_info(name: &str, topic: &Topic) -> TopicInfo {
    TopicInfo {
        name: name.to_string(),
        internal: name.starts_with("__"),
        partitions: (0..topic.partitions.len() as i32)
            .map(|id| PartitionInfo {
                id,
                leader: BROKER_ID,
                replicas: vec![BROKER_ID],
                isr: vec![BROKER_ID],
            })
            .collect(),
    }
}

fn group_info(name: &str, group: Option<&Group>) -> GroupInfo {
    GroupInfo {
        name: name.to_string(),
        state: group.map_or("Dead", Group::state).to_string(),
        protocol_type: "consumer".to_string(),
        protocol: group
            .filter(|g| !g.members.is_empty())
            .map_or("", |_| "range")
            .to_string(),
        members: group
            .map(|g| {
                g.members
                    .iter()
                    .map(|(id, client_id)| GroupMember {
                        id: id.clone(),
                        client_id: client_id.clone(),
                        client_host: "/127.0.0.1".to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default(),
    }
}

#[async_trait]
impl AdminClient for MemoryAdminClient {
    async fn create_topics(&self, topics: &[TopicConfig]) -> Result<Vec<ItemResult>> {
        let mut state = self.broker.shared.state.lock();
        let results = topics
            .iter()
            .map(|topic| {
                let code = if topic.partitions <= 0 {
                    Some(RDKafkaErrorCode::InvalidPartitions)
                } else if topic.replication_factor == 0
                    || topic.replication_factor < -1
                    || topic.replication_factor > 1
                {
                    Some(RDKafkaErrorCode::InvalidReplicationFactor)
                } else if state.topics.contains_key(&topic.name) {
                    Some(RDKafkaErrorCode::TopicAlreadyExists)
                } else {
                    None
                };
                match code {
                    Some(code) => ItemResult::failed(&topic.name, KafkaClientError::from_code(code)),
                    None => {
                        state.topics.insert(topic.name.clone(), Topic::new(topic.partitions));
                        ItemResult::ok(&topic.name)
                    }
                }
            })
            .collect();
        drop(state);
        self.broker.notify();
        Ok(results)
    }

    async fn delete_topics(&self, topics: &[String]) -> Result<Vec<ItemResult>> {
        let mut state = self.broker.shared.state.lock();
        Ok(topics
            .iter()
            .map(|name| match state.topics.remove(name) {
                Some(_) => ItemResult::ok(name),
                None => ItemResult::failed(
                    name,
                    KafkaClientError::from_code(RDKafkaErrorCode::UnknownTopicOrPartition),
                ),
            })
            .collect())
    }

    async fn metadata(&self, topics: &[String]) -> Result<ClusterMetadata> {
        let state = self.broker.shared.state.lock();
        let mut metadata = ClusterMetadata {
            brokers: vec![BrokerInfo {
                id: BROKER_ID,
                host: BROKER_HOST.to_string(),
                port: BROKER_PORT,
                rack: None,
            }],
            ..Default::default()
        };

        if topics.is_empty() {
            metadata.topics = state
                .topics
                .iter()
                .map(|(name, topic)| topic_info(name, topic))
                .collect();
            return Ok(metadata);
        }

        for name in topics {
            match state.topics.get(name) {
                Some(topic) => metadata.topics.push(topic_info(name, topic)),
                None => metadata
                    .missing
                    .push((name.clone(), RDKafkaErrorCode::UnknownTopicOrPartition)),
            }
        }
        Ok(metadata)
    }

    async fn list_groups(&self) -> Result<Vec<GroupInfo>> {
        let state = self.broker.shared.state.lock();
        Ok(state
            .groups
            .iter()
            .map(|(name, group)| group_info(name, Some(group)))
            .collect())
    }

    async fn describe_groups(&self, groups: &[String]) -> Result<Vec<GroupInfo>> {
        let state = self.broker.shared.state.lock();
        Ok(groups
            .iter()
            .map(|name| group_info(name, state.groups.get(name)))
            .collect())
    }

    async fn delete_groups(&self, groups: &[String]) -> Result<Vec<ItemResult>> {
        let mut state = self.broker.shared.state.lock();
        Ok(groups
            .iter()
            .map(|name| {
                let code = match state.groups.get(name) {
                    None => Some(RDKafkaErrorCode::GroupIdNotFound),
                    Some(group) if !group.members.is_empty() => Some(RDKafkaErrorCode::NonEmptyGroup),
                    Some(_) => None,
                };
                match code {
                    Some(code) => ItemResult::failed(name, KafkaClientError::from_code(code)),
                    None => {
                        state.groups.remove(name);
                        ItemResult::ok(name)
                    }
                }
            })
            .collect())
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{record_to_message, Record};

    fn consumer_config(group: &str, topic: &str) -> ConsumerConfig {
        ConsumerConfig {
            topics: vec![topic.to_string()],
            group: group.to_string(),
            start_offset: StartOffset::Earliest,
            ..ConsumerConfig::new("memory:9092")
        }
    }

    #[tokio::test]
    async fn test_offsets_per_partition() {
        let broker = MemoryBroker::new();
        broker.create_topic("t", 2).unwrap();
        let producer = broker.producer_client(&ProducerConfig::new("memory:9092"));

        for partition in [0, 1, 0] {
            let record = Record::new("v").with_partition(partition);
            producer.send(record_to_message(&record, "t")).await.unwrap();
        }

        assert_eq!(broker.high_watermark("t", 0), Some(2));
        assert_eq!(broker.high_watermark("t", 1), Some(1));
        assert_eq!(broker.high_watermark("t", 2), None);
    }

    #[tokio::test]
    async fn test_key_partitioning_is_stable() {
        let broker = MemoryBroker::with_partitions(8);
        let producer = broker.producer_client(&ProducerConfig::new("memory:9092"));

        let record = Record::new("v").with_key("user-42");
        let (first, _) = producer.send(record_to_message(&record, "t")).await.unwrap();
        let (second, _) = producer.send(record_to_message(&record, "t")).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_unknown_topic_without_auto_create() {
        let broker = MemoryBroker::new();
        broker.set_auto_create_topics(false);
        let producer = broker.producer_client(&ProducerConfig::new("memory:9092"));

        let err = producer
            .send(record_to_message(&Record::new("v"), "missing"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(RDKafkaErrorCode::UnknownTopicOrPartition));
    }

    #[tokio::test]
    async fn test_group_members_split_partitions() {
        let broker = MemoryBroker::new();
        broker.create_topic("t", 4).unwrap();

        let a = broker.consumer_client(&consumer_config("g", "t"));
        let b = broker.consumer_client(&consumer_config("g", "t"));

        let state = broker.shared.state.lock();
        let topics = vec!["t".to_string()];
        let members: Vec<String> = state.groups["g"].members.keys().cloned().collect();
        let first = state.assignment(&topics, Some("g"), &members[0]);
        let second = state.assignment(&topics, Some("g"), &members[1]);
        drop(state);

        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 2);
        assert!(first.iter().all(|tp| !second.contains(tp)));

        a.close().await;
        b.close().await;
        assert_eq!(broker.shared.state.lock().groups["g"].state(), "Empty");
    }

    #[tokio::test]
    async fn test_read_committed_hides_pending() {
        let broker = MemoryBroker::new();
        let config = ProducerConfig {
            transactional_id: Some("tx".into()),
            ..ProducerConfig::new("memory:9092")
        };
        let producer = broker.producer_client(&config);
        let consumer = broker.consumer_client(&consumer_config("g", "t"));

        producer.begin_transaction().await.unwrap();
        producer
            .send(record_to_message(&Record::new("a"), "t"))
            .await
            .unwrap();

        let pending = tokio::time::timeout(Duration::from_millis(50), consumer.poll_fetches(10)).await;
        assert!(pending.is_err());

        producer
            .end_transaction(TransactionEnd::Commit, Duration::from_secs(1))
            .await
            .unwrap();
        let fetches = consumer.poll_fetches(10).await;
        assert_eq!(fetches.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_zero_max_records_is_unlimited() {
        let broker = MemoryBroker::new();
        let producer = broker.producer_client(&ProducerConfig::new("memory:9092"));
        for value in ["a", "b", "c"] {
            producer.send(record_to_message(&Record::new(value), "t")).await.unwrap();
        }

        let consumer = broker.consumer_client(&consumer_config("g", "t"));
        assert_eq!(consumer.poll_fetches(0).await.messages.len(), 3);
    }

    #[tokio::test]
    async fn test_injected_error_joins_records() {
        let broker = MemoryBroker::new();
        let producer = broker.producer_client(&ProducerConfig::new("memory:9092"));
        producer.send(record_to_message(&Record::new("a"), "t")).await.unwrap();
        broker.inject_fetch_error(FetchError::new("t", 0, KafkaClientError::ClientClosed));

        let consumer = broker.consumer_client(&consumer_config("g", "t"));
        let fetches = consumer.poll_fetches(10).await;
        assert_eq!(fetches.messages.len(), 1);
        assert_eq!(fetches.errors.len(), 1);

        let again = tokio::time::timeout(Duration::from_millis(50), consumer.poll_fetches(10)).await;
        assert!(again.is_err());
    }

    #[tokio::test]
    async fn test_leader_epoch_follows_election() {
        let broker = MemoryBroker::new();
        broker.create_topic("t", 1).unwrap();
        let producer = broker.producer_client(&ProducerConfig::new("memory:9092"));
        let consumer = broker.consumer_client(&consumer_config("g", "t"));

        producer.send(record_to_message(&Record::new("a"), "t")).await.unwrap();
        let fetches = consumer.poll_fetches(10).await;
        assert_eq!(fetches.leader_epochs.get(&("t".to_string(), 0)), Some(&0));

        assert_eq!(broker.elect_leader("t", 0), Some(1));
        assert_eq!(broker.elect_leader("t", 7), None);
        producer.send(record_to_message(&Record::new("b"), "t")).await.unwrap();
        let fetches = consumer.poll_fetches(10).await;
        assert_eq!(fetches.leader_epochs.get(&("t".to_string(), 0)), Some(&1));

        consumer.commit_uncommitted_offsets().await.unwrap();
        assert_eq!(broker.committed_offset("g", "t", 0), Some(2));
        assert_eq!(broker.committed_leader_epoch("g", "t", 0), Some(1));
    }

    #[tokio::test]
    async fn test_flush_waits_for_delayed_acks() {
        let broker = MemoryBroker::new();
        broker.set_ack_delay(Duration::from_millis(50));
        let producer = broker.producer_client(&ProducerConfig::new("memory:9092"));

        let delivery = producer.send(record_to_message(&Record::new("a"), "t"));
        // Written at send time, acknowledged later.
        assert_eq!(broker.high_watermark("t", 0), Some(1));

        let pending = tokio::spawn(delivery);
        let timed_out = producer.flush(Duration::from_millis(5)).await.unwrap_err();
        assert_eq!(timed_out.code(), Some(RDKafkaErrorCode::OperationTimedOut));

        producer.flush(Duration::from_secs(5)).await.unwrap();
        assert_eq!(pending.await.unwrap().unwrap(), (0, 0));
    }

    #[tokio::test]
    async fn test_delete_group_with_members_fails() {
        let broker = MemoryBroker::new();
        let consumer = broker.consumer_client(&consumer_config("g", "t"));
        let admin = broker.admin_client();

        let results = admin.delete_groups(&["g".to_string()]).await.unwrap();
        assert_eq!(
            results[0].error.as_ref().and_then(KafkaClientError::code),
            Some(RDKafkaErrorCode::NonEmptyGroup)
        );

        consumer.close().await;
        let results = admin.delete_groups(&["g".to_string()]).await.unwrap();
        assert!(results[0].error.is_none());
    }
}
