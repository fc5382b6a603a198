//! Records, batches and fetch results, and their conversion to and from
//! librdkafka messages

use std::collections::HashMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use rdkafka::message::{Header as RdHeader, Headers, Message, OwnedHeaders, OwnedMessage};
use rdkafka::Timestamp;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::client::Fetches;
use crate::error::KafkaClientError;
use crate::Result;

/// Partition value meaning "let the partitioner decide"
pub const ANY_PARTITION: i32 = -1;

/// Offset carried by outbound messages that have not been written yet
const UNASSIGNED_OFFSET: i64 = -1;

/// Record header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub key: String,
    pub value: Bytes,
}

impl Header {
    pub fn new<K: Into<String>, V: Into<Bytes>>(key: K, value: V) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Outbound record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Target topic; empty means the producer's default topic
    pub topic: String,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub headers: Vec<Header>,
    /// Explicit partition, or [`ANY_PARTITION`]
    pub partition: i32,
    /// Create time; `None` lets the broker assign one
    pub timestamp: Option<DateTime<Utc>>,
}

impl Default for Record {
    fn default() -> Self {
        Self {
            topic: String::new(),
            key: None,
            value: None,
            headers: Vec::new(),
            partition: ANY_PARTITION,
            timestamp: None,
        }
    }
}

impl Record {
    /// Record carrying `value`
    pub fn new<V: Into<Bytes>>(value: V) -> Self {
        Self {
            value: Some(value.into()),
            ..Default::default()
        }
    }

    /// Record with a key and no value, marking the key deleted on compacted topics
    pub fn tombstone<K: Into<Bytes>>(key: K) -> Self {
        Self {
            key: Some(key.into()),
            ..Default::default()
        }
    }

    pub fn with_key<K: Into<Bytes>>(mut self, key: K) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_topic<S: Into<String>>(mut self, topic: S) -> Self {
        self.topic = topic.into();
        self
    }

    pub fn with_partition(mut self, partition: i32) -> Self {
        self.partition = partition;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_header<K: Into<String>, V: Into<Bytes>>(mut self, key: K, value: V) -> Self {
        self.headers.push(Header::new(key, value));
        self
    }

    pub fn with_headers<I>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = Header>,
    {
        self.headers.extend(headers);
        self
    }

    /// Payload size counted by the producer metrics
    pub(crate) fn size(&self) -> usize {
        self.key.as_ref().map_or(0, Bytes::len) + self.value.as_ref().map_or(0, Bytes::len)
    }
}

/// Record read from a partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub headers: Vec<Header>,
    pub timestamp: Option<DateTime<Utc>>,
    /// Leader epoch of the partition when the record was fetched
    pub leader_epoch: Option<i32>,
}

impl ConsumedRecord {
    /// First header with the given key
    pub fn header(&self, key: &str) -> Option<&Bytes> {
        self.headers.iter().find(|h| h.key == key).map(|h| &h.value)
    }

    /// Decode the value as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        let value = self.value.as_deref().unwrap_or_default();
        Ok(serde_json::from_slice(value)?)
    }

    pub(crate) fn size(&self) -> usize {
        self.key.as_ref().map_or(0, Bytes::len) + self.value.as_ref().map_or(0, Bytes::len)
    }
}

/// Records of one partition delivered by one poll, in offset order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub topic: String,
    pub partition: i32,
    pub records: Vec<ConsumedRecord>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn first_offset(&self) -> Option<i64> {
        self.records.first().map(|r| r.offset)
    }

    pub fn last_offset(&self) -> Option<i64> {
        self.records.last().map(|r| r.offset)
    }

    pub fn last(&self) -> Option<&ConsumedRecord> {
        self.records.last()
    }
}

/// Error reported for a partition (or the whole poll, with partition -1)
#[derive(Debug)]
pub struct FetchError {
    pub topic: String,
    pub partition: i32,
    pub error: KafkaClientError,
}

impl FetchError {
    pub fn new<S: Into<String>>(topic: S, partition: i32, error: KafkaClientError) -> Self {
        Self {
            topic: topic.into(),
            partition,
            error,
        }
    }

    /// Error not tied to a partition
    pub fn client(error: KafkaClientError) -> Self {
        Self::new("", -1, error)
    }
}

/// Outcome of one poll
#[derive(Debug, Default)]
pub struct FetchResult {
    pub batches: Vec<Batch>,
    pub errors: Vec<FetchError>,
}

impl FetchResult {
    pub fn record_count(&self) -> usize {
        self.batches.iter().map(Batch::len).sum()
    }

    /// All records, batch after batch
    pub fn records(&self) -> Vec<ConsumedRecord> {
        self.batches.iter().flat_map(|b| b.records.iter().cloned()).collect()
    }

    pub fn into_records(self) -> Vec<ConsumedRecord> {
        self.batches.into_iter().flat_map(|b| b.records).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn first_error(&self) -> Option<&KafkaClientError> {
        self.errors.first().map(|e| &e.error)
    }

    pub fn into_first_error(self) -> Option<KafkaClientError> {
        self.errors.into_iter().next().map(|e| e.error)
    }
}

/// Delivery report for one produced record
#[derive(Debug)]
pub struct ProduceResult {
    pub record: Record,
    pub partition: i32,
    pub offset: i64,
    pub error: Option<KafkaClientError>,
}

impl ProduceResult {
    pub(crate) fn delivered(record: Record, partition: i32, offset: i64) -> Self {
        Self {
            record,
            partition,
            offset,
            error: None,
        }
    }

    pub(crate) fn failed(record: Record, error: KafkaClientError) -> Self {
        Self {
            partition: record.partition,
            record,
            offset: -1,
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Turn a failed delivery into an error
    pub fn into_result(self) -> Result<Self> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self),
        }
    }
}

/// Topic to partitions map used for partition-level flow control
pub type TopicPartitions = HashMap<String, Vec<i32>>;

/// Build the library message for `record`.
///
/// The topic falls back to `default_topic`, the partition is only carried
/// when explicit, the timestamp only when set.
pub fn record_to_message(record: &Record, default_topic: &str) -> OwnedMessage {
    let topic = if record.topic.is_empty() {
        default_topic
    } else {
        record.topic.as_str()
    };
    let partition = if record.partition >= 0 {
        record.partition
    } else {
        ANY_PARTITION
    };
    let timestamp = record
        .timestamp
        .map_or(Timestamp::NotAvailable, |ts| Timestamp::CreateTime(ts.timestamp_millis()));

    let headers = (!record.headers.is_empty()).then(|| {
        record
            .headers
            .iter()
            .fold(OwnedHeaders::new_with_capacity(record.headers.len()), |headers, h| {
                headers.insert(RdHeader {
                    key: &h.key,
                    value: Some(&h.value[..]),
                })
            })
    });

    OwnedMessage::new(
        record.value.as_ref().map(|v| v.to_vec()),
        record.key.as_ref().map(|k| k.to_vec()),
        topic.to_string(),
        timestamp,
        partition,
        UNASSIGNED_OFFSET,
        headers,
    )
}

/// Copy a library message into a [`ConsumedRecord`] that owns its data.
pub fn message_to_consumed<M: Message>(message: &M) -> ConsumedRecord {
    let headers = message
        .headers()
        .map(|headers| {
            headers
                .iter()
                .map(|h| Header {
                    key: h.key.to_string(),
                    value: h.value.map(Bytes::copy_from_slice).unwrap_or_default(),
                })
                .collect()
        })
        .unwrap_or_default();

    ConsumedRecord {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(Bytes::copy_from_slice),
        value: message.payload().map(Bytes::copy_from_slice),
        headers,
        timestamp: message
            .timestamp()
            .to_millis()
            .and_then(DateTime::<Utc>::from_timestamp_millis),
        leader_epoch: None,
    }
}

/// Group a poll's messages into per-partition batches.
///
/// Errors come first. Batches appear in the order their partition was first
/// seen; a record whose offset does not advance its partition is dropped.
pub(crate) fn fetches_to_result(fetches: Fetches) -> FetchResult {
    let Fetches {
        messages,
        errors,
        leader_epochs,
    } = fetches;

    let mut batches: Vec<Batch> = Vec::new();
    let mut index: HashMap<(String, i32), usize> = HashMap::new();

    for message in &messages {
        let mut record = message_to_consumed(message);
        let key = (record.topic.clone(), record.partition);
        record.leader_epoch = leader_epochs.get(&key).copied();
        let slot = *index.entry(key).or_insert_with(|| {
            batches.push(Batch {
                topic: record.topic.clone(),
                partition: record.partition,
                records: Vec::new(),
            });
            batches.len() - 1
        });

        let batch = &mut batches[slot];
        if batch.last_offset().map_or(false, |last| record.offset <= last) {
            debug!(
                kafka_topic = %record.topic,
                kafka_partition = record.partition,
                kafka_offset = record.offset,
                "Dropping out-of-order record"
            );
            continue;
        }
        batch.records.push(record);
    }

    FetchResult { batches, errors }
}
