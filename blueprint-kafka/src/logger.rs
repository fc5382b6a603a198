//! Tracing spans and record logging helpers
//!
//! Every facade logs inside its own span. Passing a parent span to a builder
//! nests the client's events under the caller's context.

use tracing::field::Empty;
use tracing::{info, info_span, Span};

use crate::message::{Batch, ConsumedRecord, Header, Record};

/// Field names shared by all Kafka log events
pub const LOG_KEY_TOPIC: &str = "kafka_topic";
pub const LOG_KEY_TOPICS: &str = "kafka_topics";
pub const LOG_KEY_PARTITION: &str = "kafka_partition";
pub const LOG_KEY_BROKER: &str = "kafka_broker";
pub const LOG_KEY_OFFSET: &str = "kafka_offset";
pub const LOG_KEY_KEY: &str = "kafka_key";
pub const LOG_KEY_GROUP: &str = "kafka_group";

fn parent_or_current(parent: Option<&Span>) -> Span {
    parent.cloned().unwrap_or_else(Span::current)
}

/// Span for a consumer of `topics` in `group`
pub fn consumer_span(parent: Option<&Span>, topics: &[String], group: &str) -> Span {
    let parent = parent_or_current(parent);
    let span = info_span!(
        parent: &parent,
        "kafka",
        component = "consumer",
        kafka_topics = Empty,
        kafka_group = Empty,
    );
    if !topics.is_empty() {
        span.record(LOG_KEY_TOPICS, topics.join(",").as_str());
    }
    if !group.is_empty() {
        span.record(LOG_KEY_GROUP, group);
    }
    span
}

/// Span for a producer whose default topic is `topic`
pub fn producer_span(parent: Option<&Span>, topic: &str) -> Span {
    let parent = parent_or_current(parent);
    let span = info_span!(parent: &parent, "kafka", component = "producer", kafka_topic = Empty);
    if !topic.is_empty() {
        span.record(LOG_KEY_TOPIC, topic);
    }
    span
}

/// Span for an admin client connected to `brokers`
pub fn admin_span(parent: Option<&Span>, brokers: &str) -> Span {
    let parent = parent_or_current(parent);
    info_span!(parent: &parent, "kafka", component = "admin", kafka_broker = %brokers)
}

fn render_headers(headers: &[Header]) -> String {
    headers
        .iter()
        .map(|h| format!("{}={}", h.key.to_lowercase(), String::from_utf8_lossy(&h.value)))
        .collect::<Vec<_>>()
        .join(",")
}

fn render_key(key: Option<&[u8]>) -> Option<String> {
    key.filter(|k| !k.is_empty())
        .map(|k| String::from_utf8_lossy(k).into_owned())
}

/// Log a received record
pub fn log_record_received(span: &Span, record: &ConsumedRecord, group: &str) {
    info!(
        parent: span,
        kafka_topic = %record.topic,
        kafka_partition = record.partition,
        kafka_offset = record.offset,
        kafka_group = (!group.is_empty()).then_some(group),
        kafka_key = render_key(record.key.as_deref()).as_deref(),
        headers = %render_headers(&record.headers),
        "Received record from topic {}",
        record.topic
    );
}

/// Log a record acknowledged at `partition`/`offset`
pub fn log_record_sent(span: &Span, record: &Record, partition: i32, offset: i64) {
    info!(
        parent: span,
        kafka_topic = %record.topic,
        kafka_partition = partition,
        kafka_offset = offset,
        kafka_key = render_key(record.key.as_deref()).as_deref(),
        headers = %render_headers(&record.headers),
        "Sent record to topic {}",
        record.topic
    );
}

/// Log a received batch with its offset range
pub fn log_batch_received(span: &Span, batch: &Batch, group: &str) {
    info!(
        parent: span,
        kafka_topic = %batch.topic,
        kafka_partition = batch.partition,
        kafka_group = (!group.is_empty()).then_some(group),
        record_count = batch.len(),
        first_offset = batch.first_offset(),
        last_offset = batch.last_offset(),
        "Received batch from topic {}",
        batch.topic
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn capture<F: FnOnce()>(f: F) -> String {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        tracing::subscriber::with_default(subscriber, f);
        let bytes = captured.0.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_record_received_fields() {
        let record = ConsumedRecord {
            topic: "orders".into(),
            partition: 2,
            offset: 42,
            key: Some("user-1".into()),
            value: Some("payload".into()),
            headers: vec![Header::new("Trace", "abc")],
            timestamp: None,
            leader_epoch: None,
        };

        let output = capture(|| {
            let span = consumer_span(None, &["orders".to_string()], "billing");
            log_record_received(&span, &record, "billing");
        });

        assert!(output.contains("Received record from topic orders"));
        assert!(output.contains("kafka_partition=2"));
        assert!(output.contains("kafka_offset=42"));
        assert!(output.contains("trace=abc"));
        assert!(output.contains("component=\"consumer\""));
    }

    #[test]
    fn test_batch_received_offsets() {
        let make = |offset| ConsumedRecord {
            topic: "t".into(),
            partition: 0,
            offset,
            key: None,
            value: None,
            headers: Vec::new(),
            timestamp: None,
            leader_epoch: None,
        };
        let batch = Batch {
            topic: "t".into(),
            partition: 0,
            records: vec![make(5), make(6), make(7)],
        };

        let output = capture(|| log_batch_received(&producer_span(None, "t"), &batch, ""));
        assert!(output.contains("record_count=3"));
        assert!(output.contains("first_offset=5"));
        assert!(output.contains("last_offset=7"));
    }

    #[test]
    fn test_record_sent() {
        let record = Record::new("v").with_topic("events").with_key("k");
        let output = capture(|| log_record_sent(&admin_span(None, "b:9092"), &record, 1, 9));
        assert!(output.contains("Sent record to topic events"));
        assert!(output.contains("kafka_key=\"k\"") || output.contains("kafka_key=k"));
    }
}
