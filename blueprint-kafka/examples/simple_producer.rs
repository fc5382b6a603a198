//! Simple producer example
//!
//! Expects a broker on localhost:9092.

use blueprint_kafka::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(serde::Serialize)]
struct OrderCreated<'a> {
    order_id: &'a str,
    amount_cents: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    println!("🚀 Blueprint Kafka - Simple Producer Example");
    println!("============================================");

    let producer = ProducerBuilder::new()
        .brokers(["localhost:9092"])
        .default_topic("blueprint-topic")
        .acks(Acks::Leader) // Wait for leader acknowledgment
        .compression(Compression::Lz4)
        .delivery_timeout(Duration::from_secs(30))
        .build()
        .await?;
    let token = CancellationToken::new();

    println!("✅ Connected to Kafka");

    // Example 1: Simple record to the default topic
    let results = producer.produce(&token, [Record::new("Hello from Rust!")]).await?;
    let sent = results.into_iter().next().map(ProduceResult::into_result).transpose()?;
    if let Some(sent) = sent {
        println!("✅ Sent simple record - partition: {}, offset: {}", sent.partition, sent.offset);
    }

    // Example 2: Keyed record with headers
    let record = Record::new("Order created: $99.99")
        .with_key("order-456")
        .with_header("content-type", "text/plain")
        .with_header("source", "web-app")
        .with_timestamp(chrono::Utc::now());
    for result in producer.produce(&token, [record]).await? {
        let result = result.into_result()?;
        logger::log_record_sent(&tracing::Span::current(), &result.record, result.partition, result.offset);
        println!("✅ Sent record with headers - partition: {}, offset: {}", result.partition, result.offset);
    }

    // Example 3: Several records, acknowledged in order
    let records = (1..=3).map(|i| Record::new(format!("Batch record {i}")).with_key(format!("batch-{i}")));
    let results = producer.produce(&token, records).await?;
    println!("✅ Sent batch of {} records:", results.len());
    for (i, result) in results.iter().enumerate() {
        match &result.error {
            None => println!("   Record {}: partition={}, offset={}", i + 1, result.partition, result.offset),
            Some(err) => println!("   Record {}: failed: {}", i + 1, err),
        }
    }

    // Example 4: JSON payload
    let event = OrderCreated {
        order_id: "order-789",
        amount_cents: 4_200,
    };
    let result = producer.produce_json(&token, Some("order-789".into()), &event).await?;
    println!("✅ Sent JSON record - offset: {}", result.offset);

    // Example 5: Fire-and-forget with delivery callbacks
    println!("\n🚀 High-throughput test - sending 1000 records...");
    let start = std::time::Instant::now();
    let delivered = Arc::new(AtomicUsize::new(0));
    for i in 0..1000 {
        let record = Record::new(format!("High-throughput record #{i}")).with_key(format!("key-{i}"));
        let delivered = delivered.clone();
        producer.produce_async(&token, record, move |result| {
            if result.is_ok() {
                delivered.fetch_add(1, Ordering::Relaxed);
            }
        })?;
    }

    producer.flush(&token).await?;
    let elapsed = start.elapsed();
    println!(
        "✅ {} records delivered in {:?} (~{:.0} msg/sec)",
        delivered.load(Ordering::Relaxed),
        elapsed,
        1000.0 / elapsed.as_secs_f64()
    );

    let metrics = producer.metrics().snapshot();
    println!(
        "📊 produced={} bytes={} errors={} avg latency={:.0}µs",
        metrics.records_produced, metrics.bytes_produced, metrics.produce_errors, metrics.average_produce_latency_us
    );

    producer.close().await;
    println!("✅ Producer closed");

    println!("\n💡 Try running the consumer example to read these records:");
    println!("   cargo run --example simple_consumer");

    Ok(())
}
