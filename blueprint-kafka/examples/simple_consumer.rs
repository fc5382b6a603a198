//! Simple consumer example
//!
//! Expects a broker on localhost:9092. Stop with Ctrl-C.

use blueprint_kafka::*;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    println!("📖 Blueprint Kafka - Simple Consumer Example");
    println!("============================================");

    let consumer = ConsumerBuilder::new()
        .brokers(["localhost:9092"])
        .group_id("blueprint-consumer-group")
        .topics(["blueprint-topic"])
        .start_offset(StartOffset::Earliest)
        .auto_commit(false)
        .session_timeout(Duration::from_secs(30))
        .max_poll_records(100)
        .build()
        .await?;
    let token = CancellationToken::new();

    println!("✅ Connected to Kafka");
    println!("📖 Consuming from topic: blueprint-topic");
    println!("👥 Consumer group: blueprint-consumer-group");

    // Example 1: Poll-based consumption
    println!("\n📖 Example 1: Poll-based consumption (5 polls)");
    for i in 0..5 {
        let poll = tokio::time::timeout(Duration::from_secs(2), consumer.poll(&token)).await;
        let Ok(result) = poll else {
            println!("   Poll {}: No records available", i + 1);
            continue;
        };
        let result = result?;
        if let Some(err) = result.first_error() {
            println!("   Poll {}: fetch error: {}", i + 1, err);
            continue;
        }

        println!("   Poll {}: Received {} records", i + 1, result.record_count());
        for batch in &result.batches {
            for record in &batch.records {
                logger::log_record_received(&tracing::Span::current(), record, "blueprint-consumer-group");
                let key = record
                    .key
                    .as_ref()
                    .map(|k| String::from_utf8_lossy(k).to_string())
                    .unwrap_or_else(|| "<no key>".to_string());
                let value = record
                    .value
                    .as_ref()
                    .map(|v| String::from_utf8_lossy(v).to_string())
                    .unwrap_or_default();
                println!(
                    "      partition={}, offset={}, key='{}', value='{}'",
                    record.partition, record.offset, key, value
                );
            }
            // Commit offsets after processing
            consumer.commit_batch(&token, batch).await?;
        }
        println!("   ✅ Committed offsets");
    }

    // Example 2: Handler loop until Ctrl-C
    println!("\n📖 Example 2: Consume loop (Ctrl-C to stop)");
    let shutdown = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.cancel();
        }
    });

    let committer = &consumer;
    let commit_token = &token;
    consumer
        .consume_batches(&token, move |batch| async move {
            logger::log_batch_received(&tracing::Span::current(), &batch, "blueprint-consumer-group");
            committer.commit_batch(commit_token, &batch).await
        })
        .await?;

    let metrics = consumer.metrics().snapshot();
    println!(
        "📊 polls={} consumed={} commits={}",
        metrics.polls, metrics.records_consumed, metrics.commits
    );

    consumer.close().await;
    println!("✅ Consumer closed");
    Ok(())
}
