//! Transactional producer example
//!
//! Expects a broker on localhost:9092 with transactions enabled.

use blueprint_kafka::*;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    println!("🔒 Blueprint Kafka - Transactional Producer Example");
    println!("===================================================");

    let producer = ProducerBuilder::new()
        .brokers(["localhost:9092"])
        .default_topic("payments")
        .transactional_id("payments-writer-1")
        .build()
        .await?;
    let token = CancellationToken::new();

    println!("✅ Transactional producer initialized");

    // Example 1: Closure-scoped transaction; commits when the closure succeeds
    producer
        .transact(&token, |tx| {
            tx.produce(Record::new("debit account-1 100").with_key("account-1"))?;
            tx.produce(Record::new("credit account-2 100").with_key("account-2"))
        })
        .await?;
    println!("✅ Transfer committed");

    // Example 2: A failing body aborts the transaction
    let result = producer
        .transact(&token, |tx| {
            tx.produce(Record::new("debit account-3 500").with_key("account-3"))?;
            Err(KafkaClientError::handler("insufficient funds"))
        })
        .await;
    println!("✅ Transfer rejected and aborted: {}", result.is_err());

    // Example 3: Explicit transaction handle
    let tx = producer.begin_transaction(&token).await?;
    tx.produce_many((1..=3).map(|i| Record::new(format!("audit entry {i}"))))?;
    println!("   buffered {} records", tx.record_count());
    tx.commit().await?;
    println!("✅ Audit entries committed");

    let metrics = producer.metrics().snapshot();
    println!(
        "📊 committed={} aborted={}",
        metrics.transactions_committed, metrics.transactions_aborted
    );

    producer.close().await;
    println!("✅ Producer closed");
    Ok(())
}
