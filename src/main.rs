use futures::StreamExt;
use kkafka::adapters::outgoing::MemoryBroker;
use kkafka::application::{StreamingConsumer, TransactionalProducer};
use kkafka::config::{AppConfig, ConsumerConfig, ProducerConfig};
use kkafka::domain::ProducerRecord;
use kkafka::ports::incoming::{SuspendingConsumer, SuspendingProducer};
use kkafka::Result;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::from_env()?;
    let broker = MemoryBroker::start()?;
    broker.create_topic(&config.input_topic, config.partitions)?;
    broker.create_topic(&config.output_topic, config.partitions)?;

    let seeder = broker.producer(&ProducerConfig::idempotent())?;
    for i in 0..config.seed_records {
        seeder
            .send_suspending(
                ProducerRecord::new(config.input_topic.clone(), format!("record-{}", i))
                    .with_key(format!("key-{}", i % 7)),
            )
            .await?;
    }
    info!(records = config.seed_records, topic = %config.input_topic, "seeded input");

    let consumer = Arc::new(broker.consumer(config.consumer.clone()));
    consumer.subscribe(&[config.input_topic.as_str()])?;
    let mut producer = TransactionalProducer::new(broker.producer(&config.producer)?);

    let mut copied = 0;
    let mut batches = consumer.batch_stream();
    while let Some(batch) = batches.next().await {
        let batch = batch?;
        if batch.is_empty() {
            break;
        }
        let latest = batch.partition_and_latest_offsets();
        let output = config.output_topic.clone();

        copied += producer
            .transaction_with_consumer_topic(&*consumer, &config.input_topic, |scope| async move {
                let mut sent = 0;
                for record in batch {
                    let mut out = ProducerRecord::new(output.clone(), record.value);
                    if let Some(key) = record.key {
                        out = out.with_key(key);
                    }
                    scope.send(out).await?;
                    sent += 1;
                }
                Ok::<_, anyhow::Error>(sent)
            })
            .await?;
        info!(copied, partitions = latest.len(), "batch committed");
    }

    let verifier = Arc::new(broker.consumer(ConsumerConfig::new("kkafka-verify")));
    verifier.subscribe(&[config.output_topic.as_str()])?;
    let mut verified = 0;
    let mut records = verifier.record_stream().take(copied);
    while let Some(record) = records.next().await {
        record?;
        verified += 1;
    }
    let committed = verifier.commit_suspending().await?;

    info!(
        copied,
        verified,
        group_offsets = broker.committed_offsets(&config.consumer.group_id).len(),
        verifier_offsets = committed.len(),
        "pipeline finished"
    );
    Ok(())
}
