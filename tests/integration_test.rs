use bytes::Bytes;
use kkafka::{
    adapters::outgoing::{BrokerOperation, MemoryBroker, MemoryConsumer, MemoryProducer},
    application::{
        PollingConsumer, StreamingConsumer, TransactionError, TransactionState,
        TransactionalProducer,
    },
    config::{ConsumerConfig, ProducerConfig},
    domain::{BrokerError, OffsetAndMetadata, Offsets, ProducerRecord, TopicPartition},
    ports::incoming::{SuspendingConsumer, SuspendingProducer},
    ports::outgoing::BrokerConsumer,
    Result,
};
use futures::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};

async fn seeded_broker(records: usize) -> Result<MemoryBroker> {
    let broker = MemoryBroker::start()?;
    broker.create_topic("input", 2)?;
    broker.create_topic("output", 1)?;

    let producer = broker.producer(&ProducerConfig::idempotent())?;
    for i in 0..records {
        producer
            .send_suspending(
                ProducerRecord::new("input", format!("v{}", i)).with_partition((i % 2) as i32),
            )
            .await?;
    }
    Ok(broker)
}

fn subscribed(broker: &MemoryBroker, group: &str, topic: &str) -> Result<MemoryConsumer> {
    let consumer = broker.consumer(
        ConsumerConfig::new(group).with_poll_timeout(Duration::from_millis(20)),
    );
    consumer.subscribe(&[topic])?;
    Ok(consumer)
}

fn copier(broker: &MemoryBroker) -> Result<TransactionalProducer<MemoryProducer>> {
    let producer = broker.producer(&ProducerConfig::transactional("copier"))?;
    Ok(TransactionalProducer::new(producer))
}

#[tokio::test]
async fn test_consume_process_produce_exactly_once() -> Result<()> {
    let broker = seeded_broker(6).await?;
    let consumer = subscribed(&broker, "copier", "input")?;
    let mut producer = copier(&broker)?;

    let batch = consumer.batches().next().unwrap()?;
    assert_eq!(batch.len(), 6);
    let expected = batch.partition_and_latest_offsets();

    let copied = producer
        .transaction_with_consumer_topic(&consumer, "input", |scope| async move {
            for record in batch {
                scope.send(ProducerRecord::new("output", record.value)).await?;
            }
            Ok::<_, BrokerError>(6)
        })
        .await?;

    assert_eq!(copied, 6);
    assert_eq!(producer.state(), TransactionState::Committed);
    assert_eq!(broker.read_committed("output").len(), 6);

    // committed positions are one past the latest processed offset
    let committed = broker.committed_offsets("copier");
    for (tp, latest) in expected {
        assert_eq!(committed[&tp].offset, latest.offset + 1);
    }

    // a restarted consumer in the same group sees nothing left to process
    let restarted = subscribed(&broker, "copier", "input")?;
    assert!(restarted.poll(Duration::from_millis(20))?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_failed_block_leaves_no_trace() -> Result<()> {
    let broker = seeded_broker(2).await?;
    let consumer = subscribed(&broker, "copier", "input")?;
    let mut producer = copier(&broker)?;
    let batch = consumer.batches().next().unwrap()?;

    let result = producer
        .transaction_with_consumer_topic(&consumer, "input", |scope| async move {
            for record in batch {
                scope.send(ProducerRecord::new("output", record.value)).await?;
            }
            Err::<(), _>(BrokerError::Serialization("bad payload".into()))
        })
        .await;

    assert!(matches!(result, Err(TransactionError::Block(BrokerError::Serialization(_)))));
    assert_eq!(producer.state(), TransactionState::Aborted);
    assert!(broker.read_committed("output").is_empty());
    assert!(broker.committed_offsets("copier").is_empty());

    // the aborted records still occupy offsets but are never delivered
    let reader = subscribed(&broker, "reader", "output")?;
    assert_eq!(broker.end_offset(&TopicPartition::new("output", 0)), 2);
    assert!(reader.poll(Duration::from_millis(20))?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_retry_after_abort_commits_once() -> Result<()> {
    let broker = seeded_broker(1).await?;
    let consumer = subscribed(&broker, "copier", "input")?;
    let mut producer = copier(&broker)?;
    broker.fail_next(
        BrokerOperation::CommitTransaction,
        BrokerError::CoordinatorUnavailable("election".into()),
    );

    let batch = consumer.batches().next().unwrap()?;
    let mut attempts = 0;
    loop {
        attempts += 1;
        let batch = batch.clone();
        let result = producer
            .transaction_with_consumer_topic(&consumer, "input", |scope| async move {
                for record in batch {
                    scope.send(ProducerRecord::new("output", record.value)).await?;
                }
                Ok::<_, BrokerError>(())
            })
            .await;
        match result {
            Ok(()) => break,
            Err(TransactionError::Broker(e)) if e.is_retriable() => continue,
            Err(e) => panic!("unexpected failure: {}", e),
        }
    }

    assert_eq!(attempts, 2);
    let values: Vec<Bytes> = broker.read_committed("output").into_iter().map(|r| r.value).collect();
    assert_eq!(values, vec![Bytes::from_static(b"v0")]);
    Ok(())
}

#[tokio::test]
async fn test_newer_instance_fences_older_producer() -> Result<()> {
    let broker = seeded_broker(1).await?;
    let config = ProducerConfig::transactional("copier");
    let mut zombie = TransactionalProducer::new(broker.producer(&config)?);
    let mut current = TransactionalProducer::new(broker.producer(&config)?);

    let result = zombie
        .transaction(|scope| async move {
            scope.send(ProducerRecord::new("output", "zombie")).await?;
            Ok::<_, BrokerError>(())
        })
        .await;

    assert!(result.as_ref().unwrap_err().is_producer_closed());
    assert_eq!(zombie.state(), TransactionState::Closed);
    assert!(matches!(
        zombie.transaction(|_| async { Ok::<_, BrokerError>(()) }).await,
        Err(TransactionError::ProducerClosed { cause: None })
    ));

    current
        .transaction(|scope| async move {
            scope.send(ProducerRecord::new("output", "current")).await?;
            Ok::<_, BrokerError>(())
        })
        .await?;

    let values: Vec<Bytes> = broker.read_committed("output").into_iter().map(|r| r.value).collect();
    assert_eq!(values, vec![Bytes::from_static(b"current")]);
    Ok(())
}

#[tokio::test]
async fn test_unassigned_topic_fails_integrity() -> Result<()> {
    let broker = seeded_broker(1).await?;
    let consumer = subscribed(&broker, "copier", "input")?;
    let mut producer = copier(&broker)?;

    let result = producer
        .transaction_with_consumer(&consumer, ["input", "output"], |scope| async move {
            scope.send(ProducerRecord::new("output", "x")).await?;
            Ok::<_, BrokerError>(())
        })
        .await;

    match result {
        Err(TransactionError::Integrity { missing_topics }) => {
            assert_eq!(missing_topics, vec!["output".to_string()])
        }
        other => panic!("expected integrity failure, got {:?}", other.map(|_| ())),
    }
    assert_eq!(producer.state(), TransactionState::Aborted);
    assert!(broker.read_committed("output").is_empty());
    Ok(())
}

#[tokio::test]
async fn test_commit_suspending_round_trip() -> Result<()> {
    let broker = seeded_broker(4).await?;
    let consumer = subscribed(&broker, "committer", "input")?;

    let records: Vec<_> = consumer.records().take(4).collect::<std::result::Result<_, _>>()?;
    let last = records.last().unwrap().partition_and_offset();
    let (tp, committed) = consumer.commit_offset_suspending(last.clone()).await?;
    assert_eq!((tp.clone(), committed), last);
    assert_eq!(broker.committed_offsets("committer")[&tp], last.1);

    let all = consumer.commit_suspending().await?;
    assert_eq!(all.len(), 2);
    assert_eq!(all[&TopicPartition::new("input", 0)].offset, 2);
    assert_eq!(all[&TopicPartition::new("input", 1)].offset, 2);
    Ok(())
}

#[tokio::test]
async fn test_commit_failure_is_reported() -> Result<()> {
    let broker = seeded_broker(0).await?;
    let consumer = subscribed(&broker, "committer", "input")?;
    broker.fail_next(BrokerOperation::Commit, BrokerError::Authorization("group".into()));

    let offsets = Offsets::from([(TopicPartition::new("input", 0), OffsetAndMetadata::new(1))]);
    let result = consumer.commit_offsets_suspending(offsets.clone()).await;
    assert!(matches!(result, Err(BrokerError::Authorization(_))));
    assert!(broker.committed_offsets("committer").is_empty());

    assert_eq!(consumer.commit_offsets_suspending(offsets.clone()).await?, offsets);
    Ok(())
}

#[tokio::test]
async fn test_auto_commit_follows_processing() -> Result<()> {
    let broker = seeded_broker(4).await?;
    let consumer = broker.consumer(
        ConsumerConfig::new("auto")
            .with_auto_commit(true)
            .with_max_poll_records(2)
            .with_poll_timeout(Duration::from_millis(20)),
    );
    consumer.subscribe(&["input"])?;

    let mut batches = consumer.batches();
    batches.next().unwrap()?;
    assert!(broker.committed_offsets("auto").is_empty());

    batches.next().unwrap()?;
    let committed: i64 = broker
        .committed_offsets("auto")
        .values()
        .map(|o| o.offset)
        .sum();
    assert_eq!(committed, 2);
    Ok(())
}

#[tokio::test]
async fn test_poll_failure_ends_record_stream() -> Result<()> {
    let broker = seeded_broker(1).await?;
    let consumer = subscribed(&broker, "reader", "input")?;

    let mut records = consumer.records();
    assert!(records.next().unwrap().is_ok());

    broker.fail_next(BrokerOperation::Poll, BrokerError::Authentication("expired".into()));
    assert!(matches!(records.next(), Some(Err(BrokerError::Authentication(_)))));
    assert!(records.next().is_none());
    Ok(())
}

#[tokio::test]
async fn test_pending_poll_does_not_block_other_tasks() -> Result<()> {
    let broker = seeded_broker(0).await?;
    let consumer = Arc::new(
        broker.consumer(ConsumerConfig::new("reader").with_poll_timeout(Duration::from_secs(5))),
    );
    consumer.subscribe(&["output"])?;

    let producer = broker.producer(&ProducerConfig::idempotent())?;
    let writer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        producer
            .send_suspending(ProducerRecord::new("output", "while polling"))
            .await
    });

    let started = Instant::now();
    let batch = consumer.batch_stream().next().await.unwrap()?;

    assert_eq!(batch.len(), 1);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(writer.await.unwrap()?.offset, 0);
    Ok(())
}

#[tokio::test]
async fn test_record_stream_feeds_transactions() -> Result<()> {
    let broker = seeded_broker(4).await?;
    let consumer = Arc::new(subscribed(&broker, "copier", "input")?);
    let mut producer = copier(&broker)?;

    let mut records = consumer.record_stream();
    for _ in 0..4 {
        let record = records.next().await.unwrap()?;
        producer
            .transaction_with_consumer_topic(&*consumer, "input", |scope| async move {
                scope.send(ProducerRecord::new("output", record.value)).await?;
                Ok::<_, BrokerError>(())
            })
            .await?;
    }

    assert_eq!(broker.read_committed("output").len(), 4);
    let committed: i64 = broker.committed_offsets("copier").values().map(|o| o.offset).sum();
    assert_eq!(committed, 4);
    Ok(())
}
