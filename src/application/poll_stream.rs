//! Cold, pull-driven polling.
//!
//! Nothing is polled until the next element is requested, and a new batch is only
//! requested once the previous one has been handed out (or, for records, fully
//! drained). With auto-commit enabled a poll implicitly commits what the previous poll
//! returned, so polling must never run ahead of processing.
//!
//! Prefer [`PollBatches`] when commit correctness matters: abandoning [`PollRecords`]
//! halfway through a batch under auto-commit lets the next poll commit records that
//! were never processed.
//!
//! The iterators poll on the calling thread. From async code use the streams
//! ([`poll_batch_stream`], [`poll_record_stream`], [`StreamingConsumer`]): each pull runs
//! the blocking poll on tokio's blocking pool, so the caller's runtime keeps driving
//! other tasks, including pending sends and commits, while a poll waits.

use crate::domain::{BrokerError, ConsumerRecord, ConsumerRecords};
use crate::ports::outgoing::BrokerConsumer;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::iter::FusedIterator;
use std::sync::Arc;
use std::time::Duration;
use tokio::task;
use tracing::{trace, warn};

/// One `poll` per `next()`. Ends after the first poll error.
pub struct PollBatches<'a, C: ?Sized> {
    consumer: &'a C,
    timeout: Duration,
    failed: bool,
}

pub fn poll_batches<C>(consumer: &C, timeout: Duration) -> PollBatches<'_, C>
where
    C: BrokerConsumer + ?Sized,
{
    PollBatches {
        consumer,
        timeout,
        failed: false,
    }
}

impl<C> Iterator for PollBatches<'_, C>
where
    C: BrokerConsumer + ?Sized,
{
    type Item = Result<ConsumerRecords, BrokerError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        match self.consumer.poll(self.timeout) {
            Ok(batch) => {
                trace!(records = batch.len(), "polled batch");
                Some(Ok(batch))
            }
            Err(e) => {
                warn!(error = %e, "poll failed, ending stream");
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

impl<C> FusedIterator for PollBatches<'_, C> where C: BrokerConsumer + ?Sized {}

/// Records one at a time, draining each batch before polling the next.
pub struct PollRecords<'a, C: ?Sized> {
    batches: PollBatches<'a, C>,
    current: std::vec::IntoIter<ConsumerRecord>,
}

pub fn poll_records<C>(consumer: &C, timeout: Duration) -> PollRecords<'_, C>
where
    C: BrokerConsumer + ?Sized,
{
    PollRecords {
        batches: poll_batches(consumer, timeout),
        current: Vec::new().into_iter(),
    }
}

impl<C> Iterator for PollRecords<'_, C>
where
    C: BrokerConsumer + ?Sized,
{
    type Item = Result<ConsumerRecord, BrokerError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.current.next() {
                return Some(Ok(record));
            }
            match self.batches.next()? {
                Ok(batch) => self.current = batch.into_iter(),
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

impl<C> FusedIterator for PollRecords<'_, C> where C: BrokerConsumer + ?Sized {}

/// Polling streams as methods on any consumer.
pub trait PollingConsumer: BrokerConsumer {
    fn poll_batches(&self, timeout: Duration) -> PollBatches<'_, Self> {
        poll_batches(self, timeout)
    }

    fn poll_records(&self, timeout: Duration) -> PollRecords<'_, Self> {
        poll_records(self, timeout)
    }

    /// [`poll_batches`](Self::poll_batches) with the consumer's configured timeout.
    fn batches(&self) -> PollBatches<'_, Self> {
        poll_batches(self, self.poll_timeout())
    }

    fn records(&self) -> PollRecords<'_, Self> {
        poll_records(self, self.poll_timeout())
    }
}

impl<C> PollingConsumer for C where C: BrokerConsumer + ?Sized {}

/// One `poll` per pulled element, run on the blocking pool. Ends after the first poll
/// error. Dropping the stream while a poll is in flight lets that poll finish
/// unobserved, and its batch is lost.
pub fn poll_batch_stream<C>(
    consumer: Arc<C>,
    timeout: Duration,
) -> BoxStream<'static, Result<ConsumerRecords, BrokerError>>
where
    C: BrokerConsumer + ?Sized + 'static,
{
    stream::unfold(Some(consumer), move |consumer| async move {
        let Some(consumer) = consumer else {
            return None;
        };
        let polling = Arc::clone(&consumer);
        let polled = task::spawn_blocking(move || polling.poll(timeout))
            .await
            .unwrap_or_else(|e| Err(BrokerError::Kafka(format!("poll task failed: {}", e))));

        match polled {
            Ok(batch) => {
                trace!(records = batch.len(), "polled batch");
                Some((Ok(batch), Some(consumer)))
            }
            Err(e) => {
                warn!(error = %e, "poll failed, ending stream");
                Some((Err(e), None))
            }
        }
    })
    .boxed()
}

/// Records one at a time, draining each batch before the next poll is started.
pub fn poll_record_stream<C>(
    consumer: Arc<C>,
    timeout: Duration,
) -> BoxStream<'static, Result<ConsumerRecord, BrokerError>>
where
    C: BrokerConsumer + ?Sized + 'static,
{
    poll_batch_stream(consumer, timeout)
        .map_ok(|batch| stream::iter(batch.into_iter().map(Ok::<_, BrokerError>)))
        .try_flatten()
        .boxed()
}

/// Polling streams on a shared consumer, with the consumer's configured timeout.
pub trait StreamingConsumer {
    fn batch_stream(&self) -> BoxStream<'static, Result<ConsumerRecords, BrokerError>>;

    fn record_stream(&self) -> BoxStream<'static, Result<ConsumerRecord, BrokerError>>;
}

impl<C> StreamingConsumer for Arc<C>
where
    C: BrokerConsumer + ?Sized + 'static,
{
    fn batch_stream(&self) -> BoxStream<'static, Result<ConsumerRecords, BrokerError>> {
        poll_batch_stream(Arc::clone(self), self.poll_timeout())
    }

    fn record_stream(&self) -> BoxStream<'static, Result<ConsumerRecord, BrokerError>> {
        poll_record_stream(Arc::clone(self), self.poll_timeout())
    }
}
