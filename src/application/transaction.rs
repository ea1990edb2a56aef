//! Begin / commit / abort around a block of caller logic, optionally folding a
//! consumer's positions into the transaction for exactly-once consume-process-produce.
//!
//! ```text
//! Idle -> Open -> Committing -> Committed
//!              \-> Aborting  -> Aborted
//!              \-> Closed (fatal producer error)
//! ```
//!
//! Nothing is retried here. A transient failure aborts and is handed back so the caller
//! can run the same logical transaction again; a fatal one closes the producer.

use crate::application::bridge::SuspensionBridge;
use crate::domain::{BrokerError, OffsetAndMetadata, Offsets, ProducerRecord, RecordMetadata};
use crate::ports::incoming::SuspendingProducer;
use crate::ports::outgoing::{BrokerConsumer, BrokerProducer};
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Idle,
    Open,
    Committing,
    Committed,
    Aborting,
    Aborted,
    Closed,
}

/// Why a transaction did not commit.
#[derive(Debug)]
pub enum TransactionError<E> {
    /// The caller's block failed; the transaction was aborted.
    Block(E),
    /// A transactional call failed with a transient error; the transaction was aborted
    /// (or never began, when `begin` itself failed).
    Broker(BrokerError),
    /// The consumer is not assigned any partition of these declared topics, so its
    /// offsets cannot be part of the transaction; the transaction was aborted.
    Integrity { missing_topics: Vec<String> },
    /// The producer hit a fatal error and was closed. The producer must be recreated.
    /// `cause` is empty when a transaction was refused on an already closed producer.
    ProducerClosed {
        cause: Option<Box<TransactionError<E>>>,
    },
    /// Aborting failed while handling `original`; the transaction's outcome is unknown.
    AbortFailed {
        abort: BrokerError,
        original: Box<TransactionError<E>>,
    },
}

/// Which way a transaction failed, without the caller's block error attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    Block,
    Broker,
    Integrity,
    ProducerClosed,
    AbortFailed,
}

impl<E> TransactionError<E> {
    pub fn kind(&self) -> TransactionErrorKind {
        match self {
            TransactionError::Block(_) => TransactionErrorKind::Block,
            TransactionError::Broker(_) => TransactionErrorKind::Broker,
            TransactionError::Integrity { .. } => TransactionErrorKind::Integrity,
            TransactionError::ProducerClosed { .. } => TransactionErrorKind::ProducerClosed,
            TransactionError::AbortFailed { .. } => TransactionErrorKind::AbortFailed,
        }
    }

    pub fn is_producer_closed(&self) -> bool {
        matches!(self, TransactionError::ProducerClosed { .. })
    }

    pub fn is_integrity(&self) -> bool {
        matches!(self, TransactionError::Integrity { .. })
    }
}

impl<E: fmt::Display> fmt::Display for TransactionError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionError::Block(e) => write!(f, "transaction block failed: {}", e),
            TransactionError::Broker(e) => write!(f, "transaction failed: {}", e),
            TransactionError::Integrity { missing_topics } => write!(
                f,
                "transaction integrity violated: no assigned partition for topics [{}]",
                missing_topics.join(", ")
            ),
            TransactionError::ProducerClosed { cause: Some(cause) } => {
                write!(f, "producer closed after fatal error: {}", cause)
            }
            TransactionError::ProducerClosed { cause: None } => {
                write!(f, "producer closed after an earlier fatal error")
            }
            TransactionError::AbortFailed { abort, original } => write!(
                f,
                "aborting transaction failed: {} (while handling: {})",
                abort, original
            ),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for TransactionError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransactionError::Broker(e) => Some(e),
            TransactionError::AbortFailed { abort, .. } => Some(abort),
            _ => None,
        }
    }
}

/// Exposes the broker error behind a failure, if there is one, so the coordinator can
/// tell fatal producer errors from everything else.
pub trait BrokerFailure {
    fn broker_error(&self) -> Option<&BrokerError>;

    fn is_fatal(&self) -> bool {
        self.broker_error().map_or(false, BrokerError::is_fatal)
    }
}

impl BrokerFailure for BrokerError {
    fn broker_error(&self) -> Option<&BrokerError> {
        Some(self)
    }
}

impl BrokerFailure for anyhow::Error {
    fn broker_error(&self) -> Option<&BrokerError> {
        self.downcast_ref::<BrokerError>()
    }
}

impl<E: BrokerFailure> BrokerFailure for TransactionError<E> {
    fn broker_error(&self) -> Option<&BrokerError> {
        match self {
            TransactionError::Block(e) => e.broker_error(),
            TransactionError::Broker(e) => Some(e),
            TransactionError::Integrity { .. } => None,
            TransactionError::ProducerClosed { cause } => {
                cause.as_ref().and_then(|c| c.broker_error())
            }
            TransactionError::AbortFailed { abort, .. } => Some(abort),
        }
    }
}

/// The handle a transaction block uses to produce. Sends through a scope whose
/// transaction has ended fail with [`BrokerError::IllegalState`].
pub struct TransactionScope<P> {
    producer: Arc<P>,
    open: Arc<AtomicBool>,
    bridge: SuspensionBridge,
}

impl<P> Clone for TransactionScope<P> {
    fn clone(&self) -> Self {
        Self {
            producer: Arc::clone(&self.producer),
            open: Arc::clone(&self.open),
            bridge: self.bridge.clone(),
        }
    }
}

impl<P: BrokerProducer> TransactionScope<P> {
    pub async fn send(&self, record: ProducerRecord) -> Result<RecordMetadata, BrokerError> {
        if !self.is_open() {
            return Err(BrokerError::IllegalState(
                "send on a transaction scope whose transaction has ended".to_string(),
            ));
        }
        self.producer
            .send_suspending_with(&self.bridge, record)
            .await
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn producer(&self) -> &P {
        &self.producer
    }
}

/// Coordinator state, shared with the abort guard so an abandoned transaction still
/// records how it ended.
#[derive(Clone)]
struct SharedState(Arc<Mutex<TransactionState>>);

impl SharedState {
    fn new(state: TransactionState) -> Self {
        Self(Arc::new(Mutex::new(state)))
    }

    fn get(&self) -> TransactionState {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, state: TransactionState) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

/// Aborts a transaction that is still open when the coordinator's future is dropped
/// or the block panics.
struct AbortOnDrop<P: BrokerProducer> {
    producer: Arc<P>,
    open: Arc<AtomicBool>,
    state: SharedState,
    armed: bool,
}

impl<P: BrokerProducer> AbortOnDrop<P> {
    fn disarm(&mut self) {
        self.armed = false;
        self.open.store(false, Ordering::SeqCst);
    }
}

impl<P: BrokerProducer> Drop for AbortOnDrop<P> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.open.store(false, Ordering::SeqCst);
        warn!("transaction abandoned while open, aborting");
        self.state.set(TransactionState::Aborting);

        match self.producer.abort_transaction() {
            Ok(()) => self.state.set(TransactionState::Aborted),
            Err(e) if e.is_fatal() => {
                error!(error = %e, "fatal error aborting abandoned transaction, closing producer");
                if let Err(e) = self.producer.close() {
                    warn!(error = %e, "error while closing producer");
                }
                self.state.set(TransactionState::Closed);
            }
            Err(e) => error!(error = %e, "failed to abort abandoned transaction"),
        }
    }
}

struct ConsumerBinding<'a> {
    consumer: &'a dyn BrokerConsumer,
    topics: BTreeSet<String>,
}

/// Owns a transactional producer and runs transactions on it one at a time.
pub struct TransactionalProducer<P> {
    producer: Arc<P>,
    state: SharedState,
    bridge: SuspensionBridge,
}

impl<P> TransactionalProducer<P>
where
    P: BrokerProducer + 'static,
{
    pub fn new(producer: P) -> Self {
        Self {
            producer: Arc::new(producer),
            state: SharedState::new(TransactionState::Idle),
            bridge: SuspensionBridge::default(),
        }
    }

    /// Resume sends made inside transactions on `bridge` rather than the default.
    pub fn with_bridge(mut self, bridge: SuspensionBridge) -> Self {
        self.bridge = bridge;
        self
    }

    pub fn state(&self) -> TransactionState {
        self.state.get()
    }

    pub fn producer(&self) -> &P {
        &self.producer
    }

    /// Runs `block` in a transaction: commits if it returns `Ok`, aborts if it or the
    /// commit fails.
    pub async fn transaction<T, E, F, Fut>(&mut self, block: F) -> Result<T, TransactionError<E>>
    where
        F: FnOnce(TransactionScope<P>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: BrokerFailure + fmt::Display,
    {
        self.run(None, block).await
    }

    /// Runs `block` in a transaction that also commits `consumer`'s current positions
    /// on every assigned partition of `topics`.
    ///
    /// Every declared topic must have at least one partition assigned to `consumer`;
    /// otherwise the transaction is aborted with [`TransactionError::Integrity`]. Do not
    /// include the topics this producer writes to.
    pub async fn transaction_with_consumer<C, I, S, T, E, F, Fut>(
        &mut self,
        consumer: &C,
        topics: I,
        block: F,
    ) -> Result<T, TransactionError<E>>
    where
        C: BrokerConsumer,
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        F: FnOnce(TransactionScope<P>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: BrokerFailure + fmt::Display,
    {
        let binding = ConsumerBinding {
            consumer,
            topics: topics.into_iter().map(|t| t.as_ref().to_string()).collect(),
        };
        self.run(Some(binding), block).await
    }

    /// [`transaction_with_consumer`](Self::transaction_with_consumer) on one topic.
    pub async fn transaction_with_consumer_topic<C, T, E, F, Fut>(
        &mut self,
        consumer: &C,
        topic: &str,
        block: F,
    ) -> Result<T, TransactionError<E>>
    where
        C: BrokerConsumer,
        F: FnOnce(TransactionScope<P>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: BrokerFailure + fmt::Display,
    {
        self.transaction_with_consumer(consumer, [topic], block)
            .await
    }

    async fn run<T, E, F, Fut>(
        &mut self,
        binding: Option<ConsumerBinding<'_>>,
        block: F,
    ) -> Result<T, TransactionError<E>>
    where
        F: FnOnce(TransactionScope<P>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: BrokerFailure + fmt::Display,
    {
        if self.state.get() == TransactionState::Closed {
            return Err(TransactionError::ProducerClosed { cause: None });
        }

        if let Err(e) = self.producer.begin_transaction() {
            if e.is_fatal() {
                return Err(self.close(TransactionError::Broker(e)));
            }
            warn!(error = %e, "failed to begin transaction");
            return Err(TransactionError::Broker(e));
        }
        self.state.set(TransactionState::Open);
        debug!("transaction open");

        let open = Arc::new(AtomicBool::new(true));
        let mut guard = AbortOnDrop {
            producer: Arc::clone(&self.producer),
            open: Arc::clone(&open),
            state: self.state.clone(),
            armed: true,
        };
        let scope = TransactionScope {
            producer: Arc::clone(&self.producer),
            open,
            bridge: self.bridge.clone(),
        };

        let outcome = match block(scope).await {
            Ok(value) => {
                guard.open.store(false, Ordering::SeqCst);
                self.commit(binding.as_ref()).map(|()| value)
            }
            Err(e) => Err(TransactionError::Block(e)),
        };
        guard.disarm();

        match outcome {
            Ok(value) => {
                self.state.set(TransactionState::Committed);
                info!("transaction committed");
                Ok(value)
            }
            Err(failure) if failure.is_fatal() => Err(self.close(failure)),
            Err(failure) => Err(self.abort(failure)),
        }
    }

    fn commit<E>(
        &mut self,
        binding: Option<&ConsumerBinding<'_>>,
    ) -> Result<(), TransactionError<E>> {
        self.state.set(TransactionState::Committing);

        if let Some(binding) = binding {
            let offsets = resolve_offsets::<E>(binding)?;
            if offsets.is_empty() {
                debug!("no consumer topics declared, committing without offsets");
            } else {
                let group_id = binding.consumer.group_id();
                debug!(
                    group_id = %group_id,
                    partitions = offsets.len(),
                    "sending offsets to transaction"
                );
                self.producer
                    .send_offsets_to_transaction(&offsets, &group_id)
                    .map_err(TransactionError::<E>::Broker)?;
            }
        }

        self.producer
            .commit_transaction()
            .map_err(TransactionError::Broker)
    }

    fn abort<E: fmt::Display>(&mut self, failure: TransactionError<E>) -> TransactionError<E> {
        self.state.set(TransactionState::Aborting);
        warn!(reason = %failure, "aborting transaction");

        match self.producer.abort_transaction() {
            Ok(()) => {
                self.state.set(TransactionState::Aborted);
                failure
            }
            Err(abort) => {
                error!(error = %abort, original = %failure, "failed to abort transaction");
                let fatal = abort.is_fatal();
                let failure = TransactionError::AbortFailed {
                    abort,
                    original: Box::new(failure),
                };
                if fatal {
                    self.close_producer();
                }
                failure
            }
        }
    }

    /// Closes the producer instead of aborting: an abort on a fenced or otherwise
    /// invalid producer is meaningless.
    fn close<E: fmt::Display>(&mut self, failure: TransactionError<E>) -> TransactionError<E> {
        error!(reason = %failure, "fatal producer error, closing producer");
        self.close_producer();
        TransactionError::ProducerClosed {
            cause: Some(Box::new(failure)),
        }
    }

    fn close_producer(&mut self) {
        if let Err(e) = self.producer.close() {
            warn!(error = %e, "error while closing producer");
        }
        self.state.set(TransactionState::Closed);
    }
}

fn resolve_offsets<E>(binding: &ConsumerBinding<'_>) -> Result<Offsets, TransactionError<E>> {
    let partitions: Vec<_> = binding
        .consumer
        .assignment()
        .into_iter()
        .filter(|tp| binding.topics.contains(&tp.topic))
        .collect();

    let missing_topics: Vec<String> = binding
        .topics
        .iter()
        .filter(|topic| !partitions.iter().any(|tp| &tp.topic == *topic))
        .cloned()
        .collect();
    if !missing_topics.is_empty() {
        return Err(TransactionError::Integrity { missing_topics });
    }

    let mut offsets = Offsets::new();
    for tp in partitions {
        let position = binding
            .consumer
            .position(&tp)
            .map_err(TransactionError::<E>::Broker)?;
        offsets.insert(tp, OffsetAndMetadata::new(position));
    }
    Ok(offsets)
}
