//! An in-process broker client.
//!
//! Behaves like a real client where this crate cares: completion callbacks fire on a
//! dedicated I/O thread, consumers only see committed records (read-committed, stopping
//! at the first record of a still-open transaction), and registering a producer under a
//! transactional id fences the previous instance with that id and aborts its open
//! transaction. Faults can be injected per operation.

use crate::application::error::{ApplicationError, Result};
use crate::config::{ConsumerConfig, OffsetReset, ProducerConfig};
use crate::domain::{
    BrokerError, ConsumerRecord, ConsumerRecords, OffsetAndMetadata, Offsets, ProducerRecord,
    RecordMetadata, TopicPartition,
};
use crate::ports::outgoing::{BrokerConsumer, BrokerProducer, CommitCallback, SendCallback};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

type IoTask = Box<dyn FnOnce() + Send + 'static>;

/// Broker operations a fault can be injected into.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum BrokerOperation {
    Poll,
    Position,
    Commit,
    Send,
    BeginTransaction,
    SendOffsetsToTransaction,
    CommitTransaction,
    AbortTransaction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryStatus {
    Committed,
    Pending,
    Aborted,
}

struct LogEntry {
    record: ConsumerRecord,
    status: EntryStatus,
}

#[derive(Default)]
struct OpenTransaction {
    written: Vec<(TopicPartition, usize)>,
    offsets: Vec<(String, Offsets)>,
}

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, i32>,
    logs: HashMap<TopicPartition, Vec<LogEntry>>,
    group_offsets: HashMap<String, Offsets>,
    producer_epochs: HashMap<String, u64>,
    transactions: HashMap<String, OpenTransaction>,
    faults: HashMap<BrokerOperation, VecDeque<BrokerError>>,
}

impl BrokerState {
    fn take_fault(&mut self, operation: BrokerOperation) -> Result<(), BrokerError> {
        match self.faults.get_mut(&operation).and_then(VecDeque::pop_front) {
            Some(error) => {
                debug!(?operation, error = %error, "injecting fault");
                Err(error)
            }
            None => Ok(()),
        }
    }

    /// Offset of the first record of a still-open transaction, or the log end.
    fn last_stable_offset(&self, tp: &TopicPartition) -> usize {
        self.logs.get(tp).map_or(0, |log| {
            log.iter()
                .position(|entry| entry.status == EntryStatus::Pending)
                .unwrap_or(log.len())
        })
    }

    fn end_offset(&self, tp: &TopicPartition) -> usize {
        self.logs.get(tp).map_or(0, Vec::len)
    }

    fn finish_transaction(&mut self, transactional_id: &str, status: EntryStatus) {
        let Some(txn) = self.transactions.remove(transactional_id) else {
            return;
        };
        for (tp, index) in txn.written {
            if let Some(entry) = self.logs.get_mut(&tp).and_then(|log| log.get_mut(index)) {
                entry.status = status;
            }
        }
        if status == EntryStatus::Committed {
            for (group, offsets) in txn.offsets {
                self.group_offsets.entry(group).or_default().extend(offsets);
            }
        }
    }
}

struct Shared {
    state: Mutex<BrokerState>,
    appended: Condvar,
    io: mpsc::UnboundedSender<IoTask>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues `task` on the I/O thread, where every completion callback runs.
    fn dispatch(&self, task: impl FnOnce() + Send + 'static) {
        if self.io.send(Box::new(task)).is_err() {
            warn!("broker I/O thread stopped, dropping completion");
        }
    }
}

#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    /// Starts the broker and its I/O thread. The thread exits once the broker and every
    /// client created from it are dropped.
    pub fn start() -> Result<Self> {
        let (io, mut tasks) = mpsc::unbounded_channel::<IoTask>();

        thread::Builder::new()
            .name("memory-broker-io".to_string())
            .spawn(move || {
                while let Some(task) = tasks.blocking_recv() {
                    if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                        error!("completion callback panicked on the broker I/O thread");
                    }
                }
                debug!("broker I/O thread stopped");
            })
            .map_err(ApplicationError::Io)?;

        Ok(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::default()),
                appended: Condvar::new(),
                io,
            }),
        })
    }

    pub fn create_topic(&self, topic: &str, partitions: i32) -> Result<()> {
        if partitions < 1 {
            return Err(ApplicationError::Config(format!(
                "topic {} needs at least one partition, got {}",
                topic, partitions
            )));
        }
        let mut state = self.shared.state();
        if state.topics.contains_key(topic) {
            return Err(ApplicationError::Config(format!("topic {} already exists", topic)));
        }
        state.topics.insert(topic.to_string(), partitions);
        for partition in 0..partitions {
            state
                .logs
                .insert(TopicPartition::new(topic, partition), Vec::new());
        }
        info!(topic, partitions, "created topic");
        Ok(())
    }

    /// Registers a producer. With a transactional id this bumps the id's epoch, fencing
    /// any earlier producer with the same id and aborting its open transaction.
    pub fn producer(&self, config: &ProducerConfig) -> Result<MemoryProducer> {
        let epoch = match &config.transactional_id {
            Some(transactional_id) => {
                let idempotence = config.properties.get("enable.idempotence");
                if idempotence.map(String::as_str) == Some("false") {
                    return Err(ApplicationError::Config(
                        "transactional producers require enable.idempotence".to_string(),
                    ));
                }
                let mut state = self.shared.state();
                if state.transactions.contains_key(transactional_id) {
                    warn!(transactional_id, "aborting transaction of fenced producer");
                    state.finish_transaction(transactional_id, EntryStatus::Aborted);
                    self.shared.appended.notify_all();
                }
                let epoch = state
                    .producer_epochs
                    .entry(transactional_id.clone())
                    .and_modify(|epoch| *epoch += 1)
                    .or_insert(0);
                *epoch
            }
            None => 0,
        };

        debug!(
            client_id = %config.client_id,
            transactional_id = ?config.transactional_id,
            epoch,
            "registered producer"
        );
        Ok(MemoryProducer {
            shared: Arc::clone(&self.shared),
            transactional_id: config.transactional_id.clone(),
            epoch,
            in_transaction: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            round_robin: AtomicUsize::new(0),
        })
    }

    pub fn consumer(&self, config: ConsumerConfig) -> MemoryConsumer {
        MemoryConsumer {
            shared: Arc::clone(&self.shared),
            config,
            positions: Mutex::new(HashMap::new()),
            polled: AtomicBool::new(false),
        }
    }

    /// Makes the next call of `operation` fail with `error`. Faults queue up.
    pub fn fail_next(&self, operation: BrokerOperation, error: BrokerError) {
        self.shared
            .state()
            .faults
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    pub fn committed_offsets(&self, group_id: &str) -> Offsets {
        self.shared
            .state()
            .group_offsets
            .get(group_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Every committed record of `topic`, partition by partition.
    pub fn read_committed(&self, topic: &str) -> Vec<ConsumerRecord> {
        let state = self.shared.state();
        let partitions = state.topics.get(topic).copied().unwrap_or(0);
        (0..partitions)
            .filter_map(|partition| state.logs.get(&TopicPartition::new(topic, partition)))
            .flat_map(|log| log.iter())
            .filter(|entry| entry.status == EntryStatus::Committed)
            .map(|entry| entry.record.clone())
            .collect()
    }

    pub fn end_offset(&self, tp: &TopicPartition) -> i64 {
        self.shared.state().end_offset(tp) as i64
    }
}

pub struct MemoryProducer {
    shared: Arc<Shared>,
    transactional_id: Option<String>,
    epoch: u64,
    in_transaction: AtomicBool,
    closed: AtomicBool,
    round_robin: AtomicUsize,
}

impl MemoryProducer {
    pub fn transactional_id(&self) -> Option<&str> {
        self.transactional_id.as_deref()
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::IllegalState(
                "cannot perform operation after producer has been closed".to_string(),
            ));
        }
        Ok(())
    }

    /// The transactional id, provided this instance has not been fenced.
    fn check_epoch<'a>(&'a self, state: &BrokerState) -> Result<&'a str, BrokerError> {
        let transactional_id = self.transactional_id.as_deref().ok_or_else(|| {
            BrokerError::IllegalState("transactional id is not configured".to_string())
        })?;
        match state.producer_epochs.get(transactional_id) {
            Some(epoch) if *epoch == self.epoch => Ok(transactional_id),
            _ => Err(BrokerError::ProducerFenced(format!(
                "producer {} with epoch {} has been fenced by a newer instance",
                transactional_id, self.epoch
            ))),
        }
    }

    fn ensure_in_transaction(&self) -> Result<(), BrokerError> {
        if !self.in_transaction.load(Ordering::SeqCst) {
            return Err(BrokerError::IllegalState(
                "no transaction has been started".to_string(),
            ));
        }
        Ok(())
    }

    fn choose_partition(
        &self,
        record: &ProducerRecord,
        partitions: i32,
    ) -> Result<i32, BrokerError> {
        match (record.partition, &record.key) {
            (Some(partition), _) if (0..partitions).contains(&partition) => Ok(partition),
            (Some(partition), _) => Err(BrokerError::UnknownTopicOrPartition(format!(
                "{}-{}",
                record.topic, partition
            ))),
            (None, Some(key)) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                Ok((hasher.finish() % partitions as u64) as i32)
            }
            (None, None) => {
                Ok((self.round_robin.fetch_add(1, Ordering::Relaxed) % partitions as usize) as i32)
            }
        }
    }

    fn append(&self, record: ProducerRecord) -> Result<RecordMetadata, BrokerError> {
        let mut state = self.shared.state();
        state.take_fault(BrokerOperation::Send)?;
        self.ensure_open()?;

        let transactional_id = match &self.transactional_id {
            Some(_) => {
                let id = self.check_epoch(&state)?.to_string();
                self.ensure_in_transaction()?;
                Some(id)
            }
            None => None,
        };

        let partitions = *state
            .topics
            .get(&record.topic)
            .ok_or_else(|| BrokerError::UnknownTopicOrPartition(record.topic.clone()))?;
        let partition = self.choose_partition(&record, partitions)?;
        let tp = TopicPartition::new(record.topic.clone(), partition);
        let timestamp = record.timestamp.unwrap_or_else(now_millis);

        let log = state.logs.entry(tp.clone()).or_default();
        let index = log.len();
        log.push(LogEntry {
            record: ConsumerRecord {
                topic: tp.topic.clone(),
                partition: tp.partition,
                offset: index as i64,
                timestamp,
                key: record.key,
                value: record.value,
            },
            status: if transactional_id.is_some() {
                EntryStatus::Pending
            } else {
                EntryStatus::Committed
            },
        });

        match transactional_id {
            Some(id) => state
                .transactions
                .entry(id)
                .or_default()
                .written
                .push((tp.clone(), index)),
            None => self.shared.appended.notify_all(),
        }

        Ok(RecordMetadata {
            topic: tp.topic,
            partition: tp.partition,
            offset: index as i64,
            timestamp,
        })
    }
}

impl BrokerProducer for MemoryProducer {
    fn send(&self, record: ProducerRecord, callback: SendCallback) {
        let result = self.append(record);
        self.shared.dispatch(move || match result {
            Ok(metadata) => callback(Some(metadata), None),
            Err(error) => callback(None, Some(error)),
        });
    }

    fn begin_transaction(&self) -> Result<(), BrokerError> {
        let mut state = self.shared.state();
        state.take_fault(BrokerOperation::BeginTransaction)?;
        self.ensure_open()?;
        let transactional_id = self.check_epoch(&state)?.to_string();
        if self.in_transaction.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::IllegalState(
                "a transaction is already in progress".to_string(),
            ));
        }
        state.transactions.insert(transactional_id, OpenTransaction::default());
        Ok(())
    }

    fn send_offsets_to_transaction(
        &self,
        offsets: &Offsets,
        group_id: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.shared.state();
        state.take_fault(BrokerOperation::SendOffsetsToTransaction)?;
        self.ensure_open()?;
        let transactional_id = self.check_epoch(&state)?.to_string();
        self.ensure_in_transaction()?;
        state
            .transactions
            .entry(transactional_id)
            .or_default()
            .offsets
            .push((group_id.to_string(), offsets.clone()));
        Ok(())
    }

    fn commit_transaction(&self) -> Result<(), BrokerError> {
        let mut state = self.shared.state();
        state.take_fault(BrokerOperation::CommitTransaction)?;
        self.ensure_open()?;
        let transactional_id = self.check_epoch(&state)?.to_string();
        self.ensure_in_transaction()?;
        state.finish_transaction(&transactional_id, EntryStatus::Committed);
        self.in_transaction.store(false, Ordering::SeqCst);
        self.shared.appended.notify_all();
        Ok(())
    }

    fn abort_transaction(&self) -> Result<(), BrokerError> {
        let mut state = self.shared.state();
        state.take_fault(BrokerOperation::AbortTransaction)?;
        self.ensure_open()?;
        let transactional_id = self.check_epoch(&state)?.to_string();
        if self.in_transaction.swap(false, Ordering::SeqCst) {
            state.finish_transaction(&transactional_id, EntryStatus::Aborted);
            self.shared.appended.notify_all();
        }
        Ok(())
    }

    fn close(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.in_transaction.swap(false, Ordering::SeqCst) {
            let mut state = self.shared.state();
            if let Ok(transactional_id) = self.check_epoch(&state) {
                let transactional_id = transactional_id.to_string();
                state.finish_transaction(&transactional_id, EntryStatus::Aborted);
                self.shared.appended.notify_all();
            }
        }
        debug!(transactional_id = ?self.transactional_id, "producer closed");
        Ok(())
    }
}

pub struct MemoryConsumer {
    shared: Arc<Shared>,
    config: ConsumerConfig,
    positions: Mutex<HashMap<TopicPartition, i64>>,
    polled: AtomicBool,
}

impl MemoryConsumer {
    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Takes ownership of every partition of `topics`. There is no group rebalancing:
    /// each consumer owns exactly what it subscribed to.
    pub fn subscribe(&self, topics: &[&str]) -> Result<(), BrokerError> {
        let partitions = {
            let state = self.shared.state();
            let mut partitions = Vec::new();
            for topic in topics {
                let count = state
                    .topics
                    .get(*topic)
                    .ok_or_else(|| BrokerError::UnknownTopicOrPartition(topic.to_string()))?;
                partitions.extend((0..*count).map(|p| TopicPartition::new(*topic, p)));
            }
            partitions
        };
        self.assign(partitions);
        Ok(())
    }

    /// Starts each partition from the group's committed offset, or the reset policy
    /// when the group has none.
    pub fn assign(&self, partitions: impl IntoIterator<Item = TopicPartition>) {
        let mut positions = self.lock_positions();
        let state = self.shared.state();
        let committed = state.group_offsets.get(&self.config.group_id);
        positions.clear();
        for tp in partitions {
            let position = match committed.and_then(|offsets| offsets.get(&tp)) {
                Some(offset) => offset.offset,
                None => match self.config.auto_offset_reset {
                    OffsetReset::Earliest => 0,
                    OffsetReset::Latest => state.end_offset(&tp) as i64,
                },
            };
            positions.insert(tp, position);
        }
        debug!(
            group_id = %self.config.group_id,
            partitions = positions.len(),
            "assigned partitions"
        );
    }

    fn lock_positions(&self) -> MutexGuard<'_, HashMap<TopicPartition, i64>> {
        self.positions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_offsets(positions: &HashMap<TopicPartition, i64>) -> Offsets {
        positions
            .iter()
            .map(|(tp, position)| (tp.clone(), OffsetAndMetadata::new(*position)))
            .collect()
    }

    fn fetch(
        &self,
        state: &BrokerState,
        positions: &mut HashMap<TopicPartition, i64>,
    ) -> Vec<ConsumerRecord> {
        let mut records = Vec::new();
        let mut assigned: Vec<TopicPartition> = positions.keys().cloned().collect();
        assigned.sort();

        for tp in assigned {
            let Some(log) = state.logs.get(&tp) else {
                continue;
            };
            let stable = state.last_stable_offset(&tp);
            let mut next = positions.get(&tp).copied().unwrap_or(0).max(0) as usize;
            while next < stable && records.len() < self.config.max_poll_records {
                if log[next].status == EntryStatus::Committed {
                    records.push(log[next].record.clone());
                }
                next += 1;
            }
            positions.insert(tp, next as i64);
        }
        records
    }
}

impl BrokerConsumer for MemoryConsumer {
    fn poll(&self, timeout: Duration) -> Result<ConsumerRecords, BrokerError> {
        let deadline = Instant::now() + timeout;
        let mut positions = self.lock_positions();
        let mut state = self.shared.state();
        state.take_fault(BrokerOperation::Poll)?;

        // auto-commit covers what the previous poll returned, so the first poll commits nothing
        let previously_polled = self.polled.swap(true, Ordering::SeqCst);
        if self.config.enable_auto_commit && previously_polled && !positions.is_empty() {
            let offsets = Self::current_offsets(&positions);
            state
                .group_offsets
                .entry(self.config.group_id.clone())
                .or_default()
                .extend(offsets);
        }

        loop {
            let records = self.fetch(&state, &mut positions);
            let now = Instant::now();
            if !records.is_empty() || now >= deadline {
                return Ok(ConsumerRecords::new(records));
            }
            state = self
                .shared
                .appended
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn position(&self, partition: &TopicPartition) -> Result<i64, BrokerError> {
        self.shared.state().take_fault(BrokerOperation::Position)?;
        self.lock_positions().get(partition).copied().ok_or_else(|| {
            BrokerError::IllegalState(format!(
                "can only check the position of assigned partitions, {} is not assigned",
                partition
            ))
        })
    }

    fn assignment(&self) -> HashSet<TopicPartition> {
        self.lock_positions().keys().cloned().collect()
    }

    fn group_id(&self) -> String {
        self.config.group_id.clone()
    }

    fn commit_async(&self, offsets: Option<Offsets>, callback: CommitCallback) {
        let result = {
            let positions = self.lock_positions();
            let mut state = self.shared.state();
            state.take_fault(BrokerOperation::Commit).map(|()| {
                let offsets = offsets.unwrap_or_else(|| Self::current_offsets(&positions));
                state
                    .group_offsets
                    .entry(self.config.group_id.clone())
                    .or_default()
                    .extend(offsets.clone());
                offsets
            })
        };

        self.shared.dispatch(move || match result {
            Ok(offsets) => callback(Some(offsets), None),
            Err(error) => callback(None, Some(error)),
        });
    }

    fn poll_timeout(&self) -> Duration {
        self.config.poll_timeout
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
