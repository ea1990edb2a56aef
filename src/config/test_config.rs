use crate::domain::{
    BrokerError, ConsumerRecord, ConsumerRecords, OffsetAndMetadata, Offsets, ProducerRecord,
    RecordMetadata, TopicPartition,
};
use crate::ports::outgoing::{BrokerConsumer, BrokerProducer, CommitCallback, SendCallback};
use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

pub fn consumer_record(topic: &str, partition: i32, offset: i64) -> ConsumerRecord {
    ConsumerRecord {
        topic: topic.to_string(),
        partition,
        offset,
        timestamp: 0,
        key: None,
        value: Bytes::from(format!("{}-{}-{}", topic, partition, offset)),
    }
}

/// How many times each transactional call reached the producer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProducerCalls {
    pub begin: usize,
    pub send_offsets: Vec<(Offsets, String)>,
    pub commit: usize,
    pub abort: usize,
    pub close: usize,
}

/// Producer double that records every call and answers callbacks from its own thread,
/// like a real client's I/O thread would.
#[derive(Default)]
pub struct MockProducer {
    calls: Mutex<ProducerCalls>,
    sent: Mutex<Vec<ProducerRecord>>,
    send_answer: Mutex<Option<Result<RecordMetadata, BrokerError>>>,
    begin_failure: Mutex<Option<BrokerError>>,
    send_offsets_failure: Mutex<Option<BrokerError>>,
    commit_failure: Mutex<Option<BrokerError>>,
    abort_failure: Mutex<Option<BrokerError>>,
}

impl MockProducer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> ProducerCalls {
        self.calls.lock().unwrap().clone()
    }

    pub fn sent(&self) -> Vec<ProducerRecord> {
        self.sent.lock().unwrap().clone()
    }

    pub fn answer_sends_with(&self, answer: Result<RecordMetadata, BrokerError>) {
        *self.send_answer.lock().unwrap() = Some(answer);
    }

    pub fn fail_begin(&self, error: BrokerError) {
        *self.begin_failure.lock().unwrap() = Some(error);
    }

    pub fn fail_send_offsets(&self, error: BrokerError) {
        *self.send_offsets_failure.lock().unwrap() = Some(error);
    }

    pub fn fail_commit(&self, error: BrokerError) {
        *self.commit_failure.lock().unwrap() = Some(error);
    }

    pub fn fail_abort(&self, error: BrokerError) {
        *self.abort_failure.lock().unwrap() = Some(error);
    }

    fn check(failure: &Mutex<Option<BrokerError>>) -> Result<(), BrokerError> {
        match failure.lock().unwrap().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl BrokerProducer for MockProducer {
    fn send(&self, record: ProducerRecord, callback: SendCallback) {
        let answer = {
            let mut sent = self.sent.lock().unwrap();
            sent.push(record.clone());
            self.send_answer.lock().unwrap().clone().unwrap_or_else(|| {
                Ok(RecordMetadata {
                    topic: record.topic.clone(),
                    partition: record.partition.unwrap_or(0),
                    offset: sent.len() as i64 - 1,
                    timestamp: record.timestamp.unwrap_or(0),
                })
            })
        };

        thread::spawn(move || match answer {
            Ok(metadata) => callback(Some(metadata), None),
            Err(error) => callback(None, Some(error)),
        });
    }

    fn begin_transaction(&self) -> Result<(), BrokerError> {
        self.calls.lock().unwrap().begin += 1;
        Self::check(&self.begin_failure)
    }

    fn send_offsets_to_transaction(
        &self,
        offsets: &Offsets,
        group_id: &str,
    ) -> Result<(), BrokerError> {
        self.calls
            .lock()
            .unwrap()
            .send_offsets
            .push((offsets.clone(), group_id.to_string()));
        Self::check(&self.send_offsets_failure)
    }

    fn commit_transaction(&self) -> Result<(), BrokerError> {
        self.calls.lock().unwrap().commit += 1;
        Self::check(&self.commit_failure)
    }

    fn abort_transaction(&self) -> Result<(), BrokerError> {
        self.calls.lock().unwrap().abort += 1;
        Self::check(&self.abort_failure)
    }

    fn close(&self) -> Result<(), BrokerError> {
        self.calls.lock().unwrap().close += 1;
        Ok(())
    }
}

/// Consumer double with a fixed assignment, scripted polls and callback commits.
pub struct MockConsumer {
    group_id: String,
    positions: Mutex<HashMap<TopicPartition, i64>>,
    polls: Mutex<VecDeque<Result<ConsumerRecords, BrokerError>>>,
    poll_count: AtomicUsize,
    commit_requests: Mutex<Vec<Option<Offsets>>>,
    commit_failure: Mutex<Option<BrokerError>>,
    position_failure: Mutex<Option<BrokerError>>,
}

impl MockConsumer {
    pub fn new(group_id: &str) -> Self {
        Self {
            group_id: group_id.to_string(),
            positions: Mutex::new(HashMap::new()),
            polls: Mutex::new(VecDeque::new()),
            poll_count: AtomicUsize::new(0),
            commit_requests: Mutex::new(Vec::new()),
            commit_failure: Mutex::new(None),
            position_failure: Mutex::new(None),
        }
    }

    /// Assigns `partition` to this consumer at `position`.
    pub fn with_position(self, partition: TopicPartition, position: i64) -> Self {
        self.positions.lock().unwrap().insert(partition, position);
        self
    }

    pub fn queue_poll(&self, result: Result<ConsumerRecords, BrokerError>) {
        self.polls.lock().unwrap().push_back(result);
    }

    pub fn poll_count(&self) -> usize {
        self.poll_count.load(Ordering::SeqCst)
    }

    pub fn commit_requests(&self) -> Vec<Option<Offsets>> {
        self.commit_requests.lock().unwrap().clone()
    }

    pub fn fail_next_commit(&self, error: BrokerError) {
        *self.commit_failure.lock().unwrap() = Some(error);
    }

    pub fn fail_positions(&self, error: BrokerError) {
        *self.position_failure.lock().unwrap() = Some(error);
    }
}

impl BrokerConsumer for MockConsumer {
    fn poll(&self, _timeout: Duration) -> Result<ConsumerRecords, BrokerError> {
        self.poll_count.fetch_add(1, Ordering::SeqCst);
        self.polls
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(ConsumerRecords::empty()))
    }

    fn position(&self, partition: &TopicPartition) -> Result<i64, BrokerError> {
        if let Some(error) = self.position_failure.lock().unwrap().clone() {
            return Err(error);
        }
        self.positions
            .lock()
            .unwrap()
            .get(partition)
            .copied()
            .ok_or_else(|| BrokerError::IllegalState(format!("{} is not assigned", partition)))
    }

    fn assignment(&self) -> HashSet<TopicPartition> {
        self.positions.lock().unwrap().keys().cloned().collect()
    }

    fn group_id(&self) -> String {
        self.group_id.clone()
    }

    fn commit_async(&self, offsets: Option<Offsets>, callback: CommitCallback) {
        self.commit_requests.lock().unwrap().push(offsets.clone());
        let failure = self.commit_failure.lock().unwrap().take();
        let committed = offsets.unwrap_or_else(|| {
            self.positions
                .lock()
                .unwrap()
                .iter()
                .map(|(tp, position)| (tp.clone(), OffsetAndMetadata::new(*position)))
                .collect()
        });

        thread::spawn(move || match failure {
            Some(error) => callback(None, Some(error)),
            None => callback(Some(committed), None),
        });
    }
}
