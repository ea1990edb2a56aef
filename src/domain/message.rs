use crate::domain::topic::{OffsetAndMetadata, Offsets, TopicPartition};
use bytes::Bytes;

/// A record read from a partition. Immutable once produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub timestamp: i64,
    pub key: Option<Bytes>,
    pub value: Bytes,
}

impl ConsumerRecord {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }

    /// The partition of this record paired with its offset, ready to be committed.
    pub fn partition_and_offset(&self) -> (TopicPartition, OffsetAndMetadata) {
        (self.topic_partition(), OffsetAndMetadata::new(self.offset))
    }
}

impl From<ConsumerRecord> for (Option<Bytes>, Bytes) {
    fn from(record: ConsumerRecord) -> Self {
        (record.key, record.value)
    }
}

/// The batch returned by a single poll, in arrival order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsumerRecords {
    records: Vec<ConsumerRecord>,
}

impl ConsumerRecords {
    pub fn new(records: Vec<ConsumerRecord>) -> Self {
        Self { records }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ConsumerRecord> {
        self.records.iter()
    }

    /// Partitions present in this batch, in the order they first appear.
    pub fn partitions(&self) -> Vec<TopicPartition> {
        let mut partitions: Vec<TopicPartition> = Vec::new();
        for record in &self.records {
            let tp = record.topic_partition();
            if !partitions.contains(&tp) {
                partitions.push(tp);
            }
        }
        partitions
    }

    pub fn records<'a>(
        &'a self,
        tp: &'a TopicPartition,
    ) -> impl Iterator<Item = &'a ConsumerRecord> + 'a {
        self.records
            .iter()
            .filter(move |r| r.partition == tp.partition && r.topic == tp.topic)
    }

    /// The highest offset seen for every partition in the batch, whatever order the
    /// records arrived in.
    pub fn partition_and_latest_offsets(&self) -> Offsets {
        let mut latest = Offsets::new();
        for record in &self.records {
            latest
                .entry(record.topic_partition())
                .and_modify(|current| {
                    if record.offset > current.offset {
                        *current = OffsetAndMetadata::new(record.offset);
                    }
                })
                .or_insert_with(|| OffsetAndMetadata::new(record.offset));
        }
        latest
    }
}

impl IntoIterator for ConsumerRecords {
    type Item = ConsumerRecord;
    type IntoIter = std::vec::IntoIter<ConsumerRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

impl<'a> IntoIterator for &'a ConsumerRecords {
    type Item = &'a ConsumerRecord;
    type IntoIter = std::slice::Iter<'a, ConsumerRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

/// A record handed to the producer. The broker picks the partition when none is set.
#[derive(Debug, Clone, PartialEq)]
pub struct ProducerRecord {
    pub topic: String,
    pub partition: Option<i32>,
    pub key: Option<Bytes>,
    pub value: Bytes,
    pub timestamp: Option<i64>,
}

impl ProducerRecord {
    pub fn new(topic: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            partition: None,
            key: None,
            value: value.into(),
            timestamp: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// Where the broker placed a sent record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub timestamp: i64,
}

impl RecordMetadata {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}
