use crate::domain::{BrokerError, ConsumerRecords, Offsets, TopicPartition};
use std::collections::HashSet;
use std::time::Duration;

pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Invoked exactly once, on the broker client's I/O thread, with either the committed
/// offsets or the error that prevented the commit.
pub type CommitCallback = Box<dyn FnOnce(Option<Offsets>, Option<BrokerError>) + Send + 'static>;

/// The consumer half of the broker client.
///
/// Position state is owned by the implementation; callers drive it from a single
/// logical flow at a time.
pub trait BrokerConsumer: Send + Sync {
    /// Blocks for at most `timeout` and returns whatever records became available,
    /// possibly none.
    fn poll(&self, timeout: Duration) -> Result<ConsumerRecords, BrokerError>;

    /// The offset of the next record that will be fetched from `partition`.
    fn position(&self, partition: &TopicPartition) -> Result<i64, BrokerError>;

    fn assignment(&self) -> HashSet<TopicPartition>;

    fn group_id(&self) -> String;

    /// Commits `offsets`, or every currently owned position when `None`. Never blocks.
    fn commit_async(&self, offsets: Option<Offsets>, callback: CommitCallback);

    fn poll_timeout(&self) -> Duration {
        DEFAULT_POLL_TIMEOUT
    }
}
