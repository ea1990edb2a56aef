use crate::application::bridge::SuspensionBridge;
use crate::domain::{BrokerError, OffsetAndMetadata, Offsets, TopicPartition};
use async_trait::async_trait;

/// Committing offsets as a sequential call rather than with a callback.
///
/// An empty map returned alongside a failure means the commit outcome is unknown, not
/// that nothing was committed.
#[async_trait]
pub trait SuspendingConsumer: Send + Sync {
    /// Commits every position currently owned by the consumer.
    async fn commit_suspending(&self) -> Result<Offsets, BrokerError> {
        self.commit_suspending_with(&SuspensionBridge::default(), None)
            .await
    }

    async fn commit_offsets_suspending(&self, offsets: Offsets) -> Result<Offsets, BrokerError> {
        self.commit_suspending_with(&SuspensionBridge::default(), Some(offsets))
            .await
    }

    /// Commits a single partition offset, typically a record's `partition_and_offset`.
    async fn commit_offset_suspending(
        &self,
        offset: (TopicPartition, OffsetAndMetadata),
    ) -> Result<(TopicPartition, OffsetAndMetadata), BrokerError>;

    async fn commit_suspending_with(
        &self,
        bridge: &SuspensionBridge,
        offsets: Option<Offsets>,
    ) -> Result<Offsets, BrokerError>;
}
