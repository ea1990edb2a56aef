use crate::application::bridge::SuspensionBridge;
use crate::domain::{BrokerError, ProducerRecord, RecordMetadata};
use async_trait::async_trait;

/// Sending as a sequential call rather than with a callback.
#[async_trait]
pub trait SuspendingProducer: Send + Sync {
    /// Waits until the broker acknowledges `record` and returns where it was placed.
    ///
    /// Fails with exactly the error the broker reported: authentication, authorization,
    /// illegal state (closed producer or send outside a transaction), serialization or a
    /// generic broker error. Nothing is retried here.
    async fn send_suspending(&self, record: ProducerRecord) -> Result<RecordMetadata, BrokerError> {
        self.send_suspending_with(&SuspensionBridge::default(), record)
            .await
    }

    /// Like [`send_suspending`](Self::send_suspending), resuming on the bridge's
    /// execution context.
    async fn send_suspending_with(
        &self,
        bridge: &SuspensionBridge,
        record: ProducerRecord,
    ) -> Result<RecordMetadata, BrokerError>;
}
