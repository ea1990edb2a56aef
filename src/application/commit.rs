use crate::application::bridge::SuspensionBridge;
use crate::domain::{BrokerError, OffsetAndMetadata, Offsets, TopicPartition};
use crate::ports::incoming::SuspendingConsumer;
use crate::ports::outgoing::BrokerConsumer;
use async_trait::async_trait;

#[async_trait]
impl<C> SuspendingConsumer for C
where
    C: BrokerConsumer + ?Sized,
{
    async fn commit_offset_suspending(
        &self,
        offset: (TopicPartition, OffsetAndMetadata),
    ) -> Result<(TopicPartition, OffsetAndMetadata), BrokerError> {
        let partition = offset.0.clone();
        let mut committed = self
            .commit_offsets_suspending(Offsets::from([offset]))
            .await?;

        committed
            .remove_entry(&partition)
            .ok_or_else(|| {
                BrokerError::Kafka(format!("broker did not acknowledge offset for {}", partition))
            })
    }

    async fn commit_suspending_with(
        &self,
        bridge: &SuspensionBridge,
        offsets: Option<Offsets>,
    ) -> Result<Offsets, BrokerError> {
        bridge
            .suspend(|completion| {
                self.commit_async(
                    offsets,
                    Box::new(move |committed, error| {
                        completion.resume_with(move || match error {
                            Some(error) => Err(error),
                            None => Ok(committed.unwrap_or_default()),
                        })
                    }),
                )
            })
            .await
    }
}
