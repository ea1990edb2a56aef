use crate::application::bridge::SuspensionBridge;
use crate::domain::{BrokerError, ProducerRecord, RecordMetadata};
use crate::ports::incoming::SuspendingProducer;
use crate::ports::outgoing::BrokerProducer;
use async_trait::async_trait;

#[async_trait]
impl<P> SuspendingProducer for P
where
    P: BrokerProducer + ?Sized,
{
    async fn send_suspending_with(
        &self,
        bridge: &SuspensionBridge,
        record: ProducerRecord,
    ) -> Result<RecordMetadata, BrokerError> {
        bridge
            .suspend(|completion| {
                self.send(
                    record,
                    Box::new(move |metadata, error| completion.complete(metadata, error)),
                )
            })
            .await
    }
}
