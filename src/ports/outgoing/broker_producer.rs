use crate::domain::{BrokerError, Offsets, ProducerRecord, RecordMetadata};

/// Invoked exactly once, on the broker client's I/O thread, with either the delivery
/// metadata or the error that prevented delivery.
pub type SendCallback =
    Box<dyn FnOnce(Option<RecordMetadata>, Option<BrokerError>) + Send + 'static>;

/// The producer half of the broker client, including its transaction protocol.
///
/// Every transactional call blocks until the broker answers. An instance must not be
/// used by two transactions at once.
pub trait BrokerProducer: Send + Sync {
    /// Hands `record` to the client. Never blocks.
    fn send(&self, record: ProducerRecord, callback: SendCallback);

    fn begin_transaction(&self) -> Result<(), BrokerError>;

    fn send_offsets_to_transaction(
        &self,
        offsets: &Offsets,
        group_id: &str,
    ) -> Result<(), BrokerError>;

    fn commit_transaction(&self) -> Result<(), BrokerError>;

    fn abort_transaction(&self) -> Result<(), BrokerError>;

    fn close(&self) -> Result<(), BrokerError>;
}
