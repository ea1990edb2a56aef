use thiserror::Error;

/// Failures reported by the broker client, either through a completion callback or
/// raised by one of its blocking calls.
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error("Authentication failed: {0}")]
    Authentication(String),
    #[error("Authorization failed: {0}")]
    Authorization(String),
    #[error("Illegal state: {0}")]
    IllegalState(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Producer fenced: {0}")]
    ProducerFenced(String),
    #[error("Out of order sequence number: {0}")]
    OutOfOrderSequence(String),
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(String),
    #[error("Coordinator not available: {0}")]
    CoordinatorUnavailable(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Unknown topic or partition: {0}")]
    UnknownTopicOrPartition(String),
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("Kafka error: {0}")]
    Kafka(String),
    #[error(transparent)]
    Resume(#[from] ResumeError),
}

impl BrokerError {
    /// Whether the producer that reported this error can no longer be used and must be
    /// closed and recreated.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BrokerError::ProducerFenced(_)
                | BrokerError::OutOfOrderSequence(_)
                | BrokerError::UnsupportedVersion(_)
                | BrokerError::Authorization(_)
        )
    }

    /// Whether retrying the whole operation later may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            BrokerError::CoordinatorUnavailable(_)
                | BrokerError::Network(_)
                | BrokerError::Timeout(_)
                | BrokerError::UnknownTopicOrPartition(_)
        )
    }
}

/// Failures of the suspension bridge itself, as opposed to failures it relays.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResumeError {
    #[error("completion was dropped without being resolved")]
    Dropped,
    #[error("completion resolved with neither a value nor an error")]
    Empty,
    #[error("resuming the suspended call panicked: {0}")]
    Panicked(String),
    #[error("no execution context available to resume on: {0}")]
    NoDispatcher(String),
}
