pub mod broker_consumer;
pub mod broker_producer;

pub use broker_consumer::{BrokerConsumer, CommitCallback};
pub use broker_producer::{BrokerProducer, SendCallback};
