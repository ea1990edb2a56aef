pub mod suspending_consumer;
pub mod suspending_producer;

pub use suspending_consumer::SuspendingConsumer;
pub use suspending_producer::SuspendingProducer;
