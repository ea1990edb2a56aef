pub mod bridge;
pub mod commit;
pub mod error;
pub mod poll_stream;
pub mod send;
pub mod transaction;

pub use bridge::{Completion, SuspensionBridge};
pub use error::{ApplicationError, Result};
pub use poll_stream::{
    poll_batch_stream, poll_batches, poll_record_stream, poll_records, PollBatches, PollRecords,
    PollingConsumer, StreamingConsumer,
};
pub use transaction::{
    BrokerFailure, TransactionError, TransactionErrorKind, TransactionScope, TransactionState,
    TransactionalProducer,
};
