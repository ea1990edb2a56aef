pub mod error;
pub mod message;
pub mod topic;

pub use error::{BrokerError, ResumeError};
pub use message::*;
pub use topic::*;
