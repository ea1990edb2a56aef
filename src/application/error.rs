use crate::application::transaction::{BrokerFailure, TransactionError, TransactionErrorKind};
use crate::domain::error::BrokerError;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Transaction failed ({kind:?}): {message}")]
    Transaction {
        kind: TransactionErrorKind,
        message: String,
        source: Option<BrokerError>,
    },
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl ApplicationError {
    pub fn transaction_kind(&self) -> Option<TransactionErrorKind> {
        match self {
            ApplicationError::Transaction { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

impl<E: BrokerFailure + fmt::Display> From<TransactionError<E>> for ApplicationError {
    fn from(error: TransactionError<E>) -> Self {
        ApplicationError::Transaction {
            kind: error.kind(),
            message: error.to_string(),
            source: error.broker_error().cloned(),
        }
    }
}

pub type Result<T, E = ApplicationError> = std::result::Result<T, E>;
