use conduit_core::MessagingError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("No transaction is bound")]
    NotBound,

    #[error("Transaction {0} is already bound")]
    AlreadyBound(String),

    #[error("No transaction factory configured for action {0}")]
    NoFactory(String),

    #[error("No suspended transaction to resume")]
    NothingSuspended,

    #[error("No isolated transaction to restore")]
    NothingIsolated,

    #[error("Transaction {operation} failed: {reason}")]
    Operation { operation: String, reason: String },

    #[error("Unknown transaction action: {0}")]
    InvalidAction(String),
}

impl TransactionError {
    /// Create an error for a failed transaction operation.
    pub fn operation(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Operation {
            operation: operation.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Messaging(#[from] MessagingError),

    #[error("Illegal transaction state: {0}")]
    IllegalTransactionState(String),

    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),
}

impl ExecutionError {
    pub fn as_messaging(&self) -> Option<&MessagingError> {
        match self {
            Self::Messaging(e) => Some(e),
            _ => None,
        }
    }

    pub fn into_messaging(self) -> std::result::Result<MessagingError, Self> {
        match self {
            Self::Messaging(e) => Ok(e),
            other => Err(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, ExecutionError>;
