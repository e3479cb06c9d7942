use conduit_core::{Event, MessagingError, SourceError, SourceErrorStage};
use execution::ExecutionError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error(transparent)]
    Messaging(#[from] MessagingError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("Flow executor rejected work: {0}")]
    SchedulerBusy(String),

    #[error("Execution failed: {0}")]
    Execution(ExecutionError),

    #[error("Template does not support {0}")]
    UnsupportedTemplate(&'static str),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProcessingError {
    /// Recover a typed error from an opaque callback failure.
    pub fn from_failure(error: anyhow::Error) -> Self {
        let error = match error.downcast::<SourceError>() {
            Ok(source) => return Self::Source(source),
            Err(error) => error,
        };
        match error.downcast::<MessagingError>() {
            Ok(messaging) => Self::Messaging(messaging),
            Err(error) => Self::Other(error),
        }
    }

    pub fn scheduler_busy(reason: impl Into<String>) -> Self {
        Self::SchedulerBusy(reason.into())
    }
}

/// Classify a failed response send, keeping a source error the template raised itself.
pub(crate) fn source_failure(stage: SourceErrorStage, event: &Event, error: anyhow::Error) -> SourceError {
    match error.downcast::<SourceError>() {
        Ok(source) => source,
        Err(error) => SourceError::new(stage, event.clone(), error),
    }
}

impl From<ExecutionError> for ProcessingError {
    fn from(error: ExecutionError) -> Self {
        match error.into_messaging() {
            Ok(messaging) => Self::Messaging(messaging),
            Err(other) => Self::Execution(other),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ProcessingError>;
