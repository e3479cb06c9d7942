use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid error type '{0}': expected NAMESPACE:IDENTIFIER")]
    InvalidErrorType(String),

    #[error("Unknown source error stage: {0}")]
    UnknownSourceErrorStage(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
