use thiserror::Error;

/// Errors surfaced by the model traits and the manager.
#[derive(Debug, Error, PartialEq)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("internal storage error: {0}")]
    StorageError(String),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        if value.kind() == std::io::ErrorKind::NotFound {
            Error::NotFound(value.to_string())
        } else {
            Error::StorageError(value.to_string())
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(value: tokio::task::JoinError) -> Self {
        Error::StorageError(value.to_string())
    }
}
