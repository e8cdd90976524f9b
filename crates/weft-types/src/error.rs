use thiserror::Error;

/// Errors raised by run persistence backends.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("record not found")]
    NotFound,

    #[error("storage io error: {0}")]
    Io(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("conflicting write: {0}")]
    Conflict(String),
}
