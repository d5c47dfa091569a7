use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SableError>;

#[derive(Debug, Error)]
pub enum SableError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("integrity violation: {0}")]
    Integrity(String),
    #[error("{0}[{1}] is already deleted")]
    AlreadyDeleted(&'static str, u64),
    #[error("no property block for key {key} in property record {record}")]
    MissingBlock { record: u64, key: u32 },
    #[error("deadlock detected: {0}")]
    Deadlock(String),
    #[error("illegal state: {0}")]
    IllegalState(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("corruption detected: {0}")]
    Corruption(String),
    #[error("{0}[{1}] not found")]
    NotFound(&'static str, u64),
}

impl SableError {
    /// True for errors a caller may recover from without abandoning the
    /// whole transaction.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SableError::AlreadyDeleted(..) | SableError::MissingBlock { .. }
        )
    }
}
