//! Query error types
//!
//! Defines all error conditions that can occur while parsing a command,
//! matching channels and streaming or deleting records.

use crate::storage::error::{CodecError, StorageError};
use thiserror::Error;

/// Errors that can occur during query operations
#[derive(Error, Debug)]
pub enum QueryError {
    /// Command line could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),

    /// Invalid time range specified
    #[error("Invalid time range: {0}")]
    InvalidTimeRange(String),

    /// Request spans more days than allowed
    #[error("Time range of {days} days exceeds limit of {max}")]
    RangeTooLarge { days: i64, max: i64 },

    /// Delete range lies strictly inside one record
    #[error("Delete range inside single record of {channel} at {start}")]
    DeleteInsideRecord { channel: String, start: String },

    /// Index or data inconsistency that should not occur on a healthy store
    #[error("Corrupt data: {0}")]
    Corruption(String),

    /// Station metadata lookup failed
    #[error("Metadata lookup failed: {0}")]
    Metadata(String),

    /// Storage layer error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Sample decode or encode failed during a delete trim
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Client connection failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl QueryError {
    /// Errors that end the request with `<ERR>` and close the connection
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            QueryError::Parse(_)
                | QueryError::InvalidTimeRange(_)
                | QueryError::RangeTooLarge { .. }
                | QueryError::DeleteInsideRecord { .. }
                | QueryError::Corruption(_)
                | QueryError::Io(_)
                | QueryError::Storage(StorageError::TooManyOpenFiles(_))
        )
    }
}

/// Result type for query operations
pub type QueryResult<T> = Result<T, QueryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(QueryError::RangeTooLarge { days: 400, max: 365 }.is_fatal());
        assert!(QueryError::DeleteInsideRecord {
            channel: "USDUG  BHZ00".into(),
            start: "2014/01/20 12:00:00.000".into(),
        }
        .is_fatal());
        assert!(!QueryError::Metadata("timeout".into()).is_fatal());
        assert!(!QueryError::Storage(StorageError::NotFound("x".into())).is_fatal());
        assert!(QueryError::Storage(StorageError::TooManyOpenFiles("x".into())).is_fatal());
    }

    #[test]
    fn test_display() {
        let err = QueryError::RangeTooLarge { days: 400, max: 365 };
        assert_eq!(err.to_string(), "Time range of 400 days exceeds limit of 365");
    }
}
