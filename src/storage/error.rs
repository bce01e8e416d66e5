//! Storage layer error types
//!
//! Defines all errors that can occur while scanning storage roots, opening
//! index files and reading or rewriting data records.

use std::path::PathBuf;
use thiserror::Error;

/// `EMFILE` on every unix the service runs on.
const EMFILE: i32 = 24;

/// Errors that can occur in the storage layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(std::io::Error),

    /// A file that the directory cache advertised is gone
    #[error("File not found: {0}")]
    NotFound(String),

    /// The process ran out of file descriptors
    #[error("Too many open files: {0}")]
    TooManyOpenFiles(String),

    /// Data corruption detected (checksum mismatch, invalid magic, etc.)
    #[error("Corrupt data: {0}")]
    Corruption(String),

    /// A data record could not be parsed
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// A file name does not follow the `YYYY_DDD_NODE.idx` convention
    #[error("Invalid index file name: {0:?}")]
    InvalidFileName(PathBuf),

    /// Sample decoding or encoding failed
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        if err.raw_os_error() == Some(EMFILE) {
            return StorageError::TooManyOpenFiles(err.to_string());
        }
        match err.kind() {
            std::io::ErrorKind::NotFound => StorageError::NotFound(err.to_string()),
            _ => StorageError::Io(err),
        }
    }
}

impl StorageError {
    /// True for errors caused by a file vanishing underneath us
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

/// Errors raised by a [`SampleCodec`](crate::storage::codec::SampleCodec)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The encoding is not handled by this codec
    #[error("unsupported encoding {0}")]
    Unsupported(u8),

    /// The payload holds fewer samples than the header claims
    #[error("payload too short: need {needed} bytes, have {available}")]
    ShortPayload { needed: usize, available: usize },

    /// Encoded samples do not fit in the space available
    #[error("{samples} samples do not fit in {capacity} bytes")]
    Overflow { samples: usize, capacity: usize },
}

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StorageError::Corruption("bad magic".to_string());
        assert_eq!(err.to_string(), "Corrupt data: bad magic");

        let err = StorageError::Codec(CodecError::Unsupported(10));
        assert_eq!(err.to_string(), "Codec error: unsupported encoding 10");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let storage_err: StorageError = io_err.into();
        assert!(storage_err.is_not_found());

        let io_err = std::io::Error::from_raw_os_error(EMFILE);
        let storage_err: StorageError = io_err.into();
        assert!(matches!(storage_err, StorageError::TooManyOpenFiles(_)));

        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        let storage_err: StorageError = io_err.into();
        assert!(matches!(storage_err, StorageError::Io(_)));
    }
}
