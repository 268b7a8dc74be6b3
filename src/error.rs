use std::fmt;

use thiserror::Error;

/// Rejection returned synchronously by `DownloadRegistry::enqueue`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnqueueError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Classification carried by a `Failure` terminal event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    NetworkError,
    HttpStatusError(u16),
    SizeMismatch { expected: u64, actual: u64 },
    HashMismatch { expected: String, actual: String },
    OutputFileUnwritable,
    Io,
    Internal,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::NetworkError => write!(f, "network error"),
            FailureKind::HttpStatusError(code) => write!(f, "http status {}", code),
            FailureKind::SizeMismatch { expected, actual } => {
                write!(f, "size mismatch (expected {}, got {})", expected, actual)
            }
            FailureKind::HashMismatch { expected, actual } => {
                write!(f, "hash mismatch (expected {}, got {})", expected, actual)
            }
            FailureKind::OutputFileUnwritable => write!(f, "output file unwritable"),
            FailureKind::Io => write!(f, "i/o error"),
            FailureKind::Internal => write!(f, "internal error"),
        }
    }
}

/// Failure of a single fetch/write pair.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("no data received for {0} ms")]
    ReadTimeout(u64),

    #[error("body ended after {actual} of {expected} bytes")]
    Truncated { expected: u64, actual: u64 },

    #[error("server answered with status {0}")]
    HttpStatus(u16),

    #[error("resource not found on server (status {0})")]
    NotFound(u16),

    #[error("server ignored the requested range")]
    RangeIgnored,

    #[error("failed to write chunk data: {0}")]
    Io(#[from] std::io::Error),

    #[error("transfer cancelled")]
    Cancelled,
}

impl TransferError {
    /// Maps the transfer failure onto the public failure taxonomy.
    pub fn kind(&self) -> FailureKind {
        match self {
            TransferError::Network(_)
            | TransferError::ReadTimeout(_)
            | TransferError::Truncated { .. } => FailureKind::NetworkError,
            TransferError::HttpStatus(code) | TransferError::NotFound(code) => {
                FailureKind::HttpStatusError(*code)
            }
            // A 200 answer to a ranged GET would corrupt the merge.
            TransferError::RangeIgnored => FailureKind::HttpStatusError(200),
            TransferError::Io(_) => FailureKind::Io,
            TransferError::Cancelled => FailureKind::Internal,
        }
    }
}

/// Failure while assembling or verifying the final cache file.
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("merge i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("merge cancelled")]
    Cancelled,
}

impl MergeError {
    pub fn kind(&self) -> FailureKind {
        match self {
            MergeError::SizeMismatch { expected, actual } => FailureKind::SizeMismatch {
                expected: *expected,
                actual: *actual,
            },
            MergeError::HashMismatch { expected, actual } => FailureKind::HashMismatch {
                expected: expected.clone(),
                actual: actual.clone(),
            },
            MergeError::Io(_) => FailureKind::Io,
            MergeError::Cancelled => FailureKind::Internal,
        }
    }
}
