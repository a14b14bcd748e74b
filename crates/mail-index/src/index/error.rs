//! Failure taxonomy of the index layer

use std::io;

/// The four kinds callers branch on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexErrorKind {
    Fault,
    Io,
    Interrupted,
    Unexpected,
}

/// Errors surfaced by [`IndexAdapter`](super::IndexAdapter) and backends
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// The index service rejected the query or write
    #[error("index rejected the request: {0}")]
    Fault(String),
    /// Transport failure; `ErrorKind::TimedOut` marks the timeout class
    #[error("index transport failure: {0}")]
    Io(#[from] io::Error),
    /// Cooperative cancellation observed between pages
    #[error("index request interrupted")]
    Interrupted,
    /// Contract violation or a response that cannot be understood
    #[error("unexpected index failure: {0}")]
    Unexpected(String),
}

impl IndexError {
    pub fn kind(&self) -> IndexErrorKind {
        match self {
            IndexError::Fault(_) => IndexErrorKind::Fault,
            IndexError::Io(_) => IndexErrorKind::Io,
            IndexError::Interrupted => IndexErrorKind::Interrupted,
            IndexError::Unexpected(_) => IndexErrorKind::Unexpected,
        }
    }

    /// Whether a retry on a connection without read timeout may help
    pub fn is_timeout(&self) -> bool {
        matches!(self, IndexError::Io(e) if e.kind() == io::ErrorKind::TimedOut)
    }

    pub fn timed_out(message: impl Into<String>) -> Self {
        IndexError::Io(io::Error::new(io::ErrorKind::TimedOut, message.into()))
    }
}

impl From<tantivy::TantivyError> for IndexError {
    fn from(err: tantivy::TantivyError) -> Self {
        match err {
            tantivy::TantivyError::IoError(e) => IndexError::Io(io::Error::new(e.kind(), e.to_string())),
            tantivy::TantivyError::InternalError(msg) => IndexError::Unexpected(msg),
            other => IndexError::Fault(other.to_string()),
        }
    }
}
