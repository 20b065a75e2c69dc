//! Error taxonomy for the engine.
//!
//! Every failure a caller can observe maps onto exactly one variant.
//! `CorruptedData` is special: it is only produced during recovery and
//! the process refuses to start when it occurs.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Referenced database, collection or vector does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Name or id collision on create/insert.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Empty name, unknown metric, zero-length elements, bad parameters.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Element count differs from the collection dimension.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Missing or rejected credential.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// Backpressure or soft memory limit; the caller may retry.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Unexpected invariant violation or I/O failure.
    #[error("internal: {0}")]
    Internal(String),

    /// RDB or AOF integrity failure during recovery. Fatal.
    #[error("corrupted data: {0}")]
    CorruptedData(String),

    /// Caller cancelled the operation or its deadline expired.
    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl Error {
    /// Short stable tag for logs and gateway status mapping.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not_found",
            Error::AlreadyExists(_) => "already_exists",
            Error::InvalidArgument(_) => "invalid_argument",
            Error::DimensionMismatch { .. } => "dimension_mismatch",
            Error::Unauthenticated(_) => "unauthenticated",
            Error::ResourceExhausted(_) => "resource_exhausted",
            Error::Internal(_) => "internal",
            Error::CorruptedData(_) => "corrupted_data",
            Error::Cancelled(_) => "cancelled",
        }
    }

    /// True when startup must be refused rather than continued.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::CorruptedData(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Internal(format!("io: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
