use thiserror::Error;

/// Typed error surface of the retrieval core.
///
/// Callers translate these into user messages; inside a batch transaction any
/// error aborts the transaction and no partial writes become visible.
#[derive(Debug, Error)]
pub enum RagError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("index configuration mismatch: {0}")]
    ConfigMismatch(String),

    #[error("external service unavailable: {0}")]
    ExternalUnavailable(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RagError>;

// redb surfaces a distinct error type per operation class; all of them are
// storage failures from the core's point of view.
impl From<redb::DatabaseError> for RagError {
    fn from(err: redb::DatabaseError) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<redb::TransactionError> for RagError {
    fn from(err: redb::TransactionError) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<redb::TableError> for RagError {
    fn from(err: redb::TableError) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<redb::StorageError> for RagError {
    fn from(err: redb::StorageError) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<redb::CommitError> for RagError {
    fn from(err: redb::CommitError) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<bincode::Error> for RagError {
    fn from(err: bincode::Error) -> Self {
        Self::Storage(format!("record encoding: {err}"))
    }
}
