/// Errors surfaced by a [`DocumentStore`](crate::DocumentStore) implementation.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("document not found: {0}")]
    NotFound(String),
    #[error("revision conflict on document {0}")]
    Conflict(String),
    #[error("database '{0}' does not exist")]
    DatabaseMissing(String),
    #[error("document store unavailable: {0}")]
    Unavailable(String),
    #[error("document store request timed out")]
    Timeout,
    #[error("document store rejected credentials")]
    Unauthorized,
    #[error("document store returned HTTP {status}: {reason}")]
    Http { status: u16, reason: String },
    #[error("failed to decode store response: {0}")]
    Decode(String),
    #[error("invalid document: {0}")]
    InvalidDocument(String),
}

impl StoreError {
    /// True if retrying the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Timeout)
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
