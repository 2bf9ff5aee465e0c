use couch_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("document store used before initialisation: {0}")]
    NotInitialized(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("revision conflict on {0}")]
    Conflict(String),
    #[error("invalid document at {path}: {message}")]
    Validation { path: String, message: String },
    #[error("document store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("document store request timed out")]
    Timeout,
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialise document: {0}")]
    Serialization(serde_json::Error),
    #[error("document store error: {0}")]
    Store(StoreError),
}

impl CoreError {
    pub(crate) fn validation(path: impl Into<String>, message: impl Into<String>) -> Self {
        CoreError::Validation {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Conflicts and store outages may succeed on a later attempt; everything else will not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::Conflict(_) | CoreError::StoreUnavailable(_) | CoreError::Timeout
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CoreError::NotFound(_))
    }
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DatabaseMissing(db) => CoreError::NotInitialized(db),
            StoreError::NotFound(what) => CoreError::NotFound(what),
            StoreError::Conflict(id) => CoreError::Conflict(id),
            StoreError::Unavailable(reason) => CoreError::StoreUnavailable(reason),
            StoreError::Timeout => CoreError::Timeout,
            other => CoreError::Store(other),
        }
    }
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;
