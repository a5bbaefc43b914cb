use thiserror::Error;

pub type Result<T> = std::result::Result<T, MemoryError>;

/// Error kinds surfaced by the profile memory engine.
///
/// `ExternalService` failures inside ingestion and consolidation are logged
/// and swallowed so the offending message is retried on a later tick; at the
/// synchronous CRUD surface every kind propagates to the caller.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("external service failure: {0}")]
    ExternalService(anyhow::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unreadable model output: {0}")]
    Parse(String),
}

impl From<mnemon_llm::AdapterError> for MemoryError {
    fn from(err: mnemon_llm::AdapterError) -> Self {
        match err {
            mnemon_llm::AdapterError::InvalidArgument(message) => Self::InvalidInput(message),
            api @ mnemon_llm::AdapterError::Api { .. } => {
                Self::ExternalService(anyhow::Error::new(api))
            }
        }
    }
}

impl From<serde_json::Error> for MemoryError {
    fn from(err: serde_json::Error) -> Self {
        Self::ExternalService(anyhow::Error::new(err))
    }
}

macro_rules! external_from {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl From<$ty> for MemoryError {
                fn from(err: $ty) -> Self {
                    Self::ExternalService(anyhow::Error::new(err))
                }
            }
        )+
    };
}

external_from!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
    tokio::sync::AcquireError,
);
