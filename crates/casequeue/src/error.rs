use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Backend cannot be reached; returned by the in-memory store when it is
    /// switched offline.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("job {0} not found")]
    JobNotFound(String),

    #[error("PAYLOAD_TOO_LARGE: {size} bytes exceeds limit of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("subject {0} not found")]
    EntityNotFound(String),

    #[error("version conflict on subject {key}: expected version {expected}")]
    VersionConflict { key: String, expected: i64 },

    #[error("update function failed: {0}")]
    Update(#[source] anyhow::Error),
}

impl QueueError {
    /// True when the failure came from the backing store rather than from
    /// caller input.
    pub fn is_storage(&self) -> bool {
        matches!(self, QueueError::Storage(_) | QueueError::Unavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;
