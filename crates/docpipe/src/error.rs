//! Error types for the document pipeline

use uuid::Uuid;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, Error>;

/// Pipeline error taxonomy
///
/// Transient failures (`ExternalService`, `Timeout`, `Storage`, `Publish`,
/// plus `MissingRecord`, which can be an ordering race between an init and a
/// later status update) are recovered by message redelivery. Malformed input
/// (`UnsupportedExtension`, `UntaggedObject`, `Malformed`) is routed to a
/// FAILED pipeline-operations state instead of being retried indefinitely.
/// `JobFailed` is a permanent failure reported by the external job itself.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("object {bucket}/{key} not found")]
    ObjectNotFound { bucket: String, key: String },

    #[error("no pipeline record exists for document {0}")]
    MissingRecord(Uuid),

    #[error("object {bucket}/{key} carries no document id tag")]
    UntaggedObject { bucket: String, key: String },

    #[error("unsupported file extension {0:?}")]
    UnsupportedExtension(String),

    #[error("publish to metadata topic failed: {0}")]
    Publish(String),

    #[error("{service} request failed: {message}")]
    ExternalService { service: String, message: String },

    #[error("{service} call timed out after {secs}s")]
    Timeout { service: String, secs: u64 },

    #[error("job {job_id} for document {document_id} failed: {message}")]
    JobFailed {
        job_id: String,
        document_id: Uuid,
        message: String,
    },

    #[error("malformed payload: {0}")]
    Malformed(String),
}

impl Error {
    /// True when redelivery has a chance of succeeding
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Storage(_)
                | Error::MissingRecord(_)
                | Error::Publish(_)
                | Error::ExternalService { .. }
                | Error::Timeout { .. }
        )
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Malformed(e.to_string())
    }
}
