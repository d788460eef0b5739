use thiserror::Error;

/// Errors that can occur in the storage layer.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Internal error: {0}")]
    Internal(String),

    /// A blob could not be decoded, merged or diffed by the document model.
    #[error("Document model error: {0}")]
    Model(String),
}

/// A failure of one follower during a fan-out.
///
/// These never surface from the operation that triggered the fan-out; they are
/// collected and logged by `AutoSyncDocStorage::iterate_followers`.
#[derive(Error, Debug)]
#[error("follower {follower} failed: {source}")]
pub struct FollowerError {
    /// Position of the follower in the auto-sync follower list.
    pub follower: usize,
    #[source]
    pub source: StorageError,
}
