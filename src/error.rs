use thiserror::Error;

/// Errors surfaced by [`crate::store::StatStore`] operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),

    #[error("chat {0} not found")]
    ChatNotFound(String),

    /// A chunked bulk write died partway through. Chunks commit
    /// independently, so `committed` of `total` batches are durable.
    #[error("bulk write aborted after {committed}/{total} batches committed")]
    BulkWrite {
        committed: usize,
        total: usize,
        #[source]
        source: sqlx::Error,
    },
}

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("malformed chat export: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("chat export has no messages list")]
    MissingMessages,

    #[error(transparent)]
    Store(#[from] StoreError),
}
