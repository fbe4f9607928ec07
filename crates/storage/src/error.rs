//! Errors surfaced by the persistence backends.

/// Error type for key-value store and append log operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backend failed (I/O, corruption inside the engine, ...).
    #[error("storage backend error: {0}")]
    Backend(String),

    /// An append would leave a hole in the log's contiguous id range.
    #[error("append log gap: expected id {expected}, got {got}")]
    GappedAppend {
        /// The only id the log would accept next.
        expected: u64,
        /// The id the caller tried to append.
        got: u64,
    },
}
