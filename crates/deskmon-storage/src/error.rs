/// Errors raised by the metrics and alert stores.
///
/// # Examples
///
/// ```rust
/// use deskmon_storage::error::StorageError;
///
/// let err = StorageError::Corrupt {
///     column: "level",
///     detail: "unknown alert level: LOUD".to_string(),
/// };
/// assert!(err.to_string().contains("level"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// An underlying SQLite error.
    #[error("Storage: SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON serialization or deserialization of a metadata column failed.
    #[error("Storage: JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A stored value could not be mapped back onto the data model.
    #[error("Storage: corrupt value in column '{column}': {detail}")]
    Corrupt {
        column: &'static str,
        detail: String,
    },

    /// The backing store is not reachable (used by non-SQLite backends and
    /// test doubles).
    #[error("Storage: unavailable: {0}")]
    Unavailable(String),

    /// A bulk delete was requested with a filter that matches every alert.
    #[error("Storage: refusing to delete alerts without a filter")]
    UnconstrainedDelete,
}

/// Convenience `Result` alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
