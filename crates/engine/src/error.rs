use dive_core::error::CoreError;
use dive_core::types::DbId;

/// Failure raised by a storage backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Rejected before any write (shape validation and similar).
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Unique index violation, e.g. two writers creating the same
    /// annotation id at the same revision.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: DbId },

    #[error("Database error: {0}")]
    Database(sqlx::Error),

    #[error("Blob I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match dive_db::unique_violation(&err) {
            Some(constraint) => StoreError::Conflict(format!(
                "Duplicate value violates unique constraint: {constraint}"
            )),
            None => StoreError::Database(err),
        }
    }
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Core(core) => core,
            StoreError::Conflict(msg) => CoreError::Conflict(msg),
            StoreError::NotFound { entity, id } => CoreError::NotFound { entity, id },
            StoreError::Io(e) => CoreError::StorageIo(e.to_string()),
            StoreError::Serialization(e) => {
                CoreError::StorageIo(format!("stored document could not be decoded: {e}"))
            }
            StoreError::Database(e) => {
                tracing::error!(error = %e, "Database error");
                CoreError::Internal(format!("database error: {e}"))
            }
        }
    }
}
