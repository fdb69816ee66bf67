//! Store error model.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Transient backend failure (connection, timeout). Retryable.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Unique-key violation (e.g. duplicate event id).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Row shape did not deserialize into the domain type.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Conflict(db.to_string())
            }
            sqlx::Error::RowNotFound => StoreError::Corrupt("row vanished mid-query".to_string()),
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                StoreError::Corrupt(err.to_string())
            }
            _ => StoreError::Unavailable(err.to_string()),
        }
    }
}
