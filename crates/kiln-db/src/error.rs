//! Store error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    /// A phase transition that would break the monotonic order.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Another writer already holds the job's log.
    #[error("log writer busy: {0}")]
    WriterBusy(String),

    #[error("segment closed: {0}")]
    SegmentClosed(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DbError {
    /// Connection-level failures that may succeed on retry.
    pub fn is_transient(&self) -> bool {
        match self {
            DbError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::Tls(_)
            ),
            _ => false,
        }
    }
}

impl From<DbError> for kiln_core::Error {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(msg) => kiln_core::Error::NotFound(msg),
            DbError::Conflict(msg) => kiln_core::Error::Conflict(msg),
            e if e.is_transient() => kiln_core::Error::Transient(e.to_string()),
            e => kiln_core::Error::Storage(e.to_string()),
        }
    }
}

pub type DbResult<T> = std::result::Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversion_to_core_error() {
        let err: kiln_core::Error = DbError::NotFound("job 1".to_string()).into();
        assert!(matches!(err, kiln_core::Error::NotFound(_)));

        let err: kiln_core::Error = DbError::Conflict("backwards".to_string()).into();
        assert!(matches!(err, kiln_core::Error::Conflict(_)));

        let err: kiln_core::Error = DbError::Database(sqlx::Error::PoolTimedOut).into();
        assert!(err.is_transient());

        let err: kiln_core::Error = DbError::Corrupt("bad json".to_string()).into();
        assert!(matches!(err, kiln_core::Error::Storage(_)));
    }
}
