// ABOUTME: Error taxonomy for watermark-sync - one variant per failure class
// ABOUTME: Classifies driver errors and decides which failures are retried

use thiserror::Error;

/// Result alias used by every synchronization component.
pub type SyncResult<T> = Result<T, SyncError>;

/// Coarse classification of a [`SyncError`], stable across message changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    Connectivity,
    Extraction,
    Merge,
    Persistence,
    RunInProgress,
    Cancelled,
}

/// Errors raised while synchronizing a table.
///
/// Messages are stored verbatim into the run log when a run closes as
/// `Failed`, so they should read well without the surrounding log context.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Missing or invalid settings. Fatal, never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A store could not be reached.
    #[error("connectivity error: {0}")]
    Connectivity(String),

    /// Reading changed rows from the source failed or returned an unusable shape.
    #[error("extraction error: {0}")]
    Extraction(String),

    /// Applying a batch to the destination failed; nothing was committed.
    #[error("merge error: {0}")]
    Merge(String),

    /// The run log could not be read or written.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Another run for the same table has not reached a terminal status.
    #[error("a run for table {table} is already in progress (run {run_id})")]
    RunInProgress { table: String, run_id: i64 },

    #[error("synchronization cancelled")]
    Cancelled,
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Configuration(_) => ErrorKind::Configuration,
            SyncError::Connectivity(_) => ErrorKind::Connectivity,
            SyncError::Extraction(_) => ErrorKind::Extraction,
            SyncError::Merge(_) => ErrorKind::Merge,
            SyncError::Persistence(_) => ErrorKind::Persistence,
            SyncError::RunInProgress { .. } => ErrorKind::RunInProgress,
            SyncError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether the retry policy should attempt the operation again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Connectivity
                | ErrorKind::Extraction
                | ErrorKind::Merge
                | ErrorKind::Persistence
        )
    }

    /// Classify a driver error raised while reading from the source.
    pub fn extraction(context: &str, err: tokio_postgres::Error) -> Self {
        if is_connection_failure(&err) {
            SyncError::Connectivity(format!("{context}: {}", describe(&err)))
        } else {
            SyncError::Extraction(format!("{context}: {}", describe(&err)))
        }
    }

    /// Classify a driver error raised while applying a batch.
    pub fn merge(context: &str, err: tokio_postgres::Error) -> Self {
        if is_connection_failure(&err) {
            SyncError::Connectivity(format!("{context}: {}", describe(&err)))
        } else {
            SyncError::Merge(format!("{context}: {}", describe(&err)))
        }
    }

    /// Classify a driver error raised by the PostgreSQL run log.
    pub fn persistence(context: &str, err: tokio_postgres::Error) -> Self {
        if is_connection_failure(&err) {
            SyncError::Connectivity(format!("{context}: {}", describe(&err)))
        } else {
            SyncError::Persistence(format!("{context}: {}", describe(&err)))
        }
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(err: rusqlite::Error) -> Self {
        SyncError::Persistence(err.to_string())
    }
}

/// A closed connection or a failure before any server response.
fn is_connection_failure(err: &tokio_postgres::Error) -> bool {
    err.is_closed() || (err.as_db_error().is_none() && err.code().is_none())
}

/// Prefer the server's message over the driver's generic "db error".
fn describe(err: &tokio_postgres::Error) -> String {
    match err.as_db_error() {
        Some(db) => match db.detail() {
            Some(detail) => format!("{} ({})", db.message(), detail),
            None => db.message().to_string(),
        },
        None => err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(SyncError::Connectivity("down".into()).is_retryable());
        assert!(SyncError::Extraction("bad".into()).is_retryable());
        assert!(SyncError::Merge("constraint".into()).is_retryable());
        assert!(SyncError::Persistence("locked".into()).is_retryable());
        assert!(!SyncError::Configuration("missing".into()).is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
        assert!(!SyncError::RunInProgress {
            table: "t".into(),
            run_id: 1
        }
        .is_retryable());
    }

    #[test]
    fn test_messages_are_verbatim() {
        let err = SyncError::Merge("duplicate key".into());
        assert_eq!(err.to_string(), "merge error: duplicate key");
        assert_eq!(err.kind(), ErrorKind::Merge);
    }
}
