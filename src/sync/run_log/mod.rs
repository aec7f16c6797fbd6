// ABOUTME: Run log - one audit record per synchronization cycle per table
// ABOUTME: Source of truth for watermarks; PostgreSQL and SQLite backends

mod postgres;
mod sqlite;

pub use postgres::PostgresRunLog;
pub use sqlite::SqliteRunLog;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use uuid::Uuid;

use super::watermark::Watermark;
use crate::error::{SyncError, SyncResult};

/// Error message recorded when a stale `Running` entry is closed by a newer run.
pub const ABANDONED_RUN_MESSAGE: &str = "abandoned: superseded by a later run";

/// Lifecycle of a run log entry. Only `Running` is non-terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RunStatus {
    Running,
    Success,
    DryRun,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "Running",
            RunStatus::Success => "Success",
            RunStatus::DryRun => "DryRun",
            RunStatus::Failed => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl FromStr for RunStatus {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "Running" => Ok(RunStatus::Running),
            "Success" => Ok(RunStatus::Success),
            "DryRun" => Ok(RunStatus::DryRun),
            "Failed" => Ok(RunStatus::Failed),
            other => Err(SyncError::Persistence(format!(
                "unknown run status '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted run log record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunLogEntry {
    pub run_id: i64,
    pub table_name: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub records_scanned: u64,
    pub records_inserted: u64,
    pub records_updated: u64,
    pub attempts: u32,
    pub error_message: Option<String>,
    /// Watermark in effect after the run.
    pub watermark: Watermark,
}

/// The terminal update that closes a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunCompletion {
    pub status: RunStatus,
    pub watermark: Watermark,
    pub records_scanned: u64,
    pub records_inserted: u64,
    pub records_updated: u64,
    pub attempts: u32,
    pub error_message: Option<String>,
}

impl RunCompletion {
    /// A failed run keeps the watermark it started from.
    pub fn failed(watermark: Watermark, attempts: u32, error: &SyncError) -> Self {
        Self {
            status: RunStatus::Failed,
            watermark,
            records_scanned: 0,
            records_inserted: 0,
            records_updated: 0,
            attempts,
            error_message: Some(error.to_string()),
        }
    }

    pub(crate) fn check_terminal(&self, run_id: i64) -> SyncResult<()> {
        if self.status.is_terminal() {
            Ok(())
        } else {
            Err(SyncError::Persistence(format!(
                "run {} cannot be completed with non-terminal status {}",
                run_id, self.status
            )))
        }
    }
}

/// Persistence for run log entries.
///
/// Every call reads or writes the backing store directly; nothing is cached,
/// so each read reflects the latest committed run.
pub trait RunLogStore {
    /// Create the backing table if it does not exist.
    fn initialize(&self) -> impl Future<Output = SyncResult<()>> + Send {
        async { Ok(()) }
    }

    /// Watermark of the latest `Success` run for `table_name`, or the empty
    /// watermark. `DryRun` and `Failed` runs never advance it.
    fn get_last_run(&self, table_name: &str) -> impl Future<Output = SyncResult<Watermark>> + Send;

    /// Open a `Running` entry tagged with `run_token` and return its id.
    ///
    /// A `Running` entry already tagged with the same token is returned as
    /// is, so a start whose reply was lost can be retried with the token it
    /// was first sent with. Otherwise fails with [`SyncError::RunInProgress`]
    /// while another non-stale `Running` entry exists for the table. Stale
    /// ones are closed as `Failed` first.
    fn start_run(
        &self,
        table_name: &str,
        run_token: Uuid,
    ) -> impl Future<Output = SyncResult<i64>> + Send;

    /// Close a `Running` entry. Completing the same run twice is an error.
    fn complete_run(
        &self,
        run_id: i64,
        table_name: &str,
        completion: &RunCompletion,
    ) -> impl Future<Output = SyncResult<()>> + Send;

    /// Most recent entries first, optionally for one table.
    fn recent_runs(
        &self,
        table_name: Option<&str>,
        limit: usize,
    ) -> impl Future<Output = SyncResult<Vec<RunLogEntry>>> + Send;
}

fn to_i64(count: u64) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}

fn to_u64(count: i64) -> u64 {
    u64::try_from(count).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_names() {
        for status in [
            RunStatus::Running,
            RunStatus::Success,
            RunStatus::DryRun,
            RunStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert!("Done".parse::<RunStatus>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Success.is_terminal());
        assert!(RunStatus::DryRun.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
    }

    #[test]
    fn test_failed_completion_keeps_watermark() {
        let err = SyncError::Extraction("ORA-12541: no listener".into());
        let completion = RunCompletion::failed(Watermark::empty(), 3, &err);
        assert_eq!(completion.status, RunStatus::Failed);
        assert_eq!(completion.attempts, 3);
        assert_eq!(
            completion.error_message.as_deref(),
            Some("extraction error: ORA-12541: no listener")
        );
        assert!(completion.check_terminal(1).is_ok());

        let running = RunCompletion {
            status: RunStatus::Running,
            ..completion
        };
        assert!(running.check_terminal(1).is_err());
    }
}
