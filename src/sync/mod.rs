// ABOUTME: Incremental table synchronization - watermark-driven extract and merge
// ABOUTME: Trait seams for run log, source and destination, with PostgreSQL and in-memory backends

pub mod extractor;
pub mod memory;
pub mod merge;
pub mod orchestrator;
pub mod retry;
pub mod run_log;
pub mod value;
pub mod watermark;

pub use extractor::{ChangeSource, Extraction, PostgresChangeSource};
pub use merge::{MergeOutcome, MergeTarget, PostgresMergeTarget};
pub use orchestrator::{CycleReport, SyncOrchestrator, TableOutcome};
pub use retry::{RetryOutcome, RetryPolicy};
pub use run_log::{
    PostgresRunLog, RunCompletion, RunLogEntry, RunLogStore, RunStatus, SqliteRunLog,
};
pub use value::{ChangeBatch, ChangeRow, ColumnValue};
pub use watermark::Watermark;
