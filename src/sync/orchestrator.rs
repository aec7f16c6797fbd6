// ABOUTME: SyncOrchestrator - one synchronization cycle over all configured tables
// ABOUTME: Drives run log, extraction and merge per table with retries and failure isolation

use std::sync::Mutex;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::extractor::{ChangeSource, Extraction};
use super::merge::{MergeOutcome, MergeTarget};
use super::retry::{with_cancellation, RetryPolicy};
use super::run_log::{RunCompletion, RunLogStore, RunStatus};
use super::watermark::Watermark;
use crate::config::{SyncSettings, TableSyncConfig};
use crate::error::{ErrorKind, SyncError, SyncResult};

/// What happened to one table during a cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct TableOutcome {
    pub table: String,
    /// `None` when no run could be opened (run log unreachable or another
    /// run in progress).
    pub run_id: Option<i64>,
    pub status: RunStatus,
    pub watermark: Watermark,
    pub records_scanned: u64,
    pub records_inserted: u64,
    pub records_updated: u64,
    pub attempts: u32,
    pub error: Option<String>,
    /// The terminal status was written to the run log.
    pub recorded: bool,
    /// More changes than `batch_size` were waiting.
    pub truncated: bool,
    pub duration_ms: u64,
}

impl TableOutcome {
    fn not_started(table: &str, error: &SyncError, attempts: u32, started: Instant) -> Self {
        Self {
            table: table.to_string(),
            run_id: None,
            status: RunStatus::Failed,
            watermark: Watermark::empty(),
            records_scanned: 0,
            records_inserted: 0,
            records_updated: 0,
            attempts,
            error: Some(error.to_string()),
            recorded: false,
            truncated: false,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == RunStatus::Failed
    }
}

/// Statistics from a sync cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    /// One entry per table processed, in configured order.
    pub tables: Vec<TableOutcome>,
    /// Cancellation stopped the cycle; later tables were not attempted.
    pub cancelled: bool,
    pub duration_ms: u64,
}

impl CycleReport {
    /// Check if every table completed and the cycle was not cancelled.
    pub fn is_success(&self) -> bool {
        !self.cancelled && self.tables.iter().all(|t| !t.is_failed())
    }

    pub fn failures(&self) -> impl Iterator<Item = &TableOutcome> {
        self.tables.iter().filter(|t| t.is_failed())
    }

    pub fn outcome(&self, table: &str) -> Option<&TableOutcome> {
        self.tables.iter().find(|t| t.table == table)
    }

    pub fn rows_inserted(&self) -> u64 {
        self.tables.iter().map(|t| t.records_inserted).sum()
    }

    pub fn rows_updated(&self) -> u64 {
        self.tables.iter().map(|t| t.records_updated).sum()
    }
}

/// Result of one successful attempt.
struct AttemptResult {
    extraction: Extraction,
    merged: MergeOutcome,
}

/// Synchronizes every configured table, strictly one after another.
///
/// Per table: open a `Running` entry, then (inside the retry policy) read the
/// last successful watermark, fetch changes and merge them, then close the
/// entry once with the outcome of the final attempt. Every logical cycle
/// therefore leaves exactly one terminal run log record per table.
pub struct SyncOrchestrator<L, S, M> {
    settings: SyncSettings,
    run_log: L,
    source: S,
    target: M,
    retry: RetryPolicy,
}

impl<L, S, M> SyncOrchestrator<L, S, M>
where
    L: RunLogStore,
    S: ChangeSource,
    M: MergeTarget,
{
    /// Settings are validated here so a bad configuration fails before any
    /// table is touched.
    pub fn new(settings: SyncSettings, run_log: L, source: S, target: M) -> SyncResult<Self> {
        settings.validate()?;
        let retry = RetryPolicy::from_settings(&settings.retry);
        Ok(Self {
            settings,
            run_log,
            source,
            target,
            retry,
        })
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn run_log(&self) -> &L {
        &self.run_log
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn target(&self) -> &M {
        &self.target
    }

    /// Run one cycle over all configured tables.
    ///
    /// Table failures are recorded and reported, never propagated. When
    /// `cancel` fires the current table is closed as `Failed` (best effort)
    /// and the remaining tables are skipped.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> CycleReport {
        let started = Instant::now();
        let mut report = CycleReport::default();

        tracing::info!(
            "Starting sync cycle for {} table(s){}",
            self.settings.tables.len(),
            if self.settings.dry_run { " (dry run)" } else { "" }
        );

        for table in &self.settings.tables {
            if cancel.is_cancelled() {
                break;
            }
            let outcome = self.sync_table(table, cancel).await;
            report.tables.push(outcome);
        }

        report.cancelled = cancel.is_cancelled();
        report.duration_ms = started.elapsed().as_millis() as u64;

        if report.cancelled {
            tracing::warn!(
                "Sync cycle cancelled after {} of {} table(s)",
                report.tables.len(),
                self.settings.tables.len()
            );
        }
        tracing::info!(
            "Sync cycle finished in {}ms: {} table(s), {} failed, {} inserted, {} updated",
            report.duration_ms,
            report.tables.len(),
            report.failures().count(),
            report.rows_inserted(),
            report.rows_updated()
        );
        report
    }

    /// Synchronize one table: `Pending -> Running -> {Success, DryRun, Failed}`.
    pub async fn sync_table(&self, table: &TableSyncConfig, cancel: &CancellationToken) -> TableOutcome {
        let started = Instant::now();
        let name = table.name.as_str();
        tracing::info!("Syncing {} into {}", name, table.destination_table());

        // Retries reuse the token, so a start that committed before its reply
        // was lost resolves to the same run instead of blocking the table.
        let run_token = Uuid::new_v4();
        let opened = self
            .retry
            .execute_if(cancel, is_connectivity, |_| {
                with_cancellation(cancel, self.run_log.start_run(name, run_token))
            })
            .await;
        let run_id = match opened.result {
            Ok(run_id) => run_id,
            Err(e) => {
                match &e {
                    SyncError::RunInProgress { .. } => tracing::warn!("Skipping {}: {}", name, e),
                    SyncError::Cancelled => tracing::info!("Skipping {}: {}", name, e),
                    _ => tracing::error!("Could not open a run for {}: {}", name, e),
                }
                return TableOutcome::not_started(name, &e, opened.attempts, started);
            }
        };

        let observed = Mutex::new(Watermark::empty());
        let attempted = self
            .retry
            .execute(cancel, |attempt| self.attempt(table, attempt, &observed, cancel))
            .await;
        let starting_watermark = observed.lock().map(|w| *w).unwrap_or_default();

        let (completion, truncated) = match &attempted.result {
            Ok(done) => (
                RunCompletion {
                    status: if self.settings.dry_run {
                        RunStatus::DryRun
                    } else {
                        RunStatus::Success
                    },
                    watermark: done.extraction.watermark,
                    records_scanned: done.extraction.scanned(),
                    records_inserted: done.merged.inserted,
                    records_updated: done.merged.updated,
                    attempts: attempted.attempts,
                    error_message: None,
                },
                done.extraction.truncated,
            ),
            Err(e) => (
                RunCompletion::failed(starting_watermark, attempted.attempts, e),
                false,
            ),
        };

        let recorded = self.close_run(run_id, name, &completion, cancel).await;

        match &attempted.result {
            Ok(_) => {
                tracing::info!(
                    "Synced {}: {} scanned, {} inserted, {} updated, watermark {}{}",
                    name,
                    completion.records_scanned,
                    completion.records_inserted,
                    completion.records_updated,
                    completion.watermark,
                    if self.settings.dry_run { " (dry run)" } else { "" }
                );
                if truncated {
                    tracing::info!(
                        "{} has more than {} pending changes; the rest follows next cycle",
                        name,
                        self.settings.batch_size
                    );
                }
            }
            Err(e) => tracing::error!(
                "Failed to sync {} after {} attempt(s): {}",
                name,
                attempted.attempts,
                e
            ),
        }

        TableOutcome {
            table: name.to_string(),
            run_id: Some(run_id),
            status: completion.status,
            watermark: completion.watermark,
            records_scanned: completion.records_scanned,
            records_inserted: completion.records_inserted,
            records_updated: completion.records_updated,
            attempts: completion.attempts,
            error: completion.error_message,
            recorded,
            truncated,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    async fn attempt(
        &self,
        table: &TableSyncConfig,
        attempt: u32,
        observed: &Mutex<Watermark>,
        cancel: &CancellationToken,
    ) -> SyncResult<AttemptResult> {
        let watermark = with_cancellation(cancel, self.run_log.get_last_run(&table.name)).await?;
        if let Ok(mut seen) = observed.lock() {
            *seen = watermark;
        }
        tracing::debug!(
            "Attempt {} for {} starting from watermark {}",
            attempt,
            table.name,
            watermark
        );

        let extraction = with_cancellation(
            cancel,
            self.source.fetch(table, &watermark, self.settings.batch_size),
        )
        .await?;

        let merged = with_cancellation(
            cancel,
            self.target.apply(
                table.destination_table(),
                &table.primary_key,
                &extraction.batch,
                self.settings.dry_run,
            ),
        )
        .await?;

        Ok(AttemptResult { extraction, merged })
    }

    /// Write the terminal status. Returns whether it was recorded.
    async fn close_run(
        &self,
        run_id: i64,
        table_name: &str,
        completion: &RunCompletion,
        cancel: &CancellationToken,
    ) -> bool {
        let result = if cancel.is_cancelled() {
            self.complete_best_effort(run_id, table_name, completion).await
        } else {
            // Only connection failures are retried: a lost reply to an UPDATE
            // that committed would otherwise turn into a double completion.
            let closed = self
                .retry
                .execute_if(cancel, is_connectivity, |_| {
                    with_cancellation(cancel, self.run_log.complete_run(run_id, table_name, completion))
                })
                .await;
            match closed.result {
                Err(SyncError::Cancelled) => {
                    self.complete_best_effort(run_id, table_name, completion).await
                }
                other => other,
            }
        };

        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(
                    "Failed to record {} for run {} of {}: {}",
                    completion.status,
                    run_id,
                    table_name,
                    e
                );
                false
            }
        }
    }

    /// One bounded attempt at closing a run, used once cancellation has fired.
    async fn complete_best_effort(
        &self,
        run_id: i64,
        table_name: &str,
        completion: &RunCompletion,
    ) -> SyncResult<()> {
        let timeout = self.settings.command_timeout();
        match tokio::time::timeout(timeout, self.run_log.complete_run(run_id, table_name, completion)).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Persistence(format!(
                "timed out after {:?} closing run {}",
                timeout, run_id
            ))),
        }
    }
}

fn is_connectivity(error: &SyncError) -> bool {
    error.kind() == ErrorKind::Connectivity
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::memory::{MemoryRunLog, MemorySource, MemoryTarget};

    fn settings() -> SyncSettings {
        SyncSettings {
            tables: vec![TableSyncConfig::new(
                "EXAM_SUBJECTS",
                "ID",
                "CREATE_DATE",
                "MODIFY_DATE",
            )],
            ..SyncSettings::default()
        }
    }

    #[test]
    fn test_new_rejects_invalid_settings() {
        let mut bad = settings();
        bad.batch_size = 0;
        let result = SyncOrchestrator::new(
            bad,
            MemoryRunLog::new(),
            MemorySource::new(chrono::Duration::days(30)),
            MemoryTarget::new(),
        );
        assert!(matches!(result, Err(SyncError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_touches_nothing() {
        let orchestrator = SyncOrchestrator::new(
            settings(),
            MemoryRunLog::new(),
            MemorySource::new(chrono::Duration::days(30)),
            MemoryTarget::new(),
        )
        .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = orchestrator.run_cycle(&cancel).await;
        assert!(report.cancelled);
        assert!(report.tables.is_empty());
        assert!(!report.is_success());
        assert!(orchestrator.run_log().entries().await.is_empty());
    }

    #[test]
    fn test_report_totals() {
        let outcome = |table: &str, status, inserted| TableOutcome {
            table: table.to_string(),
            run_id: Some(1),
            status,
            watermark: Watermark::empty(),
            records_scanned: inserted,
            records_inserted: inserted,
            records_updated: 1,
            attempts: 1,
            error: None,
            recorded: true,
            truncated: false,
            duration_ms: 0,
        };
        let report = CycleReport {
            tables: vec![
                outcome("A", RunStatus::Success, 3),
                outcome("B", RunStatus::Failed, 0),
            ],
            cancelled: false,
            duration_ms: 5,
        };
        assert!(!report.is_success());
        assert_eq!(report.rows_inserted(), 3);
        assert_eq!(report.rows_updated(), 2);
        assert_eq!(report.failures().count(), 1);
        assert_eq!(report.outcome("A").unwrap().records_inserted, 3);
    }
}
