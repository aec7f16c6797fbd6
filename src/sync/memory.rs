// ABOUTME: In-memory run log, change source and merge target
// ABOUTME: Used by tests and local experiments; supports injected failures and delays

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::extractor::{change_timestamp, change_window, primary_key_of, watermark_after, ChangeSource, Extraction};
use super::merge::{MergeOutcome, MergeTarget};
use super::run_log::{RunCompletion, RunLogEntry, RunLogStore, RunStatus, ABANDONED_RUN_MESSAGE};
use super::value::{ChangeBatch, ChangeRow};
use super::watermark::Watermark;
use crate::config::TableSyncConfig;
use crate::error::{SyncError, SyncResult};

/// Remaining injected failures per table.
#[derive(Debug, Default)]
struct FailurePlan {
    remaining: std::sync::Mutex<HashMap<String, u32>>,
}

impl FailurePlan {
    fn set(&self, table: &str, times: u32) {
        if let Ok(mut remaining) = self.remaining.lock() {
            remaining.insert(table.to_string(), times);
        }
    }

    fn take(&self, table: &str) -> bool {
        let Ok(mut remaining) = self.remaining.lock() else {
            return false;
        };
        match remaining.get_mut(table) {
            Some(0) | None => false,
            Some(n) => {
                if *n != u32::MAX {
                    *n -= 1;
                }
                true
            }
        }
    }
}

/// Run log held in memory.
pub struct MemoryRunLog {
    entries: Mutex<Vec<RunLogEntry>>,
    /// Token each run was opened with, keyed by run id.
    tokens: std::sync::Mutex<HashMap<i64, Uuid>>,
    stale_after: chrono::Duration,
    unavailable: std::sync::atomic::AtomicBool,
    lost_start_replies: AtomicU32,
}

impl MemoryRunLog {
    pub fn new() -> Self {
        Self::with_stale_after(chrono::Duration::minutes(360))
    }

    pub fn with_stale_after(stale_after: chrono::Duration) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            tokens: std::sync::Mutex::new(HashMap::new()),
            stale_after,
            unavailable: std::sync::atomic::AtomicBool::new(false),
            lost_start_replies: AtomicU32::new(0),
        }
    }

    /// The next `times` successful starts are stored but reported as a
    /// dropped connection, like a commit whose reply never arrived.
    pub fn lose_start_replies(&self, times: u32) {
        self.lost_start_replies.store(times, Ordering::SeqCst);
    }

    fn take_lost_reply(&self) -> bool {
        self.lost_start_replies
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn token_of(&self, run_id: i64) -> Option<Uuid> {
        self.tokens.lock().ok()?.get(&run_id).copied()
    }

    /// While set, every call fails with a connectivity error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// All entries, oldest first.
    pub async fn entries(&self) -> Vec<RunLogEntry> {
        self.entries.lock().await.clone()
    }

    /// Seed an entry, e.g. a run left behind by a crashed process.
    pub async fn insert(&self, mut entry: RunLogEntry) -> i64 {
        let mut entries = self.entries.lock().await;
        entry.run_id = entries.len() as i64 + 1;
        let run_id = entry.run_id;
        entries.push(entry);
        run_id
    }

    fn check_available(&self) -> SyncResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(SyncError::Connectivity("run log unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

impl Default for MemoryRunLog {
    fn default() -> Self {
        Self::new()
    }
}

impl RunLogStore for MemoryRunLog {
    async fn get_last_run(&self, table_name: &str) -> SyncResult<Watermark> {
        self.check_available()?;
        let entries = self.entries.lock().await;
        Ok(entries
            .iter()
            .filter(|e| e.table_name == table_name && e.status == RunStatus::Success)
            .max_by_key(|e| (e.watermark, e.run_id))
            .map(|e| e.watermark)
            .unwrap_or_default())
    }

    async fn start_run(&self, table_name: &str, run_token: Uuid) -> SyncResult<i64> {
        self.check_available()?;
        let now = Utc::now();
        let mut entries = self.entries.lock().await;

        let is_running = |e: &RunLogEntry| e.table_name == table_name && e.status == RunStatus::Running;
        if let Some(ours) = entries
            .iter()
            .find(|e| is_running(e) && self.token_of(e.run_id) == Some(run_token))
        {
            return Ok(ours.run_id);
        }

        let cutoff = now
            .checked_sub_signed(self.stale_after)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        if let Some(active) = entries
            .iter()
            .find(|e| is_running(e) && e.started_at >= cutoff)
        {
            return Err(SyncError::RunInProgress {
                table: table_name.to_string(),
                run_id: active.run_id,
            });
        }
        for entry in entries.iter_mut().filter(|e| is_running(e)) {
            entry.status = RunStatus::Failed;
            entry.completed_at = Some(now);
            entry.error_message = Some(ABANDONED_RUN_MESSAGE.to_string());
        }

        let run_id = entries.len() as i64 + 1;
        entries.push(RunLogEntry {
            run_id,
            table_name: table_name.to_string(),
            started_at: now,
            completed_at: None,
            status: RunStatus::Running,
            records_scanned: 0,
            records_inserted: 0,
            records_updated: 0,
            attempts: 0,
            error_message: None,
            watermark: Watermark::empty(),
        });
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.insert(run_id, run_token);
        }

        if self.take_lost_reply() {
            return Err(SyncError::Connectivity(
                "connection closed before the run start was acknowledged".to_string(),
            ));
        }
        Ok(run_id)
    }

    async fn complete_run(
        &self,
        run_id: i64,
        table_name: &str,
        completion: &RunCompletion,
    ) -> SyncResult<()> {
        self.check_available()?;
        completion.check_terminal(run_id)?;
        let mut entries = self.entries.lock().await;
        let entry = entries
            .iter_mut()
            .find(|e| {
                e.run_id == run_id && e.table_name == table_name && e.status == RunStatus::Running
            })
            .ok_or_else(|| {
                SyncError::Persistence(format!(
                    "run {} for {} is not running (already completed or unknown)",
                    run_id, table_name
                ))
            })?;

        entry.completed_at = Some(Utc::now());
        entry.status = completion.status;
        entry.watermark = completion.watermark;
        entry.records_scanned = completion.records_scanned;
        entry.records_inserted = completion.records_inserted;
        entry.records_updated = completion.records_updated;
        entry.attempts = completion.attempts;
        entry.error_message = completion.error_message.clone();
        Ok(())
    }

    async fn recent_runs(
        &self,
        table_name: Option<&str>,
        limit: usize,
    ) -> SyncResult<Vec<RunLogEntry>> {
        self.check_available()?;
        let entries = self.entries.lock().await;
        Ok(entries
            .iter()
            .rev()
            .filter(|e| table_name.map_or(true, |t| e.table_name == t))
            .take(limit)
            .cloned()
            .collect())
    }
}

/// Source tables held in memory, queried with the same predicate and
/// ordering as [`super::extractor::PostgresChangeSource`].
pub struct MemorySource {
    tables: Mutex<HashMap<String, Vec<ChangeRow>>>,
    lookback: chrono::Duration,
    failures: FailurePlan,
    delay: Option<Duration>,
    fetches: AtomicU32,
}

impl MemorySource {
    pub fn new(lookback: chrono::Duration) -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            lookback,
            failures: FailurePlan::default(),
            delay: None,
            fetches: AtomicU32::new(0),
        }
    }

    /// Sleep this long inside every fetch.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Add or replace a row, keyed by `primary_key`.
    pub async fn upsert(&self, table: &str, primary_key: &str, row: ChangeRow) {
        let mut tables = self.tables.lock().await;
        let rows = tables.entry(table.to_string()).or_default();
        let key = row.get(primary_key).cloned();
        match rows.iter_mut().find(|r| r.get(primary_key).cloned() == key) {
            Some(existing) => *existing = row,
            None => rows.push(row),
        }
    }

    /// Fail the next `times` fetches of `table` with an extraction error.
    /// `u32::MAX` fails forever.
    pub fn fail_next(&self, table: &str, times: u32) {
        self.failures.set(table, times);
    }

    /// Number of fetch calls so far, failed ones included.
    pub fn fetch_count(&self) -> u32 {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl ChangeSource for MemorySource {
    async fn fetch(
        &self,
        table: &TableSyncConfig,
        watermark: &Watermark,
        batch_size: usize,
    ) -> SyncResult<Extraction> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failures.take(&table.name) {
            return Err(SyncError::Extraction(format!(
                "source table {} is unavailable",
                table.name
            )));
        }

        let (since, after_id) = change_window(watermark, Utc::now(), self.lookback);
        let tables = self.tables.lock().await;
        let mut changed = Vec::new();
        for row in tables.get(&table.name).into_iter().flatten() {
            let Some(changed_at) = change_timestamp(row, table) else {
                continue;
            };
            let key = primary_key_of(row, table)?;
            let after_cursor = after_id.is_some_and(|id| key > id);
            if changed_at > since || (changed_at == since && after_cursor) {
                changed.push((changed_at, key, row.clone()));
            }
        }
        changed.sort_by_key(|(changed_at, key, _)| (*changed_at, *key));
        let truncated = changed.len() >= batch_size;
        let rows: Vec<ChangeRow> = changed
            .into_iter()
            .take(batch_size)
            .map(|(_, _, row)| row)
            .collect();

        let watermark = watermark_after(&rows, table, *watermark)?;
        Ok(Extraction {
            batch: ChangeBatch::new(rows)?,
            since,
            watermark,
            truncated,
        })
    }
}

/// Destination tables held in memory.
#[derive(Default)]
pub struct MemoryTarget {
    tables: Mutex<HashMap<String, Vec<ChangeRow>>>,
    failures: FailurePlan,
    accesses: AtomicU32,
}

impl MemoryTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current content of `table`, in insertion order.
    pub async fn rows(&self, table: &str) -> Vec<ChangeRow> {
        self.tables
            .lock()
            .await
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Fail the next `times` merges into `table`. `u32::MAX` fails forever.
    pub fn fail_next(&self, table: &str, times: u32) {
        self.failures.set(table, times);
    }

    /// Number of merges that reached the store.
    pub fn access_count(&self) -> u32 {
        self.accesses.load(Ordering::SeqCst)
    }
}

impl MergeTarget for MemoryTarget {
    async fn apply(
        &self,
        destination_table: &str,
        primary_key: &str,
        batch: &ChangeBatch,
        dry_run: bool,
    ) -> SyncResult<MergeOutcome> {
        if batch.is_empty() {
            return Ok(MergeOutcome::default());
        }
        self.accesses.fetch_add(1, Ordering::SeqCst);
        if !batch.has_column(primary_key) {
            return Err(SyncError::Merge(format!(
                "batch for {} has no primary key column {}",
                destination_table, primary_key
            )));
        }
        if self.failures.take(destination_table) {
            return Err(SyncError::Merge(format!(
                "destination table {} rejected the batch",
                destination_table
            )));
        }

        let mut tables = self.tables.lock().await;
        // Work on a copy so a failure part-way leaves the table untouched.
        let mut staged = tables.get(destination_table).cloned().unwrap_or_default();
        let mut seen = Vec::new();
        let mut outcome = MergeOutcome::default();

        for row in batch.rows() {
            let key = row.get(primary_key).cloned();
            if seen.contains(&key) {
                return Err(SyncError::Merge(format!(
                    "batch for {} contains duplicate values of {}",
                    destination_table, primary_key
                )));
            }
            seen.push(key.clone());

            match staged.iter_mut().find(|r| r.get(primary_key).cloned() == key) {
                Some(existing) => {
                    let differs = row
                        .iter()
                        .filter(|(column, _)| *column != primary_key)
                        .any(|(column, value)| existing.get(column) != Some(value));
                    if differs {
                        for (column, value) in row.iter() {
                            existing.push(column, value.clone());
                        }
                        outcome.updated += 1;
                    }
                }
                None => {
                    staged.push(row.clone());
                    outcome.inserted += 1;
                }
            }
        }

        if !dry_run {
            tables.insert(destination_table.to_string(), staged);
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::value::ColumnValue;
    use chrono::{DateTime, TimeZone};

    fn table() -> TableSyncConfig {
        TableSyncConfig::new("EXAM_SUBJECTS", "ID", "CREATE_DATE", "MODIFY_DATE")
    }

    fn row(id: i64, changed: DateTime<Utc>, name: &str) -> ChangeRow {
        ChangeRow::new()
            .with("ID", ColumnValue::Int(id))
            .with("NAME", ColumnValue::Text(name.to_string()))
            .with("CREATE_DATE", ColumnValue::TimestampTz(changed))
            .with("MODIFY_DATE", ColumnValue::Null)
    }

    #[tokio::test]
    async fn test_source_keyset_continuation() {
        let ts = Utc.with_ymd_and_hms(2024, 9, 1, 8, 0, 0).unwrap();
        let source = MemorySource::new(chrono::Duration::days(30));
        for id in [3, 1, 2] {
            source.upsert("EXAM_SUBJECTS", "ID", row(id, ts, "x")).await;
        }

        let first = source
            .fetch(&table(), &Watermark::new(ts - chrono::Duration::seconds(1), 0), 2)
            .await
            .unwrap();
        assert!(first.truncated);
        assert_eq!(first.watermark, Watermark::new(ts, 2));

        let second = source.fetch(&table(), &first.watermark, 2).await.unwrap();
        assert_eq!(second.scanned(), 1);
        assert_eq!(second.batch.rows()[0].get("ID"), Some(&ColumnValue::Int(3)));
        assert_eq!(second.watermark, Watermark::new(ts, 3));
        assert!(!second.truncated);
    }

    #[tokio::test]
    async fn test_target_dry_run_leaves_table_unchanged() {
        let ts = Utc::now();
        let target = MemoryTarget::new();
        let batch = ChangeBatch::new(vec![row(1, ts, "Physics")]).unwrap();

        let outcome = target.apply("EXAM_SUBJECTS", "ID", &batch, true).await.unwrap();
        assert_eq!(outcome, MergeOutcome { inserted: 1, updated: 0 });
        assert!(target.rows("EXAM_SUBJECTS").await.is_empty());
    }

    #[tokio::test]
    async fn test_target_rejects_duplicate_keys_atomically() {
        let ts = Utc::now();
        let target = MemoryTarget::new();
        let batch = ChangeBatch::new(vec![row(1, ts, "a"), row(1, ts, "b")]).unwrap();
        let err = target.apply("EXAM_SUBJECTS", "ID", &batch, false).await.unwrap_err();
        assert!(matches!(err, SyncError::Merge(_)));
        assert!(target.rows("EXAM_SUBJECTS").await.is_empty());
    }

    #[tokio::test]
    async fn test_run_log_double_completion_is_rejected() {
        let log = MemoryRunLog::new();
        let run_id = log.start_run("EXAM_SUBJECTS", Uuid::new_v4()).await.unwrap();
        let completion = RunCompletion {
            status: RunStatus::Success,
            watermark: Watermark::empty(),
            records_scanned: 0,
            records_inserted: 0,
            records_updated: 0,
            attempts: 1,
            error_message: None,
        };
        log.complete_run(run_id, "EXAM_SUBJECTS", &completion).await.unwrap();
        assert!(log.complete_run(run_id, "EXAM_SUBJECTS", &completion).await.is_err());
    }
}
