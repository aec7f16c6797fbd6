// ABOUTME: SqliteRunLog - run log kept in a local SQLite file
// ABOUTME: For deployments where the destination role cannot create tables

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use uuid::Uuid;

use super::{
    to_i64, to_u64, RunCompletion, RunLogEntry, RunLogStore, RunStatus, ABANDONED_RUN_MESSAGE,
};
use crate::error::{SyncError, SyncResult};
use crate::sync::watermark::Watermark;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sync_run_log (
    run_id             INTEGER PRIMARY KEY AUTOINCREMENT,
    table_name         TEXT NOT NULL,
    started_at         TEXT NOT NULL,
    completed_at       TEXT,
    last_run_at        TEXT,
    last_processed_id  INTEGER,
    records_inserted   INTEGER NOT NULL DEFAULT 0,
    records_updated    INTEGER NOT NULL DEFAULT 0,
    records_scanned    INTEGER NOT NULL DEFAULT 0,
    attempts           INTEGER NOT NULL DEFAULT 0,
    status             TEXT NOT NULL,
    error_message      TEXT,
    run_token          TEXT
);

CREATE INDEX IF NOT EXISTS sync_run_log_table_status_idx
    ON sync_run_log (table_name, status, run_id DESC);
"#;

const ENTRY_COLUMNS: &str = "run_id, table_name, started_at, completed_at, status, \
     records_scanned, records_inserted, records_updated, attempts, error_message, \
     last_run_at, last_processed_id";

/// Run log backed by a SQLite database file.
pub struct SqliteRunLog {
    path: PathBuf,
    conn: Mutex<Connection>,
    stale_after: chrono::Duration,
}

impl SqliteRunLog {
    pub fn open(path: impl AsRef<Path>, stale_after: chrono::Duration) -> SyncResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                SyncError::Persistence(format!(
                    "failed to create run log directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }
        let conn = Connection::open(path).map_err(|e| {
            SyncError::Persistence(format!(
                "failed to open run log database {}: {}",
                path.display(),
                e
            ))
        })?;
        conn.pragma_update(None, "journal_mode", "wal")?;
        conn.pragma_update(None, "synchronous", "normal").ok();
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        add_run_token_column(&conn)?;
        Ok(Self {
            path: path.to_path_buf(),
            conn: Mutex::new(conn),
            stale_after,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> SyncResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SyncError::Persistence("run log connection lock poisoned".to_string()))
    }

    fn start_run_at(
        &self,
        table_name: &str,
        run_token: Uuid,
        now: DateTime<Utc>,
    ) -> SyncResult<i64> {
        let mut conn = self.lock()?;
        // IMMEDIATE takes the write lock up front so two processes cannot both
        // pass the running check.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let token = run_token.to_string();
        let running: Vec<(i64, DateTime<Utc>, Option<String>)> = {
            let mut stmt = tx.prepare(
                "SELECT run_id, started_at, run_token FROM sync_run_log
                 WHERE table_name = ?1 AND status = ?2
                 ORDER BY run_id DESC",
            )?;
            let rows = stmt.query_map(params![table_name, RunStatus::Running.as_str()], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, DateTime<Utc>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })?;
            rows.collect::<Result<_, _>>()?
        };

        if let Some((run_id, _, _)) = running
            .iter()
            .find(|(_, _, existing)| existing.as_deref() == Some(token.as_str()))
        {
            tracing::debug!("Run {} for {} was already opened by this cycle", run_id, table_name);
            return Ok(*run_id);
        }

        let cutoff = now
            .checked_sub_signed(self.stale_after)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        if let Some((run_id, _, _)) = running
            .iter()
            .find(|(_, started_at, _)| *started_at >= cutoff)
        {
            return Err(SyncError::RunInProgress {
                table: table_name.to_string(),
                run_id: *run_id,
            });
        }

        if !running.is_empty() {
            let closed = tx.execute(
                "UPDATE sync_run_log SET completed_at = ?1, status = ?2, error_message = ?3
                 WHERE table_name = ?4 AND status = ?5",
                params![
                    now,
                    RunStatus::Failed.as_str(),
                    ABANDONED_RUN_MESSAGE,
                    table_name,
                    RunStatus::Running.as_str()
                ],
            )?;
            tracing::warn!("Closed {} stale running entries for {}", closed, table_name);
        }

        tx.execute(
            "INSERT INTO sync_run_log (table_name, started_at, status, run_token)
             VALUES (?1, ?2, ?3, ?4)",
            params![table_name, now, RunStatus::Running.as_str(), token],
        )?;
        let run_id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(run_id)
    }
}

impl RunLogStore for SqliteRunLog {
    async fn get_last_run(&self, table_name: &str) -> SyncResult<Watermark> {
        let conn = self.lock()?;
        let watermark = conn
            .query_row(
                "SELECT last_run_at, last_processed_id FROM sync_run_log
                 WHERE table_name = ?1 AND status = ?2
                 ORDER BY last_run_at DESC, last_processed_id DESC, run_id DESC
                 LIMIT 1",
                params![table_name, RunStatus::Success.as_str()],
                |row| {
                    Ok(Watermark {
                        last_run_at: row.get(0)?,
                        last_processed_id: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(watermark.unwrap_or_default())
    }

    async fn start_run(&self, table_name: &str, run_token: Uuid) -> SyncResult<i64> {
        self.start_run_at(table_name, run_token, Utc::now())
    }

    async fn complete_run(
        &self,
        run_id: i64,
        table_name: &str,
        completion: &RunCompletion,
    ) -> SyncResult<()> {
        completion.check_terminal(run_id)?;
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE sync_run_log SET completed_at = ?1, last_run_at = ?2, last_processed_id = ?3,
                 records_inserted = ?4, records_updated = ?5, records_scanned = ?6,
                 attempts = ?7, status = ?8, error_message = ?9
             WHERE run_id = ?10 AND table_name = ?11 AND status = ?12",
            params![
                Utc::now(),
                completion.watermark.last_run_at,
                completion.watermark.last_processed_id,
                to_i64(completion.records_inserted),
                to_i64(completion.records_updated),
                to_i64(completion.records_scanned),
                completion.attempts,
                completion.status.as_str(),
                completion.error_message,
                run_id,
                table_name,
                RunStatus::Running.as_str(),
            ],
        )?;
        if updated == 0 {
            return Err(SyncError::Persistence(format!(
                "run {} for {} is not running (already completed or unknown)",
                run_id, table_name
            )));
        }
        Ok(())
    }

    async fn recent_runs(
        &self,
        table_name: Option<&str>,
        limit: usize,
    ) -> SyncResult<Vec<RunLogEntry>> {
        let conn = self.lock()?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sync_run_log
             WHERE ?1 IS NULL OR table_name = ?1
             ORDER BY run_id DESC LIMIT ?2",
            ENTRY_COLUMNS
        ))?;
        let mut rows = stmt.query(params![table_name, limit])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(entry_from_row(row)?);
        }
        Ok(out)
    }
}

/// Files created before run tokens existed lack the column.
fn add_run_token_column(conn: &Connection) -> SyncResult<()> {
    let present = conn
        .prepare("SELECT 1 FROM pragma_table_info('sync_run_log') WHERE name = 'run_token'")?
        .exists([])?;
    if !present {
        conn.execute_batch("ALTER TABLE sync_run_log ADD COLUMN run_token TEXT")?;
    }
    Ok(())
}

fn entry_from_row(row: &Row<'_>) -> SyncResult<RunLogEntry> {
    let status: String = row.get(4)?;
    Ok(RunLogEntry {
        run_id: row.get(0)?,
        table_name: row.get(1)?,
        started_at: row.get(2)?,
        completed_at: row.get(3)?,
        status: status.parse()?,
        records_scanned: to_u64(row.get(5)?),
        records_inserted: to_u64(row.get(6)?),
        records_updated: to_u64(row.get(7)?),
        attempts: row.get(8)?,
        error_message: row.get(9)?,
        watermark: Watermark {
            last_run_at: row.get(10)?,
            last_processed_id: row.get(11)?,
        },
    })
}
