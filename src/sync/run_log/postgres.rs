// ABOUTME: PostgresRunLog - run log table stored in the destination database
// ABOUTME: Serializes run starts per table with a transaction-scoped advisory lock

use chrono::{DateTime, Utc};
use tokio_postgres::Row;
use uuid::Uuid;

use super::{
    to_i64, to_u64, RunCompletion, RunLogEntry, RunLogStore, RunStatus, ABANDONED_RUN_MESSAGE,
};
use crate::error::{SyncError, SyncResult};
use crate::postgres::ConnectionFactory;
use crate::sync::watermark::Watermark;
use crate::utils::{qualified_name, quote_ident};

const ENTRY_COLUMNS: &str = "run_id, table_name, started_at, completed_at, status, \
     records_scanned, records_inserted, records_updated, attempts, error_message, \
     last_run_at, last_processed_id";

/// Run log persisted as a table, by default `"public"."sync_run_log"` in the
/// destination database.
pub struct PostgresRunLog {
    connections: ConnectionFactory,
    schema: String,
    table: String,
    stale_after: chrono::Duration,
}

impl PostgresRunLog {
    pub fn new(
        connections: ConnectionFactory,
        schema: &str,
        table: &str,
        stale_after: chrono::Duration,
    ) -> Self {
        Self {
            connections,
            schema: schema.to_string(),
            table: table.to_string(),
            stale_after,
        }
    }

    fn qualified(&self) -> String {
        qualified_name(&self.schema, &self.table)
    }

    fn stale_minutes(&self) -> i32 {
        i32::try_from(self.stale_after.num_minutes()).unwrap_or(i32::MAX)
    }
}

impl RunLogStore for PostgresRunLog {
    async fn initialize(&self) -> SyncResult<()> {
        let client = self.connections.connect().await?;
        let ddl = format!(
            r#"CREATE TABLE IF NOT EXISTS {table} (
                run_id BIGSERIAL PRIMARY KEY,
                table_name TEXT NOT NULL,
                started_at TIMESTAMPTZ NOT NULL,
                completed_at TIMESTAMPTZ,
                last_run_at TIMESTAMPTZ,
                last_processed_id BIGINT,
                records_inserted BIGINT NOT NULL DEFAULT 0,
                records_updated BIGINT NOT NULL DEFAULT 0,
                records_scanned BIGINT NOT NULL DEFAULT 0,
                attempts INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                error_message TEXT,
                run_token UUID
            );
            ALTER TABLE {table} ADD COLUMN IF NOT EXISTS run_token UUID;
            CREATE INDEX IF NOT EXISTS {index} ON {table} (table_name, status, run_id DESC);"#,
            table = self.qualified(),
            index = quote_ident(&format!("{}_table_status_idx", self.table)),
        );
        client
            .batch_execute(&ddl)
            .await
            .map_err(|e| SyncError::persistence("failed to create run log table", e))?;
        tracing::debug!("Run log table {} is ready", self.qualified());
        Ok(())
    }

    async fn get_last_run(&self, table_name: &str) -> SyncResult<Watermark> {
        let client = self.connections.connect().await?;
        let query = format!(
            "SELECT last_run_at, last_processed_id FROM {} \
             WHERE table_name = $1 AND status = $2 \
             ORDER BY last_run_at DESC NULLS LAST, last_processed_id DESC NULLS LAST, run_id DESC \
             LIMIT 1",
            self.qualified()
        );
        let row = client
            .query_opt(&query, &[&table_name, &RunStatus::Success.as_str()])
            .await
            .map_err(|e| SyncError::persistence("failed to read last successful run", e))?;

        Ok(match row {
            Some(row) => Watermark {
                last_run_at: row.get(0),
                last_processed_id: row.get(1),
            },
            None => Watermark::empty(),
        })
    }

    async fn start_run(&self, table_name: &str, run_token: Uuid) -> SyncResult<i64> {
        let mut client = self.connections.connect().await?;
        let tx = client
            .transaction()
            .await
            .map_err(|e| SyncError::persistence("failed to begin run log transaction", e))?;

        // Serializes concurrent starts for the same table across processes.
        let lock_key = format!("{}:{}", self.table, table_name);
        tx.execute("SELECT pg_advisory_xact_lock(hashtext($1))", &[&lock_key])
            .await
            .map_err(|e| SyncError::persistence("failed to lock run log", e))?;

        let running = tx
            .query(
                &format!(
                    "SELECT run_id, started_at < now() - make_interval(mins => $2) AS stale, \
                     run_token = $4 AS ours \
                     FROM {} WHERE table_name = $1 AND status = $3 ORDER BY run_id DESC",
                    self.qualified()
                ),
                &[
                    &table_name,
                    &self.stale_minutes(),
                    &RunStatus::Running.as_str(),
                    &run_token,
                ],
            )
            .await
            .map_err(|e| SyncError::persistence("failed to check for running entries", e))?;

        if let Some(row) = running.iter().find(|row| row.get::<_, Option<bool>>(2) == Some(true)) {
            let run_id: i64 = row.get(0);
            tracing::debug!("Run {} for {} was already opened by this cycle", run_id, table_name);
            return Ok(run_id);
        }

        for row in &running {
            let run_id: i64 = row.get(0);
            let stale: bool = row.get(1);
            if !stale {
                return Err(SyncError::RunInProgress {
                    table: table_name.to_string(),
                    run_id,
                });
            }
        }

        if !running.is_empty() {
            let closed = tx
                .execute(
                    &format!(
                        "UPDATE {} SET completed_at = now(), status = $2, error_message = $3 \
                         WHERE table_name = $1 AND status = $4",
                        self.qualified()
                    ),
                    &[
                        &table_name,
                        &RunStatus::Failed.as_str(),
                        &ABANDONED_RUN_MESSAGE,
                        &RunStatus::Running.as_str(),
                    ],
                )
                .await
                .map_err(|e| SyncError::persistence("failed to close stale runs", e))?;
            tracing::warn!(
                "Closed {} stale running entr{} for {}",
                closed,
                if closed == 1 { "y" } else { "ies" },
                table_name
            );
        }

        let row = tx
            .query_one(
                &format!(
                    "INSERT INTO {} (table_name, started_at, status, run_token) \
                     VALUES ($1, now(), $2, $3) RETURNING run_id",
                    self.qualified()
                ),
                &[&table_name, &RunStatus::Running.as_str(), &run_token],
            )
            .await
            .map_err(|e| SyncError::persistence("failed to insert run log entry", e))?;
        let run_id: i64 = row.get(0);

        tx.commit()
            .await
            .map_err(|e| SyncError::persistence("failed to commit run log entry", e))?;
        Ok(run_id)
    }

    async fn complete_run(
        &self,
        run_id: i64,
        table_name: &str,
        completion: &RunCompletion,
    ) -> SyncResult<()> {
        completion.check_terminal(run_id)?;
        let client = self.connections.connect().await?;
        let updated = client
            .execute(
                &format!(
                    "UPDATE {} SET completed_at = now(), last_run_at = $3, last_processed_id = $4, \
                     records_inserted = $5, records_updated = $6, records_scanned = $7, \
                     attempts = $8, status = $9, error_message = $10 \
                     WHERE run_id = $1 AND table_name = $2 AND status = $11",
                    self.qualified()
                ),
                &[
                    &run_id,
                    &table_name,
                    &completion.watermark.last_run_at,
                    &completion.watermark.last_processed_id,
                    &to_i64(completion.records_inserted),
                    &to_i64(completion.records_updated),
                    &to_i64(completion.records_scanned),
                    &i32::try_from(completion.attempts).unwrap_or(i32::MAX),
                    &completion.status.as_str(),
                    &completion.error_message,
                    &RunStatus::Running.as_str(),
                ],
            )
            .await
            .map_err(|e| SyncError::persistence("failed to complete run log entry", e))?;

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
        let client = self.connections.connect().await?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = match table_name {
            Some(table_name) => {
                client
                    .query(
                        &format!(
                            "SELECT {} FROM {} WHERE table_name = $1 ORDER BY run_id DESC LIMIT $2",
                            ENTRY_COLUMNS,
                            self.qualified()
                        ),
                        &[&table_name, &limit],
                    )
                    .await
            }
            None => {
                client
                    .query(
                        &format!(
                            "SELECT {} FROM {} ORDER BY run_id DESC LIMIT $1",
                            ENTRY_COLUMNS,
                            self.qualified()
                        ),
                        &[&limit],
                    )
                    .await
            }
        }
        .map_err(|e| SyncError::persistence("failed to read run log", e))?;

        rows.iter().map(entry_from_row).collect()
    }
}

fn entry_from_row(row: &Row) -> SyncResult<RunLogEntry> {
    let status: String = row.get(4);
    let started_at: DateTime<Utc> = row.get(2);
    Ok(RunLogEntry {
        run_id: row.get(0),
        table_name: row.get(1),
        started_at,
        completed_at: row.get(3),
        status: status.parse()?,
        records_scanned: to_u64(row.get(5)),
        records_inserted: to_u64(row.get(6)),
        records_updated: to_u64(row.get(7)),
        attempts: u32::try_from(row.get::<_, i32>(8)).unwrap_or(0),
        error_message: row.get(9),
        watermark: Watermark {
            last_run_at: row.get(10),
            last_processed_id: row.get(11),
        },
    })
}
