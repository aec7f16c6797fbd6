// ABOUTME: Merge execution - applies a change batch to the destination as an upsert
// ABOUTME: Stages rows in a temp table, then updates changed rows and inserts new ones in one transaction

use std::future::Future;
use tokio_postgres::types::ToSql;

use super::value::ChangeBatch;
use crate::error::{SyncError, SyncResult};
use crate::postgres::ConnectionFactory;
use crate::utils::{qualified_name, quote_ident};

/// PostgreSQL accepts at most 65535 bind parameters per statement.
const MAX_PARAMS: usize = 65000;

const STAGE_TABLE: &str = "_watermark_sync_stage";

/// Rows affected by one merge. In dry-run mode, what would have been affected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub inserted: u64,
    pub updated: u64,
}

/// A destination that can upsert a batch keyed by primary key.
pub trait MergeTarget {
    /// Insert rows whose key is absent, update rows whose key exists and whose
    /// values differ, leave identical rows untouched. Either the whole batch
    /// is applied or nothing is. With `dry_run` the counts are computed and
    /// the destination is left unchanged.
    fn apply(
        &self,
        destination_table: &str,
        primary_key: &str,
        batch: &ChangeBatch,
        dry_run: bool,
    ) -> impl Future<Output = SyncResult<MergeOutcome>> + Send;
}

/// Merges into tables of the destination PostgreSQL database.
pub struct PostgresMergeTarget {
    connections: ConnectionFactory,
    schema: String,
}

impl PostgresMergeTarget {
    pub fn new(connections: ConnectionFactory, schema: &str) -> Self {
        Self {
            connections,
            schema: schema.to_string(),
        }
    }
}

impl MergeTarget for PostgresMergeTarget {
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
        if !batch.has_column(primary_key) {
            return Err(SyncError::Merge(format!(
                "batch for {} has no primary key column {}",
                destination_table, primary_key
            )));
        }

        let statements = MergeStatements::new(&self.schema, destination_table, primary_key, batch.columns());
        let mut client = self.connections.connect().await?;
        let tx = client
            .transaction()
            .await
            .map_err(|e| SyncError::merge("failed to begin merge transaction", e))?;

        tx.batch_execute(&statements.create_stage)
            .await
            .map_err(|e| {
                SyncError::merge(&format!("failed to stage rows for {}", destination_table), e)
            })?;

        let params_per_row = batch.columns().len();
        let chunk_size = std::cmp::max(1, MAX_PARAMS / params_per_row);
        for chunk in batch.rows().chunks(chunk_size) {
            let query = build_stage_insert(batch.columns(), chunk.len());
            let params: Vec<&(dyn ToSql + Sync)> = chunk
                .iter()
                .flat_map(|row| row.values().map(|v| v as &(dyn ToSql + Sync)))
                .collect();
            tx.execute(&query, &params).await.map_err(|e| {
                SyncError::merge(&format!("failed to stage rows for {}", destination_table), e)
            })?;
        }

        let duplicate = tx
            .query_opt(&statements.find_duplicate_key, &[])
            .await
            .map_err(|e| SyncError::merge("failed to check staged keys", e))?;
        if duplicate.is_some() {
            return Err(SyncError::Merge(format!(
                "batch for {} contains duplicate values of {}",
                destination_table, primary_key
            )));
        }

        let outcome = if dry_run {
            let updated = count(&tx, &statements.count_changed).await?;
            let inserted = count(&tx, &statements.count_new).await?;
            tx.rollback()
                .await
                .map_err(|e| SyncError::merge("failed to roll back dry-run merge", e))?;
            MergeOutcome { inserted, updated }
        } else {
            // Update first so freshly inserted rows are not compared again.
            let updated = match &statements.update_changed {
                Some(update) => tx.execute(update, &[]).await.map_err(|e| {
                    SyncError::merge(&format!("failed to update {}", destination_table), e)
                })?,
                None => 0,
            };
            let inserted = tx.execute(&statements.insert_new, &[]).await.map_err(|e| {
                SyncError::merge(&format!("failed to insert into {}", destination_table), e)
            })?;
            tx.commit()
                .await
                .map_err(|e| SyncError::merge("failed to commit merge", e))?;
            MergeOutcome { inserted, updated }
        };

        tracing::debug!(
            "Merged {} rows into {}.{}: {} inserted, {} updated{}",
            batch.len(),
            self.schema,
            destination_table,
            outcome.inserted,
            outcome.updated,
            if dry_run { " (dry run)" } else { "" }
        );
        Ok(outcome)
    }
}

async fn count(tx: &tokio_postgres::Transaction<'_>, query: &str) -> SyncResult<u64> {
    let row = tx
        .query_one(query, &[])
        .await
        .map_err(|e| SyncError::merge("failed to compute merge counts", e))?;
    Ok(u64::try_from(row.get::<_, i64>(0)).unwrap_or(0))
}

/// SQL for one merge, built from the batch's column set.
#[derive(Debug)]
struct MergeStatements {
    create_stage: String,
    find_duplicate_key: String,
    count_changed: String,
    count_new: String,
    update_changed: Option<String>,
    insert_new: String,
}

impl MergeStatements {
    fn new(schema: &str, table: &str, primary_key: &str, columns: &[String]) -> Self {
        let target = qualified_name(schema, table);
        let stage = quote_ident(STAGE_TABLE);
        let key = quote_ident(primary_key);
        let column_list = columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let non_key: Vec<&String> = columns.iter().filter(|c| *c != primary_key).collect();

        // Compared as text: json has no equality operator, and staged values
        // already carry the destination column types.
        let changed = if non_key.is_empty() {
            "FALSE".to_string()
        } else {
            let side = |alias: &str| {
                non_key
                    .iter()
                    .map(|c| format!("{}.{}::text", alias, quote_ident(c)))
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            format!("ROW({}) IS DISTINCT FROM ROW({})", side("d"), side("s"))
        };
        let missing = format!(
            "NOT EXISTS (SELECT 1 FROM {target} d WHERE d.{key} = s.{key})",
            target = target,
            key = key
        );

        let update_changed = if non_key.is_empty() {
            None
        } else {
            let assignments = non_key
                .iter()
                .map(|c| format!("{col} = s.{col}", col = quote_ident(c)))
                .collect::<Vec<_>>()
                .join(", ");
            Some(format!(
                "UPDATE {target} d SET {assignments} FROM {stage} s \
                 WHERE d.{key} = s.{key} AND {changed}",
                target = target,
                assignments = assignments,
                stage = stage,
                key = key,
                changed = changed,
            ))
        };

        Self {
            create_stage: format!(
                "CREATE TEMP TABLE {stage} ON COMMIT DROP AS \
                 SELECT {columns} FROM {target} WITH NO DATA",
                stage = stage,
                columns = column_list,
                target = target,
            ),
            find_duplicate_key: format!(
                "SELECT {key} FROM {stage} GROUP BY {key} HAVING count(*) > 1 LIMIT 1",
                key = key,
                stage = stage,
            ),
            count_changed: format!(
                "SELECT count(*) FROM {stage} s JOIN {target} d ON d.{key} = s.{key} WHERE {changed}",
                stage = stage,
                target = target,
                key = key,
                changed = changed,
            ),
            count_new: format!(
                "SELECT count(*) FROM {stage} s WHERE {missing}",
                stage = stage,
                missing = missing,
            ),
            update_changed,
            insert_new: format!(
                "INSERT INTO {target} ({columns}) SELECT {columns} FROM {stage} s WHERE {missing}",
                target = target,
                columns = column_list,
                stage = stage,
                missing = missing,
            ),
        }
    }
}

/// Multi-row insert into the staging table.
///
/// ```sql
/// INSERT INTO "_watermark_sync_stage" ("col1", "col2")
/// VALUES ($1, $2), ($3, $4), ...
/// ```
fn build_stage_insert(columns: &[String], num_rows: usize) -> String {
    let quoted_columns: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();

    let num_cols = columns.len();
    let value_rows: Vec<String> = (0..num_rows)
        .map(|row_idx| {
            let placeholders: Vec<String> = (0..num_cols)
                .map(|col_idx| format!("${}", row_idx * num_cols + col_idx + 1))
                .collect();
            format!("({})", placeholders.join(", "))
        })
        .collect();

    format!(
        "INSERT INTO {} ({}) VALUES {}",
        quote_ident(STAGE_TABLE),
        quoted_columns.join(", "),
        value_rows.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_build_stage_insert_single_row() {
        let query = build_stage_insert(&columns(&["ID", "NAME", "MODIFY_DATE"]), 1);
        assert_eq!(
            query,
            "INSERT INTO \"_watermark_sync_stage\" (\"ID\", \"NAME\", \"MODIFY_DATE\") VALUES ($1, $2, $3)"
        );
    }

    #[test]
    fn test_build_stage_insert_multiple_rows() {
        let query = build_stage_insert(&columns(&["ID", "NAME"]), 3);
        assert!(query.contains("($1, $2), ($3, $4), ($5, $6)"));
    }

    #[test]
    fn test_statements_update_only_changed_rows() {
        let s = MergeStatements::new("public", "EXAM_SUBJECTS", "ID", &columns(&["ID", "NAME", "LEVEL"]));
        assert!(s
            .create_stage
            .contains("SELECT \"ID\", \"NAME\", \"LEVEL\" FROM \"public\".\"EXAM_SUBJECTS\" WITH NO DATA"));

        let update = s.update_changed.unwrap();
        assert!(update.starts_with("UPDATE \"public\".\"EXAM_SUBJECTS\" d SET \"NAME\" = s.\"NAME\", \"LEVEL\" = s.\"LEVEL\""));
        assert!(update.contains("d.\"ID\" = s.\"ID\""));
        assert!(update.contains(
            "ROW(d.\"NAME\"::text, d.\"LEVEL\"::text) IS DISTINCT FROM ROW(s.\"NAME\"::text, s.\"LEVEL\"::text)"
        ));
        assert!(!update.contains("SET \"ID\""));
    }

    #[test]
    fn test_statements_insert_only_missing_keys() {
        let s = MergeStatements::new("public", "EXAM_SUBJECTS", "ID", &columns(&["ID", "NAME"]));
        assert_eq!(
            s.insert_new,
            "INSERT INTO \"public\".\"EXAM_SUBJECTS\" (\"ID\", \"NAME\") SELECT \"ID\", \"NAME\" \
             FROM \"_watermark_sync_stage\" s WHERE NOT EXISTS \
             (SELECT 1 FROM \"public\".\"EXAM_SUBJECTS\" d WHERE d.\"ID\" = s.\"ID\")"
        );
        assert!(s.count_new.starts_with("SELECT count(*) FROM \"_watermark_sync_stage\" s WHERE NOT EXISTS"));
    }

    #[test]
    fn test_statements_key_only_table() {
        let s = MergeStatements::new("public", "TAGS", "ID", &columns(&["ID"]));
        assert!(s.update_changed.is_none());
        assert!(s.count_changed.ends_with("WHERE FALSE"));
    }
}
