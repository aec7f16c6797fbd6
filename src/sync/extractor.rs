// ABOUTME: Change extraction - reads rows created or modified since a table's watermark
// ABOUTME: Keyset-paginated by (change timestamp, primary key) so batches never skip rows

use chrono::{DateTime, Utc};
use std::future::Future;

use super::value::{ChangeBatch, ChangeRow};
use super::watermark::Watermark;
use crate::config::TableSyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::postgres::ConnectionFactory;
use crate::utils::{qualified_name, quote_ident};

/// One fetched batch and the watermark it leads to.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub batch: ChangeBatch,
    /// Lower bound the source was queried with.
    pub since: DateTime<Utc>,
    /// Watermark after applying `batch`: the (change timestamp, key) of the
    /// last row, or the starting watermark when nothing changed.
    pub watermark: Watermark,
    /// The batch hit `batch_size`; more changes may be waiting.
    pub truncated: bool,
}

impl Extraction {
    pub fn scanned(&self) -> u64 {
        self.batch.len() as u64
    }
}

/// A source of changed rows.
pub trait ChangeSource {
    /// Rows whose create or modify timestamp lies after `watermark`, at most
    /// `batch_size` of them, ordered by (change timestamp, primary key).
    ///
    /// An empty watermark reads the configured lookback window instead of the
    /// whole table.
    fn fetch(
        &self,
        table: &TableSyncConfig,
        watermark: &Watermark,
        batch_size: usize,
    ) -> impl Future<Output = SyncResult<Extraction>> + Send;
}

/// Lower bound and key cursor for a fetch.
///
/// Rows changed exactly at `since` are only re-read when their key lies past
/// `after_id`, so a batch boundary inside one timestamp neither skips nor
/// repeats rows. A lookback window has no cursor.
pub fn change_window(
    watermark: &Watermark,
    now: DateTime<Utc>,
    lookback: chrono::Duration,
) -> (DateTime<Utc>, Option<i64>) {
    match watermark.last_run_at {
        Some(at) => (at, watermark.last_processed_id),
        None => (watermark.since(now, lookback), None),
    }
}

/// Change timestamp of a row: the later of its create and modify columns.
pub fn change_timestamp(row: &ChangeRow, table: &TableSyncConfig) -> Option<DateTime<Utc>> {
    let created = row
        .get(&table.create_date_column)
        .and_then(|v| v.as_timestamp());
    let modified = row
        .get(&table.modify_date_column)
        .and_then(|v| v.as_timestamp());
    created.max(modified)
}

/// Integer primary key of a row.
pub fn primary_key_of(row: &ChangeRow, table: &TableSyncConfig) -> SyncResult<i64> {
    let value = row.get(&table.primary_key).ok_or_else(|| {
        SyncError::Extraction(format!(
            "table {} has no primary key column {}",
            table.name, table.primary_key
        ))
    })?;
    value.as_i64().ok_or_else(|| {
        SyncError::Extraction(format!(
            "primary key {}.{} must be an integer, got {:?}",
            table.name, table.primary_key, value
        ))
    })
}

/// Watermark reached after `rows`: the highest (change timestamp, key) pair,
/// never behind `start`.
pub fn watermark_after(
    rows: &[ChangeRow],
    table: &TableSyncConfig,
    start: Watermark,
) -> SyncResult<Watermark> {
    let mut highest: Option<Watermark> = None;
    for row in rows {
        let changed_at = change_timestamp(row, table).ok_or_else(|| {
            SyncError::Extraction(format!(
                "row in {} has neither {} nor {}",
                table.name, table.create_date_column, table.modify_date_column
            ))
        })?;
        let candidate = Watermark::new(changed_at, primary_key_of(row, table)?);
        highest = Some(highest.map_or(candidate, |h| h.max(candidate)));
    }
    Ok(match highest {
        Some(candidate) => start.advance(candidate),
        None => start,
    })
}

/// Reads changes with plain SQL from the source database, or from a foreign
/// schema in the destination when no separate source is configured.
pub struct PostgresChangeSource {
    connections: ConnectionFactory,
    schema: String,
    lookback: chrono::Duration,
}

impl PostgresChangeSource {
    pub fn new(connections: ConnectionFactory, schema: &str, lookback: chrono::Duration) -> Self {
        Self {
            connections,
            schema: schema.to_string(),
            lookback,
        }
    }
}

impl ChangeSource for PostgresChangeSource {
    async fn fetch(
        &self,
        table: &TableSyncConfig,
        watermark: &Watermark,
        batch_size: usize,
    ) -> SyncResult<Extraction> {
        let (since, after_id) = change_window(watermark, Utc::now(), self.lookback);
        let query = build_change_query(&self.schema, table);
        let limit = i64::try_from(batch_size).unwrap_or(i64::MAX);

        tracing::debug!(
            "Reading changes from {}.{} since {} (after id {:?})",
            self.schema,
            table.name,
            since,
            after_id
        );

        let client = self.connections.connect().await?;
        let rows = client
            .query(&query, &[&since, &after_id, &limit])
            .await
            .map_err(|e| {
                SyncError::extraction(&format!("failed to read changes from {}", table.name), e)
            })?;

        let changes = rows
            .iter()
            .map(|row| ChangeRow::from_pg_row(row, &[]))
            .collect::<SyncResult<Vec<_>>>()?;
        let watermark = watermark_after(&changes, table, *watermark)?;
        let truncated = changes.len() >= batch_size;

        Ok(Extraction {
            batch: ChangeBatch::new(changes)?,
            since,
            watermark,
            truncated,
        })
    }
}

/// Build the keyset change query:
///
/// ```sql
/// SELECT * FROM "schema"."table"
/// WHERE "create" > $1 OR "modify" > $1
///    OR (GREATEST("create", "modify") = $1 AND "id" > $2)
/// ORDER BY GREATEST("create", "modify"), "id"
/// LIMIT $3
/// ```
///
/// Parameters are cast so timestamp, timestamptz and date columns compare
/// against the same UTC instant.
fn build_change_query(schema: &str, table: &TableSyncConfig) -> String {
    let created = quote_ident(&table.create_date_column);
    let modified = quote_ident(&table.modify_date_column);
    let key = quote_ident(&table.primary_key);
    let changed_at = format!("GREATEST({}, {})", created, modified);

    format!(
        "SELECT * FROM {source} \
         WHERE {created} > $1::timestamptz OR {modified} > $1::timestamptz \
         OR ({changed_at} = $1::timestamptz AND {key} > $2::bigint) \
         ORDER BY {changed_at}, {key} \
         LIMIT $3",
        source = qualified_name(schema, &table.name),
        created = created,
        modified = modified,
        changed_at = changed_at,
        key = key,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::value::ColumnValue;
    use chrono::TimeZone;

    fn table() -> TableSyncConfig {
        TableSyncConfig::new("EXAM_SUBJECTS", "ID", "CREATE_DATE", "MODIFY_DATE")
    }

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, day, hour, 0, 0).unwrap()
    }

    fn row(id: i64, created: DateTime<Utc>, modified: Option<DateTime<Utc>>) -> ChangeRow {
        ChangeRow::new()
            .with("ID", ColumnValue::Int(id))
            .with("CREATE_DATE", ColumnValue::TimestampTz(created))
            .with(
                "MODIFY_DATE",
                modified.map_or(ColumnValue::Null, ColumnValue::TimestampTz),
            )
    }

    #[test]
    fn test_build_change_query() {
        let query = build_change_query("exam_link", &table());
        assert!(query.starts_with("SELECT * FROM \"exam_link\".\"EXAM_SUBJECTS\""));
        assert!(query.contains("\"CREATE_DATE\" > $1::timestamptz OR \"MODIFY_DATE\" > $1::timestamptz"));
        assert!(query.contains("(GREATEST(\"CREATE_DATE\", \"MODIFY_DATE\") = $1::timestamptz AND \"ID\" > $2::bigint)"));
        assert!(query.contains("ORDER BY GREATEST(\"CREATE_DATE\", \"MODIFY_DATE\"), \"ID\""));
        assert!(query.ends_with("LIMIT $3"));
    }

    #[test]
    fn test_change_window() {
        let now = at(30, 0);
        let lookback = chrono::Duration::days(30);
        assert_eq!(
            change_window(&Watermark::empty(), now, lookback),
            (now - lookback, None)
        );
        assert_eq!(
            change_window(&Watermark::new(at(2, 8), 103), now, lookback),
            (at(2, 8), Some(103))
        );
    }

    #[test]
    fn test_change_timestamp_prefers_later_column() {
        assert_eq!(change_timestamp(&row(1, at(1, 0), Some(at(3, 0))), &table()), Some(at(3, 0)));
        assert_eq!(change_timestamp(&row(1, at(4, 0), Some(at(3, 0))), &table()), Some(at(4, 0)));
        assert_eq!(change_timestamp(&row(1, at(1, 0), None), &table()), Some(at(1, 0)));
    }

    #[test]
    fn test_watermark_after_picks_highest_key_at_latest_timestamp() {
        let rows = vec![
            row(101, at(1, 9), None),
            row(103, at(1, 9), None),
            row(102, at(1, 9), None),
        ];
        let wm = watermark_after(&rows, &table(), Watermark::empty()).unwrap();
        assert_eq!(wm, Watermark::new(at(1, 9), 103));
    }

    #[test]
    fn test_watermark_after_follows_latest_change_not_largest_key() {
        let rows = vec![
            row(103, at(1, 8), None),
            row(101, at(1, 7), Some(at(1, 11))),
            row(102, at(1, 10), None),
        ];
        let wm = watermark_after(&rows, &table(), Watermark::empty()).unwrap();
        assert_eq!(wm, Watermark::new(at(1, 11), 101));
    }

    #[test]
    fn test_watermark_after_without_rows_is_unchanged() {
        let start = Watermark::new(at(2, 0), 7);
        assert_eq!(watermark_after(&[], &table(), start).unwrap(), start);
    }

    #[test]
    fn test_watermark_after_requires_integer_key() {
        let rows = vec![ChangeRow::new()
            .with("ID", ColumnValue::Text("abc".into()))
            .with("CREATE_DATE", ColumnValue::TimestampTz(at(1, 0)))
            .with("MODIFY_DATE", ColumnValue::Null)];
        let err = watermark_after(&rows, &table(), Watermark::empty()).unwrap_err();
        assert!(matches!(err, SyncError::Extraction(_)));
    }
}
