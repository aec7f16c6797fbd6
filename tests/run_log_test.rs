// ABOUTME: Tests for the SQLite run log - watermark selection, run lifecycle and guards
// ABOUTME: Also drives a full cycle with the SQLite run log and in-memory source/target

use chrono::{TimeZone, Utc};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use watermark_sync::config::{SyncSettings, TableSyncConfig};
use watermark_sync::error::SyncError;
use watermark_sync::sync::memory::{MemorySource, MemoryTarget};
use watermark_sync::sync::{
    ChangeRow, ColumnValue, RunCompletion, RunLogStore, RunStatus, SqliteRunLog,
    SyncOrchestrator, Watermark,
};

fn open(dir: &TempDir) -> SqliteRunLog {
    SqliteRunLog::open(
        dir.path().join("state").join("run-log.db"),
        chrono::Duration::minutes(360),
    )
    .unwrap()
}

fn completion(status: RunStatus, watermark: Watermark) -> RunCompletion {
    RunCompletion {
        status,
        watermark,
        records_scanned: 3,
        records_inserted: 2,
        records_updated: 1,
        attempts: 1,
        error_message: None,
    }
}

fn at(hour: u32) -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 3, hour, 30, 0).unwrap()
}

#[tokio::test]
async fn test_empty_history_has_empty_watermark() {
    let dir = TempDir::new().unwrap();
    let log = open(&dir);
    assert!(log.get_last_run("EXAM_SUBJECTS").await.unwrap().is_empty());
    assert!(log.recent_runs(None, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_successful_run_sets_watermark() {
    let dir = TempDir::new().unwrap();
    let log = open(&dir);

    let run_id = log.start_run("EXAM_SUBJECTS", Uuid::new_v4()).await.unwrap();
    let running = log.recent_runs(Some("EXAM_SUBJECTS"), 1).await.unwrap();
    assert_eq!(running[0].status, RunStatus::Running);
    assert!(running[0].completed_at.is_none());

    let watermark = Watermark::new(at(9), 103);
    log.complete_run(run_id, "EXAM_SUBJECTS", &completion(RunStatus::Success, watermark))
        .await
        .unwrap();

    assert_eq!(log.get_last_run("EXAM_SUBJECTS").await.unwrap(), watermark);
    let entry = &log.recent_runs(Some("EXAM_SUBJECTS"), 1).await.unwrap()[0];
    assert_eq!(entry.run_id, run_id);
    assert_eq!(entry.status, RunStatus::Success);
    assert_eq!(
        (entry.records_scanned, entry.records_inserted, entry.records_updated),
        (3, 2, 1)
    );
    assert!(entry.completed_at.is_some());
}

#[tokio::test]
async fn test_dry_run_and_failed_runs_do_not_advance_watermark() {
    let dir = TempDir::new().unwrap();
    let log = open(&dir);

    let real = Watermark::new(at(8), 50);
    let run_id = log.start_run("EXAM_SUBJECTS", Uuid::new_v4()).await.unwrap();
    log.complete_run(run_id, "EXAM_SUBJECTS", &completion(RunStatus::Success, real))
        .await
        .unwrap();

    let run_id = log.start_run("EXAM_SUBJECTS", Uuid::new_v4()).await.unwrap();
    log.complete_run(
        run_id,
        "EXAM_SUBJECTS",
        &completion(RunStatus::DryRun, Watermark::new(at(12), 90)),
    )
    .await
    .unwrap();

    let run_id = log.start_run("EXAM_SUBJECTS", Uuid::new_v4()).await.unwrap();
    let err = SyncError::Merge("deadlock detected".into());
    log.complete_run(
        run_id,
        "EXAM_SUBJECTS",
        &RunCompletion::failed(Watermark::new(at(13), 1), 3, &err),
    )
    .await
    .unwrap();

    assert_eq!(log.get_last_run("EXAM_SUBJECTS").await.unwrap(), real);

    let failed = &log.recent_runs(Some("EXAM_SUBJECTS"), 1).await.unwrap()[0];
    assert_eq!(failed.status, RunStatus::Failed);
    assert_eq!(failed.attempts, 3);
    assert_eq!(
        failed.error_message.as_deref(),
        Some("merge error: deadlock detected")
    );
}

#[tokio::test]
async fn test_latest_watermark_wins_over_insertion_order() {
    let dir = TempDir::new().unwrap();
    let log = open(&dir);

    for watermark in [
        Watermark::new(at(10), 7),
        Watermark::new(at(10), 9),
        Watermark::new(at(9), 500),
    ] {
        let run_id = log.start_run("EXAM_SUBJECTS", Uuid::new_v4()).await.unwrap();
        log.complete_run(run_id, "EXAM_SUBJECTS", &completion(RunStatus::Success, watermark))
            .await
            .unwrap();
    }

    assert_eq!(
        log.get_last_run("EXAM_SUBJECTS").await.unwrap(),
        Watermark::new(at(10), 9)
    );
}

#[tokio::test]
async fn test_run_lifecycle_guards() {
    let dir = TempDir::new().unwrap();
    let log = open(&dir);

    let run_id = log.start_run("EXAM_SUBJECTS", Uuid::new_v4()).await.unwrap();

    // A second concurrent start is rejected.
    match log.start_run("EXAM_SUBJECTS", Uuid::new_v4()).await {
        Err(SyncError::RunInProgress { table, run_id: active }) => {
            assert_eq!(table, "EXAM_SUBJECTS");
            assert_eq!(active, run_id);
        }
        other => panic!("expected RunInProgress, got {:?}", other),
    }
    // Other tables are independent.
    log.start_run("EXAM_CENTRES", Uuid::new_v4()).await.unwrap();

    // Running is not a terminal status.
    let still_running = completion(RunStatus::Running, Watermark::empty());
    assert!(log
        .complete_run(run_id, "EXAM_SUBJECTS", &still_running)
        .await
        .is_err());

    let done = completion(RunStatus::Success, Watermark::new(at(1), 1));
    log.complete_run(run_id, "EXAM_SUBJECTS", &done).await.unwrap();
    let again = log.complete_run(run_id, "EXAM_SUBJECTS", &done).await;
    assert!(matches!(again, Err(SyncError::Persistence(_))));

    // Once closed, a new run may start.
    assert!(log.start_run("EXAM_SUBJECTS", Uuid::new_v4()).await.unwrap() > run_id);
}

#[tokio::test]
async fn test_recent_runs_filters_and_orders() {
    let dir = TempDir::new().unwrap();
    let log = open(&dir);

    for table in ["A", "B", "A"] {
        let run_id = log.start_run(table, Uuid::new_v4()).await.unwrap();
        log.complete_run(run_id, table, &completion(RunStatus::Success, Watermark::empty()))
            .await
            .unwrap();
    }

    let all = log.recent_runs(None, 10).await.unwrap();
    assert_eq!(all.len(), 3);
    assert!(all.windows(2).all(|w| w[0].run_id > w[1].run_id));

    let a = log.recent_runs(Some("A"), 10).await.unwrap();
    assert_eq!(a.len(), 2);
    assert!(a.iter().all(|e| e.table_name == "A"));

    assert_eq!(log.recent_runs(None, 1).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_history_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let watermark = Watermark::new(at(4), 42);
    {
        let log = open(&dir);
        let run_id = log.start_run("EXAM_SUBJECTS", Uuid::new_v4()).await.unwrap();
        log.complete_run(run_id, "EXAM_SUBJECTS", &completion(RunStatus::Success, watermark))
            .await
            .unwrap();
    }
    let log = open(&dir);
    assert_eq!(log.get_last_run("EXAM_SUBJECTS").await.unwrap(), watermark);
}

#[tokio::test]
async fn test_cycle_with_sqlite_run_log() {
    let dir = TempDir::new().unwrap();
    let table = TableSyncConfig::new("EXAM_SUBJECTS", "ID", "CREATE_DATE", "MODIFY_DATE");
    let settings = SyncSettings {
        tables: vec![table],
        ..SyncSettings::default()
    };
    let source = MemorySource::new(chrono::Duration::days(30));
    let created = Utc::now() - chrono::Duration::hours(3);
    for (id, name) in [(101, "Mathematics"), (102, "Physics"), (103, "Chemistry")] {
        source
            .upsert(
                "EXAM_SUBJECTS",
                "ID",
                ChangeRow::new()
                    .with("ID", ColumnValue::Int(id))
                    .with("NAME", ColumnValue::Text(name.to_string()))
                    .with("CREATE_DATE", ColumnValue::TimestampTz(created))
                    .with("MODIFY_DATE", ColumnValue::Null),
            )
            .await;
    }

    let orchestrator =
        SyncOrchestrator::new(settings, open(&dir), source, MemoryTarget::new()).unwrap();
    let cancel = CancellationToken::new();
    let first = orchestrator.run_cycle(&cancel).await;
    let second = orchestrator.run_cycle(&cancel).await;
    assert!(first.is_success() && second.is_success());

    let runs = orchestrator
        .run_log()
        .recent_runs(Some("EXAM_SUBJECTS"), 10)
        .await
        .unwrap();
    assert_eq!(runs.len(), 2);
    let (latest, earliest) = (&runs[0], &runs[1]);
    assert_eq!(earliest.records_inserted, 3);
    assert_eq!(earliest.watermark.last_processed_id, Some(103));
    assert_eq!(latest.records_scanned, 0);
    assert_eq!(latest.watermark, earliest.watermark);
}
