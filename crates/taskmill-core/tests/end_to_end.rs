//! End-to-end flows through the runtime: ingest, flush, outage recovery and
//! rollover with later events.

mod common;

use std::time::Duration;

use common::{at, memory_runtime, test_config};
use taskmill_core::maintenance::{MaintenanceIntervals, spawn_maintenance};
use taskmill_core::{Event, TaskStatus};

#[tokio::test]
async fn root_task_and_late_parent_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let (tm, backend) = memory_runtime(test_config(dir.path()));
    let alias = tm.start().await.unwrap();
    let ingest = tm.ingest();

    let t2 = ingest
        .ingest(Event::start("T2", "T2", at(0)).with_parent("T1"))
        .await;
    assert!(t2.orphan);
    assert!(t2.parents_path.is_none());

    ingest.ingest(Event::start("T1", "T1", at(1))).await;
    let t1 = ingest.ingest(Event::success("T1", at(4))).await;
    assert_eq!(t1.status, TaskStatus::Success);
    assert!(t1.duration_ms.is_some_and(|d| d >= 0));
    assert!(t1.parents_path.is_none());

    let t2 = ingest.resident("T2").await.unwrap();
    assert!(!t2.orphan);
    assert_eq!(t2.parents_path, Some(vec!["T1".to_string()]));
    assert_eq!(t2.primary_id.as_deref(), Some("T1"));

    tm.ingest().flush().await.unwrap();
    let index = tm.lifecycle().current_index(&alias).unwrap();
    let stored = backend.document(&index, "T2").unwrap();
    assert!(!stored.orphan);
    assert_eq!(stored.parents_path, Some(vec!["T1".to_string()]));
    assert_eq!(
        backend.document(&index, "T1").unwrap().status,
        TaskStatus::Success
    );
}

#[tokio::test]
async fn outage_is_bridged_by_the_failure_queue() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.indexing.max_retries = 1;
    let (tm, backend) = memory_runtime(config);
    let alias = tm.start().await.unwrap();
    let index = tm.lifecycle().current_index(&alias).unwrap();

    backend.set_available(false);
    tm.ingest().ingest(Event::spot("job", "nightly", at(0))).await;
    let report = tm.ingest().flush().await.unwrap();
    assert_eq!(report.failed_operations, 1);

    tm.indexer().retry_failed_from_memory().await.unwrap();
    let queue = tm.indexer().failure_queue().unwrap();
    assert_eq!(queue.failed_bulks_amount().unwrap(), 1);

    backend.set_available(true);
    let handle = spawn_maintenance(
        tm.indexer().clone(),
        tm.lifecycle().clone(),
        MaintenanceIntervals {
            memory_retry: Duration::from_millis(20),
            disk_retry: Duration::from_millis(20),
            rollover: Duration::from_secs(3600),
            expiry: Duration::from_secs(3600),
        },
    );
    for _ in 0..100 {
        if backend.document(&index, "job").is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(
        backend.document(&index, "job").map(|t| t.status),
        Some(TaskStatus::Success)
    );
    assert_eq!(tm.indexer().persistence_stats().redelivered_from_disk, 1);
    handle.shutdown().await.unwrap();
    assert!(tm.indexer().is_closed());
}

#[tokio::test]
async fn events_after_rollover_land_on_the_migrated_copy() {
    let dir = tempfile::tempdir().unwrap();
    let (tm, backend) = memory_runtime(test_config(dir.path()));
    let alias = tm.start().await.unwrap();

    tm.ingest().ingest(Event::start("long", "import", at(0))).await;
    tm.ingest().flush().await.unwrap();

    backend.force_next_rollover();
    let report = tm.lifecycle().maybe_rollover(&alias).await.unwrap().unwrap();
    assert_eq!(report.migration.found, 1);

    tm.ingest().ingest(Event::success("long", at(60))).await;
    tm.ingest().flush().await.unwrap();

    assert!(backend.document(&report.old_index, "long").is_none());
    let moved = backend.document(&report.new_index, "long").unwrap();
    assert_eq!(moved.status, TaskStatus::Success);
    assert_eq!(moved.duration_ms, Some(60_000));

    let found = tm.queries().task_by_id("long").await.unwrap().unwrap();
    assert_eq!(found.status, TaskStatus::Success);
}

#[tokio::test]
async fn child_error_marks_open_parent_partial_error() {
    let dir = tempfile::tempdir().unwrap();
    let (tm, backend) = memory_runtime(test_config(dir.path()));
    let alias = tm.start().await.unwrap();

    tm.ingest()
        .ingest_batch(vec![
            Event::start("parent", "pipeline", at(0)),
            Event::start("child", "step", at(1)).with_parent("parent"),
            Event::error("child", at(2)),
        ])
        .await;
    tm.ingest().flush().await.unwrap();

    let index = tm.lifecycle().current_index(&alias).unwrap();
    assert_eq!(
        backend.document(&index, "parent").unwrap().status,
        TaskStatus::PartialError
    );
    assert_eq!(
        backend.document(&index, "child").unwrap().status,
        TaskStatus::Error
    );
}
