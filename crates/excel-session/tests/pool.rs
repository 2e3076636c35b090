//! Instance pool behaviour against the fake host.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{get, pool, set, test_config, workbook};
use excel_session::{CellValue, Error, HostError};
use pretty_assertions::assert_eq;

/// Different spellings of one file share a single warm instance.
#[tokio::test]
async fn test_equivalent_paths_reuse_instance() {
    let dir = tempfile::tempdir().unwrap();
    let book = workbook(dir.path(), "book.xlsx");
    std::fs::create_dir(dir.path().join("sub")).unwrap();
    let (pool, state) = pool(test_config(4));

    pool.with_workbook(&book, false, set("A1", 1.0)).await.unwrap();
    let dotted = dir.path().join("sub").join("..").join(".").join("book.xlsx");
    pool.with_workbook(&dotted, false, set("A2", 2.0)).await.unwrap();

    assert_eq!(pool.live_instances(), 1);
    assert_eq!(state.launches(), 1);
    assert_eq!(state.opens(), 1);
    assert!(pool.contains(&dotted));
}

/// Persisted work is visible after the document is closed and reopened.
#[tokio::test]
async fn test_persist_then_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let book = workbook(dir.path(), "book.xlsx");
    let (pool, state) = pool(test_config(2));

    pool.with_workbook(&book, true, set("B2", 42.0)).await.unwrap();
    assert!(pool.close_document(&book).await.unwrap());
    assert!(!pool.close_document(&book).await.unwrap());

    let value = pool.with_workbook(&book, false, get("B2")).await.unwrap();
    assert_eq!(value, CellValue::Number(42.0));
    assert_eq!(state.opens(), 2);
    assert_eq!(state.launches(), 1, "host stays warm across close_document");
}

#[tokio::test]
async fn test_missing_file_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let (pool, state) = pool(test_config(2));

    let err = pool
        .with_workbook(dir.path().join("nope.xlsx"), false, get("A1"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::FileNotFound(_)), "{err}");
    assert_eq!(state.launches(), 0);
    assert_eq!(pool.available_permits(), 2);
}

/// A second file beyond the limit waits for the admission bound, then fails
/// with the live/max figures and the idle timeout.
#[tokio::test]
async fn test_capacity_exceeded() {
    let dir = tempfile::tempdir().unwrap();
    let a = workbook(dir.path(), "a.xlsx");
    let b = workbook(dir.path(), "b.xlsx");
    let (pool, _state) = pool(test_config(1).with_idle_timeout(Duration::from_secs(90)));

    pool.with_workbook(&a, false, set("A1", 1.0)).await.unwrap();
    assert_eq!(pool.available_permits(), 0);

    let started = std::time::Instant::now();
    let err = pool.with_workbook(&b, false, set("A1", 1.0)).await.unwrap_err();
    assert!(started.elapsed() >= Duration::from_millis(100));

    match &err {
        Error::CapacityExceeded {
            live,
            max,
            idle_timeout,
        } => {
            assert_eq!((*live, *max), (1, 1));
            assert_eq!(*idle_timeout, Duration::from_secs(90));
        }
        other => panic!("expected CapacityExceeded, got {other:?}"),
    }
    assert!(err.is_retryable());
    assert!(err.to_string().contains("90 seconds"));

    // The existing instance is unaffected.
    pool.with_workbook(&a, false, get("A1")).await.unwrap();
}

/// Evicting frees the slot for another file.
#[tokio::test]
async fn test_evict_releases_permit() {
    let dir = tempfile::tempdir().unwrap();
    let a = workbook(dir.path(), "a.xlsx");
    let b = workbook(dir.path(), "b.xlsx");
    let (pool, state) = pool(test_config(1));

    pool.with_workbook(&a, false, set("A1", 1.0)).await.unwrap();
    assert!(pool.evict(&a).await.unwrap());
    assert!(!pool.evict(&a).await.unwrap());
    assert_eq!(state.terminations(), 1);
    assert_eq!(pool.live_instances(), 0);
    assert_eq!(pool.available_permits(), 1);

    pool.with_workbook(&b, false, set("A1", 1.0)).await.unwrap();
    assert_eq!(state.launches(), 2);
}

/// One scan retires instances idle beyond the timeout and returns their permits.
#[tokio::test]
async fn test_reclaim_idle() {
    let dir = tempfile::tempdir().unwrap();
    let a = workbook(dir.path(), "a.xlsx");
    let b = workbook(dir.path(), "b.xlsx");
    let (pool, state) = pool(test_config(3).with_idle_timeout(Duration::from_millis(50)));

    pool.with_workbook(&a, false, set("A1", 1.0)).await.unwrap();
    assert_eq!(pool.reclaim_idle().await, 0);

    tokio::time::sleep(Duration::from_millis(80)).await;
    pool.with_workbook(&b, false, set("A1", 1.0)).await.unwrap();

    assert_eq!(pool.reclaim_idle().await, 1);
    assert!(!pool.contains(&a));
    assert!(pool.contains(&b));
    assert_eq!(pool.live_instances(), 1);
    assert_eq!(pool.available_permits(), 2);
    assert_eq!(state.terminations(), 1);
}

/// The background task does the same on its own.
#[tokio::test]
async fn test_background_reclaimer() {
    let dir = tempfile::tempdir().unwrap();
    let a = workbook(dir.path(), "a.xlsx");
    let config = test_config(2)
        .with_idle_timeout(Duration::from_millis(30))
        .with_reclaim_interval(Duration::from_millis(20));
    let (pool, state) = pool(config);

    pool.with_workbook(&a, false, set("A1", 1.0)).await.unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while pool.live_instances() > 0 && std::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(pool.live_instances(), 0);
    assert_eq!(pool.available_permits(), 2);
    assert_eq!(state.terminations(), 1);
}

/// A host that dies mid-call is replaced once and the caller still succeeds.
#[tokio::test]
async fn test_invalidated_host_is_relaunched_once() {
    let dir = tempfile::tempdir().unwrap();
    let book = workbook(dir.path(), "book.xlsx");
    let (pool, state) = pool(test_config(2));

    pool.with_workbook(&book, true, set("A1", 7.0)).await.unwrap();
    state.kill_next(1);

    let value = pool.with_workbook(&book, false, get("A1")).await.unwrap();
    assert_eq!(value, CellValue::Number(7.0));
    assert_eq!(state.launches(), 2);
    assert_eq!(state.terminations(), 1);
    assert_eq!(pool.live_instances(), 1);
    assert_eq!(pool.available_permits(), 1);
}

/// A replacement host that dies too surfaces as `HandleInvalidated`, and the
/// hostless instance gives its permit back.
#[tokio::test]
async fn test_second_invalidation_surfaces() {
    let dir = tempfile::tempdir().unwrap();
    let book = workbook(dir.path(), "book.xlsx");
    let (pool, state) = pool(test_config(2));

    state.kill_next(2);
    let err = pool.with_workbook(&book, false, get("A1")).await.unwrap_err();

    assert!(matches!(err, Error::HandleInvalidated { .. }), "{err}");
    assert_eq!(state.launches(), 2);
    assert_eq!(pool.live_instances(), 0);
    assert_eq!(pool.available_permits(), 2);

    // Next call starts cleanly.
    pool.with_workbook(&book, false, get("A1")).await.unwrap();
    assert_eq!(state.launches(), 3);
}

/// Failed work discards unsaved edits but keeps the host warm.
#[tokio::test]
async fn test_work_failure_closes_document_keeps_host() {
    let dir = tempfile::tempdir().unwrap();
    let book = workbook(dir.path(), "book.xlsx");
    let (pool, state) = pool(test_config(2));

    pool.with_workbook(&book, true, set("A1", 1.0)).await.unwrap();

    let err = pool
        .with_workbook(&book, true, |host, book| {
            set("A1", 2.0)(host, book)?;
            Err::<(), _>(HostError::failed("sheet 'Missing' not found"))
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Work(_)));
    assert_eq!(err.to_string(), "sheet 'Missing' not found");

    let value = pool.with_workbook(&book, false, get("A1")).await.unwrap();
    assert_eq!(value, CellValue::Number(1.0));
    assert_eq!(state.launches(), 1);
    assert_eq!(state.opens(), 2);
}

#[tokio::test]
async fn test_busy_and_locked_are_distinct() {
    let dir = tempfile::tempdir().unwrap();
    let busy = workbook(dir.path(), "busy.xlsx");
    let locked = workbook(dir.path(), "locked.xlsx");
    let (pool, state) = pool(test_config(4));

    state.mark_busy(&busy);
    state.mark_locked(&locked);

    let err = pool.with_workbook(&busy, false, get("A1")).await.unwrap_err();
    assert!(matches!(err, Error::HostBusy { .. }), "{err}");
    assert!(err.is_retryable());

    let err = pool.with_workbook(&locked, false, get("A1")).await.unwrap_err();
    assert!(matches!(err, Error::FileLocked { .. }), "{err}");

    // Hosts stay pooled; the open succeeds once the condition clears.
    assert_eq!(pool.live_instances(), 2);
    state.unmark(&busy);
    pool.with_workbook(&busy, false, get("A1")).await.unwrap();
    assert_eq!(state.launches(), 2);
}

/// A host that cannot start does not keep its admission permit.
#[tokio::test]
async fn test_launch_failure_releases_permit() {
    let dir = tempfile::tempdir().unwrap();
    let book = workbook(dir.path(), "book.xlsx");
    let (pool, state) = pool(test_config(1));

    state.fail_launch.store(true, Ordering::SeqCst);
    let err = pool.with_workbook(&book, false, get("A1")).await.unwrap_err();
    assert!(matches!(err, Error::Launch(_)), "{err}");
    assert_eq!(pool.live_instances(), 0);
    assert_eq!(pool.available_permits(), 1);

    state.fail_launch.store(false, Ordering::SeqCst);
    pool.with_workbook(&book, false, get("A1")).await.unwrap();
}

/// Racing first calls for one file create a single instance.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_use_creates_one_instance() {
    let dir = tempfile::tempdir().unwrap();
    let book = workbook(dir.path(), "book.xlsx");
    let (pool, state) = pool(test_config(3).with_admission_wait(Duration::from_secs(5)));

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let pool = pool.clone();
            let book = book.clone();
            tokio::spawn(async move { pool.with_workbook(&book, false, get("A1")).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(state.launches(), 1);
    assert_eq!(pool.live_instances(), 1);
    assert_eq!(pool.available_permits(), 2);
    assert_eq!(state.max_active(), 1);
}

#[tokio::test]
async fn test_shutdown_retires_everything() {
    let dir = tempfile::tempdir().unwrap();
    let a = workbook(dir.path(), "a.xlsx");
    let b = workbook(dir.path(), "b.xlsx");
    let (pool, state) = pool(test_config(2));

    pool.with_workbook(&a, false, get("A1")).await.unwrap();
    pool.with_workbook(&b, false, get("A1")).await.unwrap();
    pool.shutdown().await;

    assert_eq!(pool.live_instances(), 0);
    assert_eq!(state.terminations(), 2);

    let err = pool.with_workbook(&a, false, get("A1")).await.unwrap_err();
    assert!(matches!(err, Error::ShuttingDown), "{err}");
}

/// On a case-sensitive filesystem two names differing only by case are two
/// workbooks with their own instances.
#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_case_distinct_files_are_not_merged() {
    let dir = tempfile::tempdir().unwrap();
    let upper = workbook(dir.path(), "Report.xlsx");
    let lower = workbook(dir.path(), "report.xlsx");
    let (pool, state) = pool(test_config(2));

    pool.with_workbook(&upper, true, set("A1", 1.0)).await.unwrap();
    pool.with_workbook(&lower, true, set("A1", 2.0)).await.unwrap();

    assert_eq!(pool.live_instances(), 2);
    assert_eq!(state.launches(), 2);
    assert_eq!(
        pool.with_workbook(&upper, false, get("A1")).await.unwrap(),
        CellValue::Number(1.0)
    );
    assert_eq!(
        pool.with_workbook(&lower, false, get("A1")).await.unwrap(),
        CellValue::Number(2.0)
    );
}

/// Callers arriving while an eviction waits for in-flight work queue behind
/// it and start a new host only after the old one is gone.
#[tokio::test]
async fn test_evict_during_work_never_doubles_hosts() {
    let dir = tempfile::tempdir().unwrap();
    let a = workbook(dir.path(), "a.xlsx");
    let (pool, state) = pool(test_config(2).with_admission_wait(Duration::from_secs(5)));
    state.slow_calls(Duration::from_millis(300));

    let busy = {
        let pool = pool.clone();
        let a = a.clone();
        tokio::spawn(async move { pool.with_workbook(&a, true, set("A1", 7.0)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let evicting = {
        let pool = pool.clone();
        let a = a.clone();
        tokio::spawn(async move { pool.evict(&a).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let next = {
        let pool = pool.clone();
        let a = a.clone();
        tokio::spawn(async move { pool.with_workbook(&a, false, get("A1")).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(state.launches(), 1);
    assert_eq!(pool.live_instances(), 1);
    assert_eq!(pool.available_permits(), 1);

    busy.await.unwrap().unwrap();
    assert!(evicting.await.unwrap().unwrap());
    assert_eq!(next.await.unwrap().unwrap(), CellValue::Number(7.0));

    assert_eq!(state.launches(), 2);
    assert_eq!(state.terminations(), 1);
    assert_eq!(pool.live_instances(), 1);
    assert_eq!(pool.available_permits(), 2 - pool.live_instances());
}

/// A caller blocked at the admission gate gets in once an eviction frees a slot.
#[tokio::test]
async fn test_blocked_acquirer_admitted_after_evict() {
    let dir = tempfile::tempdir().unwrap();
    let a = workbook(dir.path(), "a.xlsx");
    let b = workbook(dir.path(), "b.xlsx");
    let (pool, state) = pool(test_config(1).with_admission_wait(Duration::from_secs(5)));

    pool.with_workbook(&a, false, set("A1", 1.0)).await.unwrap();

    let waiting = {
        let pool = pool.clone();
        let b = b.clone();
        tokio::spawn(async move { pool.with_workbook(&b, false, set("A1", 2.0)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiting.is_finished());

    assert!(pool.evict(&a).await.unwrap());
    waiting.await.unwrap().unwrap();

    assert!(pool.contains(&b));
    assert!(!pool.contains(&a));
    assert_eq!(state.launches(), 2);
    assert_eq!(pool.available_permits(), 0);
}

/// The same holds when the idle scan is what frees the slot.
#[tokio::test]
async fn test_blocked_acquirer_admitted_after_reclaim() {
    let dir = tempfile::tempdir().unwrap();
    let a = workbook(dir.path(), "a.xlsx");
    let b = workbook(dir.path(), "b.xlsx");
    let config = test_config(1)
        .with_admission_wait(Duration::from_secs(5))
        .with_idle_timeout(Duration::from_millis(30));
    let (pool, state) = pool(config);

    pool.with_workbook(&a, false, set("A1", 1.0)).await.unwrap();

    let waiting = {
        let pool = pool.clone();
        let b = b.clone();
        tokio::spawn(async move { pool.with_workbook(&b, false, get("A1")).await })
    };
    tokio::time::sleep(Duration::from_millis(60)).await;

    assert_eq!(pool.reclaim_idle().await, 1);
    waiting.await.unwrap().unwrap();

    assert_eq!(state.terminations(), 1);
    assert_eq!(pool.live_instances(), 1);
}
