//! Process Manager lifecycle tests: spawn, exit disposition, stop semantics,
//! timeouts, clean, listing, and retention.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use gale::error::GaleError;
use gale::output::{Channel, FileOutputStore, ReadQuery};
use gale::process::{CleanOutcome, ProcessManager, ProcessStatus, StartSpec};

fn manager(dir: &tempfile::TempDir, retention_seconds: u64) -> Arc<ProcessManager> {
    let store = Arc::new(FileOutputStore::new(dir.path().join("logs")));
    Arc::new(ProcessManager::new(store, "utf-8", retention_seconds))
}

fn spec(argv: &[&str]) -> StartSpec {
    StartSpec {
        argv: argv.iter().map(|s| s.to_string()).collect(),
        working_directory: PathBuf::from("/tmp"),
        description: "test process".to_string(),
        labels: Vec::new(),
        stdin: None,
        timeout_seconds: None,
        env_overlay: HashMap::new(),
        encoding: None,
    }
}

// ---------------------------------------------------------------------------
// Exit disposition
// ---------------------------------------------------------------------------

#[tokio::test]
async fn zero_exit_completes() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(&dir, 3600);

    let id = manager.start(spec(&["true"])).await.unwrap();
    let record = manager.wait(&id).await.unwrap();
    assert_eq!(record.status, ProcessStatus::Completed);
    assert_eq!(record.exit_code, Some(0));
    assert!(record.ended_at_us.is_some());
}

#[tokio::test]
async fn nonzero_exit_fails() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(&dir, 3600);

    let id = manager
        .start(spec(&["sh", "-c", "exit 3"]))
        .await
        .unwrap();
    let record = manager.wait(&id).await.unwrap();
    assert_eq!(record.status, ProcessStatus::Failed);
    assert_eq!(record.exit_code, Some(3));
}

#[tokio::test]
async fn output_lands_in_the_store_before_terminal_state() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(&dir, 3600);

    let id = manager
        .start(spec(&["sh", "-c", "echo out; echo err >&2"]))
        .await
        .unwrap();
    let record = manager.wait(&id).await.unwrap();
    assert_eq!(record.status, ProcessStatus::Completed);

    let stdout = manager
        .store()
        .read(&id, Channel::Stdout, &ReadQuery::default())
        .await
        .unwrap();
    let stderr = manager
        .store()
        .read(&id, Channel::Stderr, &ReadQuery::default())
        .await
        .unwrap();
    assert_eq!(stdout.len(), 1);
    assert_eq!(stdout[0].line, "out");
    assert_eq!(stderr.len(), 1);
    assert_eq!(stderr[0].line, "err");
}

#[tokio::test]
async fn stdin_is_written_once_and_closed() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(&dir, 3600);

    let mut spec = spec(&["cat"]);
    spec.stdin = Some(b"hello\nworld\n".to_vec());
    let id = manager.start(spec).await.unwrap();
    let record = manager.wait(&id).await.unwrap();
    assert_eq!(record.status, ProcessStatus::Completed);

    let stdout = manager
        .store()
        .read(&id, Channel::Stdout, &ReadQuery::default())
        .await
        .unwrap();
    let lines: Vec<&str> = stdout.iter().map(|e| e.line.as_str()).collect();
    assert_eq!(lines, ["hello", "world"]);
}

#[tokio::test]
async fn environment_overlay_reaches_the_child() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(&dir, 3600);

    let mut spec = spec(&["sh", "-c", "echo $GALE_TEST_VALUE"]);
    spec.env_overlay
        .insert("GALE_TEST_VALUE".to_string(), "overlay".to_string());
    let id = manager.start(spec).await.unwrap();
    manager.wait(&id).await.unwrap();

    let stdout = manager
        .store()
        .read(&id, Channel::Stdout, &ReadQuery::default())
        .await
        .unwrap();
    assert_eq!(stdout[0].line, "overlay");
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn empty_argv_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(&dir, 3600);
    let err = manager.start(spec(&[])).await;
    assert!(matches!(err, Err(GaleError::InvalidArgument(_))));
    assert!(manager.list(None, &[]).await.is_empty());
}

#[tokio::test]
async fn missing_working_directory_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(&dir, 3600);
    let mut spec = spec(&["true"]);
    spec.working_directory = PathBuf::from("/definitely/not/a/real/dir");
    assert!(matches!(
        manager.start(spec).await,
        Err(GaleError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn unknown_encoding_label_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(&dir, 3600);
    let mut spec = spec(&["true"]);
    spec.encoding = Some("not-a-real-codec".to_string());
    assert!(matches!(
        manager.start(spec).await,
        Err(GaleError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn spawn_failure_records_error_status() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(&dir, 3600);

    let err = manager
        .start(spec(&["gale-test-no-such-binary-a113"]))
        .await;
    assert!(matches!(err, Err(GaleError::ExecutionFailed(_))));

    let records = manager.list(None, &[]).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, ProcessStatus::Error);
    assert!(records[0].error_message.as_deref().unwrap().contains("spawn failed"));
}

// ---------------------------------------------------------------------------
// Stop semantics
// ---------------------------------------------------------------------------

#[tokio::test]
async fn graceful_stop_terminates_within_the_grace_window() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(&dir, 3600);

    let id = manager.start(spec(&["sleep", "30"])).await.unwrap();
    let start = Instant::now();
    let record = manager.stop(&id, false, None).await.unwrap();
    assert_eq!(record.status, ProcessStatus::Terminated);
    assert!(start.elapsed() < Duration::from_secs(4));
}

#[tokio::test]
async fn force_stop_kills_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(&dir, 3600);

    let id = manager.start(spec(&["sleep", "30"])).await.unwrap();
    let record = manager.stop(&id, true, Some("operator request".to_string())).await.unwrap();
    assert_eq!(record.status, ProcessStatus::Terminated);
    assert_eq!(record.error_message.as_deref(), Some("operator request"));
}

#[tokio::test]
async fn double_stop_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(&dir, 3600);

    let id = manager.start(spec(&["sleep", "30"])).await.unwrap();
    let first = manager.stop(&id, true, None).await.unwrap();
    let second = manager.stop(&id, true, None).await.unwrap();
    assert_eq!(first.status, ProcessStatus::Terminated);
    assert_eq!(second.status, ProcessStatus::Terminated);
    assert_eq!(first.ended_at_us, second.ended_at_us);
}

#[tokio::test]
async fn stop_unknown_id_is_process_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(&dir, 3600);
    assert!(matches!(
        manager.stop("nope", false, None).await,
        Err(GaleError::ProcessNotFound(_))
    ));
}

// ---------------------------------------------------------------------------
// Timeout
// ---------------------------------------------------------------------------

#[tokio::test]
async fn timeout_kills_and_preserves_captured_output() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(&dir, 3600);

    let mut spec = spec(&["sh", "-c", "echo A; sleep 100"]);
    spec.timeout_seconds = Some(1);
    let start = Instant::now();
    let id = manager.start(spec).await.unwrap();
    let record = manager.wait(&id).await.unwrap();

    assert!(start.elapsed() < Duration::from_secs(3));
    assert_eq!(record.status, ProcessStatus::Terminated);
    assert!(record.error_message.as_deref().unwrap().starts_with("timeout"));

    let stdout = manager
        .store()
        .read(&id, Channel::Stdout, &ReadQuery::default())
        .await
        .unwrap();
    assert_eq!(stdout.len(), 1);
    assert_eq!(stdout[0].line, "A");
}

// ---------------------------------------------------------------------------
// Listing and labels
// ---------------------------------------------------------------------------

#[tokio::test]
async fn list_filters_by_status_and_label_subset() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(&dir, 3600);

    let mut a = spec(&["sleep", "30"]);
    a.labels = vec!["a".to_string()];
    let mut ab = spec(&["sleep", "30"]);
    ab.labels = vec!["a".to_string(), "b".to_string()];
    let mut b = spec(&["sleep", "30"]);
    b.labels = vec!["b".to_string()];

    let id_a = manager.start(a).await.unwrap();
    let id_ab = manager.start(ab).await.unwrap();
    let id_b = manager.start(b).await.unwrap();

    let with_a = manager.list(None, &["a".to_string()]).await;
    let ids: Vec<&str> = with_a.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, [id_a.as_str(), id_ab.as_str()]);

    let running = manager.list(Some(ProcessStatus::Running), &[]).await;
    assert_eq!(running.len(), 3);

    for id in [&id_a, &id_ab, &id_b] {
        manager.stop(id, true, None).await.unwrap();
    }
    let still_running = manager.list(Some(ProcessStatus::Running), &[]).await;
    assert!(still_running.is_empty());
}

#[tokio::test]
async fn list_orders_by_start_time() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(&dir, 3600);

    let first = manager.start(spec(&["true"])).await.unwrap();
    manager.wait(&first).await.unwrap();
    let second = manager.start(spec(&["true"])).await.unwrap();
    manager.wait(&second).await.unwrap();

    let records = manager.list(None, &[]).await;
    let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, [first.as_str(), second.as_str()]);
}

// ---------------------------------------------------------------------------
// Clean
// ---------------------------------------------------------------------------

#[tokio::test]
async fn clean_removes_terminal_records_and_logs() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(&dir, 3600);

    let id = manager.start(spec(&["sh", "-c", "echo x"])).await.unwrap();
    manager.wait(&id).await.unwrap();

    let outcomes = manager.clean(std::slice::from_ref(&id)).await;
    assert_eq!(outcomes[&id], CleanOutcome::Cleaned);
    assert!(matches!(
        manager.detail(&id).await,
        Err(GaleError::ProcessNotFound(_))
    ));
    assert!(!dir.path().join("logs").join(&id).exists());
}

#[tokio::test]
async fn clean_reports_in_use_and_not_found_per_id() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(&dir, 3600);

    let running = manager.start(spec(&["sleep", "30"])).await.unwrap();
    let ids = vec![running.clone(), "ghost".to_string()];
    let outcomes = manager.clean(&ids).await;
    assert_eq!(outcomes[&running], CleanOutcome::InUse);
    assert_eq!(outcomes["ghost"], CleanOutcome::NotFound);

    // The running process is untouched.
    assert_eq!(
        manager.detail(&running).await.unwrap().status,
        ProcessStatus::Running
    );
    manager.stop(&running, true, None).await.unwrap();
}

#[tokio::test]
async fn clean_is_idempotent_over_cleaned_ids() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(&dir, 3600);

    let id = manager.start(spec(&["true"])).await.unwrap();
    manager.wait(&id).await.unwrap();

    let first = manager.clean(std::slice::from_ref(&id)).await;
    assert_eq!(first[&id], CleanOutcome::Cleaned);
    let second = manager.clean(std::slice::from_ref(&id)).await;
    assert_eq!(second[&id], CleanOutcome::NotFound);
}

// ---------------------------------------------------------------------------
// Retention and shutdown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn retention_sweep_evicts_expired_terminal_records() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(&dir, 0);

    let id = manager.start(spec(&["true"])).await.unwrap();
    manager.wait(&id).await.unwrap();

    manager.spawn_retention_sweeper();
    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert!(manager.list(None, &[]).await.is_empty());
    assert!(!dir.path().join("logs").join(&id).exists());
    manager.shutdown().await;
}

#[tokio::test]
async fn running_processes_are_never_swept() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(&dir, 0);

    let id = manager.start(spec(&["sleep", "30"])).await.unwrap();
    manager.spawn_retention_sweeper();
    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert_eq!(
        manager.detail(&id).await.unwrap().status,
        ProcessStatus::Running
    );
    manager.shutdown().await;
    assert!(manager.detail(&id).await.unwrap().status.is_terminal());
}

#[tokio::test]
async fn shutdown_force_stops_running_processes() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(&dir, 3600);

    let id = manager.start(spec(&["sleep", "30"])).await.unwrap();
    let start = Instant::now();
    manager.shutdown().await;
    assert!(start.elapsed() < Duration::from_secs(5));

    let record = manager.detail(&id).await.unwrap();
    assert_eq!(record.status, ProcessStatus::Terminated);
}
