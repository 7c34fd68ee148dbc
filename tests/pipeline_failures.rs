use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use session_replicator::pipeline::{
    fetch_all, InvalidRecordPolicy, PipelineOrchestrator, RetryPolicy, RunMode,
};
use session_replicator::storage::{
    DocumentCollection, DocumentWriter, MemoryCollection, MemoryDocumentStore, SourceConnector,
};
use session_replicator::warehouse::{
    DestinationConnector, SessionWarehouse, SqliteDestinationConnector, SqliteWarehouse,
};
use session_replicator::PipelineError;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

/// Source that is unreachable for its first `failures` connection attempts
struct FlakySource {
    inner: MemoryCollection,
    failures: usize,
    connects: Arc<AtomicUsize>,
}

#[async_trait]
impl SourceConnector for FlakySource {
    async fn connect(&self) -> session_replicator::Result<Box<dyn DocumentCollection>> {
        let attempt = self.connects.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            return Err(PipelineError::source_unavailable("connection refused"));
        }
        self.inner.connect().await
    }
}

/// Destination that is unreachable for its first `failures` connection attempts
struct FlakyDestination {
    path: PathBuf,
    failures: usize,
    connects: Arc<AtomicUsize>,
}

#[async_trait]
impl DestinationConnector for FlakyDestination {
    async fn connect(&self) -> session_replicator::Result<Box<dyn SessionWarehouse>> {
        let attempt = self.connects.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            return Err(PipelineError::destination_unavailable("too many connections"));
        }
        SqliteDestinationConnector::new(&self.path).connect().await
    }
}

fn session(id: &str) -> serde_json::Value {
    json!({
        "session_id": id,
        "user_id": 42,
        "start_time": "2025-01-01T08:00:00Z",
        "end_time": "2025-01-01T08:20:00Z",
        "pages_visited": ["/home"],
        "device": "Desktop",
        "actions": ["scroll"],
    })
}

fn store_with(bodies: Vec<serde_json::Value>) -> Result<MemoryDocumentStore> {
    let store = MemoryDocumentStore::new();
    store.insert_many("UserSessions", bodies)?;
    Ok(store)
}

fn quick_retries(retries: u32) -> RetryPolicy {
    RetryPolicy::new(retries, Duration::ZERO)
}

#[tokio::test]
async fn test_unavailable_source_is_retried() -> Result<()> {
    let dir = tempdir()?;
    let store = store_with(vec![session("s1")])?;
    let connects = Arc::new(AtomicUsize::new(0));

    let report = PipelineOrchestrator::new(
        Arc::new(FlakySource {
            inner: store.collection("UserSessions"),
            failures: 1,
            connects: connects.clone(),
        }),
        Arc::new(SqliteDestinationConnector::new(dir.path().join("wh.db"))),
    )
    .with_retry_policy(quick_retries(1))
    .run_once()
    .await?;

    assert_eq!(connects.load(Ordering::SeqCst), 2);
    assert_eq!(report.attempts.get("extract"), Some(&2));
    assert_eq!(report.attempts.get("transform"), Some(&1));
    assert_eq!(report.rows_affected, 1);
    Ok(())
}

#[tokio::test]
async fn test_run_fails_once_retries_are_used_up() -> Result<()> {
    let dir = tempdir()?;
    let store = store_with(vec![session("s1")])?;
    let connects = Arc::new(AtomicUsize::new(0));

    let err = PipelineOrchestrator::new(
        Arc::new(FlakySource {
            inner: store.collection("UserSessions"),
            failures: usize::MAX,
            connects: connects.clone(),
        }),
        Arc::new(SqliteDestinationConnector::new(dir.path().join("wh.db"))),
    )
    .with_retry_policy(quick_retries(2))
    .run_once()
    .await
    .unwrap_err();

    assert!(matches!(err, PipelineError::SourceUnavailable { .. }), "{err}");
    assert_eq!(connects.load(Ordering::SeqCst), 3);
    assert!(!dir.path().join("wh.db").exists());
    Ok(())
}

#[tokio::test]
async fn test_unavailable_destination_is_retried() -> Result<()> {
    let dir = tempdir()?;
    let store = store_with(vec![session("s1"), session("s2")])?;
    let connects = Arc::new(AtomicUsize::new(0));

    let report = PipelineOrchestrator::new(
        Arc::new(store.collection("UserSessions")),
        Arc::new(FlakyDestination {
            path: dir.path().join("wh.db"),
            failures: 1,
            connects: connects.clone(),
        }),
    )
    .with_retry_policy(quick_retries(1))
    .run_once()
    .await?;

    assert_eq!(report.attempts.get("load"), Some(&2));
    assert_eq!(report.rows_affected, 2);
    Ok(())
}

#[tokio::test]
async fn test_missing_field_fails_without_retry_or_load() -> Result<()> {
    let dir = tempdir()?;
    let mut bad = session("s2");
    bad.as_object_mut().unwrap().remove("user_id");
    let store = store_with(vec![session("s1"), bad])?;
    let destination_connects = Arc::new(AtomicUsize::new(0));

    let err = PipelineOrchestrator::new(
        Arc::new(store.collection("UserSessions")),
        Arc::new(FlakyDestination {
            path: dir.path().join("wh.db"),
            failures: 0,
            connects: destination_connects.clone(),
        }),
    )
    .with_retry_policy(quick_retries(3))
    .run_once()
    .await
    .unwrap_err();

    match err {
        PipelineError::MissingRequiredField { field, session_id, .. } => {
            assert_eq!(field, "user_id");
            assert_eq!(session_id.as_deref(), Some("s2"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(destination_connects.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test]
async fn test_skip_policy_loads_valid_records_and_reports_the_rest() -> Result<()> {
    let dir = tempdir()?;
    let mut bad = session("s2");
    bad.as_object_mut().unwrap().remove("actions");
    let store = store_with(vec![session("s1"), bad, session("s3")])?;
    let wh_path = dir.path().join("wh.db");

    for mode in [RunMode::Batch, RunMode::Streaming] {
        let report = PipelineOrchestrator::new(
            Arc::new(store.collection("UserSessions")),
            Arc::new(SqliteDestinationConnector::new(&wh_path)),
        )
        .with_retry_policy(RetryPolicy::no_retry())
        .with_invalid_record_policy(InvalidRecordPolicy::Skip)
        .with_stream_chunk_size(2)
        .run(mode)
        .await?;

        assert_eq!(report.extracted, 3, "{mode:?}");
        assert_eq!(report.transformed, 2, "{mode:?}");
        assert_eq!(report.rejected, 1, "{mode:?}");
        assert_eq!(report.rows_affected, 2, "{mode:?}");
    }

    let ids: Vec<_> = fetch_all(&mut SqliteWarehouse::open(&wh_path)?)
        .await?
        .into_iter()
        .map(|r| r.session_id)
        .collect();
    assert_eq!(ids, vec!["s1", "s3"]);
    Ok(())
}

#[tokio::test]
async fn test_rejected_batch_leaves_the_table_untouched() -> Result<()> {
    let dir = tempdir()?;
    let wh_path = dir.path().join("wh.db");
    let store = store_with(vec![session("s1"), session("blocked"), session("s3")])?;

    // Prepare the table with a trigger the second record trips over
    let mut wh = SqliteWarehouse::open(&wh_path)?;
    wh.ensure_schema().await?;
    wh.execute_batch(
        "CREATE TRIGGER reject_blocked BEFORE INSERT ON user_sessions
         WHEN NEW.session_id = 'blocked'
         BEGIN SELECT RAISE(ABORT, 'blocked session'); END;",
    )?;

    let err = PipelineOrchestrator::new(
        Arc::new(store.collection("UserSessions")),
        Arc::new(SqliteDestinationConnector::new(&wh_path)),
    )
    .with_retry_policy(quick_retries(2))
    .run_once()
    .await
    .unwrap_err();

    match err {
        PipelineError::ConstraintViolation { session_id, .. } => assert_eq!(session_id, "blocked"),
        other => panic!("unexpected error: {other}"),
    }
    assert!(fetch_all(&mut wh).await?.is_empty());
    Ok(())
}
