//! Tests of the managed backend on a SQLite file.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use render_queue::scheduler::backend::{ManagedBackend, MessageQueue};
use render_queue::scheduler::{Backend, RenderPayload, WorkerPoolConfig};
use render_queue::{
    Job, JobPriority, JobRequest, JobStatus, QueueError, QueueManager, RenderError, Renderer,
    RetryPolicy,
};
use serde_json::json;
use tempfile::TempDir;
use uuid::Uuid;

struct OkRenderer;

#[async_trait]
impl Renderer for OkRenderer {
    async fn render(&self, payload: &RenderPayload) -> Result<PathBuf, RenderError> {
        Ok(PathBuf::from("/rendered").join(&payload.output_filename))
    }
}

async fn open(dir: &TempDir) -> ManagedBackend {
    let path = dir.path().join("queue.db");
    ManagedBackend::open_sqlite(path.to_str().unwrap(), "test-jobs")
        .await
        .expect("sqlite queue should open")
        .with_visibility_timeout(Duration::from_secs(30))
}

fn job(output: &str) -> Job {
    Job::new(
        RenderPayload::new("Hello {{ name }}", json!({"name": "Ada"}), output),
        JobPriority::Normal,
    )
}

#[tokio::test]
async fn test_claim_and_complete() {
    let dir = tempfile::tempdir().unwrap();
    let backend = open(&dir).await;

    let job = job("a.pdf");
    let id = job.id;
    backend.enqueue(job).await.unwrap();
    assert_eq!(backend.get_pending_count().await.unwrap(), 1);

    let mut claimed = backend.dequeue_next().await.unwrap().expect("job is ready");
    assert_eq!(claimed.id, id);
    assert_eq!(claimed.status, JobStatus::Processing);
    assert!(claimed.lease.as_ref().unwrap().receipt.is_some());

    // Claimed message stays hidden.
    assert!(backend.dequeue_next().await.unwrap().is_none());

    claimed.complete("/rendered/a.pdf", Utc::now()).unwrap();
    backend.update_job(&claimed).await.unwrap();

    let stored = backend.get_job(id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
    assert!(stored.lease.is_none());
    assert_eq!(backend.get_pending_count().await.unwrap(), 0);
    assert_eq!(backend.queue().approximate_len().await.unwrap(), 0);
}

#[tokio::test]
async fn test_duplicate_enqueue_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let backend = open(&dir).await;

    let job = job("dup.pdf");
    backend.enqueue(job.clone()).await.unwrap();
    let err = backend.enqueue(job).await.unwrap_err();

    assert!(matches!(err, QueueError::Duplicate(_)));
    assert_eq!(backend.status_counts().await.unwrap().pending, 1);
}

#[tokio::test]
async fn test_failed_attempt_is_requeued() {
    let dir = tempfile::tempdir().unwrap();
    let backend = open(&dir).await;

    let id = {
        let job = job("retry.pdf").with_max_retries(3);
        let id = job.id;
        backend.enqueue(job).await.unwrap();
        id
    };

    let mut claimed = backend.dequeue_next().await.unwrap().unwrap();
    claimed
        .record_failure("boom", true, &RetryPolicy::immediate(), Utc::now())
        .unwrap();
    backend.update_job(&claimed).await.unwrap();

    let again = backend.dequeue_next().await.unwrap().expect("job requeued");
    assert_eq!(again.id, id);
    assert_eq!(again.retry_count, 1);
    assert_ne!(again.lease_id(), claimed.lease_id());
}

#[tokio::test]
async fn test_backoff_delays_redelivery() {
    let dir = tempfile::tempdir().unwrap();
    let backend = open(&dir).await;
    backend.enqueue(job("later.pdf")).await.unwrap();

    let mut claimed = backend.dequeue_next().await.unwrap().unwrap();
    let policy = RetryPolicy::new(Duration::from_secs(60), Duration::from_secs(60));
    claimed
        .record_failure("boom", true, &policy, Utc::now())
        .unwrap();
    backend.update_job(&claimed).await.unwrap();

    assert!(backend.dequeue_next().await.unwrap().is_none());
    assert_eq!(backend.get_pending_count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_stale_lease_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let backend = open(&dir).await;
    backend.enqueue(job("stale.pdf").with_max_retries(3)).await.unwrap();

    let mut first = backend.dequeue_next().await.unwrap().unwrap();

    // Reclaim it the way the pool's reaper does.
    let cutoff = Utc::now() + chrono::Duration::seconds(1);
    let mut expired = backend.expired_leases(cutoff).await.unwrap();
    assert_eq!(expired.len(), 1);
    let mut reclaimed = expired.remove(0);
    reclaimed
        .record_failure("visibility timeout exceeded", true, &RetryPolicy::immediate(), Utc::now())
        .unwrap();
    backend.update_job(&reclaimed).await.unwrap();

    let second = backend.dequeue_next().await.unwrap().unwrap();
    assert_eq!(second.id, first.id);

    first.complete("/rendered/stale.pdf", Utc::now()).unwrap();
    let err = backend.update_job(&first).await.unwrap_err();
    assert!(matches!(err, QueueError::LeaseMismatch(_)));

    let stored = backend.get_job(first.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Processing);
    assert_eq!(stored.lease_id(), second.lease_id());
}

#[tokio::test]
async fn test_cancel_pending() {
    let dir = tempfile::tempdir().unwrap();
    let backend = open(&dir).await;

    let pending = job("cancel.pdf");
    let pending_id = pending.id;
    backend.enqueue(pending).await.unwrap();

    assert!(backend.cancel_pending(pending_id).await.unwrap());
    assert!(!backend.cancel_pending(pending_id).await.unwrap());
    assert!(backend.dequeue_next().await.unwrap().is_none());
    assert_eq!(
        backend.get_job(pending_id).await.unwrap().unwrap().status,
        JobStatus::Cancelled
    );

    backend.enqueue(job("busy.pdf")).await.unwrap();
    let claimed = backend.dequeue_next().await.unwrap().unwrap();
    assert!(!backend.cancel_pending(claimed.id).await.unwrap());

    let err = backend.cancel_pending(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, QueueError::NotFound(_)));
}

#[tokio::test]
async fn test_jobs_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let id = {
        let backend = open(&dir).await;
        let job = job("durable.pdf");
        let id = job.id;
        backend.enqueue(job).await.unwrap();
        id
    };

    let backend = open(&dir).await;
    assert_eq!(
        backend.get_job(id).await.unwrap().unwrap().status,
        JobStatus::Pending
    );
    let claimed = backend.dequeue_next().await.unwrap().unwrap();
    assert_eq!(claimed.id, id);
}

#[tokio::test]
async fn test_manager_on_managed_backend() {
    let dir = tempfile::tempdir().unwrap();
    let backend: Arc<dyn Backend> = Arc::new(open(&dir).await);
    assert!(!backend.strict_priority());

    let manager = QueueManager::builder()
        .backend(backend)
        .renderer(Arc::new(OkRenderer))
        .pool_config(
            WorkerPoolConfig::new(3)
                .with_poll_interval(Duration::from_millis(10))
                .with_visibility_timeout(Duration::from_secs(30)),
        )
        .retry_policy(RetryPolicy::immediate())
        .build()
        .unwrap();
    manager.start().await.unwrap();

    let priorities = [
        JobPriority::Low,
        JobPriority::Urgent,
        JobPriority::Normal,
        JobPriority::High,
        JobPriority::Normal,
    ];
    let mut ids = Vec::new();
    for (i, priority) in priorities.into_iter().enumerate() {
        let request = JobRequest::new("Hi {{ n }}", json!({"n": i}), format!("{}.html", i))
            .with_priority(priority);
        ids.push(manager.submit_job(request).await.unwrap());
    }

    for id in &ids {
        let job = manager
            .wait_for_job(*id, Some(Duration::from_secs(10)), Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }
    manager.stop(None).await.unwrap();

    let stats = manager.get_queue_stats().await.unwrap();
    assert_eq!(stats.completed, 5);
    assert_eq!(stats.pending, 0);
}
