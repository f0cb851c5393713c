//! High-level recording interface over the raw Prometheus metrics.

use crate::scheduler::job::JobPriority;

use super::prometheus::{
    ACTIVE_WORKERS, BACKEND_ERRORS_TOTAL, JOBS_IN_PROGRESS, JOBS_TOTAL, JOB_DURATION,
    QUEUE_DEPTH, RECLAIMED_TOTAL,
};

/// How a single attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Retried,
    Failed,
}

impl JobOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            JobOutcome::Completed => "completed",
            JobOutcome::Retried => "retried",
            JobOutcome::Failed => "failed",
        }
    }
}

/// Metrics collector for recording queue operational metrics.
///
/// Every method silently does nothing when `init_metrics()` has not been
/// called.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record the end of one render attempt.
    pub fn record_job(&self, outcome: JobOutcome, priority: JobPriority, duration_secs: f64) {
        if let Some(jobs_total) = JOBS_TOTAL.get() {
            jobs_total.with_label_values(&[outcome.as_str()]).inc();
        }

        if let Some(job_duration) = JOB_DURATION.get() {
            let priority = priority.to_string();
            job_duration
                .with_label_values(&[priority.as_str()])
                .observe(duration_secs);
        }

        tracing::trace!(
            outcome = outcome.as_str(),
            priority = %priority,
            duration_secs = duration_secs,
            "Recorded job metric"
        );
    }

    /// Record a job taken back from an expired lease.
    pub fn record_reclaimed(&self) {
        if let Some(reclaimed) = RECLAIMED_TOTAL.get() {
            reclaimed.inc();
        }
    }

    /// Record a failed backend call.
    pub fn record_backend_error(&self, operation: &str) {
        if let Some(errors) = BACKEND_ERRORS_TOTAL.get() {
            errors.with_label_values(&[operation]).inc();
        }
    }

    /// Update the number of pending jobs for a backend.
    pub fn update_queue_depth(&self, backend: &str, depth: usize) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth.with_label_values(&[backend]).set(depth as f64);
        }

        tracing::trace!(backend = backend, depth = depth, "Updated queue depth metric");
    }

    pub fn update_workers(&self, count: usize) {
        if let Some(active_workers) = ACTIVE_WORKERS.get() {
            active_workers.set(count as f64);
        }
    }

    pub fn inc_jobs_in_progress(&self) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.inc();
        }
    }

    pub fn dec_jobs_in_progress(&self) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.dec();
        }
    }
}
