//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by render-queue and
//! provides functions for initializing, registering, and exporting them.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all render-queue metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Finished attempts, labeled by outcome (completed, retried, failed).
pub static JOBS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Render duration in seconds, labeled by priority.
pub static JOB_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Number of pending jobs, labeled by backend.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Number of jobs currently being rendered.
pub static JOBS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Number of running worker tasks.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Jobs taken back from workers whose lease expired.
pub static RECLAIMED_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Failed backend calls, labeled by operation.
pub static BACKEND_ERRORS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Later calls are harmless: the first registered set
/// stays in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Job metrics
    let jobs_total = CounterVec::new(
        Opts::new("render_queue_jobs_total", "Total number of finished job attempts"),
        &["outcome"],
    )?;

    let job_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "render_queue_job_duration_seconds",
            "Render duration in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0]),
        &["priority"],
    )?;

    let jobs_in_progress = Gauge::new(
        "render_queue_jobs_in_progress",
        "Number of jobs currently being rendered",
    )?;

    let reclaimed_total = Counter::new(
        "render_queue_reclaimed_total",
        "Jobs reclaimed after their lease expired",
    )?;

    // Queue metrics
    let queue_depth = GaugeVec::new(
        Opts::new("render_queue_queue_depth", "Number of pending jobs"),
        &["backend"],
    )?;

    let backend_errors_total = CounterVec::new(
        Opts::new("render_queue_backend_errors_total", "Failed backend calls"),
        &["operation"],
    )?;

    // Worker metrics
    let active_workers = Gauge::new("render_queue_active_workers", "Number of running workers")?;

    registry.register(Box::new(jobs_total.clone()))?;
    registry.register(Box::new(job_duration.clone()))?;
    registry.register(Box::new(jobs_in_progress.clone()))?;
    registry.register(Box::new(reclaimed_total.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(backend_errors_total.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;

    // Already-set statics mean metrics were initialized before
    let _ = REGISTRY.set(registry);
    let _ = JOBS_TOTAL.set(jobs_total);
    let _ = JOB_DURATION.set(job_duration);
    let _ = JOBS_IN_PROGRESS.set(jobs_in_progress);
    let _ = RECLAIMED_TOTAL.set(reclaimed_total);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = BACKEND_ERRORS_TOTAL.set(backend_errors_total);
    let _ = ACTIVE_WORKERS.set(active_workers);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead when the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        let result = init_metrics();
        assert!(result.is_ok() || REGISTRY.get().is_some());
    }

    #[test]
    fn test_init_metrics_twice() {
        let _ = init_metrics();
        assert!(init_metrics().is_ok());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();

        if let Some(jobs_total) = JOBS_TOTAL.get() {
            jobs_total.with_label_values(&["completed"]).inc();
        }

        let metrics = export_metrics();
        assert!(!metrics.starts_with("# Error"));
        assert!(metrics.contains("render_queue_jobs_total"));
    }
}
