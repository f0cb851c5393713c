//! Metrics module for Prometheus-based monitoring.
//!
//! Workers record job outcomes, render durations, reclamations and backend
//! errors through [`MetricsCollector`]. Recording is a no-op until
//! [`init_metrics`] has run, so library users who do not scrape metrics pay
//! nothing.
//!
//! # Example
//!
//! ```ignore
//! use render_queue::metrics::{init_metrics, export_metrics, JobOutcome, MetricsCollector};
//! use render_queue::JobPriority;
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_job(JobOutcome::Completed, JobPriority::Normal, 1.2);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{JobOutcome, MetricsCollector};
pub use self::prometheus::{export_metrics, init_metrics};

pub use self::prometheus::{
    ACTIVE_WORKERS, BACKEND_ERRORS_TOTAL, JOBS_IN_PROGRESS, JOBS_TOTAL, JOB_DURATION,
    QUEUE_DEPTH, RECLAIMED_TOTAL, REGISTRY,
};
