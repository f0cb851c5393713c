//! Job scheduling: backends, worker pool and the queue facade.
//!
//! This module provides the infrastructure for running rendering jobs:
//!
//! - **Backend**: pluggable job storage with an atomic claim (`dequeue_next`)
//! - **WorkerPool**: fixed pool of workers rendering claimed jobs
//! - **QueueManager**: submission, waiting, cancellation and statistics
//! - **Job**: job records, priorities and the lifecycle state machine
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │ QueueManager │
//!                      │  (API/CLI)   │
//!                      └──────┬───────┘
//!                             │ enqueue / get_job / cancel
//!                      ┌──────▼───────┐
//!                      │   Backend    │
//!                      │ memory/redis │
//!                      │   /managed   │
//!                      └──────┬───────┘
//!                             │ dequeue_next / update_job
//!         ┌───────────────────┼───────────────────┐
//!         │                   │                   │
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 1│         │ Worker 2│         │ Worker N│
//!    └────┬────┘         └────┬────┘         └────┬────┘
//!         └──── hooks ── Renderer ── hooks ───────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use render_queue::renderer::TeraFileRenderer;
//! use render_queue::scheduler::{JobRequest, QueueManager};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let manager = QueueManager::builder()
//!     .renderer(Arc::new(TeraFileRenderer::new("./out")))
//!     .num_workers(4)
//!     .build()?;
//! manager.start().await?;
//!
//! let id = manager
//!     .submit_job(JobRequest::new("Hello {{ name }}", json!({"name": "Ada"}), "hello.html"))
//!     .await?;
//! let job = manager.wait_for_job(id, Some(Duration::from_secs(30)), Duration::from_millis(100)).await?;
//!
//! manager.stop(None).await?;
//! ```
//!
//! # Reliability Features
//!
//! - **Atomic claim**: a job is handed to exactly one worker, under a lease
//! - **Crash recovery**: jobs whose lease expired are returned to `Pending`
//!   (consuming one retry) by the reaper and on pool start
//! - **Retry backoff**: failed attempts wait out a capped exponential delay
//! - **Graceful shutdown**: workers finish current jobs before stopping

pub mod backend;
pub mod hooks;
pub mod job;
pub mod manager;
pub mod retry;
pub mod worker_pool;

pub use backend::{connect, Backend, MemoryBackend, StatusCounts};
pub use hooks::{HookContext, HookRegistry};
pub use job::{
    AttemptOutcome, Job, JobMetadata, JobPriority, JobRequest, JobStatus, Lease, RenderPayload,
};
pub use manager::{QueueManager, QueueManagerBuilder, QueueStats, DEFAULT_WAIT_POLL_INTERVAL};
pub use retry::RetryPolicy;
pub use worker_pool::{PoolError, PoolStats, WorkerPool, WorkerPoolConfig};
