//! render-queue: asynchronous job queue and worker pool for document rendering.
//!
//! Jobs are submitted through a [`QueueManager`], stored by a pluggable
//! [`Backend`](scheduler::Backend) (in-memory, Redis, or a managed message
//! queue with a metadata table) and rendered by a fixed pool of workers
//! through the [`Renderer`](renderer::Renderer) seam. Jobs are served by
//! priority, then FIFO, retried with capped exponential backoff, and
//! reclaimed when a worker goes silent.

pub mod cli;
pub mod config;
pub mod error;
pub mod metrics;
pub mod renderer;
pub mod scheduler;

pub use config::{BackendConfig, QueueConfig};
pub use error::QueueError;
pub use renderer::{RenderError, Renderer, TeraFileRenderer};
pub use scheduler::{
    HookContext, HookRegistry, Job, JobPriority, JobRequest, JobStatus, PoolError, PoolStats,
    QueueManager, QueueStats, RetryPolicy,
};
