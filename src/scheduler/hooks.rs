//! Lifecycle hooks invoked by workers around each render.
//!
//! Hooks are plain closures kept in ordered lists and run in registration
//! order. A panicking hook is caught and logged; it never takes the worker
//! down and never changes the job outcome.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;

use tracing::error;
use uuid::Uuid;

use super::job::{Job, JobMetadata, JobPriority, JobStatus};

/// Read-only view of a job handed to hooks.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub job_id: Uuid,
    pub template: String,
    pub output_filename: String,
    pub priority: JobPriority,
    pub status: JobStatus,
    pub retry_count: u32,
    pub metadata: JobMetadata,
    pub result_path: Option<PathBuf>,
    pub error: Option<String>,
    pub worker_id: String,
}

impl HookContext {
    pub fn new(job: &Job, worker_id: impl Into<String>) -> Self {
        Self {
            job_id: job.id,
            template: job.payload.template.clone(),
            output_filename: job.payload.output_filename.clone(),
            priority: job.priority,
            status: job.status,
            retry_count: job.retry_count,
            metadata: job.metadata.clone(),
            result_path: job.result_path.clone(),
            error: job.error.clone(),
            worker_id: worker_id.into(),
        }
    }
}

/// Hook run before or after a render.
pub type Hook = Arc<dyn Fn(&HookContext) + Send + Sync>;

/// Hook run when a job fails for good. Receives the error message.
pub type ErrorHook = Arc<dyn Fn(&str, &HookContext) + Send + Sync>;

/// Ordered hook lists shared by all workers of a pool.
#[derive(Clone, Default)]
pub struct HookRegistry {
    before_generate: Vec<Hook>,
    after_generate: Vec<Hook>,
    on_error: Vec<ErrorHook>,
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistry")
            .field("before_generate", &self.before_generate.len())
            .field("after_generate", &self.after_generate.len())
            .field("on_error", &self.on_error.len())
            .finish()
    }
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_before_generate<F>(mut self, hook: F) -> Self
    where
        F: Fn(&HookContext) + Send + Sync + 'static,
    {
        self.add_before_generate(hook);
        self
    }

    pub fn with_after_generate<F>(mut self, hook: F) -> Self
    where
        F: Fn(&HookContext) + Send + Sync + 'static,
    {
        self.add_after_generate(hook);
        self
    }

    pub fn with_on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str, &HookContext) + Send + Sync + 'static,
    {
        self.add_on_error(hook);
        self
    }

    pub fn add_before_generate<F>(&mut self, hook: F)
    where
        F: Fn(&HookContext) + Send + Sync + 'static,
    {
        self.before_generate.push(Arc::new(hook));
    }

    pub fn add_after_generate<F>(&mut self, hook: F)
    where
        F: Fn(&HookContext) + Send + Sync + 'static,
    {
        self.after_generate.push(Arc::new(hook));
    }

    pub fn add_on_error<F>(&mut self, hook: F)
    where
        F: Fn(&str, &HookContext) + Send + Sync + 'static,
    {
        self.on_error.push(Arc::new(hook));
    }

    pub fn is_empty(&self) -> bool {
        self.before_generate.is_empty() && self.after_generate.is_empty() && self.on_error.is_empty()
    }

    /// Runs the `before_generate` hooks. Returns how many panicked.
    pub fn run_before_generate(&self, ctx: &HookContext) -> usize {
        self.before_generate
            .iter()
            .filter(|hook| !invoke("before_generate", ctx, || hook(ctx)))
            .count()
    }

    /// Runs the `after_generate` hooks. Returns how many panicked.
    pub fn run_after_generate(&self, ctx: &HookContext) -> usize {
        self.after_generate
            .iter()
            .filter(|hook| !invoke("after_generate", ctx, || hook(ctx)))
            .count()
    }

    /// Runs the `on_error` hooks. Returns how many panicked.
    pub fn run_on_error(&self, err: &str, ctx: &HookContext) -> usize {
        self.on_error
            .iter()
            .filter(|hook| !invoke("on_error", ctx, || hook(err, ctx)))
            .count()
    }
}

/// Runs one hook, returning `false` if it panicked.
fn invoke(stage: &'static str, ctx: &HookContext, f: impl FnOnce()) -> bool {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(payload) => {
            error!(
                stage = stage,
                job_id = %ctx.job_id,
                worker_id = %ctx.worker_id,
                panic = %panic_message(payload.as_ref()),
                "Hook panicked"
            );
            false
        }
    }
}

pub(super) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
