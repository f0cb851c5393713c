//! Job definitions for the scheduler.
//!
//! This module defines the core job types used in the scheduling system:
//!
//! - `Job`: A unit of rendering work plus its tracked lifecycle state
//! - `RenderPayload`: The opaque payload handed to the renderer
//! - `JobPriority` / `JobStatus`: Scheduling tier and lifecycle state
//! - `JobRequest`: A submission description used by batch submission
//!
//! # State machine
//!
//! ```text
//! PENDING ──claim──▶ PROCESSING ──▶ COMPLETED
//!    │                   │
//!    │                   ├──▶ PENDING (retry, after backoff)
//!    │                   └──▶ FAILED
//!    └──▶ CANCELLED
//! ```
//!
//! Every mutation goes through a method on [`Job`] that checks the edge first,
//! so an attempt to move a terminal job is reported as
//! [`QueueError::InvalidTransition`] and leaves the record untouched.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::QueueError;

use super::retry::RetryPolicy;

/// Default maximum number of failed attempts before a job is failed for good.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Caller-defined correlation data passed through to hooks untouched.
pub type JobMetadata = BTreeMap<String, serde_json::Value>;

/// Scheduling tier. Lower ordinal is served first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    Urgent = 0,
    High = 1,
    #[default]
    Normal = 2,
    Low = 3,
}

impl JobPriority {
    /// All tiers in service order.
    pub const ALL: [JobPriority; 4] = [
        JobPriority::Urgent,
        JobPriority::High,
        JobPriority::Normal,
        JobPriority::Low,
    ];

    /// Numeric ordinal used by sortable backend scores.
    pub fn ordinal(self) -> u8 {
        self as u8
    }

    /// Converts an ordinal back into a tier.
    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        Self::ALL.get(ordinal as usize).copied()
    }
}

impl fmt::Display for JobPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobPriority::Urgent => write!(f, "urgent"),
            JobPriority::High => write!(f, "high"),
            JobPriority::Normal => write!(f, "normal"),
            JobPriority::Low => write!(f, "low"),
        }
    }
}

impl FromStr for JobPriority {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "urgent" => Ok(JobPriority::Urgent),
            "high" => Ok(JobPriority::High),
            "normal" => Ok(JobPriority::Normal),
            "low" => Ok(JobPriority::Low),
            other => Err(QueueError::Validation(format!(
                "unknown priority '{}': expected urgent, high, normal or low",
                other
            ))),
        }
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting in the ready set (possibly inside a retry backoff window).
    Pending,
    /// Claimed by exactly one worker.
    Processing,
    /// Rendered successfully; `result_path` is set.
    Completed,
    /// Failed permanently; `error` is set.
    Failed,
    /// Cancelled before any worker claimed it.
    Cancelled,
}

impl JobStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    /// Returns whether no further transitions are permitted.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Returns whether `self → next` is an edge of the state machine.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Pending, JobStatus::Cancelled)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Pending)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }

    /// Lowercase name used in storage layouts and metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| QueueError::Validation(format!("unknown job status '{}'", s)))
    }
}

/// The renderer's input. The queue never inspects these fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderPayload {
    /// Template reference or template source, interpreted by the renderer.
    pub template: String,
    /// Data bound into the template.
    pub data: serde_json::Value,
    /// File name the renderer should produce.
    pub output_filename: String,
    /// Optional stylesheet reference.
    #[serde(default)]
    pub css_file: Option<String>,
}

impl RenderPayload {
    pub fn new(
        template: impl Into<String>,
        data: serde_json::Value,
        output_filename: impl Into<String>,
    ) -> Self {
        Self {
            template: template.into(),
            data,
            output_filename: output_filename.into(),
            css_file: None,
        }
    }

    /// Sets the stylesheet reference.
    pub fn with_css_file(mut self, css_file: impl Into<String>) -> Self {
        self.css_file = Some(css_file.into());
        self
    }

    /// Checks that the required fields are present and non-empty.
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.template.trim().is_empty() {
            return Err(QueueError::Validation("template is required".to_string()));
        }
        if self.output_filename.trim().is_empty() {
            return Err(QueueError::Validation(
                "output_filename is required".to_string(),
            ));
        }

        let data_is_empty = match &self.data {
            serde_json::Value::Null => true,
            serde_json::Value::Object(map) => map.is_empty(),
            serde_json::Value::Array(items) => items.is_empty(),
            serde_json::Value::String(s) => s.is_empty(),
            _ => false,
        };
        if data_is_empty {
            return Err(QueueError::Validation("data is required".to_string()));
        }

        Ok(())
    }
}

/// Ownership token handed to the worker that claimed a job.
///
/// `update_job` only accepts a record whose lease matches the stored one, so a
/// worker whose claim was reclaimed cannot overwrite the new owner's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Unique id of this claim.
    pub id: Uuid,
    /// When the claim was taken; drives stuck-job reclamation.
    pub claimed_at: DateTime<Utc>,
    /// Receipt handle of the underlying message, for message-queue backends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt: Option<String>,
}

impl Lease {
    pub fn new(claimed_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            claimed_at,
            receipt: None,
        }
    }

    /// Attaches a message receipt handle.
    pub fn with_receipt(mut self, receipt: impl Into<String>) -> Self {
        self.receipt = Some(receipt.into());
        self
    }
}

/// What happened after a failed attempt was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Back to `Pending`, eligible again after `delay`.
    Retry { delay: Duration },
    /// Retries exhausted or the error was permanent.
    Failed,
}

/// A job representing one unit of rendering work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier, assigned at submission.
    pub id: Uuid,
    /// Renderer input.
    pub payload: RenderPayload,
    /// Scheduling tier.
    pub priority: JobPriority,
    /// Current lifecycle state.
    pub status: JobStatus,
    /// When the job was submitted.
    pub created_at: DateTime<Utc>,
    /// When the job first entered `Processing`.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Earliest time the job may be dequeued; its FIFO position within a tier.
    pub eligible_at: DateTime<Utc>,
    /// Renderer output, set on `Completed`.
    #[serde(default)]
    pub result_path: Option<PathBuf>,
    /// Final error, set on `Failed`.
    #[serde(default)]
    pub error: Option<String>,
    /// Number of failed attempts so far.
    pub retry_count: u32,
    /// Failed attempts allowed before the job fails for good.
    pub max_retries: u32,
    #[serde(default)]
    pub metadata: JobMetadata,
    /// Current claim. Stored records carry it only while `Processing`.
    #[serde(default)]
    pub lease: Option<Lease>,
}

impl Job {
    /// Creates a new pending job.
    pub fn new(payload: RenderPayload, priority: JobPriority) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            payload,
            priority,
            status: JobStatus::Pending,
            created_at: now,
            started_at: None,
            completed_at: None,
            eligible_at: now,
            result_path: None,
            error: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            metadata: JobMetadata::new(),
            lease: None,
        }
    }

    /// Sets the maximum number of failed attempts.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the caller metadata.
    pub fn with_metadata(mut self, metadata: JobMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Returns whether the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns whether the job may be dequeued at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.lease.is_none() && self.eligible_at <= now
    }

    /// Returns the id of the current lease, if any.
    pub fn lease_id(&self) -> Option<Uuid> {
        self.lease.as_ref().map(|lease| lease.id)
    }

    /// Returns the number of failed attempts still allowed.
    pub fn remaining_retries(&self) -> u32 {
        self.max_retries.saturating_sub(self.retry_count)
    }

    /// Claims the job for a worker: `Pending → Processing`.
    pub fn start(&mut self, lease: Lease) -> Result<(), QueueError> {
        self.ensure_transition(JobStatus::Processing)?;

        let now = lease.claimed_at;
        self.status = JobStatus::Processing;
        self.started_at.get_or_insert(now);
        self.lease = Some(lease);
        Ok(())
    }

    /// Records a successful render: `Processing → Completed`.
    pub fn complete(
        &mut self,
        result_path: impl Into<PathBuf>,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        self.ensure_transition(JobStatus::Completed)?;

        self.status = JobStatus::Completed;
        self.result_path = Some(result_path.into());
        self.completed_at = Some(self.not_before_start(now));
        Ok(())
    }

    /// Records a failed attempt.
    ///
    /// Like [`Job::complete`], this keeps the caller's lease on the record so
    /// the backend can verify ownership; see [`Job::persisted`].
    ///
    /// Increments `retry_count` (never past `max_retries`) and either returns
    /// the job to `Pending` with a backoff, or fails it when the error is
    /// permanent or no retries remain.
    pub fn record_failure(
        &mut self,
        error: impl Into<String>,
        retryable: bool,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<AttemptOutcome, QueueError> {
        if self.status != JobStatus::Processing {
            return Err(self.transition_error(JobStatus::Failed));
        }

        if self.retry_count < self.max_retries {
            self.retry_count += 1;
        }

        if retryable && self.retry_count < self.max_retries {
            let delay = policy.delay_for(self.retry_count);
            self.status = JobStatus::Pending;
            self.eligible_at = now + chrono::Duration::milliseconds(delay.as_millis() as i64);
            Ok(AttemptOutcome::Retry { delay })
        } else {
            self.status = JobStatus::Failed;
            self.error = Some(error.into());
            self.completed_at = Some(self.not_before_start(now));
            Ok(AttemptOutcome::Failed)
        }
    }

    /// Cancels a job nobody has claimed yet: `Pending → Cancelled`.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<(), QueueError> {
        self.ensure_transition(JobStatus::Cancelled)?;

        self.status = JobStatus::Cancelled;
        self.completed_at = Some(now.max(self.created_at));
        Ok(())
    }

    /// Returns the record as a backend stores it: the lease only survives
    /// while the job is `Processing`.
    pub fn persisted(&self) -> Job {
        let mut record = self.clone();
        if record.status != JobStatus::Processing {
            record.lease = None;
        }
        record
    }

    /// Checks that `self.status → next` is legal.
    pub fn ensure_transition(&self, next: JobStatus) -> Result<(), QueueError> {
        if self.status.can_transition_to(next) {
            Ok(())
        } else {
            Err(self.transition_error(next))
        }
    }

    /// Validates a replacement record against this (stored) record.
    ///
    /// The incoming record must come from the lease holder, and its status
    /// must either be unchanged or follow a state machine edge.
    pub fn check_replacement(&self, incoming: &Job) -> Result<(), QueueError> {
        if self.is_terminal() {
            return Err(self.transition_error(incoming.status));
        }
        if self.lease_id() != incoming.lease_id() {
            return Err(QueueError::LeaseMismatch(self.id));
        }
        if self.status != incoming.status && !self.status.can_transition_to(incoming.status) {
            return Err(self.transition_error(incoming.status));
        }
        Ok(())
    }

    fn transition_error(&self, to: JobStatus) -> QueueError {
        QueueError::InvalidTransition {
            id: self.id,
            from: self.status,
            to,
        }
    }

    fn not_before_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let floor = self.started_at.unwrap_or(self.created_at);
        now.max(floor)
    }
}

/// A submission request, as accepted by batch submission and job files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub template: String,
    pub data: serde_json::Value,
    pub output_filename: String,
    #[serde(default)]
    pub css_file: Option<String>,
    /// Falls back to the batch default, then `Normal`.
    #[serde(default)]
    pub priority: Option<JobPriority>,
    #[serde(default)]
    pub metadata: JobMetadata,
    /// Falls back to the configured default.
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl JobRequest {
    pub fn new(
        template: impl Into<String>,
        data: serde_json::Value,
        output_filename: impl Into<String>,
    ) -> Self {
        Self {
            template: template.into(),
            data,
            output_filename: output_filename.into(),
            css_file: None,
            priority: None,
            metadata: JobMetadata::new(),
            max_retries: None,
        }
    }

    pub fn with_css_file(mut self, css_file: impl Into<String>) -> Self {
        self.css_file = Some(css_file.into());
        self
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Splits the request into the renderer payload.
    pub fn payload(&self) -> RenderPayload {
        RenderPayload {
            template: self.template.clone(),
            data: self.data.clone(),
            output_filename: self.output_filename.clone(),
            css_file: self.css_file.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload() -> RenderPayload {
        RenderPayload::new("invoice.html", json!({"total": 42}), "invoice.pdf")
    }

    fn claimed_job(max_retries: u32) -> Job {
        let mut job = Job::new(payload(), JobPriority::Normal).with_max_retries(max_retries);
        job.start(Lease::new(Utc::now())).expect("pending job should start");
        job
    }

    #[test]
    fn test_job_new() {
        let job = Job::new(payload(), JobPriority::High);

        assert!(!job.id.is_nil());
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.priority, JobPriority::High);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(job.eligible_at, job.created_at);
        assert!(job.started_at.is_none());
        assert!(job.lease.is_none());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(JobPriority::Urgent < JobPriority::High);
        assert!(JobPriority::High < JobPriority::Normal);
        assert!(JobPriority::Normal < JobPriority::Low);
        assert_eq!(JobPriority::default(), JobPriority::Normal);
        assert_eq!(JobPriority::from_ordinal(0), Some(JobPriority::Urgent));
        assert_eq!(JobPriority::from_ordinal(4), None);
    }

    #[test]
    fn test_priority_parse() {
        assert_eq!("URGENT".parse::<JobPriority>().unwrap(), JobPriority::Urgent);
        assert_eq!(" low ".parse::<JobPriority>().unwrap(), JobPriority::Low);
        assert!("asap".parse::<JobPriority>().is_err());
    }

    #[test]
    fn test_status_edges() {
        use JobStatus::*;

        assert!(Pending.can_transition_to(Processing));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Processing.can_transition_to(Pending));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Processing.can_transition_to(Cancelled));
        for terminal in [Completed, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            for next in JobStatus::ALL {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_status_display_and_parse() {
        for status in JobStatus::ALL {
            assert_eq!(status.to_string().parse::<JobStatus>().unwrap(), status);
        }
        assert_eq!(format!("{}", JobStatus::Processing), "processing");
    }

    #[test]
    fn test_payload_validation() {
        assert!(payload().validate().is_ok());

        let mut bad = payload();
        bad.template = "  ".to_string();
        assert!(matches!(bad.validate(), Err(QueueError::Validation(_))));

        let mut bad = payload();
        bad.output_filename = String::new();
        assert!(bad.validate().is_err());

        let mut bad = payload();
        bad.data = json!({});
        assert!(bad.validate().is_err());

        let mut bad = payload();
        bad.data = serde_json::Value::Null;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_start_sets_started_at_once() {
        let mut job = claimed_job(3);
        let first_start = job.started_at;

        assert_eq!(job.status, JobStatus::Processing);
        assert!(job.lease.is_some());

        job.record_failure("boom", true, &RetryPolicy::immediate(), Utc::now())
            .unwrap();
        job.start(Lease::new(Utc::now())).unwrap();

        assert_eq!(job.started_at, first_start);
    }

    #[test]
    fn test_complete() {
        let mut job = claimed_job(3);
        job.complete("/tmp/out.pdf", Utc::now()).unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result_path, Some(PathBuf::from("/tmp/out.pdf")));
        assert!(job.completed_at.unwrap() >= job.started_at.unwrap());
        assert!(job.lease.is_some());
        assert!(job.persisted().lease.is_none());
    }

    #[test]
    fn test_complete_requires_processing() {
        let mut job = Job::new(payload(), JobPriority::Normal);
        let err = job.complete("/tmp/out.pdf", Utc::now()).unwrap_err();

        assert!(matches!(err, QueueError::InvalidTransition { .. }));
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[test]
    fn test_retry_schedules_backoff() {
        let mut job = claimed_job(3);
        let policy = RetryPolicy::new(Duration::from_secs(2), Duration::from_secs(60));
        let now = Utc::now();

        let outcome = job.record_failure("flaky", true, &policy, now).unwrap();

        assert_eq!(
            outcome,
            AttemptOutcome::Retry {
                delay: Duration::from_secs(2)
            }
        );
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.eligible_at, now + chrono::Duration::seconds(2));
        assert!(job.error.is_none());

        let stored = job.persisted();
        assert!(stored.lease.is_none());
        assert!(!stored.is_eligible(now));
        assert!(stored.is_eligible(now + chrono::Duration::seconds(2)));
    }

    #[test]
    fn test_retry_limit_is_never_exceeded() {
        let mut job = claimed_job(2);
        let policy = RetryPolicy::immediate();

        let first = job.record_failure("e1", true, &policy, Utc::now()).unwrap();
        assert!(matches!(first, AttemptOutcome::Retry { .. }));

        job.start(Lease::new(Utc::now())).unwrap();
        let second = job.record_failure("e2", true, &policy, Utc::now()).unwrap();

        assert_eq!(second, AttemptOutcome::Failed);
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 2);
        assert_eq!(job.error.as_deref(), Some("e2"));
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn test_permanent_failure_skips_retries() {
        let mut job = claimed_job(5);
        let outcome = job
            .record_failure("bad input", false, &RetryPolicy::immediate(), Utc::now())
            .unwrap();

        assert_eq!(outcome, AttemptOutcome::Failed);
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[test]
    fn test_zero_max_retries_fails_without_counting_past_limit() {
        let mut job = claimed_job(0);
        job.record_failure("nope", true, &RetryPolicy::immediate(), Utc::now())
            .unwrap();

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 0);
    }

    #[test]
    fn test_cancel_only_pending() {
        let mut job = Job::new(payload(), JobPriority::Low);
        job.cancel(Utc::now()).unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);

        let err = job.cancel(Utc::now()).unwrap_err();
        assert!(matches!(err, QueueError::InvalidTransition { .. }));

        let mut running = claimed_job(3);
        assert!(running.cancel(Utc::now()).is_err());
        assert_eq!(running.status, JobStatus::Processing);
    }

    #[test]
    fn test_terminal_job_rejects_mutation() {
        let mut job = claimed_job(3);
        job.complete("/out.pdf", Utc::now()).unwrap();
        let snapshot = job.clone();

        assert!(job.start(Lease::new(Utc::now())).is_err());
        assert!(job
            .record_failure("late", true, &RetryPolicy::immediate(), Utc::now())
            .is_err());
        assert_eq!(job, snapshot);
    }

    #[test]
    fn test_check_replacement() {
        let stored = claimed_job(3);

        let mut done = stored.clone();
        done.complete("/out.pdf", Utc::now()).unwrap();
        assert!(stored.check_replacement(&done).is_ok());

        let mut stranger = done.clone();
        stranger.lease = Some(Lease::new(Utc::now()));
        assert!(matches!(
            stored.check_replacement(&stranger),
            Err(QueueError::LeaseMismatch(_))
        ));

        let mut finished = stored.clone();
        finished.status = JobStatus::Completed;
        assert!(matches!(
            finished.check_replacement(&done),
            Err(QueueError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_job_serialization() {
        let job = Job::new(payload(), JobPriority::Urgent)
            .with_metadata(JobMetadata::from([("tenant".to_string(), json!("acme"))]));

        let json = serde_json::to_string(&job).expect("serialization should work");
        let parsed: Job = serde_json::from_str(&json).expect("deserialization should work");

        assert_eq!(parsed, job);
        assert!(json.contains("\"priority\":\"urgent\""));
        assert!(json.contains("\"status\":\"pending\""));
    }

    #[test]
    fn test_job_request_builder() {
        let request = JobRequest::new("report.html", json!({"rows": [1, 2]}), "report.pdf")
            .with_css_file("report.css")
            .with_priority(JobPriority::High)
            .with_metadata("user_id", json!("u-1"))
            .with_max_retries(5);

        assert_eq!(request.priority, Some(JobPriority::High));
        assert_eq!(request.max_retries, Some(5));
        assert_eq!(request.metadata.get("user_id"), Some(&json!("u-1")));

        let payload = request.payload();
        assert_eq!(payload.css_file.as_deref(), Some("report.css"));
        assert_eq!(payload.output_filename, "report.pdf");
    }
}
