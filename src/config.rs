//! Queue configuration.
//!
//! Loaded from YAML; every field has a default so an empty file is a valid
//! in-memory setup:
//!
//! ```yaml
//! backend:
//!   type: redis
//!   url: redis://localhost:6379
//!   namespace: render_queue
//! workers:
//!   num_workers: 8
//!   visibility_timeout_secs: 600
//! retry:
//!   base_delay_ms: 500
//!   max_delay_ms: 30000
//! default_max_retries: 3
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::QueueError;
use crate::scheduler::job::DEFAULT_MAX_RETRIES;
use crate::scheduler::retry::RetryPolicy;
use crate::scheduler::worker_pool::WorkerPoolConfig;

/// Default Redis key prefix.
pub const DEFAULT_NAMESPACE: &str = "render_queue";

/// Default managed queue name.
pub const DEFAULT_QUEUE_NAME: &str = "render-jobs";

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_queue_name() -> String {
    DEFAULT_QUEUE_NAME.to_string()
}

/// Which backend stores the jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    /// In-process store, lost on exit.
    #[default]
    Memory,
    /// Shared Redis store.
    Redis {
        url: String,
        #[serde(default = "default_namespace")]
        namespace: String,
    },
    /// Message queue plus metadata table, backed by SQLite.
    Managed {
        database_url: String,
        #[serde(default = "default_queue_name")]
        queue_name: String,
    },
}

impl BackendConfig {
    pub fn redis(url: impl Into<String>) -> Self {
        BackendConfig::Redis {
            url: url.into(),
            namespace: default_namespace(),
        }
    }

    pub fn managed(database_url: impl Into<String>) -> Self {
        BackendConfig::Managed {
            database_url: database_url.into(),
            queue_name: default_queue_name(),
        }
    }

    /// Short variant name.
    pub fn kind(&self) -> &'static str {
        match self {
            BackendConfig::Memory => "memory",
            BackendConfig::Redis { .. } => "redis",
            BackendConfig::Managed { .. } => "managed",
        }
    }
}

/// Worker pool settings, in plain numbers for YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub num_workers: usize,
    pub poll_interval_ms: u64,
    pub visibility_timeout_secs: u64,
    pub reclaim_interval_ms: u64,
    pub shutdown_timeout_secs: u64,
    pub backend_retry_max_ms: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            num_workers: 4,
            poll_interval_ms: 500,
            visibility_timeout_secs: 300,
            reclaim_interval_ms: 5_000,
            shutdown_timeout_secs: 60,
            backend_retry_max_ms: 30_000,
        }
    }
}

/// Retry backoff settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub backend: BackendConfig,
    pub workers: WorkerSettings,
    pub retry: RetrySettings,
    /// Retries granted to jobs submitted without an explicit limit.
    pub default_max_retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            workers: WorkerSettings::default(),
            retry: RetrySettings::default(),
            default_max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl QueueConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, QueueError> {
        let config: QueueConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self, QueueError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| QueueError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_yaml_str(&content)
    }

    pub fn with_backend(mut self, backend: BackendConfig) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.workers.num_workers = num_workers;
        self
    }

    pub fn with_default_max_retries(mut self, max_retries: u32) -> Self {
        self.default_max_retries = max_retries;
        self
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        if self.workers.num_workers == 0 {
            return Err(QueueError::Config(
                "workers.num_workers must be at least 1".to_string(),
            ));
        }
        if self.workers.poll_interval_ms == 0 {
            return Err(QueueError::Config(
                "workers.poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.workers.visibility_timeout_secs == 0 {
            return Err(QueueError::Config(
                "workers.visibility_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.workers.reclaim_interval_ms == 0 {
            return Err(QueueError::Config(
                "workers.reclaim_interval_ms must be greater than zero".to_string(),
            ));
        }
        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return Err(QueueError::Config(
                "retry.multiplier must be a finite number >= 1.0".to_string(),
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(QueueError::Config(
                "retry.base_delay_ms must not exceed retry.max_delay_ms".to_string(),
            ));
        }
        match &self.backend {
            BackendConfig::Redis { url, .. } if url.trim().is_empty() => Err(QueueError::Config(
                "backend.url is required for redis".to_string(),
            )),
            BackendConfig::Managed { database_url, .. } if database_url.trim().is_empty() => {
                Err(QueueError::Config(
                    "backend.database_url is required for managed".to_string(),
                ))
            }
            _ => Ok(()),
        }
    }

    pub fn worker_pool_config(&self) -> WorkerPoolConfig {
        let w = &self.workers;
        WorkerPoolConfig::new(w.num_workers)
            .with_poll_interval(Duration::from_millis(w.poll_interval_ms))
            .with_visibility_timeout(Duration::from_secs(w.visibility_timeout_secs))
            .with_reclaim_interval(Duration::from_millis(w.reclaim_interval_ms))
            .with_shutdown_timeout(Duration::from_secs(w.shutdown_timeout_secs))
            .with_backend_retry_max(Duration::from_millis(w.backend_retry_max_ms))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.retry.base_delay_ms),
            Duration::from_millis(self.retry.max_delay_ms),
        )
        .with_multiplier(self.retry.multiplier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_yaml_is_default() {
        let config = QueueConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config, QueueConfig::default());
        assert_eq!(config.backend, BackendConfig::Memory);
        assert_eq!(config.default_max_retries, 3);
    }

    #[test]
    fn test_redis_backend_yaml() {
        let yaml = r#"
backend:
  type: redis
  url: redis://cache:6379
workers:
  num_workers: 8
retry:
  base_delay_ms: 200
"#;
        let config = QueueConfig::from_yaml_str(yaml).unwrap();

        assert_eq!(
            config.backend,
            BackendConfig::Redis {
                url: "redis://cache:6379".to_string(),
                namespace: DEFAULT_NAMESPACE.to_string(),
            }
        );
        assert_eq!(config.workers.num_workers, 8);
        assert_eq!(config.workers.poll_interval_ms, 500);
        assert_eq!(config.retry.base_delay_ms, 200);
        assert_eq!(config.retry.max_delay_ms, 60_000);
    }

    #[test]
    fn test_managed_backend_yaml() {
        let yaml = "backend:\n  type: managed\n  database_url: jobs.db\n  queue_name: pdf\n";
        let config = QueueConfig::from_yaml_str(yaml).unwrap();

        assert_eq!(config.backend.kind(), "managed");
        assert_eq!(
            config.backend,
            BackendConfig::Managed {
                database_url: "jobs.db".to_string(),
                queue_name: "pdf".to_string(),
            }
        );
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let err = QueueConfig::from_yaml_str("backend:\n  type: kafka\n").unwrap_err();
        assert!(matches!(err, QueueError::Config(_)));
    }

    #[test]
    fn test_validation() {
        assert!(QueueConfig::default().with_num_workers(0).validate().is_err());
        assert!(QueueConfig::default()
            .with_backend(BackendConfig::redis(""))
            .validate()
            .is_err());

        let mut config = QueueConfig::default();
        config.retry.multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = QueueConfig::default();
        config.retry.base_delay_ms = 120_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_conversions() {
        let config = QueueConfig::default().with_num_workers(2);

        let pool = config.worker_pool_config();
        assert_eq!(pool.num_workers, 2);
        assert_eq!(pool.poll_interval, Duration::from_millis(500));
        assert_eq!(pool.visibility_timeout, Duration::from_secs(300));

        let policy = config.retry_policy();
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
    }

    #[test]
    fn test_from_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.yaml");
        std::fs::write(&path, "default_max_retries: 5\n").unwrap();

        let config = QueueConfig::from_yaml_file(&path).unwrap();
        assert_eq!(config.default_max_retries, 5);

        let missing = QueueConfig::from_yaml_file(&dir.path().join("nope.yaml"));
        assert!(matches!(missing, Err(QueueError::Config(_))));
    }
}
