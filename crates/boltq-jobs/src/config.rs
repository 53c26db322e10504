//! Configuration for the queue core.

use std::time::Duration;

/// Tunables recognized by the queue core.
///
/// Loading these from files or the environment is the embedding process's
/// concern; the core only consumes the struct.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Address of the shared key-value store, e.g. `redis://127.0.0.1:6379`.
    pub broker_address: String,
    /// Worker loops per process.
    pub num_workers: usize,
    /// Retry budget for errors the classifier cannot categorize.
    pub max_attempts_default: u32,
    /// Retention of job status records after completion or failure.
    pub status_ttl: Duration,
    /// Retention of workflow records.
    pub workflow_ttl: Duration,
    /// Delayed-job promoter tick.
    pub promoter_interval: Duration,
    /// Workflow scheduler tick.
    pub workflow_tick: Duration,
    /// Per-worker blocking poll timeout.
    pub dequeue_timeout: Duration,
    /// Advisory lock lease. Per-job locks use the job timeout when larger.
    pub lock_ttl: Duration,
    /// How long a pool shutdown waits for in-flight handlers.
    pub shutdown_timeout: Duration,
    /// Handler deadline applied when a job does not carry its own.
    pub default_job_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            broker_address: "redis://127.0.0.1:6379".to_string(),
            num_workers: std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(4),
            max_attempts_default: 3,
            status_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            workflow_ttl: Duration::from_secs(72 * 60 * 60),
            promoter_interval: Duration::from_secs(5),
            workflow_tick: Duration::from_secs(5),
            dequeue_timeout: Duration::from_secs(5),
            lock_ttl: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(10),
            default_job_timeout: Duration::from_secs(300),
        }
    }
}
