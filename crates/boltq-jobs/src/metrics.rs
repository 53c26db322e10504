//! In-process counters shared by the queue components.
//!
//! Exporters live outside the core; anything that wants Prometheus or
//! similar reads a [`MetricsSnapshot`] and translates it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Counters updated on hot paths with relaxed atomics.
#[derive(Debug, Default)]
pub struct QueueMetrics {
    active_workers: AtomicI64,
    jobs_submitted: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_retried: AtomicU64,
    jobs_dead_lettered: AtomicU64,
    jobs_cancelled: AtomicU64,
    jobs_promoted: AtomicU64,
    latency_by_type: Mutex<HashMap<String, LatencyStat>>,
}

#[derive(Debug, Default, Clone, Copy)]
struct LatencyStat {
    count: u64,
    total_ms: u64,
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    /// Workers currently executing a handler.
    pub active_workers: i64,
    /// Jobs accepted by `submit`/`submit_delayed`.
    pub jobs_submitted: u64,
    /// Jobs that completed successfully.
    pub jobs_completed: u64,
    /// Failed attempts that were re-enqueued.
    pub jobs_retried: u64,
    /// Jobs moved to the dead-letter list.
    pub jobs_dead_lettered: u64,
    /// Jobs cancelled before execution.
    pub jobs_cancelled: u64,
    /// Delayed jobs promoted into a lane.
    pub jobs_promoted: u64,
    /// Mean handler latency per job type, in milliseconds.
    pub mean_latency_ms_by_type: HashMap<String, f64>,
}

impl QueueMetrics {
    /// Fresh zeroed metrics.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn worker_started(&self) {
        self.active_workers.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn worker_finished(&self) {
        self.active_workers.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn job_submitted(&self) {
        self.jobs_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn job_completed(&self) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn job_retried(&self) {
        self.jobs_retried.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn job_dead_lettered(&self) {
        self.jobs_dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn job_cancelled(&self) {
        self.jobs_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn jobs_promoted(&self, count: u64) {
        self.jobs_promoted.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_latency(&self, job_type: &str, elapsed: Duration) {
        let mut map = self.latency_by_type.lock().expect("metrics mutex poisoned");
        let stat = map.entry(job_type.to_string()).or_default();
        stat.count += 1;
        stat.total_ms += elapsed.as_millis() as u64;
    }

    /// Number of workers currently executing a handler.
    pub fn active_workers(&self) -> i64 {
        self.active_workers.load(Ordering::Relaxed)
    }

    /// Copy out every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let latency = self.latency_by_type.lock().expect("metrics mutex poisoned");
        MetricsSnapshot {
            active_workers: self.active_workers.load(Ordering::Relaxed),
            jobs_submitted: self.jobs_submitted.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_retried: self.jobs_retried.load(Ordering::Relaxed),
            jobs_dead_lettered: self.jobs_dead_lettered.load(Ordering::Relaxed),
            jobs_cancelled: self.jobs_cancelled.load(Ordering::Relaxed),
            jobs_promoted: self.jobs_promoted.load(Ordering::Relaxed),
            mean_latency_ms_by_type: latency
                .iter()
                .map(|(ty, stat)| {
                    let mean = if stat.count == 0 {
                        0.0
                    } else {
                        stat.total_ms as f64 / stat.count as f64
                    };
                    (ty.clone(), mean)
                })
                .collect(),
        }
    }
}
