//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use boltq_jobs::{BrokerClient, Job, JobId, JobStatus, JsonMap, QueueConfig};
use boltq_store::MemoryStore;

/// Config tuned for fast tests.
pub fn test_config() -> QueueConfig {
    QueueConfig {
        dequeue_timeout: Duration::from_millis(100),
        promoter_interval: Duration::from_millis(100),
        workflow_tick: Duration::from_millis(100),
        shutdown_timeout: Duration::from_millis(500),
        ..QueueConfig::default()
    }
}

/// Broker over a fresh in-memory store.
pub fn test_broker() -> Arc<BrokerClient<MemoryStore>> {
    Arc::new(BrokerClient::new(Arc::new(MemoryStore::new()), test_config()))
}

/// Build a payload from string pairs.
pub fn payload(pairs: &[(&str, &str)]) -> JsonMap {
    let mut map = JsonMap::new();
    for (key, value) in pairs {
        map.insert(
            (*key).to_string(),
            serde_json::Value::String((*value).to_string()),
        );
    }
    map
}

/// A pending job with the given type and payload.
pub fn job(job_type: &str, pairs: &[(&str, &str)]) -> Job {
    Job::new(job_type, payload(pairs))
}

/// Poll until the job reaches `status` or the deadline passes.
pub async fn wait_for_status(
    broker: &BrokerClient<MemoryStore>,
    id: &JobId,
    status: JobStatus,
) -> Job {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(Some(job)) = broker.get_job(id).await {
            if job.status == status {
                return job;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {id} did not reach {status} in time"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
