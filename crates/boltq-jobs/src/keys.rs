//! Broker key layout.
//!
//! Every key and channel the queue system touches is derived here so the
//! layout is documented in one place:
//!
//! - `task_queue:{0|1|2}` - priority lanes (lists, left-push / right-pop)
//! - `retry_queue` - lane for re-enqueued retries
//! - `delayed_tasks` - sorted set scored by due time (Unix seconds)
//! - `dead_letter_queue` - list of jobs that exhausted their budget
//! - `task:{job_id}` - authoritative serialized job record
//! - `lock:job:{job_id}` - per-job advisory lease
//! - `workflow:{id}`, `workflow_status:{id}`, `workflow_queue`,
//!   `workflow_results:{workflow_id}:{step_id}` - workflow records
//! - `job_updates`, `workflow_updates` - pub/sub event channels

use crate::job::{JobId, Priority};

/// Lane holding re-enqueued retries; drained ahead of all priority lanes.
pub const RETRY_QUEUE: &str = "retry_queue";

/// Sorted set of delayed jobs, scored by due time in Unix seconds.
pub const DELAYED_SET: &str = "delayed_tasks";

/// List of jobs that exhausted their retry budget.
pub const DEAD_LETTER_QUEUE: &str = "dead_letter_queue";

/// List of workflow ids awaiting a scheduler pass.
pub const WORKFLOW_QUEUE: &str = "workflow_queue";

/// Pub/sub channel for job status transitions.
pub const JOB_UPDATES_CHANNEL: &str = "job_updates";

/// Pub/sub channel for workflow transitions.
pub const WORKFLOW_UPDATES_CHANNEL: &str = "workflow_updates";

/// Advisory lease ensuring a single delayed-job promoter cluster-wide.
pub const PROMOTER_LOCK: &str = "lock:promoter";

/// Advisory lease ensuring a single workflow scheduler cluster-wide.
pub const SCHEDULER_LOCK: &str = "lock:workflow_scheduler";

/// Priority lane list key.
pub fn lane(priority: Priority) -> String {
    format!("task_queue:{}", priority as u8)
}

/// Authoritative job status record.
pub fn job_record(id: &JobId) -> String {
    format!("task:{id}")
}

/// Per-job advisory lock.
pub fn job_lock(id: &JobId) -> String {
    format!("lock:job:{id}")
}

/// Full serialized workflow record.
pub fn workflow_record(id: &str) -> String {
    format!("workflow:{id}")
}

/// Status-only workflow record for cheap lookups.
pub fn workflow_status(id: &str) -> String {
    format!("workflow_status:{id}")
}

/// Advisory lock serializing updates to one workflow.
pub fn workflow_lock(id: &str) -> String {
    format!("lock:workflow:{id}")
}

/// Persisted result of one workflow step.
pub fn step_result(workflow_id: &str, step_id: &str) -> String {
    format!("workflow_results:{workflow_id}:{step_id}")
}

/// Prefix for scanning full workflow records.
pub const WORKFLOW_RECORD_PREFIX: &str = "workflow:";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lane_keys_use_numeric_priority() {
        assert_eq!(lane(Priority::High), "task_queue:0");
        assert_eq!(lane(Priority::Normal), "task_queue:1");
        assert_eq!(lane(Priority::Low), "task_queue:2");
    }

    #[test]
    fn record_keys_embed_ids() {
        let id = JobId::from_string("abc".to_string());
        assert_eq!(job_record(&id), "task:abc");
        assert_eq!(job_lock(&id), "lock:job:abc");
        assert_eq!(step_result("wf", "s1"), "workflow_results:wf:s1");
    }
}
