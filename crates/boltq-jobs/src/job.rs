//! Core job types and the serialized envelope.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Schemaless JSON object used for payloads and results.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// Default handler deadline in seconds.
pub const DEFAULT_JOB_TIMEOUT_SECS: u64 = 300;

/// Unique identifier for a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    /// Create a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wrap an existing identifier.
    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    /// String representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Priority of a job. Lower numeric value takes precedence.
///
/// Serialized as the bare integer (`0`, `1`, `2`) on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Priority {
    /// Dequeued before all normal and low priority work.
    High = 0,
    /// Default priority.
    Normal = 1,
    /// Dequeued only when no higher lane has work.
    Low = 2,
}

impl Priority {
    /// All priorities in dequeue order.
    pub fn all_ordered() -> [Priority; 3] {
        [Priority::High, Priority::Normal, Priority::Low]
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl From<Priority> for u8 {
    fn from(priority: Priority) -> u8 {
        priority as u8
    }
}

impl TryFrom<u8> for Priority {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Priority::High),
            1 => Ok(Priority::Normal),
            2 => Ok(Priority::Low),
            other => Err(format!("invalid priority: {other}")),
        }
    }
}

/// Status of a job in the system.
///
/// Delayed jobs are `pending` with `scheduled_at` set; there is no separate
/// scheduled status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting in a lane or in the delayed set.
    Pending,
    /// Held by a worker.
    Running,
    /// Handler returned a result.
    Completed,
    /// Retry budget exhausted; body is on the dead-letter list.
    Failed,
    /// Awaiting its backoff delay before the next attempt.
    Retrying,
    /// Cancelled before a worker picked it up.
    Cancelled,
}

impl JobStatus {
    /// Whether no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Lowercase wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The source a dequeued job came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    /// The dedicated retry lane, drained first.
    Retry,
    /// One of the priority lanes.
    Priority(Priority),
}

impl Lane {
    /// Broker list key for this lane.
    pub fn key(&self) -> String {
        match self {
            Lane::Retry => crate::keys::RETRY_QUEUE.to_string(),
            Lane::Priority(priority) => crate::keys::lane(*priority),
        }
    }

    /// Resolve a broker list key back to its lane.
    pub fn from_key(key: &str) -> Option<Lane> {
        if key == crate::keys::RETRY_QUEUE {
            return Some(Lane::Retry);
        }
        for priority in Priority::all_ordered() {
            if key == crate::keys::lane(priority) {
                return Some(Lane::Priority(priority));
            }
        }
        None
    }
}

fn default_timeout_secs() -> u64 {
    DEFAULT_JOB_TIMEOUT_SECS
}

/// A unit of work.
///
/// This struct is the wire envelope: the same JSON representation lives in
/// the priority lanes, the delayed set, the dead-letter list, and the
/// `task:{id}` status record. The status record is authoritative; lane
/// membership is derived from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID.
    pub id: JobId,
    /// Handler selector.
    #[serde(rename = "type")]
    pub job_type: String,
    /// Opaque payload handed to the handler.
    #[serde(default)]
    pub data: JsonMap,
    /// Priority lane the job belongs to.
    #[serde(default)]
    pub priority: Priority,
    /// Due time for delayed execution; in the past once promoted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Current status.
    pub status: JobStatus,
    /// Number of failed attempts so far.
    #[serde(default)]
    pub attempts: u32,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// When a worker last started executing the job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// When the last failed attempt was recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt: Option<DateTime<Utc>>,
    /// Handler deadline in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout: u64,
    /// Result produced by a successful handler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonMap>,
    /// Human-readable message from the most recent failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Owning workflow, for jobs emitted by the workflow engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    /// Owning workflow step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_step_id: Option<String>,
}

impl Job {
    /// Create a pending job with default priority and timeout.
    pub fn new<S: Into<String>>(job_type: S, data: JsonMap) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            job_type: job_type.into(),
            data,
            priority: Priority::Normal,
            scheduled_at: None,
            status: JobStatus::Pending,
            attempts: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            last_attempt: None,
            timeout: DEFAULT_JOB_TIMEOUT_SECS,
            result: None,
            error: None,
            workflow_id: None,
            workflow_step_id: None,
        }
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the handler deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout.as_secs().max(1);
        self
    }

    /// Schedule the job for a specific time.
    pub fn schedule_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Schedule the job after a delay from now.
    pub fn schedule_after(self, delay: Duration) -> Self {
        let at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
        self.schedule_at(at)
    }

    /// Link the job to a workflow step.
    pub fn for_workflow_step<S: Into<String>>(mut self, workflow_id: S, step_id: S) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self.workflow_step_id = Some(step_id.into());
        self
    }

    /// Handler deadline as a [`Duration`].
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Whether the job was emitted by the workflow engine.
    pub fn is_workflow_step(&self) -> bool {
        self.workflow_id.is_some() && self.workflow_step_id.is_some()
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Mark the job as picked up by a worker.
    pub fn mark_running(&mut self) {
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
        self.touch();
    }

    /// Mark the job as completed with the handler's result.
    pub fn mark_completed(&mut self, result: JsonMap) {
        self.status = JobStatus::Completed;
        self.result = Some(result);
        self.finished_at = Some(Utc::now());
        self.touch();
    }

    /// Record a failed attempt that will be retried after `delay`.
    pub fn mark_retrying(&mut self, error: &str, delay: Duration) {
        let now = Utc::now();
        self.status = JobStatus::Retrying;
        self.attempts += 1;
        self.last_attempt = Some(now);
        self.error = Some(error.to_string());
        self.scheduled_at =
            Some(now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero()));
        self.touch();
    }

    /// Mark the job as permanently failed after its final attempt.
    pub fn mark_failed(&mut self, error: &str) {
        let now = Utc::now();
        self.status = JobStatus::Failed;
        self.attempts += 1;
        self.last_attempt = Some(now);
        self.error = Some(error.to_string());
        self.finished_at = Some(now);
        self.touch();
    }

    /// Mark the job as cancelled.
    pub fn mark_cancelled(&mut self) {
        self.status = JobStatus::Cancelled;
        self.finished_at = Some(Utc::now());
        self.touch();
    }

    /// Clear scheduling state when promoting out of the delayed set.
    pub fn mark_promoted(&mut self) {
        self.status = JobStatus::Pending;
        self.scheduled_at = None;
        self.touch();
    }

    /// Serialize to the canonical JSON envelope.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Deserialize from the canonical JSON envelope.
    pub fn from_json(raw: &str) -> serde_json::Result<Job> {
        serde_json::from_str(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialization_round_trips() {
        let mut job = Job::new("echo", JsonMap::new()).with_priority(Priority::High);
        job.data
            .insert("msg".to_string(), serde_json::Value::String("a".to_string()));
        job.mark_running();

        let raw = job.to_json().unwrap();
        let back = Job::from_json(&raw).unwrap();

        assert_eq!(back.id, job.id);
        assert_eq!(back.job_type, "echo");
        assert_eq!(back.priority, Priority::High);
        assert_eq!(back.status, JobStatus::Running);
        assert_eq!(back.data, job.data);
        assert_eq!(back.started_at, job.started_at);
    }

    #[test]
    fn priority_serializes_as_integer() {
        let job = Job::new("t", JsonMap::new()).with_priority(Priority::Low);
        let raw = job.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["priority"], serde_json::json!(2));
        assert_eq!(value["type"], serde_json::json!("t"));
        assert_eq!(value["status"], serde_json::json!("pending"));
    }

    #[test]
    fn invalid_priority_is_rejected() {
        let raw = r#"{"id":"x","type":"t","priority":7,"status":"pending",
            "created_at":"2024-01-01T00:00:00Z","updated_at":"2024-01-01T00:00:00Z"}"#;
        assert!(Job::from_json(raw).is_err());
    }

    #[test]
    fn retrying_stamps_backoff_schedule() {
        let mut job = Job::new("flaky", JsonMap::new());
        let before = Utc::now();
        job.mark_retrying("connection timeout", Duration::from_secs(2));

        assert_eq!(job.status, JobStatus::Retrying);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.error.as_deref(), Some("connection timeout"));
        let due = job.scheduled_at.unwrap();
        assert!(due >= before + chrono::Duration::seconds(2));
        assert!(due <= Utc::now() + chrono::Duration::seconds(3));
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Retrying.is_terminal());
    }

    #[test]
    fn lane_round_trips_through_keys() {
        for lane in [
            Lane::Retry,
            Lane::Priority(Priority::High),
            Lane::Priority(Priority::Normal),
            Lane::Priority(Priority::Low),
        ] {
            assert_eq!(Lane::from_key(&lane.key()), Some(lane));
        }
        assert_eq!(Lane::from_key("task_queue:9"), None);
    }
}
