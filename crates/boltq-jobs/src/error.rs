//! Error types for the job queue core.

use boltq_store::StoreError;
use snafu::Snafu;

use crate::job::JobStatus;

/// Result type for queue operations.
pub type Result<T, E = QueueError> = std::result::Result<T, E>;

/// Errors surfaced by queue operations.
///
/// Handler failures are never represented here; they are recorded on the job
/// envelope (`error` field) and drive the retry policy instead.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum QueueError {
    /// Malformed submission: invalid enum value, empty workflow, cyclic
    /// dependency graph.
    #[snafu(display("bad request: {reason}"))]
    BadRequest {
        /// What was wrong with the request.
        reason: String,
    },

    /// Unknown job ID.
    #[snafu(display("job not found: {id}"))]
    JobNotFound {
        /// The ID that was looked up.
        id: String,
    },

    /// Unknown workflow ID.
    #[snafu(display("workflow not found: {id}"))]
    WorkflowNotFound {
        /// The ID that was looked up.
        id: String,
    },

    /// The job's current status does not permit the operation.
    #[snafu(display("invalid transition: cannot {operation} a {status} job"))]
    InvalidTransition {
        /// Current status of the job.
        status: JobStatus,
        /// Operation that was attempted.
        operation: String,
    },

    /// The shared store failed or is unreachable.
    #[snafu(display("broker unavailable: {source}"))]
    BrokerUnavailable {
        /// Underlying store error.
        source: StoreError,
    },

    /// An advisory lock stayed held past the retry window.
    #[snafu(display("lock contended: {key}"))]
    LockContended {
        /// The lock key that could not be acquired.
        key: String,
    },

    /// An envelope could not be serialized or deserialized.
    #[snafu(display("serialization error: {source}"))]
    Serialization {
        /// Underlying JSON error.
        source: serde_json::Error,
    },
}

impl From<StoreError> for QueueError {
    fn from(source: StoreError) -> Self {
        Self::BrokerUnavailable { source }
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(source: serde_json::Error) -> Self {
        Self::Serialization { source }
    }
}
