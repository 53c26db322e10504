//! Distributed job queue core for BoltQ.
//!
//! Clients submit opaque jobs to a shared broker store; a pool of worker
//! loops pulls them back out, runs type-specific handlers, and records
//! outcomes. Jobs can be priority-ordered, time-delayed, retried with
//! category-specific backoff, or assembled into dependency graphs whose
//! steps become jobs as their prerequisites complete.
//!
//! # Components
//!
//! - [`BrokerClient`]: typed operations over the shared store; the only
//!   component that touches it directly
//! - [`WorkerPool`]: fixed-size set of worker loops with per-job advisory
//!   locks and handler deadlines
//! - [`classify`](mod@classify): error classifier and retry policy
//! - [`DelayedJobPromoter`]: periodic task releasing scheduled jobs
//! - [`WorkflowEngine`]: schedules dependent steps and finalizes workflows
//!
//! Delivery is at-least-once; handlers must be idempotent. The `task:{id}`
//! status record in the store is the source of truth for every job.
//!
//! # Example
//!
//! ```ignore
//! use boltq_jobs::{BrokerClient, Job, JsonMap, QueueConfig, WorkerPool};
//! use boltq_store::RedisStore;
//!
//! let config = QueueConfig::default();
//! let store = Arc::new(RedisStore::connect(&config.broker_address).await?);
//! let broker = Arc::new(BrokerClient::connect(store, config).await?);
//!
//! let pool = WorkerPool::builder(broker.clone())
//!     .register("send_email", EmailHandler)
//!     .build();
//! pool.start(broker.config().num_workers).await;
//!
//! let job_id = broker
//!     .submit(Job::new("send_email", JsonMap::new()))
//!     .await?;
//! ```

#![warn(missing_docs)]

mod broker;
pub mod classify;
mod config;
mod engine;
mod error;
mod events;
mod job;
pub mod keys;
mod lock;
mod metrics;
mod promoter;
mod worker;
mod workflow;

pub use broker::{BrokerClient, QueueDepths};
pub use classify::{decide, ErrorCategory, HandlerError, RetryDecision};
pub use config::QueueConfig;
pub use engine::WorkflowEngine;
pub use error::{QueueError, Result};
pub use events::{EventKind, EventStream, QueueEvent};
pub use job::{Job, JobId, JobStatus, JsonMap, Lane, Priority, DEFAULT_JOB_TIMEOUT_SECS};
pub use lock::LeaseLock;
pub use metrics::{MetricsSnapshot, QueueMetrics};
pub use promoter::DelayedJobPromoter;
pub use worker::{Handler, WorkerPool, WorkerPoolBuilder};
pub use workflow::{
    StepInput, StepStatus, Workflow, WorkflowStatus, WorkflowStep, WorkflowSummary,
};
