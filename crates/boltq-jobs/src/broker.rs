//! Broker client: the sole adapter to the shared store.
//!
//! Every other component (worker pool, promoter, workflow engine, API
//! facade) goes through this client. Each operation is a small number of
//! store calls, each atomic from the client's perspective; the `task:{id}`
//! status record is rewritten on every transition and is authoritative,
//! while lane membership is derived state.

use std::sync::Arc;
use std::time::Duration;

use boltq_store::BrokerStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::classify::HandlerError;
use crate::config::QueueConfig;
use crate::error::{QueueError, Result};
use crate::events::{EventStream, QueueEvent};
use crate::job::{Job, JobId, JobStatus, JsonMap, Lane, Priority};
use crate::keys;
use crate::metrics::QueueMetrics;
use crate::workflow::{Workflow, WorkflowStatus};

/// Lane depths reported by [`BrokerClient::stats`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueDepths {
    /// Jobs waiting in the high-priority lane.
    pub high: u64,
    /// Jobs waiting in the normal-priority lane.
    pub normal: u64,
    /// Jobs waiting in the low-priority lane.
    pub low: u64,
    /// Jobs waiting in the retry lane.
    pub retry: u64,
    /// Jobs in the delayed set.
    pub delayed: u64,
    /// Jobs on the dead-letter list.
    pub dead_letter: u64,
    /// Workflow ids awaiting a scheduler pass.
    pub workflows_queued: u64,
}

/// Typed operations over the shared store.
pub struct BrokerClient<S: BrokerStore + ?Sized> {
    store: Arc<S>,
    config: QueueConfig,
    metrics: Arc<QueueMetrics>,
}

impl<S: BrokerStore + ?Sized + 'static> BrokerClient<S> {
    /// Create a client and verify the store is reachable.
    ///
    /// An unreachable broker at startup is fatal; the error is returned to
    /// the embedding process, which is expected to exit.
    pub async fn connect(store: Arc<S>, config: QueueConfig) -> Result<Self> {
        store.ping().await?;
        info!(broker_address = %config.broker_address, "connected to broker");
        Ok(Self::new(store, config))
    }

    /// Create a client without a connectivity check.
    pub fn new(store: Arc<S>, config: QueueConfig) -> Self {
        Self {
            store,
            config,
            metrics: Arc::new(QueueMetrics::new()),
        }
    }

    /// Share an externally created metrics handle.
    pub fn with_metrics(mut self, metrics: Arc<QueueMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Metrics handle shared with the other components.
    pub fn metrics(&self) -> &Arc<QueueMetrics> {
        &self.metrics
    }

    /// The configuration this client runs with.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// The underlying store, for components that need their own leases.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    // ------------------------------------------------------------------
    // Job operations
    // ------------------------------------------------------------------

    /// Submit a job.
    ///
    /// Jobs scheduled for the future go to the delayed set; everything else
    /// becomes immediately dequeueable on its priority lane.
    pub async fn submit(&self, job: Job) -> Result<JobId> {
        if job.job_type.is_empty() {
            return Err(QueueError::BadRequest {
                reason: "job type must not be empty".to_string(),
            });
        }

        if let Some(fire_at) = job.scheduled_at {
            if fire_at > Utc::now() {
                return self.submit_delayed(job, fire_at).await;
            }
        }

        let id = job.id.clone();
        self.write_record(&job).await?;
        self.store
            .push_left(&keys::lane(job.priority), job.to_json()?)
            .await?;
        self.publish_job_event(&job).await;
        self.metrics.job_submitted();

        info!(
            job_id = %id,
            job_type = %job.job_type,
            priority = ?job.priority,
            "job submitted"
        );
        Ok(id)
    }

    /// Submit a job that becomes dequeueable at `fire_at`.
    pub async fn submit_delayed(&self, mut job: Job, fire_at: DateTime<Utc>) -> Result<JobId> {
        if job.job_type.is_empty() {
            return Err(QueueError::BadRequest {
                reason: "job type must not be empty".to_string(),
            });
        }

        job.scheduled_at = Some(fire_at);
        let id = job.id.clone();
        self.schedule_delayed(&job, fire_at).await?;
        self.publish_job_event(&job).await;
        self.metrics.job_submitted();

        info!(job_id = %id, fire_at = %fire_at, "job scheduled");
        Ok(id)
    }

    /// Write the status record and add the job to the delayed set.
    async fn schedule_delayed(&self, job: &Job, fire_at: DateTime<Utc>) -> Result<()> {
        self.write_record(job).await?;
        self.store
            .zadd(keys::DELAYED_SET, fire_at.timestamp(), job.to_json()?)
            .await?;
        Ok(())
    }

    /// Block up to `timeout` for the next job.
    ///
    /// Lanes are drained in strict priority order: retry first, then high,
    /// normal, low. The returned job has been stamped `running`; jobs whose
    /// status record says `cancelled` are dropped without being returned.
    pub async fn dequeue(&self, timeout: Duration) -> Result<Option<(Job, Lane)>> {
        let wait_list: Vec<String> = std::iter::once(keys::RETRY_QUEUE.to_string())
            .chain(Priority::all_ordered().iter().map(|p| keys::lane(*p)))
            .collect();
        let deadline = Instant::now() + timeout;

        loop {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Ok(None);
            };
            let Some((source_key, raw)) =
                self.store.pop_right_blocking(&wait_list, remaining).await?
            else {
                return Ok(None);
            };

            let mut job = match Job::from_json(&raw) {
                Ok(job) => job,
                Err(err) => {
                    warn!(error = %err, lane = %source_key, "dropping undecodable lane entry");
                    continue;
                }
            };

            // The status record may have moved on while the job sat in the
            // lane; cancellation wins over the lane copy.
            if let Some(stored) = self.get_job(&job.id).await? {
                if stored.status == JobStatus::Cancelled {
                    debug!(job_id = %job.id, "dropping cancelled job at dequeue");
                    continue;
                }
            }

            let lane = Lane::from_key(&source_key).unwrap_or(Lane::Priority(job.priority));
            job.mark_running();
            self.write_record(&job).await?;
            self.publish_job_event(&job).await;

            debug!(job_id = %job.id, lane = %source_key, "job dequeued");
            return Ok(Some((job, lane)));
        }
    }

    /// Record a successful handler run.
    pub async fn mark_completed(&self, job: &mut Job, result: JsonMap) -> Result<()> {
        job.mark_completed(result);
        self.write_record(job).await?;
        self.publish_job_event(job).await;
        self.metrics.job_completed();

        info!(job_id = %job.id, job_type = %job.job_type, "job completed");
        Ok(())
    }

    /// Record a failed attempt and re-enqueue the job.
    ///
    /// A positive `delay` parks the job in the delayed set until the backoff
    /// elapses; a zero delay pushes it straight onto the retry lane.
    pub async fn move_to_retry(
        &self,
        job: &mut Job,
        error: &HandlerError,
        delay: Duration,
    ) -> Result<()> {
        job.mark_retrying(&error.message, delay);

        if delay.is_zero() {
            job.scheduled_at = None;
            self.write_record(job).await?;
            self.store
                .push_left(keys::RETRY_QUEUE, job.to_json()?)
                .await?;
        } else {
            let fire_at = job.scheduled_at.unwrap_or_else(Utc::now);
            self.schedule_delayed(job, fire_at).await?;
        }
        self.publish_job_event(job).await;
        self.metrics.job_retried();

        info!(
            job_id = %job.id,
            attempts = job.attempts,
            delay_secs = delay.as_secs(),
            error = %error.message,
            "job scheduled for retry"
        );
        Ok(())
    }

    /// Move a job whose budget is exhausted onto the dead-letter list.
    pub async fn move_to_dead_letter(&self, job: &mut Job, error: &str) -> Result<()> {
        job.mark_failed(error);
        self.store
            .push_left(keys::DEAD_LETTER_QUEUE, job.to_json()?)
            .await?;
        self.write_record(job).await?;
        self.publish_job_event(job).await;
        self.metrics.job_dead_lettered();

        warn!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempts = job.attempts,
            error,
            "job moved to dead-letter queue"
        );
        Ok(())
    }

    /// Cancel a job that has not started executing.
    ///
    /// Only `pending` jobs (queued or delayed) can be cancelled; anything
    /// else is an invalid transition.
    pub async fn cancel(&self, id: &JobId) -> Result<()> {
        let mut job = self
            .get_job(id)
            .await?
            .ok_or_else(|| QueueError::JobNotFound { id: id.to_string() })?;

        if job.status != JobStatus::Pending {
            return Err(QueueError::InvalidTransition {
                status: job.status,
                operation: "cancel".to_string(),
            });
        }

        job.mark_cancelled();
        self.write_record(&job).await?;
        self.publish_job_event(&job).await;
        self.metrics.job_cancelled();

        info!(job_id = %id, "job cancelled");
        Ok(())
    }

    /// Read a job's authoritative record.
    pub async fn get_job(&self, id: &JobId) -> Result<Option<Job>> {
        let Some(raw) = self.store.get(&keys::job_record(id)).await? else {
            return Ok(None);
        };
        Ok(Some(Job::from_json(&raw)?))
    }

    /// Current depth of every lane.
    pub async fn stats(&self) -> Result<QueueDepths> {
        Ok(QueueDepths {
            high: self.store.list_len(&keys::lane(Priority::High)).await?,
            normal: self.store.list_len(&keys::lane(Priority::Normal)).await?,
            low: self.store.list_len(&keys::lane(Priority::Low)).await?,
            retry: self.store.list_len(keys::RETRY_QUEUE).await?,
            delayed: self.store.zcard(keys::DELAYED_SET).await?,
            dead_letter: self.store.list_len(keys::DEAD_LETTER_QUEUE).await?,
            workflows_queued: self.store.list_len(keys::WORKFLOW_QUEUE).await?,
        })
    }

    /// Most recent entries on the dead-letter list, newest first.
    pub async fn dead_letters(&self, limit: u64) -> Result<Vec<Job>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let raw = self
            .store
            .list_range(keys::DEAD_LETTER_QUEUE, 0, limit as i64 - 1)
            .await?;
        Ok(raw
            .iter()
            .filter_map(|entry| Job::from_json(entry).ok())
            .collect())
    }

    /// Acquire the per-job advisory lease.
    pub async fn try_lock(&self, id: &JobId, holder: &str, ttl: Duration) -> Result<bool> {
        Ok(self
            .store
            .put_if_absent(&keys::job_lock(id), holder.to_string(), ttl)
            .await?)
    }

    /// Release the per-job advisory lease if `holder` still owns it.
    pub async fn unlock(&self, id: &JobId, holder: &str) -> Result<()> {
        self.store
            .delete_if_equals(&keys::job_lock(id), holder)
            .await?;
        Ok(())
    }

    /// Promote every delayed job due at or before `now`.
    ///
    /// Cancelled jobs are discarded; retries go to the retry lane (they were
    /// once selected and get first claim on the next slot), fresh jobs to
    /// their priority lane. Enqueue happens before removal so a crash
    /// between the two at worst duplicates delivery, which the per-job lock
    /// absorbs.
    pub async fn promote_due(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = self
            .store
            .zrange_by_score(keys::DELAYED_SET, now.timestamp())
            .await?;
        let mut promoted = 0usize;

        for member in due {
            let mut job = match Job::from_json(&member) {
                Ok(job) => job,
                Err(err) => {
                    warn!(error = %err, "dropping undecodable delayed entry");
                    self.store.zrem(keys::DELAYED_SET, &member).await?;
                    continue;
                }
            };

            let stored_status = self.get_job(&job.id).await?.map(|j| j.status);
            if stored_status == Some(JobStatus::Cancelled) {
                self.store.zrem(keys::DELAYED_SET, &member).await?;
                debug!(job_id = %job.id, "discarding cancelled delayed job");
                continue;
            }

            let lane_key = if job.status == JobStatus::Retrying {
                keys::RETRY_QUEUE.to_string()
            } else {
                keys::lane(job.priority)
            };
            job.mark_promoted();

            self.write_record(&job).await?;
            self.store.push_left(&lane_key, job.to_json()?).await?;
            self.store.zrem(keys::DELAYED_SET, &member).await?;
            self.publish_job_event(&job).await;
            promoted += 1;

            debug!(job_id = %job.id, lane = %lane_key, "delayed job promoted");
        }

        if promoted > 0 {
            self.metrics.jobs_promoted(promoted as u64);
        }
        Ok(promoted)
    }

    // ------------------------------------------------------------------
    // Workflow records
    // ------------------------------------------------------------------

    /// Persist a workflow record (full body plus a status-only key).
    ///
    /// A workflow saved in `pending` status is queued for the scheduler.
    pub async fn save_workflow(&self, workflow: &Workflow) -> Result<()> {
        let raw = serde_json::to_string(workflow)?;
        let ttl = Some(self.config.workflow_ttl);
        self.store
            .put(&keys::workflow_record(&workflow.id), raw, ttl)
            .await?;
        self.store
            .put(
                &keys::workflow_status(&workflow.id),
                workflow.status.to_string(),
                ttl,
            )
            .await?;
        if workflow.status == WorkflowStatus::Pending {
            self.store
                .push_left(keys::WORKFLOW_QUEUE, workflow.id.clone())
                .await?;
        }
        Ok(())
    }

    /// Read a workflow record.
    pub async fn load_workflow(&self, id: &str) -> Result<Option<Workflow>> {
        let Some(raw) = self.store.get(&keys::workflow_record(id)).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(&raw)?))
    }

    /// Pop the next workflow id awaiting a scheduler pass.
    pub async fn next_workflow_id(&self) -> Result<Option<String>> {
        Ok(self.store.pop_right(keys::WORKFLOW_QUEUE).await?)
    }

    /// Queue a workflow id for another scheduler pass.
    pub async fn requeue_workflow(&self, id: &str) -> Result<()> {
        self.store
            .push_left(keys::WORKFLOW_QUEUE, id.to_string())
            .await?;
        Ok(())
    }

    /// Persist one step's result.
    pub async fn save_step_result(
        &self,
        workflow_id: &str,
        step_id: &str,
        result: &JsonMap,
    ) -> Result<()> {
        self.store
            .put(
                &keys::step_result(workflow_id, step_id),
                serde_json::to_string(result)?,
                Some(self.config.workflow_ttl),
            )
            .await?;
        Ok(())
    }

    /// Read one step's persisted result.
    pub async fn load_step_result(
        &self,
        workflow_id: &str,
        step_id: &str,
    ) -> Result<Option<JsonMap>> {
        let Some(raw) = self
            .store
            .get(&keys::step_result(workflow_id, step_id))
            .await?
        else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(&raw)?))
    }

    /// Keys of all stored workflow records.
    pub async fn workflow_record_keys(&self) -> Result<Vec<String>> {
        Ok(self.store.scan_prefix(keys::WORKFLOW_RECORD_PREFIX).await?)
    }

    /// Delete a workflow record, its status key, and its step results.
    pub async fn delete_workflow_records(&self, workflow: &Workflow) -> Result<()> {
        self.store
            .delete(&keys::workflow_record(&workflow.id))
            .await?;
        self.store
            .delete(&keys::workflow_status(&workflow.id))
            .await?;
        for step_id in workflow.steps.keys() {
            self.store
                .delete(&keys::step_result(&workflow.id, step_id))
                .await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Subscribe to job status transitions.
    pub async fn subscribe_job_updates(&self) -> Result<EventStream> {
        let rx = self.store.subscribe(keys::JOB_UPDATES_CHANNEL).await?;
        Ok(EventStream::new(rx))
    }

    /// Subscribe to workflow transitions.
    pub async fn subscribe_workflow_updates(&self) -> Result<EventStream> {
        let rx = self.store.subscribe(keys::WORKFLOW_UPDATES_CHANNEL).await?;
        Ok(EventStream::new(rx))
    }

    /// Publish a workflow event; losses are tolerated.
    pub(crate) async fn publish_workflow_event(&self, event: &QueueEvent) {
        let Ok(payload) = serde_json::to_string(event) else {
            return;
        };
        if let Err(err) = self
            .store
            .publish(keys::WORKFLOW_UPDATES_CHANNEL, payload)
            .await
        {
            debug!(error = %err, "failed to publish workflow event");
        }
    }

    // ------------------------------------------------------------------
    // Internal helpers
    // ------------------------------------------------------------------

    /// Rewrite the authoritative status record.
    async fn write_record(&self, job: &Job) -> Result<()> {
        self.store
            .put(
                &keys::job_record(&job.id),
                job.to_json()?,
                Some(self.config.status_ttl),
            )
            .await?;
        Ok(())
    }

    /// Publish a job event; losses are tolerated.
    async fn publish_job_event(&self, job: &Job) {
        let event = QueueEvent::job_update(job.id.to_string(), job.status.to_string());
        let Ok(payload) = serde_json::to_string(&event) else {
            return;
        };
        if let Err(err) = self.store.publish(keys::JOB_UPDATES_CHANNEL, payload).await {
            debug!(job_id = %job.id, error = %err, "failed to publish job event");
        }
    }
}
