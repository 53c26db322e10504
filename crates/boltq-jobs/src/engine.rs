//! Workflow engine: schedules dependent steps as their dependencies
//! complete and finalizes workflow status.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use boltq_store::BrokerStore;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::BrokerClient;
use crate::error::{QueueError, Result};
use crate::events::QueueEvent;
use crate::job::{Job, JsonMap};
use crate::keys;
use crate::lock::LeaseLock;
use crate::workflow::{StepInput, Workflow, WorkflowSummary};

/// Lease duration for the per-workflow update lock.
const WORKFLOW_LOCK_TTL: Duration = Duration::from_secs(10);

/// How many times a workflow update retries acquiring the lock.
const WORKFLOW_LOCK_ATTEMPTS: u32 = 100;

/// Pause between workflow lock attempts.
const WORKFLOW_LOCK_RETRY: Duration = Duration::from_millis(100);

/// Scheduler for workflows.
///
/// The periodic loop pops one workflow id per tick, emits jobs for every
/// step whose dependencies are satisfied, and finalizes workflows whose
/// steps have all settled. Step outcomes are reported back by the worker
/// pool through [`WorkflowEngine::on_job_settled`]. Multiple scheduler
/// instances coordinate through the `lock:workflow_scheduler` lease;
/// individual workflow records are additionally serialized by a
/// `lock:workflow:{id}` lease because completion hooks run on workers
/// concurrently with the scheduler.
pub struct WorkflowEngine<S: BrokerStore + ?Sized> {
    broker: Arc<BrokerClient<S>>,
    scheduler_lock: Arc<LeaseLock<S>>,
    instance_id: String,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<S: BrokerStore + ?Sized + 'static> WorkflowEngine<S> {
    /// Create an engine on top of a broker client.
    pub fn new(broker: Arc<BrokerClient<S>>) -> Self {
        let instance_id = format!("workflow-engine-{}", Uuid::new_v4());
        let scheduler_lock = Arc::new(LeaseLock::new(
            broker.store().clone(),
            keys::SCHEDULER_LOCK,
            instance_id.clone(),
            broker.config().lock_ttl,
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            broker,
            scheduler_lock,
            instance_id,
            shutdown_tx,
            shutdown_rx,
            handle: Mutex::new(None),
        }
    }

    // ------------------------------------------------------------------
    // Submission and query facade
    // ------------------------------------------------------------------

    /// Validate and persist a new workflow; it is queued for scheduling.
    ///
    /// Steps may carry client-chosen IDs so later steps can depend on them;
    /// duplicate IDs, dangling dependencies, and cycles are rejected.
    pub async fn submit_workflow(
        &self,
        name: &str,
        steps: Vec<StepInput>,
        metadata: Option<JsonMap>,
    ) -> Result<String> {
        let mut workflow = Workflow::new(name);
        if let Some(metadata) = metadata {
            workflow = workflow.with_metadata(metadata);
        }

        let mut seen = HashSet::new();
        for input in steps {
            let step_id = input.id.unwrap_or_else(|| Uuid::new_v4().to_string());
            if !seen.insert(step_id.clone()) {
                return Err(QueueError::BadRequest {
                    reason: format!("duplicate step id: {step_id}"),
                });
            }
            workflow.add_step_with_id(step_id, input.job_type, input.params, input.depends_on);
        }
        workflow.validate()?;

        self.broker.save_workflow(&workflow).await?;
        self.broker
            .publish_workflow_event(&QueueEvent::workflow_update(
                workflow.id.clone(),
                workflow.status.to_string(),
            ))
            .await;

        info!(
            workflow_id = %workflow.id,
            name = %workflow.name,
            steps = workflow.steps.len(),
            "workflow submitted"
        );
        Ok(workflow.id)
    }

    /// Read a workflow record.
    pub async fn get_workflow(&self, id: &str) -> Result<Workflow> {
        self.broker
            .load_workflow(id)
            .await?
            .ok_or_else(|| QueueError::WorkflowNotFound { id: id.to_string() })
    }

    /// List stored workflows, most recently keyed first by record key order.
    pub async fn list_workflows(&self, limit: usize, offset: usize) -> Result<Vec<WorkflowSummary>> {
        let record_keys = self.broker.workflow_record_keys().await?;
        let mut summaries = Vec::new();
        for key in record_keys.iter().skip(offset).take(limit) {
            let id = key.trim_start_matches(keys::WORKFLOW_RECORD_PREFIX);
            match self.broker.load_workflow(id).await {
                Ok(Some(workflow)) => summaries.push(workflow.summary()),
                Ok(None) => {}
                Err(err) => {
                    warn!(workflow_id = %id, error = %err, "skipping unreadable workflow");
                }
            }
        }
        Ok(summaries)
    }

    /// Delete a workflow record, its status key, and its step results.
    pub async fn delete_workflow(&self, id: &str) -> Result<()> {
        let workflow = self.get_workflow(id).await?;
        self.broker.delete_workflow_records(&workflow).await?;
        info!(workflow_id = %id, "workflow deleted");
        Ok(())
    }

    /// Read one step's persisted result.
    pub async fn get_step_result(
        &self,
        workflow_id: &str,
        step_id: &str,
    ) -> Result<Option<JsonMap>> {
        self.broker.load_step_result(workflow_id, step_id).await
    }

    // ------------------------------------------------------------------
    // Scheduler loop
    // ------------------------------------------------------------------

    /// Spawn the periodic scheduler task.
    pub async fn start(self: &Arc<Self>) {
        let engine = self.clone();
        let tick_interval = self.broker.config().workflow_tick;
        let mut shutdown = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = engine.tick().await {
                            error!(error = %err, "workflow scheduler tick failed");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
        *self.handle.lock().await = Some(handle);
        info!(tick_secs = tick_interval.as_secs(), "workflow scheduler started");
    }

    /// Stop the periodic scheduler task.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
        info!("workflow scheduler stopped");
    }

    /// One guarded scheduler pass, coordinated with other instances.
    async fn tick(&self) -> Result<()> {
        if !self.scheduler_lock.try_acquire().await? {
            debug!("another scheduler holds the lease, skipping tick");
            return Ok(());
        }
        let outcome = self.run_once().await;
        let _ = self.scheduler_lock.release().await;
        outcome.map(|_| ())
    }

    /// Process at most one queued workflow. Returns whether one was found.
    pub async fn run_once(&self) -> Result<bool> {
        let Some(id) = self.broker.next_workflow_id().await? else {
            return Ok(false);
        };
        self.process_workflow(&id).await?;
        Ok(true)
    }

    /// Emit jobs for ready steps or finalize the workflow.
    async fn process_workflow(&self, id: &str) -> Result<()> {
        let guard = self.workflow_guard(id).await?;
        let outcome = self.process_workflow_locked(id).await;
        let _ = guard.release().await;
        outcome
    }

    async fn process_workflow_locked(&self, id: &str) -> Result<()> {
        let Some(mut workflow) = self.broker.load_workflow(id).await? else {
            warn!(workflow_id = %id, "queued workflow record is missing");
            return Ok(());
        };

        let ready = workflow.ready_steps();
        if ready.is_empty() {
            if workflow.finalize() {
                self.broker.save_workflow(&workflow).await?;
                self.broker
                    .publish_workflow_event(&QueueEvent::workflow_update(
                        workflow.id.clone(),
                        workflow.status.to_string(),
                    ))
                    .await;
                info!(
                    workflow_id = %id,
                    status = %workflow.status,
                    "workflow finalized"
                );
            } else if workflow.has_running_steps() {
                // Still awaiting in-flight steps; come back later.
                self.broker.requeue_workflow(id).await?;
            }
            return Ok(());
        }

        for step_id in ready {
            let Some(step) = workflow.steps.get(&step_id) else {
                continue;
            };
            let job = Job::new(step.job_type.clone(), step.params.clone())
                .for_workflow_step(workflow.id.clone(), step_id.clone());
            let job_id = self.broker.submit(job).await?;
            workflow.start_step(&step_id, job_id.clone());

            debug!(
                workflow_id = %id,
                step_id = %step_id,
                job_id = %job_id,
                "workflow step scheduled"
            );
        }

        self.broker.save_workflow(&workflow).await?;
        self.broker
            .publish_workflow_event(&QueueEvent::workflow_update(
                workflow.id.clone(),
                workflow.status.to_string(),
            ))
            .await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Step completion
    // ------------------------------------------------------------------

    /// Record the outcome of a settled workflow-step job.
    ///
    /// Invoked inline by the worker pool after `mark_completed` or a
    /// dead-letter move. On failure every transitive dependent is skipped
    /// and the workflow fails; on success the workflow id is re-queued so
    /// the scheduler can release newly-ready steps.
    pub async fn on_job_settled(
        &self,
        job: &Job,
        outcome: std::result::Result<&JsonMap, &str>,
    ) -> Result<()> {
        let (Some(workflow_id), Some(step_id)) = (&job.workflow_id, &job.workflow_step_id) else {
            return Ok(());
        };

        let guard = self.workflow_guard(workflow_id).await?;
        let result = self
            .record_step_outcome(workflow_id, step_id, outcome)
            .await;
        let _ = guard.release().await;
        result
    }

    async fn record_step_outcome(
        &self,
        workflow_id: &str,
        step_id: &str,
        outcome: std::result::Result<&JsonMap, &str>,
    ) -> Result<()> {
        let Some(mut workflow) = self.broker.load_workflow(workflow_id).await? else {
            warn!(
                workflow_id = %workflow_id,
                step_id = %step_id,
                "step settled for a missing workflow"
            );
            return Ok(());
        };

        match outcome {
            Ok(result) => {
                self.broker
                    .save_step_result(workflow_id, step_id, result)
                    .await?;
                workflow.complete_step(step_id, result.clone());
                self.broker.save_workflow(&workflow).await?;
                self.publish_step_event(&workflow, step_id, "completed").await;

                if workflow.status.is_terminal() {
                    info!(
                        workflow_id = %workflow_id,
                        status = %workflow.status,
                        "workflow finalized"
                    );
                } else {
                    // Dependents of this step may have become ready.
                    self.broker.requeue_workflow(workflow_id).await?;
                }
            }
            Err(message) => {
                workflow.fail_step(step_id, message);
                self.broker.save_workflow(&workflow).await?;
                self.publish_step_event(&workflow, step_id, "failed").await;
                info!(
                    workflow_id = %workflow_id,
                    step_id = %step_id,
                    error = message,
                    "workflow failed"
                );
            }
        }
        Ok(())
    }

    async fn publish_step_event(&self, workflow: &Workflow, step_id: &str, step_status: &str) {
        let event = QueueEvent::workflow_update(
            workflow.id.clone(),
            workflow.status.to_string(),
        )
        .with_data(serde_json::json!({
            "step_id": step_id,
            "step_status": step_status,
        }));
        self.broker.publish_workflow_event(&event).await;
    }

    /// Acquire the per-workflow update lease, retrying briefly.
    ///
    /// Each guard gets its own holder identity so a slow critical section
    /// whose lease expired cannot release a successor's lease.
    async fn workflow_guard(&self, workflow_id: &str) -> Result<LeaseLock<S>> {
        let lock = LeaseLock::new(
            self.broker.store().clone(),
            keys::workflow_lock(workflow_id),
            format!("{}-{}", self.instance_id, Uuid::new_v4()),
            WORKFLOW_LOCK_TTL,
        );
        for _ in 0..WORKFLOW_LOCK_ATTEMPTS {
            if lock.try_acquire().await? {
                return Ok(lock);
            }
            tokio::time::sleep(WORKFLOW_LOCK_RETRY).await;
        }
        Err(QueueError::LockContended {
            key: lock.key().to_string(),
        })
    }
}
