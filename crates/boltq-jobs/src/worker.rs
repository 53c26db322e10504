//! Worker pool: N concurrent loops that dequeue jobs and run registered
//! handlers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use boltq_store::BrokerStore;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::broker::BrokerClient;
use crate::classify::{decide, HandlerError, RetryDecision};
use crate::engine::WorkflowEngine;
use crate::error::Result;
use crate::job::{Job, JobStatus, JsonMap};

/// How long a worker backs off after a broker error before polling again.
const BROKER_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Handler bound to a job type.
///
/// Handlers run under a deadline equal to the job's timeout; when it
/// expires the future is dropped and the attempt is classified as
/// transient. Delivery is at-least-once, so handlers must be idempotent.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Execute the job, returning a result mapping or an error.
    async fn execute(&self, job: Job) -> std::result::Result<JsonMap, HandlerError>;
}

/// Builder collecting handlers before the pool starts.
///
/// The registry is frozen when `build` is called; there is no runtime
/// registration.
pub struct WorkerPoolBuilder<S: BrokerStore + ?Sized> {
    broker: Arc<BrokerClient<S>>,
    handlers: HashMap<String, Arc<dyn Handler>>,
    engine: Option<Arc<WorkflowEngine<S>>>,
}

impl<S: BrokerStore + ?Sized + 'static> WorkerPoolBuilder<S> {
    /// Register a handler for `job_type`.
    pub fn register<T: Into<String>, H: Handler>(mut self, job_type: T, handler: H) -> Self {
        let job_type = job_type.into();
        info!(job_type = %job_type, "registered handler");
        self.handlers.insert(job_type, Arc::new(handler));
        self
    }

    /// Attach the workflow engine so step jobs report their outcome.
    pub fn workflow_engine(mut self, engine: Arc<WorkflowEngine<S>>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Freeze the registry and produce the pool.
    pub fn build(self) -> WorkerPool<S> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        WorkerPool {
            broker: self.broker,
            handlers: Arc::new(self.handlers),
            engine: self.engine,
            shutdown_tx,
            shutdown_rx,
            handles: Mutex::new(Vec::new()),
        }
    }
}

/// Fixed-size pool of worker loops.
pub struct WorkerPool<S: BrokerStore + ?Sized> {
    broker: Arc<BrokerClient<S>>,
    handlers: Arc<HashMap<String, Arc<dyn Handler>>>,
    engine: Option<Arc<WorkflowEngine<S>>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: BrokerStore + ?Sized + 'static> WorkerPool<S> {
    /// Start building a pool on top of a broker client.
    pub fn builder(broker: Arc<BrokerClient<S>>) -> WorkerPoolBuilder<S> {
        WorkerPoolBuilder {
            broker,
            handlers: HashMap::new(),
            engine: None,
        }
    }

    /// Spawn `num_workers` worker loops.
    pub async fn start(&self, num_workers: usize) {
        let num_workers = num_workers.max(1);
        let mut handles = self.handles.lock().await;
        for i in 0..num_workers {
            let worker = WorkerLoop {
                worker_id: format!("worker-{i}"),
                broker: self.broker.clone(),
                handlers: self.handlers.clone(),
                engine: self.engine.clone(),
                shutdown: self.shutdown_rx.clone(),
            };
            handles.push(tokio::spawn(worker.run()));
        }
        info!(num_workers, "worker pool started");
    }

    /// Shut down using the configured deadline.
    pub async fn shutdown_default(&self) {
        let deadline = self.broker.config().shutdown_timeout;
        self.shutdown(deadline).await;
    }

    /// Signal every loop to stop and wait up to the shutdown deadline.
    ///
    /// Loops finish their current job when they can; handlers still running
    /// at the deadline are dropped and their jobs stay `running` in the
    /// status record until the job lock expires and another worker retries
    /// them.
    pub async fn shutdown(&self, deadline: Duration) {
        info!("shutting down worker pool");
        let _ = self.shutdown_tx.send(true);

        let mut handles = self.handles.lock().await;
        let stop_at = Instant::now() + deadline;
        for mut handle in handles.drain(..) {
            let remaining = stop_at.saturating_duration_since(Instant::now());
            if timeout(remaining, &mut handle).await.is_err() {
                warn!("worker exceeded shutdown deadline; abandoning in-flight job");
                handle.abort();
            }
        }
        info!("worker pool shutdown complete");
    }

    /// Number of workers currently executing a handler.
    pub fn active_workers(&self) -> i64 {
        self.broker.metrics().active_workers()
    }
}

/// State owned by a single worker loop.
struct WorkerLoop<S: BrokerStore + ?Sized> {
    worker_id: String,
    broker: Arc<BrokerClient<S>>,
    handlers: Arc<HashMap<String, Arc<dyn Handler>>>,
    engine: Option<Arc<WorkflowEngine<S>>>,
    shutdown: watch::Receiver<bool>,
}

impl<S: BrokerStore + ?Sized + 'static> WorkerLoop<S> {
    async fn run(mut self) {
        info!(worker_id = %self.worker_id, "worker started");
        let dequeue_timeout = self.broker.config().dequeue_timeout;

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let dequeued = tokio::select! {
                result = self.broker.dequeue(dequeue_timeout) => result,
                _ = self.shutdown.changed() => break,
            };

            let job = match dequeued {
                Ok(Some((job, _lane))) => job,
                Ok(None) => continue,
                Err(err) => {
                    // The job (if any) is still on its lane and will be
                    // redelivered; keep the loop alive.
                    error!(worker_id = %self.worker_id, error = %err, "dequeue failed");
                    tokio::time::sleep(BROKER_ERROR_BACKOFF).await;
                    continue;
                }
            };

            if let Err(err) = self.process(job).await {
                error!(worker_id = %self.worker_id, error = %err, "job processing error");
            }
        }

        info!(worker_id = %self.worker_id, "worker stopped");
    }

    async fn process(&self, mut job: Job) -> Result<()> {
        let config = self.broker.config();
        let job_timeout = if job.timeout > 0 {
            job.timeout_duration()
        } else {
            config.default_job_timeout
        };

        let Some(handler) = self.handlers.get(&job.job_type).cloned() else {
            // An unroutable job cannot succeed on retry either.
            warn!(
                worker_id = %self.worker_id,
                job_id = %job.id,
                job_type = %job.job_type,
                "no handler registered for job type"
            );
            let message = format!("no handler registered for job type: {}", job.job_type);
            self.broker.move_to_dead_letter(&mut job, &message).await?;
            self.notify_engine(&job, Err(message.as_str())).await;
            return Ok(());
        };

        // Lease the job so a duplicate delivery on another worker is a no-op.
        let lock_ttl = job_timeout.max(config.lock_ttl);
        if !self
            .broker
            .try_lock(&job.id, &self.worker_id, lock_ttl)
            .await?
        {
            debug!(
                worker_id = %self.worker_id,
                job_id = %job.id,
                "job lock held elsewhere, skipping duplicate delivery"
            );
            return Ok(());
        }

        let outcome = self.execute_locked(&mut job, handler, job_timeout).await;
        self.broker.unlock(&job.id, &self.worker_id).await?;
        outcome
    }

    async fn execute_locked(
        &self,
        job: &mut Job,
        handler: Arc<dyn Handler>,
        job_timeout: Duration,
    ) -> Result<()> {
        // A cancel can land between dequeue and lock acquisition.
        if let Some(stored) = self.broker.get_job(&job.id).await? {
            if stored.status == JobStatus::Cancelled {
                debug!(job_id = %job.id, "dropping cancelled job before execution");
                return Ok(());
            }
        }

        let metrics = self.broker.metrics().clone();
        metrics.worker_started();
        let started = Instant::now();

        debug!(
            worker_id = %self.worker_id,
            job_id = %job.id,
            job_type = %job.job_type,
            attempts = job.attempts,
            "processing job"
        );

        let result = match timeout(job_timeout, handler.execute(job.clone())).await {
            Ok(result) => result,
            Err(_) => Err(HandlerError::transient(format!(
                "handler timed out after {}s",
                job_timeout.as_secs()
            ))),
        };

        metrics.record_latency(&job.job_type, started.elapsed());
        metrics.worker_finished();

        match result {
            Ok(output) => {
                self.broker.mark_completed(job, output.clone()).await?;
                self.notify_engine(job, Ok(&output)).await;
            }
            Err(handler_error) => {
                let (category, decision) = decide(
                    job.attempts,
                    &handler_error,
                    self.broker.config().max_attempts_default,
                );
                warn!(
                    worker_id = %self.worker_id,
                    job_id = %job.id,
                    category = %category,
                    attempts = job.attempts,
                    error = %handler_error,
                    "job failed"
                );
                match decision {
                    RetryDecision::Retry { delay } => {
                        self.broker.move_to_retry(job, &handler_error, delay).await?;
                    }
                    RetryDecision::DeadLetter => {
                        self.broker
                            .move_to_dead_letter(job, &handler_error.message)
                            .await?;
                        self.notify_engine(job, Err(handler_error.message.as_str()))
                            .await;
                    }
                }
            }
        }
        Ok(())
    }

    /// Report a settled workflow-step job to the engine.
    async fn notify_engine(&self, job: &Job, outcome: std::result::Result<&JsonMap, &str>) {
        if !job.is_workflow_step() {
            return;
        }
        let Some(engine) = &self.engine else {
            warn!(
                job_id = %job.id,
                workflow_id = ?job.workflow_id,
                "workflow step settled but no engine is attached"
            );
            return;
        };
        if let Err(err) = engine.on_job_settled(job, outcome).await {
            error!(
                job_id = %job.id,
                workflow_id = ?job.workflow_id,
                error = %err,
                "failed to record workflow step outcome"
            );
        }
    }
}
