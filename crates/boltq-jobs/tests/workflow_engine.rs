//! Integration tests for the workflow engine: scheduling, skip-on-failure,
//! finalization, and the maintenance surface.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use boltq_jobs::{
    Handler, HandlerError, Job, JsonMap, QueueError, StepInput, StepStatus, WorkerPool,
    WorkflowEngine, WorkflowStatus,
};
use boltq_store::MemoryStore;
use common::{payload, test_broker};

/// Succeeds, echoing a marker so step results are observable.
struct OkHandler;

#[async_trait]
impl Handler for OkHandler {
    async fn execute(&self, job: Job) -> Result<JsonMap, HandlerError> {
        Ok(payload(&[("done_by", job.job_type.as_str())]))
    }
}

/// Always fails with a data error.
struct FailingHandler;

#[async_trait]
impl Handler for FailingHandler {
    async fn execute(&self, _job: Job) -> Result<JsonMap, HandlerError> {
        Err(HandlerError::data("validation failed: bad step input"))
    }
}

struct Harness {
    engine: Arc<WorkflowEngine<MemoryStore>>,
    pool: WorkerPool<MemoryStore>,
}

/// Engine plus a one-worker pool wired to it.
async fn harness() -> (Arc<boltq_jobs::BrokerClient<MemoryStore>>, Harness) {
    let broker = test_broker();
    let engine = Arc::new(WorkflowEngine::new(broker.clone()));
    let pool = WorkerPool::builder(broker.clone())
        .register("ok_step", OkHandler)
        .register("failing_step", FailingHandler)
        .workflow_engine(engine.clone())
        .build();
    pool.start(1).await;
    (broker, Harness { engine, pool })
}

/// Drive scheduler passes until the workflow reaches a terminal status.
async fn drive_to_terminal(engine: &WorkflowEngine<MemoryStore>, id: &str) -> WorkflowStatus {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        engine.run_once().await.unwrap();
        let workflow = engine.get_workflow(id).await.unwrap();
        if workflow.status.is_terminal() {
            return workflow.status;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "workflow {id} did not settle in time"
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
}

#[tokio::test]
async fn linear_workflow_runs_to_completion() {
    let (_broker, h) = harness().await;

    let id = h
        .engine
        .submit_workflow(
            "pipeline",
            vec![
                StepInput::new("ok_step").with_id("extract"),
                StepInput::new("ok_step").with_id("transform").depends_on("extract"),
                StepInput::new("ok_step").with_id("load").depends_on("transform"),
            ],
            None,
        )
        .await
        .unwrap();

    let status = drive_to_terminal(&h.engine, &id).await;
    assert_eq!(status, WorkflowStatus::Completed);

    let workflow = h.engine.get_workflow(&id).await.unwrap();
    assert!(workflow.finished_at.is_some());
    for step in workflow.steps.values() {
        assert_eq!(step.status, StepStatus::Completed);
        assert!(step.job_id.is_some());
        assert_eq!(step.result.as_ref().unwrap()["done_by"], "ok_step");
    }

    // Step results are persisted separately as well.
    let result = h.engine.get_step_result(&id, "extract").await.unwrap();
    assert_eq!(result.unwrap()["done_by"], "ok_step");

    h.pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn failing_step_skips_dependents_and_fails_the_workflow() {
    let (_broker, h) = harness().await;

    // A succeeds; B fails; C succeeds; D depends on B and C.
    let id = h
        .engine
        .submit_workflow(
            "diamond",
            vec![
                StepInput::new("ok_step").with_id("a"),
                StepInput::new("failing_step").with_id("b").depends_on("a"),
                StepInput::new("ok_step").with_id("c").depends_on("a"),
                StepInput::new("ok_step")
                    .with_id("d")
                    .depends_on("b")
                    .depends_on("c"),
            ],
            None,
        )
        .await
        .unwrap();

    let status = drive_to_terminal(&h.engine, &id).await;
    assert_eq!(status, WorkflowStatus::Failed);

    // Give the in-flight sibling step (c) a moment to settle too.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let workflow = loop {
        let workflow = h.engine.get_workflow(&id).await.unwrap();
        if workflow.steps["c"].status.is_settled() {
            break workflow;
        }
        assert!(tokio::time::Instant::now() < deadline, "step c never settled");
        tokio::time::sleep(Duration::from_millis(30)).await;
    };

    assert_eq!(workflow.steps["a"].status, StepStatus::Completed);
    assert_eq!(workflow.steps["b"].status, StepStatus::Failed);
    assert_eq!(
        workflow.steps["b"].error_message.as_deref(),
        Some("validation failed: bad step input")
    );
    assert_eq!(workflow.steps["c"].status, StepStatus::Completed);
    assert_eq!(workflow.steps["d"].status, StepStatus::Skipped);
    assert_eq!(
        workflow.steps["d"].error_message.as_deref(),
        Some("skipped because dependency b failed")
    );

    h.pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn parallel_steps_run_after_shared_dependency() {
    let (broker, h) = harness().await;

    let id = h
        .engine
        .submit_workflow(
            "fanout",
            vec![
                StepInput::new("ok_step").with_id("root"),
                StepInput::new("ok_step").with_id("left").depends_on("root"),
                StepInput::new("ok_step").with_id("right").depends_on("root"),
            ],
            None,
        )
        .await
        .unwrap();

    let status = drive_to_terminal(&h.engine, &id).await;
    assert_eq!(status, WorkflowStatus::Completed);

    // Every emitted job carries its workflow linkage.
    let workflow = h.engine.get_workflow(&id).await.unwrap();
    let job_id = workflow.steps["left"].job_id.clone().unwrap();
    let job = broker.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.workflow_id.as_deref(), Some(id.as_str()));
    assert_eq!(job.workflow_step_id.as_deref(), Some("left"));

    h.pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn cyclic_workflows_are_rejected() {
    let (_broker, h) = harness().await;

    let err = h
        .engine
        .submit_workflow(
            "cyclic",
            vec![
                StepInput::new("ok_step").with_id("a").depends_on("b"),
                StepInput::new("ok_step").with_id("b").depends_on("a"),
            ],
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::BadRequest { .. }));

    // Nothing was queued for the scheduler.
    assert!(!h.engine.run_once().await.unwrap());

    h.pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn malformed_submissions_are_rejected() {
    let (_broker, h) = harness().await;

    // Empty workflow.
    assert!(matches!(
        h.engine.submit_workflow("empty", vec![], None).await,
        Err(QueueError::BadRequest { .. })
    ));

    // Duplicate step ids.
    assert!(matches!(
        h.engine
            .submit_workflow(
                "dupes",
                vec![
                    StepInput::new("ok_step").with_id("x"),
                    StepInput::new("ok_step").with_id("x"),
                ],
                None,
            )
            .await,
        Err(QueueError::BadRequest { .. })
    ));

    // Dangling dependency.
    assert!(matches!(
        h.engine
            .submit_workflow(
                "dangling",
                vec![StepInput::new("ok_step").with_id("a").depends_on("ghost")],
                None,
            )
            .await,
        Err(QueueError::BadRequest { .. })
    ));

    h.pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn workflow_query_surface() {
    let (_broker, h) = harness().await;

    assert!(matches!(
        h.engine.get_workflow("missing").await,
        Err(QueueError::WorkflowNotFound { .. })
    ));

    let mut metadata = JsonMap::new();
    metadata.insert("owner".to_string(), serde_json::json!("reports-team"));
    let id = h
        .engine
        .submit_workflow(
            "nightly",
            vec![StepInput::new("ok_step").with_id("only")],
            Some(metadata),
        )
        .await
        .unwrap();

    let listed = h.engine.list_workflows(10, 0).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, id);
    assert_eq!(listed[0].name, "nightly");
    assert_eq!(listed[0].step_count, 1);

    assert!(h.engine.list_workflows(10, 1).await.unwrap().is_empty());

    let status = drive_to_terminal(&h.engine, &id).await;
    assert_eq!(status, WorkflowStatus::Completed);

    h.engine.delete_workflow(&id).await.unwrap();
    assert!(matches!(
        h.engine.get_workflow(&id).await,
        Err(QueueError::WorkflowNotFound { .. })
    ));
    assert!(h
        .engine
        .get_step_result(&id, "only")
        .await
        .unwrap()
        .is_none());

    h.pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn workflow_events_report_progress() {
    let (broker, h) = harness().await;
    let mut events = broker.subscribe_workflow_updates().await.unwrap();

    let id = h
        .engine
        .submit_workflow(
            "observed",
            vec![StepInput::new("ok_step").with_id("only")],
            None,
        )
        .await
        .unwrap();

    let status = drive_to_terminal(&h.engine, &id).await;
    assert_eq!(status, WorkflowStatus::Completed);

    // pending (submission) then running (scheduling) then completed.
    let first = events.next().await.unwrap();
    assert_eq!(first.id, id);
    assert_eq!(first.status, "pending");

    let second = events.next().await.unwrap();
    assert_eq!(second.status, "running");

    let third = events.next().await.unwrap();
    assert_eq!(third.status, "completed");
    let data = third.data.unwrap();
    assert_eq!(data["step_id"], "only");
    assert_eq!(data["step_status"], "completed");

    h.pool.shutdown(Duration::from_secs(1)).await;
}
