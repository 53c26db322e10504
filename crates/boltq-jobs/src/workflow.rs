//! Workflow data model: a DAG of steps that become jobs as their
//! dependencies complete.
//!
//! The graph logic here is pure; persistence and scheduling live in the
//! workflow engine.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{QueueError, Result};
use crate::job::{JobId, JsonMap};

/// Status of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    /// Submitted, no step has run yet.
    Pending,
    /// At least one step has been scheduled.
    Running,
    /// Every step completed or was skipped, with at least one completed.
    Completed,
    /// At least one step failed.
    Failed,
}

impl WorkflowStatus {
    /// Lowercase wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single workflow step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Waiting for dependencies.
    Pending,
    /// A job has been emitted for this step.
    Running,
    /// The step's job completed.
    Completed,
    /// The step's job exhausted its retry budget.
    Failed,
    /// A transitive dependency failed; the step will never run.
    Skipped,
}

impl StepStatus {
    /// Whether the step can no longer change.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// One step of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Step ID, unique within the workflow.
    pub id: String,
    /// Handler selector for the job this step emits.
    pub job_type: String,
    /// Payload for the emitted job.
    #[serde(default)]
    pub params: JsonMap,
    /// Step IDs in the same workflow that must complete first.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Current status.
    pub status: StepStatus,
    /// Failure or skip explanation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Result of the step's job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonMap>,
    /// ID of the job emitted for this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    /// When the step's job was emitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the step settled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Step description supplied at submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepInput {
    /// Client-supplied step ID so later steps can reference it in
    /// `depends_on`; generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Handler selector.
    pub job_type: String,
    /// Payload for the emitted job.
    #[serde(default)]
    pub params: JsonMap,
    /// IDs of steps in the same submission that must complete first.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl StepInput {
    /// A step with no dependencies.
    pub fn new<S: Into<String>>(job_type: S) -> Self {
        Self {
            id: None,
            job_type: job_type.into(),
            params: JsonMap::new(),
            depends_on: Vec::new(),
        }
    }

    /// Set the client-supplied step ID.
    pub fn with_id<S: Into<String>>(mut self, id: S) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the job payload.
    pub fn with_params(mut self, params: JsonMap) -> Self {
        self.params = params;
        self
    }

    /// Add a dependency on another step's ID.
    pub fn depends_on<S: Into<String>>(mut self, step_id: S) -> Self {
        self.depends_on.push(step_id.into());
        self
    }
}

/// A DAG of steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Unique workflow ID.
    pub id: String,
    /// Operator-facing name.
    pub name: String,
    /// Current status.
    pub status: WorkflowStatus,
    /// Steps keyed by step ID.
    pub steps: HashMap<String, WorkflowStep>,
    /// Insertion order of steps; the scheduling tie-break.
    pub step_order: Vec<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When the first step was scheduled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the workflow reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Opaque metadata.
    #[serde(default)]
    pub metadata: JsonMap,
}

/// Condensed listing entry.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowSummary {
    /// Workflow ID.
    pub id: String,
    /// Operator-facing name.
    pub name: String,
    /// Current status.
    pub status: WorkflowStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When the first step was scheduled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the workflow reached a terminal status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Number of steps.
    pub step_count: usize,
}

impl Workflow {
    /// Create an empty pending workflow.
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            status: WorkflowStatus::Pending,
            steps: HashMap::new(),
            step_order: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            metadata: JsonMap::new(),
        }
    }

    /// Attach opaque metadata.
    pub fn with_metadata(mut self, metadata: JsonMap) -> Self {
        self.metadata = metadata;
        self
    }

    /// Add a step and return its generated ID.
    pub fn add_step<S: Into<String>>(
        &mut self,
        job_type: S,
        params: JsonMap,
        depends_on: Vec<String>,
    ) -> String {
        self.add_step_with_id(Uuid::new_v4().to_string(), job_type, params, depends_on)
    }

    /// Add a step under a caller-chosen ID.
    pub fn add_step_with_id<S: Into<String>>(
        &mut self,
        step_id: String,
        job_type: S,
        params: JsonMap,
        depends_on: Vec<String>,
    ) -> String {
        self.steps.insert(
            step_id.clone(),
            WorkflowStep {
                id: step_id.clone(),
                job_type: job_type.into(),
                params,
                depends_on,
                status: StepStatus::Pending,
                error_message: None,
                result: None,
                job_id: None,
                started_at: None,
                completed_at: None,
            },
        );
        self.step_order.push(step_id.clone());
        step_id
    }

    /// Condensed listing entry for this workflow.
    pub fn summary(&self) -> WorkflowSummary {
        WorkflowSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            status: self.status,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            step_count: self.steps.len(),
        }
    }

    /// Reject empty workflows, dangling dependencies, and cycles.
    ///
    /// Cycle detection is a topological sort over the dependency graph; if
    /// some step can never be released, the graph is cyclic.
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(QueueError::BadRequest {
                reason: "workflow has no steps".to_string(),
            });
        }

        for step in self.steps.values() {
            for dep in &step.depends_on {
                if !self.steps.contains_key(dep) {
                    return Err(QueueError::BadRequest {
                        reason: format!("step {} depends on unknown step {dep}", step.id),
                    });
                }
                if dep == &step.id {
                    return Err(QueueError::BadRequest {
                        reason: format!("step {} depends on itself", step.id),
                    });
                }
            }
        }

        let mut remaining: HashMap<&str, usize> = self
            .steps
            .values()
            .map(|s| (s.id.as_str(), s.depends_on.len()))
            .collect();
        let mut released: Vec<&str> = remaining
            .iter()
            .filter(|(_, deps)| **deps == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0usize;

        while let Some(id) = released.pop() {
            visited += 1;
            for step in self.steps.values() {
                let edges = step.depends_on.iter().filter(|d| *d == id).count();
                if edges == 0 {
                    continue;
                }
                if let Some(deps) = remaining.get_mut(step.id.as_str()) {
                    *deps = deps.saturating_sub(edges);
                    if *deps == 0 {
                        released.push(step.id.as_str());
                    }
                }
            }
        }

        if visited != self.steps.len() {
            return Err(QueueError::BadRequest {
                reason: "workflow dependency graph contains a cycle".to_string(),
            });
        }
        Ok(())
    }

    /// IDs of pending steps whose every dependency is completed, in
    /// insertion order.
    pub fn ready_steps(&self) -> Vec<String> {
        self.step_order
            .iter()
            .filter(|id| {
                let Some(step) = self.steps.get(*id) else {
                    return false;
                };
                step.status == StepStatus::Pending
                    && step.depends_on.iter().all(|dep| {
                        self.steps
                            .get(dep)
                            .is_some_and(|d| d.status == StepStatus::Completed)
                    })
            })
            .cloned()
            .collect()
    }

    /// Record that a job was emitted for `step_id`.
    ///
    /// The first scheduled step also moves the workflow to `running`.
    pub fn start_step(&mut self, step_id: &str, job_id: JobId) {
        let now = Utc::now();
        if let Some(step) = self.steps.get_mut(step_id) {
            step.status = StepStatus::Running;
            step.job_id = Some(job_id);
            step.started_at = Some(now);
        }
        if self.status == WorkflowStatus::Pending {
            self.status = WorkflowStatus::Running;
            self.started_at = Some(now);
        }
    }

    /// Record a step's successful completion; finalizes the workflow when it
    /// was the last unsettled step.
    pub fn complete_step(&mut self, step_id: &str, result: JsonMap) {
        let now = Utc::now();
        if let Some(step) = self.steps.get_mut(step_id) {
            step.status = StepStatus::Completed;
            step.result = Some(result);
            step.completed_at = Some(now);
        }
        if self.all_steps_settled() && self.status != WorkflowStatus::Failed {
            self.status = WorkflowStatus::Completed;
            self.finished_at = Some(now);
        }
    }

    /// Record a step failure: the workflow fails and every transitive
    /// dependent is skipped.
    pub fn fail_step(&mut self, step_id: &str, error: &str) {
        let now = Utc::now();
        if let Some(step) = self.steps.get_mut(step_id) {
            step.status = StepStatus::Failed;
            step.error_message = Some(error.to_string());
            step.completed_at = Some(now);
        }
        self.status = WorkflowStatus::Failed;
        self.finished_at = Some(now);
        self.skip_dependents(step_id);
    }

    /// Whether every step has settled.
    pub fn all_steps_settled(&self) -> bool {
        self.steps.values().all(|s| s.status.is_settled())
    }

    /// Whether any step is currently running.
    pub fn has_running_steps(&self) -> bool {
        self.steps.values().any(|s| s.status == StepStatus::Running)
    }

    /// Resolve a terminal status once no step can make progress.
    ///
    /// Returns `true` when the status changed.
    pub fn finalize(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        if self.steps.values().any(|s| s.status == StepStatus::Failed) {
            self.status = WorkflowStatus::Failed;
            self.finished_at = Some(Utc::now());
            return true;
        }
        let any_completed = self
            .steps
            .values()
            .any(|s| s.status == StepStatus::Completed);
        if self.all_steps_settled() && any_completed {
            self.status = WorkflowStatus::Completed;
            self.finished_at = Some(Utc::now());
            return true;
        }
        false
    }

    /// Mark every pending step that transitively depends on `failed_id` as
    /// skipped.
    fn skip_dependents(&mut self, failed_id: &str) {
        let dependents: Vec<String> = self
            .step_order
            .iter()
            .filter(|id| {
                self.steps.get(*id).is_some_and(|s| {
                    s.status == StepStatus::Pending
                        && s.depends_on.iter().any(|d| d == failed_id)
                })
            })
            .cloned()
            .collect();

        for id in dependents {
            if let Some(step) = self.steps.get_mut(&id) {
                step.status = StepStatus::Skipped;
                step.error_message =
                    Some(format!("skipped because dependency {failed_id} failed"));
            }
            self.skip_dependents(&id);
        }
    }

    /// Find the step that owns `job_id`.
    pub fn step_for_job(&self, job_id: &JobId) -> Option<&WorkflowStep> {
        self.steps
            .values()
            .find(|s| s.job_id.as_ref() == Some(job_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> JsonMap {
        JsonMap::new()
    }

    /// A --> B --> D, A --> C --> D.
    fn diamond() -> (Workflow, String, String, String, String) {
        let mut wf = Workflow::new("diamond");
        let a = wf.add_step("step_a", params(), vec![]);
        let b = wf.add_step("step_b", params(), vec![a.clone()]);
        let c = wf.add_step("step_c", params(), vec![a.clone()]);
        let d = wf.add_step("step_d", params(), vec![b.clone(), c.clone()]);
        (wf, a, b, c, d)
    }

    #[test]
    fn ready_steps_follow_dependencies() {
        let (mut wf, a, b, c, d) = diamond();
        assert_eq!(wf.ready_steps(), vec![a.clone()]);

        wf.start_step(&a, JobId::new());
        assert!(wf.ready_steps().is_empty());
        assert_eq!(wf.status, WorkflowStatus::Running);

        wf.complete_step(&a, params());
        assert_eq!(wf.ready_steps(), vec![b.clone(), c.clone()]);

        wf.start_step(&b, JobId::new());
        wf.start_step(&c, JobId::new());
        wf.complete_step(&b, params());
        assert!(wf.ready_steps().is_empty());

        wf.complete_step(&c, params());
        assert_eq!(wf.ready_steps(), vec![d]);
    }

    #[test]
    fn completing_every_step_completes_the_workflow() {
        let (mut wf, a, b, c, d) = diamond();
        for id in [&a, &b, &c, &d] {
            wf.start_step(id, JobId::new());
            wf.complete_step(id, params());
        }
        assert_eq!(wf.status, WorkflowStatus::Completed);
        assert!(wf.finished_at.is_some());
    }

    #[test]
    fn failure_skips_transitive_dependents() {
        let (mut wf, a, b, c, d) = diamond();
        wf.start_step(&a, JobId::new());
        wf.complete_step(&a, params());
        wf.start_step(&b, JobId::new());
        wf.start_step(&c, JobId::new());

        wf.fail_step(&b, "validation failed: bad input");
        wf.complete_step(&c, params());

        assert_eq!(wf.status, WorkflowStatus::Failed);
        assert_eq!(wf.steps[&a].status, StepStatus::Completed);
        assert_eq!(wf.steps[&b].status, StepStatus::Failed);
        assert_eq!(wf.steps[&c].status, StepStatus::Completed);
        assert_eq!(wf.steps[&d].status, StepStatus::Skipped);
        assert_eq!(
            wf.steps[&d].error_message.as_deref(),
            Some(format!("skipped because dependency {b} failed").as_str())
        );
    }

    #[test]
    fn skip_cascades_through_chains() {
        let mut wf = Workflow::new("chain");
        let a = wf.add_step("a", params(), vec![]);
        let b = wf.add_step("b", params(), vec![a.clone()]);
        let c = wf.add_step("c", params(), vec![b.clone()]);

        wf.start_step(&a, JobId::new());
        wf.fail_step(&a, "boom");

        assert_eq!(wf.steps[&b].status, StepStatus::Skipped);
        assert_eq!(wf.steps[&c].status, StepStatus::Skipped);
    }

    #[test]
    fn validate_rejects_cycles() {
        let mut wf = Workflow::new("cyclic");
        let a = wf.add_step("a", params(), vec![]);
        let b = wf.add_step("b", params(), vec![a.clone()]);
        // Close the loop a -> b -> a.
        wf.steps.get_mut(&a).unwrap().depends_on.push(b.clone());

        let err = wf.validate().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn validate_rejects_unknown_and_self_dependencies() {
        let mut wf = Workflow::new("dangling");
        wf.add_step("a", params(), vec!["ghost".to_string()]);
        assert!(wf.validate().is_err());

        let mut wf = Workflow::new("selfish");
        let a = wf.add_step("a", params(), vec![]);
        wf.steps.get_mut(&a).unwrap().depends_on.push(a.clone());
        assert!(wf.validate().is_err());

        let wf = Workflow::new("empty");
        assert!(wf.validate().is_err());
    }

    #[test]
    fn validate_accepts_diamond() {
        let (wf, ..) = diamond();
        wf.validate().unwrap();
    }

    #[test]
    fn serialization_round_trips() {
        let (wf, ..) = diamond();
        let raw = serde_json::to_string(&wf).unwrap();
        let back: Workflow = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.id, wf.id);
        assert_eq!(back.step_order, wf.step_order);
        assert_eq!(back.steps.len(), 4);
    }

    #[test]
    fn finalize_requires_one_completed_step() {
        let mut wf = Workflow::new("wf");
        let a = wf.add_step("a", params(), vec![]);
        assert!(!wf.finalize());

        wf.start_step(&a, JobId::new());
        wf.complete_step(&a, params());
        // complete_step already finalized it.
        assert_eq!(wf.status, WorkflowStatus::Completed);
        assert!(!wf.finalize());
    }
}
