//! DAG workflow engine.
//!
//! A workflow is a validated DAG of steps; executing it produces tasks, one
//! per step, as the steps' prerequisites complete. The engine owns each
//! execution record until it reaches a terminal state (single writer per
//! execution); it subscribes once to `results:*` and advances executions as
//! results arrive. The engine never retries a step itself; task-level retry
//! in the bridge is the single retry locus.

use chrono::Utc;
use futures::FutureExt;
use message_bus::{MessageBus, MessageHandler, SubscriptionHandle};
use orchestrator_core::{
    error::{OrchestratorError, Result},
    models::{
        ExecutionState, Message, NewTask, StepSpec, StepState, TaskOrigin, TaskResult, Workflow,
        WorkflowExecution, WorkflowSpec, DEFAULT_MAX_RETRIES, DEFAULT_TASK_TIMEOUT_SECS,
    },
    store::{StateStore, WorkflowStepRecord},
    template, WorkflowValidator,
};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex as TokioMutex;

const ENGINE_SOURCE: &str = "workflow-engine";

struct LiveExecution {
    workflow: Workflow,
    execution: WorkflowExecution,
}

struct EngineInner {
    bus: MessageBus,
    store: Arc<dyn StateStore>,
    /// Executions this process is driving, keyed by execution id
    live: TokioMutex<HashMap<String, Arc<TokioMutex<LiveExecution>>>>,
    /// task id -> (execution id, step id)
    task_index: StdMutex<HashMap<String, (String, String)>>,
    subscription: StdMutex<Option<SubscriptionHandle>>,
}

/// Workflow engine: validates definitions, schedules executions, consumes
/// results. Cheap to clone.
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

impl WorkflowEngine {
    pub fn new(bus: MessageBus) -> Self {
        let store = bus.store();
        Self {
            inner: Arc::new(EngineInner {
                bus,
                store,
                live: TokioMutex::new(HashMap::new()),
                task_index: StdMutex::new(HashMap::new()),
                subscription: StdMutex::new(None),
            }),
        }
    }

    /// Subscribe to task results. Idempotent.
    pub fn start(&self) {
        let mut subscription = self
            .inner
            .subscription
            .lock()
            .expect("subscription poisoned");
        if subscription.is_some() {
            return;
        }

        let inner = Arc::clone(&self.inner);
        let handler: MessageHandler = Arc::new(move |message: Message| {
            let inner = Arc::clone(&inner);
            async move {
                let payload = message.payload;
                let Some(task_id) = payload["task_id"].as_str().map(String::from) else {
                    return Ok(());
                };
                let success = payload["success"].as_bool().unwrap_or(false);
                let result: Option<TaskResult> =
                    serde_json::from_value(payload["result"].clone()).ok();
                let error = payload["error"].as_str().map(String::from);
                apply_result(&inner, &task_id, success, result, error).await;
                Ok(())
            }
            .boxed()
        });
        *subscription = Some(self.inner.bus.subscribe("results:*", handler));
        tracing::info!("Workflow engine started");
    }

    /// Unsubscribe from results; live executions freeze where they are.
    pub fn stop(&self) {
        if let Some(handle) = self
            .inner
            .subscription
            .lock()
            .expect("subscription poisoned")
            .take()
        {
            self.inner.bus.unsubscribe(&handle);
        }
    }

    /// Validate and store a workflow definition.
    ///
    /// # Returns
    /// * `Ok(workflow_id)` - Generated id of the stored workflow
    /// * `Err(OrchestratorError::Validation)` - If the definition is malformed
    pub async fn define_workflow(&self, spec: WorkflowSpec) -> Result<String> {
        WorkflowValidator::validate(&spec)?;

        let workflow = Workflow {
            id: uuid_string(),
            name: spec.name,
            description: spec.description,
            steps: spec.steps,
            created: Utc::now(),
        };
        self.inner.store.save_workflow(&workflow).await?;
        self.inner
            .store
            .log_event(
                "workflow.defined",
                ENGINE_SOURCE,
                Some(&json!({"workflow_id": workflow.id, "name": workflow.name})),
            )
            .await
            .ok();

        tracing::info!(workflow_id = %workflow.id, name = %workflow.name, "Workflow defined");
        Ok(workflow.id)
    }

    /// Start a run of a stored workflow. Returns immediately with the
    /// execution id; callers poll or subscribe to `results:*`.
    pub async fn execute(
        &self,
        workflow_id: &str,
        inputs: Map<String, Value>,
    ) -> Result<String> {
        let workflow = self
            .inner
            .store
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| OrchestratorError::workflow_not_found(workflow_id))?;

        let execution = WorkflowExecution::start(&workflow, inputs);
        let execution_id = execution.execution_id.clone();
        self.inner.store.save_workflow_execution(&execution).await?;
        for spec in &workflow.steps {
            self.inner
                .store
                .save_workflow_step(&pending_record(&execution_id, spec))
                .await?;
        }
        self.inner
            .store
            .log_event(
                "workflow.started",
                ENGINE_SOURCE,
                Some(&json!({"workflow_id": workflow_id, "execution_id": execution_id})),
            )
            .await
            .ok();

        if workflow.steps.is_empty() {
            // Nothing to schedule; the run is complete by definition
            self.inner
                .store
                .update_workflow_execution(&execution_id, ExecutionState::Completed, None, None)
                .await?;
            tracing::info!(execution_id = %execution_id, "Empty workflow completed immediately");
            return Ok(execution_id);
        }

        let live = Arc::new(TokioMutex::new(LiveExecution {
            workflow,
            execution,
        }));
        self.inner
            .live
            .lock()
            .await
            .insert(execution_id.clone(), Arc::clone(&live));

        {
            let mut guard = live.lock().await;
            schedule_ready(&self.inner, &mut guard).await;
        }
        cleanup_if_settled(&self.inner, &execution_id, &live).await;

        tracing::info!(execution_id = %execution_id, "Workflow execution started");
        Ok(execution_id)
    }

    /// Current state of an execution, including per-step statuses.
    pub async fn get_execution_status(&self, execution_id: &str) -> Result<WorkflowExecution> {
        let live = self.inner.live.lock().await.get(execution_id).cloned();
        if let Some(live) = live {
            return Ok(live.lock().await.execution.clone());
        }
        self.inner
            .store
            .get_workflow_execution(execution_id)
            .await?
            .ok_or_else(|| OrchestratorError::execution_not_found(execution_id))
    }

    /// Cancel an execution: all not-yet-complete steps become `skipped` and
    /// the execution `cancelled`. Tasks already dispatched keep running in
    /// their sessions; their eventual results are ignored.
    pub async fn cancel(&self, execution_id: &str) -> Result<()> {
        let live = self.inner.live.lock().await.get(execution_id).cloned();
        let Some(live) = live else {
            // Not driven by this process; settle it directly in the store
            return self.cancel_stored(execution_id).await;
        };

        {
            let mut guard = live.lock().await;
            if guard.execution.status.is_terminal() {
                return Ok(());
            }

            let step_ids: Vec<String> = guard.execution.steps.keys().cloned().collect();
            for step_id in step_ids {
                let Some(step) = guard.execution.steps.get_mut(&step_id) else {
                    continue;
                };
                if step.state.is_terminal() {
                    continue;
                }
                step.state = StepState::Skipped;
                step.completed = Some(Utc::now());
                if let Err(e) = self
                    .inner
                    .store
                    .update_workflow_step(execution_id, &step_id, StepState::Skipped, None, None)
                    .await
                {
                    tracing::warn!(execution_id, step_id = %step_id, "Failed to persist skip: {e}");
                }
            }

            guard.execution.status = ExecutionState::Cancelled;
            guard.execution.completed = Some(Utc::now());
            let context = guard.execution.context.clone();
            if let Err(e) = self
                .inner
                .store
                .update_workflow_execution(
                    execution_id,
                    ExecutionState::Cancelled,
                    Some(&context),
                    None,
                )
                .await
            {
                tracing::warn!(execution_id, "Failed to persist cancellation: {e}");
            }
        }

        // Results for in-flight tasks of this execution are no longer routed
        self.inner
            .task_index
            .lock()
            .expect("task index poisoned")
            .retain(|_, (eid, _)| eid != execution_id);
        self.inner.live.lock().await.remove(execution_id);

        self.inner
            .store
            .log_event(
                "workflow.cancelled",
                ENGINE_SOURCE,
                Some(&json!({"execution_id": execution_id})),
            )
            .await
            .ok();
        tracing::info!(execution_id, "Workflow execution cancelled");
        Ok(())
    }

    async fn cancel_stored(&self, execution_id: &str) -> Result<()> {
        let execution = self
            .inner
            .store
            .get_workflow_execution(execution_id)
            .await?
            .ok_or_else(|| OrchestratorError::execution_not_found(execution_id))?;

        if execution.status.is_terminal() {
            return Ok(());
        }
        for (step_id, status) in &execution.steps {
            if !status.state.is_terminal() {
                self.inner
                    .store
                    .update_workflow_step(execution_id, step_id, StepState::Skipped, None, None)
                    .await?;
            }
        }
        self.inner
            .store
            .update_workflow_execution(execution_id, ExecutionState::Cancelled, None, None)
            .await
    }
}

fn uuid_string() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn pending_record(execution_id: &str, spec: &StepSpec) -> WorkflowStepRecord {
    WorkflowStepRecord {
        step_id: spec.id.clone(),
        execution_id: execution_id.to_string(),
        name: spec.name.clone(),
        agent: spec.agent.clone(),
        action: spec.action.clone(),
        status: StepState::Pending,
        task_id: None,
        started: None,
        completed: None,
        result: None,
        error: None,
    }
}

/// Dispatch every pending step whose prerequisites are all completed.
async fn schedule_ready(inner: &Arc<EngineInner>, live: &mut LiveExecution) {
    let ready: Vec<StepSpec> = live
        .workflow
        .steps
        .iter()
        .filter(|spec| {
            live.execution
                .steps
                .get(&spec.id)
                .map(|s| s.state == StepState::Pending)
                .unwrap_or(false)
                && spec.depends_on.iter().all(|dep| {
                    live.execution
                        .steps
                        .get(dep)
                        .map(|s| s.state == StepState::Completed)
                        .unwrap_or(false)
                })
        })
        .cloned()
        .collect();

    for spec in ready {
        if let Err(e) = dispatch_step(inner, live, &spec).await {
            tracing::error!(
                execution_id = %live.execution.execution_id,
                step_id = %spec.id,
                "Failed to dispatch step: {e}"
            );
            let message = format!("dispatch failed: {e}");
            mark_step_failed(inner, live, &spec.id, &message).await;
            fail_execution(inner, live, &spec.id, &message).await;
            return;
        }
    }
}

async fn dispatch_step(
    inner: &Arc<EngineInner>,
    live: &mut LiveExecution,
    spec: &StepSpec,
) -> Result<()> {
    let execution_id = live.execution.execution_id.clone();

    // Step params are rendered against the context, then themselves become
    // substitution values for the action.
    let mut substitutions = live.execution.context.clone();
    for (name, value) in &spec.params {
        substitutions.insert(
            name.clone(),
            Value::String(template::render_context(value, &live.execution.context)),
        );
    }
    let command = template::render_context(&spec.action, &substitutions);

    let submission = NewTask::new(&spec.agent, command)
        .with_timeout_secs(spec.timeout_secs.unwrap_or(DEFAULT_TASK_TIMEOUT_SECS))
        .with_max_retries(spec.max_retries.unwrap_or(DEFAULT_MAX_RETRIES))
        .with_origin(TaskOrigin::WorkflowStep {
            execution_id: execution_id.clone(),
            step_id: spec.id.clone(),
        });
    let task_id = inner.bus.publish_task(submission).await?;

    let started = Utc::now();
    let Some(step) = live.execution.steps.get_mut(&spec.id) else {
        return Err(OrchestratorError::Internal(format!(
            "Step '{}' missing from execution state",
            spec.id
        )));
    };
    step.state = StepState::Running;
    step.started = Some(started);
    step.task_id = Some(task_id.clone());

    let mut record = pending_record(&execution_id, spec);
    record.status = StepState::Running;
    record.task_id = Some(task_id.clone());
    record.started = Some(started);
    if let Err(e) = inner.store.save_workflow_step(&record).await {
        tracing::warn!(execution_id = %execution_id, step_id = %spec.id, "Failed to persist step start: {e}");
    }

    inner
        .task_index
        .lock()
        .expect("task index poisoned")
        .insert(task_id.clone(), (execution_id.clone(), spec.id.clone()));

    tracing::info!(
        execution_id = %execution_id,
        step_id = %spec.id,
        task_id = %task_id,
        agent = %spec.agent,
        "Step dispatched"
    );
    Ok(())
}

async fn apply_result(
    inner: &Arc<EngineInner>,
    task_id: &str,
    success: bool,
    result: Option<TaskResult>,
    error: Option<String>,
) {
    let mapping = inner
        .task_index
        .lock()
        .expect("task index poisoned")
        .remove(task_id);
    let Some((execution_id, step_id)) = mapping else {
        // Not a workflow task, or its execution was cancelled
        return;
    };

    let live = inner.live.lock().await.get(&execution_id).cloned();
    let Some(live) = live else { return };

    {
        let mut guard = live.lock().await;
        let Some(step) = guard.execution.steps.get_mut(&step_id) else {
            return;
        };
        if step.state != StepState::Running {
            return;
        }

        if success {
            step.state = StepState::Completed;
            step.completed = Some(Utc::now());
            step.result = result.clone();
            if let Err(e) = inner
                .store
                .update_workflow_step(
                    &execution_id,
                    &step_id,
                    StepState::Completed,
                    result.as_ref(),
                    None,
                )
                .await
            {
                tracing::warn!(execution_id = %execution_id, step_id = %step_id, "Failed to persist step result: {e}");
            }

            // The step's output joins the context for downstream substitution
            if let Some(result) = &result {
                if let Ok(value) = serde_json::to_value(result) {
                    guard.execution.context.insert(step_id.clone(), value);
                }
            }

            if guard.execution.status == ExecutionState::Running {
                let context = guard.execution.context.clone();
                if let Err(e) = inner
                    .store
                    .update_workflow_execution(
                        &execution_id,
                        ExecutionState::Running,
                        Some(&context),
                        None,
                    )
                    .await
                {
                    tracing::warn!(execution_id = %execution_id, "Failed to persist context: {e}");
                }
                schedule_ready(inner, &mut guard).await;
                maybe_complete(inner, &mut guard).await;
            }
        } else {
            let error_text = error.unwrap_or_else(|| "step failed".to_string());
            mark_step_failed(inner, &mut guard, &step_id, &error_text).await;
            if guard.execution.status == ExecutionState::Running {
                fail_execution(inner, &mut guard, &step_id, &error_text).await;
            }
        }
    }

    cleanup_if_settled(inner, &execution_id, &live).await;
}

async fn mark_step_failed(
    inner: &Arc<EngineInner>,
    live: &mut LiveExecution,
    step_id: &str,
    error_text: &str,
) {
    let execution_id = live.execution.execution_id.clone();
    if let Some(step) = live.execution.steps.get_mut(step_id) {
        step.state = StepState::Failed;
        step.completed = Some(Utc::now());
        step.error = Some(error_text.to_string());
    }
    if let Err(e) = inner
        .store
        .update_workflow_step(&execution_id, step_id, StepState::Failed, None, Some(error_text))
        .await
    {
        tracing::warn!(execution_id = %execution_id, step_id, "Failed to persist step failure: {e}");
    }
}

/// A failed step fails the execution: every still-pending step (the failed
/// step's transitive dependents included) is skipped and will never be
/// dispatched.
async fn fail_execution(
    inner: &Arc<EngineInner>,
    live: &mut LiveExecution,
    failed_step: &str,
    error_text: &str,
) {
    let execution_id = live.execution.execution_id.clone();

    let step_ids: Vec<String> = live.execution.steps.keys().cloned().collect();
    for step_id in step_ids {
        let Some(step) = live.execution.steps.get_mut(&step_id) else {
            continue;
        };
        if step.state != StepState::Pending {
            continue;
        }
        step.state = StepState::Skipped;
        step.completed = Some(Utc::now());
        if let Err(e) = inner
            .store
            .update_workflow_step(&execution_id, &step_id, StepState::Skipped, None, None)
            .await
        {
            tracing::warn!(execution_id = %execution_id, step_id = %step_id, "Failed to persist skip: {e}");
        }
    }

    live.execution.status = ExecutionState::Failed;
    live.execution.completed = Some(Utc::now());
    let summary = format!("Step '{failed_step}' failed: {error_text}");
    live.execution.error = Some(summary.clone());

    let context = live.execution.context.clone();
    if let Err(e) = inner
        .store
        .update_workflow_execution(
            &execution_id,
            ExecutionState::Failed,
            Some(&context),
            Some(&summary),
        )
        .await
    {
        tracing::warn!(execution_id = %execution_id, "Failed to persist execution failure: {e}");
    }
    inner
        .store
        .log_event(
            "workflow.failed",
            ENGINE_SOURCE,
            Some(&json!({"execution_id": execution_id, "step_id": failed_step})),
        )
        .await
        .ok();
    inner.bus.broadcast_event(
        "workflow",
        json!({"execution_id": execution_id, "status": "failed"}),
    );
    tracing::warn!(execution_id = %execution_id, failed_step, "Workflow execution failed");
}

async fn maybe_complete(inner: &Arc<EngineInner>, live: &mut LiveExecution) {
    let all_completed = live
        .execution
        .steps
        .values()
        .all(|s| s.state == StepState::Completed);
    if !all_completed {
        return;
    }

    let execution_id = live.execution.execution_id.clone();
    live.execution.status = ExecutionState::Completed;
    live.execution.completed = Some(Utc::now());

    let context = live.execution.context.clone();
    if let Err(e) = inner
        .store
        .update_workflow_execution(
            &execution_id,
            ExecutionState::Completed,
            Some(&context),
            None,
        )
        .await
    {
        tracing::warn!(execution_id = %execution_id, "Failed to persist completion: {e}");
    }
    inner
        .store
        .log_event(
            "workflow.completed",
            ENGINE_SOURCE,
            Some(&json!({"execution_id": execution_id})),
        )
        .await
        .ok();
    inner.bus.broadcast_event(
        "workflow",
        json!({"execution_id": execution_id, "status": "completed"}),
    );
    tracing::info!(execution_id = %execution_id, "Workflow execution completed");
}

/// Drop a finished execution from the live map once nothing is running.
async fn cleanup_if_settled(
    inner: &Arc<EngineInner>,
    execution_id: &str,
    live: &Arc<TokioMutex<LiveExecution>>,
) {
    let settled = {
        let guard = live.lock().await;
        guard.execution.status.is_terminal()
            && !guard
                .execution
                .steps
                .values()
                .any(|s| s.state == StepState::Running)
    };
    if settled {
        inner.live.lock().await.remove(execution_id);
    }
}
