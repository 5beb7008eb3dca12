//! Mock implementation of the StateStore trait
//!
//! Provides a thread-safe in-memory store with:
//! - Error injection capabilities
//! - Call tracking for verification
//! - The same transition semantics as the SQLite store

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use orchestrator_core::{
    error::{OrchestratorError, Result},
    models::{
        AgentState, AgentStatusRecord, ExecutionState, StepState, StepStatus, SystemEvent, Task,
        TaskResult, TaskState, Workflow, WorkflowExecution,
    },
    store::{StateStore, StoreStatistics, WorkflowStepRecord},
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Mock implementation of StateStore for testing
///
/// Features:
/// - Thread-safe concurrent access
/// - Error injection for failure testing
/// - Call history tracking for verification
/// - Monotone task transitions matching the real store
#[derive(Default)]
pub struct MockStateStore {
    tasks: Mutex<HashMap<String, Task>>,
    workflows: Mutex<HashMap<String, Workflow>>,
    executions: Mutex<HashMap<String, WorkflowExecution>>,
    steps: Mutex<HashMap<(String, String), WorkflowStepRecord>>,
    agents: Mutex<HashMap<String, AgentStatusRecord>>,
    events: Mutex<Vec<SystemEvent>>,
    next_event_id: AtomicI64,
    error_injection: Mutex<Option<OrchestratorError>>,
    call_history: Arc<Mutex<Vec<String>>>,
}

impl MockStateStore {
    /// Create a new empty mock store
    pub fn new() -> Self {
        Self {
            next_event_id: AtomicI64::new(1),
            ..Self::default()
        }
    }

    /// Create a mock store with pre-populated tasks
    pub fn with_tasks(tasks: Vec<Task>) -> Self {
        let store = Self::new();
        {
            let mut map = store.tasks.lock();
            for task in tasks {
                map.insert(task.id.clone(), task);
            }
        }
        store
    }

    /// Snapshot of every stored task, for test assertions
    pub fn all_tasks(&self) -> Vec<Task> {
        self.tasks.lock().values().cloned().collect()
    }

    /// Inject an error for the next store operation
    pub fn inject_error(&self, error: OrchestratorError) {
        *self.error_injection.lock() = Some(error);
    }

    /// Clear any pending error injection
    pub fn clear_error(&self) {
        *self.error_injection.lock() = None;
    }

    /// Get history of called methods
    pub fn call_history(&self) -> Vec<String> {
        self.call_history.lock().clone()
    }

    /// Clear call history
    pub fn clear_history(&self) {
        self.call_history.lock().clear();
    }

    /// Assert a method was called at least once
    pub fn assert_called(&self, method: &str) {
        let history = self.call_history.lock();
        assert!(
            history.iter().any(|call| call.contains(method)),
            "Method '{}' was not called. Call history: {:?}",
            method,
            *history
        );
    }

    /// Check if an error should be injected, consuming it if so
    fn check_error_injection(&self) -> Result<()> {
        if let Some(error) = self.error_injection.lock().take() {
            return Err(error);
        }
        Ok(())
    }

    /// Record a method call in history
    fn record_call(&self, method: &str) {
        self.call_history.lock().push(method.to_string());
    }
}

#[async_trait]
impl StateStore for MockStateStore {
    async fn save_task(&self, task: &Task) -> Result<()> {
        self.record_call("save_task");
        self.check_error_injection()?;
        if task.id.trim().is_empty() {
            return Err(OrchestratorError::empty_field("task_id"));
        }
        self.tasks.lock().insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn update_task_status(
        &self,
        task_id: &str,
        state: TaskState,
        result: Option<&TaskResult>,
        error: Option<&str>,
    ) -> Result<()> {
        self.record_call("update_task_status");
        self.check_error_injection()?;

        let mut tasks = self.tasks.lock();
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| OrchestratorError::task_not_found(task_id))?;

        if task.state == state {
            return Ok(());
        }
        if task.state.is_terminal() {
            // Late writers against a terminal task are an idempotent no-op.
            return Ok(());
        }
        if !task.state.can_transition_to(state) {
            return Err(OrchestratorError::invalid_transition(task.state, state));
        }

        let now = Utc::now();
        task.state = state;
        if state == TaskState::Running && task.started.is_none() {
            task.started = Some(now);
        }
        if state.is_terminal() {
            task.completed = Some(now);
        }
        if let Some(result) = result {
            task.result = Some(result.clone());
        }
        if let Some(error) = error {
            task.error = Some(error.to_string());
        }
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        self.record_call("get_task");
        self.check_error_injection()?;
        Ok(self.tasks.lock().get(task_id).cloned())
    }

    async fn get_pending_tasks(&self, agent: Option<&str>) -> Result<Vec<Task>> {
        self.record_call("get_pending_tasks");
        self.check_error_injection()?;

        let mut pending: Vec<Task> = self
            .tasks
            .lock()
            .values()
            .filter(|t| t.state == TaskState::Pending)
            .filter(|t| agent.map(|a| t.agent == a).unwrap_or(true))
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created.cmp(&b.created))
        });
        Ok(pending)
    }

    async fn get_running_tasks(&self) -> Result<Vec<Task>> {
        self.record_call("get_running_tasks");
        self.check_error_injection()?;

        let mut running: Vec<Task> = self
            .tasks
            .lock()
            .values()
            .filter(|t| t.state == TaskState::Running)
            .cloned()
            .collect();
        running.sort_by(|a, b| a.created.cmp(&b.created));
        Ok(running)
    }

    async fn save_workflow(&self, workflow: &Workflow) -> Result<()> {
        self.record_call("save_workflow");
        self.check_error_injection()?;
        self.workflows
            .lock()
            .insert(workflow.id.clone(), workflow.clone());
        Ok(())
    }

    async fn get_workflow(&self, workflow_id: &str) -> Result<Option<Workflow>> {
        self.record_call("get_workflow");
        self.check_error_injection()?;
        Ok(self.workflows.lock().get(workflow_id).cloned())
    }

    async fn save_workflow_execution(&self, execution: &WorkflowExecution) -> Result<()> {
        self.record_call("save_workflow_execution");
        self.check_error_injection()?;
        self.executions
            .lock()
            .insert(execution.execution_id.clone(), execution.clone());
        Ok(())
    }

    async fn update_workflow_execution(
        &self,
        execution_id: &str,
        status: ExecutionState,
        context: Option<&serde_json::Map<String, Value>>,
        error: Option<&str>,
    ) -> Result<()> {
        self.record_call("update_workflow_execution");
        self.check_error_injection()?;

        let mut executions = self.executions.lock();
        let execution = executions
            .get_mut(execution_id)
            .ok_or_else(|| OrchestratorError::execution_not_found(execution_id))?;

        execution.status = status;
        if status.is_terminal() {
            execution.completed = Some(Utc::now());
        }
        if let Some(context) = context {
            execution.context = context.clone();
        }
        if let Some(error) = error {
            execution.error = Some(error.to_string());
        }
        Ok(())
    }

    async fn get_workflow_execution(
        &self,
        execution_id: &str,
    ) -> Result<Option<WorkflowExecution>> {
        self.record_call("get_workflow_execution");
        self.check_error_injection()?;

        let Some(mut execution) = self.executions.lock().get(execution_id).cloned() else {
            return Ok(None);
        };

        // Overlay step rows, mirroring how the SQLite store reassembles
        execution.steps = self
            .steps
            .lock()
            .values()
            .filter(|s| s.execution_id == execution_id)
            .map(|record| {
                (
                    record.step_id.clone(),
                    StepStatus {
                        state: record.status,
                        task_id: record.task_id.clone(),
                        result: record.result.clone(),
                        error: record.error.clone(),
                        started: record.started,
                        completed: record.completed,
                    },
                )
            })
            .collect();
        Ok(Some(execution))
    }

    async fn get_incomplete_executions(&self) -> Result<Vec<WorkflowExecution>> {
        self.record_call("get_incomplete_executions");
        self.check_error_injection()?;

        let mut incomplete: Vec<WorkflowExecution> = self
            .executions
            .lock()
            .values()
            .filter(|e| !e.status.is_terminal())
            .cloned()
            .collect();
        incomplete.sort_by(|a, b| a.started.cmp(&b.started));
        Ok(incomplete)
    }

    async fn save_workflow_step(&self, step: &WorkflowStepRecord) -> Result<()> {
        self.record_call("save_workflow_step");
        self.check_error_injection()?;
        self.steps.lock().insert(
            (step.execution_id.clone(), step.step_id.clone()),
            step.clone(),
        );
        Ok(())
    }

    async fn update_workflow_step(
        &self,
        execution_id: &str,
        step_id: &str,
        status: StepState,
        result: Option<&TaskResult>,
        error: Option<&str>,
    ) -> Result<()> {
        self.record_call("update_workflow_step");
        self.check_error_injection()?;

        let mut steps = self.steps.lock();
        let step = steps
            .get_mut(&(execution_id.to_string(), step_id.to_string()))
            .ok_or_else(|| {
                OrchestratorError::NotFound(format!(
                    "Step '{step_id}' of execution '{execution_id}' not found"
                ))
            })?;

        let now = Utc::now();
        step.status = status;
        if status == StepState::Running && step.started.is_none() {
            step.started = Some(now);
        }
        if status.is_terminal() {
            step.completed = Some(now);
        }
        if let Some(result) = result {
            step.result = Some(result.clone());
        }
        if let Some(error) = error {
            step.error = Some(error.to_string());
        }
        Ok(())
    }

    async fn get_execution_steps(&self, execution_id: &str) -> Result<Vec<WorkflowStepRecord>> {
        self.record_call("get_execution_steps");
        self.check_error_injection()?;

        let mut records: Vec<WorkflowStepRecord> = self
            .steps
            .lock()
            .values()
            .filter(|s| s.execution_id == execution_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.step_id.cmp(&b.step_id));
        Ok(records)
    }

    async fn update_agent_status(
        &self,
        agent: &str,
        state: AgentState,
        last_task_id: Option<&str>,
        details: Option<&Value>,
    ) -> Result<()> {
        self.record_call("update_agent_status");
        self.check_error_injection()?;

        let mut agents = self.agents.lock();
        let record = agents
            .entry(agent.to_string())
            .or_insert_with(|| AgentStatusRecord {
                agent: agent.to_string(),
                state,
                last_task_id: None,
                last_heartbeat: Utc::now(),
                details: Value::Null,
            });
        record.state = state;
        record.last_heartbeat = Utc::now();
        if let Some(last_task_id) = last_task_id {
            record.last_task_id = Some(last_task_id.to_string());
        }
        if let Some(details) = details {
            record.details = details.clone();
        }
        Ok(())
    }

    async fn get_agent_status(&self, agent: &str) -> Result<Option<AgentStatusRecord>> {
        self.record_call("get_agent_status");
        self.check_error_injection()?;
        Ok(self.agents.lock().get(agent).cloned())
    }

    async fn log_event(&self, event_type: &str, source: &str, data: Option<&Value>) -> Result<()> {
        self.record_call("log_event");
        self.check_error_injection()?;

        let event = SystemEvent {
            id: self.next_event_id.fetch_add(1, Ordering::Relaxed),
            event_type: event_type.to_string(),
            source: source.to_string(),
            timestamp: Utc::now(),
            data: data.cloned().unwrap_or(Value::Null),
        };
        self.events.lock().push(event);
        Ok(())
    }

    async fn get_recent_events(
        &self,
        limit: u32,
        event_type: Option<&str>,
    ) -> Result<Vec<SystemEvent>> {
        self.record_call("get_recent_events");
        self.check_error_injection()?;

        let events = self.events.lock();
        Ok(events
            .iter()
            .rev()
            .filter(|e| event_type.map(|t| e.event_type == t).unwrap_or(true))
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn cleanup_old_data(&self, days_to_keep: u32) -> Result<u64> {
        self.record_call("cleanup_old_data");
        self.check_error_injection()?;

        let cutoff = Utc::now() - ChronoDuration::days(days_to_keep as i64);
        let mut removed = 0u64;

        {
            let mut tasks = self.tasks.lock();
            let before = tasks.len();
            tasks.retain(|_, t| {
                !(t.state.is_terminal() && t.completed.map(|c| c < cutoff).unwrap_or(false))
            });
            removed += (before - tasks.len()) as u64;
        }
        {
            let mut events = self.events.lock();
            let before = events.len();
            events.retain(|e| e.timestamp >= cutoff);
            removed += (before - events.len()) as u64;
        }
        Ok(removed)
    }

    async fn get_statistics(&self) -> Result<StoreStatistics> {
        self.record_call("get_statistics");
        self.check_error_injection()?;

        let mut stats = StoreStatistics::default();
        for task in self.tasks.lock().values() {
            *stats
                .tasks_by_status
                .entry(task.state.to_string())
                .or_insert(0) += 1;
        }
        for execution in self.executions.lock().values() {
            *stats
                .executions_by_status
                .entry(execution.status.to_string())
                .or_insert(0) += 1;
        }
        for agent in self.agents.lock().values() {
            *stats
                .agents_by_status
                .entry(agent.state.to_string())
                .or_insert(0) += 1;
        }
        let hour_ago = Utc::now() - ChronoDuration::hours(1);
        stats.recent_events = self
            .events
            .lock()
            .iter()
            .filter(|e| e.timestamp > hour_ago)
            .count() as u64;
        Ok(stats)
    }

    async fn health_check(&self) -> Result<()> {
        self.record_call("health_check");
        self.check_error_injection()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_core::models::NewTask;

    fn pending(id: &str, agent: &str) -> Task {
        Task::from_submission(NewTask::new(agent, "echo hi").with_id(id))
    }

    #[tokio::test]
    async fn test_task_round_trip_and_history() {
        let store = MockStateStore::new();
        store.save_task(&pending("t-1", "supervisor")).await.unwrap();

        let task = store.get_task("t-1").await.unwrap().unwrap();
        assert_eq!(task.agent, "supervisor");

        store.assert_called("save_task");
        store.assert_called("get_task");
    }

    #[tokio::test]
    async fn test_error_injection_is_single_shot() {
        let store = MockStateStore::new();
        store.inject_error(OrchestratorError::Storage("boom".into()));

        assert!(store.health_check().await.is_err());
        assert!(store.health_check().await.is_ok());
    }

    #[tokio::test]
    async fn test_transition_semantics_match_real_store() {
        let store = MockStateStore::new();
        store.save_task(&pending("t-1", "supervisor")).await.unwrap();

        // invalid skip
        let err = store
            .update_task_status("t-1", TaskState::Completed, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidTransition(_, _)));

        store
            .update_task_status("t-1", TaskState::Running, None, None)
            .await
            .unwrap();
        store
            .update_task_status("t-1", TaskState::Failed, None, Some("boom"))
            .await
            .unwrap();

        // terminal writes are idempotent no-ops
        store
            .update_task_status("t-1", TaskState::Completed, None, None)
            .await
            .unwrap();
        assert_eq!(
            store.get_task("t-1").await.unwrap().unwrap().state,
            TaskState::Failed
        );
    }

    #[tokio::test]
    async fn test_pending_ordering() {
        use orchestrator_core::models::Priority;

        let store = MockStateStore::new();
        let mut low = pending("t-low", "a");
        low.priority = Priority::Low;
        let mut high = pending("t-high", "a");
        high.priority = Priority::High;
        store.save_task(&low).await.unwrap();
        store.save_task(&high).await.unwrap();

        let ids: Vec<String> = store
            .get_pending_tasks(None)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec!["t-high", "t-low"]);
    }
}
