use crate::{
    error::Result,
    models::{
        AgentState, AgentStatusRecord, ExecutionState, StepState, SystemEvent, Task, TaskResult,
        TaskState, Workflow, WorkflowExecution,
    },
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;

/// Durable record of one workflow step within an execution.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowStepRecord {
    pub step_id: String,
    pub execution_id: String,
    pub name: String,
    pub agent: String,
    pub action: String,
    pub status: StepState,
    /// Id of the task dispatched for this step, once scheduled
    pub task_id: Option<String>,
    pub started: Option<DateTime<Utc>>,
    pub completed: Option<DateTime<Utc>>,
    pub result: Option<TaskResult>,
    pub error: Option<String>,
}

/// Store trait for durable orchestrator state.
///
/// Implementations must be thread-safe and support concurrent access. Each
/// operation is atomic; readers see a consistent snapshot. No operation spans
/// a long-running transaction.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Upsert a task record.
    ///
    /// # Returns
    /// * `Ok(())` - The task was written
    /// * `Err(OrchestratorError::Storage)` - If the write fails
    async fn save_task(&self, task: &Task) -> Result<()>;

    /// Transition a task's state, attaching result/error on terminal states.
    ///
    /// Transitions are monotone per the task state machine. Writing the same
    /// terminal state a task is already in is an idempotent no-op; any other
    /// transition out of a terminal state is rejected.
    ///
    /// # Returns
    /// * `Ok(())` - The transition was applied (or was a no-op)
    /// * `Err(OrchestratorError::NotFound)` - If the task doesn't exist
    /// * `Err(OrchestratorError::InvalidTransition)` - If the transition is invalid
    /// * `Err(OrchestratorError::Storage)` - If the write fails
    async fn update_task_status(
        &self,
        task_id: &str,
        state: TaskState,
        result: Option<&TaskResult>,
        error: Option<&str>,
    ) -> Result<()>;

    /// Get a task by id.
    async fn get_task(&self, task_id: &str) -> Result<Option<Task>>;

    /// All pending tasks, ordered by priority descending then creation
    /// ascending, optionally filtered by agent.
    async fn get_pending_tasks(&self, agent: Option<&str>) -> Result<Vec<Task>>;

    /// All running tasks, ordered by creation ascending.
    async fn get_running_tasks(&self) -> Result<Vec<Task>>;

    /// Upsert a workflow definition.
    async fn save_workflow(&self, workflow: &Workflow) -> Result<()>;

    /// Get a workflow definition by id.
    async fn get_workflow(&self, workflow_id: &str) -> Result<Option<Workflow>>;

    /// Insert a fresh execution record (status, context and timestamps from
    /// the value).
    async fn save_workflow_execution(&self, execution: &WorkflowExecution) -> Result<()>;

    /// Update an execution's status, context and error. Terminal states stamp
    /// the completion time.
    async fn update_workflow_execution(
        &self,
        execution_id: &str,
        status: ExecutionState,
        context: Option<&serde_json::Map<String, Value>>,
        error: Option<&str>,
    ) -> Result<()>;

    /// Reconstruct an execution (including its step statuses) from the store.
    async fn get_workflow_execution(&self, execution_id: &str)
        -> Result<Option<WorkflowExecution>>;

    /// Executions with status in {pending, running}, ordered by start time
    /// ascending.
    async fn get_incomplete_executions(&self) -> Result<Vec<WorkflowExecution>>;

    /// Upsert a step record for an execution.
    async fn save_workflow_step(&self, step: &WorkflowStepRecord) -> Result<()>;

    /// Update a step's status/result/error. Running stamps the start time,
    /// terminal states stamp the completion time.
    async fn update_workflow_step(
        &self,
        execution_id: &str,
        step_id: &str,
        status: StepState,
        result: Option<&TaskResult>,
        error: Option<&str>,
    ) -> Result<()>;

    /// All step records of an execution.
    async fn get_execution_steps(&self, execution_id: &str) -> Result<Vec<WorkflowStepRecord>>;

    /// Upsert an agent's status; sets `last_heartbeat` to now.
    async fn update_agent_status(
        &self,
        agent: &str,
        state: AgentState,
        last_task_id: Option<&str>,
        details: Option<&Value>,
    ) -> Result<()>;

    /// Get an agent's status record.
    async fn get_agent_status(&self, agent: &str) -> Result<Option<AgentStatusRecord>>;

    /// Append an event to the log.
    async fn log_event(&self, event_type: &str, source: &str, data: Option<&Value>) -> Result<()>;

    /// Most recent events, newest first, optionally filtered by type.
    async fn get_recent_events(
        &self,
        limit: u32,
        event_type: Option<&str>,
    ) -> Result<Vec<SystemEvent>>;

    /// Delete terminal tasks and events older than `days_to_keep` days and
    /// compact storage.
    ///
    /// # Returns
    /// * `Ok(count)` - Number of rows removed
    async fn cleanup_old_data(&self, days_to_keep: u32) -> Result<u64>;

    /// Aggregate counts for monitoring and health reports.
    async fn get_statistics(&self) -> Result<StoreStatistics>;

    /// Verify the store is reachable.
    ///
    /// # Returns
    /// * `Ok(())` - Store is healthy and connected
    /// * `Err(OrchestratorError::Storage)` - Store is unhealthy
    async fn health_check(&self) -> Result<()>;
}

/// Aggregate store counts for monitoring and health reports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStatistics {
    /// Task counts keyed by status string
    pub tasks_by_status: HashMap<String, u64>,
    /// Execution counts keyed by status string
    pub executions_by_status: HashMap<String, u64>,
    /// Agent counts keyed by status string
    pub agents_by_status: HashMap<String, u64>,
    /// Events logged in the last hour
    pub recent_events: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statistics_default() {
        let stats = StoreStatistics::default();
        assert!(stats.tasks_by_status.is_empty());
        assert!(stats.executions_by_status.is_empty());
        assert!(stats.agents_by_status.is_empty());
        assert_eq!(stats.recent_events, 0);
    }

    #[test]
    fn test_step_record_construction() {
        let record = WorkflowStepRecord {
            step_id: "s1".to_string(),
            execution_id: "exec-1".to_string(),
            name: "Initialize".to_string(),
            agent: "supervisor".to_string(),
            action: "echo start".to_string(),
            status: StepState::Pending,
            task_id: None,
            started: None,
            completed: None,
            result: None,
            error: None,
        };
        assert_eq!(record.status, StepState::Pending);
        assert!(record.started.is_none());
    }
}
