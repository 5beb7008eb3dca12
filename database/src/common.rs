use chrono::{DateTime, Utc};
use orchestrator_core::{
    error::{OrchestratorError, Result},
    models::{
        AgentState, AgentStatusRecord, ExecutionState, Priority, StepState, SystemEvent, Task,
        TaskOrigin, TaskResult, TaskState, Workflow,
    },
    store::WorkflowStepRecord,
};
use sqlx::{sqlite::SqliteRow, Row};

/// Convert TaskState enum to string for database storage
pub fn task_state_to_string(state: TaskState) -> &'static str {
    match state {
        TaskState::Pending => "pending",
        TaskState::Running => "running",
        TaskState::Completed => "completed",
        TaskState::Failed => "failed",
        TaskState::Retried => "retried",
        TaskState::Cancelled => "cancelled",
    }
}

/// Convert string from database to TaskState enum
pub fn string_to_task_state(s: &str) -> Result<TaskState> {
    match s {
        "pending" => Ok(TaskState::Pending),
        "running" => Ok(TaskState::Running),
        "completed" => Ok(TaskState::Completed),
        "failed" => Ok(TaskState::Failed),
        "retried" => Ok(TaskState::Retried),
        "cancelled" => Ok(TaskState::Cancelled),
        _ => Err(OrchestratorError::Storage(format!(
            "Invalid task status in database: {s}"
        ))),
    }
}

pub fn execution_state_to_string(state: ExecutionState) -> &'static str {
    match state {
        ExecutionState::Pending => "pending",
        ExecutionState::Running => "running",
        ExecutionState::Completed => "completed",
        ExecutionState::Failed => "failed",
        ExecutionState::Cancelled => "cancelled",
    }
}

pub fn string_to_execution_state(s: &str) -> Result<ExecutionState> {
    match s {
        "pending" => Ok(ExecutionState::Pending),
        "running" => Ok(ExecutionState::Running),
        "completed" => Ok(ExecutionState::Completed),
        "failed" => Ok(ExecutionState::Failed),
        "cancelled" => Ok(ExecutionState::Cancelled),
        _ => Err(OrchestratorError::Storage(format!(
            "Invalid execution status in database: {s}"
        ))),
    }
}

pub fn step_state_to_string(state: StepState) -> &'static str {
    match state {
        StepState::Pending => "pending",
        StepState::Running => "running",
        StepState::Completed => "completed",
        StepState::Failed => "failed",
        StepState::Skipped => "skipped",
    }
}

pub fn string_to_step_state(s: &str) -> Result<StepState> {
    match s {
        "pending" => Ok(StepState::Pending),
        "running" => Ok(StepState::Running),
        "completed" => Ok(StepState::Completed),
        "failed" => Ok(StepState::Failed),
        "skipped" => Ok(StepState::Skipped),
        _ => Err(OrchestratorError::Storage(format!(
            "Invalid step status in database: {s}"
        ))),
    }
}

pub fn agent_state_to_string(state: AgentState) -> &'static str {
    match state {
        AgentState::Ready => "ready",
        AgentState::Busy => "busy",
        AgentState::Stopped => "stopped",
        AgentState::Error => "error",
        AgentState::Unknown => "unknown",
    }
}

pub fn string_to_agent_state(s: &str) -> Result<AgentState> {
    match s {
        "ready" => Ok(AgentState::Ready),
        "busy" => Ok(AgentState::Busy),
        "stopped" => Ok(AgentState::Stopped),
        "error" => Ok(AgentState::Error),
        "unknown" => Ok(AgentState::Unknown),
        _ => Err(OrchestratorError::Storage(format!(
            "Invalid agent status in database: {s}"
        ))),
    }
}

fn json_column<T: serde::de::DeserializeOwned>(
    row: &SqliteRow,
    column: &str,
) -> Result<Option<T>> {
    let raw: Option<String> = row.try_get(column).ok().flatten();
    match raw {
        Some(text) if !text.is_empty() => serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| {
                OrchestratorError::Storage(format!("Corrupt JSON in column '{column}': {e}"))
            }),
        _ => Ok(None),
    }
}

/// Convert SQLite row to Task model
pub fn row_to_task(row: &SqliteRow) -> Result<Task> {
    let status: String = row.get("status");
    let state = string_to_task_state(&status)?;

    let params = json_column(row, "params")?.unwrap_or_default();
    let result: Option<TaskResult> = json_column(row, "result")?;
    let origin: Option<TaskOrigin> = json_column(row, "origin")?;

    let priority: i64 = row.get("priority");
    let timeout_secs: i64 = row.get("timeout_secs");
    let max_retries: i64 = row.get("max_retries");

    Ok(Task {
        id: row.get("task_id"),
        agent: row.get("agent"),
        command: row.get("command"),
        params,
        priority: Priority::from_i64(priority),
        timeout_secs: timeout_secs.max(0) as u64,
        max_retries: max_retries.max(0) as u32,
        state,
        created: row.get("created"),
        started: row.get("started"),
        completed: row.get("completed"),
        result,
        error: row.get("error"),
        origin,
    })
}

/// Convert SQLite row to Workflow model, decoding the step list from the
/// `definition` JSON column.
pub fn row_to_workflow(row: &SqliteRow) -> Result<Workflow> {
    let definition: String = row.get("definition");
    let steps = serde_json::from_str(&definition).map_err(|e| {
        OrchestratorError::Storage(format!("Corrupt workflow definition: {e}"))
    })?;

    Ok(Workflow {
        id: row.get("workflow_id"),
        name: row.get("name"),
        description: row.get("description"),
        steps,
        created: row.get("created"),
    })
}

/// Convert SQLite row to a workflow step record
pub fn row_to_step_record(row: &SqliteRow) -> Result<WorkflowStepRecord> {
    let status: String = row.get("status");

    Ok(WorkflowStepRecord {
        step_id: row.get("step_id"),
        execution_id: row.get("execution_id"),
        name: row.get("name"),
        agent: row.get("agent"),
        action: row.get("action"),
        status: string_to_step_state(&status)?,
        task_id: row.get("task_id"),
        started: row.get("started"),
        completed: row.get("completed"),
        result: json_column(row, "result")?,
        error: row.get("error"),
    })
}

/// Convert SQLite row to an agent status record
pub fn row_to_agent_status(row: &SqliteRow) -> Result<AgentStatusRecord> {
    let status: String = row.get("status");
    let details: Option<serde_json::Value> = json_column(row, "details")?;

    Ok(AgentStatusRecord {
        agent: row.get("agent"),
        state: string_to_agent_state(&status)?,
        last_task_id: row.get("last_task_id"),
        last_heartbeat: row.get("last_heartbeat"),
        details: details.unwrap_or(serde_json::Value::Null),
    })
}

/// Convert SQLite row to a system event
pub fn row_to_event(row: &SqliteRow) -> Result<SystemEvent> {
    let data: Option<serde_json::Value> = json_column(row, "data")?;
    let timestamp: DateTime<Utc> = row.get("timestamp");

    Ok(SystemEvent {
        id: row.get("event_id"),
        event_type: row.get("event_type"),
        source: row.get("source"),
        timestamp,
        data: data.unwrap_or(serde_json::Value::Null),
    })
}

/// Convert SQLx error to OrchestratorError
pub fn sqlx_error_to_store_error(err: sqlx::Error) -> OrchestratorError {
    match &err {
        sqlx::Error::Database(db_err) => {
            let message = db_err.message();
            if message.contains("UNIQUE constraint failed") {
                OrchestratorError::Conflict(format!("Database constraint violated: {message}"))
            } else {
                OrchestratorError::Storage(format!("Database constraint error: {message}"))
            }
        }
        sqlx::Error::RowNotFound => {
            OrchestratorError::Storage("Unexpected RowNotFound error".to_string())
        }
        sqlx::Error::PoolTimedOut => {
            OrchestratorError::Storage("Connection pool timeout".to_string())
        }
        sqlx::Error::Io(io_err) => OrchestratorError::Storage(format!("Database I/O error: {io_err}")),
        _ => OrchestratorError::Storage(format!("Database operation failed: {err}")),
    }
}

/// Build the pending-task query: priority descending, oldest first, with an
/// optional agent filter.
pub fn build_pending_query(agent: Option<&str>) -> sqlx::QueryBuilder<'_, sqlx::Sqlite> {
    let mut query_builder: sqlx::QueryBuilder<'_, sqlx::Sqlite> = sqlx::QueryBuilder::new(
        "SELECT task_id, agent, command, params, priority, timeout_secs, max_retries, \
         status, created, started, completed, result, error, origin \
         FROM tasks WHERE status = 'pending'",
    );

    if let Some(agent) = agent {
        query_builder.push(" AND agent = ");
        query_builder.push_bind(agent.to_string());
    }

    query_builder.push(" ORDER BY priority DESC, created ASC");
    query_builder
}
