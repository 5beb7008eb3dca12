use crate::common::{
    agent_state_to_string, build_pending_query, execution_state_to_string, row_to_agent_status,
    row_to_event, row_to_step_record, row_to_task, row_to_workflow, sqlx_error_to_store_error,
    step_state_to_string, task_state_to_string,
};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use orchestrator_core::{
    error::{OrchestratorError, Result},
    models::{
        AgentState, AgentStatusRecord, ExecutionState, StepState, SystemEvent, Task, TaskResult,
        TaskState, Workflow, WorkflowExecution,
    },
    store::{StateStore, StoreStatistics, WorkflowStepRecord},
    StepStatus,
};
use serde_json::Value;
use sqlx::{migrate::MigrateDatabase, Row, Sqlite, SqlitePool};
use std::collections::HashMap;

/// SQLite implementation of the StateStore trait
///
/// Provides durable orchestrator state using SQLite with connection pooling,
/// WAL journaling for file-backed databases, and monotone task status
/// transitions enforced with compare-and-set updates.
#[derive(Debug, Clone)]
pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    /// Create a new SQLite store with the given database URL
    ///
    /// # Arguments
    /// * `database_url` - SQLite database URL (file path or `:memory:`)
    ///
    /// # Returns
    /// * `Ok(SqliteStateStore)` - Successfully connected store
    /// * `Err(OrchestratorError::Storage)` - If connection fails
    pub async fn new(database_url: &str) -> Result<Self> {
        let db_url = if database_url.starts_with(":memory:")
            || database_url.starts_with("sqlite://")
        {
            database_url.to_string()
        } else {
            format!("sqlite://{database_url}")
        };

        // Create database if it doesn't exist (for file-based databases)
        if !db_url.contains(":memory:") && !Sqlite::database_exists(&db_url).await.unwrap_or(false)
        {
            match Sqlite::create_database(&db_url).await {
                Ok(_) => tracing::info!("Database created successfully"),
                Err(error) => {
                    tracing::error!("Error creating database: {}", error);
                    return Err(OrchestratorError::Storage(format!(
                        "Failed to create database: {error}"
                    )));
                }
            }
        }

        let connect_options = if db_url.contains(":memory:") {
            sqlx::sqlite::SqliteConnectOptions::new()
                .filename(&db_url)
                .create_if_missing(true)
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Memory)
                .busy_timeout(std::time::Duration::from_secs(5))
                .foreign_keys(true)
        } else {
            sqlx::sqlite::SqliteConnectOptions::new()
                .filename(db_url.replace("sqlite://", ""))
                .create_if_missing(true)
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .busy_timeout(std::time::Duration::from_secs(5))
                .foreign_keys(true)
        };

        let pool = SqlitePool::connect_with(connect_options)
            .await
            .map_err(sqlx_error_to_store_error)?;

        Ok(Self { pool })
    }

    /// Run database migrations
    ///
    /// Applies all pending migrations to bring the schema up to date. Call
    /// after constructing a new store instance.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations/sqlite")
            .run(&self.pool)
            .await
            .map_err(|e| OrchestratorError::Storage(format!("Migration failed: {e}")))?;

        tracing::info!("Database migrations completed successfully");
        Ok(())
    }

    /// Access the underlying pool, primarily for tests that need direct SQL.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn encode_json<T: serde::Serialize>(value: &T, what: &str) -> Result<String> {
        serde_json::to_string(value)
            .map_err(|e| OrchestratorError::Storage(format!("Failed to encode {what}: {e}")))
    }
}

const TASK_COLUMNS: &str = "task_id, agent, command, params, priority, timeout_secs, \
                            max_retries, status, created, started, completed, result, error, origin";

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn save_task(&self, task: &Task) -> Result<()> {
        if task.id.trim().is_empty() {
            return Err(OrchestratorError::empty_field("task_id"));
        }
        if task.agent.trim().is_empty() {
            return Err(OrchestratorError::empty_field("agent"));
        }

        let params = Self::encode_json(&task.params, "task params")?;
        let result = task
            .result
            .as_ref()
            .map(|r| Self::encode_json(r, "task result"))
            .transpose()?;
        let origin = task
            .origin
            .as_ref()
            .map(|o| Self::encode_json(o, "task origin"))
            .transpose()?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO tasks
            (task_id, agent, command, params, priority, timeout_secs, max_retries,
             status, created, started, completed, result, error, origin)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.id)
        .bind(&task.agent)
        .bind(&task.command)
        .bind(params)
        .bind(task.priority.as_i64())
        .bind(task.timeout_secs as i64)
        .bind(task.max_retries as i64)
        .bind(task_state_to_string(task.state))
        .bind(task.created)
        .bind(task.started)
        .bind(task.completed)
        .bind(result)
        .bind(&task.error)
        .bind(origin)
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_store_error)?;

        Ok(())
    }

    async fn update_task_status(
        &self,
        task_id: &str,
        state: TaskState,
        result: Option<&TaskResult>,
        error: Option<&str>,
    ) -> Result<()> {
        let current = self
            .get_task(task_id)
            .await?
            .ok_or_else(|| OrchestratorError::task_not_found(task_id))?;

        if current.state == state {
            return Ok(());
        }
        if current.state.is_terminal() {
            // Terminal states are final; late writers (a bridge finishing a
            // task recovery already retried) are an idempotent no-op.
            tracing::debug!(
                task_id,
                current = %current.state,
                requested = %state,
                "Ignoring status write to terminal task"
            );
            return Ok(());
        }
        if !current.state.can_transition_to(state) {
            return Err(OrchestratorError::invalid_transition(current.state, state));
        }

        let now = Utc::now();
        let started = if state == TaskState::Running {
            Some(now)
        } else {
            None
        };
        let completed = if state.is_terminal() { Some(now) } else { None };
        let result_json = result
            .map(|r| Self::encode_json(r, "task result"))
            .transpose()?;

        // Compare-and-set on the previous status so concurrent writers cannot
        // skip states.
        let updated = sqlx::query(
            r#"
            UPDATE tasks
            SET status = ?,
                started = COALESCE(started, ?),
                completed = COALESCE(?, completed),
                result = COALESCE(?, result),
                error = COALESCE(?, error)
            WHERE task_id = ? AND status = ?
            "#,
        )
        .bind(task_state_to_string(state))
        .bind(started)
        .bind(completed)
        .bind(result_json)
        .bind(error)
        .bind(task_id)
        .bind(task_state_to_string(current.state))
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_store_error)?;

        if updated.rows_affected() == 0 {
            // Lost the race; a terminal winner makes this a no-op.
            let latest = self
                .get_task(task_id)
                .await?
                .ok_or_else(|| OrchestratorError::task_not_found(task_id))?;
            if latest.state.is_terminal() || latest.state == state {
                return Ok(());
            }
            return Err(OrchestratorError::Conflict(format!(
                "Task '{task_id}' was concurrently modified"
            )));
        }

        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        let result = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE task_id = ?"))
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_error_to_store_error)?;

        match result {
            Some(row) => Ok(Some(row_to_task(&row)?)),
            None => Ok(None),
        }
    }

    async fn get_pending_tasks(&self, agent: Option<&str>) -> Result<Vec<Task>> {
        let mut query_builder = build_pending_query(agent);
        let rows = query_builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_error_to_store_error)?;

        rows.iter().map(row_to_task).collect()
    }

    async fn get_running_tasks(&self) -> Result<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status = 'running' ORDER BY created ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(sqlx_error_to_store_error)?;

        rows.iter().map(row_to_task).collect()
    }

    async fn save_workflow(&self, workflow: &Workflow) -> Result<()> {
        if workflow.id.trim().is_empty() {
            return Err(OrchestratorError::empty_field("workflow_id"));
        }
        if workflow.name.trim().is_empty() {
            return Err(OrchestratorError::empty_field("name"));
        }

        let definition = Self::encode_json(&workflow.steps, "workflow definition")?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO workflows (workflow_id, name, description, definition, created)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&workflow.id)
        .bind(&workflow.name)
        .bind(&workflow.description)
        .bind(definition)
        .bind(workflow.created)
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_store_error)?;

        Ok(())
    }

    async fn get_workflow(&self, workflow_id: &str) -> Result<Option<Workflow>> {
        let result = sqlx::query(
            "SELECT workflow_id, name, description, definition, created FROM workflows WHERE workflow_id = ?",
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(sqlx_error_to_store_error)?;

        match result {
            Some(row) => Ok(Some(row_to_workflow(&row)?)),
            None => Ok(None),
        }
    }

    async fn save_workflow_execution(&self, execution: &WorkflowExecution) -> Result<()> {
        let context = Self::encode_json(&execution.context, "execution context")?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO workflow_executions
            (execution_id, workflow_id, status, started, completed, context, error)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&execution.execution_id)
        .bind(&execution.workflow_id)
        .bind(execution_state_to_string(execution.status))
        .bind(execution.started)
        .bind(execution.completed)
        .bind(context)
        .bind(&execution.error)
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_store_error)?;

        Ok(())
    }

    async fn update_workflow_execution(
        &self,
        execution_id: &str,
        status: ExecutionState,
        context: Option<&serde_json::Map<String, Value>>,
        error: Option<&str>,
    ) -> Result<()> {
        let completed = if status.is_terminal() {
            Some(Utc::now())
        } else {
            None
        };
        let context_json = context
            .map(|c| Self::encode_json(c, "execution context"))
            .transpose()?;

        let updated = sqlx::query(
            r#"
            UPDATE workflow_executions
            SET status = ?,
                completed = COALESCE(?, completed),
                context = COALESCE(?, context),
                error = COALESCE(?, error)
            WHERE execution_id = ?
            "#,
        )
        .bind(execution_state_to_string(status))
        .bind(completed)
        .bind(context_json)
        .bind(error)
        .bind(execution_id)
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_store_error)?;

        if updated.rows_affected() == 0 {
            return Err(OrchestratorError::execution_not_found(execution_id));
        }

        Ok(())
    }

    async fn get_workflow_execution(
        &self,
        execution_id: &str,
    ) -> Result<Option<WorkflowExecution>> {
        let row = sqlx::query(
            "SELECT execution_id, workflow_id, status, started, completed, context, error \
             FROM workflow_executions WHERE execution_id = ?",
        )
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(sqlx_error_to_store_error)?;

        let Some(row) = row else { return Ok(None) };
        Ok(Some(self.assemble_execution(&row).await?))
    }

    async fn get_incomplete_executions(&self) -> Result<Vec<WorkflowExecution>> {
        let rows = sqlx::query(
            "SELECT execution_id, workflow_id, status, started, completed, context, error \
             FROM workflow_executions WHERE status IN ('pending', 'running') \
             ORDER BY started ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(sqlx_error_to_store_error)?;

        let mut executions = Vec::with_capacity(rows.len());
        for row in &rows {
            executions.push(self.assemble_execution(row).await?);
        }
        Ok(executions)
    }

    async fn save_workflow_step(&self, step: &WorkflowStepRecord) -> Result<()> {
        let result = step
            .result
            .as_ref()
            .map(|r| Self::encode_json(r, "step result"))
            .transpose()?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO workflow_steps
            (step_id, execution_id, name, agent, action, status, task_id, started, completed, result, error)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&step.step_id)
        .bind(&step.execution_id)
        .bind(&step.name)
        .bind(&step.agent)
        .bind(&step.action)
        .bind(step_state_to_string(step.status))
        .bind(&step.task_id)
        .bind(step.started)
        .bind(step.completed)
        .bind(result)
        .bind(&step.error)
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_store_error)?;

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
        let now = Utc::now();
        let started = if status == StepState::Running {
            Some(now)
        } else {
            None
        };
        let completed = if status.is_terminal() { Some(now) } else { None };
        let result_json = result
            .map(|r| Self::encode_json(r, "step result"))
            .transpose()?;

        let updated = sqlx::query(
            r#"
            UPDATE workflow_steps
            SET status = ?,
                started = COALESCE(started, ?),
                completed = COALESCE(?, completed),
                result = COALESCE(?, result),
                error = COALESCE(?, error)
            WHERE step_id = ? AND execution_id = ?
            "#,
        )
        .bind(step_state_to_string(status))
        .bind(started)
        .bind(completed)
        .bind(result_json)
        .bind(error)
        .bind(step_id)
        .bind(execution_id)
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_store_error)?;

        if updated.rows_affected() == 0 {
            return Err(OrchestratorError::NotFound(format!(
                "Step '{step_id}' of execution '{execution_id}' not found"
            )));
        }

        Ok(())
    }

    async fn get_execution_steps(&self, execution_id: &str) -> Result<Vec<WorkflowStepRecord>> {
        let rows = sqlx::query(
            "SELECT step_id, execution_id, name, agent, action, status, task_id, started, \
             completed, result, error FROM workflow_steps WHERE execution_id = ? ORDER BY step_id ASC",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(sqlx_error_to_store_error)?;

        rows.iter().map(row_to_step_record).collect()
    }

    async fn update_agent_status(
        &self,
        agent: &str,
        state: AgentState,
        last_task_id: Option<&str>,
        details: Option<&Value>,
    ) -> Result<()> {
        if agent.trim().is_empty() {
            return Err(OrchestratorError::empty_field("agent"));
        }

        let details = details
            .map(|d| Self::encode_json(d, "agent details"))
            .transpose()?
            .unwrap_or_else(|| "{}".to_string());

        sqlx::query(
            r#"
            INSERT INTO agent_status (agent, status, last_task_id, last_heartbeat, details)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(agent) DO UPDATE SET
                status = excluded.status,
                last_task_id = COALESCE(excluded.last_task_id, agent_status.last_task_id),
                last_heartbeat = excluded.last_heartbeat,
                details = excluded.details
            "#,
        )
        .bind(agent)
        .bind(agent_state_to_string(state))
        .bind(last_task_id)
        .bind(Utc::now())
        .bind(details)
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_store_error)?;

        Ok(())
    }

    async fn get_agent_status(&self, agent: &str) -> Result<Option<AgentStatusRecord>> {
        let result = sqlx::query(
            "SELECT agent, status, last_task_id, last_heartbeat, details \
             FROM agent_status WHERE agent = ?",
        )
        .bind(agent)
        .fetch_optional(&self.pool)
        .await
        .map_err(sqlx_error_to_store_error)?;

        match result {
            Some(row) => Ok(Some(row_to_agent_status(&row)?)),
            None => Ok(None),
        }
    }

    async fn log_event(&self, event_type: &str, source: &str, data: Option<&Value>) -> Result<()> {
        let data = data
            .map(|d| Self::encode_json(d, "event data"))
            .transpose()?
            .unwrap_or_else(|| "{}".to_string());

        sqlx::query(
            "INSERT INTO events (event_type, source, timestamp, data) VALUES (?, ?, ?, ?)",
        )
        .bind(event_type)
        .bind(source)
        .bind(Utc::now())
        .bind(data)
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_store_error)?;

        Ok(())
    }

    async fn get_recent_events(
        &self,
        limit: u32,
        event_type: Option<&str>,
    ) -> Result<Vec<SystemEvent>> {
        let mut query_builder: sqlx::QueryBuilder<'_, sqlx::Sqlite> = sqlx::QueryBuilder::new(
            "SELECT event_id, event_type, source, timestamp, data FROM events",
        );

        if let Some(event_type) = event_type {
            query_builder.push(" WHERE event_type = ");
            query_builder.push_bind(event_type.to_string());
        }

        query_builder.push(" ORDER BY event_id DESC LIMIT ");
        query_builder.push_bind(limit as i64);

        let rows = query_builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_error_to_store_error)?;

        rows.iter().map(row_to_event).collect()
    }

    async fn cleanup_old_data(&self, days_to_keep: u32) -> Result<u64> {
        let cutoff = Utc::now() - ChronoDuration::days(days_to_keep as i64);

        let tasks = sqlx::query(
            "DELETE FROM tasks WHERE status IN ('completed', 'failed', 'retried', 'cancelled') \
             AND completed < ?",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_store_error)?;

        let events = sqlx::query("DELETE FROM events WHERE timestamp < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(sqlx_error_to_store_error)?;

        sqlx::query("VACUUM")
            .execute(&self.pool)
            .await
            .map_err(sqlx_error_to_store_error)?;

        let removed = tasks.rows_affected() + events.rows_affected();
        tracing::info!(days_to_keep, removed, "Cleaned up old data");
        Ok(removed)
    }

    async fn get_statistics(&self) -> Result<StoreStatistics> {
        // All four aggregate queries run concurrently
        let (task_rows, execution_rows, agent_rows, events_row) = tokio::join!(
            sqlx::query("SELECT status, COUNT(*) as count FROM tasks GROUP BY status")
                .fetch_all(&self.pool),
            sqlx::query(
                "SELECT status, COUNT(*) as count FROM workflow_executions GROUP BY status"
            )
            .fetch_all(&self.pool),
            sqlx::query("SELECT status, COUNT(*) as count FROM agent_status GROUP BY status")
                .fetch_all(&self.pool),
            sqlx::query("SELECT COUNT(*) as count FROM events WHERE timestamp > ?")
                .bind(Utc::now() - ChronoDuration::hours(1))
                .fetch_one(&self.pool)
        );

        let task_rows = task_rows.map_err(sqlx_error_to_store_error)?;
        let execution_rows = execution_rows.map_err(sqlx_error_to_store_error)?;
        let agent_rows = agent_rows.map_err(sqlx_error_to_store_error)?;
        let events_row = events_row.map_err(sqlx_error_to_store_error)?;

        let count_map = |rows: Vec<sqlx::sqlite::SqliteRow>| -> HashMap<String, u64> {
            rows.into_iter()
                .map(|row| {
                    let status: String = row.get("status");
                    let count: i64 = row.get("count");
                    (status, count as u64)
                })
                .collect()
        };

        let recent: i64 = events_row.get("count");

        Ok(StoreStatistics {
            tasks_by_status: count_map(task_rows),
            executions_by_status: count_map(execution_rows),
            agents_by_status: count_map(agent_rows),
            recent_events: recent as u64,
        })
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(sqlx_error_to_store_error)?;

        Ok(())
    }
}

impl SqliteStateStore {
    /// Rebuild a WorkflowExecution from its execution row plus step rows.
    async fn assemble_execution(&self, row: &sqlx::sqlite::SqliteRow) -> Result<WorkflowExecution> {
        use crate::common::string_to_execution_state;

        let execution_id: String = row.get("execution_id");
        let status: String = row.get("status");
        let context: Option<String> = row.get("context");
        let context = match context {
            Some(text) if !text.is_empty() => serde_json::from_str(&text).map_err(|e| {
                OrchestratorError::Storage(format!("Corrupt execution context: {e}"))
            })?,
            _ => serde_json::Map::new(),
        };

        let steps = self
            .get_execution_steps(&execution_id)
            .await?
            .into_iter()
            .map(|record| {
                (
                    record.step_id,
                    StepStatus {
                        state: record.status,
                        task_id: record.task_id,
                        result: record.result,
                        error: record.error,
                        started: record.started,
                        completed: record.completed,
                    },
                )
            })
            .collect();

        Ok(WorkflowExecution {
            execution_id,
            workflow_id: row.get("workflow_id"),
            status: string_to_execution_state(&status)?,
            steps,
            context,
            started: row.get("started"),
            completed: row.get("completed"),
            error: row.get("error"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_core::models::NewTask;

    async fn create_test_store() -> SqliteStateStore {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let thread_id = std::thread::current().id();
        let db_name = format!(":memory:test_{timestamp}_{thread_id:?}");
        let store = SqliteStateStore::new(&db_name).await.unwrap();
        store.migrate().await.unwrap();
        store
    }

    fn pending_task(id: &str, agent: &str) -> Task {
        Task::from_submission(NewTask::new(agent, "echo hello").with_id(id))
    }

    #[tokio::test]
    async fn test_store_creation() {
        let store = create_test_store().await;
        assert!(store.health_check().await.is_ok());
    }

    #[tokio::test]
    async fn test_save_and_get_task() {
        let store = create_test_store().await;
        let task = pending_task("t-1", "supervisor");
        store.save_task(&task).await.unwrap();

        let loaded = store.get_task("t-1").await.unwrap().unwrap();
        assert_eq!(loaded.id, "t-1");
        assert_eq!(loaded.agent, "supervisor");
        assert_eq!(loaded.state, TaskState::Pending);
        assert!(loaded.completed.is_none());

        assert!(store.get_task("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_task_status_transitions() {
        let store = create_test_store().await;
        store.save_task(&pending_task("t-1", "supervisor")).await.unwrap();

        store
            .update_task_status("t-1", TaskState::Running, None, None)
            .await
            .unwrap();
        let running = store.get_task("t-1").await.unwrap().unwrap();
        assert_eq!(running.state, TaskState::Running);
        assert!(running.started.is_some());

        let result = TaskResult {
            raw_output: "hello".to_string(),
            lines: vec!["hello".to_string()],
            success: true,
            has_errors: false,
            structured_data: None,
        };
        store
            .update_task_status("t-1", TaskState::Completed, Some(&result), None)
            .await
            .unwrap();
        let done = store.get_task("t-1").await.unwrap().unwrap();
        assert_eq!(done.state, TaskState::Completed);
        assert!(done.completed.is_some());
        assert_eq!(done.result.unwrap().raw_output, "hello");
    }

    #[tokio::test]
    async fn test_invalid_transition_rejected() {
        let store = create_test_store().await;
        store.save_task(&pending_task("t-1", "supervisor")).await.unwrap();

        // pending cannot jump straight to completed
        let result = store
            .update_task_status("t-1", TaskState::Completed, None, None)
            .await;
        match result.unwrap_err() {
            OrchestratorError::InvalidTransition(from, to) => {
                assert_eq!(from, TaskState::Pending);
                assert_eq!(to, TaskState::Completed);
            }
            other => panic!("Expected InvalidTransition, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_terminal_status_writes_are_idempotent() {
        let store = create_test_store().await;
        store.save_task(&pending_task("t-1", "supervisor")).await.unwrap();
        store
            .update_task_status("t-1", TaskState::Running, None, None)
            .await
            .unwrap();
        store
            .update_task_status("t-1", TaskState::Failed, None, Some("boom"))
            .await
            .unwrap();

        // Repeating the terminal write, or writing a different terminal
        // state, is a no-op rather than an error.
        store
            .update_task_status("t-1", TaskState::Failed, None, Some("boom again"))
            .await
            .unwrap();
        store
            .update_task_status("t-1", TaskState::Completed, None, None)
            .await
            .unwrap();

        let task = store.get_task("t-1").await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Failed);
        assert_eq!(task.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_pending_tasks_ordering() {
        use orchestrator_core::models::Priority;

        let store = create_test_store().await;

        let mut low = pending_task("t-low", "supervisor");
        low.priority = Priority::Low;
        let mut critical = pending_task("t-critical", "supervisor");
        critical.priority = Priority::Critical;
        let mut normal_old = pending_task("t-normal-old", "supervisor");
        normal_old.priority = Priority::Normal;
        let mut normal_new = pending_task("t-normal-new", "supervisor");
        normal_new.priority = Priority::Normal;
        normal_new.created = normal_old.created + ChronoDuration::seconds(5);

        for task in [&low, &critical, &normal_old, &normal_new] {
            store.save_task(task).await.unwrap();
        }

        let pending = store.get_pending_tasks(None).await.unwrap();
        let ids: Vec<&str> = pending.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["t-critical", "t-normal-old", "t-normal-new", "t-low"]);

        // agent filter
        store
            .save_task(&pending_task("t-other", "worker"))
            .await
            .unwrap();
        let filtered = store.get_pending_tasks(Some("worker")).await.unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].id, "t-other");
    }

    #[tokio::test]
    async fn test_workflow_round_trip() {
        use orchestrator_core::models::StepSpec;
        use std::collections::HashMap;

        let store = create_test_store().await;
        let workflow = Workflow {
            id: "wf-1".to_string(),
            name: "deploy".to_string(),
            description: "deploy pipeline".to_string(),
            steps: vec![StepSpec {
                id: "build".to_string(),
                name: "Build".to_string(),
                agent: "backend".to_string(),
                action: "make build".to_string(),
                params: HashMap::new(),
                depends_on: vec![],
                timeout_secs: Some(60),
                max_retries: None,
            }],
            created: Utc::now(),
        };

        store.save_workflow(&workflow).await.unwrap();
        let loaded = store.get_workflow("wf-1").await.unwrap().unwrap();
        assert_eq!(loaded.name, "deploy");
        assert_eq!(loaded.steps.len(), 1);
        assert_eq!(loaded.steps[0].id, "build");
        assert_eq!(loaded.steps[0].timeout_secs, Some(60));
    }

    #[tokio::test]
    async fn test_execution_and_steps_round_trip() {
        use orchestrator_core::models::StepSpec;
        use std::collections::HashMap;

        let store = create_test_store().await;
        let workflow = Workflow {
            id: "wf-1".to_string(),
            name: "two-step".to_string(),
            description: String::new(),
            steps: vec![
                StepSpec {
                    id: "s1".to_string(),
                    name: "One".to_string(),
                    agent: "supervisor".to_string(),
                    action: "echo one".to_string(),
                    params: HashMap::new(),
                    depends_on: vec![],
                    timeout_secs: None,
                    max_retries: None,
                },
                StepSpec {
                    id: "s2".to_string(),
                    name: "Two".to_string(),
                    agent: "worker".to_string(),
                    action: "echo two".to_string(),
                    params: HashMap::new(),
                    depends_on: vec!["s1".to_string()],
                    timeout_secs: None,
                    max_retries: None,
                },
            ],
            created: Utc::now(),
        };
        store.save_workflow(&workflow).await.unwrap();

        let execution = WorkflowExecution::start(&workflow, serde_json::Map::new());
        let execution_id = execution.execution_id.clone();
        store.save_workflow_execution(&execution).await.unwrap();
        for step in &workflow.steps {
            store
                .save_workflow_step(&WorkflowStepRecord {
                    step_id: step.id.clone(),
                    execution_id: execution_id.clone(),
                    name: step.name.clone(),
                    agent: step.agent.clone(),
                    action: step.action.clone(),
                    status: StepState::Pending,
                    task_id: None,
                    started: None,
                    completed: None,
                    result: None,
                    error: None,
                })
                .await
                .unwrap();
        }

        store
            .update_workflow_step(&execution_id, "s1", StepState::Running, None, None)
            .await
            .unwrap();
        let result = TaskResult {
            raw_output: "one".to_string(),
            lines: vec!["one".to_string()],
            success: true,
            has_errors: false,
            structured_data: None,
        };
        store
            .update_workflow_step(&execution_id, "s1", StepState::Completed, Some(&result), None)
            .await
            .unwrap();

        let loaded = store
            .get_workflow_execution(&execution_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.status, ExecutionState::Running);
        assert_eq!(loaded.steps.len(), 2);
        assert_eq!(loaded.steps["s1"].state, StepState::Completed);
        assert!(loaded.steps["s1"].completed.is_some());
        assert_eq!(loaded.steps["s2"].state, StepState::Pending);

        // incomplete executions include it until terminal
        let incomplete = store.get_incomplete_executions().await.unwrap();
        assert_eq!(incomplete.len(), 1);

        store
            .update_workflow_execution(&execution_id, ExecutionState::Completed, None, None)
            .await
            .unwrap();
        assert!(store.get_incomplete_executions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_agent_status_upsert() {
        let store = create_test_store().await;

        store
            .update_agent_status("supervisor", AgentState::Ready, None, None)
            .await
            .unwrap();
        let first = store.get_agent_status("supervisor").await.unwrap().unwrap();
        assert_eq!(first.state, AgentState::Ready);
        assert!(first.last_task_id.is_none());

        store
            .update_agent_status("supervisor", AgentState::Busy, Some("t-1"), None)
            .await
            .unwrap();
        let second = store.get_agent_status("supervisor").await.unwrap().unwrap();
        assert_eq!(second.state, AgentState::Busy);
        assert_eq!(second.last_task_id.as_deref(), Some("t-1"));
        assert!(second.last_heartbeat >= first.last_heartbeat);
    }

    #[tokio::test]
    async fn test_event_log_append_and_query() {
        let store = create_test_store().await;

        store
            .log_event("task.created", "bus", Some(&serde_json::json!({"task_id": "t-1"})))
            .await
            .unwrap();
        store.log_event("system.startup", "daemon", None).await.unwrap();

        let all = store.get_recent_events(10, None).await.unwrap();
        assert_eq!(all.len(), 2);
        // newest first
        assert_eq!(all[0].event_type, "system.startup");
        assert!(all[0].id > all[1].id);

        let filtered = store
            .get_recent_events(10, Some("task.created"))
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].data["task_id"], "t-1");
    }

    #[tokio::test]
    async fn test_statistics() {
        let store = create_test_store().await;
        store.save_task(&pending_task("t-1", "supervisor")).await.unwrap();
        store.save_task(&pending_task("t-2", "worker")).await.unwrap();
        store
            .update_agent_status("supervisor", AgentState::Ready, None, None)
            .await
            .unwrap();
        store.log_event("test", "tests", None).await.unwrap();

        let stats = store.get_statistics().await.unwrap();
        assert_eq!(stats.tasks_by_status.get("pending"), Some(&2));
        assert_eq!(stats.agents_by_status.get("ready"), Some(&1));
        assert_eq!(stats.recent_events, 1);
    }

    #[tokio::test]
    async fn test_cleanup_old_data() {
        let store = create_test_store().await;

        let mut old_task = pending_task("t-old", "supervisor");
        old_task.state = TaskState::Completed;
        old_task.completed = Some(Utc::now() - ChronoDuration::days(40));
        store.save_task(&old_task).await.unwrap();

        let mut fresh_task = pending_task("t-fresh", "supervisor");
        fresh_task.state = TaskState::Completed;
        fresh_task.completed = Some(Utc::now());
        store.save_task(&fresh_task).await.unwrap();

        let removed = store.cleanup_old_data(30).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_task("t-old").await.unwrap().is_none());
        assert!(store.get_task("t-fresh").await.unwrap().is_some());
    }
}
