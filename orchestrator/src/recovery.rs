//! System recovery and reconciliation.
//!
//! On process start and on demand, the recovery coordinator reconciles live
//! state with the store: missing sessions are recreated, the bus and bridges
//! are restarted, stale tasks are re-queued as fresh tasks referencing the
//! original id, and stale workflow executions are failed and re-run.

use crate::bridge::BridgeManager;
use crate::workflow::WorkflowEngine;
use chrono::Utc;
use message_bus::MessageBus;
use orchestrator_core::{
    error::{OrchestratorError, Result},
    models::{ExecutionState, NewTask, Task, TaskOrigin, TaskState},
    session::SessionAdapter,
    store::{StateStore, StoreStatistics},
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

const RECOVERY_SOURCE: &str = "recovery";

/// Recovery thresholds and the expected agent/session topology.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// agent id -> session name
    pub agents: HashMap<String, String>,
    /// Pending/running tasks older than this are re-queued (seconds)
    pub stale_task_secs: u64,
    /// Incomplete executions older than this are failed and re-run (seconds)
    pub stale_execution_secs: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            agents: HashMap::new(),
            stale_task_secs: 300,
            stale_execution_secs: 600,
        }
    }
}

/// Outcome of one `recover()` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// session name -> exists (created if it was missing)
    pub sessions: HashMap<String, bool>,
    pub bus_running: bool,
    /// agent -> bridge running
    pub bridges: HashMap<String, bool>,
    pub tasks_requeued: u32,
    pub tasks_failed: u32,
    pub executions_restarted: u32,
    pub executions_failed: u32,
}

/// Result of a `health_check()` pass.
#[derive(Debug, Clone, Default)]
pub struct HealthReport {
    pub healthy: bool,
    /// session name -> exists
    pub sessions: HashMap<String, bool>,
    pub bus_running: bool,
    pub store_reachable: bool,
    /// Pending tasks older than the stale threshold
    pub stale_tasks: usize,
    pub needs_recovery: bool,
    pub statistics: Option<StoreStatistics>,
}

/// Coordinates recovery across sessions, bus, bridges, tasks and workflows.
pub struct RecoveryCoordinator {
    sessions: Arc<dyn SessionAdapter>,
    store: Arc<dyn StateStore>,
    bus: MessageBus,
    bridges: Arc<BridgeManager>,
    engine: WorkflowEngine,
    config: RecoveryConfig,
}

impl RecoveryCoordinator {
    pub fn new(
        sessions: Arc<dyn SessionAdapter>,
        bus: MessageBus,
        bridges: Arc<BridgeManager>,
        engine: WorkflowEngine,
        config: RecoveryConfig,
    ) -> Self {
        let store = bus.store();
        Self {
            sessions,
            store,
            bus,
            bridges,
            engine,
            config,
        }
    }

    /// Full recovery pass, in dependency order: sessions, bus, bridges,
    /// stale tasks, stale executions.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        tracing::info!("Starting system recovery");
        let mut report = RecoveryReport::default();

        report.sessions = self.recover_sessions().await;
        report.bus_running = self.recover_bus().await;
        report.bridges = self.bridges.start_all().await;
        let (requeued, failed) = self.recover_stale_tasks().await;
        report.tasks_requeued = requeued;
        report.tasks_failed = failed;
        let (restarted, failed) = self.recover_stale_executions().await;
        report.executions_restarted = restarted;
        report.executions_failed = failed;

        self.store
            .log_event(
                "system.recovered",
                RECOVERY_SOURCE,
                Some(&json!({
                    "tasks_requeued": report.tasks_requeued,
                    "executions_restarted": report.executions_restarted,
                })),
            )
            .await
            .ok();
        tracing::info!(
            tasks_requeued = report.tasks_requeued,
            executions_restarted = report.executions_restarted,
            "System recovery complete"
        );
        Ok(report)
    }

    /// Verify every expected session exists, creating missing ones.
    async fn recover_sessions(&self) -> HashMap<String, bool> {
        let mut results = HashMap::new();
        for session in self.config.agents.values() {
            let ok = match self.sessions.session_exists(session).await {
                Ok(true) => true,
                Ok(false) => match self.sessions.create_session(session).await {
                    Ok(()) => {
                        tracing::info!(session = %session, "Recovered session");
                        true
                    }
                    Err(e) => {
                        tracing::error!(session = %session, "Failed to recover session: {e}");
                        false
                    }
                },
                Err(e) => {
                    tracing::error!(session = %session, "Failed to check session: {e}");
                    false
                }
            };
            results.insert(session.clone(), ok);
        }
        results
    }

    async fn recover_bus(&self) -> bool {
        if self.bus.is_running() {
            return true;
        }
        match self.bus.start().await {
            Ok(()) => {
                tracing::info!("Message bus recovered");
                true
            }
            Err(e) => {
                tracing::error!("Failed to recover message bus: {e}");
                false
            }
        }
    }

    /// Re-queue pending and running tasks older than the stale threshold.
    ///
    /// Each stale task gets a successor with a fresh id whose origin carries
    /// `original_task_id`; the original is marked `retried` and is terminal.
    async fn recover_stale_tasks(&self) -> (u32, u32) {
        let mut requeued = 0u32;
        let mut failed = 0u32;

        let mut candidates: Vec<Task> = match self.store.get_pending_tasks(None).await {
            Ok(tasks) => tasks,
            Err(e) => {
                tracing::error!("Failed to read pending tasks: {e}");
                return (0, 1);
            }
        };
        // A bridge that crashed mid-task leaves its task running; those heal
        // on the same path.
        match self.store.get_running_tasks().await {
            Ok(tasks) => candidates.extend(tasks),
            Err(e) => tracing::error!("Failed to read running tasks: {e}"),
        }

        let threshold = chrono::Duration::seconds(self.config.stale_task_secs as i64);
        let now = Utc::now();
        for task in candidates {
            if now - task.created <= threshold {
                continue;
            }
            match self.requeue_task(&task).await {
                Ok(new_id) => {
                    requeued += 1;
                    tracing::info!(
                        original = %task.id,
                        successor = %new_id,
                        "Re-queued stale task"
                    );
                }
                Err(e) => {
                    failed += 1;
                    tracing::error!(task_id = %task.id, "Failed to re-queue stale task: {e}");
                }
            }
        }

        (requeued, failed)
    }

    async fn requeue_task(&self, task: &Task) -> Result<String> {
        let submission = NewTask::new(&task.agent, &task.command)
            .with_params(task.params.clone())
            .with_priority(task.priority)
            .with_timeout_secs(task.timeout_secs)
            .with_max_retries(task.max_retries)
            .with_origin(TaskOrigin::Recovery {
                original_task_id: task.id.clone(),
            });
        let new_id = self.bus.publish_task(submission).await?;

        self.store
            .update_task_status(
                &task.id,
                TaskState::Retried,
                None,
                Some("Task was stale and has been re-queued"),
            )
            .await?;
        Ok(new_id)
    }

    /// Fail incomplete executions older than the stale threshold and start a
    /// fresh run of the same workflow.
    async fn recover_stale_executions(&self) -> (u32, u32) {
        let mut restarted = 0u32;
        let mut failed = 0u32;

        let incomplete = match self.store.get_incomplete_executions().await {
            Ok(executions) => executions,
            Err(e) => {
                tracing::error!("Failed to read incomplete executions: {e}");
                return (0, 1);
            }
        };

        let threshold = chrono::Duration::seconds(self.config.stale_execution_secs as i64);
        let now = Utc::now();
        for execution in incomplete {
            let Some(started) = execution.started else {
                continue;
            };
            if now - started <= threshold {
                continue;
            }

            let outcome = async {
                self.store
                    .update_workflow_execution(
                        &execution.execution_id,
                        ExecutionState::Failed,
                        None,
                        Some("timeout"),
                    )
                    .await?;
                self.engine
                    .execute(&execution.workflow_id, serde_json::Map::new())
                    .await
            }
            .await;

            match outcome {
                Ok(new_execution) => {
                    restarted += 1;
                    tracing::info!(
                        workflow_id = %execution.workflow_id,
                        old_execution = %execution.execution_id,
                        new_execution = %new_execution,
                        "Restarted stale workflow execution"
                    );
                }
                Err(e) => {
                    failed += 1;
                    tracing::error!(
                        execution_id = %execution.execution_id,
                        "Failed to restart stale execution: {e}"
                    );
                }
            }
        }

        (restarted, failed)
    }

    /// Re-queue one failed task on demand.
    ///
    /// # Returns
    /// * `Ok(new_task_id)` - Id of the successor task
    /// * `Err(OrchestratorError::NotFound)` - If the task doesn't exist
    /// * `Err(OrchestratorError::Validation)` - If the task is not failed
    pub async fn retry_failed_task(&self, task_id: &str) -> Result<String> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| OrchestratorError::task_not_found(task_id))?;

        if task.state != TaskState::Failed {
            return Err(OrchestratorError::Validation(format!(
                "Task '{task_id}' is not failed (status: {})",
                task.state
            )));
        }

        let submission = NewTask::new(&task.agent, &task.command)
            .with_params(task.params.clone())
            .with_priority(task.priority)
            .with_timeout_secs(task.timeout_secs)
            .with_max_retries(task.max_retries)
            .with_origin(TaskOrigin::Recovery {
                original_task_id: task.id.clone(),
            });
        let new_id = self.bus.publish_task(submission).await?;
        tracing::info!(original = task_id, successor = %new_id, "Retried failed task");
        Ok(new_id)
    }

    /// Structured health report: session existence, bus, store, stale tasks.
    pub async fn health_check(&self) -> HealthReport {
        let mut report = HealthReport {
            healthy: true,
            ..HealthReport::default()
        };

        for session in self.config.agents.values() {
            let exists = self
                .sessions
                .session_exists(session)
                .await
                .unwrap_or(false);
            if !exists {
                report.healthy = false;
            }
            report.sessions.insert(session.clone(), exists);
        }

        report.bus_running = self.bus.is_running();
        if !report.bus_running {
            report.healthy = false;
        }

        match self.store.health_check().await {
            Ok(()) => {
                report.store_reachable = true;
                report.statistics = self.store.get_statistics().await.ok();
            }
            Err(e) => {
                tracing::error!("Store health check failed: {e}");
                report.store_reachable = false;
                report.healthy = false;
            }
        }

        if let Ok(pending) = self.store.get_pending_tasks(None).await {
            let threshold = chrono::Duration::seconds(self.config.stale_task_secs as i64);
            let now = Utc::now();
            report.stale_tasks = pending
                .iter()
                .filter(|t| now - t.created > threshold)
                .count();
            if report.stale_tasks > 0 {
                report.needs_recovery = true;
            }
        }

        report
    }

    /// Repair only the components the health check reports unhealthy.
    ///
    /// # Returns
    /// * `Ok(true)` - System healthy after (or without) repair
    pub async fn auto_recover(&self) -> Result<bool> {
        let health = self.health_check().await;
        if health.healthy && !health.needs_recovery {
            tracing::info!("System is healthy; no recovery needed");
            return Ok(true);
        }

        tracing::info!("System is unhealthy; starting auto-recovery");

        for (session, exists) in &health.sessions {
            if !exists {
                match self.sessions.create_session(session).await {
                    Ok(()) => tracing::info!(session = %session, "Auto-recovered session"),
                    Err(e) => {
                        tracing::error!(session = %session, "Failed to auto-recover session: {e}")
                    }
                }
            }
        }

        if !health.bus_running {
            if let Err(e) = self.bus.start().await {
                tracing::error!("Failed to auto-recover message bus: {e}");
            }
        }

        if health.needs_recovery {
            self.recover_stale_tasks().await;
        }

        let after = self.health_check().await;
        Ok(after.healthy)
    }
}
