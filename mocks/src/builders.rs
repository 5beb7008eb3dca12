//! Deterministic fixtures for orchestrator tests.

use orchestrator_core::models::{NewTask, Priority, StepSpec, Task, TaskState, WorkflowSpec};
use std::collections::HashMap;

/// Fluent builder for workflow definitions used across test suites.
///
/// ```rust
/// use mocks::WorkflowBuilder;
///
/// let spec = WorkflowBuilder::new("deploy")
///     .step("build", "backend", "make build")
///     .step_after("test", "testing", "make test", &["build"])
///     .build();
/// assert_eq!(spec.steps.len(), 2);
/// ```
#[derive(Debug, Clone)]
pub struct WorkflowBuilder {
    name: String,
    description: String,
    steps: Vec<StepSpec>,
}

impl WorkflowBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            steps: Vec::new(),
        }
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    /// Add a step with no prerequisites.
    pub fn step(self, id: &str, agent: &str, action: &str) -> Self {
        self.step_after(id, agent, action, &[])
    }

    /// Add a step that depends on the given step ids.
    pub fn step_after(mut self, id: &str, agent: &str, action: &str, deps: &[&str]) -> Self {
        self.steps.push(StepSpec {
            id: id.to_string(),
            name: id.to_string(),
            agent: agent.to_string(),
            action: action.to_string(),
            params: HashMap::new(),
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            timeout_secs: None,
            max_retries: None,
        });
        self
    }

    /// Set params on the most recently added step.
    pub fn with_step_param(mut self, name: &str, value: &str) -> Self {
        if let Some(step) = self.steps.last_mut() {
            step.params.insert(name.to_string(), value.to_string());
        }
        self
    }

    /// Set the timeout of the most recently added step.
    pub fn with_step_timeout(mut self, secs: u64) -> Self {
        if let Some(step) = self.steps.last_mut() {
            step.timeout_secs = Some(secs);
        }
        self
    }

    /// Set the retry budget of the most recently added step.
    pub fn with_step_retries(mut self, attempts: u32) -> Self {
        if let Some(step) = self.steps.last_mut() {
            step.max_retries = Some(attempts);
        }
        self
    }

    pub fn build(self) -> WorkflowSpec {
        WorkflowSpec {
            name: self.name,
            description: self.description,
            steps: self.steps,
        }
    }
}

/// A pending task with a fixed id, for store seeding.
pub fn pending_task(id: &str, agent: &str, command: &str) -> Task {
    Task::from_submission(NewTask::new(agent, command).with_id(id))
}

/// A pending task at a given priority.
pub fn pending_task_with_priority(id: &str, agent: &str, command: &str, priority: Priority) -> Task {
    Task::from_submission(
        NewTask::new(agent, command)
            .with_id(id)
            .with_priority(priority),
    )
}

/// A task already in a terminal or running state, for recovery scenarios.
pub fn task_in_state(id: &str, agent: &str, command: &str, state: TaskState) -> Task {
    let mut task = pending_task(id, agent, command);
    task.state = state;
    task
}
