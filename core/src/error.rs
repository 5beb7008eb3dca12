use crate::models::{ExecutionState, StepState, TaskState};
use thiserror::Error;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Error types for the orchestration subsystem.
///
/// Each variant maps to a failure category (see [`ErrorCategory`]) which
/// drives retry policy: transport errors and timeouts are retried by the
/// bridge, semantic errors are retried per policy, invalid inputs fail the
/// call synchronously and are never enqueued.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    /// Task, workflow or execution not found by the given identifier
    #[error("Not found: {0}")]
    NotFound(String),

    /// Agent id is not in the configured registry
    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    /// Invalid task state transition attempted
    #[error("Invalid task transition from {0} to {1}")]
    InvalidTransition(TaskState, TaskState),

    /// Invalid step state transition attempted
    #[error("Invalid step transition from {0} to {1}")]
    InvalidStepTransition(StepState, StepState),

    /// Invalid execution state transition attempted
    #[error("Invalid execution transition from {0} to {1}")]
    InvalidExecutionTransition(ExecutionState, ExecutionState),

    /// Malformed input: bad workflow shape, empty field, cycle, unresolved
    /// dependency
    #[error("Validation error: {0}")]
    Validation(String),

    /// Concurrent modification lost the race
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Persistence operation error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Terminal session transport error (missing session, send or capture
    /// failure)
    #[error("Session error: {0}")]
    Session(String),

    /// Error signature matched in captured output
    #[error("Semantic error: {0}")]
    Semantic(String),

    /// Deadline exceeded
    #[error("timeout: {0}")]
    Timeout(String),

    /// Message bus is not running or was shut down
    #[error("Bus error: {0}")]
    Bus(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal system error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failure categories surfaced on task results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Transport,
    Semantic,
    Timeout,
    InvalidInput,
    Storage,
    Internal,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Transport => "transport",
            ErrorCategory::Semantic => "semantic",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::InvalidInput => "invalid_input",
            ErrorCategory::Storage => "storage",
            ErrorCategory::Internal => "internal",
        }
    }
}

impl OrchestratorError {
    /// Create a not found error for a task id
    pub fn task_not_found(id: &str) -> Self {
        Self::NotFound(format!("Task '{id}' not found"))
    }

    /// Create a not found error for a workflow id
    pub fn workflow_not_found(id: &str) -> Self {
        Self::NotFound(format!("Workflow '{id}' not found"))
    }

    /// Create a not found error for an execution id
    pub fn execution_not_found(id: &str) -> Self {
        Self::NotFound(format!("Execution '{id}' not found"))
    }

    /// Create a validation error for an empty field
    pub fn empty_field(field: &str) -> Self {
        Self::Validation(format!("Field '{field}' cannot be empty"))
    }

    /// Create a task state transition error
    pub fn invalid_transition(from: TaskState, to: TaskState) -> Self {
        Self::InvalidTransition(from, to)
    }

    /// Check if this error indicates a not found condition
    pub fn is_not_found(&self) -> bool {
        matches!(self, OrchestratorError::NotFound(_))
    }

    /// Check if this error indicates a validation problem
    pub fn is_validation(&self) -> bool {
        matches!(self, OrchestratorError::Validation(_))
    }

    /// Check if this error indicates a persistence problem
    pub fn is_storage(&self) -> bool {
        matches!(self, OrchestratorError::Storage(_))
    }

    /// Check if this error should be retried by the bridge's retry policy
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Transport | ErrorCategory::Semantic | ErrorCategory::Timeout
        )
    }

    /// Failure category for result payloads and retry decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            OrchestratorError::Session(_) => ErrorCategory::Transport,
            OrchestratorError::Semantic(_) => ErrorCategory::Semantic,
            OrchestratorError::Timeout(_) => ErrorCategory::Timeout,
            OrchestratorError::NotFound(_)
            | OrchestratorError::UnknownAgent(_)
            | OrchestratorError::Validation(_)
            | OrchestratorError::InvalidTransition(_, _)
            | OrchestratorError::InvalidStepTransition(_, _)
            | OrchestratorError::InvalidExecutionTransition(_, _)
            | OrchestratorError::Configuration(_) => ErrorCategory::InvalidInput,
            OrchestratorError::Storage(_) | OrchestratorError::Conflict(_) => {
                ErrorCategory::Storage
            }
            OrchestratorError::Bus(_) | OrchestratorError::Internal(_) => ErrorCategory::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let error = OrchestratorError::task_not_found("t-42");
        assert_eq!(
            error,
            OrchestratorError::NotFound("Task 't-42' not found".to_string())
        );
        assert!(error.is_not_found());

        let error = OrchestratorError::empty_field("agent");
        assert!(error.is_validation());

        let error =
            OrchestratorError::invalid_transition(TaskState::Completed, TaskState::Running);
        assert_eq!(
            error,
            OrchestratorError::InvalidTransition(TaskState::Completed, TaskState::Running)
        );
    }

    #[test]
    fn test_error_display() {
        let error = OrchestratorError::Timeout("task t-1 after 2s".to_string());
        assert_eq!(format!("{error}"), "timeout: task t-1 after 2s");

        let error = OrchestratorError::InvalidTransition(TaskState::Pending, TaskState::Completed);
        assert_eq!(
            format!("{error}"),
            "Invalid task transition from pending to completed"
        );
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(
            OrchestratorError::Session("gone".into()).category(),
            ErrorCategory::Transport
        );
        assert_eq!(
            OrchestratorError::Timeout("t".into()).category(),
            ErrorCategory::Timeout
        );
        assert_eq!(
            OrchestratorError::Validation("v".into()).category(),
            ErrorCategory::InvalidInput
        );
        assert_eq!(
            OrchestratorError::Storage("s".into()).category(),
            ErrorCategory::Storage
        );

        assert!(OrchestratorError::Session("gone".into()).is_retryable());
        assert!(OrchestratorError::Semantic("sig".into()).is_retryable());
        assert!(OrchestratorError::Timeout("t".into()).is_retryable());
        assert!(!OrchestratorError::Validation("v".into()).is_retryable());
    }
}
