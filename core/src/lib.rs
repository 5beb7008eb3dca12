//! Orchestrator Core Library
//!
//! This crate provides the foundational domain models, business logic, and
//! trait interfaces for the multi-agent orchestration system. All other
//! crates depend on the types and interfaces defined here.
//!
//! # Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`models`] - Core domain models (Task, Workflow, Message, etc.)
//! - [`error`] - Error types and result handling
//! - [`store`] - State store trait for data persistence
//! - [`session`] - Terminal session adapter trait
//! - [`subject`] - Bus subject grammar and wildcard matching
//! - [`template`] - Literal `{name}` command templating
//! - [`validation`] - Workflow definition validation
//!
//! # Example
//!
//! ```rust
//! use orchestrator_core::{NewTask, Priority, WorkflowSpec, WorkflowValidator};
//!
//! let task = NewTask::new("supervisor", "echo {message}")
//!     .with_param("message", "hello")
//!     .with_priority(Priority::High);
//! assert_eq!(task.agent, "supervisor");
//!
//! let spec: WorkflowSpec = serde_json::from_str(
//!     r#"{"name": "noop", "steps": []}"#,
//! ).unwrap();
//! WorkflowValidator::validate(&spec).unwrap();
//! ```

pub mod error;
pub mod models;
pub mod session;
pub mod store;
pub mod subject;
pub mod template;
pub mod validation;

// Re-export commonly used types at the crate root for convenience
pub use error::{ErrorCategory, OrchestratorError, Result};
pub use models::{
    AgentState, AgentStatusRecord, ExecutionState, Message, MessageKind, NewTask, Priority,
    StepSpec, StepState, StepStatus, SystemEvent, Task, TaskOrigin, TaskResult, TaskState,
    Workflow, WorkflowExecution, WorkflowSpec,
};
pub use session::SessionAdapter;
pub use store::{StateStore, StoreStatistics, WorkflowStepRecord};
pub use validation::WorkflowValidator;

/// Current version of the core crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
