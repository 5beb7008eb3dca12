//! Test doubles for the orchestrator workspace.
//!
//! - [`MockStateStore`] - thread-safe in-memory store with error injection
//!   and call tracking
//! - [`ScriptedSession`] - programmable terminal session adapter
//! - [`builders`] - deterministic task and workflow fixtures

pub mod builders;
pub mod session;
pub mod store;

pub use builders::{pending_task, pending_task_with_priority, task_in_state, WorkflowBuilder};
pub use session::{ScriptedCommand, ScriptedSession};
pub use store::MockStateStore;
