//! SQLite persistence for orchestrator state.
//!
//! This crate provides [`SqliteStateStore`], the durable implementation of
//! the [`orchestrator_core::store::StateStore`] trait. Tasks, workflow
//! definitions, workflow executions, workflow steps, agent status and the
//! append-only event log all live in one SQLite database so an interrupted
//! run can be recovered.
//!
//! # Example
//!
//! ```rust,no_run
//! use database::SqliteStateStore;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // In-memory database for testing
//! let store = SqliteStateStore::new(":memory:").await?;
//! store.migrate().await?;
//!
//! // File-based database
//! let store = SqliteStateStore::new("sqlite:///var/lib/maestro/state.db").await?;
//! store.migrate().await?;
//! # Ok(())
//! # }
//! ```

pub mod common;
pub mod sqlite;

pub use sqlite::SqliteStateStore;
