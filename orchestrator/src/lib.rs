//! Orchestration runtime: agent bridges, workflow engine, recovery, watchdog.
//!
//! This crate hosts the moving parts of the orchestrator:
//!
//! - [`bridge`] - per-agent state machines that turn queued tasks into
//!   terminal-session writes and observed pane output back into structured
//!   results, with completion detection and retry
//! - [`workflow`] - the DAG engine that turns workflow definitions into
//!   scheduled tasks and consumes their results
//! - [`recovery`] - startup/on-demand reconciliation of live state with the
//!   store
//! - [`watchdog`] - per-agent heartbeat monitoring
//! - [`output`] - task framing markers and pane output parsing
//!
//! The process lifecycle is construct → start → run → stop: build the store,
//! bus, bridges, engine and watchdog, start them in that order, and stop
//! bridges before the bus on shutdown so no new tasks are pulled while the
//! dispatch queue drains.

pub mod bridge;
pub mod output;
pub mod recovery;
pub mod watchdog;
pub mod workflow;

pub use bridge::{AgentBridge, BridgeConfig, BridgeManager};
pub use output::{OutputInspector, END_MARKER_PREFIX, START_MARKER_PREFIX};
pub use recovery::{HealthReport, RecoveryConfig, RecoveryCoordinator, RecoveryReport};
pub use watchdog::{Watchdog, WatchdogConfig, WatchdogStatus};
pub use workflow::WorkflowEngine;
