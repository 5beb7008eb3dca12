//! Component construction and lifecycle wiring.
//!
//! The process lifecycle is construct → start → run → stop. Components are
//! built here as explicit dependencies (store → bus → bridges → engine →
//! recovery → watchdog) and shut down in reverse: bridges first so no new
//! tasks are pulled, then the bus with its dispatch queue drained.

use crate::config::Config;
use crate::tmux::TmuxClient;
use anyhow::{Context, Result};
use database::SqliteStateStore;
use message_bus::{sync_handler, MessageBus};
use orchestrator::{BridgeManager, RecoveryCoordinator, Watchdog, WorkflowEngine};
use orchestrator_core::{models::AgentState, session::SessionAdapter, store::StateStore};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

pub struct Components {
    pub store: Arc<SqliteStateStore>,
    pub bus: MessageBus,
    pub bridges: Arc<BridgeManager>,
    pub engine: WorkflowEngine,
    pub recovery: RecoveryCoordinator,
    pub watchdog: Watchdog,
}

/// Make sure the parent directory of a file-backed database exists.
pub fn ensure_database_directory(database_url: &str) -> Result<()> {
    if database_url.contains(":memory:") {
        return Ok(());
    }
    let path = database_url.trim_start_matches("sqlite://");
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create database directory {parent:?}"))?;
        }
    }
    Ok(())
}

/// Construct every component from configuration. Nothing is started yet.
pub async fn build(config: &Config) -> Result<Components> {
    let database_url = config.database_url();
    ensure_database_directory(&database_url)?;

    let store = Arc::new(
        SqliteStateStore::new(&database_url)
            .await
            .context("Failed to open state store")?,
    );
    store.migrate().await.context("Failed to run migrations")?;

    let sessions: Arc<dyn SessionAdapter> = Arc::new(TmuxClient::new());
    let bus = MessageBus::with_separator(
        Arc::clone(&store) as Arc<dyn StateStore>,
        config.subject_separator(),
    );

    let bridges = Arc::new(BridgeManager::new(
        config.agents.clone(),
        Arc::clone(&sessions),
        bus.clone(),
        config.bridge_config(),
    ));
    let engine = WorkflowEngine::new(bus.clone());
    let recovery = RecoveryCoordinator::new(
        Arc::clone(&sessions),
        bus.clone(),
        Arc::clone(&bridges),
        engine.clone(),
        config.recovery_config(),
    );
    let watchdog = Watchdog::new(config.watchdog_config());

    Ok(Components {
        store,
        bus,
        bridges,
        engine,
        recovery,
        watchdog,
    })
}

/// Start everything in dependency order and run the initial recovery pass.
pub async fn start(components: &Components, config: &Config) -> Result<()> {
    components.bus.start().await.context("Failed to start bus")?;
    components.engine.start();

    // recover() verifies sessions, starts bridges and re-queues stale work
    let report = components
        .recovery
        .recover()
        .await
        .context("Initial recovery failed")?;
    tracing::info!(
        tasks_requeued = report.tasks_requeued,
        executions_restarted = report.executions_restarted,
        "Startup recovery finished"
    );

    components.watchdog.start().await;
    wire_watchdog(components, config);

    components
        .store
        .log_event("system.startup", "maestro", Some(&json!({"agents": config.agents.len()})))
        .await
        .ok();
    Ok(())
}

/// Feed agent status traffic into the watchdog and flag silent agents.
fn wire_watchdog(components: &Components, config: &Config) {
    let watchdog = components.watchdog.clone();
    components.bus.subscribe(
        "status:*",
        sync_handler(move |message| {
            if let Some(agent) = message.payload["agent"].as_str() {
                watchdog.reset_timeout(agent);
            }
            Ok(())
        }),
    );

    for agent in config.agents.keys() {
        components.watchdog.reset_timeout(agent);
        let bus = components.bus.clone();
        components.watchdog.register_callback(
            agent,
            Arc::new(move |agent: &str, age| {
                let bus = bus.clone();
                let agent = agent.to_string();
                let age_secs = age.as_secs_f64();
                tokio::spawn(async move {
                    let details = json!({"reason": "heartbeat timeout", "age_seconds": age_secs});
                    if let Err(e) = bus
                        .update_agent_status(&agent, AgentState::Error, None, Some(details))
                        .await
                    {
                        tracing::error!(agent = %agent, "Failed to flag silent agent: {e}");
                    }
                });
            }),
        );
    }
}

/// Stop components in reverse order; the bus drains before closing.
pub async fn shutdown(components: &Components) {
    tracing::info!("Shutting down");
    components.bridges.stop_all().await;
    components.watchdog.stop().await;
    components.engine.stop();
    components
        .store
        .log_event("system.shutdown", "maestro", None)
        .await
        .ok();
    if let Err(e) = components.bus.stop().await {
        tracing::error!("Error stopping bus: {e}");
    }
}
