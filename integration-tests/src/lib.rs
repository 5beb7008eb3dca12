//! Shared harness for end-to-end orchestrator scenarios.
//!
//! Wires a full stack (store, bus, bridges, workflow engine, recovery) over
//! a [`ScriptedSession`], with millisecond pacing so scenarios run in test
//! time.

use message_bus::MessageBus;
use mocks::{MockStateStore, ScriptedSession};
use orchestrator::{
    BridgeConfig, BridgeManager, RecoveryConfig, RecoveryCoordinator, WorkflowEngine,
};
use orchestrator_core::{
    models::{Task, WorkflowExecution},
    session::SessionAdapter,
    store::StateStore,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Bridge pacing suitable for tests: tight polls, no backoff waits.
pub fn fast_bridge_config() -> BridgeConfig {
    BridgeConfig {
        capture_poll: Duration::from_millis(10),
        stable_samples: 3,
        inter_line_pause: Duration::from_millis(1),
        clear_settle: Duration::from_millis(1),
        flush_wait: Duration::from_millis(5),
        backoff_base_secs: 0,
        backoff_cap_secs: 0,
        ..BridgeConfig::default()
    }
}

/// Fully wired orchestrator over scripted sessions.
pub struct TestHarness {
    pub store: Arc<MockStateStore>,
    pub session: ScriptedSession,
    pub bus: MessageBus,
    pub bridges: Arc<BridgeManager>,
    pub engine: WorkflowEngine,
    pub recovery: RecoveryCoordinator,
}

impl TestHarness {
    /// Build and start the stack for the given `(agent, session)` pairs.
    /// Bridges are started through the recovery pass, exactly as the daemon
    /// does it.
    pub async fn start(agents: &[(&str, &str)]) -> Self {
        Self::start_with_store(agents, Arc::new(MockStateStore::new())).await
    }

    /// Same, but over a pre-seeded store (recovery scenarios).
    pub async fn start_with_store(agents: &[(&str, &str)], store: Arc<MockStateStore>) -> Self {
        let agent_map: HashMap<String, String> = agents
            .iter()
            .map(|(a, s)| (a.to_string(), s.to_string()))
            .collect();

        let session = ScriptedSession::new();
        let sessions: Arc<dyn SessionAdapter> = Arc::new(session.clone());

        let bus = MessageBus::new(store.clone() as Arc<dyn StateStore>);
        bus.start().await.expect("bus starts");

        let bridges = Arc::new(BridgeManager::new(
            agent_map.clone(),
            Arc::clone(&sessions),
            bus.clone(),
            fast_bridge_config(),
        ));
        let engine = WorkflowEngine::new(bus.clone());
        engine.start();

        let recovery = RecoveryCoordinator::new(
            sessions,
            bus.clone(),
            Arc::clone(&bridges),
            engine.clone(),
            RecoveryConfig {
                agents: agent_map,
                stale_task_secs: 300,
                stale_execution_secs: 600,
            },
        );

        recovery.recover().await.expect("startup recovery succeeds");

        Self {
            store,
            session,
            bus,
            bridges,
            engine,
            recovery,
        }
    }

    /// Poll until the task reaches a terminal state.
    pub async fn wait_task_terminal(&self, task_id: &str) -> Task {
        for _ in 0..1000 {
            if let Some(task) = self.store.get_task(task_id).await.expect("store readable") {
                if task.state.is_terminal() {
                    return task;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {task_id} never reached a terminal state");
    }

    /// Poll until the execution reaches a terminal state.
    pub async fn wait_execution_terminal(&self, execution_id: &str) -> WorkflowExecution {
        for _ in 0..1000 {
            let execution = self
                .engine
                .get_execution_status(execution_id)
                .await
                .expect("execution readable");
            if execution.status.is_terminal() {
                return execution;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("execution {execution_id} never reached a terminal state");
    }

    /// Poll until `condition` holds for the execution.
    pub async fn wait_execution<F>(&self, execution_id: &str, mut condition: F) -> WorkflowExecution
    where
        F: FnMut(&WorkflowExecution) -> bool,
    {
        for _ in 0..1000 {
            let execution = self
                .engine
                .get_execution_status(execution_id)
                .await
                .expect("execution readable");
            if condition(&execution) {
                return execution;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("execution {execution_id} never satisfied the condition");
    }

    pub async fn shutdown(self) {
        self.bridges.stop_all().await;
        self.engine.stop();
        self.bus.stop().await.expect("bus stops");
    }
}
