//! Per-agent bridge between the message bus and a terminal session.
//!
//! One bridge owns one agent's session (single-writer invariant). It
//! subscribes to `tasks:<agent>`, queues incoming tasks in priority order,
//! frames each command between start/end markers, polls the pane for
//! completion, parses the framed output into a structured result, and
//! publishes it on `results:<task_id>`. Failures are retried with
//! exponential backoff up to the task's retry budget.

use crate::output::{
    end_marker, frame_command, marker_line_present, OutputInspector, DEFAULT_PROMPT_PATTERN,
};
use message_bus::{sync_handler, MessageBus, SubscriptionHandle};
use orchestrator_core::{
    error::{OrchestratorError, Result},
    models::{AgentState, Priority, Task, TaskResult, TaskState},
    session::SessionAdapter,
    subject, template,
};
use serde_json::json;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Tuning knobs for the bridge's session protocol.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Pane poll interval in the completion wait loop
    pub capture_poll: Duration,
    /// Consecutive identical captures that count as stable output
    pub stable_samples: u32,
    /// Pause between lines sent to the session
    pub inter_line_pause: Duration,
    /// Settling pause after the clearing command
    pub clear_settle: Duration,
    /// Pause after the end marker appears, before the authoritative capture
    pub flush_wait: Duration,
    /// Error signature patterns (case-insensitive regexes)
    pub error_signatures: Vec<String>,
    /// Prompt-stripping pattern
    pub prompt_pattern: String,
    /// Exponential backoff base in seconds
    pub backoff_base_secs: u64,
    /// Backoff cap in seconds
    pub backoff_cap_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            capture_poll: Duration::from_millis(500),
            stable_samples: 3,
            inter_line_pause: Duration::from_millis(200),
            clear_settle: Duration::from_millis(500),
            flush_wait: Duration::from_millis(500),
            error_signatures: crate::output::default_error_signatures(),
            prompt_pattern: DEFAULT_PROMPT_PATTERN.to_string(),
            backoff_base_secs: 2,
            backoff_cap_secs: 30,
        }
    }
}

impl BridgeConfig {
    /// Backoff before retry `attempt` (1-based): `min(base^attempt, cap)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .backoff_base_secs
            .saturating_pow(attempt.min(16))
            .min(self.backoff_cap_secs);
        Duration::from_secs(exp)
    }
}

/// One failed execution attempt: what went wrong plus the pane context.
#[derive(Debug)]
struct AttemptFailure {
    error: String,
    output: String,
}

struct QueuedTask {
    priority: Priority,
    seq: u64,
    task: Task,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Max-heap: highest priority first, then earliest arrival
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct BridgeInner {
    agent: String,
    session: String,
    sessions: Arc<dyn SessionAdapter>,
    bus: MessageBus,
    config: BridgeConfig,
    inspector: OutputInspector,
    queue_tx: Mutex<Option<mpsc::UnboundedSender<Task>>>,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    subscription: Mutex<Option<SubscriptionHandle>>,
    running: AtomicBool,
}

/// Bridge between one agent's terminal session and the message bus.
#[derive(Clone)]
pub struct AgentBridge {
    inner: Arc<BridgeInner>,
}

impl AgentBridge {
    /// Build a bridge for `agent` over the session named `session`.
    ///
    /// # Returns
    /// * `Err(OrchestratorError::Configuration)` - If the configured regexes fail to compile
    pub fn new(
        agent: impl Into<String>,
        session: impl Into<String>,
        sessions: Arc<dyn SessionAdapter>,
        bus: MessageBus,
        config: BridgeConfig,
    ) -> Result<Self> {
        let inspector = OutputInspector::new(&config.error_signatures, &config.prompt_pattern)?;
        Ok(Self {
            inner: Arc::new(BridgeInner {
                agent: agent.into(),
                session: session.into(),
                sessions,
                bus,
                config,
                inspector,
                queue_tx: Mutex::new(None),
                worker: tokio::sync::Mutex::new(None),
                subscription: Mutex::new(None),
                running: AtomicBool::new(false),
            }),
        })
    }

    pub fn agent(&self) -> &str {
        &self.inner.agent
    }

    pub fn session(&self) -> &str {
        &self.inner.session
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Start the bridge: ensure the session exists, announce readiness,
    /// subscribe to the agent's task subject and spawn the worker loop.
    pub async fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let inner = &self.inner;
        if !inner.sessions.session_exists(&inner.session).await? {
            inner.sessions.create_session(&inner.session).await?;
            tracing::info!(session = %inner.session, "Created session");
        }

        inner
            .bus
            .update_agent_status(
                &inner.agent,
                AgentState::Ready,
                None,
                Some(json!({"session": inner.session, "bridge": "active"})),
            )
            .await?;

        let (tx, rx) = mpsc::unbounded_channel();
        *inner.queue_tx.lock().expect("queue sender poisoned") = Some(tx.clone());

        let agent = inner.agent.clone();
        let handle = inner.bus.subscribe(
            subject::tasks(&inner.agent),
            sync_handler(move |message| {
                let task: Task = serde_json::from_value(message.payload).map_err(|e| {
                    OrchestratorError::Internal(format!("Malformed task payload: {e}"))
                })?;
                if tx.send(task).is_err() {
                    tracing::warn!(agent = %agent, "Bridge worker gone; task dropped");
                }
                Ok(())
            }),
        );
        *inner.subscription.lock().expect("subscription poisoned") = Some(handle);

        let worker_inner = Arc::clone(&self.inner);
        *inner.worker.lock().await = Some(tokio::spawn(worker_loop(worker_inner, rx)));

        tracing::info!(agent = %inner.agent, session = %inner.session, "Agent bridge started");
        Ok(())
    }

    /// Stop the bridge: unsubscribe, let the in-flight task finish, and mark
    /// the agent stopped. No new tasks are pulled after this returns.
    pub async fn stop(&self) -> Result<()> {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(handle) = self
            .inner
            .subscription
            .lock()
            .expect("subscription poisoned")
            .take()
        {
            self.inner.bus.unsubscribe(&handle);
        }
        self.inner
            .queue_tx
            .lock()
            .expect("queue sender poisoned")
            .take();

        if let Some(worker) = self.inner.worker.lock().await.take() {
            if let Err(e) = worker.await {
                tracing::warn!(agent = %self.inner.agent, "Bridge worker ended abnormally: {e}");
            }
        }

        self.inner
            .bus
            .update_agent_status(
                &self.inner.agent,
                AgentState::Stopped,
                None,
                Some(json!({"session": self.inner.session, "bridge": "inactive"})),
            )
            .await?;

        tracing::info!(agent = %self.inner.agent, "Agent bridge stopped");
        Ok(())
    }
}

async fn worker_loop(inner: Arc<BridgeInner>, mut rx: mpsc::UnboundedReceiver<Task>) {
    let mut heap: BinaryHeap<QueuedTask> = BinaryHeap::new();
    let mut seq: u64 = 0;
    // task id -> dedup window expiry
    let mut seen: HashMap<String, Instant> = HashMap::new();

    loop {
        if heap.is_empty() {
            match rx.recv().await {
                Some(task) => enqueue(&inner, &mut heap, &mut seen, &mut seq, task),
                None => break,
            }
        }
        // Collect everything already queued so priorities compete
        while let Ok(task) = rx.try_recv() {
            enqueue(&inner, &mut heap, &mut seen, &mut seq, task);
        }

        if !inner.running.load(Ordering::SeqCst) {
            break;
        }
        if let Some(next) = heap.pop() {
            execute_task(&inner, next.task).await;
        }
    }
}

fn enqueue(
    inner: &BridgeInner,
    heap: &mut BinaryHeap<QueuedTask>,
    seen: &mut HashMap<String, Instant>,
    seq: &mut u64,
    task: Task,
) {
    let now = Instant::now();
    seen.retain(|_, expiry| *expiry > now);

    if seen.contains_key(&task.id) {
        // At-least-once delivery: duplicates inside the window are dropped
        tracing::debug!(task_id = %task.id, "Duplicate task delivery ignored");
        return;
    }
    let window = task.timeout() + Duration::from_secs(inner.config.backoff_cap_secs);
    seen.insert(task.id.clone(), now + window);

    *seq += 1;
    heap.push(QueuedTask {
        priority: task.priority,
        seq: *seq,
        task,
    });
}

async fn execute_task(inner: &Arc<BridgeInner>, task: Task) {
    let task_id = task.id.clone();
    let command = template::render(&task.command, &task.params);

    if let Err(e) = inner
        .bus
        .update_agent_status(
            &inner.agent,
            AgentState::Busy,
            Some(&task_id),
            Some(json!({"task_id": task_id, "command": truncate(&command, 100)})),
        )
        .await
    {
        tracing::warn!(task_id = %task_id, "Failed to announce busy status: {e}");
    }

    if let Err(e) = inner
        .bus
        .store()
        .update_task_status(&task_id, TaskState::Running, None, None)
        .await
    {
        tracing::warn!(task_id = %task_id, "Failed to mark task running: {e}");
    }

    let started = Instant::now();
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match run_attempt(inner, &task_id, &command, task.timeout()).await {
            Ok(result) => {
                tracing::info!(
                    task_id = %task_id,
                    agent = %inner.agent,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Task completed"
                );
                if let Err(e) = inner.bus.publish_result(&task_id, &result, None).await {
                    tracing::error!(task_id = %task_id, "Failed to publish result: {e}");
                }
                break;
            }
            Err(failure) => {
                if attempt < task.max_retries {
                    let delay = inner.config.backoff_delay(attempt);
                    tracing::warn!(
                        task_id = %task_id,
                        attempt,
                        max_retries = task.max_retries,
                        delay_secs = delay.as_secs(),
                        error = %failure.error,
                        "Task attempt failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }

                tracing::error!(
                    task_id = %task_id,
                    attempts = attempt,
                    error = %failure.error,
                    "Task failed after exhausting retries"
                );
                let error = if attempt > 1 {
                    format!("{} (attempt {attempt} of {})", failure.error, task.max_retries)
                } else {
                    failure.error
                };
                let result = TaskResult::failure(failure.output);
                if let Err(e) = inner
                    .bus
                    .publish_result(&task_id, &result, Some(&error))
                    .await
                {
                    tracing::error!(task_id = %task_id, "Failed to publish failure: {e}");
                }
                break;
            }
        }
    }

    if let Err(e) = inner
        .bus
        .update_agent_status(
            &inner.agent,
            AgentState::Ready,
            Some(&task_id),
            Some(json!({"last_task": task_id})),
        )
        .await
    {
        tracing::warn!(task_id = %task_id, "Failed to announce ready status: {e}");
    }
}

/// Send one framed attempt into the session and wait for its outcome.
async fn run_attempt(
    inner: &BridgeInner,
    task_id: &str,
    command: &str,
    timeout: Duration,
) -> std::result::Result<TaskResult, AttemptFailure> {
    let session = &inner.session;

    let transport = |e: OrchestratorError| AttemptFailure {
        error: format!("session transport failure: {e}"),
        output: String::new(),
    };

    // Clear pane noise before framing
    inner
        .sessions
        .send_command(session, "clear")
        .await
        .map_err(transport)?;
    tokio::time::sleep(inner.config.clear_settle).await;

    // Interactive shells debounce pastes; pace the lines out
    for line in frame_command(task_id, command) {
        inner
            .sessions
            .send_command(session, &line)
            .await
            .map_err(transport)?;
        tokio::time::sleep(inner.config.inter_line_pause).await;
    }

    let pane = wait_for_completion(inner, task_id, timeout).await?;
    Ok(inner.inspector.parse(&pane, task_id))
}

/// Poll the pane until the end marker lands, an error signature appears, or
/// the deadline passes.
async fn wait_for_completion(
    inner: &BridgeInner,
    task_id: &str,
    timeout: Duration,
) -> std::result::Result<String, AttemptFailure> {
    let session = &inner.session;
    let marker = end_marker(task_id);
    let deadline = Instant::now() + timeout;
    let mut last_output: Option<String> = None;
    let mut stable_count: u32 = 0;

    loop {
        if Instant::now() >= deadline {
            let output = last_output.unwrap_or_default();
            return Err(AttemptFailure {
                error: format!(
                    "timeout after {}s waiting for task {task_id}",
                    timeout.as_secs()
                ),
                output,
            });
        }

        let current = inner
            .sessions
            .capture_pane(session)
            .await
            .map_err(|e| AttemptFailure {
                error: format!("session transport failure: {e}"),
                output: last_output.clone().unwrap_or_default(),
            })?;

        // Error short-circuit. Advisory but decisive: an end marker that
        // follows an error line does not turn the attempt into a success.
        if inner.inspector.has_errors(&current) {
            let line = inner
                .inspector
                .first_error_line(&current)
                .unwrap_or("unknown error signature");
            return Err(AttemptFailure {
                error: format!("error detected in output: {line}"),
                output: current,
            });
        }

        // Primary completion: marker present on its own line
        if marker_line_present(&current, &marker) {
            tokio::time::sleep(inner.config.flush_wait).await;
            let authoritative = inner
                .sessions
                .capture_pane(session)
                .await
                .unwrap_or(current);
            return Ok(authoritative);
        }

        // Secondary completion guard against capture jitter: output stable
        // across consecutive samples with the marker present
        if last_output.as_deref() == Some(current.as_str()) {
            stable_count += 1;
            if stable_count >= inner.config.stable_samples
                && marker_line_present(&current, &marker)
            {
                return Ok(current);
            }
        } else {
            stable_count = 0;
            last_output = Some(current);
        }

        tokio::time::sleep(inner.config.capture_poll).await;
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        text.to_string()
    } else {
        let mut end = max;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text[..end].to_string()
    }
}

/// Manages the set of bridges, one per configured agent.
pub struct BridgeManager {
    bridges: tokio::sync::Mutex<HashMap<String, AgentBridge>>,
    sessions: Arc<dyn SessionAdapter>,
    bus: MessageBus,
    config: BridgeConfig,
    /// agent id -> session name
    agents: HashMap<String, String>,
}

impl BridgeManager {
    pub fn new(
        agents: HashMap<String, String>,
        sessions: Arc<dyn SessionAdapter>,
        bus: MessageBus,
        config: BridgeConfig,
    ) -> Self {
        Self {
            bridges: tokio::sync::Mutex::new(HashMap::new()),
            sessions,
            bus,
            config,
            agents,
        }
    }

    /// The configured agent -> session map.
    pub fn agents(&self) -> &HashMap<String, String> {
        &self.agents
    }

    /// Start a bridge for every configured agent. Returns per-agent success.
    pub async fn start_all(&self) -> HashMap<String, bool> {
        let mut results = HashMap::new();
        for agent in self.agents.keys().cloned().collect::<Vec<_>>() {
            let ok = self.ensure_running(&agent).await.is_ok();
            if !ok {
                tracing::error!(agent = %agent, "Failed to start bridge");
            }
            results.insert(agent, ok);
        }
        results
    }

    /// Stop every running bridge.
    pub async fn stop_all(&self) {
        let bridges: Vec<AgentBridge> = self.bridges.lock().await.values().cloned().collect();
        for bridge in bridges {
            if let Err(e) = bridge.stop().await {
                tracing::error!(agent = %bridge.agent(), "Error stopping bridge: {e}");
            }
        }
        self.bridges.lock().await.clear();
    }

    /// Whether the named agent currently has a running bridge.
    pub async fn is_running(&self, agent: &str) -> bool {
        self.bridges
            .lock()
            .await
            .get(agent)
            .map(|b| b.is_running())
            .unwrap_or(false)
    }

    /// Start (or restart) the bridge for one agent.
    ///
    /// # Returns
    /// * `Err(OrchestratorError::UnknownAgent)` - If the agent is not configured
    pub async fn ensure_running(&self, agent: &str) -> Result<()> {
        let session = self
            .agents
            .get(agent)
            .ok_or_else(|| OrchestratorError::UnknownAgent(agent.to_string()))?
            .clone();

        let mut bridges = self.bridges.lock().await;
        if let Some(existing) = bridges.get(agent) {
            if existing.is_running() {
                return Ok(());
            }
        }

        let bridge = AgentBridge::new(
            agent,
            session,
            Arc::clone(&self.sessions),
            self.bus.clone(),
            self.config.clone(),
        )?;
        bridge.start().await?;
        bridges.insert(agent.to_string(), bridge);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mocks::{MockStateStore, ScriptedSession};
    use orchestrator_core::models::NewTask;
    use orchestrator_core::store::StateStore;

    /// Config with millisecond pacing so tests run fast.
    fn fast_config() -> BridgeConfig {
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

    struct Harness {
        bus: MessageBus,
        store: Arc<MockStateStore>,
        session: ScriptedSession,
        bridge: AgentBridge,
    }

    async fn harness() -> Harness {
        let store = Arc::new(MockStateStore::new());
        let bus = MessageBus::new(store.clone() as Arc<dyn StateStore>);
        bus.start().await.unwrap();

        let session = ScriptedSession::new().with_session("claude-supervisor");
        let bridge = AgentBridge::new(
            "supervisor",
            "claude-supervisor",
            Arc::new(session.clone()),
            bus.clone(),
            fast_config(),
        )
        .unwrap();
        bridge.start().await.unwrap();

        Harness {
            bus,
            store,
            session,
            bridge,
        }
    }

    async fn wait_for_terminal(store: &MockStateStore, task_id: &str) -> Task {
        for _ in 0..500 {
            if let Some(task) = store.get_task(task_id).await.unwrap() {
                if task.state.is_terminal() {
                    return task;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {task_id} never reached a terminal state");
    }

    #[tokio::test]
    async fn test_echo_task_completes_with_output() {
        let h = harness().await;

        let task_id = h
            .bus
            .publish_task(NewTask::new("supervisor", "echo 'hello'"))
            .await
            .unwrap();

        let task = wait_for_terminal(&h.store, &task_id).await;
        assert_eq!(task.state, TaskState::Completed);
        let result = task.result.unwrap();
        assert!(result.success);
        assert!(!result.has_errors);
        assert!(result.raw_output.contains("hello"));

        // Framing went out in order: clear, start marker, command, end marker
        let sent = h.session.sent_lines("claude-supervisor");
        assert_eq!(sent[0], "clear");
        assert!(sent[1].contains("TASK_START"));
        assert_eq!(sent[2], "echo 'hello'");
        assert!(sent[3].contains("TASK_END"));

        h.bridge.stop().await.unwrap();
        h.bus.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_parameter_substitution_before_dispatch() {
        let h = harness().await;

        let task_id = h
            .bus
            .publish_task(
                NewTask::new("supervisor", "echo '{greeting}'").with_param("greeting", "ciao"),
            )
            .await
            .unwrap();

        let task = wait_for_terminal(&h.store, &task_id).await;
        assert_eq!(task.state, TaskState::Completed);
        assert!(task.result.unwrap().raw_output.contains("ciao"));

        let sent = h.session.sent_lines("claude-supervisor");
        assert!(sent.iter().any(|l| l == "echo 'ciao'"));

        h.bridge.stop().await.unwrap();
        h.bus.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_error_signature_fails_task_without_retry() {
        let h = harness().await;
        h.session.on_command(
            "this_does_not_exist",
            &["bash: this_does_not_exist: command not found"],
        );

        let task_id = h
            .bus
            .publish_task(NewTask::new("supervisor", "this_does_not_exist").with_max_retries(1))
            .await
            .unwrap();

        let task = wait_for_terminal(&h.store, &task_id).await;
        assert_eq!(task.state, TaskState::Failed);
        assert!(task.error.unwrap().contains("command not found"));

        // max_retries = 1 means exactly one framed attempt
        let sent = h.session.sent_lines("claude-supervisor");
        let attempts = sent.iter().filter(|l| l.contains("TASK_START")).count();
        assert_eq!(attempts, 1);

        h.bridge.stop().await.unwrap();
        h.bus.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_fails_task() {
        let h = harness().await;
        h.session.on_command_blocking("sleep 30");

        let task_id = h
            .bus
            .publish_task(
                NewTask::new("supervisor", "sleep 30")
                    .with_timeout_secs(1)
                    .with_max_retries(1),
            )
            .await
            .unwrap();

        let task = wait_for_terminal(&h.store, &task_id).await;
        assert_eq!(task.state, TaskState::Failed);
        assert!(task.error.unwrap().starts_with("timeout"));

        h.bridge.stop().await.unwrap();
        h.bus.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_transport_failure_retries_then_succeeds() {
        let h = harness().await;
        // First attempt dies on the clearing send; the retry succeeds
        h.session.fail_sends(1);

        let task_id = h
            .bus
            .publish_task(NewTask::new("supervisor", "echo 'retry me'").with_max_retries(3))
            .await
            .unwrap();

        let task = wait_for_terminal(&h.store, &task_id).await;
        assert_eq!(task.state, TaskState::Completed);
        assert!(task.result.unwrap().raw_output.contains("retry me"));

        h.bridge.stop().await.unwrap();
        h.bus.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_delivery_executes_once() {
        let h = harness().await;

        let task_id = h
            .bus
            .publish_task(NewTask::new("supervisor", "echo 'once'").with_id("dup-1"))
            .await
            .unwrap();
        // Simulate at-least-once delivery by re-sending the identical task
        let task = h.store.get_task(&task_id).await.unwrap().unwrap();
        let message = orchestrator_core::models::Message::new(
            orchestrator_core::models::MessageKind::Task,
            "test",
            "supervisor",
            subject::tasks("supervisor"),
            serde_json::to_value(&task).unwrap(),
        );
        h.bus.publish(message);

        wait_for_terminal(&h.store, &task_id).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let sent = h.session.sent_lines("claude-supervisor");
        let attempts = sent
            .iter()
            .filter(|l| l.contains("TASK_START:dup-1"))
            .count();
        assert_eq!(attempts, 1);

        h.bridge.stop().await.unwrap();
        h.bus.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_priority_order_within_queue() {
        let h = harness().await;
        // Occupy the worker so both queued tasks are pending together
        h.session.on_command_slow("make slow", &["slow done"], 3);

        let first = h
            .bus
            .publish_task(NewTask::new("supervisor", "make slow"))
            .await
            .unwrap();
        let low = h
            .bus
            .publish_task(
                NewTask::new("supervisor", "echo 'low'").with_priority(Priority::Low),
            )
            .await
            .unwrap();
        let critical = h
            .bus
            .publish_task(
                NewTask::new("supervisor", "echo 'critical'").with_priority(Priority::Critical),
            )
            .await
            .unwrap();

        wait_for_terminal(&h.store, &first).await;
        wait_for_terminal(&h.store, &low).await;
        wait_for_terminal(&h.store, &critical).await;

        let sent = h.session.sent_lines("claude-supervisor");
        let critical_pos = sent
            .iter()
            .position(|l| l.contains(&format!("TASK_START:{critical}")))
            .unwrap();
        let low_pos = sent
            .iter()
            .position(|l| l.contains(&format!("TASK_START:{low}")))
            .unwrap();
        assert!(
            critical_pos < low_pos,
            "critical task should be framed before the low-priority one"
        );

        h.bridge.stop().await.unwrap();
        h.bus.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_status_ceremony_ready_after_task() {
        let h = harness().await;

        let task_id = h
            .bus
            .publish_task(NewTask::new("supervisor", "echo 'status'"))
            .await
            .unwrap();
        wait_for_terminal(&h.store, &task_id).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let status = h
            .store
            .get_agent_status("supervisor")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.state, AgentState::Ready);
        assert_eq!(status.last_task_id.as_deref(), Some(task_id.as_str()));

        h.bridge.stop().await.unwrap();
        h.bus.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_embedded_marker_in_quoted_line_does_not_complete() {
        let h = harness().await;
        // Output mentions the end marker inside a longer line only; the real
        // marker still arrives afterwards via the framing echo.
        h.session
            .on_command("report", &["note: '### TASK_END:literal' is our marker"]);

        let task_id = h
            .bus
            .publish_task(NewTask::new("supervisor", "report").with_id("literal"))
            .await
            .unwrap();

        let task = wait_for_terminal(&h.store, &task_id).await;
        assert_eq!(task.state, TaskState::Completed);
        let result = task.result.unwrap();
        // The quoted mention survives as ordinary output
        assert!(result.raw_output.contains("is our marker"));

        h.bridge.stop().await.unwrap();
        h.bus.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_sets_agent_stopped() {
        let h = harness().await;
        h.bridge.stop().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let status = h
            .store
            .get_agent_status("supervisor")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.state, AgentState::Stopped);
        assert!(!h.bridge.is_running());

        h.bus.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_manager_starts_and_stops_configured_agents() {
        let store = Arc::new(MockStateStore::new());
        let bus = MessageBus::new(store.clone() as Arc<dyn StateStore>);
        bus.start().await.unwrap();
        let session = ScriptedSession::new();

        let agents: HashMap<String, String> = [
            ("supervisor".to_string(), "claude-supervisor".to_string()),
            ("worker".to_string(), "claude-worker".to_string()),
        ]
        .into();
        let manager = BridgeManager::new(
            agents,
            Arc::new(session.clone()),
            bus.clone(),
            fast_config(),
        );

        let results = manager.start_all().await;
        assert!(results.values().all(|ok| *ok));
        assert!(manager.is_running("supervisor").await);
        assert!(manager.is_running("worker").await);
        // Missing sessions were created on start
        assert_eq!(session.created_sessions().len(), 2);

        assert!(matches!(
            manager.ensure_running("ghost").await,
            Err(OrchestratorError::UnknownAgent(_))
        ));

        manager.stop_all().await;
        assert!(!manager.is_running("supervisor").await);
        bus.stop().await.unwrap();
    }
}
