//! In-process message bus for the orchestrator.
//!
//! The bus carries tasks, results, agent status and system events between
//! components over string subjects (`tasks:<agent>`, `results:<task_id>`,
//! `events:<topic>`, `status:<agent>`). Subscribers register async callbacks
//! against exact or wildcard patterns; one dispatcher task invokes matching
//! callbacks in publication order, so delivery within a subject is ordered.
//!
//! Task and result publication also side-writes the durable store: a task is
//! recorded `pending` before its message goes out (a store failure fails the
//! call), while a result's store failure is logged and the message still
//! flows (the recovery coordinator reconciles the store later).
//!
//! Delivery is at-least-once within a single process lifetime; messages are
//! not replayed across restarts. Recovery comes from persistence, not from
//! the bus.

use futures::future::BoxFuture;
use futures::FutureExt;
use orchestrator_core::{
    error::{OrchestratorError, Result},
    models::{AgentState, Message, MessageKind, NewTask, Task, TaskResult, TaskState},
    store::StateStore,
    subject, TaskOrigin,
};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Source tag stamped on messages the bus originates itself.
const BUS_SOURCE: &str = "message-bus";

/// Diagnostics ring buffer size.
const MAX_HISTORY: usize = 1000;

/// Async subscriber callback. Invoked once per matching publish; must not
/// block for longer than one dispatch period. Errors are logged and the
/// message is dropped for that subscriber only.
pub type MessageHandler = Arc<dyn Fn(Message) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Wrap a synchronous, non-blocking closure as a [`MessageHandler`].
pub fn sync_handler<F>(f: F) -> MessageHandler
where
    F: Fn(Message) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(move |message| {
        let result = f(message);
        async move { result }.boxed()
    })
}

/// Handle returned by [`MessageBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    id: u64,
    pattern: String,
}

impl SubscriptionHandle {
    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

struct Subscription {
    id: u64,
    pattern: String,
    handler: MessageHandler,
}

struct BusInner {
    store: Arc<dyn StateStore>,
    subscriptions: RwLock<Vec<Subscription>>,
    sender: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    dispatcher: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    history: Mutex<VecDeque<Message>>,
    next_subscription_id: AtomicU64,
    separator: char,
}

/// Central publish/subscribe fabric. Cheap to clone; all clones share one
/// dispatcher and one subscription registry.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    /// Create a bus over the given store with the default `:` separator.
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self::with_separator(store, subject::DEFAULT_SEPARATOR)
    }

    /// Create a bus with a custom subject separator.
    pub fn with_separator(store: Arc<dyn StateStore>, separator: char) -> Self {
        Self {
            inner: Arc::new(BusInner {
                store,
                subscriptions: RwLock::new(Vec::new()),
                sender: Mutex::new(None),
                dispatcher: tokio::sync::Mutex::new(None),
                history: Mutex::new(VecDeque::new()),
                next_subscription_id: AtomicU64::new(1),
                separator,
            }),
        }
    }

    /// Start the dispatcher. Idempotent.
    pub async fn start(&self) -> Result<()> {
        {
            let mut sender = self.lock_sender();
            if sender.is_some() {
                return Ok(());
            }

            let (tx, rx) = mpsc::unbounded_channel();
            *sender = Some(tx);
            drop(sender);

            let inner = Arc::clone(&self.inner);
            let handle = tokio::spawn(dispatch_loop(inner, rx));
            *self.inner.dispatcher.lock().await = Some(handle);
        }

        tracing::info!("Message bus started");
        Ok(())
    }

    /// Stop the dispatcher, draining messages already queued.
    pub async fn stop(&self) -> Result<()> {
        // Dropping the sender closes the channel; the dispatcher drains
        // whatever is queued before exiting.
        self.lock_sender().take();

        if let Some(handle) = self.inner.dispatcher.lock().await.take() {
            handle
                .await
                .map_err(|e| OrchestratorError::Bus(format!("Dispatcher panicked: {e}")))?;
        }

        tracing::info!("Message bus stopped");
        Ok(())
    }

    /// Whether the dispatcher is accepting messages.
    pub fn is_running(&self) -> bool {
        self.lock_sender().is_some()
    }

    /// Register a callback for every message whose subject matches `pattern`
    /// (`*` matches one segment).
    pub fn subscribe(&self, pattern: impl Into<String>, handler: MessageHandler) -> SubscriptionHandle {
        let pattern = pattern.into();
        let id = self.inner.next_subscription_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscriptions
            .write()
            .expect("subscription registry poisoned")
            .push(Subscription {
                id,
                pattern: pattern.clone(),
                handler,
            });
        tracing::debug!(pattern = %pattern, subscription = id, "Subscribed");
        SubscriptionHandle { id, pattern }
    }

    /// Remove a subscription. Unknown handles are ignored.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        self.inner
            .subscriptions
            .write()
            .expect("subscription registry poisoned")
            .retain(|s| s.id != handle.id);
    }

    /// Queue a task for an agent.
    ///
    /// The task is written to the store as `pending` first; a store failure
    /// fails the call and nothing is published. The bus message itself is
    /// best effort.
    ///
    /// # Returns
    /// * `Ok(task_id)` - The (possibly generated) task id
    /// * `Err(OrchestratorError::Validation)` - If the submission is malformed
    /// * `Err(OrchestratorError::Storage)` - If the durable write fails
    pub async fn publish_task(&self, submission: NewTask) -> Result<String> {
        if submission.agent.trim().is_empty() {
            return Err(OrchestratorError::empty_field("agent"));
        }
        if submission.command.trim().is_empty() {
            return Err(OrchestratorError::empty_field("command"));
        }

        let task = Task::from_submission(submission);
        self.inner.store.save_task(&task).await?;

        let correlation_id = match &task.origin {
            Some(TaskOrigin::WorkflowStep { execution_id, .. }) => Some(execution_id.clone()),
            Some(TaskOrigin::Recovery { original_task_id }) => Some(original_task_id.clone()),
            None => None,
        };

        let mut message = Message::new(
            MessageKind::Task,
            BUS_SOURCE,
            &task.agent,
            subject::tasks(&task.agent),
            serde_json::to_value(&task)
                .map_err(|e| OrchestratorError::Internal(format!("Task encoding failed: {e}")))?,
        )
        .with_priority(task.priority);
        if let Some(correlation_id) = correlation_id {
            message = message.with_correlation_id(correlation_id);
        }

        self.publish(message);
        tracing::info!(task_id = %task.id, agent = %task.agent, "Task queued");
        Ok(task.id)
    }

    /// Publish a task's terminal result.
    ///
    /// The terminal state is written to the store first; a store failure here
    /// is logged and the message is still published, leaving reconciliation
    /// to the recovery coordinator.
    pub async fn publish_result(
        &self,
        task_id: &str,
        result: &TaskResult,
        error: Option<&str>,
    ) -> Result<()> {
        let state = if result.success {
            TaskState::Completed
        } else {
            TaskState::Failed
        };

        if let Err(store_error) = self
            .inner
            .store
            .update_task_status(task_id, state, Some(result), error)
            .await
        {
            tracing::error!(
                task_id,
                %store_error,
                "Failed to persist task result; publishing anyway"
            );
        }

        let payload = json!({
            "task_id": task_id,
            "success": result.success,
            "result": result,
            "error": error,
        });

        let message = Message::new(
            MessageKind::Result,
            BUS_SOURCE,
            "*",
            subject::results(task_id),
            payload,
        )
        .with_correlation_id(task_id);
        self.publish(message);
        Ok(())
    }

    /// Record and broadcast an agent's status.
    ///
    /// The store write stamps the heartbeat; a failure is logged and the
    /// status message is still published.
    pub async fn update_agent_status(
        &self,
        agent: &str,
        state: AgentState,
        last_task_id: Option<&str>,
        details: Option<Value>,
    ) -> Result<()> {
        if let Err(store_error) = self
            .inner
            .store
            .update_agent_status(agent, state, last_task_id, details.as_ref())
            .await
        {
            tracing::error!(agent, %store_error, "Failed to persist agent status");
        }

        let payload = json!({
            "agent": agent,
            "status": state,
            "last_task_id": last_task_id,
            "details": details,
        });

        let message = Message::new(
            MessageKind::Status,
            agent,
            "*",
            subject::status(agent),
            payload,
        );
        self.publish(message);
        Ok(())
    }

    /// Broadcast a system event on `events:<topic>`. Not persisted; callers
    /// that need durability log the event themselves.
    pub fn broadcast_event(&self, topic: &str, payload: Value) {
        let message = Message::new(
            MessageKind::Event,
            BUS_SOURCE,
            "*",
            subject::events(topic),
            payload,
        );
        self.publish(message);
    }

    /// Authoritative task state, read from the store.
    pub async fn get_task_status(&self, task_id: &str) -> Result<Option<Task>> {
        self.inner.store.get_task(task_id).await
    }

    /// Pending tasks from the store, optionally filtered by agent.
    pub async fn get_pending_tasks(&self, agent: Option<&str>) -> Result<Vec<Task>> {
        self.inner.store.get_pending_tasks(agent).await
    }

    /// The store this bus writes through.
    pub fn store(&self) -> Arc<dyn StateStore> {
        Arc::clone(&self.inner.store)
    }

    /// Most recent messages seen by the bus, newest last.
    pub fn recent_messages(&self, limit: usize) -> Vec<Message> {
        let history = self.inner.history.lock().expect("history poisoned");
        history
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect()
    }

    /// Enqueue a message for dispatch. Best effort: when the bus is not
    /// running the message is dropped with a warning.
    pub fn publish(&self, message: Message) {
        {
            let mut history = self.inner.history.lock().expect("history poisoned");
            history.push_back(message.clone());
            while history.len() > MAX_HISTORY {
                history.pop_front();
            }
        }

        let sender = self.lock_sender();
        match sender.as_ref() {
            Some(tx) => {
                if tx.send(message).is_err() {
                    tracing::warn!("Dispatcher gone; message dropped");
                }
            }
            None => {
                tracing::warn!("Message bus not running; message dropped");
            }
        }
    }

    fn lock_sender(&self) -> std::sync::MutexGuard<'_, Option<mpsc::UnboundedSender<Message>>> {
        self.inner.sender.lock().expect("sender poisoned")
    }
}

async fn dispatch_loop(inner: Arc<BusInner>, mut rx: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = rx.recv().await {
        // Snapshot matching handlers so the registry lock is not held across
        // handler awaits.
        let handlers: Vec<(u64, MessageHandler)> = {
            let subscriptions = inner
                .subscriptions
                .read()
                .expect("subscription registry poisoned");
            subscriptions
                .iter()
                .filter(|s| {
                    subject::matches_with(&s.pattern, &message.subject, inner.separator)
                })
                .map(|s| (s.id, Arc::clone(&s.handler)))
                .collect()
        };

        for (id, handler) in handlers {
            if let Err(error) = handler(message.clone()).await {
                tracing::warn!(
                    subscription = id,
                    subject = %message.subject,
                    %error,
                    "Subscriber failed; message dropped for this subscriber"
                );
            }
        }
    }
}
