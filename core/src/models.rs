use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

/// Default task timeout in seconds (5 minutes).
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 300;

/// Default maximum number of execution attempts per task.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// One dispatch of one command to one agent; the atomic unit of retry.
///
/// A task is created by the message bus (which assigns an id when the caller
/// did not supply one), delivered to exactly one agent bridge over the
/// `tasks:<agent>` subject, executed in that agent's terminal session, and
/// closed by a terminal result on `results:<task_id>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    /// Unique task id (caller-supplied or generated v4 UUID)
    pub id: String,
    /// Target agent id
    pub agent: String,
    /// Command template; `{name}` placeholders are substituted from `params`
    pub command: String,
    /// Parameters used to render the command before dispatch
    #[serde(default)]
    pub params: HashMap<String, String>,
    /// Dispatch priority
    #[serde(default)]
    pub priority: Priority,
    /// Execution deadline in seconds
    pub timeout_secs: u64,
    /// Maximum execution attempts before the failure is surfaced
    pub max_retries: u32,
    /// Current lifecycle state
    pub state: TaskState,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed: Option<DateTime<Utc>>,
    /// Structured output, present once the task reaches a terminal state
    #[serde(default)]
    pub result: Option<TaskResult>,
    /// Failure text, present iff the task failed
    #[serde(default)]
    pub error: Option<String>,
    /// Where this task came from, if anywhere noteworthy
    #[serde(default)]
    pub origin: Option<TaskOrigin>,
}

impl Task {
    /// Build a pending task from a submission, generating an id if absent.
    pub fn from_submission(submission: NewTask) -> Self {
        Self {
            id: submission
                .id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            agent: submission.agent,
            command: submission.command,
            params: submission.params,
            priority: submission.priority,
            timeout_secs: submission.timeout_secs,
            max_retries: submission.max_retries,
            state: TaskState::Pending,
            created: Utc::now(),
            started: None,
            completed: None,
            result: None,
            error: None,
            origin: submission.origin,
        }
    }

    /// Execution deadline as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Whether the task may move from its current state to `next`.
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        self.state.can_transition_to(next)
    }
}

/// Task lifecycle states.
///
/// Tasks transition only forward: `Pending → Running → terminal`, where the
/// terminal states are `Completed`, `Failed`, `Retried` and `Cancelled`.
/// `Retried` means a successor task with a fresh id was spawned; the original
/// id never leaves that state.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
    Retried,
    Cancelled,
}

impl TaskState {
    /// Valid transitions per the task state machine.
    ///
    /// A pending task may be cancelled or swept into `Retried` by recovery
    /// without ever running.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Retried)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Retried)
                | (Running, Cancelled)
        )
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskState::Pending | TaskState::Running)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Retried => "retried",
            TaskState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Dispatch priority. Orders pending work: higher priorities are delivered
/// first; within one priority, arrival order wins.
#[derive(
    Debug, Clone, Copy, Default, Hash, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    /// Integer form used for the database column and wire payloads.
    pub fn as_i64(self) -> i64 {
        match self {
            Priority::Low => 1,
            Priority::Normal => 2,
            Priority::High => 3,
            Priority::Critical => 4,
        }
    }

    /// Inverse of [`Priority::as_i64`]; out-of-range values clamp to `Normal`.
    pub fn from_i64(value: i64) -> Self {
        match value {
            1 => Priority::Low,
            3 => Priority::High,
            4 => Priority::Critical,
            _ => Priority::Normal,
        }
    }
}

/// Why a task exists, when it was not submitted directly by a caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TaskOrigin {
    /// Emitted by the workflow engine for a step of an execution
    WorkflowStep {
        execution_id: String,
        step_id: String,
    },
    /// Recovery successor of a stale task
    Recovery { original_task_id: String },
}

/// Submission DTO for creating a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewTask {
    pub agent: String,
    pub command: String,
    #[serde(default)]
    pub params: HashMap<String, String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Caller-supplied id; generated when absent
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub origin: Option<TaskOrigin>,
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TASK_TIMEOUT_SECS
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl NewTask {
    pub fn new(agent: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            command: command.into(),
            params: HashMap::new(),
            priority: Priority::Normal,
            timeout_secs: DEFAULT_TASK_TIMEOUT_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            id: None,
            origin: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_max_retries(mut self, attempts: u32) -> Self {
        self.max_retries = attempts;
        self
    }

    pub fn with_params(mut self, params: HashMap<String, String>) -> Self {
        self.params = params;
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_origin(mut self, origin: TaskOrigin) -> Self {
        self.origin = Some(origin);
        self
    }
}

/// Structured output of one task execution.
///
/// `structured_data` is present iff the output's trailing top-level JSON
/// object parsed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskResult {
    pub raw_output: String,
    pub lines: Vec<String>,
    pub success: bool,
    pub has_errors: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_data: Option<serde_json::Value>,
}

impl TaskResult {
    /// A failure result carrying whatever output was captured.
    pub fn failure(raw_output: impl Into<String>) -> Self {
        let raw_output = raw_output.into();
        let lines = if raw_output.is_empty() {
            Vec::new()
        } else {
            raw_output.lines().map(str::to_string).collect()
        };
        Self {
            raw_output,
            lines,
            success: false,
            has_errors: true,
            structured_data: None,
        }
    }
}

/// Agent availability states, owned by that agent's bridge.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Ready,
    Busy,
    Stopped,
    Error,
    Unknown,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentState::Ready => "ready",
            AgentState::Busy => "busy",
            AgentState::Stopped => "stopped",
            AgentState::Error => "error",
            AgentState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Durable status record for one agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentStatusRecord {
    pub agent: String,
    pub state: AgentState,
    #[serde(default)]
    pub last_task_id: Option<String>,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default)]
    pub details: serde_json::Value,
}

/// Append-only system event log record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemEvent {
    /// Monotonically increasing id assigned by the store
    pub id: i64,
    pub event_type: String,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// A stored, named workflow: a DAG of steps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Workflow {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<StepSpec>,
    pub created: DateTime<Utc>,
}

/// Caller-facing workflow definition, as submitted to `define_workflow`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub steps: Vec<StepSpec>,
}

/// One step of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepSpec {
    /// Step id, unique within the workflow
    pub id: String,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Target agent id
    pub agent: String,
    /// Command template rendered against the execution context
    pub action: String,
    #[serde(default)]
    pub params: HashMap<String, String>,
    /// Step ids that must complete before this step may start
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

/// Workflow execution lifecycle states.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ExecutionState::Pending | ExecutionState::Running)
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionState::Pending => "pending",
            ExecutionState::Running => "running",
            ExecutionState::Completed => "completed",
            ExecutionState::Failed => "failed",
            ExecutionState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Per-step lifecycle states within an execution.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepState {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, StepState::Pending | StepState::Running)
    }
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepState::Pending => "pending",
            StepState::Running => "running",
            StepState::Completed => "completed",
            StepState::Failed => "failed",
            StepState::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Live status of one step within an execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepStatus {
    pub state: StepState,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub result: Option<TaskResult>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed: Option<DateTime<Utc>>,
}

impl Default for StepStatus {
    fn default() -> Self {
        Self {
            state: StepState::Pending,
            task_id: None,
            result: None,
            error: None,
            started: None,
            completed: None,
        }
    }
}

/// A running or completed instance of a workflow.
///
/// `context` starts as the caller's inputs and accumulates each completed
/// step's result under the step id, for downstream parameter substitution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowExecution {
    pub execution_id: String,
    pub workflow_id: String,
    pub status: ExecutionState,
    pub steps: BTreeMap<String, StepStatus>,
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl WorkflowExecution {
    /// A fresh execution of `workflow` with all steps pending.
    pub fn start(
        workflow: &Workflow,
        inputs: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        let steps = workflow
            .steps
            .iter()
            .map(|s| (s.id.clone(), StepStatus::default()))
            .collect();
        Self {
            execution_id: uuid::Uuid::new_v4().to_string(),
            workflow_id: workflow.id.clone(),
            status: ExecutionState::Running,
            steps,
            context: inputs,
            started: Some(Utc::now()),
            completed: None,
            error: None,
        }
    }
}

/// Message kind discriminator for bus payloads.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Task,
    Result,
    Event,
    Status,
}

/// Envelope carried by the message bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    pub kind: MessageKind,
    /// Component that published the message
    pub source: String,
    /// Agent id or `*`
    pub target: String,
    /// Routing subject, e.g. `tasks:supervisor`
    pub subject: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: Priority,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub ttl_secs: Option<u64>,
    #[serde(default)]
    pub requires_ack: bool,
}

impl Message {
    pub fn new(
        kind: MessageKind,
        source: impl Into<String>,
        target: impl Into<String>,
        subject: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            source: source.into(),
            target: target.into(),
            subject: subject.into(),
            payload,
            priority: Priority::Normal,
            timestamp: Utc::now(),
            correlation_id: None,
            ttl_secs: None,
            requires_ack: false,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}
