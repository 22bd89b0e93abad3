//! Agent capability interface and the static registry of runners.
//!
//! Concrete agents (planning, retrieval, analysis, compliance, verification,
//! synthesis, or test stubs) live outside this crate and plug in through
//! [`AgentRunner`]. The scheduler only ever sees a kind tag and a runner.

use crate::core::dag::TaskGraph;
use crate::core::task::TaskId;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Tag identifying which runner class handles a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentKind(pub String);

impl AgentKind {
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AgentKind {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for AgentKind {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Well-known stage kinds of the analysis pipeline.
pub mod kinds {
    pub const PLAN: &str = "plan";
    pub const RETRIEVE: &str = "retrieve";
    pub const ANALYZE: &str = "analyze";
    pub const COMPLIANCE_CHECK: &str = "compliance_check";
    pub const VERIFY: &str = "verify";
    pub const SYNTHESIZE: &str = "synthesize";
}

/// Everything a runner receives for one invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_id: TaskId,
    pub kind: AgentKind,
    /// The task's own input as set by the planner.
    pub input: Value,
    /// Outputs of the task's completed dependencies.
    #[serde(default)]
    pub upstream: BTreeMap<TaskId, Value>,
    /// The original query text.
    pub query: String,
    pub attempt: u32,
    /// Set for verification replicas, `None` for ordinary dispatches.
    #[serde(default)]
    pub replica: Option<u32>,
    pub deadline: Option<Duration>,
    #[serde(skip)]
    cancel: CancellationToken,
}

impl TaskRequest {
    pub fn new(task_id: TaskId, kind: AgentKind, input: Value, query: impl Into<String>) -> Self {
        Self {
            task_id,
            kind,
            input,
            upstream: BTreeMap::new(),
            query: query.into(),
            attempt: 1,
            replica: None,
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Signalled when the scheduler asks for this invocation to stop.
    /// Honouring it is optional.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn attach_cancellation(&mut self, token: CancellationToken) {
        self.cancel = token;
    }
}

/// Successful result of one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub value: Value,
    /// The runner's confidence in `value`, in [0, 1]. Used as the weight of
    /// the opinion when the task is verified.
    pub confidence: f64,
}

impl TaskOutput {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            confidence: 1.0,
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }
}

/// Coarse classification that drives retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Input,
    Transient,
    Fatal,
    Cancelled,
}

/// Failure reported by a runner (or synthesised by the worker pool for
/// timeouts and panics).
#[derive(thiserror::Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "class", content = "message")]
pub enum AgentError {
    #[error("invalid input: {0}")]
    Input(String),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("fatal failure: {0}")]
    Fatal(String),
    #[error("cancelled")]
    Cancelled,
}

impl AgentError {
    pub fn timeout(after: Duration) -> Self {
        AgentError::Transient(format!("timed out after {:?}", after))
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            AgentError::Input(_) => ErrorClass::Input,
            AgentError::Transient(_) => ErrorClass::Transient,
            AgentError::Fatal(_) => ErrorClass::Fatal,
            AgentError::Cancelled => ErrorClass::Cancelled,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

/// A worker that performs one pipeline stage.
///
/// Implementations must be idempotent per `(task_id, attempt, replica)`:
/// delivery is at-least-once, so the same request can arrive twice.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Cheap synchronous check before `process`. Failures are not retried.
    fn validate_input(&self, _request: &TaskRequest) -> std::result::Result<(), AgentError> {
        Ok(())
    }

    /// Do the work. May suspend on external I/O; the worker pool bounds it
    /// by the request deadline.
    async fn process(&self, request: &TaskRequest) -> std::result::Result<TaskOutput, AgentError>;

    /// Best-effort cleanup hook, called after any failed invocation.
    async fn handle_error(&self, _request: &TaskRequest, _error: &AgentError) {}
}

/// Static capability registry: one runner per agent kind, resolved before
/// any dispatch happens.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    runners: HashMap<AgentKind, Arc<dyn AgentRunner>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `runner` for `kind`, replacing any previous registration.
    pub fn register(mut self, kind: impl Into<AgentKind>, runner: Arc<dyn AgentRunner>) -> Self {
        self.runners.insert(kind.into(), runner);
        self
    }

    pub fn get(&self, kind: &AgentKind) -> Option<Arc<dyn AgentRunner>> {
        self.runners.get(kind).cloned()
    }

    pub fn contains(&self, kind: &AgentKind) -> bool {
        self.runners.contains_key(kind)
    }

    /// Registered kinds in sorted order.
    pub fn kinds(&self) -> Vec<AgentKind> {
        let mut kinds: Vec<AgentKind> = self.runners.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    pub fn len(&self) -> usize {
        self.runners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }

    /// Check that every task in `graph` has a runner.
    pub fn ensure_covers(&self, graph: &TaskGraph) -> Result<()> {
        for task in graph.all_tasks() {
            if !self.contains(&task.kind) {
                return Err(Error::UnknownAgentKind(task.kind.clone()));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
