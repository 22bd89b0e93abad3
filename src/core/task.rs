//! Task data model for the execution graph.
//!
//! Tasks are the atomic units of work handed to agents. Each task tracks
//! its status, the agent kind that handles it, its input and output
//! payloads, and how many times it has been dispatched.

use crate::agent::AgentKind;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::time::Duration;
use uuid::Uuid;

/// Identifier of a task within one query's graph.
///
/// Ids are chosen by the planner and stay stable for the lifetime of the
/// query, so they double as the correlation id of every message about the
/// task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh, random task id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::str::FromStr for TaskId {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(Error::Validation("task id must not be empty".to_string()));
        }
        Ok(Self::new(s))
    }
}

/// Task status in its lifecycle.
///
/// Status only moves forward: Pending -> Ready -> Running -> terminal.
/// The single backward edge is Running -> Ready when a transient failure
/// is retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// Task created, dependencies not yet satisfied.
    #[default]
    Pending,
    /// All dependencies completed, waiting for dispatch.
    Ready,
    /// Dispatched to a worker.
    Running,
    /// Finished successfully; output is recorded on the task.
    Completed,
    /// Finished with an error that will not be retried.
    Failed {
        /// Error message describing the failure.
        error: String,
    },
    /// Never ran to completion because of an upstream failure or a
    /// query cancellation.
    Cancelled {
        /// Why the task was cancelled.
        reason: String,
    },
}

impl TaskStatus {
    /// Short lowercase name without the attached detail.
    pub fn name(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed { .. } => "failed",
            TaskStatus::Cancelled { .. } => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed { .. } | TaskStatus::Cancelled { .. }
        )
    }

    /// Whether moving from `self` to `next` respects the lifecycle.
    pub fn can_advance_to(&self, next: &TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Ready)
                | (Pending, Cancelled { .. })
                | (Ready, Running)
                | (Ready, Cancelled { .. })
                | (Running, Completed)
                | (Running, Failed { .. })
                | (Running, Cancelled { .. })
                | (Running, Ready)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Failed { error } => write!(f, "failed: {}", error),
            TaskStatus::Cancelled { reason } => write!(f, "cancelled: {}", reason),
            other => write!(f, "{}", other.name()),
        }
    }
}

/// A task node as produced by a planner, before it enters a graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: TaskId,
    pub kind: AgentKind,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    /// Higher values are dispatched first among ready tasks.
    #[serde(default)]
    pub priority: i32,
    /// Completed output must pass consensus verification.
    #[serde(default)]
    pub verify: bool,
    /// Output is needed by the final report. `None` lets the graph decide
    /// (sinks are required when nothing is marked explicitly).
    #[serde(default)]
    pub required: Option<bool>,
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

impl TaskSpec {
    pub fn new(id: impl Into<TaskId>, kind: impl Into<AgentKind>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            input: Value::Null,
            depends_on: Vec::new(),
            priority: 0,
            verify: false,
            required: None,
            deadline_ms: None,
        }
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    pub fn depends_on(mut self, dep: impl Into<TaskId>) -> Self {
        self.depends_on.push(dep.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn verified(mut self) -> Self {
        self.verify = true;
        self
    }

    pub fn required(mut self, required: bool) -> Self {
        self.required = Some(required);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline_ms = Some(deadline.as_millis() as u64);
        self
    }
}

/// A single task in the execution graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Which agent kind handles this task.
    pub kind: AgentKind,
    pub depends_on: BTreeSet<TaskId>,
    pub status: TaskStatus,
    pub input: Value,
    pub output: Option<Value>,
    /// Number of dispatches so far. The first dispatch sets it to 1.
    pub attempt: u32,
    pub deadline: Option<Duration>,
    pub priority: i32,
    pub verify: bool,
    pub required: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a Pending task from a planner spec.
    pub fn from_spec(spec: TaskSpec) -> Self {
        Self {
            id: spec.id,
            kind: spec.kind,
            depends_on: spec.depends_on.into_iter().collect(),
            status: TaskStatus::Pending,
            input: spec.input,
            output: None,
            attempt: 0,
            deadline: spec.deadline_ms.map(Duration::from_millis),
            priority: spec.priority,
            verify: spec.verify,
            required: spec.required.unwrap_or(false),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    fn advance(&mut self, next: TaskStatus) -> Result<()> {
        if !self.status.can_advance_to(&next) {
            return Err(Error::IllegalTransition {
                task: self.id.clone(),
                from: self.status.name().to_string(),
                to: next.name().to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    pub(crate) fn mark_ready(&mut self) -> Result<()> {
        self.advance(TaskStatus::Ready)
    }

    /// Ready -> Running. Bumps the attempt counter.
    pub(crate) fn start(&mut self) -> Result<()> {
        self.advance(TaskStatus::Running)?;
        self.attempt += 1;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Running -> Ready after a transient failure.
    pub(crate) fn requeue(&mut self) -> Result<()> {
        self.advance(TaskStatus::Ready)
    }

    pub(crate) fn complete(&mut self, output: Value) -> Result<()> {
        self.advance(TaskStatus::Completed)?;
        self.output = Some(output);
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub(crate) fn fail(&mut self, error: &str) -> Result<()> {
        self.advance(TaskStatus::Failed {
            error: error.to_string(),
        })?;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub(crate) fn cancel(&mut self, reason: &str) -> Result<()> {
        self.advance(TaskStatus::Cancelled {
            reason: reason.to_string(),
        })?;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.status, TaskStatus::Completed)
    }
}
