//! Message envelopes exchanged between the coordinator and agent workers.

use crate::agent::{AgentError, AgentKind, TaskOutput, TaskRequest};
use crate::core::task::TaskId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sender name used by the scheduler and the verifier.
pub const COORDINATOR: &str = "coordinator";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "to", content = "kind")]
pub enum Recipient {
    /// The single reply channel read by the scheduler.
    Coordinator,
    /// The shared mailbox of every worker of one agent kind.
    Agent(AgentKind),
}

impl std::fmt::Display for Recipient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Recipient::Coordinator => write!(f, "{}", COORDINATOR),
            Recipient::Agent(kind) => write!(f, "agent:{}", kind),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Dispatch,
    Result,
    Error,
    Cancel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePayload {
    Dispatch { request: TaskRequest },
    Result { output: TaskOutput },
    Error { error: AgentError },
    Cancel,
}

impl MessagePayload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Dispatch { .. } => MessageKind::Dispatch,
            Self::Result { .. } => MessageKind::Result,
            Self::Error { .. } => MessageKind::Error,
            Self::Cancel => MessageKind::Cancel,
        }
    }
}

/// Identifies one delivery: a task, the attempt it belongs to, and the
/// verification replica if any. Replies carry the same key as the dispatch
/// they answer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeliveryKey {
    pub task_id: TaskId,
    pub attempt: u32,
    pub replica: Option<u32>,
}

impl std::fmt::Display for DeliveryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.replica {
            Some(r) => write!(f, "{}#{}/r{}", self.task_id, self.attempt, r),
            None => write!(f, "{}#{}", self.task_id, self.attempt),
        }
    }
}

/// A message envelope. Built once and moved into the bus; nothing mutates
/// it afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    /// The task this message is about.
    pub correlation_id: TaskId,
    pub sender: String,
    pub recipient: Recipient,
    pub attempt: u32,
    pub replica: Option<u32>,
    pub payload: MessagePayload,
    pub sent_at: DateTime<Utc>,
}

impl Message {
    fn new(
        correlation_id: TaskId,
        sender: impl Into<String>,
        recipient: Recipient,
        attempt: u32,
        replica: Option<u32>,
        payload: MessagePayload,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            correlation_id,
            sender: sender.into(),
            recipient,
            attempt,
            replica,
            payload,
            sent_at: Utc::now(),
        }
    }

    /// Dispatch `request` to the mailbox of its agent kind.
    pub fn dispatch(request: TaskRequest) -> Self {
        Self::new(
            request.task_id.clone(),
            COORDINATOR,
            Recipient::Agent(request.kind.clone()),
            request.attempt,
            request.replica,
            MessagePayload::Dispatch { request },
        )
    }

    /// Ask the workers of `kind` to stop any invocation of `task_id`.
    pub fn cancel(task_id: TaskId, kind: AgentKind, attempt: u32) -> Self {
        Self::new(
            task_id,
            COORDINATOR,
            Recipient::Agent(kind),
            attempt,
            None,
            MessagePayload::Cancel,
        )
    }

    /// Successful reply to the coordinator for `request`.
    pub fn result(request: &TaskRequest, sender: impl Into<String>, output: TaskOutput) -> Self {
        Self::new(
            request.task_id.clone(),
            sender,
            Recipient::Coordinator,
            request.attempt,
            request.replica,
            MessagePayload::Result { output },
        )
    }

    /// Failed reply to the coordinator for `request`.
    pub fn error(request: &TaskRequest, sender: impl Into<String>, error: AgentError) -> Self {
        Self::new(
            request.task_id.clone(),
            sender,
            Recipient::Coordinator,
            request.attempt,
            request.replica,
            MessagePayload::Error { error },
        )
    }

    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    pub fn delivery_key(&self) -> DeliveryKey {
        DeliveryKey {
            task_id: self.correlation_id.clone(),
            attempt: self.attempt,
            replica: self.replica,
        }
    }
}
