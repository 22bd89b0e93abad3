use thiserror::Error;

use crate::agent::AgentKind;
use crate::core::task::TaskId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Dependency cycle detected at task {task}")]
    CycleDetected { task: TaskId },

    #[error("Task {task} depends on unknown task {missing}")]
    DanglingDependency { task: TaskId, missing: TaskId },

    #[error("Duplicate task id: {0}")]
    DuplicateTask(TaskId),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Illegal status transition for task {task}: {from} -> {to}")]
    IllegalTransition {
        task: TaskId,
        from: String,
        to: String,
    },

    #[error("No agent registered for kind: {0}")]
    UnknownAgentKind(AgentKind),

    #[error("Mailbox full for recipient {recipient} (capacity: {capacity})")]
    MailboxFull { recipient: String, capacity: usize },

    #[error("Message bus closed")]
    BusClosed,

    #[error("Query not found: {0}")]
    QueryNotFound(String),

    #[error("Query {0} has not finished")]
    NotReady(String),

    #[error("Report sink error: {0}")]
    Sink(String),
}

impl Error {
    /// Errors raised while building a task graph. A query that hits one of
    /// these is rejected before anything is dispatched.
    pub fn is_graph_error(&self) -> bool {
        matches!(
            self,
            Error::CycleDetected { .. }
                | Error::DanglingDependency { .. }
                | Error::DuplicateTask(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
