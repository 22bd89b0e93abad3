//! Per-query audit trail.
//!
//! Scheduler events and consensus decisions are kept as timestamped
//! [`TraceEntry`] values in a bounded [`AuditLog`]; the oldest entries are
//! dropped first once the log is full.

use crate::core::task::{Task, TaskId};
use crate::orchestration::consensus::ConsensusRecord;
use crate::orchestration::scheduler::SchedulerEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceLevel {
    Info,
    Warn,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub at: DateTime<Utc>,
    pub task_id: Option<TaskId>,
    /// Short event name, e.g. `task_dispatched`.
    pub event: String,
    pub level: TraceLevel,
    pub detail: Value,
}

impl TraceEntry {
    pub fn consensus(record: &ConsensusRecord) -> Self {
        let level = if record.is_accepted() {
            TraceLevel::Info
        } else {
            TraceLevel::Warn
        };
        Self {
            at: record.decided_at,
            task_id: Some(record.task_id.clone()),
            event: "consensus_decided".to_string(),
            level,
            detail: serde_json::json!({
                "outcome": record.outcome,
                "score": record.score,
                "quorum_met": record.quorum_met,
                "opinions": record.opinions.len(),
                "round": record.round,
                "reasons": record.disagreement_reasons,
            }),
        }
    }
}

impl From<&SchedulerEvent> for TraceEntry {
    fn from(event: &SchedulerEvent) -> Self {
        let level = match event {
            SchedulerEvent::TaskRetrying { .. }
            | SchedulerEvent::TaskFailed { .. }
            | SchedulerEvent::TaskCancelled { .. }
            | SchedulerEvent::DispatchDeferred { .. }
            | SchedulerEvent::QueryCancelled => TraceLevel::Warn,
            _ => TraceLevel::Info,
        };
        Self {
            at: Utc::now(),
            task_id: event.task_id().cloned(),
            event: event.name().to_string(),
            level,
            detail: serde_json::to_value(event).unwrap_or(Value::Null),
        }
    }
}

/// A task's current state plus every audit entry about it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskTrace {
    pub task: Task,
    pub entries: Vec<TraceEntry>,
}

#[derive(Debug)]
pub struct AuditLog {
    entries: VecDeque<TraceEntry>,
    max_entries: usize,
    dropped: u64,
}

impl AuditLog {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max_entries: max_entries.max(1),
            dropped: 0,
        }
    }

    pub fn record(&mut self, entry: TraceEntry) {
        if self.entries.len() == self.max_entries {
            self.entries.pop_front();
            self.dropped += 1;
        }
        self.entries.push_back(entry);
    }

    pub fn entries(&self) -> Vec<TraceEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn for_task(&self, task_id: &TaskId) -> Vec<TraceEntry> {
        self.entries
            .iter()
            .filter(|e| e.task_id.as_ref() == Some(task_id))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries evicted because the log was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

pub type SharedAuditLog = Arc<Mutex<AuditLog>>;

pub(crate) fn with_log<R>(log: &SharedAuditLog, f: impl FnOnce(&mut AuditLog) -> R) -> R {
    let mut guard = log.lock().unwrap_or_else(PoisonError::into_inner);
    f(&mut guard)
}

/// Drain scheduler events into `log` until every sender is gone.
pub fn spawn_recorder(
    log: SharedAuditLog,
    mut events: mpsc::UnboundedReceiver<SchedulerEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let entry = TraceEntry::from(&event);
            with_log(&log, |log| log.record(entry));
        }
    })
}
