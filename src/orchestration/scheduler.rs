//! Scheduler: drives one task graph to a terminal state.
//!
//! The scheduler is the single writer of its [`TaskGraph`]. It keeps a ready
//! queue, dispatches ready tasks through the [`MessageBus`], and reacts to
//! replies: results complete tasks and unblock dependents, errors go through
//! the [`RetryPolicy`]. It never runs agent code itself; the loop only waits
//! on replies, timers, and cancellation.

use crate::agent::{AgentError, AgentKind, ErrorClass, TaskRequest};
use crate::bus::{DeliveryMode, Message, MessageBus, MessagePayload};
use crate::config::{AgentsConfig, SchedulerConfig};
use crate::core::dag::{GraphStatus, StatusCounts, TaskGraph};
use crate::core::task::{TaskId, TaskStatus};
use crate::error::{Error, Result};
use crate::orchestration::retry::{RetryDecision, RetryPolicy, RetryTracker};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const QUERY_CANCELLED: &str = "query cancelled";

/// What happens to the rest of the graph when a task fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Cancel every transitive dependent of the failed task at once.
    /// Independent branches keep running.
    #[default]
    FailFast,
    /// Keep running every branch that can still make progress. Dependents
    /// of the failed task are cancelled as unreachable once nothing else
    /// can run.
    BestEffort,
}

/// Events emitted by the scheduler for task lifecycle changes.
///
/// These feed the audit trail; nothing in the scheduler depends on anyone
/// listening.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum SchedulerEvent {
    TaskReady {
        task_id: TaskId,
    },
    TaskDispatched {
        task_id: TaskId,
        kind: AgentKind,
        attempt: u32,
    },
    /// Dispatch postponed because the kind's mailbox had no room or every
    /// worker of the kind was busy.
    DispatchDeferred {
        task_id: TaskId,
        kind: AgentKind,
        reason: String,
    },
    TaskCompleted {
        task_id: TaskId,
        attempt: u32,
    },
    TaskRetrying {
        task_id: TaskId,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    TaskFailed {
        task_id: TaskId,
        attempt: u32,
        error: String,
    },
    TaskCancelled {
        task_id: TaskId,
        reason: String,
    },
    /// A reply for an attempt that is no longer current.
    StaleReply {
        task_id: TaskId,
        attempt: u32,
    },
    Redelivered {
        task_id: TaskId,
        attempt: u32,
    },
    QueryCancelled,
    AllTasksTerminal {
        status: GraphStatus,
    },
}

impl SchedulerEvent {
    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            Self::TaskReady { task_id }
            | Self::TaskDispatched { task_id, .. }
            | Self::DispatchDeferred { task_id, .. }
            | Self::TaskCompleted { task_id, .. }
            | Self::TaskRetrying { task_id, .. }
            | Self::TaskFailed { task_id, .. }
            | Self::TaskCancelled { task_id, .. }
            | Self::StaleReply { task_id, .. }
            | Self::Redelivered { task_id, .. } => Some(task_id),
            Self::QueryCancelled | Self::AllTasksTerminal { .. } => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::TaskReady { .. } => "task_ready",
            Self::TaskDispatched { .. } => "task_dispatched",
            Self::DispatchDeferred { .. } => "dispatch_deferred",
            Self::TaskCompleted { .. } => "task_completed",
            Self::TaskRetrying { .. } => "task_retrying",
            Self::TaskFailed { .. } => "task_failed",
            Self::TaskCancelled { .. } => "task_cancelled",
            Self::StaleReply { .. } => "stale_reply",
            Self::Redelivered { .. } => "redelivered",
            Self::QueryCancelled => "query_cancelled",
            Self::AllTasksTerminal { .. } => "all_tasks_terminal",
        }
    }
}

/// Summary of a finished scheduling run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleOutcome {
    pub status: GraphStatus,
    /// Whether every task required by the report completed.
    pub required_completed: bool,
    /// Whether the run was cut short by cancellation.
    pub cancelled: bool,
    /// Total retries across all tasks.
    pub retries: u32,
    pub counts: StatusCounts,
}

#[derive(Debug)]
struct ReadyEntry {
    task_id: TaskId,
    priority: i32,
    seq: u64,
    not_before: Option<Instant>,
    deferred: bool,
}

#[derive(Debug)]
struct InFlight {
    kind: AgentKind,
    attempt: u32,
}

pub struct Scheduler {
    graph: Arc<RwLock<TaskGraph>>,
    bus: Arc<MessageBus>,
    config: SchedulerConfig,
    retry: RetryPolicy,
    query: String,
    event_tx: mpsc::UnboundedSender<SchedulerEvent>,
    cancel: CancellationToken,
    ready: Vec<ReadyEntry>,
    running: HashMap<TaskId, InFlight>,
    workers: Option<AgentsConfig>,
    retries: RetryTracker,
    seq: u64,
    cancelled: bool,
}

impl Scheduler {
    /// Create a scheduler for `graph`.
    ///
    /// `query` is the original query text, forwarded to every runner.
    pub fn new(
        graph: Arc<RwLock<TaskGraph>>,
        bus: Arc<MessageBus>,
        config: SchedulerConfig,
        query: impl Into<String>,
        event_tx: mpsc::UnboundedSender<SchedulerEvent>,
    ) -> Self {
        let retry = config.retry_policy();
        Self {
            graph,
            bus,
            config,
            retry,
            query: query.into(),
            event_tx,
            cancel: CancellationToken::new(),
            ready: Vec::new(),
            running: HashMap::new(),
            workers: None,
            retries: RetryTracker::new(),
            seq: 0,
            cancelled: false,
        }
    }

    /// Use `token` to cancel the run from outside.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Keep at most as many tasks of a kind in flight as the kind has
    /// workers. Without this every ready task is sent as soon as the
    /// mailbox has room.
    pub fn with_concurrency(mut self, agents: AgentsConfig) -> Self {
        self.workers = Some(agents);
        self
    }

    pub fn graph(&self) -> Arc<RwLock<TaskGraph>> {
        self.graph.clone()
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Number of tasks currently dispatched and awaiting a reply.
    pub fn active_count(&self) -> usize {
        self.running.len()
    }

    /// Number of tasks waiting in the ready queue.
    pub fn queued_count(&self) -> usize {
        self.ready.len()
    }

    fn emit(&self, event: SchedulerEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Run until every task is terminal.
    ///
    /// `replies` is the coordinator channel returned by [`MessageBus::new`].
    pub async fn run(
        &mut self,
        replies: &mut mpsc::UnboundedReceiver<Message>,
    ) -> Result<ScheduleOutcome> {
        let cancel = self.cancel.clone();
        {
            let graph = self.graph.read().await;
            info!(tasks = graph.task_count(), policy = ?self.config.failure_policy, "scheduler started");
        }
        self.enqueue_ready().await?;

        loop {
            if cancel.is_cancelled() && !self.cancelled {
                self.cancel_outstanding().await?;
            }
            self.dispatch_ready().await?;

            if self.ready.is_empty() && self.running.is_empty() {
                break;
            }

            let wake = self.next_wake();
            tokio::select! {
                _ = cancel.cancelled(), if !self.cancelled => {}
                reply = replies.recv() => match reply {
                    Some(message) => self.handle_reply(message).await?,
                    None => return Err(Error::BusClosed),
                },
                _ = sleep_until_or_forever(wake) => self.handle_expired().await?,
            }
        }

        self.finish().await
    }

    // ========== Ready queue ==========

    /// Move newly unblocked Pending tasks into the ready queue.
    async fn enqueue_ready(&mut self) -> Result<()> {
        if self.cancelled {
            return Ok(());
        }
        let mut graph = self.graph.write().await;
        for task_id in graph.ready_tasks() {
            graph.mark_ready(&task_id)?;
            let priority = graph.get_task(&task_id).map(|t| t.priority).unwrap_or(0);
            self.seq += 1;
            self.ready.push(ReadyEntry {
                task_id: task_id.clone(),
                priority,
                seq: self.seq,
                not_before: None,
                deferred: false,
            });
            debug!(task = %task_id, "task ready");
            let _ = self.event_tx.send(SchedulerEvent::TaskReady { task_id });
        }
        Ok(())
    }

    fn requeue_after(&mut self, task_id: TaskId, priority: i32, not_before: Instant) {
        self.seq += 1;
        self.ready.push(ReadyEntry {
            task_id,
            priority,
            seq: self.seq,
            not_before: Some(not_before),
            deferred: false,
        });
    }

    fn next_wake(&self) -> Option<Instant> {
        let ready = self.ready.iter().filter_map(|e| e.not_before).min();
        match (ready, self.bus.next_expiry()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    // ========== Dispatch ==========

    async fn build_request(&self, task_id: &TaskId) -> Result<TaskRequest> {
        let graph = self.graph.read().await;
        let task = graph
            .get_task(task_id)
            .ok_or_else(|| Error::TaskNotFound(task_id.clone()))?;
        let mut request = TaskRequest::new(
            task.id.clone(),
            task.kind.clone(),
            task.input.clone(),
            self.query.clone(),
        );
        request.upstream = graph.upstream_outputs(task_id);
        request.attempt = task.attempt + 1;
        request.deadline = task.deadline.or(self.config.default_deadline());
        Ok(request)
    }

    /// Whether every worker of `kind` already holds a dispatched task.
    fn workers_busy(&self, kind: &AgentKind) -> bool {
        let Some(agents) = &self.workers else {
            return false;
        };
        let in_flight = self.running.values().filter(|r| &r.kind == kind).count();
        in_flight >= agents.concurrency_for(kind)
    }

    /// Dispatch every due entry of the ready queue, highest priority first.
    /// Entries whose mailbox is full or whose workers are all busy are
    /// postponed, never dropped.
    async fn dispatch_ready(&mut self) -> Result<()> {
        if self.cancelled || self.ready.is_empty() {
            return Ok(());
        }
        let now = Instant::now();
        let mut queue = std::mem::take(&mut self.ready);
        queue.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));

        for mut entry in queue {
            if entry.not_before.is_some_and(|at| at > now) {
                self.ready.push(entry);
                continue;
            }

            let request = self.build_request(&entry.task_id).await?;
            let kind = request.kind.clone();
            let attempt = request.attempt;

            // A reply frees the worker and wakes the loop, so no timer.
            if self.workers_busy(&kind) {
                entry.not_before = None;
                self.note_deferred(&mut entry, &kind, "no idle worker");
                self.ready.push(entry);
                continue;
            }

            if self.bus.config().mode == DeliveryMode::Backpressure
                && self.bus.available_capacity(&kind) == 0
            {
                self.defer(&mut entry, &kind, "mailbox saturated", now);
                self.ready.push(entry);
                continue;
            }

            match self.bus.send(Message::dispatch(request)).await {
                Ok(()) => {
                    let recorded = self.graph.write().await.mark_running(&entry.task_id)?;
                    debug_assert_eq!(recorded, attempt);
                    debug!(task = %entry.task_id, kind = %kind, attempt, "dispatched");
                    self.running.insert(
                        entry.task_id.clone(),
                        InFlight {
                            kind: kind.clone(),
                            attempt,
                        },
                    );
                    self.emit(SchedulerEvent::TaskDispatched {
                        task_id: entry.task_id,
                        kind,
                        attempt,
                    });
                }
                Err(e @ Error::MailboxFull { .. }) => {
                    self.defer(&mut entry, &kind, &e.to_string(), now);
                    self.ready.push(entry);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn defer(&self, entry: &mut ReadyEntry, kind: &AgentKind, reason: &str, now: Instant) {
        entry.not_before = Some(now + self.config.dispatch_retry_delay());
        self.note_deferred(entry, kind, reason);
    }

    fn note_deferred(&self, entry: &mut ReadyEntry, kind: &AgentKind, reason: &str) {
        if entry.deferred {
            return;
        }
        entry.deferred = true;
        debug!(task = %entry.task_id, kind = %kind, reason, "dispatch deferred");
        self.emit(SchedulerEvent::DispatchDeferred {
            task_id: entry.task_id.clone(),
            kind: kind.clone(),
            reason: reason.to_string(),
        });
    }

    // ========== Replies ==========

    async fn handle_reply(&mut self, message: Message) -> Result<()> {
        let key = message.delivery_key();
        self.bus.acknowledge(&key);

        let outcome = match message.payload {
            MessagePayload::Result { output } => Ok(output.value),
            MessagePayload::Error { error } => Err(error),
            other => {
                warn!(delivery = %key, kind = ?other.kind(), "unexpected message on reply channel");
                return Ok(());
            }
        };

        let current = self.running.get(&key.task_id).map(|r| r.attempt);
        if key.replica.is_some() || current != Some(key.attempt) {
            debug!(delivery = %key, current = ?current, "stale reply dropped");
            self.emit(SchedulerEvent::StaleReply {
                task_id: key.task_id,
                attempt: key.attempt,
            });
            return Ok(());
        }
        self.running.remove(&key.task_id);

        match outcome {
            Ok(value) => self.complete(key.task_id, key.attempt, value).await,
            Err(error) => self.fail_attempt(key.task_id, key.attempt, error).await,
        }
    }

    async fn complete(&mut self, task_id: TaskId, attempt: u32, value: Value) -> Result<()> {
        self.graph.write().await.mark_completed(&task_id, value)?;
        info!(task = %task_id, attempt, "task completed");
        self.emit(SchedulerEvent::TaskCompleted { task_id, attempt });
        self.enqueue_ready().await
    }

    async fn fail_attempt(&mut self, task_id: TaskId, attempt: u32, error: AgentError) -> Result<()> {
        if self.cancelled {
            // No retries once the query is cancelled.
            return match error.class() {
                ErrorClass::Input | ErrorClass::Fatal => {
                    self.mark_failed(&task_id, attempt, &error.to_string()).await
                }
                ErrorClass::Transient | ErrorClass::Cancelled => {
                    self.mark_cancelled(&task_id, QUERY_CANCELLED).await
                }
            };
        }

        match self.retry.decide(&error, attempt) {
            RetryDecision::Retry { delay } => {
                let priority = {
                    let mut graph = self.graph.write().await;
                    graph.requeue(&task_id)?;
                    graph.get_task(&task_id).map(|t| t.priority).unwrap_or(0)
                };
                let retries = self.retries.increment(&task_id);
                warn!(task = %task_id, attempt, retries, delay_ms = delay.as_millis() as u64, error = %error, "retrying task");
                self.requeue_after(task_id.clone(), priority, Instant::now() + delay);
                self.emit(SchedulerEvent::TaskRetrying {
                    task_id,
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                    error: error.to_string(),
                });
                Ok(())
            }
            RetryDecision::Fail { reason } => {
                self.mark_failed(&task_id, attempt, &reason).await?;
                self.propagate_failure(&task_id).await
            }
            RetryDecision::Cancel => {
                self.mark_cancelled(&task_id, "cancelled by agent").await?;
                self.propagate_failure(&task_id).await
            }
        }
    }

    async fn mark_failed(&mut self, task_id: &TaskId, attempt: u32, reason: &str) -> Result<()> {
        self.graph.write().await.mark_failed(task_id, reason)?;
        warn!(task = %task_id, attempt, error = reason, "task failed");
        self.emit(SchedulerEvent::TaskFailed {
            task_id: task_id.clone(),
            attempt,
            error: reason.to_string(),
        });
        Ok(())
    }

    async fn mark_cancelled(&mut self, task_id: &TaskId, reason: &str) -> Result<()> {
        self.graph.write().await.mark_cancelled(task_id, reason)?;
        debug!(task = %task_id, reason, "task cancelled");
        self.emit(SchedulerEvent::TaskCancelled {
            task_id: task_id.clone(),
            reason: reason.to_string(),
        });
        Ok(())
    }

    async fn propagate_failure(&mut self, task_id: &TaskId) -> Result<()> {
        if self.config.failure_policy != FailurePolicy::FailFast {
            return Ok(());
        }
        let reason = format!("dependency {} did not complete", task_id);
        let cancelled = self.graph.write().await.cancel_descendants(task_id, &reason);
        for id in cancelled {
            debug!(task = %id, upstream = %task_id, "dependent cancelled");
            self.emit(SchedulerEvent::TaskCancelled {
                task_id: id,
                reason: reason.clone(),
            });
        }
        Ok(())
    }

    // ========== Timers ==========

    /// Redeliver dispatches whose reply is overdue; give up on the ones that
    /// ran out of redeliveries by treating them as transient timeouts.
    async fn handle_expired(&mut self) -> Result<()> {
        let report = self.bus.redeliver_expired();
        for key in report.redelivered {
            self.emit(SchedulerEvent::Redelivered {
                task_id: key.task_id,
                attempt: key.attempt,
            });
        }
        for key in report.exhausted {
            let current = self.running.get(&key.task_id).map(|r| r.attempt);
            if key.replica.is_some() || current != Some(key.attempt) {
                continue;
            }
            self.running.remove(&key.task_id);
            let error = AgentError::Transient(format!("no reply for {} after redelivery", key));
            self.fail_attempt(key.task_id, key.attempt, error).await?;
        }
        Ok(())
    }

    // ========== Cancellation & termination ==========

    async fn cancel_outstanding(&mut self) -> Result<()> {
        self.cancelled = true;
        info!(running = self.running.len(), queued = self.ready.len(), "query cancelled");
        self.emit(SchedulerEvent::QueryCancelled);

        let queued = std::mem::take(&mut self.ready);
        for entry in queued {
            self.mark_cancelled(&entry.task_id, QUERY_CANCELLED).await?;
        }
        let pending: Vec<TaskId> = {
            let graph = self.graph.read().await;
            graph
                .all_tasks()
                .filter(|t| t.status == TaskStatus::Pending)
                .map(|t| t.id.clone())
                .collect()
        };
        for task_id in pending {
            self.mark_cancelled(&task_id, QUERY_CANCELLED).await?;
        }

        for (task_id, inflight) in &self.running {
            let message = Message::cancel(task_id.clone(), inflight.kind.clone(), inflight.attempt);
            if let Err(e) = self.bus.try_send(message) {
                debug!(task = %task_id, error = %e, "cancel message not delivered");
            }
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<ScheduleOutcome> {
        let leftovers: Vec<TaskId> = {
            let graph = self.graph.read().await;
            graph
                .all_tasks()
                .filter(|t| !t.is_finished())
                .map(|t| t.id.clone())
                .collect()
        };
        let reason = if self.cancelled {
            QUERY_CANCELLED
        } else {
            "unreachable: an upstream task did not complete"
        };
        for task_id in leftovers {
            self.mark_cancelled(&task_id, reason).await?;
        }

        let graph = self.graph.read().await;
        let outcome = ScheduleOutcome {
            status: graph.status(),
            required_completed: graph.required_completed(),
            cancelled: self.cancelled,
            retries: self.retries.total(),
            counts: graph.status_counts(),
        };
        drop(graph);

        info!(status = %outcome.status, retries = outcome.retries, "scheduler finished");
        self.emit(SchedulerEvent::AllTasksTerminal {
            status: outcome.status,
        });
        Ok(outcome)
    }
}

async fn sleep_until_or_forever(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("ready", &self.ready.len())
            .field("running", &self.running.len())
            .field("cancelled", &self.cancelled)
            .finish()
    }
}
