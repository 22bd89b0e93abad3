//! Worker pool: a fixed set of workers per agent kind.
//!
//! The number of workers of a kind is its concurrency limit. Workers take
//! dispatches from their kind's mailbox, run the registered [`AgentRunner`]
//! under the request deadline, and post the outcome back to the coordinator.
//! A saturated kind simply leaves messages queued; other kinds are unaffected.

use crate::agent::{AgentError, AgentKind, AgentRegistry, AgentRunner, TaskOutput, TaskRequest};
use crate::bus::{DeliveryKey, Message, MessageBus, MessagePayload};
use crate::config::AgentsConfig;
use crate::core::task::TaskId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Snapshot of one agent kind's activity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentStats {
    pub kind: AgentKind,
    pub workers: usize,
    /// Invocations that returned a result.
    pub processed: u64,
    /// Invocations that ended in an error (including timeouts and panics).
    pub failed: u64,
    /// Invocations currently executing.
    pub active: usize,
    /// Messages waiting in the kind's mailbox.
    pub queue_depth: usize,
}

impl AgentStats {
    pub fn success_rate(&self) -> f64 {
        let total = self.processed + self.failed;
        if total == 0 {
            0.0
        } else {
            self.processed as f64 / total as f64
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    processed: u64,
    failed: u64,
    active: usize,
}

#[derive(Default)]
struct PoolShared {
    counters: Mutex<HashMap<AgentKind, Counters>>,
    active: Mutex<HashMap<DeliveryKey, CancellationToken>>,
    /// Set once every remaining delivery should be answered as cancelled.
    cancelled: AtomicBool,
}

impl PoolShared {
    fn counters(&self) -> MutexGuard<'_, HashMap<AgentKind, Counters>> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn active(&self) -> MutexGuard<'_, HashMap<DeliveryKey, CancellationToken>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim `key`. Returns false if the same delivery is already running.
    fn begin(&self, key: &DeliveryKey, token: &CancellationToken, kind: &AgentKind) -> bool {
        let mut active = self.active();
        if active.contains_key(key) {
            return false;
        }
        active.insert(key.clone(), token.clone());
        self.counters().entry(kind.clone()).or_default().active += 1;
        true
    }

    fn finish(&self, key: &DeliveryKey, kind: &AgentKind, succeeded: bool) {
        self.active().remove(key);
        let mut counters = self.counters();
        let entry = counters.entry(kind.clone()).or_default();
        entry.active = entry.active.saturating_sub(1);
        if succeeded {
            entry.processed += 1;
        } else {
            entry.failed += 1;
        }
    }

    fn cancel_task(&self, task_id: &TaskId) -> usize {
        let active = self.active();
        let mut cancelled = 0;
        for (key, token) in active.iter() {
            if &key.task_id == task_id {
                token.cancel();
                cancelled += 1;
            }
        }
        cancelled
    }

    fn cancel_all(&self) -> usize {
        self.cancelled.store(true, Ordering::SeqCst);
        let active = self.active();
        for token in active.values() {
            token.cancel();
        }
        active.len()
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

pub struct WorkerPool {
    bus: Arc<MessageBus>,
    shared: Arc<PoolShared>,
    workers: BTreeMap<AgentKind, usize>,
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn the workers for every registered kind.
    pub fn start(bus: Arc<MessageBus>, registry: &AgentRegistry, agents: &AgentsConfig) -> Self {
        let shared = Arc::new(PoolShared::default());
        let shutdown = CancellationToken::new();
        let mut workers = BTreeMap::new();
        let mut handles = Vec::new();

        for kind in registry.kinds() {
            let Some(runner) = registry.get(&kind) else {
                continue;
            };
            let count = agents.concurrency_for(&kind).max(1);
            for index in 0..count {
                let worker = Worker {
                    name: format!("{}-{}", kind, index),
                    kind: kind.clone(),
                    runner: runner.clone(),
                    bus: bus.clone(),
                    shared: shared.clone(),
                    shutdown: shutdown.clone(),
                };
                handles.push(tokio::spawn(worker.run()));
            }
            debug!(kind = %kind, workers = count, "worker pool started");
            workers.insert(kind, count);
        }

        Self {
            bus,
            shared,
            workers,
            shutdown,
            handles,
        }
    }

    pub fn worker_count(&self, kind: &AgentKind) -> usize {
        self.workers.get(kind).copied().unwrap_or(0)
    }

    /// Per-kind statistics, sorted by kind.
    pub fn stats(&self) -> BTreeMap<AgentKind, AgentStats> {
        let counters = self.shared.counters();
        self.workers
            .iter()
            .map(|(kind, &workers)| {
                let c = counters.get(kind).copied().unwrap_or_default();
                let stats = AgentStats {
                    kind: kind.clone(),
                    workers,
                    processed: c.processed,
                    failed: c.failed,
                    active: c.active,
                    queue_depth: self.bus.queue_depth(kind),
                };
                (kind.clone(), stats)
            })
            .collect()
    }

    /// Signal every running invocation of `task_id` to stop. Returns how
    /// many invocations were signalled.
    pub fn cancel_task(&self, task_id: &TaskId) -> usize {
        self.shared.cancel_task(task_id)
    }

    /// Cancel every running invocation and answer deliveries that have not
    /// started yet with `Cancelled`. Workers keep draining their mailboxes.
    pub fn cancel_all(&self) -> usize {
        let n = self.shared.cancel_all();
        debug!(signalled = n, "cancelling all invocations");
        n
    }

    /// Stop all workers and wait for them to exit.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        for handle in std::mem::take(&mut self.handles) {
            if let Err(e) = handle.await {
                warn!(error = %e, "worker exited abnormally");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers)
            .finish()
    }
}

struct Worker {
    name: String,
    kind: AgentKind,
    runner: Arc<dyn AgentRunner>,
    bus: Arc<MessageBus>,
    shared: Arc<PoolShared>,
    shutdown: CancellationToken,
}

impl Worker {
    async fn run(self) {
        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = self.bus.receive(&self.kind) => next,
            };
            match next {
                Ok(Some(message)) => self.handle(message).await,
                Ok(None) => break,
                Err(e) => {
                    warn!(worker = %self.name, error = %e, "mailbox unavailable");
                    break;
                }
            }
        }
        debug!(worker = %self.name, "worker stopped");
    }

    async fn handle(&self, message: Message) {
        match message.payload {
            MessagePayload::Dispatch { request } => self.invoke(request).await,
            MessagePayload::Cancel => {
                let n = self.shared.cancel_task(&message.correlation_id);
                debug!(worker = %self.name, task = %message.correlation_id, signalled = n, "cancel received");
            }
            other => {
                warn!(worker = %self.name, kind = ?other.kind(), "unexpected message in agent mailbox");
            }
        }
    }

    async fn invoke(&self, mut request: TaskRequest) {
        let key = DeliveryKey {
            task_id: request.task_id.clone(),
            attempt: request.attempt,
            replica: request.replica,
        };
        let token = self.shutdown.child_token();
        if !self.shared.begin(&key, &token, &self.kind) {
            debug!(worker = %self.name, delivery = %key, "duplicate delivery ignored");
            return;
        }
        request.attach_cancellation(token);
        debug!(worker = %self.name, delivery = %key, "processing");

        let result = if self.shared.is_cancelled() {
            Err(AgentError::Cancelled)
        } else {
            self.execute(&request).await
        };
        if let Err(e) = &result {
            debug!(worker = %self.name, delivery = %key, error = %e, "invocation failed");
            self.runner.handle_error(&request, e).await;
        }
        self.shared.finish(&key, &self.kind, result.is_ok());

        let reply = match result {
            Ok(output) => Message::result(&request, &self.name, output),
            Err(error) => Message::error(&request, &self.name, error),
        };
        if let Err(e) = self.bus.send(reply).await {
            warn!(worker = %self.name, delivery = %key, error = %e, "reply dropped");
        }
    }

    /// Validate, then run `process` on its own task so a panic or an
    /// overrun deadline cannot take the worker down with it.
    async fn execute(&self, request: &TaskRequest) -> Result<TaskOutput, AgentError> {
        self.runner.validate_input(request)?;

        let runner = self.runner.clone();
        let owned = request.clone();
        let handle = tokio::spawn(async move { runner.process(&owned).await });
        let abort = handle.abort_handle();

        let joined = match request.deadline {
            Some(deadline) => match tokio::time::timeout(deadline, handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    abort.abort();
                    return Err(AgentError::timeout(deadline));
                }
            },
            None => handle.await,
        };

        match joined {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(AgentError::Fatal(format!("agent panicked: {}", e))),
            Err(e) => Err(AgentError::Fatal(format!("agent task aborted: {}", e))),
        }
    }
}
