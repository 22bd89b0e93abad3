//! Orchestrator: the public entry point.
//!
//! `submit_query` plans the query, validates the graph, and starts a
//! background run. Each run owns its own bus, worker pool, and scheduler;
//! the orchestrator keeps only what the status and audit queries need.
//!
//! A run goes through these steps:
//! 1. Schedule the graph to a terminal state.
//! 2. Verify every Completed task flagged for consensus.
//! 3. Derive the query status, write the report once, publish the status.

use crate::agent::{AgentKind, AgentRegistry, TaskRequest};
use crate::bus::{Message, MessageBus};
use crate::config::Config;
use crate::core::dag::{GraphStatus, TaskGraph};
use crate::core::task::{TaskId, TaskStatus};
use crate::error::{Error, Result};
use crate::orchestration::audit::{self, AuditLog, SharedAuditLog, TaskTrace, TraceEntry};
use crate::orchestration::consensus::{ConsensusRecord, ConsensusVerifier, VerdictEquivalence};
use crate::orchestration::planner::Planner;
use crate::orchestration::pool::{AgentStats, WorkerPool};
use crate::orchestration::report::{Report, ReportRef, ReportSink};
use crate::orchestration::scheduler::{FailurePolicy, ScheduleOutcome, Scheduler};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock as StdRwLock};
use tokio::sync::{mpsc, watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryId(pub Uuid);

impl QueryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for QueryId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for QueryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for QueryId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::Validation(format!("invalid query id {:?}: {}", s, e)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    Running,
    Completed,
    /// Some required output is missing, but not all of it.
    PartialFailure,
    Failed,
    /// Every task completed but a consensus record was Flagged.
    NeedsReview,
    Cancelled,
}

impl QueryStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, QueryStatus::Running)
    }
}

impl std::fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            QueryStatus::Running => "running",
            QueryStatus::Completed => "completed",
            QueryStatus::PartialFailure => "partial_failure",
            QueryStatus::Failed => "failed",
            QueryStatus::NeedsReview => "needs_review",
            QueryStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// A submitted query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub id: QueryId,
    pub text: String,
    pub submitted_at: DateTime<Utc>,
}

/// Map a finished schedule plus its consensus records to a query status.
pub fn derive_status(
    outcome: &ScheduleOutcome,
    records: &[ConsensusRecord],
    policy: FailurePolicy,
) -> QueryStatus {
    if outcome.cancelled {
        return QueryStatus::Cancelled;
    }
    let done = outcome.status == GraphStatus::AllCompleted
        || (policy == FailurePolicy::BestEffort && outcome.required_completed);
    if done {
        if records.iter().any(|r| !r.is_accepted()) {
            QueryStatus::NeedsReview
        } else {
            QueryStatus::Completed
        }
    } else if outcome.status == GraphStatus::PartialFailure {
        QueryStatus::PartialFailure
    } else {
        QueryStatus::Failed
    }
}

// ========== Per-query state ==========

struct QueryState {
    query: Query,
    graph: Arc<RwLock<TaskGraph>>,
    audit: SharedAuditLog,
    cancel: CancellationToken,
    status: watch::Sender<QueryStatus>,
    pool: Mutex<Option<WorkerPool>>,
    final_stats: Mutex<BTreeMap<AgentKind, AgentStats>>,
    consensus: Mutex<Vec<ConsensusRecord>>,
    report: Mutex<Option<(Report, Option<ReportRef>)>>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl QueryState {
    fn current_status(&self) -> QueryStatus {
        *self.status.borrow()
    }
}

/// Everything a background run needs from the orchestrator.
#[derive(Clone)]
struct RunContext {
    config: Config,
    registry: AgentRegistry,
    verifier: Arc<ConsensusVerifier>,
    sink: Arc<dyn ReportSink>,
}

pub struct Orchestrator {
    config: Config,
    registry: AgentRegistry,
    planner: Arc<dyn Planner>,
    sink: Arc<dyn ReportSink>,
    verifier: Arc<ConsensusVerifier>,
    queries: StdRwLock<HashMap<QueryId, Arc<QueryState>>>,
}

impl Orchestrator {
    /// Create an orchestrator. Fails if `config` does not validate.
    pub fn new(
        config: Config,
        registry: AgentRegistry,
        planner: Arc<dyn Planner>,
        sink: Arc<dyn ReportSink>,
    ) -> Result<Self> {
        config.validate()?;
        let verifier = Arc::new(ConsensusVerifier::new(config.consensus.clone()));
        Ok(Self {
            config,
            registry,
            planner,
            sink,
            verifier,
            queries: StdRwLock::new(HashMap::new()),
        })
    }

    /// Use a custom verdict equivalence for consensus.
    pub fn with_equivalence(mut self, equivalence: Arc<dyn VerdictEquivalence>) -> Self {
        self.verifier = Arc::new(
            ConsensusVerifier::new(self.config.consensus.clone()).with_equivalence(equivalence),
        );
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn state(&self, id: &QueryId) -> Result<Arc<QueryState>> {
        self.queries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| Error::QueryNotFound(id.to_string()))
    }

    // ========== Submission ==========

    /// Plan `query` and start running it. Returns once the run has been
    /// started; use [`Orchestrator::wait_for`] to wait for the outcome.
    ///
    /// # Errors
    /// Planner errors, graph errors (`CycleDetected`, `DanglingDependency`,
    /// `DuplicateTask`), and `UnknownAgentKind` reject the query before any
    /// task is dispatched.
    pub async fn submit_query(&self, query: impl Into<String>) -> Result<QueryId> {
        let text = query.into();
        let plan = self.planner.decompose(&text).await?;
        let graph = plan.into_graph()?;
        if graph.is_empty() {
            return Err(Error::Validation("planner produced an empty plan".into()));
        }
        self.registry.ensure_covers(&graph)?;
        self.evict_finished();

        let id = QueryId::new();
        let (status, _) = watch::channel(QueryStatus::Running);
        let state = Arc::new(QueryState {
            query: Query {
                id,
                text,
                submitted_at: Utc::now(),
            },
            graph: Arc::new(RwLock::new(graph)),
            audit: Arc::new(Mutex::new(AuditLog::new(self.config.audit.max_entries))),
            cancel: CancellationToken::new(),
            status,
            pool: Mutex::new(None),
            final_stats: Mutex::new(BTreeMap::new()),
            consensus: Mutex::new(Vec::new()),
            report: Mutex::new(None),
        });
        self.queries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, state.clone());

        let ctx = RunContext {
            config: self.config.clone(),
            registry: self.registry.clone(),
            verifier: self.verifier.clone(),
            sink: self.sink.clone(),
        };
        info!(query = %id, "query submitted");
        tokio::spawn(run_query(ctx, state));
        Ok(id)
    }

    // ========== Status surface ==========

    pub fn query_status(&self, id: &QueryId) -> Result<QueryStatus> {
        Ok(self.state(id)?.current_status())
    }

    /// Wait until the query reaches a terminal status.
    pub async fn wait_for(&self, id: &QueryId) -> Result<QueryStatus> {
        let mut rx = self.state(id)?.status.subscribe();
        let status = rx
            .wait_for(|s| s.is_terminal())
            .await
            .map_err(|_| Error::QueryNotFound(id.to_string()))?;
        Ok(*status)
    }

    /// The final report. `NotReady` while the query is running.
    pub fn fetch_report(&self, id: &QueryId) -> Result<Report> {
        let state = self.state(id)?;
        let report = locked(&state.report);
        match report.as_ref() {
            Some((report, _)) => Ok(report.clone()),
            None => Err(Error::NotReady(id.to_string())),
        }
    }

    /// Where the report sink stored the report, if it did.
    pub fn report_ref(&self, id: &QueryId) -> Result<Option<ReportRef>> {
        let state = self.state(id)?;
        let report = locked(&state.report);
        match report.as_ref() {
            Some((_, reference)) => Ok(reference.clone()),
            None => Err(Error::NotReady(id.to_string())),
        }
    }

    /// Stop dispatching, cancel queued tasks, and ask running ones to stop.
    /// Cancelling a finished query does nothing.
    pub fn cancel_query(&self, id: &QueryId) -> Result<()> {
        let state = self.state(id)?;
        if !state.current_status().is_terminal() {
            info!(query = %id, "cancelling query");
            state.cancel.cancel();
            // Busy workers cannot read a Cancel message from their own mailbox.
            if let Some(pool) = locked(&state.pool).as_ref() {
                pool.cancel_all();
            }
        }
        Ok(())
    }

    /// Drop a finished query and everything kept for it. A running query
    /// yields `NotReady`; cancel it and wait for it first.
    pub fn forget_query(&self, id: &QueryId) -> Result<()> {
        let mut queries = self.queries.write().unwrap_or_else(PoisonError::into_inner);
        let state = queries
            .get(id)
            .ok_or_else(|| Error::QueryNotFound(id.to_string()))?;
        if !state.current_status().is_terminal() {
            return Err(Error::NotReady(id.to_string()));
        }
        queries.remove(id);
        info!(query = %id, "query forgotten");
        Ok(())
    }

    /// Keep at most `retention.max_finished_queries` finished queries,
    /// dropping the oldest first.
    fn evict_finished(&self) {
        let limit = self.config.retention.max_finished_queries;
        let mut queries = self.queries.write().unwrap_or_else(PoisonError::into_inner);
        let mut finished: Vec<(DateTime<Utc>, QueryId)> = queries
            .values()
            .filter(|s| s.current_status().is_terminal())
            .map(|s| (s.query.submitted_at, s.query.id))
            .collect();
        if finished.len() <= limit {
            return;
        }
        finished.sort_by_key(|(submitted_at, _)| *submitted_at);
        let excess = finished.len() - limit;
        for (_, id) in finished.into_iter().take(excess) {
            queries.remove(&id);
            debug!(query = %id, "finished query evicted");
        }
    }

    pub fn query(&self, id: &QueryId) -> Result<Query> {
        Ok(self.state(id)?.query.clone())
    }

    /// Every submitted query, oldest first.
    pub fn queries(&self) -> Vec<Query> {
        let mut queries: Vec<Query> = self
            .queries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|s| s.query.clone())
            .collect();
        queries.sort_by_key(|q| q.submitted_at);
        queries
    }

    // ========== Task-level observability ==========

    pub async fn task_status(&self, id: &QueryId, task_id: &TaskId) -> Result<TaskStatus> {
        let state = self.state(id)?;
        let graph = state.graph.read().await;
        graph
            .get_task(task_id)
            .map(|t| t.status.clone())
            .ok_or_else(|| Error::TaskNotFound(task_id.clone()))
    }

    pub async fn task_trace(&self, id: &QueryId, task_id: &TaskId) -> Result<TaskTrace> {
        let state = self.state(id)?;
        let task = {
            let graph = state.graph.read().await;
            graph
                .get_task(task_id)
                .cloned()
                .ok_or_else(|| Error::TaskNotFound(task_id.clone()))?
        };
        let entries = audit::with_log(&state.audit, |log| log.for_task(task_id));
        Ok(TaskTrace { task, entries })
    }

    pub fn audit_log(&self, id: &QueryId) -> Result<Vec<TraceEntry>> {
        let state = self.state(id)?;
        Ok(audit::with_log(&state.audit, |log| log.entries()))
    }

    pub fn consensus_records(&self, id: &QueryId) -> Result<Vec<ConsensusRecord>> {
        Ok(locked(&self.state(id)?.consensus).clone())
    }

    /// Live worker statistics while the query runs, the final snapshot
    /// afterwards.
    pub fn agent_stats(&self, id: &QueryId) -> Result<BTreeMap<AgentKind, AgentStats>> {
        let state = self.state(id)?;
        let pool = locked(&state.pool);
        match pool.as_ref() {
            Some(pool) => Ok(pool.stats()),
            None => Ok(locked(&state.final_stats).clone()),
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("agents", &self.registry.kinds())
            .field("queries", &self.queries.read().map(|q| q.len()).unwrap_or(0))
            .finish()
    }
}

// ========== Background run ==========

async fn run_query(ctx: RunContext, state: Arc<QueryState>) {
    let id = state.query.id;
    let (bus, mut replies) = MessageBus::new(ctx.config.bus.clone(), ctx.registry.kinds());
    let bus = Arc::new(bus);
    *locked(&state.pool) = Some(WorkerPool::start(bus.clone(), &ctx.registry, &ctx.config.agents));

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let recorder = audit::spawn_recorder(state.audit.clone(), event_rx);

    let mut scheduler = Scheduler::new(
        state.graph.clone(),
        bus.clone(),
        ctx.config.scheduler.clone(),
        state.query.text.clone(),
        event_tx,
    )
    .with_cancellation(state.cancel.clone())
    .with_concurrency(ctx.config.agents.clone());
    let scheduled = scheduler.run(&mut replies).await;
    drop(scheduler);

    let status = match scheduled {
        Ok(mut outcome) => {
            let records = verify_completed(&ctx, &state, &bus, &mut replies).await;
            if state.cancel.is_cancelled() {
                outcome.cancelled = true;
            }
            derive_status(&outcome, &records, ctx.config.scheduler.failure_policy)
        }
        Err(e) => {
            error!(query = %id, error = %e, "scheduler aborted");
            QueryStatus::Failed
        }
    };

    let pool = locked(&state.pool).take();
    if let Some(pool) = pool {
        *locked(&state.final_stats) = pool.stats();
        pool.shutdown().await;
    }
    if let Err(e) = recorder.await {
        warn!(query = %id, error = %e, "audit recorder stopped abnormally");
    }

    let report = build_report(&state, status).await;
    let reference = match ctx.sink.write(&report).await {
        Ok(reference) => Some(reference),
        Err(e) => {
            error!(query = %id, error = %e, "report sink failed");
            None
        }
    };
    *locked(&state.report) = Some((report, reference));

    info!(query = %id, status = %status, "query finished");
    state.status.send_replace(status);
}

/// Run consensus for every Completed task flagged for verification.
/// Stops early if the query is cancelled.
async fn verify_completed(
    ctx: &RunContext,
    state: &QueryState,
    bus: &MessageBus,
    replies: &mut mpsc::UnboundedReceiver<Message>,
) -> Vec<ConsensusRecord> {
    let requests: Vec<TaskRequest> = {
        let graph = state.graph.read().await;
        graph
            .topological_order()
            .into_iter()
            .filter_map(|task_id| graph.get_task(&task_id))
            .filter(|task| task.verify && task.is_completed())
            .map(|task| {
                let mut request = TaskRequest::new(
                    task.id.clone(),
                    task.kind.clone(),
                    task.input.clone(),
                    state.query.text.clone(),
                );
                request.upstream = graph.upstream_outputs(&task.id);
                request.attempt = task.attempt;
                request.deadline = task.deadline.or(ctx.config.scheduler.default_deadline());
                request
            })
            .collect()
    };

    let mut records = Vec::new();
    for request in requests {
        let verified = tokio::select! {
            biased;
            _ = state.cancel.cancelled() => {
                info!(query = %state.query.id, "verification cancelled");
                break;
            }
            verified = ctx.verifier.verify(bus, replies, &request) => verified,
        };
        match verified {
            Ok(record) => {
                if record.requires_human_review {
                    warn!(task = %record.task_id, score = record.score, "consensus flagged for human review");
                }
                audit::with_log(&state.audit, |log| log.record(TraceEntry::consensus(&record)));
                locked(&state.consensus).push(record.clone());
                records.push(record);
            }
            Err(e) => {
                error!(task = %request.task_id, error = %e, "verification aborted");
                break;
            }
        }
    }
    records
}

async fn build_report(state: &QueryState, status: QueryStatus) -> Report {
    let graph = state.graph.read().await;
    let tasks = graph
        .all_tasks()
        .map(|t| (t.id.clone(), t.status.clone()))
        .collect();
    let retries = graph
        .all_tasks()
        .map(|t| t.attempt.saturating_sub(1))
        .sum();
    Report {
        query_id: state.query.id,
        query: state.query.text.clone(),
        status,
        outputs: graph.completed_outputs(),
        tasks,
        consensus: locked(&state.consensus).clone(),
        retries,
        created_at: Utc::now(),
    }
}
