//! Orchestration layer: worker pool, scheduler, consensus, and the
//! orchestrator façade that ties them together per query.

pub mod audit;
pub mod consensus;
pub mod orchestrator;
pub mod planner;
pub mod pool;
pub mod report;
pub mod retry;
pub mod scheduler;

pub use audit::{AuditLog, TaskTrace, TraceEntry, TraceLevel};
pub use consensus::{
    evaluate, Agreement, ConsensusOutcome, ConsensusRecord, ConsensusVerifier, ExactMatch,
    FieldMatch, NumericTolerance, Opinion, VerdictEquivalence,
};
pub use orchestrator::{derive_status, Orchestrator, Query, QueryId, QueryStatus};
pub use planner::{Plan, Planner, StagedPlanner, StaticPlanner};
pub use pool::{AgentStats, WorkerPool};
pub use report::{JsonFileSink, MemorySink, Report, ReportRef, ReportSink};
pub use retry::{Backoff, RetryDecision, RetryPolicy, RetryTracker};
pub use scheduler::{FailurePolicy, ScheduleOutcome, Scheduler, SchedulerEvent};
