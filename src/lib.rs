//! Conclave: a multi-agent task orchestration engine.
//!
//! A query is decomposed by a [`Planner`] into a [`TaskGraph`], scheduled
//! through a [`MessageBus`] onto per-kind worker pools running
//! [`AgentRunner`]s, and optionally verified by consensus before the
//! [`Orchestrator`] writes a single [`Report`].

pub mod agent;
pub mod bus;
pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;

pub use agent::{
    AgentError, AgentKind, AgentRegistry, AgentRunner, ErrorClass, TaskOutput, TaskRequest,
};
pub use bus::{DeliveryMode, Message, MessageBus};
pub use config::Config;
pub use crate::core::{GraphStatus, Task, TaskGraph, TaskId, TaskSpec, TaskStatus};
pub use error::{Error, Result};
pub use orchestration::{
    ConsensusOutcome, ConsensusRecord, FailurePolicy, Orchestrator, Plan, Planner, QueryId,
    QueryStatus, Report, ReportRef, ReportSink, StagedPlanner,
};
