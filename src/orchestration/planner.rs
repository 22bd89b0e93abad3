//! Query decomposition.
//!
//! A [`Planner`] turns a query into the nodes and edges of a task graph. The
//! orchestrator validates the plan by building a [`TaskGraph`] from it, so a
//! planner never has to check for cycles itself.

use crate::agent::kinds;
use crate::core::dag::TaskGraph;
use crate::core::task::{TaskId, TaskSpec};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Planner output: task specs plus `(dependency, dependent)` edges.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Plan {
    pub nodes: Vec<TaskSpec>,
    #[serde(default)]
    pub edges: Vec<(TaskId, TaskId)>,
}

impl Plan {
    pub fn new(nodes: Vec<TaskSpec>) -> Self {
        Self {
            nodes,
            edges: Vec::new(),
        }
    }

    pub fn with_edge(mut self, from: impl Into<TaskId>, to: impl Into<TaskId>) -> Self {
        self.edges.push((from.into(), to.into()));
        self
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Validate and build the graph.
    pub fn into_graph(self) -> Result<TaskGraph> {
        TaskGraph::build(self.nodes, self.edges)
    }
}

#[async_trait]
pub trait Planner: Send + Sync {
    async fn decompose(&self, query: &str) -> Result<Plan>;
}

/// The default five-stage pipeline:
/// retrieve → analyze → compliance_check → verify → synthesize.
///
/// Every query gets the same shape. Only the verify stage goes through
/// consensus.
#[derive(Debug, Clone, Copy, Default)]
pub struct StagedPlanner;

impl StagedPlanner {
    pub const STAGES: [&'static str; 5] = [
        kinds::RETRIEVE,
        kinds::ANALYZE,
        kinds::COMPLIANCE_CHECK,
        kinds::VERIFY,
        kinds::SYNTHESIZE,
    ];

    pub fn new() -> Self {
        Self
    }

    pub fn plan(&self, query: &str) -> Plan {
        let mut nodes = Vec::with_capacity(Self::STAGES.len());
        let mut previous: Option<&str> = None;
        for (i, stage) in Self::STAGES.iter().enumerate() {
            let mut spec = TaskSpec::new(*stage, *stage).with_priority(i as i32 + 1);
            if i == 0 {
                spec = spec.with_input(json!({ "query": query }));
            }
            if let Some(dep) = previous {
                spec = spec.depends_on(dep);
            }
            if *stage == kinds::VERIFY {
                spec = spec.verified();
            }
            nodes.push(spec);
            previous = Some(*stage);
        }
        Plan::new(nodes)
    }
}

#[async_trait]
impl Planner for StagedPlanner {
    async fn decompose(&self, query: &str) -> Result<Plan> {
        tracing::debug!(stages = Self::STAGES.len(), "staged plan");
        Ok(self.plan(query))
    }
}

/// Returns a fixed plan for every query.
#[derive(Debug, Clone)]
pub struct StaticPlanner {
    plan: Plan,
}

impl StaticPlanner {
    pub fn new(plan: Plan) -> Self {
        Self { plan }
    }
}

#[async_trait]
impl Planner for StaticPlanner {
    async fn decompose(&self, _query: &str) -> Result<Plan> {
        Ok(self.plan.clone())
    }
}
