//! Final reports and where they are written.

use crate::core::task::{TaskId, TaskStatus};
use crate::error::{Error, Result};
use crate::orchestration::consensus::ConsensusRecord;
use crate::orchestration::orchestrator::{QueryId, QueryStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// Everything a query produced: terminal task outputs, final task
/// statuses, and the consensus records of verified tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub query_id: QueryId,
    pub query: String,
    pub status: QueryStatus,
    /// Outputs of every Completed task.
    pub outputs: BTreeMap<TaskId, Value>,
    pub tasks: BTreeMap<TaskId, TaskStatus>,
    pub consensus: Vec<ConsensusRecord>,
    pub retries: u32,
    pub created_at: DateTime<Utc>,
}

impl Report {
    pub fn output(&self, task_id: &TaskId) -> Option<&Value> {
        self.outputs.get(task_id)
    }

    pub fn flagged(&self) -> impl Iterator<Item = &ConsensusRecord> {
        self.consensus.iter().filter(|r| !r.is_accepted())
    }
}

/// Opaque handle to a persisted report.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReportRef(pub String);

impl std::fmt::Display for ReportRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn write(&self, report: &Report) -> Result<ReportRef>;
}

/// Writes each report to `<dir>/<query_id>.json`.
#[derive(Debug, Clone)]
pub struct JsonFileSink {
    dir: PathBuf,
}

impl JsonFileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, query_id: &QueryId) -> PathBuf {
        self.dir.join(format!("{}.json", query_id))
    }

    /// Read back a report written by this sink.
    pub async fn read(&self, query_id: &QueryId) -> Result<Report> {
        let data = tokio::fs::read_to_string(self.path_for(query_id)).await?;
        Ok(serde_json::from_str(&data)?)
    }
}

#[async_trait]
impl ReportSink for JsonFileSink {
    async fn write(&self, report: &Report) -> Result<ReportRef> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(&report.query_id);
        let json = serde_json::to_string_pretty(report)?;
        tokio::fs::write(&path, json).await?;
        tracing::info!(query = %report.query_id, path = %path.display(), "report written");
        Ok(ReportRef(path.display().to_string()))
    }
}

/// Keeps reports in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    reports: Mutex<Vec<Report>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<Report> {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get(&self, query_id: &QueryId) -> Option<Report> {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|r| &r.query_id == query_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.reports.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ReportSink for MemorySink {
    async fn write(&self, report: &Report) -> Result<ReportRef> {
        let mut reports = self.reports.lock().unwrap_or_else(PoisonError::into_inner);
        if reports.iter().any(|r| r.query_id == report.query_id) {
            return Err(Error::Sink(format!("report for {} already written", report.query_id)));
        }
        reports.push(report.clone());
        Ok(ReportRef(format!("memory:{}", report.query_id)))
    }
}
