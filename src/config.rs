use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::agent::AgentKind;
use crate::bus::DeliveryMode;
use crate::orchestration::retry::{Backoff, RetryPolicy};
use crate::orchestration::scheduler::FailurePolicy;
use crate::{Error, Result};

/// Engine configuration. Built once and handed by value (or clone) to the
/// components that need it; nothing reads it from global state.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub bus: BusConfig,
    pub agents: AgentsConfig,
    pub consensus: ConsensusConfig,
    pub audit: AuditConfig,
    pub retention: RetentionConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Transient failures are retried while `attempt <= max_retries`.
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_factor: f64,
    pub backoff_max_ms: u64,
    /// Delay before re-trying a dispatch that hit a full mailbox.
    pub dispatch_retry_delay_ms: u64,
    /// Deadline for tasks that do not set their own. `None` means unbounded.
    pub default_deadline_ms: Option<u64>,
    pub failure_policy: FailurePolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 100,
            backoff_factor: 2.0,
            backoff_max_ms: 10_000,
            dispatch_retry_delay_ms: 50,
            default_deadline_ms: Some(300_000),
            failure_policy: FailurePolicy::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.backoff_base_ms),
            self.backoff_factor,
            Duration::from_millis(self.backoff_max_ms),
        )
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.backoff())
    }

    pub fn dispatch_retry_delay(&self) -> Duration {
        Duration::from_millis(self.dispatch_retry_delay_ms)
    }

    pub fn default_deadline(&self) -> Option<Duration> {
        self.default_deadline_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BusConfig {
    /// Slots per agent-kind mailbox.
    pub mailbox_capacity: usize,
    pub mode: DeliveryMode,
    /// Extra time past a dispatch's deadline before it is redelivered.
    pub redelivery_grace_ms: u64,
    pub max_redeliveries: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 64,
            mode: DeliveryMode::default(),
            redelivery_grace_ms: 5_000,
            max_redeliveries: 2,
        }
    }
}

impl BusConfig {
    pub fn redelivery_grace(&self) -> Duration {
        Duration::from_millis(self.redelivery_grace_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentsConfig {
    /// Workers per kind when the kind has no entry in `concurrency`.
    pub default_concurrency: usize,
    pub concurrency: BTreeMap<AgentKind, usize>,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            default_concurrency: 2,
            concurrency: BTreeMap::new(),
        }
    }
}

impl AgentsConfig {
    pub fn concurrency_for(&self, kind: &AgentKind) -> usize {
        self.concurrency
            .get(kind)
            .copied()
            .unwrap_or(self.default_concurrency)
    }

    pub fn with_limit(mut self, kind: impl Into<AgentKind>, limit: usize) -> Self {
        self.concurrency.insert(kind.into(), limit);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Independent invocations per verified task (`N`).
    pub replicas: usize,
    pub threshold: f64,
    /// Minimum opinions needed to accept. Defaults to `ceil(N/2)+1`, capped at `N`.
    pub quorum: Option<usize>,
    pub verification_timeout_ms: u64,
    /// Extra rounds after a Flagged outcome before handing to human review.
    pub escalation_rounds: u32,
    /// Replica multiplier applied per escalation round.
    pub escalation_factor: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            replicas: 3,
            threshold: 0.8,
            quorum: None,
            verification_timeout_ms: 60_000,
            escalation_rounds: 0,
            escalation_factor: 2,
        }
    }
}

impl ConsensusConfig {
    pub fn verification_timeout(&self) -> Duration {
        Duration::from_millis(self.verification_timeout_ms)
    }

    /// Quorum for a round with `replicas` invocations.
    pub fn quorum_for(&self, replicas: usize) -> usize {
        match self.quorum {
            Some(q) => q,
            None => (replicas.div_ceil(2) + 1).min(replicas),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuditConfig {
    pub max_entries: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
        }
    }
}

/// How many finished queries the orchestrator keeps for status and audit
/// lookups. Running queries are never evicted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetentionConfig {
    pub max_finished_queries: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_finished_queries: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    pub debug: bool,
    pub json: bool,
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        tracing::debug!(path = %path.display(), "Config::load");
        if !path.exists() {
            tracing::debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        tracing::debug!(path = %path.display(), "config saved");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let c = &self.consensus;
        if !(0.0..=1.0).contains(&c.threshold) {
            return Err(Error::Validation(format!(
                "consensus.threshold must be within [0, 1], got {}",
                c.threshold
            )));
        }
        if c.replicas == 0 {
            return Err(Error::Validation("consensus.replicas must be at least 1".into()));
        }
        if let Some(q) = c.quorum {
            if q == 0 || q > c.replicas {
                return Err(Error::Validation(format!(
                    "consensus.quorum must be within 1..={}, got {}",
                    c.replicas, q
                )));
            }
        }
        if c.escalation_factor == 0 {
            return Err(Error::Validation("consensus.escalation_factor must be at least 1".into()));
        }
        if self.bus.mailbox_capacity == 0 {
            return Err(Error::Validation("bus.mailbox_capacity must be at least 1".into()));
        }
        if self.agents.default_concurrency == 0 {
            return Err(Error::Validation("agents.default_concurrency must be at least 1".into()));
        }
        if let Some((kind, _)) = self.agents.concurrency.iter().find(|(_, n)| **n == 0) {
            return Err(Error::Validation(format!(
                "agents.concurrency for {} must be at least 1",
                kind
            )));
        }
        if self.scheduler.backoff_factor < 1.0 {
            return Err(Error::Validation("scheduler.backoff_factor must be >= 1.0".into()));
        }
        if self.audit.max_entries == 0 {
            return Err(Error::Validation("audit.max_entries must be at least 1".into()));
        }
        if self.retention.max_finished_queries == 0 {
            return Err(Error::Validation(
                "retention.max_finished_queries must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
