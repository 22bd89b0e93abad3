//! Consensus verification for tasks whose output must be confirmed by
//! independent invocations.
//!
//! The decision itself ([`evaluate`]) is a pure function of the opinions,
//! the threshold, and the quorum. [`ConsensusVerifier::verify`] does the I/O
//! around it: dispatching replicas through the bus and collecting their
//! replies until every replica answered or the verification timeout fired.

use crate::agent::TaskRequest;
use crate::bus::{Message, MessageBus, MessagePayload};
use crate::config::ConsensusConfig;
use crate::core::task::TaskId;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const REPLICA_DISPATCH_RETRY: Duration = Duration::from_millis(20);

/// One replica's verdict on a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opinion {
    pub agent_instance_id: String,
    pub verdict: Value,
    /// Within [0, 1].
    pub confidence: f64,
}

impl Opinion {
    pub fn new(agent_instance_id: impl Into<String>, verdict: Value, confidence: f64) -> Self {
        let confidence = if confidence.is_nan() {
            0.0
        } else {
            confidence.clamp(0.0, 1.0)
        };
        Self {
            agent_instance_id: agent_instance_id.into(),
            verdict,
            confidence,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusOutcome {
    Accepted,
    Flagged,
}

impl std::fmt::Display for ConsensusOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsensusOutcome::Accepted => write!(f, "accepted"),
            ConsensusOutcome::Flagged => write!(f, "flagged"),
        }
    }
}

// ========== Verdict equivalence ==========

/// Decides whether two verdicts count as the same answer.
pub trait VerdictEquivalence: Send + Sync {
    fn equivalent(&self, a: &Value, b: &Value) -> bool;

    fn name(&self) -> &str {
        "custom"
    }
}

/// Verdicts must be equal JSON values.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactMatch;

impl VerdictEquivalence for ExactMatch {
    fn equivalent(&self, a: &Value, b: &Value) -> bool {
        a == b
    }

    fn name(&self) -> &str {
        "exact_match"
    }
}

/// Numbers within `tolerance` of each other are equivalent. Anything else
/// falls back to equality.
#[derive(Debug, Clone, Copy)]
pub struct NumericTolerance {
    pub tolerance: f64,
}

impl VerdictEquivalence for NumericTolerance {
    fn equivalent(&self, a: &Value, b: &Value) -> bool {
        match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => (x - y).abs() <= self.tolerance,
            _ => a == b,
        }
    }

    fn name(&self) -> &str {
        "numeric_tolerance"
    }
}

/// Only the field at a JSON pointer (e.g. `/label`) is compared. Verdicts
/// missing the field are never equivalent to anything.
#[derive(Debug, Clone)]
pub struct FieldMatch {
    pub pointer: String,
}

impl FieldMatch {
    pub fn new(pointer: impl Into<String>) -> Self {
        Self {
            pointer: pointer.into(),
        }
    }
}

impl VerdictEquivalence for FieldMatch {
    fn equivalent(&self, a: &Value, b: &Value) -> bool {
        match (a.pointer(&self.pointer), b.pointer(&self.pointer)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        }
    }

    fn name(&self) -> &str {
        "field_match"
    }
}

// ========== Agreement ==========

/// Result of scoring a set of opinions.
#[derive(Debug, Clone, PartialEq)]
pub struct Agreement {
    pub score: f64,
    pub quorum_met: bool,
    pub outcome: ConsensusOutcome,
    /// Number of verdict groups.
    pub groups: usize,
    /// Representative verdict of the heaviest group.
    pub leading_verdict: Option<Value>,
    pub reasons: Vec<String>,
}

fn canonical_order(a: &Opinion, b: &Opinion) -> Ordering {
    a.verdict
        .to_string()
        .cmp(&b.verdict.to_string())
        .then(b.confidence.total_cmp(&a.confidence))
        .then(a.agent_instance_id.cmp(&b.agent_instance_id))
}

/// Score `opinions` and decide the outcome.
///
/// Opinions are grouped by `equivalence` against each group's first member,
/// after a canonical sort so the arrival order never matters. The score is
/// the heaviest group's confidence mass over the total mass (0 when the
/// total is 0). Accepted iff `score >= threshold` and at least `quorum`
/// opinions were received.
pub fn evaluate(
    opinions: &[Opinion],
    threshold: f64,
    quorum: usize,
    equivalence: &dyn VerdictEquivalence,
) -> Agreement {
    let mut sorted: Vec<&Opinion> = opinions.iter().collect();
    sorted.sort_by(|a, b| canonical_order(a, b));

    // (representative verdict, mass)
    let mut groups: Vec<(&Value, f64)> = Vec::new();
    for opinion in sorted {
        match groups
            .iter_mut()
            .find(|(rep, _)| equivalence.equivalent(rep, &opinion.verdict))
        {
            Some(group) => group.1 += opinion.confidence,
            None => groups.push((&opinion.verdict, opinion.confidence)),
        }
    }

    let total: f64 = groups.iter().map(|(_, mass)| mass).sum();
    let mut leading: Option<(&Value, f64)> = None;
    for &(verdict, mass) in &groups {
        if leading.map_or(true, |(_, best)| mass > best) {
            leading = Some((verdict, mass));
        }
    }
    let score = match leading {
        Some((_, mass)) if total > 0.0 => mass / total,
        _ => 0.0,
    };

    let quorum_met = opinions.len() >= quorum;
    let outcome = if quorum_met && score >= threshold {
        ConsensusOutcome::Accepted
    } else {
        ConsensusOutcome::Flagged
    };

    let mut reasons = Vec::new();
    if !quorum_met {
        reasons.push(format!(
            "quorum unmet: {} of {} required opinions",
            opinions.len(),
            quorum
        ));
    }
    if score < threshold {
        reasons.push(format!(
            "agreement score {:.3} below threshold {}",
            score, threshold
        ));
    }
    if groups.len() > 1 {
        reasons.push(format!("verdicts split across {} groups", groups.len()));
    }

    Agreement {
        score,
        quorum_met,
        outcome,
        groups: groups.len(),
        leading_verdict: leading.map(|(v, _)| v.clone()),
        reasons,
    }
}

// ========== Records ==========

/// Finalized verification of one task. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusRecord {
    pub task_id: TaskId,
    /// In arrival order.
    pub opinions: Vec<Opinion>,
    pub threshold: f64,
    pub quorum: usize,
    /// Replicas dispatched in the deciding round.
    pub replicas: usize,
    pub score: f64,
    pub quorum_met: bool,
    pub outcome: ConsensusOutcome,
    /// 0 for the first round, incremented per escalation.
    pub round: u32,
    pub verdict: Option<Value>,
    pub disagreement_reasons: Vec<String>,
    pub requires_human_review: bool,
    pub decided_at: DateTime<Utc>,
}

impl ConsensusRecord {
    pub fn is_accepted(&self) -> bool {
        self.outcome == ConsensusOutcome::Accepted
    }
}

// ========== Verifier ==========

pub struct ConsensusVerifier {
    config: ConsensusConfig,
    equivalence: Arc<dyn VerdictEquivalence>,
}

impl ConsensusVerifier {
    pub fn new(config: ConsensusConfig) -> Self {
        Self {
            config,
            equivalence: Arc::new(ExactMatch),
        }
    }

    pub fn with_equivalence(mut self, equivalence: Arc<dyn VerdictEquivalence>) -> Self {
        self.equivalence = equivalence;
        self
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    /// Build the record for one round. Pure apart from the timestamp.
    pub fn decide(
        &self,
        task_id: &TaskId,
        opinions: Vec<Opinion>,
        replicas: usize,
        round: u32,
    ) -> ConsensusRecord {
        let quorum = self.config.quorum_for(replicas);
        let agreement = evaluate(&opinions, self.config.threshold, quorum, self.equivalence.as_ref());
        let flagged = agreement.outcome == ConsensusOutcome::Flagged;
        ConsensusRecord {
            task_id: task_id.clone(),
            opinions,
            threshold: self.config.threshold,
            quorum,
            replicas,
            score: agreement.score,
            quorum_met: agreement.quorum_met,
            outcome: agreement.outcome,
            round,
            verdict: if flagged { None } else { agreement.leading_verdict },
            disagreement_reasons: agreement.reasons,
            requires_human_review: flagged && round >= self.config.escalation_rounds,
            decided_at: Utc::now(),
        }
    }

    /// Verify the task behind `request` by dispatching independent replicas
    /// of it to its own agent kind.
    ///
    /// Each round waits for every replica or the verification timeout. A
    /// Flagged round is escalated with `escalation_factor` times as many
    /// replicas while escalation rounds remain.
    pub async fn verify(
        &self,
        bus: &MessageBus,
        replies: &mut mpsc::UnboundedReceiver<Message>,
        request: &TaskRequest,
    ) -> Result<ConsensusRecord> {
        let mut next_replica = 0u32;
        let mut replicas = self.config.replicas;
        let mut round = 0u32;

        loop {
            let opinions = self
                .collect_round(bus, replies, request, replicas, &mut next_replica)
                .await?;
            let record = self.decide(&request.task_id, opinions, replicas, round);
            info!(
                task = %request.task_id,
                round,
                replicas,
                received = record.opinions.len(),
                score = record.score,
                outcome = %record.outcome,
                "consensus round decided"
            );
            if record.is_accepted() || round >= self.config.escalation_rounds {
                return Ok(record);
            }
            round += 1;
            replicas = replicas.saturating_mul(self.config.escalation_factor);
            warn!(task = %request.task_id, round, replicas, "consensus flagged, escalating");
        }
    }

    async fn collect_round(
        &self,
        bus: &MessageBus,
        replies: &mut mpsc::UnboundedReceiver<Message>,
        request: &TaskRequest,
        replicas: usize,
        next_replica: &mut u32,
    ) -> Result<Vec<Opinion>> {
        let deadline = Instant::now() + self.config.verification_timeout();
        let mut outstanding = BTreeSet::new();

        for _ in 0..replicas {
            let replica = *next_replica;
            *next_replica += 1;
            let mut copy = request.clone();
            copy.replica = Some(replica);
            if self.dispatch_replica(bus, copy, deadline).await? {
                outstanding.insert(replica);
            }
        }

        let mut opinions = Vec::with_capacity(outstanding.len());
        while !outstanding.is_empty() {
            let message = match tokio::time::timeout_at(deadline, replies.recv()).await {
                Err(_) => {
                    debug!(task = %request.task_id, missing = outstanding.len(), "verification timed out");
                    break;
                }
                Ok(None) => return Err(Error::BusClosed),
                Ok(Some(message)) => message,
            };
            bus.acknowledge(&message.delivery_key());

            let replica = match message.replica {
                Some(r) if message.correlation_id == request.task_id && outstanding.remove(&r) => r,
                _ => {
                    debug!(delivery = %message.delivery_key(), "reply outside the current round ignored");
                    continue;
                }
            };
            match message.payload {
                MessagePayload::Result { output } => opinions.push(Opinion::new(
                    format!("{}/r{}", message.sender, replica),
                    output.value,
                    output.confidence,
                )),
                MessagePayload::Error { error } => {
                    warn!(task = %request.task_id, replica, error = %error, "replica failed, counted as missing");
                }
                other => {
                    warn!(task = %request.task_id, kind = ?other.kind(), "unexpected reply payload");
                }
            }
        }

        if !outstanding.is_empty() {
            let cancel = Message::cancel(request.task_id.clone(), request.kind.clone(), request.attempt);
            if let Err(e) = bus.try_send(cancel) {
                debug!(task = %request.task_id, error = %e, "cancel for stragglers not delivered");
            }
        }
        bus.forget_task(&request.task_id);
        Ok(opinions)
    }

    /// Returns false when the mailbox stayed full until the round deadline.
    async fn dispatch_replica(
        &self,
        bus: &MessageBus,
        request: TaskRequest,
        deadline: Instant,
    ) -> Result<bool> {
        let message = Message::dispatch(request);
        loop {
            match bus.try_send(message.clone()) {
                Ok(()) => return Ok(true),
                Err(Error::MailboxFull { .. }) => {
                    if Instant::now() + REPLICA_DISPATCH_RETRY >= deadline {
                        warn!(delivery = %message.delivery_key(), "replica not dispatched before timeout");
                        return Ok(false);
                    }
                    tokio::time::sleep(REPLICA_DISPATCH_RETRY).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl std::fmt::Debug for ConsensusVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsensusVerifier")
            .field("config", &self.config)
            .field("equivalence", &self.equivalence.name())
            .finish()
    }
}
