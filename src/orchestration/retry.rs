//! Retry decisions for failed invocations.
//!
//! The scheduler asks a [`RetryPolicy`] what to do with every error reply;
//! the answer depends only on the error class and the attempt number, so
//! identical failures always get identical treatment.

use crate::agent::{AgentError, ErrorClass};
use crate::core::task::TaskId;
use std::collections::HashMap;
use std::time::Duration;

/// Exponential backoff, capped. Millisecond resolution.
///
/// The delay before dispatching attempt `a + 1` after attempt `a` failed is
/// `min(base * factor^(a-1), max)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub factor: f64,
    pub max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, factor: f64, max: Duration) -> Self {
        Self { base, factor, max }
    }

    /// Delay after the given (1-based) failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled_ms = self.base.as_millis() as f64 * self.factor.powi(exponent);
        if !scaled_ms.is_finite() || scaled_ms >= self.max.as_millis() as f64 {
            return self.max;
        }
        Duration::from_millis(scaled_ms.round() as u64)
    }
}

/// What to do with a task whose invocation failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue after `delay`.
    Retry { delay: Duration },
    /// Mark the task Failed.
    Fail { reason: String },
    /// Mark the task Cancelled.
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Backoff) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    /// Decide the fate of `attempt` (1-based) that ended with `error`.
    ///
    /// Only transient errors are retried, at most `max_retries` times, so a
    /// task is dispatched at most `1 + max_retries` times.
    pub fn decide(&self, error: &AgentError, attempt: u32) -> RetryDecision {
        match error.class() {
            ErrorClass::Transient if attempt <= self.max_retries => RetryDecision::Retry {
                delay: self.backoff.delay(attempt),
            },
            ErrorClass::Transient => RetryDecision::Fail {
                reason: format!("{} (gave up after {} attempts)", error, attempt),
            },
            ErrorClass::Input | ErrorClass::Fatal => RetryDecision::Fail {
                reason: error.to_string(),
            },
            ErrorClass::Cancelled => RetryDecision::Cancel,
        }
    }
}

/// Counts retries per task.
#[derive(Debug, Clone, Default)]
pub struct RetryTracker {
    retries: HashMap<TaskId, u32>,
}

impl RetryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns 0 if the task has not been retried.
    pub fn get_retries(&self, task_id: &TaskId) -> u32 {
        self.retries.get(task_id).copied().unwrap_or(0)
    }

    /// Returns the new retry count.
    pub fn increment(&mut self, task_id: &TaskId) -> u32 {
        let count = self.retries.entry(task_id.clone()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn total(&self) -> u32 {
        self.retries.values().sum()
    }

    pub fn len(&self) -> usize {
        self.retries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.retries.is_empty()
    }
}
