//! Integration test suite for conclave.
//!
//! These tests drive queries end to end through the orchestrator: planning,
//! scheduling over the message bus, worker pools, consensus, and report
//! writing. Agents are scripted stubs, so every outcome is deterministic.
//!
//! # Test Categories
//!
//! - `workflow_e2e`: Full query execution and report output
//! - `failure_propagation`: Fail-fast and best-effort policies, ordering
//! - `retries`: Transient errors, deadlines, panics
//! - `consensus_flow`: Verification through replicas
//! - `backpressure`: Saturated mailboxes in both delivery modes
//! - `cancellation`: Query cancellation
//! - `retention`: Forgetting and evicting finished queries


mod cancellation;
mod failure_propagation;
mod retention;
mod retries;
mod workflow_e2e;
