//! Failure propagation tests.
//!
//! Covers both failure policies, dependency ordering, and termination over
//! generated graphs.

use std::collections::HashMap;

use conclave::config::Config;
use conclave::orchestration::{FailurePolicy, Plan};
use conclave::{QueryStatus, TaskId, TaskSpec, TaskStatus};

use crate::fixtures::{fast_config, Harness, Phase, ScriptedRunner, Step};

async fn status_of(harness: &Harness, id: &conclave::QueryId, task: &str) -> TaskStatus {
    harness
        .orchestrator
        .task_status(id, &TaskId::new(task))
        .await
        .unwrap()
}

fn diamond() -> Vec<TaskSpec> {
    vec![
        TaskSpec::new("a", "analyze"),
        TaskSpec::new("b", "analyze").depends_on("a"),
        TaskSpec::new("c", "analyze").depends_on("a"),
        TaskSpec::new("d", "analyze").depends_on("b").depends_on("c"),
    ]
}

/// Test: Fail-fast cancels only the failed branch
/// Given A -> {B, C} -> D where B fails fatally
/// When the query runs under fail-fast
/// Then B is Failed, C still completes, and D is Cancelled without running
#[tokio::test]
async fn test_fail_fast_cancels_dependents_of_failed_task() {
    let harness = Harness::new(
        Plan::new(diamond()),
        ScriptedRunner::new().script("b", vec![Step::Fatal("corrupt ledger".into())]),
        fast_config(),
    );

    let (id, status) = harness.run("diamond").await;

    assert!(matches!(status_of(&harness, &id, "b").await, TaskStatus::Failed { .. }));
    assert_eq!(status_of(&harness, &id, "c").await, TaskStatus::Completed);
    assert!(matches!(status_of(&harness, &id, "d").await, TaskStatus::Cancelled { .. }));
    assert!(!harness.runner.was_started("d"));
    // D is the only sink, so no required task completed.
    assert_eq!(status, QueryStatus::Failed);

    let report = harness.sink.get(&id).unwrap();
    assert_eq!(report.status, QueryStatus::Failed);
    assert!(report.output(&TaskId::new("c")).is_some());
    assert!(report.output(&TaskId::new("d")).is_none());
}

/// Test: Partial failure
/// Given the diamond plus an independent sink E fed by C
/// When B fails fatally
/// Then E completes and the query reports PartialFailure
#[tokio::test]
async fn test_independent_sink_gives_partial_failure() {
    let mut specs = diamond();
    specs.push(TaskSpec::new("e", "analyze").depends_on("c"));
    let harness = Harness::new(
        Plan::new(specs),
        ScriptedRunner::new().script("b", vec![Step::Fatal("boom".into())]),
        fast_config(),
    );

    let (id, status) = harness.run("diamond plus").await;

    assert_eq!(status, QueryStatus::PartialFailure);
    assert_eq!(status_of(&harness, &id, "e").await, TaskStatus::Completed);
    assert!(matches!(status_of(&harness, &id, "d").await, TaskStatus::Cancelled { .. }));
}

fn required_branch_plan() -> Plan {
    Plan::new(vec![
        TaskSpec::new("a", "analyze"),
        TaskSpec::new("b", "analyze").depends_on("a"),
        TaskSpec::new("d", "analyze").depends_on("b"),
        TaskSpec::new("r", "analyze").depends_on("a").required(true),
    ])
}

fn with_policy(policy: FailurePolicy) -> Config {
    let mut config = fast_config();
    config.scheduler.failure_policy = policy;
    config
}

/// Test: Best-effort completes when required tasks complete
/// Given a required task R and an unrelated branch B -> D where B fails
/// When the query runs under best-effort
/// Then the query is Completed and D is cancelled as unreachable
#[tokio::test]
async fn test_best_effort_ignores_unrelated_branch_failure() {
    let harness = Harness::new(
        required_branch_plan(),
        ScriptedRunner::new().script("b", vec![Step::Fatal("boom".into())]),
        with_policy(FailurePolicy::BestEffort),
    );

    let (id, status) = harness.run("best effort").await;

    assert_eq!(status, QueryStatus::Completed);
    assert_eq!(status_of(&harness, &id, "r").await, TaskStatus::Completed);
    assert!(matches!(status_of(&harness, &id, "b").await, TaskStatus::Failed { .. }));
    match status_of(&harness, &id, "d").await {
        TaskStatus::Cancelled { reason } => assert!(reason.contains("unreachable")),
        other => panic!("expected d cancelled, got {:?}", other),
    }

    // The failure stays visible in the trace.
    let trace = harness
        .orchestrator
        .task_trace(&id, &TaskId::new("b"))
        .await
        .unwrap();
    assert!(trace.entries.iter().any(|e| e.event == "task_failed"));
}

/// Test: Same plan under fail-fast
/// Given the required-branch plan
/// When the query runs under fail-fast
/// Then the failed branch makes the query a partial failure
#[tokio::test]
async fn test_fail_fast_reports_partial_failure_for_same_plan() {
    let harness = Harness::new(
        required_branch_plan(),
        ScriptedRunner::new().script("b", vec![Step::Fatal("boom".into())]),
        with_policy(FailurePolicy::FailFast),
    );

    let (id, status) = harness.run("fail fast").await;

    assert_eq!(status, QueryStatus::PartialFailure);
    match status_of(&harness, &id, "d").await {
        TaskStatus::Cancelled { reason } => assert!(reason.contains("b")),
        other => panic!("expected d cancelled, got {:?}", other),
    }
}

/// Test: Best-effort fails when a required task fails
#[tokio::test]
async fn test_best_effort_fails_when_required_task_fails() {
    let harness = Harness::new(
        required_branch_plan(),
        ScriptedRunner::new().script("r", vec![Step::Fatal("boom".into())]),
        with_policy(FailurePolicy::BestEffort),
    );

    let (_, status) = harness.run("required failure").await;
    assert_eq!(status, QueryStatus::Failed);
}

// ========== Properties over generated graphs ==========

/// Small deterministic generator so graph shapes are reproducible.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0 >> 33
    }

    fn chance(&mut self, percent: u64) -> bool {
        self.next() % 100 < percent
    }
}

/// A random DAG: edges only point from lower to higher indices.
fn generated_plan(seed: u64, size: usize) -> (Plan, Vec<String>) {
    let mut rng = Lcg(seed);
    let mut specs = Vec::with_capacity(size);
    let mut failing = Vec::new();
    for i in 0..size {
        let id = format!("t{}", i);
        let mut spec = TaskSpec::new(id.as_str(), if i % 2 == 0 { "analyze" } else { "retrieve" })
            .with_priority((rng.next() % 5) as i32);
        for dep in 0..i {
            if rng.chance(25) {
                spec = spec.depends_on(format!("t{}", dep));
            }
        }
        if rng.chance(10) {
            failing.push(id);
        }
        specs.push(spec);
    }
    (Plan::new(specs), failing)
}

fn scripted_failures(failing: &[String]) -> ScriptedRunner {
    failing.iter().fold(ScriptedRunner::new(), |runner, id| {
        runner.script(id, vec![Step::Fatal(format!("{} failed", id))])
    })
}

/// Test: No task starts before its dependencies finish
/// Given several generated graphs
/// When each query runs
/// Then every started task's dependencies finished before it started
#[tokio::test]
async fn test_tasks_never_start_before_dependencies_finish() {
    for seed in 1..=5u64 {
        let (plan, _) = generated_plan(seed, 12);
        let deps: HashMap<TaskId, Vec<TaskId>> = plan
            .nodes
            .iter()
            .map(|n| (n.id.clone(), n.depends_on.clone()))
            .collect();
        let harness = Harness::new(plan, ScriptedRunner::new(), fast_config());

        let (_, status) = harness.run("ordering").await;
        assert_eq!(status, QueryStatus::Completed, "seed {}", seed);

        let log = harness.runner.log();
        let finished: HashMap<TaskId, u64> = log
            .iter()
            .filter(|i| i.phase == Phase::Finished && i.succeeded)
            .map(|i| (i.task_id.clone(), i.seq))
            .collect();
        for started in log.iter().filter(|i| i.phase == Phase::Started) {
            for dep in &deps[&started.task_id] {
                let done = finished.get(dep).copied();
                assert!(
                    done.is_some_and(|seq| seq < started.seq),
                    "seed {}: {} started before {} finished",
                    seed,
                    started.task_id,
                    dep
                );
            }
        }
    }
}

/// Test: Every query terminates
/// Given generated graphs with randomly failing tasks, under both policies
/// When each query runs
/// Then it reaches a terminal status, every task is terminal, and no
/// descendant of a failed task ever started
#[tokio::test]
async fn test_generated_graphs_terminate() {
    for policy in [FailurePolicy::FailFast, FailurePolicy::BestEffort] {
        for seed in 10..16u64 {
            let (plan, failing) = generated_plan(seed, 14);
            let ids: Vec<TaskId> = plan.nodes.iter().map(|n| n.id.clone()).collect();
            let harness = Harness::new(plan, scripted_failures(&failing), with_policy(policy));

            let (id, status) = harness.run("terminate").await;
            assert!(status.is_terminal());
            if failing.is_empty() {
                assert_eq!(status, QueryStatus::Completed);
            }

            let report = harness.sink.get(&id).unwrap();
            assert_eq!(report.tasks.len(), ids.len());
            for task in &ids {
                let status = status_of(&harness, &id, task.as_str()).await;
                assert!(status.is_terminal(), "{:?}: {} is {:?}", policy, task, status);
                if failing.iter().any(|f| f == task.as_str()) {
                    // Failed when it ran, Cancelled when an upstream failure got there first.
                    assert_ne!(status, TaskStatus::Completed);
                }
            }
            for (task, _) in harness.runner.started() {
                let trace = harness.orchestrator.task_trace(&id, &task).await.unwrap();
                assert!(trace
                    .task
                    .depends_on
                    .iter()
                    .all(|dep| !failing.iter().any(|f| f == dep.as_str())));
            }
        }
    }
}
