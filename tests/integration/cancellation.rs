//! Query cancellation.

use std::time::Duration;

use conclave::orchestration::Plan;
use conclave::{QueryId, QueryStatus, TaskId, TaskSpec, TaskStatus};

use crate::fixtures::{chain, fast_config, Harness, ScriptedRunner, Step};

/// Poll until `task` is Running.
async fn wait_running(harness: &Harness, id: &QueryId, task: &str) {
    let task = TaskId::new(task);
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let status = harness.orchestrator.task_status(id, &task).await.unwrap();
            if status == TaskStatus::Running {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

/// Test: Cancelling a running query
/// Given two hanging tasks and a dependent of one of them
/// When the query is cancelled while both run
/// Then every task ends Cancelled, the dependent never starts, and the
/// report is written with status Cancelled
#[tokio::test]
async fn test_cancel_running_query() {
    let plan = Plan::new(vec![
        TaskSpec::new("a", "analyze"),
        TaskSpec::new("b", "analyze"),
        TaskSpec::new("c", "analyze").depends_on("a"),
    ]);
    let harness = Harness::new(
        plan,
        ScriptedRunner::new()
            .script("a", vec![Step::Hang])
            .script("b", vec![Step::Hang]),
        fast_config(),
    );

    let id = harness.orchestrator.submit_query("stop me").await.unwrap();
    wait_running(&harness, &id, "a").await;
    wait_running(&harness, &id, "b").await;

    harness.orchestrator.cancel_query(&id).unwrap();
    let status = tokio::time::timeout(Duration::from_secs(2), harness.orchestrator.wait_for(&id))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(status, QueryStatus::Cancelled);
    for task in ["a", "b", "c"] {
        let status = harness
            .orchestrator
            .task_status(&id, &TaskId::new(task))
            .await
            .unwrap();
        assert!(matches!(status, TaskStatus::Cancelled { .. }), "{} is {:?}", task, status);
    }
    assert!(!harness.runner.was_started("c"));

    let report = harness.sink.get(&id).unwrap();
    assert_eq!(report.status, QueryStatus::Cancelled);
    assert!(report.outputs.is_empty());
    assert_eq!(harness.sink.len(), 1);

    let log = harness.orchestrator.audit_log(&id).unwrap();
    assert!(log.iter().any(|e| e.event == "query_cancelled"));
}

/// Test: Cancelling during verification
/// Given a verified task whose replicas hang
/// When the query is cancelled while replicas run
/// Then the query ends Cancelled without a consensus record
#[tokio::test]
async fn test_cancel_during_verification() {
    let plan = Plan::new(vec![TaskSpec::new("check", "verify").verified()]);
    let runner = (0..3).fold(ScriptedRunner::new(), |runner, i| runner.replica(i, Step::Hang));
    let mut config = fast_config();
    config.consensus.verification_timeout_ms = 60_000;
    let harness = Harness::new(plan, runner, config);

    let id = harness.orchestrator.submit_query("verify me").await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while !harness.runner.log().iter().any(|i| i.replica.is_some()) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    harness.orchestrator.cancel_query(&id).unwrap();
    let status = tokio::time::timeout(Duration::from_secs(2), harness.orchestrator.wait_for(&id))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(status, QueryStatus::Cancelled);
    assert!(harness.orchestrator.consensus_records(&id).unwrap().is_empty());
    // The task itself finished before verification began.
    assert_eq!(
        harness
            .orchestrator
            .task_status(&id, &TaskId::new("check"))
            .await
            .unwrap(),
        TaskStatus::Completed
    );
}

/// Test: Cancelling a finished query changes nothing
#[tokio::test]
async fn test_cancel_after_completion_is_noop() {
    let harness = Harness::new(Plan::new(chain(&["a", "b"])), ScriptedRunner::new(), fast_config());
    let (id, status) = harness.run("done").await;
    assert_eq!(status, QueryStatus::Completed);

    harness.orchestrator.cancel_query(&id).unwrap();
    assert_eq!(harness.orchestrator.query_status(&id).unwrap(), QueryStatus::Completed);
    assert_eq!(
        harness.orchestrator.fetch_report(&id).unwrap().status,
        QueryStatus::Completed
    );
}
