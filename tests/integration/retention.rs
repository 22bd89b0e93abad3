//! How long finished queries stay around.

use std::time::Duration;

use conclave::orchestration::Plan;
use conclave::{Error, QueryStatus, TaskSpec};

use crate::fixtures::{chain, fast_config, Harness, ScriptedRunner, Step};

/// Test: Forgetting a finished query
/// Given a completed query
/// When it is forgotten
/// Then status lookups no longer find it, while the report stays in the sink
#[tokio::test]
async fn test_forget_finished_query() {
    let harness = Harness::new(Plan::new(chain(&["a", "b"])), ScriptedRunner::new(), fast_config());
    let (id, status) = harness.run("done").await;
    assert_eq!(status, QueryStatus::Completed);

    harness.orchestrator.forget_query(&id).unwrap();

    assert!(matches!(
        harness.orchestrator.query_status(&id),
        Err(Error::QueryNotFound(_))
    ));
    assert!(matches!(harness.orchestrator.audit_log(&id), Err(Error::QueryNotFound(_))));
    assert!(harness.orchestrator.queries().is_empty());
    assert!(harness.sink.get(&id).is_some());
    assert!(matches!(
        harness.orchestrator.forget_query(&id),
        Err(Error::QueryNotFound(_))
    ));
}

/// Test: A running query cannot be forgotten
/// Given a query whose only task hangs
/// When it is forgotten before and after cancellation
/// Then the first attempt yields NotReady and the second succeeds
#[tokio::test]
async fn test_forget_running_query_is_refused() {
    let harness = Harness::new(
        Plan::new(vec![TaskSpec::new("a", "analyze")]),
        ScriptedRunner::new().script("a", vec![Step::Hang]),
        fast_config(),
    );
    let id = harness.orchestrator.submit_query("hang").await.unwrap();

    assert!(matches!(
        harness.orchestrator.forget_query(&id),
        Err(Error::NotReady(_))
    ));
    assert_eq!(harness.orchestrator.query_status(&id).unwrap(), QueryStatus::Running);

    harness.orchestrator.cancel_query(&id).unwrap();
    let status = tokio::time::timeout(Duration::from_secs(2), harness.orchestrator.wait_for(&id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status, QueryStatus::Cancelled);
    harness.orchestrator.forget_query(&id).unwrap();
}

/// Test: Old finished queries are evicted on submit
/// Given a limit of two finished queries and three finished queries
/// When a fourth query is submitted
/// Then the oldest one is dropped and the rest stay visible
#[tokio::test]
async fn test_oldest_finished_queries_are_evicted() {
    let mut config = fast_config();
    config.retention.max_finished_queries = 2;
    let harness = Harness::new(Plan::new(chain(&["a"])), ScriptedRunner::new(), config);

    let mut ids = Vec::new();
    for i in 0..3 {
        let (id, status) = harness.run(&format!("query {}", i)).await;
        assert_eq!(status, QueryStatus::Completed);
        ids.push(id);
    }
    assert_eq!(harness.orchestrator.queries().len(), 3);

    let (latest, _) = harness.run("query 3").await;

    assert!(matches!(
        harness.orchestrator.query_status(&ids[0]),
        Err(Error::QueryNotFound(_))
    ));
    let kept: Vec<_> = harness.orchestrator.queries().into_iter().map(|q| q.id).collect();
    assert_eq!(kept, vec![ids[1], ids[2], latest]);
    assert_eq!(harness.sink.len(), 4);
}
