//! Retry tests: deadlines, transient errors, and panicking agents.
//!
//! Timing-dependent tests run on paused time so deadlines and backoff
//! elapse instantly.

use std::time::Duration;

use serde_json::json;

use conclave::config::Config;
use conclave::orchestration::Plan;
use conclave::{QueryStatus, TaskId, TaskSpec, TaskStatus};

use crate::fixtures::{fast_config, Harness, ScriptedRunner, Step};

fn retry_config(max_retries: u32) -> Config {
    let mut config = fast_config();
    config.scheduler.max_retries = max_retries;
    config
}

/// Test: Timeouts are retried until success
/// Given task X whose first two invocations overrun a 100ms deadline
/// And max_retries = 2
/// When the query runs
/// Then X ends Completed with attempt = 3
#[tokio::test(start_paused = true)]
async fn test_timeouts_retried_until_success() {
    let plan = Plan::new(vec![
        TaskSpec::new("x", "analyze").with_deadline(Duration::from_millis(100))
    ]);
    let slow = Step::Sleep(Duration::from_secs(60), json!("late"));
    let harness = Harness::new(
        plan,
        ScriptedRunner::new().script("x", vec![slow.clone(), slow, Step::Ok(json!("on time"))]),
        retry_config(2),
    );

    let (id, status) = harness.run("flaky").await;

    assert_eq!(status, QueryStatus::Completed);
    let trace = harness
        .orchestrator
        .task_trace(&id, &TaskId::new("x"))
        .await
        .unwrap();
    assert_eq!(trace.task.status, TaskStatus::Completed);
    assert_eq!(trace.task.attempt, 3);
    assert_eq!(trace.task.output, Some(json!("on time")));

    let attempts: Vec<u32> = harness.runner.started().into_iter().map(|(_, a)| a).collect();
    assert_eq!(attempts, vec![1, 2, 3]);

    let report = harness.sink.get(&id).unwrap();
    assert_eq!(report.retries, 2);
}

/// Test: Backoff grows between retries
/// Given two transient failures with base 10ms and factor 2
/// When the task is retried
/// Then the recorded delays are 10ms then 20ms
#[tokio::test(start_paused = true)]
async fn test_retry_backoff_grows() {
    let harness = Harness::new(
        Plan::new(vec![TaskSpec::new("x", "analyze")]),
        ScriptedRunner::new().script(
            "x",
            vec![
                Step::Transient("rate limited".into()),
                Step::Transient("rate limited".into()),
            ],
        ),
        retry_config(3),
    );

    let (id, status) = harness.run("backoff").await;
    assert_eq!(status, QueryStatus::Completed);

    let trace = harness
        .orchestrator
        .task_trace(&id, &TaskId::new("x"))
        .await
        .unwrap();
    let delays: Vec<u64> = trace
        .entries
        .iter()
        .filter(|e| e.event == "task_retrying")
        .map(|e| e.detail["delay_ms"].as_u64().unwrap())
        .collect();
    assert_eq!(delays, vec![10, 20]);
}

/// Test: Retries are bounded
/// Given a task that always fails transiently and max_retries = 2
/// When the query runs
/// Then the task is dispatched three times and ends Failed
#[tokio::test(start_paused = true)]
async fn test_retries_exhausted_fails_task() {
    let always = Step::Transient("upstream unavailable".into());
    let harness = Harness::new(
        Plan::new(vec![TaskSpec::new("x", "analyze")]),
        ScriptedRunner::new().script("x", vec![always.clone(), always.clone(), always.clone(), always]),
        retry_config(2),
    );

    let (id, status) = harness.run("doomed").await;

    assert_eq!(status, QueryStatus::Failed);
    assert_eq!(harness.runner.started().len(), 3);
    match harness
        .orchestrator
        .task_status(&id, &TaskId::new("x"))
        .await
        .unwrap()
    {
        TaskStatus::Failed { error } => assert!(error.contains("gave up after 3 attempts")),
        other => panic!("expected failed, got {:?}", other),
    }
}

/// Test: Panics are fatal
/// Given an agent that panics
/// When the query runs
/// Then the task fails once without retry and the worker survives
#[tokio::test(start_paused = true)]
async fn test_panicking_agent_is_not_retried() {
    let harness = Harness::new(
        Plan::new(vec![
            TaskSpec::new("boom", "analyze"),
            TaskSpec::new("after", "analyze"),
        ]),
        ScriptedRunner::new().script("boom", vec![Step::Panic]),
        retry_config(3),
    );

    let (id, status) = harness.run("panic").await;

    assert_eq!(status, QueryStatus::PartialFailure);
    let boom: Vec<_> = harness
        .runner
        .started()
        .into_iter()
        .filter(|(task, _)| task.as_str() == "boom")
        .collect();
    assert_eq!(boom.len(), 1);
    match harness
        .orchestrator
        .task_status(&id, &TaskId::new("boom"))
        .await
        .unwrap()
    {
        TaskStatus::Failed { error } => assert!(error.contains("panicked")),
        other => panic!("expected failed, got {:?}", other),
    }
    assert_eq!(
        harness
            .orchestrator
            .task_status(&id, &TaskId::new("after"))
            .await
            .unwrap(),
        TaskStatus::Completed
    );
}

/// Test: Input errors are not retried
#[tokio::test]
async fn test_rejected_input_fails_without_retry() {
    let harness = Harness::new(
        Plan::new(vec![TaskSpec::new("x", "analyze").with_input(json!({"reject": true}))]),
        ScriptedRunner::new(),
        retry_config(3),
    );

    let (id, status) = harness.run("bad input").await;

    assert_eq!(status, QueryStatus::Failed);
    // Validation runs before the agent, so nothing was started.
    assert!(harness.runner.started().is_empty());
    let stats = harness.orchestrator.agent_stats(&id).unwrap();
    assert_eq!(stats[&conclave::AgentKind::new("analyze")].failed, 1);
}

/// Test: An agent refusing its input is not retried
/// Given task X whose agent reports an input error on its first run
/// And max_retries = 3
/// When the query runs
/// Then X fails after exactly one attempt and no retry is recorded
#[tokio::test]
async fn test_agent_input_error_fails_without_retry() {
    let harness = Harness::new(
        Plan::new(vec![TaskSpec::new("x", "analyze")]),
        ScriptedRunner::new().script("x", vec![Step::Input("malformed upstream".into())]),
        retry_config(3),
    );

    let (id, status) = harness.run("bad payload").await;

    assert_eq!(status, QueryStatus::Failed);
    assert_eq!(harness.runner.started(), vec![(TaskId::new("x"), 1)]);
    let task = harness
        .orchestrator
        .task_status(&id, &TaskId::new("x"))
        .await
        .unwrap();
    assert!(matches!(task, TaskStatus::Failed { .. }));
    let log = harness.orchestrator.audit_log(&id).unwrap();
    assert!(!log.iter().any(|e| e.event == "task_retrying"));
    assert_eq!(harness.sink.get(&id).unwrap().retries, 0);
}
