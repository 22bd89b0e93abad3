//! End-to-end query execution tests.

use std::sync::Arc;

use serde_json::json;

use conclave::orchestration::{JsonFileSink, MemorySink, Plan, StagedPlanner};
use conclave::{
    AgentKind, AgentRegistry, Error, Orchestrator, QueryStatus, Report, TaskId, TaskSpec, TaskStatus,
};

use crate::fixtures::{chain, fast_config, Harness, ScriptedRunner, Step};

/// Test: Linear chain completes
/// Given tasks A -> B -> C whose runners all succeed
/// When the query runs
/// Then every task is Completed and the query is Completed
#[tokio::test]
async fn test_linear_chain_completes() {
    let harness = Harness::new(
        Plan::new(chain(&["a", "b", "c"])),
        ScriptedRunner::new(),
        fast_config(),
    );

    let (id, status) = harness.run("linear").await;
    assert_eq!(status, QueryStatus::Completed);

    for task in ["a", "b", "c"] {
        let status = harness
            .orchestrator
            .task_status(&id, &TaskId::new(task))
            .await
            .unwrap();
        assert_eq!(status, TaskStatus::Completed);
    }

    let order: Vec<String> = harness
        .runner
        .started()
        .into_iter()
        .map(|(id, _)| id.to_string())
        .collect();
    assert_eq!(order, vec!["a", "b", "c"]);

    let report = harness.orchestrator.fetch_report(&id).unwrap();
    assert_eq!(report.status, QueryStatus::Completed);
    assert_eq!(report.outputs.len(), 3);
    assert_eq!(report.output(&TaskId::new("c")), Some(&json!("c-out")));
    assert!(report.consensus.is_empty());
}

/// Test: Upstream outputs reach dependents
/// Given A and B feeding C
/// When C is dispatched
/// Then its request carries both upstream outputs and the query text
#[tokio::test]
async fn test_dependents_receive_upstream_outputs() {
    use async_trait::async_trait;
    use conclave::{AgentError, AgentRunner, TaskOutput, TaskRequest};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Capture {
        seen: Mutex<Vec<TaskRequest>>,
    }

    #[async_trait]
    impl AgentRunner for Capture {
        async fn process(&self, request: &TaskRequest) -> Result<TaskOutput, AgentError> {
            self.seen.lock().unwrap().push(request.clone());
            Ok(TaskOutput::new(json!({ "from": request.task_id.as_str() })))
        }
    }

    let plan = Plan::new(vec![
        TaskSpec::new("a", "retrieve"),
        TaskSpec::new("b", "retrieve"),
        TaskSpec::new("c", "analyze")
            .depends_on("a")
            .depends_on("b")
            .with_input(json!({"mode": "full"})),
    ]);
    let capture = Arc::new(Capture::default());
    let registry = AgentRegistry::new()
        .register("retrieve", capture.clone())
        .register("analyze", capture.clone());
    let orchestrator = Orchestrator::new(
        fast_config(),
        registry,
        Arc::new(conclave::orchestration::StaticPlanner::new(plan)),
        Arc::new(MemorySink::new()),
    )
    .unwrap();

    let id = orchestrator.submit_query("who paid whom").await.unwrap();
    assert_eq!(orchestrator.wait_for(&id).await.unwrap(), QueryStatus::Completed);

    let seen = capture.seen.lock().unwrap();
    let c = seen.iter().find(|r| r.task_id.as_str() == "c").unwrap();
    assert_eq!(c.query, "who paid whom");
    assert_eq!(c.input, json!({"mode": "full"}));
    assert_eq!(c.upstream.len(), 2);
    assert_eq!(c.upstream[&TaskId::new("a")], json!({"from": "a"}));
    assert_eq!(c.upstream[&TaskId::new("b")], json!({"from": "b"}));
}

/// Test: Staged pipeline
/// Given the default five-stage planner
/// When a query runs with agreeing verifier replicas
/// Then the query completes with one accepted consensus record
#[tokio::test]
async fn test_staged_pipeline_end_to_end() {
    let runner = Arc::new(ScriptedRunner::new());
    let registry = StagedPlanner::STAGES
        .iter()
        .fold(AgentRegistry::new(), |registry, stage| {
            registry.register(*stage, runner.clone())
        });
    let sink = Arc::new(MemorySink::new());
    let orchestrator = Orchestrator::new(
        fast_config(),
        registry,
        Arc::new(StagedPlanner::new()),
        sink.clone(),
    )
    .unwrap();

    let id = orchestrator.submit_query("screen account 42").await.unwrap();
    let status = orchestrator.wait_for(&id).await.unwrap();
    assert_eq!(status, QueryStatus::Completed);

    let records = orchestrator.consensus_records(&id).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].task_id, TaskId::new("verify"));
    assert!(records[0].is_accepted());
    assert_eq!(records[0].opinions.len(), 3);

    let report = sink.get(&id).unwrap();
    assert_eq!(report.outputs.len(), 5);
    assert_eq!(report.consensus, records);
    assert_eq!(sink.len(), 1);

    let stats = orchestrator.agent_stats(&id).unwrap();
    // One scheduled run plus three replicas.
    assert_eq!(stats[&AgentKind::new("verify")].processed, 4);
    assert_eq!(stats[&AgentKind::new("retrieve")].processed, 1);
    assert_eq!(stats[&AgentKind::new("retrieve")].success_rate(), 1.0);
}

/// Test: Report is not ready before the query finishes
#[tokio::test]
async fn test_fetch_report_not_ready_while_running() {
    let harness = Harness::new(
        Plan::new(vec![TaskSpec::new("slow", "analyze")]),
        ScriptedRunner::new().script("slow", vec![Step::Hang]),
        fast_config(),
    );
    let id = harness.orchestrator.submit_query("q").await.unwrap();
    assert_eq!(harness.orchestrator.query_status(&id).unwrap(), QueryStatus::Running);
    assert!(matches!(harness.orchestrator.fetch_report(&id), Err(Error::NotReady(_))));

    harness.orchestrator.cancel_query(&id).unwrap();
    harness.orchestrator.wait_for(&id).await.unwrap();
    assert!(harness.orchestrator.fetch_report(&id).is_ok());
}

/// Test: Invalid plans are rejected before dispatch
/// Given a planner producing a cycle, and one naming an unregistered kind
/// When the query is submitted
/// Then submission fails and no runner is invoked
#[tokio::test]
async fn test_invalid_plans_are_rejected() {
    let cyclic = Plan::new(vec![
        TaskSpec::new("a", "analyze").depends_on("b"),
        TaskSpec::new("b", "analyze").depends_on("a"),
    ]);
    let harness = Harness::new(cyclic, ScriptedRunner::new(), fast_config());
    let err = harness.orchestrator.submit_query("q").await.unwrap_err();
    assert!(err.is_graph_error());
    assert!(harness.orchestrator.queries().is_empty());

    let dangling = Plan::new(vec![TaskSpec::new("a", "analyze").depends_on("ghost")]);
    let harness = Harness::new(dangling, ScriptedRunner::new(), fast_config());
    assert!(matches!(
        harness.orchestrator.submit_query("q").await,
        Err(Error::DanglingDependency { .. })
    ));

    let runner = Arc::new(ScriptedRunner::new());
    let registry = AgentRegistry::new().register("analyze", runner.clone());
    let plan = Plan::new(vec![
        TaskSpec::new("a", "analyze"),
        TaskSpec::new("b", "forecast").depends_on("a"),
    ]);
    let orchestrator = Orchestrator::new(
        fast_config(),
        registry,
        Arc::new(conclave::orchestration::StaticPlanner::new(plan)),
        Arc::new(MemorySink::new()),
    )
    .unwrap();
    assert!(matches!(
        orchestrator.submit_query("q").await,
        Err(Error::UnknownAgentKind(kind)) if kind.as_str() == "forecast"
    ));
    assert!(runner.log().is_empty());
}

/// Test: Unknown query ids
#[tokio::test]
async fn test_unknown_query_id() {
    let harness = Harness::new(Plan::new(chain(&["a"])), ScriptedRunner::new(), fast_config());
    let ghost = conclave::QueryId::new();
    assert!(matches!(
        harness.orchestrator.query_status(&ghost),
        Err(Error::QueryNotFound(_))
    ));
    assert!(harness.orchestrator.fetch_report(&ghost).is_err());
    assert!(harness.orchestrator.cancel_query(&ghost).is_err());
}

/// Test: JSON report export
/// Given a JSON file sink in a temporary directory
/// When a query finishes
/// Then `<dir>/<query_id>.json` holds the report and is its reference
#[tokio::test]
async fn test_json_file_sink_export() {
    let dir = tempfile::tempdir().unwrap();
    let file_sink = Arc::new(JsonFileSink::new(dir.path()));
    let harness = Harness::with_sink(
        Plan::new(chain(&["a", "b"])),
        ScriptedRunner::new(),
        fast_config(),
        file_sink.clone(),
        Arc::new(MemorySink::new()),
    );

    let (id, status) = harness.run("export me").await;
    assert_eq!(status, QueryStatus::Completed);

    let path = dir.path().join(format!("{}.json", id));
    assert!(path.exists());
    let reference = harness.orchestrator.report_ref(&id).unwrap().unwrap();
    assert_eq!(reference.0, path.display().to_string());

    let written: Report = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(written.query, "export me");
    assert_eq!(written, harness.orchestrator.fetch_report(&id).unwrap());
}

/// Test: Audit trail covers the task lifecycle
#[tokio::test]
async fn test_task_trace_records_lifecycle() {
    let harness = Harness::new(Plan::new(chain(&["a", "b"])), ScriptedRunner::new(), fast_config());
    let (id, _) = harness.run("trace").await;

    let trace = harness
        .orchestrator
        .task_trace(&id, &TaskId::new("b"))
        .await
        .unwrap();
    assert_eq!(trace.task.status, TaskStatus::Completed);
    assert_eq!(trace.task.attempt, 1);
    let events: Vec<&str> = trace.entries.iter().map(|e| e.event.as_str()).collect();
    assert_eq!(events, vec!["task_ready", "task_dispatched", "task_completed"]);

    let log = harness.orchestrator.audit_log(&id).unwrap();
    assert_eq!(log.last().unwrap().event, "all_tasks_terminal");
    assert!(matches!(
        harness.orchestrator.task_trace(&id, &TaskId::new("zz")).await,
        Err(Error::TaskNotFound(_))
    ));
}
