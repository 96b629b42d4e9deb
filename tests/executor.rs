mod common;

use common::{tool_event, Harness};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use taskloom::error::{ExecutorError, GraphError};
use taskloom::queue::{JobStatus, StatsFilter};
use taskloom::runtime::{ExecutionDetail, ExecutionStatus, NodeRun, NodeState, RunHandle, WorkflowExecution};
use taskloom::workflow::{ConnectionType, Edge, FieldMapping, Node, Transformer, Workflow};

fn node(id: &str, event_id: &str) -> Node {
    Node {
        id: id.to_string(),
        event_id: event_id.to_string(),
        name: None,
    }
}

fn workflow(id: &str, nodes: Vec<Node>, edges: Vec<Edge>) -> Workflow {
    Workflow {
        id: id.to_string(),
        name: id.to_string(),
        user_id: "user-1".to_string(),
        schedule: None,
        schedule_input: None,
        nodes,
        edges,
    }
}

async fn finish(handle: RunHandle) -> WorkflowExecution {
    tokio::time::timeout(Duration::from_secs(10), handle.wait())
        .await
        .expect("execution did not finish in time")
        .expect("execution abandoned")
}

fn by_node(detail: &ExecutionDetail) -> HashMap<String, NodeRun> {
    detail
        .node_runs
        .iter()
        .map(|run| (run.node_id.clone(), run.clone()))
        .collect()
}

#[tokio::test]
async fn join_waits_for_both_parents_and_merges_their_outputs() {
    let h = Harness::start(vec![
        tool_event("ev-a", "echo", json!({ "a": 1 })),
        tool_event("ev-b", "echo", json!({ "b": 2 })),
        tool_event("ev-c", "echo", json!({ "joined": true })),
    ])
    .await;
    h.registry
        .upsert_workflow(workflow(
            "wf-join",
            vec![node("a", "ev-a"), node("b", "ev-b"), node("c", "ev-c")],
            vec![
                Edge::new("a", "c", ConnectionType::OnSuccess),
                Edge::new("b", "c", ConnectionType::OnSuccess),
            ],
        ))
        .await
        .unwrap();

    let handle = h.executor.run("wf-join", json!({ "seed": 7 })).await.unwrap();
    let execution_id = handle.execution_id().to_string();
    let execution = finish(handle).await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.total_nodes, 3);
    assert_eq!(execution.succeeded_nodes, 3);
    assert!(execution.completed_at.is_some());

    let detail = h.executor.get_execution(&execution_id).await.unwrap();
    let runs = by_node(&detail);
    assert_eq!(runs["a"].input, Some(json!({ "seed": 7 })));
    assert_eq!(runs["c"].input, Some(json!({ "a": 1, "b": 2 })));
    assert_eq!(runs["c"].output, Some(json!({ "joined": true })));
    assert!(runs.values().all(|run| run.status == NodeState::Succeeded));

    let job_id = runs["c"].job_id.clone().unwrap();
    let job = h.queue.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.node_id.as_deref(), Some("c"));
    assert_eq!(job.workflow_execution_id.as_deref(), Some(execution_id.as_str()));
}

#[tokio::test]
async fn independent_branches_run_in_parallel() {
    let h = Harness::start(vec![
        tool_event("ev-slow", "sleep", json!({ "ms": 1000 })),
        tool_event("ev-join", "echo", json!({})),
    ])
    .await;
    h.registry
        .upsert_workflow(workflow(
            "wf-parallel",
            vec![node("left", "ev-slow"), node("right", "ev-slow"), node("join", "ev-join")],
            vec![
                Edge::new("left", "join", ConnectionType::OnSuccess),
                Edge::new("right", "join", ConnectionType::OnSuccess),
            ],
        ))
        .await
        .unwrap();

    let started = Instant::now();
    let handle = h.executor.run("wf-parallel", Value::Null).await.unwrap();
    let execution = finish(handle).await;
    let elapsed = started.elapsed();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert!(elapsed >= Duration::from_millis(1000));
    assert!(elapsed < Duration::from_millis(1900), "branches ran sequentially: {elapsed:?}");
}

#[tokio::test]
async fn failure_skips_success_branch_and_runs_failure_handler() {
    let h = Harness::start(vec![
        tool_event("ev-fail", "fail", json!({ "message": "disk full" })),
        tool_event("ev-ok", "echo", json!({ "ok": true })),
    ])
    .await;
    h.registry
        .upsert_workflow(workflow(
            "wf-failure",
            vec![
                node("build", "ev-fail"),
                node("deploy", "ev-ok"),
                node("notify", "ev-ok"),
                node("alert", "ev-ok"),
            ],
            vec![
                Edge::new("build", "deploy", ConnectionType::OnSuccess),
                Edge::new("deploy", "notify", ConnectionType::OnSuccess),
                Edge::new("build", "alert", ConnectionType::OnFailure),
            ],
        ))
        .await
        .unwrap();

    let handle = h.executor.run("wf-failure", json!({})).await.unwrap();
    let execution_id = handle.execution_id().to_string();
    let execution = finish(handle).await;

    // The failure was handled, so the run itself completes
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.failed_nodes, 1);
    assert_eq!(execution.skipped_nodes, 2);
    assert_eq!(execution.succeeded_nodes, 1);

    let runs = by_node(&h.executor.get_execution(&execution_id).await.unwrap());
    assert_eq!(runs["build"].status, NodeState::Failed);
    assert_eq!(runs["build"].error.as_deref(), Some("disk full"));
    assert_eq!(runs["deploy"].status, NodeState::Skipped);
    assert_eq!(runs["notify"].status, NodeState::Skipped);
    assert!(runs["deploy"].job_id.is_none());
    assert_eq!(runs["alert"].status, NodeState::Succeeded);
    assert_eq!(runs["alert"].input, Some(json!({ "error": "disk full" })));
}

#[tokio::test]
async fn unhandled_failure_fails_the_run() {
    let h = Harness::start(vec![tool_event("ev-fail", "fail", json!({ "message": "exit 2" }))]).await;
    h.registry
        .upsert_workflow(workflow("wf-single", vec![node("only", "ev-fail")], vec![]))
        .await
        .unwrap();

    let execution = finish(h.executor.run("wf-single", json!({})).await.unwrap()).await;

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.failed_nodes, 1);
    assert!(execution.error.unwrap().contains("node 'only' failed"));
}

#[tokio::test]
async fn always_edges_fire_after_a_skip() {
    let h = Harness::start(vec![
        tool_event("ev-fail", "fail", json!({})),
        tool_event("ev-ok", "echo", json!({ "cleaned": true })),
    ])
    .await;
    h.registry
        .upsert_workflow(workflow(
            "wf-always",
            vec![node("a", "ev-fail"), node("b", "ev-ok"), node("cleanup", "ev-ok")],
            vec![
                Edge::new("a", "b", ConnectionType::OnSuccess),
                Edge::new("b", "cleanup", ConnectionType::Always),
                Edge::new("a", "cleanup", ConnectionType::OnFailure),
            ],
        ))
        .await
        .unwrap();

    let handle = h.executor.run("wf-always", json!({})).await.unwrap();
    let execution_id = handle.execution_id().to_string();
    finish(handle).await;

    let runs = by_node(&h.executor.get_execution(&execution_id).await.unwrap());
    assert_eq!(runs["b"].status, NodeState::Skipped);
    assert_eq!(runs["cleanup"].status, NodeState::Succeeded);
}

#[tokio::test]
async fn unused_failure_handler_is_skipped_without_blocking_always() {
    let h = Harness::start(vec![tool_event("ev-ok", "echo", json!({ "ok": true }))]).await;
    h.registry
        .upsert_workflow(workflow(
            "wf-unused-handler",
            vec![node("a", "ev-ok"), node("rollback", "ev-ok"), node("report", "ev-ok")],
            vec![
                Edge::new("a", "rollback", ConnectionType::OnFailure),
                Edge::new("rollback", "report", ConnectionType::Always),
            ],
        ))
        .await
        .unwrap();

    let handle = h.executor.run("wf-unused-handler", json!({})).await.unwrap();
    let execution_id = handle.execution_id().to_string();
    let execution = finish(handle).await;
    assert_eq!(execution.status, ExecutionStatus::Completed);

    let runs = by_node(&h.executor.get_execution(&execution_id).await.unwrap());
    assert_eq!(runs["a"].status, NodeState::Succeeded);
    assert_eq!(runs["rollback"].status, NodeState::Skipped);
    assert_eq!(runs["report"].status, NodeState::Succeeded);
}

#[tokio::test]
async fn conditions_route_on_output_and_errors_mean_not_taken() {
    let h = Harness::start(vec![
        tool_event("ev-check", "echo", json!({ "status": 200, "region": "eu" })),
        tool_event("ev-ok", "echo", json!({})),
    ])
    .await;
    h.registry
        .upsert_workflow(workflow(
            "wf-condition",
            vec![
                node("check", "ev-check"),
                node("healthy", "ev-ok"),
                node("unhealthy", "ev-ok"),
                node("broken", "ev-ok"),
                node("vars", "ev-ok"),
            ],
            vec![
                Edge::new("check", "healthy", ConnectionType::Condition).with_condition("output.status == 200"),
                Edge::new("check", "unhealthy", ConnectionType::Condition).with_condition("output.status >= 500"),
                Edge::new("check", "broken", ConnectionType::Condition).with_condition("output.status >"),
                Edge::new("check", "vars", ConnectionType::Condition)
                    .with_condition("vars.env == 'prod' and output.region == 'eu'"),
            ],
        ))
        .await
        .unwrap();

    let handle = h.executor.run("wf-condition", json!({ "env": "prod" })).await.unwrap();
    let execution_id = handle.execution_id().to_string();
    let execution = finish(handle).await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
    let runs = by_node(&h.executor.get_execution(&execution_id).await.unwrap());
    assert_eq!(runs["healthy"].status, NodeState::Succeeded);
    assert_eq!(runs["unhealthy"].status, NodeState::Skipped);
    assert_eq!(runs["broken"].status, NodeState::Skipped);
    assert_eq!(runs["vars"].status, NodeState::Succeeded);
}

#[tokio::test]
async fn transformers_reshape_edge_payloads() {
    let h = Harness::start(vec![
        tool_event("ev-user", "echo", json!({ "user": { "name": "ada", "id": 42 }, "noise": 1 })),
        tool_event("ev-ok", "echo", json!({})),
    ])
    .await;
    let transformer = Transformer::new(vec![
        FieldMapping::new("user.name", "name"),
        FieldMapping::new("$.user.id", "userId"),
    ]);
    h.registry
        .upsert_workflow(workflow(
            "wf-transform",
            vec![node("fetch", "ev-user"), node("greet", "ev-ok")],
            vec![Edge::new("fetch", "greet", ConnectionType::OnSuccess).with_transformer(transformer)],
        ))
        .await
        .unwrap();

    let handle = h.executor.run("wf-transform", json!({})).await.unwrap();
    let execution_id = handle.execution_id().to_string();
    finish(handle).await;

    let runs = by_node(&h.executor.get_execution(&execution_id).await.unwrap());
    assert_eq!(runs["greet"].input, Some(json!({ "name": "ada", "userId": 42 })));
}

#[tokio::test]
async fn cyclic_workflows_are_rejected_at_load() {
    let h = Harness::start(vec![tool_event("ev-ok", "echo", json!({}))]).await;

    let err = h
        .registry
        .upsert_workflow(workflow(
            "wf-cycle",
            vec![node("a", "ev-ok"), node("b", "ev-ok")],
            vec![
                Edge::new("a", "b", ConnectionType::OnSuccess),
                Edge::new("b", "a", ConnectionType::OnSuccess),
            ],
        ))
        .await
        .unwrap_err();
    assert!(matches!(err.downcast_ref::<GraphError>(), Some(GraphError::Cycle { .. })));

    let run = h.executor.run("wf-cycle", json!({})).await;
    assert!(matches!(run, Err(ExecutorError::WorkflowNotFound(_))));
}

#[tokio::test]
async fn missing_event_aborts_before_anything_runs() {
    let h = Harness::start(vec![tool_event("ev-ok", "echo", json!({}))]).await;
    h.registry
        .upsert_workflow(workflow(
            "wf-missing",
            vec![node("a", "ev-ok"), node("b", "ev-gone")],
            vec![Edge::new("a", "b", ConnectionType::OnSuccess)],
        ))
        .await
        .unwrap();

    let run = h.executor.run("wf-missing", json!({})).await;
    assert!(matches!(
        run,
        Err(ExecutorError::MissingEvent { ref node_id, ref event_id }) if node_id == "b" && event_id == "ev-gone"
    ));

    let stats = h.queue.stats(&Default::default()).await.unwrap();
    assert_eq!(stats.total, 0);
}

#[tokio::test]
async fn empty_workflow_completes_immediately() {
    let h = Harness::start(vec![]).await;
    h.registry
        .upsert_workflow(workflow("wf-empty", vec![], vec![]))
        .await
        .unwrap();

    let execution = finish(h.executor.run("wf-empty", json!({})).await.unwrap()).await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.total_nodes, 0);
}

#[tokio::test]
async fn cancel_stops_the_run_and_withdraws_jobs() {
    let h = Harness::start(vec![
        tool_event("ev-slow", "sleep", json!({ "ms": 5000 })),
        tool_event("ev-ok", "echo", json!({})),
    ])
    .await;
    h.registry
        .upsert_workflow(workflow(
            "wf-cancel",
            vec![node("slow", "ev-slow"), node("after", "ev-ok")],
            vec![Edge::new("slow", "after", ConnectionType::OnSuccess)],
        ))
        .await
        .unwrap();

    let handle = h.executor.run("wf-cancel", json!({})).await.unwrap();
    let execution_id = handle.execution_id().to_string();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(h.executor.cancel(&execution_id).await.unwrap());
    let execution = finish(handle).await;
    assert_eq!(execution.status, ExecutionStatus::Cancelled);

    // Second cancel is a no-op
    assert!(!h.executor.cancel(&execution_id).await.unwrap());

    let runs = by_node(&h.executor.get_execution(&execution_id).await.unwrap());
    assert_eq!(runs["slow"].status, NodeState::Cancelled);
    assert_eq!(runs["after"].status, NodeState::Cancelled);

    let job_id = runs["slow"].job_id.clone().unwrap();
    let job = h.queue.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);

    assert!(matches!(
        h.executor.cancel("no-such-execution").await,
        Err(ExecutorError::ExecutionNotFound(_))
    ));
}

#[tokio::test]
async fn deleted_workflow_keeps_running_execution_alive() {
    let h = Harness::start(vec![tool_event("ev-slow", "sleep", json!({ "ms": 300 }))]).await;
    h.registry
        .upsert_workflow(workflow("wf-deleted", vec![node("a", "ev-slow")], vec![]))
        .await
        .unwrap();

    let handle = h.executor.run("wf-deleted", json!({})).await.unwrap();
    assert!(h.registry.remove_workflow("wf-deleted").await.unwrap());

    let execution = finish(handle).await;
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert!(matches!(
        h.executor.run("wf-deleted", json!({})).await,
        Err(ExecutorError::WorkflowNotFound(_))
    ));
}

async fn wait_until_settled(h: &Harness, execution_id: &str) -> ExecutionDetail {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let detail = h.executor.get_execution(execution_id).await.unwrap();
        if detail.execution.status.is_terminal() || Instant::now() > deadline {
            return detail;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

fn chain(id: &str) -> Workflow {
    workflow(
        id,
        vec![node("a", "ev-a"), node("b", "ev-b")],
        vec![Edge::new("a", "b", ConnectionType::OnSuccess)],
    )
}

#[tokio::test]
async fn restarted_executor_resumes_from_finished_jobs() {
    let h = Harness::start(vec![
        tool_event("ev-a", "echo", json!({ "a": 1 })),
        tool_event("ev-b", "echo", json!({ "b": 2 })),
    ])
    .await;
    h.registry.upsert_workflow(chain("wf-resume")).await.unwrap();

    // Never started: job results are not routed back, as after a crash
    let crashed = h.executor("executor-node-1");
    let execution_id = crashed
        .run("wf-resume", json!({}))
        .await
        .unwrap()
        .execution_id()
        .to_string();
    drop(crashed);

    let deadline = Instant::now() + Duration::from_secs(5);
    while h.queue.stats(&StatsFilter::default()).await.unwrap().count(JobStatus::Completed) < 1 {
        assert!(Instant::now() < deadline, "node a never ran");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let stalled = h.executor.get_execution(&execution_id).await.unwrap();
    assert_eq!(stalled.execution.status, ExecutionStatus::Running);

    // Executions are pinned to their owner
    assert_eq!(h.executor("executor-node-2").resume().await.unwrap(), 0);

    let restarted = h.executor("executor-node-1");
    restarted.start();
    assert_eq!(restarted.resume().await.unwrap(), 1);

    let detail = wait_until_settled(&h, &execution_id).await;
    assert_eq!(detail.execution.status, ExecutionStatus::Completed);
    assert_eq!(detail.execution.succeeded_nodes, 2);
    let runs = by_node(&detail);
    assert_eq!(runs["a"].status, NodeState::Succeeded);
    assert_eq!(runs["b"].status, NodeState::Succeeded);
    assert_eq!(runs["b"].input, Some(json!({ "a": 1 })));

    // `a` was picked up from its finished job, not enqueued again
    assert_eq!(h.queue.stats(&StatsFilter::default()).await.unwrap().total, 2);
}

#[tokio::test]
async fn restarted_executor_rewatches_running_jobs() {
    let h = Harness::start(vec![
        tool_event("ev-a", "sleep", json!({ "ms": 400 })),
        tool_event("ev-b", "echo", json!({ "b": 2 })),
    ])
    .await;
    h.registry.upsert_workflow(chain("wf-rewatch")).await.unwrap();

    let crashed = h.executor("executor-node-1");
    let execution_id = crashed
        .run("wf-rewatch", json!({}))
        .await
        .unwrap()
        .execution_id()
        .to_string();
    drop(crashed);

    let restarted = h.executor("executor-node-1");
    restarted.start();
    assert_eq!(restarted.resume().await.unwrap(), 1);

    let detail = wait_until_settled(&h, &execution_id).await;
    assert_eq!(detail.execution.status, ExecutionStatus::Completed);
    let runs = by_node(&detail);
    assert_eq!(runs["a"].output, Some(json!({ "slept": 400 })));
    assert_eq!(runs["b"].status, NodeState::Succeeded);
    assert_eq!(h.queue.stats(&StatsFilter::default()).await.unwrap().total, 2);
}

#[tokio::test]
async fn retried_node_resolves_once() {
    let mut flaky = tool_event("ev-a", "flaky", json!({}));
    flaky.max_attempts = Some(2);
    let h = Harness::start(vec![flaky, tool_event("ev-b", "echo", json!({ "b": 2 }))]).await;
    h.registry.upsert_workflow(chain("wf-retry")).await.unwrap();

    let handle = h.executor.run("wf-retry", json!({})).await.unwrap();
    let execution_id = handle.execution_id().to_string();
    let execution = finish(handle).await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.failed_nodes, 0);
    assert_eq!(execution.succeeded_nodes, 2);

    let runs = by_node(&h.executor.get_execution(&execution_id).await.unwrap());
    assert_eq!(runs["a"].status, NodeState::Succeeded);
    assert_eq!(runs["a"].output, Some(json!({ "call": 2 })));
    assert_eq!(runs["b"].input, Some(json!({ "call": 2 })));

    let job = h.queue.get_job(runs["a"].job_id.as_deref().unwrap()).await.unwrap().unwrap();
    assert_eq!(job.attempts, 1);
    assert_eq!(h.queue.stats(&StatsFilter::default()).await.unwrap().total, 2);
}
