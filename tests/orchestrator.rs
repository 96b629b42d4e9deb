mod common;

use common::Harness;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use taskloom::queue::{Job, JobQueue, JobStatus, JobType, NewJob};

fn tool_job(tool: &str, parameters: Value) -> NewJob {
    NewJob::new(
        JobType::ToolAction,
        "user-1",
        json!({ "toolAction": { "toolType": tool, "action": "run", "parameters": parameters } }),
    )
}

/// Poll the job until `done` holds or `within` elapses
async fn wait_for_job(queue: &JobQueue, id: &str, within: Duration, done: impl Fn(&Job) -> bool) -> Job {
    let deadline = Instant::now() + within;
    loop {
        let job = queue.get_job(id).await.unwrap().unwrap();
        if done(&job) || Instant::now() > deadline {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn timed_out_jobs_are_retried_then_failed() {
    let h = Harness::start(vec![]).await;
    let id = h
        .queue
        .enqueue(
            tool_job("sleep", json!({ "ms": 5_000 }))
                .with_timeout(Duration::from_secs(1))
                .with_max_attempts(2),
        )
        .await
        .unwrap();

    let job = wait_for_job(&h.queue, &id, Duration::from_secs(8), |job| job.status.is_terminal()).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 2);
    assert!(job.last_error.unwrap().contains("timeout"));
    assert!(job.result.is_none());
}

#[tokio::test]
async fn failed_attempt_is_retried_to_success() {
    let h = Harness::start(vec![]).await;
    let id = h
        .queue
        .enqueue(tool_job("flaky", json!({})).with_max_attempts(2))
        .await
        .unwrap();

    let job = wait_for_job(&h.queue, &id, Duration::from_secs(5), |job| job.status.is_terminal()).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.result, Some(json!({ "call": 2 })));
}

#[tokio::test]
async fn worker_abandons_a_job_cancelled_under_it() {
    let h = Harness::start(vec![]).await;
    let id = h
        .queue
        .enqueue(tool_job("sleep", json!({ "ms": 10_000 })))
        .await
        .unwrap();

    let running = wait_for_job(&h.queue, &id, Duration::from_secs(3), |job| {
        job.status == JobStatus::Running
    })
    .await;
    assert_eq!(running.lease_owner.as_deref(), Some(h.orchestrator.worker_id()));
    assert!(h.queue.cancel(&id).await.unwrap());

    // The next heartbeat sees the lost lease and frees the slot
    let started = Instant::now();
    while h.orchestrator.active_jobs() > 0 && started.elapsed() < Duration::from_secs(4) {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(h.orchestrator.active_jobs(), 0);

    let job = h.queue.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.result.is_none());
}
