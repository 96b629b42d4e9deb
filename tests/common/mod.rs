//! Shared fixtures: in-memory database, queue, and a full executor stack
//! driven by an in-process orchestrator with test tool actions.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use taskloom::error::HandlerError;
use taskloom::queue::{JobPriority, JobQueue, JobStore, JobType, NewJob, QueueSettings, RetryPolicy};
use taskloom::runtime::{DefaultPayloadBuilder, ExecutionStore, ExecutorSettings, NodeRunner, WorkflowExecutor};
use taskloom::storage::Database;
use taskloom::worker::{HandlerRegistry, Orchestrator, OrchestratorSettings, ToolAction, ToolActionRouter};
use taskloom::workflow::{
    EventDefinition, LuaConditionEvaluator, StaticEventCatalog, WorkflowRegistry, WorkflowStorage,
};

pub fn fast_settings() -> QueueSettings {
    QueueSettings {
        retry: RetryPolicy::immediate(),
        ..QueueSettings::default()
    }
}

pub async fn queue_with(settings: QueueSettings) -> (Database, Arc<JobQueue>) {
    let db = Database::in_memory().await.expect("in-memory database");
    let queue = Arc::new(JobQueue::new(JobStore::new(db.pool().clone()), settings));
    (db, queue)
}

pub fn script_job(user_id: &str) -> NewJob {
    NewJob::new(
        JobType::Script,
        user_id,
        json!({ "script": { "type": "BASH", "content": "echo hello" } }),
    )
}

/// Returns its `parameters` as output
pub struct Echo;

#[async_trait]
impl ToolAction for Echo {
    async fn execute(&self, _action: &str, parameters: &Value, _input: &Value) -> Result<Value, HandlerError> {
        Ok(parameters.clone())
    }
}

/// Sleeps `parameters.ms`, then returns `{ "slept": ms }`
pub struct Sleep;

#[async_trait]
impl ToolAction for Sleep {
    async fn execute(&self, _action: &str, parameters: &Value, _input: &Value) -> Result<Value, HandlerError> {
        let ms = parameters["ms"].as_u64().unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(json!({ "slept": ms }))
    }
}

/// Always fails with `parameters.message`
pub struct Fail;

#[async_trait]
impl ToolAction for Fail {
    async fn execute(&self, _action: &str, parameters: &Value, _input: &Value) -> Result<Value, HandlerError> {
        let message = parameters["message"].as_str().unwrap_or("boom").to_string();
        Err(HandlerError::NodeExecution(message))
    }
}

/// Fails the first call, succeeds afterwards
#[derive(Default)]
pub struct Flaky {
    calls: AtomicUsize,
}

#[async_trait]
impl ToolAction for Flaky {
    async fn execute(&self, _action: &str, _parameters: &Value, _input: &Value) -> Result<Value, HandlerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == 1 {
            return Err(HandlerError::NodeExecution("first call fails".to_string()));
        }
        Ok(json!({ "call": call }))
    }
}

/// TOOL_ACTION event running `tool` with `parameters`, no retries
pub fn tool_event(id: &str, tool: &str, parameters: Value) -> EventDefinition {
    EventDefinition {
        id: id.to_string(),
        name: id.to_string(),
        job_type: JobType::ToolAction,
        spec: json!({ "toolAction": { "toolType": tool, "action": "run", "parameters": parameters } }),
        priority: JobPriority::Normal,
        max_attempts: Some(1),
        timeout_seconds: Some(30),
        version: 1,
    }
}

pub struct Harness {
    pub db: Database,
    pub queue: Arc<JobQueue>,
    pub registry: Arc<WorkflowRegistry>,
    pub events: Arc<StaticEventCatalog>,
    pub executor: Arc<WorkflowExecutor>,
    pub orchestrator: Arc<Orchestrator>,
}

impl Harness {
    pub async fn start(events: Vec<EventDefinition>) -> Self {
        let (db, queue) = queue_with(fast_settings()).await;

        let registry = Arc::new(WorkflowRegistry::new(WorkflowStorage::new(db.pool().clone())));
        let events = Arc::new(StaticEventCatalog::new(events));
        let executor = build_executor(&db, &queue, &registry, &events, "executor-test");
        executor.start();

        let tools = ToolActionRouter::new()
            .with_tool("echo", Arc::new(Echo))
            .with_tool("sleep", Arc::new(Sleep))
            .with_tool("fail", Arc::new(Fail))
            .with_tool("flaky", Arc::new(Flaky::default()));
        let mut handlers = HandlerRegistry::new();
        handlers.register(JobType::ToolAction, Arc::new(tools));

        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&queue),
            Arc::new(handlers),
            OrchestratorSettings {
                worker_id: "orchestrator-test".to_string(),
                poll_interval: Duration::from_millis(20),
                batch_size: 10,
                max_concurrent: 10,
                heartbeat_interval: Duration::from_secs(1),
            },
        ));
        orchestrator.spawn();

        Self {
            db,
            queue,
            registry,
            events,
            executor,
            orchestrator,
        }
    }

    /// Another executor over the same database, not yet started
    pub fn executor(&self, instance_id: &str) -> Arc<WorkflowExecutor> {
        build_executor(&self.db, &self.queue, &self.registry, &self.events, instance_id)
    }
}

fn build_executor(
    db: &Database,
    queue: &Arc<JobQueue>,
    registry: &Arc<WorkflowRegistry>,
    events: &Arc<StaticEventCatalog>,
    instance_id: &str,
) -> Arc<WorkflowExecutor> {
    let records = ExecutionStore::new(db.pool().clone());
    let runner = Arc::new(NodeRunner::new(
        Arc::clone(queue),
        events.clone(),
        Arc::new(DefaultPayloadBuilder),
        records.clone(),
    ));
    Arc::new(WorkflowExecutor::new(
        Arc::clone(registry),
        runner,
        records,
        Arc::new(LuaConditionEvaluator::default()),
        ExecutorSettings {
            instance_id: instance_id.to_string(),
            completion_poll_interval: Duration::from_millis(50),
        },
    ))
}
