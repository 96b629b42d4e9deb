/// Workflow DAG executor
///
/// Drives one state machine per workflow execution. READY nodes are submitted
/// to the job queue concurrently; job completions come back through the
/// `NodeRunner` watcher and are applied to the run's `RunState` under that
/// run's lock, which is the single serialization point between sibling
/// branches. Each execution is pinned to the executor instance that started
/// it and can be resumed by that instance after a restart.

use crate::error::ExecutorError;
use crate::queue::types::{Job, JobStatus};
use crate::runtime::join::{NodeCounts, NodeOutcome, NodeState, ReadyNode, Resolution, RunState};
use crate::runtime::node_runner::{JobUpdate, NodeRunner, Submission};
use crate::runtime::records::{
    ExecutionDetail, ExecutionStatus, ExecutionStore, NodeRun, WorkflowExecution,
};
use crate::workflow::condition::ConditionEvaluator;
use crate::workflow::registry::{CompiledWorkflow, WorkflowRegistry};
use chrono::Utc;
use futures::future::join_all;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;

/// Executor tuning, normally taken from `ExecutorConfig`
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Owner id written on every execution this instance starts
    pub instance_id: String,
    /// How often watched jobs are checked in the store
    pub completion_poll_interval: Duration,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            instance_id: crate::config::stable_instance_id("executor"),
            completion_poll_interval: Duration::from_millis(500),
        }
    }
}

/// In-memory side of a RUNNING execution owned by this instance
struct ActiveRun {
    execution_id: String,
    user_id: String,
    compiled: Arc<CompiledWorkflow>,
    state: RunState,
    cancelled: bool,
    finished: bool,
    done: watch::Sender<Option<WorkflowExecution>>,
}

/// Awaitable handle returned by `run`
#[derive(Debug)]
pub struct RunHandle {
    execution_id: String,
    done: watch::Receiver<Option<WorkflowExecution>>,
}

impl RunHandle {
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Wait for the execution to reach a terminal state
    pub async fn wait(mut self) -> Result<WorkflowExecution, ExecutorError> {
        let finished = self
            .done
            .wait_for(Option::is_some)
            .await
            .map_err(|_| ExecutorError::Abandoned(self.execution_id.clone()))?;

        finished
            .clone()
            .ok_or_else(|| ExecutorError::Abandoned(self.execution_id.clone()))
    }
}

/// DAG executor driving workflow executions through the job queue
pub struct WorkflowExecutor {
    registry: Arc<WorkflowRegistry>,
    runner: Arc<NodeRunner>,
    records: ExecutionStore,
    evaluator: Arc<dyn ConditionEvaluator>,
    settings: ExecutorSettings,
    runs: RwLock<HashMap<String, Arc<Mutex<ActiveRun>>>>,
}

impl WorkflowExecutor {
    pub fn new(
        registry: Arc<WorkflowRegistry>,
        runner: Arc<NodeRunner>,
        records: ExecutionStore,
        evaluator: Arc<dyn ConditionEvaluator>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            registry,
            runner,
            records,
            evaluator,
            settings,
            runs: RwLock::new(HashMap::new()),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.settings.instance_id
    }

    /// Start routing job updates into executions
    ///
    /// Must be running before `run` or `resume` is called. Each update is
    /// handled in its own task; the per-run lock orders them.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let (watcher, mut updates) = self.runner.spawn_watcher(self.settings.completion_poll_interval);
        let executor = Arc::clone(self);

        tracing::info!("⚙️ Workflow executor {} started", self.settings.instance_id);

        tokio::spawn(async move {
            while let Some(update) = updates.recv().await {
                let executor = Arc::clone(&executor);
                tokio::spawn(async move {
                    let job_id = update.job().id.clone();
                    let result = match update {
                        JobUpdate::Started(job) => executor.on_job_started(job).await,
                        JobUpdate::Finished(job) => executor.on_job_finished(job).await,
                    };
                    if let Err(e) = result {
                        tracing::error!("❌ Failed to apply update of job {}: {}", job_id, e);
                    }
                });
            }
            watcher.abort();
        })
    }

    /// `Run(workflowID, input)`
    ///
    /// Fails synchronously, before anything is persisted, when the workflow
    /// is unknown (never loaded, or rejected at load for a cycle) or a node
    /// references a missing event definition.
    pub async fn run(&self, workflow_id: &str, input: Value) -> Result<RunHandle, ExecutorError> {
        let compiled = self
            .registry
            .get_workflow(workflow_id)
            .ok_or_else(|| ExecutorError::WorkflowNotFound(workflow_id.to_string()))?;
        self.runner.check_events(&compiled)?;

        let now = Utc::now();
        let execution = WorkflowExecution {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_id: compiled.workflow.id.clone(),
            user_id: compiled.workflow.user_id.clone(),
            executor_id: self.settings.instance_id.clone(),
            status: ExecutionStatus::Running,
            input: input.clone(),
            total_nodes: compiled.graph.len() as u32,
            succeeded_nodes: 0,
            failed_nodes: 0,
            skipped_nodes: 0,
            error: None,
            started_at: now,
            completed_at: None,
        };
        self.records.create_execution(&execution).await?;
        for node in compiled.graph.nodes() {
            self.records
                .upsert_node_run(&NodeRun::new(&execution.id, node.id.clone(), NodeState::Pending))
                .await?;
        }

        tracing::info!(
            "🚀 Starting execution {} of workflow '{}' ({} nodes)",
            execution.id,
            workflow_id,
            compiled.graph.len()
        );

        let mut state = RunState::new(&compiled.graph, input);
        let ready = state.start(&compiled.graph);
        let (done, done_rx) = watch::channel(None);
        let handle = RunHandle {
            execution_id: execution.id.clone(),
            done: done_rx,
        };

        let run = Arc::new(Mutex::new(ActiveRun {
            execution_id: execution.id.clone(),
            user_id: execution.user_id.clone(),
            compiled,
            state,
            cancelled: false,
            finished: false,
            done,
        }));
        self.runs
            .write()
            .await
            .insert(execution.id.clone(), Arc::clone(&run));

        self.advance(&run, ready).await?;
        Ok(handle)
    }

    /// `Cancel(executionID)`
    ///
    /// Cooperative: queued jobs are withdrawn, jobs already claimed may still
    /// finish and their results are ignored. Returns `false` when the
    /// execution had already finished.
    pub async fn cancel(&self, execution_id: &str) -> Result<bool, ExecutorError> {
        let now = Utc::now();
        let active = self.runs.write().await.remove(execution_id);

        let Some(run) = active else {
            // Not driven here: owned by another instance, or orphaned
            let execution = self
                .records
                .get_execution(execution_id)
                .await?
                .ok_or_else(|| ExecutorError::ExecutionNotFound(execution_id.to_string()))?;
            if execution.status.is_terminal() {
                return Ok(false);
            }

            let counts = NodeCounts {
                total: execution.total_nodes as usize,
                succeeded: execution.succeeded_nodes as usize,
                failed: execution.failed_nodes as usize,
                skipped: execution.skipped_nodes as usize,
            };
            let applied = self
                .records
                .finalize(execution_id, ExecutionStatus::Cancelled, counts, Some("cancelled"), now)
                .await?;
            self.cancel_jobs(execution_id).await?;
            self.records.cancel_open_node_runs(execution_id, now).await?;
            return Ok(applied);
        };

        let mut guard = run.lock().await;
        if guard.finished || guard.cancelled {
            return Ok(false);
        }
        guard.cancelled = true;
        guard.state.cancel();

        self.records
            .finalize(
                execution_id,
                ExecutionStatus::Cancelled,
                guard.state.counts(),
                Some("cancelled"),
                now,
            )
            .await?;
        self.cancel_jobs(execution_id).await?;
        self.records.cancel_open_node_runs(execution_id, now).await?;

        let execution = self.records.get_execution(execution_id).await?;
        guard.done.send_replace(execution);

        tracing::info!("🛑 Execution {} cancelled", execution_id);
        Ok(true)
    }

    /// `GetExecution(executionID)` with per-node detail
    pub async fn get_execution(&self, execution_id: &str) -> Result<ExecutionDetail, ExecutorError> {
        let execution = self
            .records
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| ExecutorError::ExecutionNotFound(execution_id.to_string()))?;
        let node_runs = self.records.node_runs(execution_id).await?;

        Ok(ExecutionDetail {
            execution,
            node_runs,
        })
    }

    /// Pick up RUNNING executions this instance owned before a restart
    ///
    /// Terminal node runs are replayed in topological order through the join
    /// rule; in-flight jobs are watched again and READY nodes without a job
    /// are submitted.
    pub async fn resume(&self) -> Result<usize, ExecutorError> {
        let executions = self
            .records
            .running_for_executor(&self.settings.instance_id)
            .await?;
        if executions.is_empty() {
            return Ok(0);
        }

        tracing::info!("♻️ Resuming {} executions", executions.len());
        let mut resumed = 0;
        for execution in executions {
            let id = execution.id.clone();
            match self.resume_execution(execution).await {
                Ok(()) => resumed += 1,
                Err(e) => tracing::error!("❌ Failed to resume execution {}: {}", id, e),
            }
        }

        Ok(resumed)
    }

    async fn resume_execution(&self, execution: WorkflowExecution) -> Result<(), ExecutorError> {
        let Some(compiled) = self.registry.get_workflow(&execution.workflow_id) else {
            tracing::warn!(
                "⚠️ Workflow '{}' of execution {} no longer exists",
                execution.workflow_id,
                execution.id
            );
            self.records
                .finalize(
                    &execution.id,
                    ExecutionStatus::Failed,
                    NodeCounts::default(),
                    Some("workflow no longer exists"),
                    Utc::now(),
                )
                .await?;
            return Ok(());
        };

        let records: HashMap<String, NodeRun> = self
            .records
            .node_runs(&execution.id)
            .await?
            .into_iter()
            .map(|run| (run.node_id.clone(), run))
            .collect();

        let graph = &compiled.graph;
        let mut state = RunState::new(graph, execution.input.clone());
        let mut ready: BTreeMap<usize, Value> = state
            .start(graph)
            .into_iter()
            .map(|node| (node.index, node.input))
            .collect();

        for &ix in graph.topological_order() {
            let Some(record) = records.get(&graph.node(ix).id) else {
                continue;
            };
            let outcome = match record.status {
                NodeState::Succeeded => {
                    NodeOutcome::Succeeded(record.output.clone().unwrap_or(Value::Null))
                }
                NodeState::Failed => NodeOutcome::Failed(
                    record.error.clone().unwrap_or_else(|| "node failed".to_string()),
                ),
                _ => continue,
            };
            ready.remove(&ix);
            let resolution = state.resolve(graph, &*self.evaluator, ix, outcome);
            ready.extend(resolution.ready.into_iter().map(|node| (node.index, node.input)));
        }

        let mut to_submit = Vec::new();
        let mut in_flight = Vec::new();
        for (ix, input) in ready {
            let record = records.get(&graph.node(ix).id);
            let job_id = record
                .filter(|r| r.status.is_in_flight())
                .and_then(|r| r.job_id.clone());
            let live_job = match job_id {
                Some(job_id) => self.runner.queue().get_job(&job_id).await?,
                None => None,
            };
            match live_job {
                Some(job) => {
                    state.mark(ix, NodeState::Submitted);
                    in_flight.push(job.id);
                }
                None => to_submit.push(ReadyNode { index: ix, input }),
            }
        }

        let now = Utc::now();
        for ix in 0..graph.len() {
            let node_id = &graph.node(ix).id;
            if state.state(ix) == NodeState::Skipped
                && records.get(node_id).map(|r| r.status) != Some(NodeState::Skipped)
            {
                let mut run = NodeRun::new(&execution.id, node_id.clone(), NodeState::Skipped);
                run.completed_at = Some(now);
                self.records.upsert_node_run(&run).await?;
            }
        }

        tracing::info!(
            "♻️ Execution {} resumed: {} in flight, {} to submit",
            execution.id,
            in_flight.len(),
            to_submit.len()
        );

        let (done, _) = watch::channel(None);
        let run = Arc::new(Mutex::new(ActiveRun {
            execution_id: execution.id.clone(),
            user_id: execution.user_id.clone(),
            compiled: Arc::clone(&compiled),
            state,
            cancelled: false,
            finished: false,
            done,
        }));
        self.runs
            .write()
            .await
            .insert(execution.id.clone(), Arc::clone(&run));

        for job_id in &in_flight {
            self.runner.watch(job_id);
        }
        self.advance(&run, to_submit).await
    }

    async fn on_job_started(&self, job: Job) -> Result<(), ExecutorError> {
        let Some(run) = self.active_run_for(&job).await else {
            return Ok(());
        };
        let mut guard = run.lock().await;
        if guard.cancelled {
            return Ok(());
        }
        let Some(ix) = job.node_id.as_deref().and_then(|id| guard.compiled.graph.index_of(id)) else {
            return Ok(());
        };

        if guard.state.mark(ix, NodeState::Running) {
            let node_id = guard.compiled.graph.node(ix).id.clone();
            let mut record = NodeRun::new(&guard.execution_id, node_id, NodeState::Running);
            record.started_at = job.started_at;
            self.records.upsert_node_run(&record).await?;
        }
        Ok(())
    }

    async fn on_job_finished(&self, job: Job) -> Result<(), ExecutorError> {
        let Some(run) = self.active_run_for(&job).await else {
            tracing::debug!("⏭️ Ignoring late result of job {}", job.id);
            return Ok(());
        };

        let ready = {
            let mut guard = run.lock().await;
            if guard.cancelled || guard.finished {
                return Ok(());
            }
            let Some(ix) = job
                .node_id
                .as_deref()
                .and_then(|id| guard.compiled.graph.index_of(id))
            else {
                return Ok(());
            };
            if guard.state.state(ix).is_terminal() {
                return Ok(());
            }

            let outcome = match job.status {
                JobStatus::Completed => {
                    NodeOutcome::Succeeded(job.result.clone().unwrap_or(Value::Null))
                }
                JobStatus::Failed => NodeOutcome::Failed(
                    job.last_error.clone().unwrap_or_else(|| "job failed".to_string()),
                ),
                JobStatus::Cancelled => NodeOutcome::Failed("job cancelled".to_string()),
                JobStatus::Queued | JobStatus::Running => return Ok(()),
            };

            let compiled = Arc::clone(&guard.compiled);
            let resolution = guard
                .state
                .resolve(&compiled.graph, &*self.evaluator, ix, outcome);

            tracing::debug!(
                "📍 Node '{}' of execution {} {} ({} ready, {} skipped)",
                compiled.graph.node(ix).id,
                guard.execution_id,
                guard.state.state(ix),
                resolution.ready.len(),
                resolution.skipped.len()
            );

            self.persist_resolution(&guard, ix, &resolution).await?;
            resolution.ready
        };

        self.advance(&run, ready).await
    }

    async fn active_run_for(&self, job: &Job) -> Option<Arc<Mutex<ActiveRun>>> {
        let execution_id = job.workflow_execution_id.as_deref()?;
        self.runs.read().await.get(execution_id).cloned()
    }

    /// Submit READY nodes concurrently until nothing new becomes ready, then
    /// finalize the run if it settled
    async fn advance(
        &self,
        run: &Arc<Mutex<ActiveRun>>,
        mut ready: Vec<ReadyNode>,
    ) -> Result<(), ExecutorError> {
        while !ready.is_empty() {
            let (compiled, execution_id, user_id) = {
                let guard = run.lock().await;
                if guard.cancelled {
                    return Ok(());
                }
                (
                    Arc::clone(&guard.compiled),
                    guard.execution_id.clone(),
                    guard.user_id.clone(),
                )
            };

            let results = join_all(ready.iter().map(|node| {
                self.runner.submit(
                    &compiled,
                    Submission {
                        execution_id: &execution_id,
                        user_id: &user_id,
                        node_ix: node.index,
                        input: &node.input,
                    },
                )
            }))
            .await;

            let mut guard = run.lock().await;
            let mut next = Vec::new();
            for (node, result) in ready.iter().zip(results) {
                match result {
                    Ok(job_id) if guard.cancelled => {
                        // Cancelled while submitting
                        self.runner.unwatch([job_id.as_str()]);
                        self.runner.queue().cancel(&job_id).await?;
                    }
                    Ok(_) => {
                        guard.state.mark(node.index, NodeState::Submitted);
                    }
                    Err(e) => {
                        tracing::warn!(
                            "⚠️ Could not submit node '{}' of execution {}: {}",
                            compiled.graph.node(node.index).id,
                            execution_id,
                            e
                        );
                        if guard.cancelled {
                            continue;
                        }
                        let resolution = guard.state.resolve(
                            &compiled.graph,
                            &*self.evaluator,
                            node.index,
                            NodeOutcome::Failed(e.to_string()),
                        );
                        self.persist_resolution(&guard, node.index, &resolution)
                            .await?;
                        next.extend(resolution.ready);
                    }
                }
            }
            ready = next;
        }

        self.finish_if_done(run).await
    }

    /// Write the resolved node and everything its resolution decided
    async fn persist_resolution(
        &self,
        run: &ActiveRun,
        ix: usize,
        resolution: &Resolution,
    ) -> Result<(), ExecutorError> {
        let graph = &run.compiled.graph;
        let now = Utc::now();

        let status = run.state.state(ix);
        let mut record = NodeRun::new(&run.execution_id, graph.node(ix).id.clone(), status);
        record.output = run.state.output(ix).cloned();
        if status == NodeState::Failed {
            record.error = record
                .output
                .as_ref()
                .and_then(|o| o.get("error"))
                .and_then(Value::as_str)
                .map(str::to_string);
        }
        record.completed_at = Some(now);
        self.records.upsert_node_run(&record).await?;

        for &skipped in &resolution.skipped {
            let mut record =
                NodeRun::new(&run.execution_id, graph.node(skipped).id.clone(), NodeState::Skipped);
            record.completed_at = Some(now);
            self.records.upsert_node_run(&record).await?;
        }

        for node in &resolution.ready {
            let mut record =
                NodeRun::new(&run.execution_id, graph.node(node.index).id.clone(), NodeState::Ready);
            record.input = Some(node.input.clone());
            self.records.upsert_node_run(&record).await?;
        }

        self.records
            .update_counts(&run.execution_id, run.state.counts())
            .await
    }

    /// Finalize exactly once when no node is left to run
    async fn finish_if_done(&self, run: &Arc<Mutex<ActiveRun>>) -> Result<(), ExecutorError> {
        let mut guard = run.lock().await;
        if guard.cancelled || guard.finished || !guard.state.is_finished() {
            return Ok(());
        }
        guard.finished = true;

        let compiled = Arc::clone(&guard.compiled);
        let counts = guard.state.counts();
        let (status, error) = match guard.state.unhandled_failure(&compiled.graph) {
            Some((ix, error)) => (
                ExecutionStatus::Failed,
                Some(format!("node '{}' failed: {}", compiled.graph.node(ix).id, error)),
            ),
            None => (ExecutionStatus::Completed, None),
        };

        self.records
            .finalize(&guard.execution_id, status, counts, error.as_deref(), Utc::now())
            .await?;
        self.runs.write().await.remove(&guard.execution_id);

        match status {
            ExecutionStatus::Failed => tracing::error!(
                "❌ Execution {} of '{}' failed: {}",
                guard.execution_id,
                compiled.workflow.id,
                error.as_deref().unwrap_or_default()
            ),
            _ => tracing::info!(
                "🎉 Execution {} of '{}' completed ({} succeeded, {} failed, {} skipped)",
                guard.execution_id,
                compiled.workflow.id,
                counts.succeeded,
                counts.failed,
                counts.skipped
            ),
        }

        let execution = self.records.get_execution(&guard.execution_id).await?;
        guard.done.send_replace(execution);
        Ok(())
    }

    async fn cancel_jobs(&self, execution_id: &str) -> Result<(), ExecutorError> {
        let active = self
            .runner
            .queue()
            .active_jobs_for_execution(execution_id)
            .await?;
        self.runner.unwatch(active.iter().map(|job| job.id.as_str()));
        for job in &active {
            self.runner.queue().cancel(&job.id).await?;
        }
        Ok(())
    }
}
