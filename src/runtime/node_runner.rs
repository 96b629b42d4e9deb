/// Executor <-> queue adapter
///
/// `submit` turns one READY node into a queued job and records it on the
/// node's run. Completion is event-driven: a single watcher task follows the
/// queue's broadcast channel (jobs finished in this process) and periodically
/// polls the store for watched jobs (jobs finished by orchestrators elsewhere).
/// Nothing is parked per pending node.

use crate::error::ExecutorError;
use crate::queue::service::JobQueue;
use crate::queue::types::{Job, JobEventKind, NewJob};
use crate::runtime::join::NodeState;
use crate::runtime::payload::{PayloadBuilder, PayloadContext};
use crate::runtime::records::{ExecutionStore, NodeRun};
use crate::workflow::events::EventCatalog;
use crate::workflow::registry::CompiledWorkflow;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast::error::RecvError, mpsc};
use tokio::task::JoinHandle;

/// Progress of a watched job, routed back to the executor
#[derive(Debug, Clone)]
pub enum JobUpdate {
    /// Claimed by an orchestrator in this process
    Started(Job),
    /// Reached COMPLETED, FAILED or CANCELLED
    Finished(Job),
}

impl JobUpdate {
    pub fn job(&self) -> &Job {
        match self {
            JobUpdate::Started(job) | JobUpdate::Finished(job) => job,
        }
    }
}

/// One node submission
#[derive(Debug, Clone, Copy)]
pub struct Submission<'a> {
    pub execution_id: &'a str,
    pub user_id: &'a str,
    pub node_ix: usize,
    pub input: &'a Value,
}

pub struct NodeRunner {
    queue: Arc<JobQueue>,
    events: Arc<dyn EventCatalog>,
    payloads: Arc<dyn PayloadBuilder>,
    records: ExecutionStore,
    /// Job ids whose terminal state has not been delivered yet
    watched: Mutex<HashSet<String>>,
}

impl NodeRunner {
    pub fn new(
        queue: Arc<JobQueue>,
        events: Arc<dyn EventCatalog>,
        payloads: Arc<dyn PayloadBuilder>,
        records: ExecutionStore,
    ) -> Self {
        Self {
            queue,
            events,
            payloads,
            records,
            watched: Mutex::new(HashSet::new()),
        }
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// Every node's event definition must exist before a run may start
    pub fn check_events(&self, compiled: &CompiledWorkflow) -> Result<(), ExecutorError> {
        for node in compiled.graph.nodes() {
            if self.events.get_event(&node.event_id).is_none() {
                return Err(ExecutorError::MissingEvent {
                    node_id: node.id.clone(),
                    event_id: node.event_id.clone(),
                });
            }
        }
        Ok(())
    }

    /// Build the payload, enqueue the job, record it as SUBMITTED and watch it
    pub async fn submit(
        &self,
        compiled: &CompiledWorkflow,
        submission: Submission<'_>,
    ) -> Result<String, ExecutorError> {
        let node = compiled.graph.node(submission.node_ix);
        let event = self
            .events
            .get_event(&node.event_id)
            .ok_or_else(|| ExecutorError::MissingEvent {
                node_id: node.id.clone(),
                event_id: node.event_id.clone(),
            })?;

        let ctx = PayloadContext {
            execution_id: submission.execution_id,
            workflow_id: &compiled.workflow.id,
            node_id: &node.id,
            user_id: submission.user_id,
            input: submission.input,
        };
        let payload = self
            .payloads
            .build_payload(&event, &ctx)
            .map_err(|reason| ExecutorError::Payload {
                node_id: node.id.clone(),
                reason,
            })?;

        let mut new_job = NewJob::new(event.job_type, submission.user_id, payload)
            .with_priority(event.priority)
            .for_event(event.id.clone())
            .for_node(submission.execution_id, node.id.clone());
        if let Some(max_attempts) = event.max_attempts {
            new_job = new_job.with_max_attempts(max_attempts);
        }
        if let Some(secs) = event.timeout_seconds {
            new_job = new_job.with_timeout(Duration::from_secs(secs));
        }

        let job_id = self.queue.enqueue(new_job).await?;

        // The SUBMITTED record must exist before completions can be delivered
        let mut run = NodeRun::new(submission.execution_id, node.id.clone(), NodeState::Submitted);
        run.job_id = Some(job_id.clone());
        run.input = Some(submission.input.clone());
        if let Err(e) = self.records.upsert_node_run(&run).await {
            if let Err(cancel_err) = self.queue.cancel(&job_id).await {
                tracing::error!("❌ Could not withdraw orphaned job {}: {}", job_id, cancel_err);
            }
            return Err(e);
        }
        self.watch(&job_id);

        tracing::debug!(
            "📤 Node '{}' of execution {} submitted as job {}",
            node.id,
            submission.execution_id,
            job_id
        );
        Ok(job_id)
    }

    /// Deliver the terminal state of `job_id` once it is reached
    pub fn watch(&self, job_id: &str) {
        if let Ok(mut watched) = self.watched.lock() {
            watched.insert(job_id.to_string());
        }
    }

    /// Stop tracking jobs (e.g. after their run was cancelled)
    pub fn unwatch<'a>(&self, job_ids: impl IntoIterator<Item = &'a str>) {
        if let Ok(mut watched) = self.watched.lock() {
            for id in job_ids {
                watched.remove(id);
            }
        }
    }

    /// Start the completion watcher
    ///
    /// Updates for watched jobs arrive on the returned receiver; each terminal
    /// job is delivered at most once.
    pub fn spawn_watcher(
        self: &Arc<Self>,
        poll_interval: Duration,
    ) -> (JoinHandle<()>, mpsc::UnboundedReceiver<JobUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let runner = Arc::clone(self);

        let handle = tokio::spawn(async move {
            let mut events = runner.queue.subscribe();
            let mut ticker = tokio::time::interval(poll_interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    received = events.recv() => match received {
                        Ok(event) if event.is_terminal() => {
                            if !runner.deliver(&tx, JobUpdate::Finished(event.job)) {
                                break;
                            }
                        }
                        Ok(event) if event.kind == JobEventKind::Claimed => {
                            if runner.is_watched(&event.job.id)
                                && tx.send(JobUpdate::Started(event.job)).is_err()
                            {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(missed)) => {
                            tracing::warn!("⚠️ Completion watcher lagged by {} job events; polling catches up", missed);
                        }
                        Err(RecvError::Closed) => break,
                    },
                    _ = ticker.tick() => {
                        if !runner.poll_terminal(&tx).await {
                            break;
                        }
                    }
                }
            }

            tracing::debug!("Completion watcher stopped");
        });

        (handle, rx)
    }

    fn is_watched(&self, job_id: &str) -> bool {
        self.watched
            .lock()
            .map(|watched| watched.contains(job_id))
            .unwrap_or(false)
    }

    /// Returns `false` once the receiving side is gone
    fn deliver(&self, tx: &mpsc::UnboundedSender<JobUpdate>, update: JobUpdate) -> bool {
        let was_watched = self
            .watched
            .lock()
            .map(|mut watched| watched.remove(&update.job().id))
            .unwrap_or(false);
        if !was_watched {
            return true;
        }
        tx.send(update).is_ok()
    }

    async fn poll_terminal(&self, tx: &mpsc::UnboundedSender<JobUpdate>) -> bool {
        let ids: Vec<String> = match self.watched.lock() {
            Ok(watched) => watched.iter().cloned().collect(),
            Err(_) => return true,
        };
        if ids.is_empty() {
            return true;
        }

        match self.queue.terminal_jobs(&ids).await {
            Ok(jobs) => {
                for job in jobs {
                    if !self.deliver(tx, JobUpdate::Finished(job)) {
                        return false;
                    }
                }
            }
            Err(e) => tracing::error!("❌ Completion poll failed: {}", e),
        }
        true
    }
}
