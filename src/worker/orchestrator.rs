/// Job orchestrator (worker loop)
///
/// Polls the queue, claims as many jobs as it has free slots for, and runs
/// each one in its own task under the job's timeout while a heartbeat keeps
/// the lease alive. A lost lease (reaped, cancelled) abandons the job without
/// reporting; whoever holds it now owns the outcome.

use crate::error::{HandlerError, QueueError};
use crate::queue::service::JobQueue;
use crate::queue::types::Job;
use crate::worker::handlers::HandlerRegistry;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// `tokio::time::interval` panics on a zero period
const MIN_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Lease owner id; must be stable across restarts for recovery to work
    pub worker_id: String,
    pub poll_interval: Duration,
    /// Most jobs claimed per poll
    pub batch_size: usize,
    /// Most jobs running at once
    pub max_concurrent: usize,
    /// Should stay well under the queue's lease duration
    pub heartbeat_interval: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            worker_id: crate::config::stable_instance_id("orchestrator"),
            poll_interval: Duration::from_secs(1),
            batch_size: 10,
            max_concurrent: 5,
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

pub struct Orchestrator {
    queue: Arc<JobQueue>,
    handlers: Arc<HandlerRegistry>,
    settings: OrchestratorSettings,
    active: Arc<AtomicUsize>,
}

/// Frees a concurrency slot when the job task ends, however it ends
struct SlotGuard(Arc<AtomicUsize>);

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Orchestrator {
    pub fn new(queue: Arc<JobQueue>, handlers: Arc<HandlerRegistry>, settings: OrchestratorSettings) -> Self {
        Self {
            queue,
            handlers,
            settings,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.settings.worker_id
    }

    pub fn active_jobs(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Put back jobs a previous incarnation of this worker still holds
    pub async fn recover(&self) -> Result<usize, QueueError> {
        let released = self.queue.release_worker_jobs(&self.settings.worker_id).await?;
        if released > 0 {
            tracing::info!(
                "♻️ Released {} jobs left over by worker {}",
                released,
                self.settings.worker_id
            );
        }
        Ok(released)
    }

    /// Claim up to the free capacity and start the claimed jobs
    pub async fn poll_once(self: &Arc<Self>) -> Result<usize, QueueError> {
        let free = self
            .settings
            .max_concurrent
            .saturating_sub(self.active_jobs());
        let wanted = free.min(self.settings.batch_size);
        if wanted == 0 {
            return Ok(0);
        }

        let jobs = self.queue.claim(&self.settings.worker_id, wanted).await?;
        let claimed = jobs.len();
        for job in jobs {
            self.active.fetch_add(1, Ordering::SeqCst);
            let slot = SlotGuard(Arc::clone(&self.active));
            let orchestrator = Arc::clone(self);
            tokio::spawn(async move {
                let _slot = slot;
                orchestrator.execute(job).await;
            });
        }

        Ok(claimed)
    }

    /// Recover, then poll forever
    pub async fn run(self: Arc<Self>) {
        tracing::info!(
            "🛠️ Orchestrator {} started (max {} concurrent, handlers: {:?})",
            self.settings.worker_id,
            self.settings.max_concurrent,
            self.handlers.job_types()
        );

        if let Err(e) = self.recover().await {
            tracing::error!("❌ Startup recovery of worker {} failed: {}", self.settings.worker_id, e);
        }

        let mut ticker = tokio::time::interval(self.settings.poll_interval.max(MIN_INTERVAL));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = self.poll_once().await {
                tracing::error!("❌ Poll failed on worker {}: {}", self.settings.worker_id, e);
            }
        }
    }

    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run())
    }

    async fn execute(&self, job: Job) {
        let timeout = job
            .timeout()
            .unwrap_or(self.queue.settings().default_timeout);
        let worker_id = self.settings.worker_id.as_str();

        tracing::debug!(
            "▶️ Job {} ({}) started on {} (attempt {}/{})",
            job.id,
            job.job_type,
            worker_id,
            job.attempts + 1,
            job.max_attempts
        );

        let outcome = tokio::select! {
            result = tokio::time::timeout(timeout, self.handlers.handle(&job)) => match result {
                Ok(result) => result,
                Err(_) => Err(HandlerError::Timeout(timeout)),
            },
            () = self.heartbeat_until_lost(&job.id) => {
                tracing::warn!("⚠️ Lease on job {} lost, abandoning it", job.id);
                return;
            }
        };

        let reported = match outcome {
            Ok(result) => {
                tracing::debug!("✅ Job {} completed", job.id);
                self.queue.complete(&job.id, worker_id, result).await
            }
            Err(e) => {
                tracing::warn!("⚠️ Job {} failed: {}", job.id, e);
                self.queue.fail(&job.id, worker_id, &e.to_string()).await
            }
        };

        match reported {
            Ok(true) => {}
            Ok(false) => tracing::debug!("⏭️ Outcome of job {} discarded, lease no longer held", job.id),
            Err(e) => tracing::error!("❌ Could not report outcome of job {}: {}", job.id, e),
        }
    }

    /// Extend the lease every heartbeat interval; returns once it is gone
    async fn heartbeat_until_lost(&self, job_id: &str) {
        let mut ticker = tokio::time::interval(self.settings.heartbeat_interval.max(MIN_INTERVAL));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match self.queue.heartbeat(job_id, &self.settings.worker_id).await {
                Ok(()) => {}
                Err(QueueError::LeaseLost { .. }) | Err(QueueError::NotFound(_)) => return,
                Err(e) => tracing::error!("❌ Heartbeat for job {} failed: {}", job_id, e),
            }
        }
    }
}
