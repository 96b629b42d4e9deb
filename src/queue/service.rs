/// Job queue service layer
///
/// Enqueue, lease-based claim, heartbeat, complete/fail with bounded retries,
/// cancellation and the lease-expiry reaper. Races between orchestrators are
/// settled by the store's conditional updates and absorbed here: callers only
/// ever see "applied" or "no-op".

use crate::error::QueueError;
use crate::queue::payload;
use crate::queue::retry::RetryPolicy;
use crate::queue::store::{FailureDisposition, JobStore};
use crate::queue::types::{
    Job, JobEvent, JobEventKind, JobStats, JobStatus, NewJob, StatsFilter,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Claim rounds before giving up on jobs lost to concurrent claimers
const CLAIM_ROUNDS: usize = 3;

/// Capacity of the in-process job event channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Queue tuning, normally taken from `QueueConfig`
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub lease_duration: Duration,
    pub default_max_attempts: u32,
    pub default_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(30),
            default_max_attempts: 3,
            default_timeout: Duration::from_secs(3600),
            retry: RetryPolicy::default(),
        }
    }
}

/// Lease-based job queue over a `JobStore`
#[derive(Debug)]
pub struct JobQueue {
    store: JobStore,
    settings: QueueSettings,
    events: broadcast::Sender<JobEvent>,
}

impl JobQueue {
    pub fn new(store: JobStore, settings: QueueSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            settings,
            events,
        }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Subscribe to transitions made through this queue instance
    ///
    /// Only covers this process; executors also poll the store for jobs
    /// finished by orchestrators elsewhere.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Persist a new QUEUED job and return its id
    pub async fn enqueue(&self, new_job: NewJob) -> Result<String, QueueError> {
        if new_job.user_id.trim().is_empty() {
            return Err(QueueError::Validation("user_id is required".to_string()));
        }
        let max_attempts = new_job
            .max_attempts
            .unwrap_or(self.settings.default_max_attempts);
        if max_attempts == 0 {
            return Err(QueueError::Validation(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        payload::validate(new_job.job_type, &new_job.payload)?;

        let now = Utc::now();
        let timeout = new_job.timeout.unwrap_or(self.settings.default_timeout);
        let job = Job {
            id: uuid::Uuid::new_v4().to_string(),
            event_id: new_job.event_id,
            user_id: new_job.user_id,
            workflow_execution_id: new_job.workflow_execution_id,
            node_id: new_job.node_id,
            job_type: new_job.job_type,
            status: JobStatus::Queued,
            priority: new_job.priority,
            payload: new_job.payload,
            lease_owner: None,
            lease_expires_at: None,
            attempts: 0,
            max_attempts,
            timeout_secs: Some(timeout.as_secs().max(1)),
            result: None,
            last_error: None,
            scheduled_for: new_job.scheduled_for.unwrap_or(now),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        };

        self.store.insert(&job).await?;

        tracing::debug!(
            "📥 Enqueued job {} ({}, priority {:?}, max attempts {})",
            job.id,
            job.job_type,
            job.priority,
            job.max_attempts
        );

        Ok(job.id)
    }

    /// Lease up to `max_count` claimable jobs to `worker_id`
    ///
    /// Never blocks: returns fewer jobs (possibly none) when there is not
    /// enough work. Each job is taken with its own compare-and-swap, so two
    /// concurrent claimers can never receive the same job.
    pub async fn claim(&self, worker_id: &str, max_count: usize) -> Result<Vec<Job>, QueueError> {
        let mut claimed = Vec::new();
        if max_count == 0 {
            return Ok(claimed);
        }

        for _ in 0..CLAIM_ROUNDS {
            let remaining = max_count - claimed.len();
            let now = Utc::now();
            let candidates = self.store.claim_candidates(now, remaining).await?;
            if candidates.is_empty() {
                break;
            }

            let lease_until = now + self.lease_duration();
            let mut lost = 0;
            for id in candidates {
                if !self.store.try_claim(&id, worker_id, now, lease_until).await? {
                    lost += 1;
                    continue;
                }
                match self.store.get(&id).await? {
                    Some(job)
                        if job.status == JobStatus::Running
                            && job.lease_owner.as_deref() == Some(worker_id) =>
                    {
                        self.publish(JobEventKind::Claimed, job.clone());
                        claimed.push(job);
                    }
                    // Cancelled between our claim and the read
                    _ => {}
                }
            }

            if lost == 0 || claimed.len() >= max_count {
                break;
            }
            tracing::debug!("🔁 Lost {} claim races for worker {}, retrying", lost, worker_id);
        }

        if !claimed.is_empty() {
            tracing::debug!("🎯 Worker {} claimed {} jobs", worker_id, claimed.len());
        }

        Ok(claimed)
    }

    /// Extend the lease of a running job
    pub async fn heartbeat(&self, job_id: &str, worker_id: &str) -> Result<(), QueueError> {
        let now = Utc::now();
        if self
            .store
            .extend_lease(job_id, worker_id, now, now + self.lease_duration())
            .await?
        {
            return Ok(());
        }

        match self.store.get(job_id).await? {
            None => Err(QueueError::NotFound(job_id.to_string())),
            Some(_) => Err(QueueError::LeaseLost {
                job_id: job_id.to_string(),
            }),
        }
    }

    /// RUNNING -> COMPLETED for the lease owner; `Ok(false)` when the call was a no-op
    pub async fn complete(
        &self,
        job_id: &str,
        worker_id: &str,
        result: Value,
    ) -> Result<bool, QueueError> {
        let applied = self
            .store
            .complete(job_id, worker_id, &result, Utc::now())
            .await?;

        if !applied {
            tracing::debug!(
                "⏭️ Ignoring completion of job {} from {}: not the current lease holder",
                job_id,
                worker_id
            );
            return Ok(false);
        }

        tracing::info!("✅ Job {} completed by {}", job_id, worker_id);
        self.publish_current(job_id, JobEventKind::Completed).await?;
        Ok(true)
    }

    /// Record a failed attempt
    ///
    /// Re-enqueues with backoff while attempts remain, otherwise the job ends
    /// FAILED for good. `Ok(false)` when the caller no longer held the lease.
    pub async fn fail(&self, job_id: &str, worker_id: &str, error: &str) -> Result<bool, QueueError> {
        let job = self
            .store
            .get(job_id)
            .await?
            .ok_or_else(|| QueueError::NotFound(job_id.to_string()))?;

        if job.status != JobStatus::Running || job.lease_owner.as_deref() != Some(worker_id) {
            tracing::debug!(
                "⏭️ Ignoring failure of job {} from {}: status {}, lease owner {:?}",
                job_id,
                worker_id,
                job.status,
                job.lease_owner
            );
            return Ok(false);
        }

        let now = Utc::now();
        let used = job.attempts + 1;
        let disposition = if used < job.max_attempts {
            FailureDisposition::Retry {
                retry_at: now + to_chrono(self.settings.retry.delay_for(used)),
            }
        } else {
            FailureDisposition::Exhausted
        };

        self.apply_failure(&job, worker_id, error, disposition, None, now)
            .await
    }

    /// Cancel a QUEUED or RUNNING job
    ///
    /// A worker already running the job finds out on its next heartbeat; its
    /// late `complete`/`fail` becomes a no-op.
    pub async fn cancel(&self, job_id: &str) -> Result<bool, QueueError> {
        if !self.store.cancel(job_id, Utc::now()).await? {
            return Ok(false);
        }

        tracing::info!("🛑 Job {} cancelled", job_id);
        self.publish_current(job_id, JobEventKind::Cancelled).await?;
        Ok(true)
    }

    /// Requeue RUNNING jobs whose lease expired
    ///
    /// An expired lease counts as a used attempt, so a job that keeps killing
    /// its workers still ends FAILED after `max_attempts`.
    pub async fn reap(&self) -> Result<usize, QueueError> {
        let now = Utc::now();
        let expired = self.store.expired_leases(now).await?;
        let mut reaped = 0;

        for job in expired {
            let Some(owner) = job.lease_owner.clone() else {
                continue;
            };
            let used = job.attempts + 1;
            let disposition = if used < job.max_attempts {
                FailureDisposition::Retry { retry_at: now }
            } else {
                FailureDisposition::Exhausted
            };
            let error = format!("lease expired (held by {owner})");

            if self
                .apply_failure(&job, &owner, &error, disposition, Some(now), now)
                .await?
            {
                reaped += 1;
            }
        }

        if reaped > 0 {
            tracing::warn!("🧹 Reaped {} jobs with expired leases", reaped);
        }

        Ok(reaped)
    }

    /// Put every job still leased to `worker_id` back on the queue
    ///
    /// Used by an orchestrator on startup: whatever it held before a restart
    /// is no longer running anywhere. Does not consume an attempt.
    pub async fn release_worker_jobs(&self, worker_id: &str) -> Result<usize, QueueError> {
        let held = self.store.leased_to(worker_id).await?;
        let mut released = 0;

        for job in held {
            if self.store.release(&job.id, worker_id, Utc::now()).await? {
                released += 1;
                self.publish_current(&job.id, JobEventKind::Requeued).await?;
            }
        }

        if released > 0 {
            tracing::info!("♻️ Released {} jobs left over by {}", released, worker_id);
        }

        Ok(released)
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<Job>, QueueError> {
        self.store.get(job_id).await
    }

    /// Terminal jobs among `job_ids`
    pub async fn terminal_jobs(&self, job_ids: &[String]) -> Result<Vec<Job>, QueueError> {
        self.store.terminal_among(job_ids).await
    }

    /// QUEUED/RUNNING jobs of one workflow execution
    pub async fn active_jobs_for_execution(&self, execution_id: &str) -> Result<Vec<Job>, QueueError> {
        self.store.active_for_execution(execution_id).await
    }

    pub async fn stats(&self, filter: &StatsFilter) -> Result<JobStats, QueueError> {
        self.store.stats(filter).await
    }

    /// Run `reap` every `interval` until the task is aborted
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tracing::info!("🧹 Lease reaper running every {:?}", interval);
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = queue.reap().await {
                    tracing::error!("❌ Lease reaper sweep failed: {}", e);
                }
            }
        })
    }

    async fn apply_failure(
        &self,
        job: &Job,
        lease_owner: &str,
        error: &str,
        disposition: FailureDisposition,
        expired_before: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<bool, QueueError> {
        let applied = self
            .store
            .record_failure(
                &job.id,
                lease_owner,
                job.attempts,
                error,
                &disposition,
                expired_before,
                now,
            )
            .await?;

        if !applied {
            return Ok(false);
        }

        match disposition {
            FailureDisposition::Retry { retry_at } => {
                tracing::warn!(
                    "🔁 Job {} failed (attempt {}/{}), retrying at {}: {}",
                    job.id,
                    job.attempts + 1,
                    job.max_attempts,
                    retry_at.to_rfc3339(),
                    error
                );
                self.publish_current(&job.id, JobEventKind::Requeued).await?;
            }
            FailureDisposition::Exhausted => {
                tracing::error!(
                    "❌ Job {} failed permanently after {} attempts: {}",
                    job.id,
                    job.attempts + 1,
                    error
                );
                self.publish_current(&job.id, JobEventKind::Failed).await?;
            }
        }

        Ok(true)
    }

    fn lease_duration(&self) -> chrono::Duration {
        to_chrono(self.settings.lease_duration)
    }

    async fn publish_current(&self, job_id: &str, kind: JobEventKind) -> Result<(), QueueError> {
        if let Some(job) = self.store.get(job_id).await? {
            self.publish(kind, job);
        }
        Ok(())
    }

    fn publish(&self, kind: JobEventKind, job: Job) {
        // No subscribers is fine
        let _ = self.events.send(JobEvent { kind, job });
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
