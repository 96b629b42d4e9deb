/// SQLite persistence for the job queue
///
/// Every state transition is one conditional UPDATE whose WHERE clause encodes
/// the expected current state (compare-and-swap). A transition that matched
/// zero rows lost a race and is reported as `false`, never as an error.

use crate::error::QueueError;
use crate::queue::types::{Job, JobPriority, JobStats, JobStatus, JobType, StatsFilter};
use crate::storage::database::{from_millis, to_millis};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{sqlite::SqlitePool, sqlite::SqliteRow, QueryBuilder, Row, Sqlite};

const JOB_COLUMNS: &str = "id, event_id, user_id, workflow_execution_id, node_id, job_type, status, \
     priority, payload, lease_owner, lease_expires_at, attempts, max_attempts, timeout_secs, \
     result, last_error, scheduled_for, created_at, updated_at, started_at, completed_at";

/// Table-level job operations
#[derive(Debug, Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

/// How a failed attempt is written back
#[derive(Debug, Clone)]
pub(crate) enum FailureDisposition {
    /// Back to QUEUED, claimable again at `retry_at`
    Retry { retry_at: DateTime<Utc> },
    /// Permanently FAILED
    Exhausted,
}

impl JobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, job: &Job) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, event_id, user_id, workflow_execution_id, node_id, job_type, status,
                priority, payload, attempts, max_attempts, timeout_secs,
                scheduled_for, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.event_id)
        .bind(&job.user_id)
        .bind(&job.workflow_execution_id)
        .bind(&job.node_id)
        .bind(job.job_type.as_str())
        .bind(job.status.as_str())
        .bind(job.priority.rank())
        .bind(job.payload.to_string())
        .bind(job.attempts as i64)
        .bind(job.max_attempts as i64)
        .bind(job.timeout_secs.map(|s| s as i64))
        .bind(to_millis(job.scheduled_for))
        .bind(to_millis(job.created_at))
        .bind(to_millis(job.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Job>, QueueError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    /// IDs of claimable jobs in claim order: priority desc, then FIFO by schedule
    pub async fn claim_candidates(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<String>, QueueError> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM jobs
            WHERE status = 'QUEUED' AND scheduled_for <= ?
            ORDER BY priority DESC, scheduled_for ASC, created_at ASC, rowid ASC
            LIMIT ?
            "#,
        )
        .bind(to_millis(now))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(|row| row.get("id")).collect())
    }

    /// QUEUED -> RUNNING for one job, leased to `worker_id`
    pub async fn try_claim(
        &self,
        id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'RUNNING', lease_owner = ?, lease_expires_at = ?,
                started_at = ?, updated_at = ?
            WHERE id = ? AND status = 'QUEUED' AND scheduled_for <= ?
            "#,
        )
        .bind(worker_id)
        .bind(to_millis(lease_until))
        .bind(to_millis(now))
        .bind(to_millis(now))
        .bind(id)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn extend_lease(
        &self,
        id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET lease_expires_at = ?, updated_at = ?
            WHERE id = ? AND status = 'RUNNING' AND lease_owner = ?
            "#,
        )
        .bind(to_millis(lease_until))
        .bind(to_millis(now))
        .bind(id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// RUNNING -> COMPLETED, only for the current lease owner
    pub async fn complete(
        &self,
        id: &str,
        worker_id: &str,
        result_value: &Value,
        now: DateTime<Utc>,
    ) -> Result<bool, QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'COMPLETED', result = ?, lease_owner = NULL, lease_expires_at = NULL,
                completed_at = ?, updated_at = ?
            WHERE id = ? AND status = 'RUNNING' AND lease_owner = ?
            "#,
        )
        .bind(result_value.to_string())
        .bind(to_millis(now))
        .bind(to_millis(now))
        .bind(id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Record a failed attempt for a RUNNING job
    ///
    /// `lease_owner` and `expected_attempts` pin the exact attempt being
    /// failed: a reap and a late `fail` from the same worker cannot both apply.
    /// With `expired_before` set the lease must also still be expired, so a
    /// heartbeat that landed after the reaper's scan wins.
    pub(crate) async fn record_failure(
        &self,
        id: &str,
        lease_owner: &str,
        expected_attempts: u32,
        error: &str,
        disposition: &FailureDisposition,
        expired_before: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<bool, QueueError> {
        let expired_before = expired_before.map(to_millis);
        let result = match disposition {
            FailureDisposition::Retry { retry_at } => {
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET status = 'QUEUED', attempts = attempts + 1, last_error = ?,
                        lease_owner = NULL, lease_expires_at = NULL, started_at = NULL,
                        scheduled_for = ?, updated_at = ?
                    WHERE id = ? AND status = 'RUNNING' AND lease_owner = ? AND attempts = ?
                      AND (? IS NULL OR lease_expires_at < ?)
                    "#,
                )
                .bind(error)
                .bind(to_millis(*retry_at))
                .bind(to_millis(now))
                .bind(id)
                .bind(lease_owner)
                .bind(expected_attempts as i64)
                .bind(expired_before)
                .bind(expired_before)
                .execute(&self.pool)
                .await?
            }
            FailureDisposition::Exhausted => {
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET status = 'FAILED', attempts = attempts + 1, last_error = ?,
                        lease_owner = NULL, lease_expires_at = NULL,
                        completed_at = ?, updated_at = ?
                    WHERE id = ? AND status = 'RUNNING' AND lease_owner = ? AND attempts = ?
                      AND (? IS NULL OR lease_expires_at < ?)
                    "#,
                )
                .bind(error)
                .bind(to_millis(now))
                .bind(to_millis(now))
                .bind(id)
                .bind(lease_owner)
                .bind(expected_attempts as i64)
                .bind(expired_before)
                .bind(expired_before)
                .execute(&self.pool)
                .await?
            }
        };

        Ok(result.rows_affected() == 1)
    }

    /// QUEUED/RUNNING -> CANCELLED
    pub async fn cancel(&self, id: &str, now: DateTime<Utc>) -> Result<bool, QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'CANCELLED', lease_owner = NULL, lease_expires_at = NULL,
                completed_at = ?, updated_at = ?
            WHERE id = ? AND status IN ('QUEUED', 'RUNNING')
            "#,
        )
        .bind(to_millis(now))
        .bind(to_millis(now))
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// RUNNING -> QUEUED without consuming an attempt (orchestrator restart)
    pub async fn release(
        &self,
        id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'QUEUED', lease_owner = NULL, lease_expires_at = NULL,
                started_at = NULL, scheduled_for = ?, updated_at = ?
            WHERE id = ? AND status = 'RUNNING' AND lease_owner = ?
            "#,
        )
        .bind(to_millis(now))
        .bind(to_millis(now))
        .bind(id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// RUNNING jobs whose lease ran out before `now`
    pub async fn expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<Job>, QueueError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status = 'RUNNING' AND lease_expires_at < ?"
        ))
        .bind(to_millis(now))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(job_from_row).collect()
    }

    /// RUNNING jobs currently leased to `worker_id`
    pub async fn leased_to(&self, worker_id: &str) -> Result<Vec<Job>, QueueError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status = 'RUNNING' AND lease_owner = ?"
        ))
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(job_from_row).collect()
    }

    /// Terminal jobs among `ids`
    pub async fn terminal_among(&self, ids: &[String]) -> Result<Vec<Job>, QueueError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status IN ('COMPLETED', 'FAILED', 'CANCELLED') AND id IN ("
        ));
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(id);
        }
        separated.push_unseparated(")");

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(job_from_row).collect()
    }

    /// Non-terminal jobs belonging to a workflow execution
    pub async fn active_for_execution(&self, execution_id: &str) -> Result<Vec<Job>, QueueError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE workflow_execution_id = ? AND status IN ('QUEUED', 'RUNNING')"
        ))
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(job_from_row).collect()
    }

    pub async fn stats(&self, filter: &StatsFilter) -> Result<JobStats, QueueError> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT status, job_type, COUNT(*) AS n FROM jobs WHERE 1 = 1");
        if let Some(user_id) = &filter.user_id {
            builder.push(" AND user_id = ").push_bind(user_id);
        }
        if let Some(execution_id) = &filter.workflow_execution_id {
            builder
                .push(" AND workflow_execution_id = ")
                .push_bind(execution_id);
        }
        if let Some(job_type) = filter.job_type {
            builder.push(" AND job_type = ").push_bind(job_type.as_str());
        }
        builder.push(" GROUP BY status, job_type");

        let rows = builder.build().fetch_all(&self.pool).await?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.get("status");
            let job_type: String = row.get("job_type");
            let n: i64 = row.get("n");
            let n = n as u64;

            stats.total += n;
            if let Some(status) = JobStatus::parse(&status) {
                *stats.by_status.entry(status).or_default() += n;
            }
            if let Some(job_type) = JobType::parse(&job_type) {
                *stats.by_type.entry(job_type).or_default() += n;
            }
        }

        Ok(stats)
    }
}

fn job_from_row(row: &SqliteRow) -> Result<Job, QueueError> {
    let id: String = row.get("id");
    let corrupt = |reason: String| QueueError::Corrupt {
        job_id: id.clone(),
        reason,
    };

    let job_type: String = row.get("job_type");
    let status: String = row.get("status");
    let priority: i64 = row.get("priority");
    let payload: String = row.get("payload");
    let result: Option<String> = row.get("result");

    let job_type =
        JobType::parse(&job_type).ok_or_else(|| corrupt(format!("unknown job type {job_type}")))?;
    let status =
        JobStatus::parse(&status).ok_or_else(|| corrupt(format!("unknown status {status}")))?;
    let priority = JobPriority::from_rank(priority)
        .ok_or_else(|| corrupt(format!("unknown priority {priority}")))?;
    let payload: Value =
        serde_json::from_str(&payload).map_err(|e| corrupt(format!("payload: {e}")))?;
    let result = result
        .map(|r| serde_json::from_str::<Value>(&r))
        .transpose()
        .map_err(|e| corrupt(format!("result: {e}")))?;

    let attempts: i64 = row.get("attempts");
    let max_attempts: i64 = row.get("max_attempts");
    let timeout_secs: Option<i64> = row.get("timeout_secs");

    Ok(Job {
        id: id.clone(),
        event_id: row.get("event_id"),
        user_id: row.get("user_id"),
        workflow_execution_id: row.get("workflow_execution_id"),
        node_id: row.get("node_id"),
        job_type,
        status,
        priority,
        payload,
        lease_owner: row.get("lease_owner"),
        lease_expires_at: row.get::<Option<i64>, _>("lease_expires_at").map(from_millis),
        attempts: attempts.max(0) as u32,
        max_attempts: max_attempts.max(0) as u32,
        timeout_secs: timeout_secs.map(|s| s.max(0) as u64),
        result,
        last_error: row.get("last_error"),
        scheduled_for: from_millis(row.get("scheduled_for")),
        created_at: from_millis(row.get("created_at")),
        updated_at: from_millis(row.get("updated_at")),
        started_at: row.get::<Option<i64>, _>("started_at").map(from_millis),
        completed_at: row.get::<Option<i64>, _>("completed_at").map(from_millis),
    })
}
