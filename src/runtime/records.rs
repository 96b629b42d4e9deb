/// Execution records
///
/// Persisted state of workflow runs (`workflow_executions`) and of every node
/// within them (`node_runs`). The executor writes these as it drives a run;
/// they back `GetExecution`, run history and resume after an executor restart.

use crate::error::ExecutorError;
use crate::runtime::join::{NodeCounts, NodeState};
use crate::storage::database::{from_millis, to_millis};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{sqlite::SqlitePool, sqlite::SqliteRow, Row};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Completed => "COMPLETED",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "RUNNING" => Some(ExecutionStatus::Running),
            "COMPLETED" => Some(ExecutionStatus::Completed),
            "FAILED" => Some(ExecutionStatus::Failed),
            "CANCELLED" => Some(ExecutionStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One workflow run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowExecution {
    pub id: String,
    pub workflow_id: String,
    pub user_id: String,
    /// Executor instance that owns (drives) this run
    pub executor_id: String,
    pub status: ExecutionStatus,
    pub input: Value,
    pub total_nodes: u32,
    pub succeeded_nodes: u32,
    pub failed_nodes: u32,
    pub skipped_nodes: u32,
    /// Why the run failed, when it did
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One node within one run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRun {
    pub execution_id: String,
    pub node_id: String,
    pub job_id: Option<String>,
    pub status: NodeState,
    pub input: Option<Value>,
    /// Job result, or `{"error": ...}` when the node failed
    pub output: Option<Value>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl NodeRun {
    pub fn new(execution_id: impl Into<String>, node_id: impl Into<String>, status: NodeState) -> Self {
        Self {
            execution_id: execution_id.into(),
            node_id: node_id.into(),
            job_id: None,
            status,
            input: None,
            output: None,
            error: None,
            started_at: None,
            completed_at: None,
            updated_at: Utc::now(),
        }
    }
}

/// A run together with its node records, as returned by `GetExecution`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionDetail {
    #[serde(flatten)]
    pub execution: WorkflowExecution,
    pub node_runs: Vec<NodeRun>,
}

/// SQLite access to execution records
#[derive(Debug, Clone)]
pub struct ExecutionStore {
    pool: SqlitePool,
}

impl ExecutionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create_execution(&self, execution: &WorkflowExecution) -> Result<(), ExecutorError> {
        sqlx::query(
            r#"
            INSERT INTO workflow_executions (
                id, workflow_id, user_id, executor_id, status, input, total_nodes, started_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&execution.id)
        .bind(&execution.workflow_id)
        .bind(&execution.user_id)
        .bind(&execution.executor_id)
        .bind(execution.status.as_str())
        .bind(execution.input.to_string())
        .bind(execution.total_nodes as i64)
        .bind(to_millis(execution.started_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// RUNNING -> terminal, exactly once
    ///
    /// Returns `false` when the run was already finalized (e.g. cancelled
    /// while its last node was completing).
    pub async fn finalize(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        counts: NodeCounts,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, ExecutorError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_executions
            SET status = ?, succeeded_nodes = ?, failed_nodes = ?, skipped_nodes = ?,
                error = ?, completed_at = ?
            WHERE id = ? AND status = 'RUNNING'
            "#,
        )
        .bind(status.as_str())
        .bind(counts.succeeded as i64)
        .bind(counts.failed as i64)
        .bind(counts.skipped as i64)
        .bind(error)
        .bind(to_millis(now))
        .bind(execution_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Live node tallies while the run is in progress
    pub async fn update_counts(&self, execution_id: &str, counts: NodeCounts) -> Result<(), ExecutorError> {
        sqlx::query(
            r#"
            UPDATE workflow_executions
            SET succeeded_nodes = ?, failed_nodes = ?, skipped_nodes = ?
            WHERE id = ? AND status = 'RUNNING'
            "#,
        )
        .bind(counts.succeeded as i64)
        .bind(counts.failed as i64)
        .bind(counts.skipped as i64)
        .bind(execution_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_execution(&self, execution_id: &str) -> Result<Option<WorkflowExecution>, ExecutorError> {
        let row = sqlx::query("SELECT * FROM workflow_executions WHERE id = ?")
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(execution_from_row).transpose()
    }

    /// RUNNING executions owned by one executor instance
    pub async fn running_for_executor(&self, executor_id: &str) -> Result<Vec<WorkflowExecution>, ExecutorError> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_executions WHERE executor_id = ? AND status = 'RUNNING' ORDER BY started_at",
        )
        .bind(executor_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(execution_from_row).collect()
    }

    pub async fn upsert_node_run(&self, run: &NodeRun) -> Result<(), ExecutorError> {
        sqlx::query(
            r#"
            INSERT INTO node_runs (
                execution_id, node_id, job_id, status, input, output, error,
                started_at, completed_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(execution_id, node_id) DO UPDATE SET
                job_id = COALESCE(excluded.job_id, node_runs.job_id),
                status = excluded.status,
                input = COALESCE(excluded.input, node_runs.input),
                output = COALESCE(excluded.output, node_runs.output),
                error = COALESCE(excluded.error, node_runs.error),
                started_at = COALESCE(excluded.started_at, node_runs.started_at),
                completed_at = COALESCE(excluded.completed_at, node_runs.completed_at),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&run.execution_id)
        .bind(&run.node_id)
        .bind(&run.job_id)
        .bind(run.status.as_str())
        .bind(run.input.as_ref().map(Value::to_string))
        .bind(run.output.as_ref().map(Value::to_string))
        .bind(&run.error)
        .bind(run.started_at.map(to_millis))
        .bind(run.completed_at.map(to_millis))
        .bind(to_millis(run.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn node_runs(&self, execution_id: &str) -> Result<Vec<NodeRun>, ExecutorError> {
        let rows = sqlx::query("SELECT * FROM node_runs WHERE execution_id = ? ORDER BY rowid")
            .bind(execution_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(node_run_from_row).collect()
    }

    /// Every non-terminal node run of an execution -> CANCELLED
    pub async fn cancel_open_node_runs(&self, execution_id: &str, now: DateTime<Utc>) -> Result<u64, ExecutorError> {
        let result = sqlx::query(
            r#"
            UPDATE node_runs
            SET status = 'CANCELLED', completed_at = ?, updated_at = ?
            WHERE execution_id = ?
              AND status NOT IN ('SUCCEEDED', 'FAILED', 'SKIPPED', 'CANCELLED')
            "#,
        )
        .bind(to_millis(now))
        .bind(to_millis(now))
        .bind(execution_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

fn parse_json(id: &str, column: &str, raw: Option<String>) -> Result<Option<Value>, ExecutorError> {
    raw.map(|text| serde_json::from_str(&text))
        .transpose()
        .map_err(|e| ExecutorError::Corrupt {
            id: id.to_string(),
            reason: format!("{column}: {e}"),
        })
}

fn execution_from_row(row: &SqliteRow) -> Result<WorkflowExecution, ExecutorError> {
    let id: String = row.get("id");
    let status: String = row.get("status");
    let status = ExecutionStatus::parse(&status).ok_or_else(|| ExecutorError::Corrupt {
        id: id.clone(),
        reason: format!("unknown status {status}"),
    })?;
    let input = parse_json(&id, "input", row.get("input"))?.unwrap_or(Value::Null);

    let count = |column: &str| row.get::<i64, _>(column).max(0) as u32;

    Ok(WorkflowExecution {
        workflow_id: row.get("workflow_id"),
        user_id: row.get("user_id"),
        executor_id: row.get("executor_id"),
        status,
        input,
        total_nodes: count("total_nodes"),
        succeeded_nodes: count("succeeded_nodes"),
        failed_nodes: count("failed_nodes"),
        skipped_nodes: count("skipped_nodes"),
        error: row.get("error"),
        started_at: from_millis(row.get("started_at")),
        completed_at: row.get::<Option<i64>, _>("completed_at").map(from_millis),
        id,
    })
}

fn node_run_from_row(row: &SqliteRow) -> Result<NodeRun, ExecutorError> {
    let execution_id: String = row.get("execution_id");
    let node_id: String = row.get("node_id");
    let record_id = format!("{execution_id}/{node_id}");

    let status: String = row.get("status");
    let status = NodeState::parse(&status).ok_or_else(|| ExecutorError::Corrupt {
        id: record_id.clone(),
        reason: format!("unknown node status {status}"),
    })?;

    Ok(NodeRun {
        job_id: row.get("job_id"),
        status,
        input: parse_json(&record_id, "input", row.get("input"))?,
        output: parse_json(&record_id, "output", row.get("output"))?,
        error: row.get("error"),
        started_at: row.get::<Option<i64>, _>("started_at").map(from_millis),
        completed_at: row.get::<Option<i64>, _>("completed_at").map(from_millis),
        updated_at: from_millis(row.get("updated_at")),
        execution_id,
        node_id,
    })
}
