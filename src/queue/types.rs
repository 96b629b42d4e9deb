/// Job queue type definitions
///
/// Jobs are the unit of work handed to orchestrators. The queue itself is
/// type-agnostic: `job_type` only decides which handler a worker dispatches to.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Which downstream executor handles the payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    /// Script run by a local interpreter
    Script,
    /// Outbound HTTP call
    HttpRequest,
    /// Tool action dispatched to an application-registered handler
    ToolAction,
    /// Script shipped to a remote server over SSH
    Ssh,
}

impl JobType {
    pub const ALL: [JobType; 4] = [
        JobType::Script,
        JobType::HttpRequest,
        JobType::ToolAction,
        JobType::Ssh,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Script => "SCRIPT",
            JobType::HttpRequest => "HTTP_REQUEST",
            JobType::ToolAction => "TOOL_ACTION",
            JobType::Ssh => "SSH",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == value)
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted job status
///
/// Monotonic except RUNNING -> QUEUED on lease expiry or retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == value)
    }

    /// Terminal jobs are immutable
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Claim priority band. Higher bands are always claimed first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl JobPriority {
    pub fn rank(&self) -> i64 {
        match self {
            JobPriority::Low => 0,
            JobPriority::Normal => 1,
            JobPriority::High => 2,
            JobPriority::Critical => 3,
        }
    }

    pub fn from_rank(rank: i64) -> Option<Self> {
        match rank {
            0 => Some(JobPriority::Low),
            1 => Some(JobPriority::Normal),
            2 => Some(JobPriority::High),
            3 => Some(JobPriority::Critical),
            _ => None,
        }
    }
}

/// A persisted job row
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    /// Source event definition, if the job was built from one
    pub event_id: Option<String>,
    pub user_id: String,
    /// Workflow run this job belongs to, if any
    pub workflow_execution_id: Option<String>,
    /// Workflow node this job executes, if any
    pub node_id: Option<String>,
    pub job_type: JobType,
    pub status: JobStatus,
    pub priority: JobPriority,
    /// Opaque to the queue once validated; interpreted by the executing worker
    pub payload: Value,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Attempts that ended in failure or lease expiry
    pub attempts: u32,
    pub max_attempts: u32,
    pub timeout_secs: Option<u64>,
    pub result: Option<Value>,
    pub last_error: Option<String>,
    pub scheduled_for: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Request to enqueue a job
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: JobType,
    pub user_id: String,
    pub payload: Value,
    pub priority: JobPriority,
    pub event_id: Option<String>,
    pub workflow_execution_id: Option<String>,
    pub node_id: Option<String>,
    /// Falls back to the queue's configured default
    pub max_attempts: Option<u32>,
    /// Defaults to now
    pub scheduled_for: Option<DateTime<Utc>>,
    /// Falls back to the queue's configured default
    pub timeout: Option<Duration>,
}

impl NewJob {
    pub fn new(job_type: JobType, user_id: impl Into<String>, payload: Value) -> Self {
        Self {
            job_type,
            user_id: user_id.into(),
            payload,
            priority: JobPriority::Normal,
            event_id: None,
            workflow_execution_id: None,
            node_id: None,
            max_attempts: None,
            scheduled_for: None,
            timeout: None,
        }
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    pub fn for_event(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }

    pub fn for_node(mut self, execution_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        self.workflow_execution_id = Some(execution_id.into());
        self.node_id = Some(node_id.into());
        self
    }
}

/// Optional narrowing for `JobQueue::stats`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsFilter {
    pub user_id: Option<String>,
    pub workflow_execution_id: Option<String>,
    pub job_type: Option<JobType>,
}

/// Job counts by status and by type
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStats {
    pub total: u64,
    pub by_status: BTreeMap<JobStatus, u64>,
    pub by_type: BTreeMap<JobType, u64>,
}

impl JobStats {
    pub fn count(&self, status: JobStatus) -> u64 {
        self.by_status.get(&status).copied().unwrap_or(0)
    }
}

/// Lifecycle transition published by the queue after a successful state change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobEventKind {
    Claimed,
    Requeued,
    Completed,
    Failed,
    Cancelled,
}

/// Snapshot of a job right after a transition
#[derive(Debug, Clone)]
pub struct JobEvent {
    pub kind: JobEventKind,
    pub job: Job,
}

impl JobEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            JobEventKind::Completed | JobEventKind::Failed | JobEventKind::Cancelled
        )
    }
}
