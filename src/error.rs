/// Error taxonomy shared by the queue, the workflow graph and the executor
///
/// Lease races never show up here: losing a compare-and-swap is reported as a
/// no-op by the queue, not as an error.

use crate::queue::types::JobType;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the job queue service layer
#[derive(Debug, Error)]
pub enum QueueError {
    /// Bad job input, rejected before persistence
    #[error("validation failed: {0}")]
    Validation(String),

    /// Type-specific payload validation failed
    #[error("invalid {job_type} payload: {reason}")]
    InvalidPayload { job_type: JobType, reason: String },

    /// The caller no longer holds the lease (reclaimed after expiry, cancelled, or terminal)
    #[error("lease lost for job {job_id}")]
    LeaseLost { job_id: String },

    #[error("job not found: {0}")]
    NotFound(String),

    /// A persisted row could not be decoded back into a job
    #[error("corrupt job row {job_id}: {reason}")]
    Corrupt { job_id: String, reason: String },

    #[error("job store error: {0}")]
    Storage(#[from] sqlx::Error),
}

/// Structural problems found while compiling a workflow graph
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("workflow '{workflow_id}' contains a cycle through node '{node_id}'")]
    Cycle { workflow_id: String, node_id: String },

    #[error("edge {source_id} -> {target_id} references unknown node '{missing}'")]
    UnknownNode {
        source_id: String,
        target_id: String,
        missing: String,
    },

    #[error("duplicate node id '{0}'")]
    DuplicateNode(String),

    #[error("CONDITION edge {source_id} -> {target_id} has no expression")]
    MissingCondition { source_id: String, target_id: String },
}

/// A condition expression could not be evaluated to a boolean
///
/// Never fatal: the edge is treated as not taken.
#[derive(Debug, Error)]
#[error("condition `{expression}` failed: {reason}")]
pub struct ConditionEvalError {
    pub expression: String,
    pub reason: String,
}

/// Errors surfaced synchronously by the workflow executor
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("node '{node_id}' references missing event definition '{event_id}'")]
    MissingEvent { node_id: String, event_id: String },

    #[error("workflow execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("failed to build payload for node '{node_id}': {reason}")]
    Payload { node_id: String, reason: String },

    /// The executor driving the run went away before it finished
    #[error("workflow execution {0} was abandoned before reaching a terminal state")]
    Abandoned(String),

    /// A persisted execution or node run could not be decoded
    #[error("corrupt execution record {id}: {reason}")]
    Corrupt { id: String, reason: String },

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("execution store error: {0}")]
    Storage(#[from] sqlx::Error),
}

/// Failures reported by a job handler running inside an orchestrator
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Worker-reported failure of the job itself (non-zero exit, HTTP error status, ...)
    #[error("{0}")]
    NodeExecution(String),

    #[error("job exceeded its timeout of {0:?}")]
    Timeout(Duration),

    #[error("no handler registered for {0} jobs")]
    NoHandler(JobType),

    #[error("job payload does not match its type: {0}")]
    Payload(#[from] serde_json::Error),
}
