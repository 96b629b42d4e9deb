/// taskloom: lease-based job queue and workflow DAG executor
///
/// Jobs (scripts, HTTP calls, tool actions, SSH runs) are leased to
/// orchestrators from a shared SQLite queue with retries and lease recovery.
/// Workflows are DAGs of event nodes whose edges react to success, failure or
/// a condition; the executor submits every READY node as a job and joins the
/// results.

// Core configuration and setup
pub mod config;

// Error taxonomy
pub mod error;

// SQLite bootstrap shared by every component
pub mod storage;

// Persistent job queue
pub mod queue;

// Workflow and event definitions, graph compilation, registries
pub mod workflow;

// DAG executor, execution records, cron scheduler
pub mod runtime;

// Orchestrator loop and job handlers
pub mod worker;

// HTTP API layer
pub mod api;

// Server setup and initialization
pub mod server;

pub use error::{ExecutorError, GraphError, HandlerError, QueueError};
pub use queue::{Job, JobQueue, JobStatus, JobType, NewJob};
pub use runtime::{ExecutionStatus, WorkflowExecution, WorkflowExecutor};
pub use server::start_server;
pub use workflow::{ConnectionType, Edge, Node, Workflow};
