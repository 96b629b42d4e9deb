/// Workflow runtime
///
/// - `join`: per-run node state machine and the join/skip rule
/// - `engine`: the executor that drives runs through the job queue
/// - `node_runner`: node -> job submission and completion routing
/// - `payload`: job payload construction from event definitions
/// - `records`: persisted executions and node runs
/// - `scheduler`: cron-started runs

pub mod engine;
pub mod join;
pub mod node_runner;
pub mod payload;
pub mod records;
pub mod scheduler;

pub use engine::{ExecutorSettings, RunHandle, WorkflowExecutor};
pub use join::{NodeCounts, NodeOutcome, NodeState, RunState};
pub use node_runner::NodeRunner;
pub use payload::{DefaultPayloadBuilder, PayloadBuilder, PayloadContext};
pub use records::{ExecutionDetail, ExecutionStatus, ExecutionStore, NodeRun, WorkflowExecution};
pub use scheduler::CronSchedulerService;
