/// Job workers
///
/// The orchestrator loop plus the per-type handlers it dispatches to.

pub mod handlers;
pub mod orchestrator;
pub mod targets;

pub use handlers::{
    HandlerRegistry, HttpRequestHandler, JobHandler, LocalScriptHandler, RemoteOutput, RemoteRunner,
    SshHandler, ToolAction, ToolActionRouter,
};
pub use orchestrator::{Orchestrator, OrchestratorSettings};
pub use targets::{ExecutionTarget, StaticTargetSource, TargetResolver, TargetSource};
