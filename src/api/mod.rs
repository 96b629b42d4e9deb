/// HTTP API Layer
///
/// REST endpoints for workflow and event definitions, run control and job
/// inspection.

// Workflow management endpoints (POST/GET/PUT/DELETE)
pub mod workflows;

// Events, runs, executions and jobs
pub mod executions;

pub use executions::create_execution_routes;
pub use workflows::{create_workflow_routes, AppState};
