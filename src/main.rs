/// taskloom: job queue and workflow DAG executor
///
/// Starts the API server, a worker, or both, depending on `TASKLOOM_ROLE`:
/// - Workflow and event management at /api/workflows/*, /api/events/*
/// - Runs and executions at /api/workflows/{id}/runs, /api/executions/*
/// - Job inspection at /api/jobs/*
/// - Health check at /healthz

use taskloom::{config::Config, server::start_server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::default();
    start_server(config).await?;

    Ok(())
}
