/// Server setup and initialization
///
/// Wires together storage, the job queue, the registries, the executor, the
/// cron scheduler and (depending on the role) an embedded orchestrator, then
/// exposes the HTTP API.

use crate::{
    api::{create_execution_routes, create_workflow_routes, AppState},
    config::{Config, Role},
    queue::{JobQueue, JobStore},
    runtime::{
        engine::WorkflowExecutor, node_runner::NodeRunner, payload::DefaultPayloadBuilder,
        records::ExecutionStore, scheduler::CronSchedulerService,
    },
    storage::Database,
    worker::{HandlerRegistry, Orchestrator},
    workflow::{
        condition::LuaConditionEvaluator, events::EventRegistry, registry::WorkflowRegistry,
        storage::WorkflowStorage,
    },
};
use anyhow::Result;
use axum::{routing::get, Router};
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Open the database and start the queue's lease reaper
async fn open_queue(config: &Config) -> Result<(Database, Arc<JobQueue>)> {
    if let Some(path) = config.database.url.strip_prefix("sqlite://") {
        if let Some(dir) = Path::new(path).parent().filter(|d| !d.as_os_str().is_empty()) {
            tracing::info!("📁 Ensuring data directory exists: {}", dir.display());
            std::fs::create_dir_all(dir)
                .map_err(|e| anyhow::anyhow!("Failed to create data directory: {}", e))?;
        }
    }

    let database = Database::connect(&config.database.url).await?;
    let queue = Arc::new(JobQueue::new(
        JobStore::new(database.pool().clone()),
        config.queue.settings(),
    ));
    queue.spawn_reaper(config.queue.reap_interval());

    Ok((database, queue))
}

/// Orchestrator with the built-in handlers
///
/// SSH and tool action handlers need application wiring; without it those
/// jobs stay queued for a worker that has them.
fn spawn_orchestrator(config: &Config, queue: Arc<JobQueue>) -> Arc<Orchestrator> {
    let handlers = Arc::new(HandlerRegistry::with_defaults());
    let orchestrator = Arc::new(Orchestrator::new(queue, handlers, config.worker.settings()));
    orchestrator.spawn();
    orchestrator
}

/// Open storage and start every background service of the server role
pub async fn create_state(config: &Config) -> Result<AppState> {
    let (database, queue) = open_queue(config).await?;
    let pool = database.pool().clone();

    tracing::info!("📊 Initializing workflow and event registries");
    let storage = WorkflowStorage::new(pool.clone());
    let registry = Arc::new(WorkflowRegistry::new(storage.clone()));
    registry
        .init_from_storage()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load workflows from storage: {}", e))?;
    let events = Arc::new(EventRegistry::new(storage.clone()));
    events
        .init_from_storage()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load events from storage: {}", e))?;

    tracing::info!("🚀 Initializing workflow executor");
    let records = ExecutionStore::new(pool);
    let runner = Arc::new(NodeRunner::new(
        Arc::clone(&queue),
        events.clone(),
        Arc::new(DefaultPayloadBuilder),
        records.clone(),
    ));
    let executor = Arc::new(WorkflowExecutor::new(
        Arc::clone(&registry),
        runner,
        records,
        Arc::new(LuaConditionEvaluator::default()),
        config.executor.settings(),
    ));
    executor.start();
    let resumed = executor.resume().await?;
    if resumed > 0 {
        tracing::info!("♻️ Resumed {} executions", resumed);
    }

    tracing::info!("⏰ Initializing cron scheduler service");
    let scheduler = Arc::new(
        CronSchedulerService::new(Arc::clone(&registry), Arc::clone(&executor))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to initialize cron scheduler: {}", e))?,
    );
    let scheduler_clone = Arc::clone(&scheduler);
    tokio::spawn(async move {
        if let Err(e) = scheduler_clone.start().await {
            tracing::error!("❌ Failed to start cron scheduler: {}", e);
        }
    });

    if config.worker.role.runs_worker() {
        tracing::info!("🛠️ Starting embedded orchestrator");
        spawn_orchestrator(config, Arc::clone(&queue));
    }

    tracing::info!("✅ Application initialized successfully");
    Ok(AppState {
        storage,
        registry,
        events,
        scheduler,
        executor,
        queue,
    })
}

/// Create the main Axum application with all routes
pub fn create_app(state: AppState) -> Router {
    tracing::info!("📡 Creating HTTP router with all endpoints");
    Router::new()
        .route("/healthz", get(health_check))
        .merge(create_workflow_routes())
        .merge(create_execution_routes())
        .with_state(state)
}

/// Start the process in its configured role
pub async fn start_server(config: Config) -> Result<()> {
    let filter = EnvFilter::try_from_env("TASKLOOM_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting taskloom ({:?})...", config.worker.role);

    if config.worker.role == Role::Worker {
        let (_database, queue) = open_queue(&config).await?;
        let orchestrator = spawn_orchestrator(&config, queue);
        tracing::info!("Worker {} running", orchestrator.worker_id());
        shutdown_signal().await;
        tracing::info!("Worker {} shutting down", orchestrator.worker_id());
        return Ok(());
    }

    let state = create_state(&config).await?;
    let scheduler = Arc::clone(&state.scheduler);
    let app = create_app(state);

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;
    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // No new cron runs once the API is down
    scheduler.stop().await?;
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("❌ Failed to listen for shutdown signal: {}", e);
    }
}

async fn health_check() -> &'static str {
    "ok"
}
