/// Background cron scheduler service
///
/// Starts a run of every workflow that carries a `schedule` cron expression.
/// One tokio-cron-scheduler job per workflow, tracked by UUID so a changed or
/// removed schedule replaces the old job without restarting the scheduler.

use crate::{runtime::engine::WorkflowExecutor, workflow::registry::WorkflowRegistry, workflow::types::Workflow};
use anyhow::Result;
use chrono::Utc;
use serde_json::{json, Value};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

pub struct CronSchedulerService {
    scheduler: Arc<RwLock<JobScheduler>>,
    /// workflow id -> scheduler job
    job_uuid_map: Arc<RwLock<HashMap<String, Uuid>>>,
    registry: Arc<WorkflowRegistry>,
    executor: Arc<WorkflowExecutor>,
}

impl CronSchedulerService {
    pub async fn new(registry: Arc<WorkflowRegistry>, executor: Arc<WorkflowExecutor>) -> Result<Self> {
        let scheduler = JobScheduler::new().await?;

        Ok(Self {
            scheduler: Arc::new(RwLock::new(scheduler)),
            job_uuid_map: Arc::new(RwLock::new(HashMap::new())),
            registry,
            executor,
        })
    }

    /// Register every scheduled workflow, then start ticking
    pub async fn start(&self) -> Result<()> {
        tracing::info!("⏰ Starting cron scheduler service");

        self.register_all().await;
        {
            let scheduler = self.scheduler.read().await;
            scheduler.start().await?;
        }

        tracing::info!("✅ Cron scheduler started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        tracing::info!("⏹️ Stopping cron scheduler service");

        self.job_uuid_map.write().await.clear();
        {
            let mut scheduler = self.scheduler.write().await;
            scheduler.shutdown().await?;
        }

        tracing::info!("✅ Cron scheduler stopped");
        Ok(())
    }

    /// Install, replace or drop the cron job of one workflow
    pub async fn add_or_update_workflow_schedule(&self, workflow: &Workflow) -> Result<()> {
        self.remove_workflow_schedule(&workflow.id).await;

        let Some(schedule) = workflow.schedule.as_deref().filter(|s| !s.trim().is_empty()) else {
            tracing::debug!("📋 Workflow '{}' has no schedule", workflow.id);
            return Ok(());
        };

        let workflow_id = workflow.id.clone();
        let registry = Arc::clone(&self.registry);
        let executor = Arc::clone(&self.executor);

        let job = Job::new_async(schedule, move |_uuid, _l| {
            let workflow_id = workflow_id.clone();
            let registry = Arc::clone(&registry);
            let executor = Arc::clone(&executor);

            Box::pin(async move {
                // The definition may have changed or vanished since registration
                let Some(compiled) = registry.get_workflow(&workflow_id) else {
                    tracing::debug!("⏭️ Skipping cron tick for deleted workflow: {}", workflow_id);
                    return;
                };

                let input = compiled
                    .workflow
                    .schedule_input
                    .clone()
                    .unwrap_or_else(|| cron_input(&workflow_id));

                match executor.run(&workflow_id, input).await {
                    Ok(handle) => tracing::info!(
                        "🔔 Cron started execution {} of workflow '{}'",
                        handle.execution_id(),
                        workflow_id
                    ),
                    Err(e) => tracing::error!("❌ Cron run of workflow '{}' failed to start: {}", workflow_id, e),
                }
            })
        })?;

        let job_uuid = {
            let scheduler = self.scheduler.write().await;
            scheduler.add(job).await?
        };
        self.job_uuid_map.write().await.insert(workflow.id.clone(), job_uuid);

        tracing::info!("🔥 Scheduled workflow '{}' ({})", workflow.id, schedule);
        Ok(())
    }

    pub async fn remove_workflow_schedule(&self, workflow_id: &str) {
        let Some(job_uuid) = self.job_uuid_map.write().await.remove(workflow_id) else {
            return;
        };

        let scheduler = self.scheduler.read().await;
        match scheduler.remove(&job_uuid).await {
            Ok(()) => tracing::debug!("🛑 Removed cron job of workflow '{}'", workflow_id),
            Err(e) => tracing::warn!("⚠️ Failed to remove cron job of workflow '{}': {}", workflow_id, e),
        }
    }

    /// A bad cron expression only disables that one workflow's schedule
    async fn register_all(&self) {
        let workflows = self.registry.get_all_workflows();
        let mut scheduled = 0;

        for compiled in &workflows {
            if compiled.workflow.schedule.is_none() {
                continue;
            }
            match self.add_or_update_workflow_schedule(&compiled.workflow).await {
                Ok(()) => scheduled += 1,
                Err(e) => tracing::error!(
                    "❌ Invalid schedule on workflow '{}': {}",
                    compiled.workflow.id,
                    e
                ),
            }
        }

        tracing::info!("📊 Scheduled {} of {} workflows", scheduled, workflows.len());
    }
}

/// Run input used when a scheduled workflow defines none
fn cron_input(workflow_id: &str) -> Value {
    json!({
        "trigger": "cron",
        "workflowId": workflow_id,
        "firedAt": Utc::now().to_rfc3339(),
    })
}
