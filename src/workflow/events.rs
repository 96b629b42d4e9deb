/// Event definitions and the catalog the executor reads them from
///
/// An event is the reusable unit of work a workflow node points at: its job
/// type, the type-specific spec (script, HTTP call, tool action, SSH target)
/// and queue options. Definitions are stored as JSON next to workflows and
/// served from an ArcSwap snapshot so lookups never block.

use crate::queue::types::{JobPriority, JobType};
use crate::workflow::storage::WorkflowStorage;
use anyhow::Result;
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::HashMap, sync::Arc};

/// A stored event definition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDefinition {
    /// Taken from the URL on `PUT /api/events/{id}`
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub job_type: JobType,
    /// Type-specific part of the job payload, e.g. `{"http": {...}}`
    pub spec: Value,
    #[serde(default)]
    pub priority: JobPriority,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    /// Bumped on every save; part of packaged payload references
    #[serde(default = "default_version")]
    pub version: u32,
}

fn default_version() -> u32 {
    1
}

/// Read-only lookup of event definitions by id
pub trait EventCatalog: Send + Sync {
    fn get_event(&self, event_id: &str) -> Option<Arc<EventDefinition>>;
}

/// Hot-reloadable catalog backed by the `events` table
#[derive(Debug)]
pub struct EventRegistry {
    events: ArcSwap<HashMap<String, Arc<EventDefinition>>>,
    storage: WorkflowStorage,
}

impl EventRegistry {
    pub fn new(storage: WorkflowStorage) -> Self {
        Self {
            events: ArcSwap::new(Arc::new(HashMap::new())),
            storage,
        }
    }

    /// Load every stored definition
    pub async fn init_from_storage(&self) -> Result<()> {
        let events = self.storage.load_all_events().await?;
        let snapshot: HashMap<String, Arc<EventDefinition>> = events
            .into_iter()
            .map(|event| (event.id.clone(), Arc::new(event)))
            .collect();

        tracing::info!("📚 Loaded {} event definitions", snapshot.len());
        self.events.store(Arc::new(snapshot));
        Ok(())
    }

    /// Persist a definition and publish it to the catalog
    ///
    /// The stored version is one higher than the one it replaces.
    pub async fn upsert(&self, mut event: EventDefinition) -> Result<Arc<EventDefinition>> {
        event.version = self
            .storage
            .get_event(&event.id)
            .await?
            .map(|previous| previous.version + 1)
            .unwrap_or(1);
        self.storage.save_event(&event).await?;

        let event = Arc::new(event);
        let mut snapshot = (**self.events.load()).clone();
        snapshot.insert(event.id.clone(), Arc::clone(&event));
        self.events.store(Arc::new(snapshot));

        tracing::info!("🔥 Hot-reloaded event '{}' (v{})", event.id, event.version);
        Ok(event)
    }

    pub async fn remove(&self, event_id: &str) -> Result<bool> {
        let deleted = self.storage.delete_event(event_id).await?;

        let mut snapshot = (**self.events.load()).clone();
        if snapshot.remove(event_id).is_some() {
            self.events.store(Arc::new(snapshot));
            tracing::info!("🗑️ Removed event '{}' from catalog", event_id);
        }

        Ok(deleted)
    }
}

impl EventCatalog for EventRegistry {
    fn get_event(&self, event_id: &str) -> Option<Arc<EventDefinition>> {
        self.events.load().get(event_id).cloned()
    }
}

/// Fixed in-memory catalog
#[derive(Debug, Default)]
pub struct StaticEventCatalog {
    events: HashMap<String, Arc<EventDefinition>>,
}

impl StaticEventCatalog {
    pub fn new(events: impl IntoIterator<Item = EventDefinition>) -> Self {
        Self {
            events: events
                .into_iter()
                .map(|event| (event.id.clone(), Arc::new(event)))
                .collect(),
        }
    }
}

impl EventCatalog for StaticEventCatalog {
    fn get_event(&self, event_id: &str) -> Option<Arc<EventDefinition>> {
        self.events.get(event_id).cloned()
    }
}
