/// SQLite persistence for workflow and event definitions
///
/// Both are stored as JSON documents keyed by id. The schema itself is
/// created by `storage::Database`.

use crate::workflow::events::EventDefinition;
use crate::workflow::types::Workflow;
use anyhow::Result;
use serde::Serialize;
use sqlx::{sqlite::SqlitePool, Row};

/// Definition storage manager
#[derive(Debug, Clone)]
pub struct WorkflowStorage {
    pool: SqlitePool,
}

impl WorkflowStorage {
    /// Create new storage instance over an initialized pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Store a new workflow or update an existing one
    pub async fn save_workflow(&self, workflow: &Workflow) -> Result<()> {
        let definition_json = serde_json::to_string(workflow)?;

        sqlx::query(
            r#"
            INSERT INTO workflows (id, name, definition, updated_at)
            VALUES (?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                definition = excluded.definition,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(&workflow.id)
        .bind(&workflow.name)
        .bind(&definition_json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Retrieve a workflow by ID
    pub async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>> {
        let row = sqlx::query("SELECT definition FROM workflows WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let definition_json: String = row.get("definition");
                Ok(Some(serde_json::from_str(&definition_json)?))
            }
            None => Ok(None),
        }
    }

    /// List workflows with basic metadata, most recently updated first
    pub async fn list_workflows(&self) -> Result<Vec<DefinitionMetadata>> {
        let rows = sqlx::query(
            "SELECT id, name, created_at, updated_at FROM workflows ORDER BY updated_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(metadata_from_row).collect())
    }

    /// All stored workflows, for registry initialization
    ///
    /// A definition that no longer parses is logged and left out rather than
    /// blocking startup.
    pub async fn load_all_workflows(&self) -> Result<Vec<Workflow>> {
        let rows = sqlx::query("SELECT id, definition FROM workflows")
            .fetch_all(&self.pool)
            .await?;

        let mut workflows = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.get("id");
            let definition_json: String = row.get("definition");
            match serde_json::from_str(&definition_json) {
                Ok(workflow) => workflows.push(workflow),
                Err(e) => tracing::error!("❌ Unreadable workflow definition '{}': {}", id, e),
            }
        }

        Ok(workflows)
    }

    /// Delete a workflow; `false` when it did not exist
    pub async fn delete_workflow(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM workflows WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Store a new event definition or replace an existing one
    pub async fn save_event(&self, event: &EventDefinition) -> Result<()> {
        let definition_json = serde_json::to_string(event)?;

        sqlx::query(
            r#"
            INSERT INTO events (id, name, definition, updated_at)
            VALUES (?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                definition = excluded.definition,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(&event.id)
        .bind(&event.name)
        .bind(&definition_json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Retrieve an event definition by ID
    pub async fn get_event(&self, id: &str) -> Result<Option<EventDefinition>> {
        let row = sqlx::query("SELECT definition FROM events WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let definition_json: String = row.get("definition");
                Ok(Some(serde_json::from_str(&definition_json)?))
            }
            None => Ok(None),
        }
    }

    /// All stored event definitions; unreadable ones are logged and skipped
    pub async fn load_all_events(&self) -> Result<Vec<EventDefinition>> {
        let rows = sqlx::query("SELECT id, definition FROM events")
            .fetch_all(&self.pool)
            .await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.get("id");
            let definition_json: String = row.get("definition");
            match serde_json::from_str(&definition_json) {
                Ok(event) => events.push(event),
                Err(e) => tracing::error!("❌ Unreadable event definition '{}': {}", id, e),
            }
        }

        Ok(events)
    }

    /// Delete an event definition; `false` when it did not exist
    pub async fn delete_event(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM events WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

/// Basic definition metadata for listing operations
#[derive(Debug, Serialize)]
pub struct DefinitionMetadata {
    pub id: String,
    pub name: String,
    pub created_at: String,
    pub updated_at: String,
}

fn metadata_from_row(row: &sqlx::sqlite::SqliteRow) -> DefinitionMetadata {
    DefinitionMetadata {
        id: row.get("id"),
        name: row.get("name"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}
