/// Core workflow type definitions
///
/// Workflows are stored as JSON in SQLite and compiled into a `WorkflowGraph`
/// when loaded into the registry. Nodes reference event definitions; edges
/// carry one of four connection kinds plus an optional condition and
/// transformer.

use crate::workflow::transform::Transformer;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A complete workflow definition containing nodes and their connections
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    /// Unique workflow identifier (e.g., "wf-nightly-backup")
    pub id: String,
    /// Human-readable workflow name
    pub name: String,
    /// Owner of the jobs this workflow submits
    pub user_id: String,
    /// Optional cron expression; each tick starts a run
    #[serde(default)]
    pub schedule: Option<String>,
    /// Input bag for scheduled runs
    #[serde(default)]
    pub schedule_input: Option<Value>,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

/// A single node in the workflow DAG
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Unique node identifier within the workflow (e.g., "build", "deploy")
    pub id: String,
    /// Event definition this node runs
    pub event_id: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// How an edge reacts to its source node's outcome
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionType {
    /// Fires whatever the source's outcome, including a skip
    Always,
    #[default]
    OnSuccess,
    OnFailure,
    /// Fires when the boolean expression holds against the source's output
    Condition,
}

/// Connection between two nodes in the workflow DAG
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    /// Source node ID
    pub source: String,
    /// Target node ID
    pub target: String,
    #[serde(default)]
    pub connection_type: ConnectionType,
    /// Boolean expression over the source output; required for CONDITION edges
    #[serde(default)]
    pub condition: Option<String>,
    /// Projection applied to the source output before it reaches the target
    #[serde(default)]
    pub transformer: Option<Transformer>,
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>, connection_type: ConnectionType) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            connection_type,
            condition: None,
            transformer: None,
        }
    }

    pub fn with_condition(mut self, expression: impl Into<String>) -> Self {
        self.condition = Some(expression.into());
        self
    }

    pub fn with_transformer(mut self, transformer: Transformer) -> Self {
        self.transformer = Some(transformer);
        self
    }
}
