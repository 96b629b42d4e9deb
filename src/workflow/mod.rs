/// Workflow Management Layer
///
/// Workflow and event definitions, their SQLite persistence, the hot-reload
/// registries, graph compilation with cycle detection, edge condition
/// evaluation and edge transformers.

pub mod condition;
pub mod events;
pub mod graph;
pub mod registry;
pub mod storage;
pub mod transform;
pub mod types;

pub use condition::{ConditionEvaluator, LuaConditionEvaluator};
pub use events::{EventCatalog, EventDefinition, EventRegistry, StaticEventCatalog};
pub use graph::WorkflowGraph;
pub use registry::{CompiledWorkflow, WorkflowRegistry};
pub use storage::WorkflowStorage;
pub use transform::{FieldMapping, Transformer};
pub use types::{ConnectionType, Edge, Node, Workflow};
