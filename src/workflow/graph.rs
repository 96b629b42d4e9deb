/// Compiled workflow graph
///
/// Built once when a workflow enters the registry. Construction validates the
/// structure (unique node ids, edges between known nodes, CONDITION edges with
/// an expression) and rejects cycles, self-loops included, via petgraph's
/// topological sort. Runs only ever read the compiled form.

use crate::error::GraphError;
use crate::workflow::types::{ConnectionType, Edge, Node, Workflow};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;

/// Read-only DAG view of a workflow
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    index: HashMap<String, usize>,
    /// Edge indices into `edges`, per node, in declaration order
    incoming: Vec<Vec<usize>>,
    outgoing: Vec<Vec<usize>>,
    /// Node indices in a topological order
    order: Vec<usize>,
}

impl WorkflowGraph {
    /// Validate and compile a workflow definition
    pub fn build(workflow: &Workflow) -> Result<Self, GraphError> {
        tracing::debug!(
            "🏗️ Building graph for '{}' ({} nodes, {} edges)",
            workflow.id,
            workflow.nodes.len(),
            workflow.edges.len()
        );

        let mut graph: DiGraph<usize, usize> = DiGraph::new();
        let mut index = HashMap::new();
        let mut node_indices = Vec::with_capacity(workflow.nodes.len());

        for (i, node) in workflow.nodes.iter().enumerate() {
            if index.insert(node.id.clone(), i).is_some() {
                return Err(GraphError::DuplicateNode(node.id.clone()));
            }
            node_indices.push(graph.add_node(i));
        }

        let mut incoming = vec![Vec::new(); workflow.nodes.len()];
        let mut outgoing = vec![Vec::new(); workflow.nodes.len()];

        for (e, edge) in workflow.edges.iter().enumerate() {
            let lookup = |id: &str| {
                index.get(id).copied().ok_or_else(|| GraphError::UnknownNode {
                    source_id: edge.source.clone(),
                    target_id: edge.target.clone(),
                    missing: id.to_string(),
                })
            };
            let source = lookup(&edge.source)?;
            let target = lookup(&edge.target)?;

            if edge.connection_type == ConnectionType::Condition
                && edge.condition.as_deref().map_or(true, |c| c.trim().is_empty())
            {
                return Err(GraphError::MissingCondition {
                    source_id: edge.source.clone(),
                    target_id: edge.target.clone(),
                });
            }

            graph.add_edge(node_indices[source], node_indices[target], e);
            outgoing[source].push(e);
            incoming[target].push(e);
        }

        let order = toposort(&graph, None).map_err(|cycle| GraphError::Cycle {
            workflow_id: workflow.id.clone(),
            node_id: workflow.nodes[graph[cycle.node_id()]].id.clone(),
        })?;
        let order = order.into_iter().map(|ix: NodeIndex| graph[ix]).collect();

        Ok(Self {
            nodes: workflow.nodes.clone(),
            edges: workflow.edges.clone(),
            index,
            incoming,
            outgoing,
            order,
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, ix: usize) -> &Node {
        &self.nodes[ix]
    }

    pub fn edge(&self, e: usize) -> &Edge {
        &self.edges[e]
    }

    pub fn index_of(&self, node_id: &str) -> Option<usize> {
        self.index.get(node_id).copied()
    }

    pub fn incoming(&self, ix: usize) -> &[usize] {
        &self.incoming[ix]
    }

    pub fn outgoing(&self, ix: usize) -> &[usize] {
        &self.outgoing[ix]
    }

    /// Node index at the source end of edge `e`
    pub fn source_of(&self, e: usize) -> usize {
        self.index[&self.edges[e].source]
    }

    /// Node index at the target end of edge `e`
    pub fn target_of(&self, e: usize) -> usize {
        self.index[&self.edges[e].target]
    }

    /// Nodes without incoming edges
    pub fn roots(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.nodes.len()).filter(|&ix| self.incoming[ix].is_empty())
    }

    pub fn topological_order(&self) -> &[usize] {
        &self.order
    }

    /// Whether a failure of node `ix` is handled by an ON_FAILURE path
    pub fn has_failure_handler(&self, ix: usize) -> bool {
        self.outgoing[ix]
            .iter()
            .any(|&e| self.edges[e].connection_type == ConnectionType::OnFailure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workflow(nodes: &[&str], edges: Vec<Edge>) -> Workflow {
        Workflow {
            id: "wf-test".to_string(),
            name: "test".to_string(),
            user_id: "user-1".to_string(),
            schedule: None,
            schedule_input: None,
            nodes: nodes
                .iter()
                .map(|id| Node {
                    id: id.to_string(),
                    event_id: format!("ev-{id}"),
                    name: None,
                })
                .collect(),
            edges,
        }
    }

    #[test]
    fn orders_nodes_topologically() {
        let wf = workflow(
            &["c", "a", "b"],
            vec![
                Edge::new("a", "b", ConnectionType::OnSuccess),
                Edge::new("b", "c", ConnectionType::Always),
            ],
        );
        let graph = WorkflowGraph::build(&wf).unwrap();

        let order: Vec<&str> = graph
            .topological_order()
            .iter()
            .map(|&ix| graph.node(ix).id.as_str())
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert_eq!(graph.roots().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn rejects_cycles_and_self_loops() {
        let cyclic = workflow(
            &["a", "b"],
            vec![
                Edge::new("a", "b", ConnectionType::OnSuccess),
                Edge::new("b", "a", ConnectionType::OnSuccess),
            ],
        );
        assert!(matches!(
            WorkflowGraph::build(&cyclic),
            Err(GraphError::Cycle { .. })
        ));

        let self_loop = workflow(&["a"], vec![Edge::new("a", "a", ConnectionType::Always)]);
        assert!(matches!(
            WorkflowGraph::build(&self_loop),
            Err(GraphError::Cycle { .. })
        ));
    }

    #[test]
    fn rejects_malformed_definitions() {
        let unknown = workflow(&["a"], vec![Edge::new("a", "ghost", ConnectionType::Always)]);
        assert!(matches!(
            WorkflowGraph::build(&unknown),
            Err(GraphError::UnknownNode { missing, .. }) if missing == "ghost"
        ));

        let duplicate = workflow(&["a", "a"], vec![]);
        assert!(matches!(
            WorkflowGraph::build(&duplicate),
            Err(GraphError::DuplicateNode(id)) if id == "a"
        ));

        let bare_condition =
            workflow(&["a", "b"], vec![Edge::new("a", "b", ConnectionType::Condition)]);
        assert!(matches!(
            WorkflowGraph::build(&bare_condition),
            Err(GraphError::MissingCondition { .. })
        ));
    }
}
