/// Per-run graph state and the join rule
///
/// `RunState` is the single place where node outcomes turn into newly READY or
/// SKIPPED nodes. It is pure (no I/O) and is always mutated under the owning
/// run's lock, so sibling completions are applied one at a time.
///
/// Edge resolution by source outcome:
///
/// | source    | ALWAYS | ON_SUCCESS | ON_FAILURE | CONDITION          |
/// |-----------|--------|------------|------------|--------------------|
/// | SUCCEEDED | taken  | taken      | not taken  | expression result  |
/// | FAILED    | taken  | not taken  | taken      | not taken          |
/// | SKIPPED   | taken  | not taken  | not taken  | not taken          |
///
/// A node is decided once every incoming edge is resolved: READY if all of them
/// were taken, SKIPPED otherwise. Its input is built from the taken edges in
/// declaration order, so arrival order never changes the result.

use crate::workflow::condition::ConditionEvaluator;
use crate::workflow::graph::WorkflowGraph;
use crate::workflow::transform::merge_into;
use crate::workflow::types::ConnectionType;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;

/// Lifecycle of one node within one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeState {
    Pending,
    Ready,
    Submitted,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl NodeState {
    pub const ALL: [NodeState; 8] = [
        NodeState::Pending,
        NodeState::Ready,
        NodeState::Submitted,
        NodeState::Running,
        NodeState::Succeeded,
        NodeState::Failed,
        NodeState::Skipped,
        NodeState::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Pending => "PENDING",
            NodeState::Ready => "READY",
            NodeState::Submitted => "SUBMITTED",
            NodeState::Running => "RUNNING",
            NodeState::Succeeded => "SUCCEEDED",
            NodeState::Failed => "FAILED",
            NodeState::Skipped => "SKIPPED",
            NodeState::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == value)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeState::Succeeded | NodeState::Failed | NodeState::Skipped | NodeState::Cancelled
        )
    }

    /// Submitted or running: a job exists for the node
    pub fn is_in_flight(&self) -> bool {
        matches!(self, NodeState::Submitted | NodeState::Running)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal result of a node's job
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutcome {
    Succeeded(Value),
    Failed(String),
}

/// A node that just became READY, with its merged input
#[derive(Debug, Clone, PartialEq)]
pub struct ReadyNode {
    pub index: usize,
    pub input: Value,
}

/// What one resolution changed besides the resolved node itself
#[derive(Debug, Default)]
pub struct Resolution {
    pub ready: Vec<ReadyNode>,
    pub skipped: Vec<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EdgeResolution {
    Unresolved,
    Taken,
    NotTaken,
}

/// Node tallies once a run settles
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeCounts {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Mutable graph state of one workflow run
#[derive(Debug, Clone)]
pub struct RunState {
    states: Vec<NodeState>,
    /// Success output, or `{"error": ...}` for failed nodes
    outputs: Vec<Option<Value>>,
    edges: Vec<EdgeResolution>,
    input: Value,
}

impl RunState {
    pub fn new(graph: &WorkflowGraph, input: Value) -> Self {
        let edge_count = (0..graph.len()).map(|ix| graph.outgoing(ix).len()).sum();
        Self {
            states: vec![NodeState::Pending; graph.len()],
            outputs: vec![None; graph.len()],
            edges: vec![EdgeResolution::Unresolved; edge_count],
            input,
        }
    }

    pub fn state(&self, ix: usize) -> NodeState {
        self.states[ix]
    }

    pub fn output(&self, ix: usize) -> Option<&Value> {
        self.outputs[ix].as_ref()
    }


    /// Promote the root nodes to READY, seeded with the run input
    pub fn start(&mut self, graph: &WorkflowGraph) -> Vec<ReadyNode> {
        let mut ready = Vec::new();
        for ix in graph.roots() {
            if self.states[ix] == NodeState::Pending {
                self.states[ix] = NodeState::Ready;
                ready.push(ReadyNode {
                    index: ix,
                    input: self.input.clone(),
                });
            }
        }
        ready
    }

    /// Record SUBMITTED/RUNNING progress; terminal nodes are left alone
    pub fn mark(&mut self, ix: usize, state: NodeState) -> bool {
        if self.states[ix].is_terminal() {
            return false;
        }
        self.states[ix] = state;
        true
    }

    /// Apply a node's terminal outcome and propagate it along outgoing edges
    ///
    /// A second outcome for an already-terminal node is ignored.
    pub fn resolve(
        &mut self,
        graph: &WorkflowGraph,
        evaluator: &dyn ConditionEvaluator,
        ix: usize,
        outcome: NodeOutcome,
    ) -> Resolution {
        let mut resolution = Resolution::default();
        if self.states[ix].is_terminal() {
            tracing::debug!(
                "⏭️ Ignoring duplicate outcome for node '{}' ({})",
                graph.node(ix).id,
                self.states[ix]
            );
            return resolution;
        }

        match outcome {
            NodeOutcome::Succeeded(output) => {
                self.states[ix] = NodeState::Succeeded;
                self.outputs[ix] = Some(output);
            }
            NodeOutcome::Failed(error) => {
                self.states[ix] = NodeState::Failed;
                self.outputs[ix] = Some(json!({ "error": error }));
            }
        }

        let mut settled = vec![ix];
        while let Some(source) = settled.pop() {
            for &e in graph.outgoing(source) {
                let taken = self.edge_taken(graph, evaluator, e, source);
                self.edges[e] = if taken {
                    EdgeResolution::Taken
                } else {
                    EdgeResolution::NotTaken
                };

                let target = graph.target_of(e);
                if self.states[target] != NodeState::Pending {
                    continue;
                }
                let incoming = graph.incoming(target);
                if incoming
                    .iter()
                    .any(|&i| self.edges[i] == EdgeResolution::Unresolved)
                {
                    continue;
                }

                if incoming.iter().all(|&i| self.edges[i] == EdgeResolution::Taken) {
                    self.states[target] = NodeState::Ready;
                    resolution.ready.push(ReadyNode {
                        index: target,
                        input: self.input_for(graph, target),
                    });
                } else {
                    tracing::debug!("⏭️ Node '{}' skipped", graph.node(target).id);
                    self.states[target] = NodeState::Skipped;
                    resolution.skipped.push(target);
                    settled.push(target);
                }
            }
        }

        resolution
    }

    /// Mark every unfinished node CANCELLED and return the ones that had a job
    pub fn cancel(&mut self) -> Vec<usize> {
        let mut in_flight = Vec::new();
        for (ix, state) in self.states.iter_mut().enumerate() {
            if state.is_in_flight() {
                in_flight.push(ix);
            }
            if !state.is_terminal() {
                *state = NodeState::Cancelled;
            }
        }
        in_flight
    }

    /// No node is left PENDING, READY, SUBMITTED or RUNNING
    pub fn is_finished(&self) -> bool {
        self.states.iter().all(NodeState::is_terminal)
    }

    pub fn counts(&self) -> NodeCounts {
        let count = |wanted: NodeState| self.states.iter().filter(|&&s| s == wanted).count();
        NodeCounts {
            total: self.states.len(),
            succeeded: count(NodeState::Succeeded),
            failed: count(NodeState::Failed),
            skipped: count(NodeState::Skipped),
        }
    }

    /// First failed node whose failure no ON_FAILURE edge handles
    ///
    /// Such a failure fails the run; handled failures leave it COMPLETED.
    pub fn unhandled_failure(&self, graph: &WorkflowGraph) -> Option<(usize, String)> {
        graph.topological_order().iter().copied().find_map(|ix| {
            if self.states[ix] != NodeState::Failed || graph.has_failure_handler(ix) {
                return None;
            }
            let error = self.outputs[ix]
                .as_ref()
                .and_then(|o| o.get("error"))
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            Some((ix, error))
        })
    }

    fn edge_taken(
        &self,
        graph: &WorkflowGraph,
        evaluator: &dyn ConditionEvaluator,
        e: usize,
        source: usize,
    ) -> bool {
        let edge = graph.edge(e);
        match (self.states[source], edge.connection_type) {
            (_, ConnectionType::Always) => true,
            (NodeState::Succeeded, ConnectionType::OnSuccess) => true,
            (NodeState::Failed, ConnectionType::OnFailure) => true,
            (NodeState::Succeeded, ConnectionType::Condition) => {
                let expression = edge.condition.as_deref().unwrap_or_default();
                let context = json!({
                    "output": self.outputs[source].clone().unwrap_or(Value::Null),
                    "vars": self.input,
                });
                match evaluator.evaluate(expression, &context) {
                    Ok(taken) => taken,
                    Err(e) => {
                        tracing::warn!(
                            "⚠️ Edge {} -> {} not taken: {}",
                            edge.source,
                            edge.target,
                            e
                        );
                        false
                    }
                }
            }
            _ => false,
        }
    }

    fn input_for(&self, graph: &WorkflowGraph, ix: usize) -> Value {
        let incoming = graph.incoming(ix);
        if incoming.is_empty() {
            return self.input.clone();
        }

        let mut input = Map::new();
        for &e in incoming {
            let Some(output) = self.outputs[graph.source_of(e)].as_ref() else {
                continue;
            };
            let payload = match &graph.edge(e).transformer {
                Some(transformer) => transformer.apply(output),
                None => output.clone(),
            };
            merge_into(&mut input, payload);
        }
        Value::Object(input)
    }
}
