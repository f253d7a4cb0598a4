use crate::model::expr::Expr;
use crate::types::{MergeRule, RetryPolicy};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Gateway direction for parallel gateways.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GatewayDirection {
    Diverging,
    Converging,
}

/// Boundary event attached to a service task.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum BoundaryKind {
    /// Interrupting timer: fires on deadline, cancels the host task and
    /// diverts flow to the boundary's outgoing path.
    Timer { duration: Duration },
    /// Marks the host task as a compensation boundary: a failure escaping
    /// the task unwinds the branch's compensation stack and diverts flow.
    Compensation,
}

/// Per-node service-task configuration carried by the process definition.
/// Declared inputs/outputs and the handler live in the registry; the model
/// references the handler by stable key only.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskNode {
    /// Registry key from the `serviceTaskRef` extension element.
    pub task_ref: String,
    pub name: String,
    /// Overrides the definition's default retry policy when present.
    pub retry: Option<RetryPolicy>,
    /// Overrides the definition's default timeout when present.
    pub timeout: Option<Duration>,
    /// Compensating handler id, pushed on success when the task is compensable.
    pub compensation: Option<String>,
    /// Whether mock substitution is permitted for this node.
    pub mockable: bool,
}

/// One node per BPMN element in the supported subset.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum FlowNode {
    Start {
        id: String,
    },
    End {
        id: String,
        error: bool,
    },
    ServiceTask {
        id: String,
        task: TaskNode,
    },
    ExclusiveGateway {
        id: String,
        name: String,
        /// Sequence-flow id marked `default=` on the gateway element.
        default_flow: Option<String>,
    },
    ParallelGateway {
        id: String,
        name: String,
        direction: GatewayDirection,
    },
    Boundary {
        id: String,
        attached_to: String,
        kind: BoundaryKind,
    },
}

impl FlowNode {
    pub fn id(&self) -> &str {
        match self {
            FlowNode::Start { id }
            | FlowNode::End { id, .. }
            | FlowNode::ServiceTask { id, .. }
            | FlowNode::ExclusiveGateway { id, .. }
            | FlowNode::ParallelGateway { id, .. }
            | FlowNode::Boundary { id, .. } => id,
        }
    }
}

/// One edge per sequence flow. `order` preserves document order so
/// exclusive-gateway conditions evaluate in declared order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SequenceFlow {
    pub id: String,
    pub order: u32,
    pub condition: Option<Expr>,
}

pub type ProcessGraph = DiGraph<FlowNode, SequenceFlow>;

/// The immutable process model: the program the interpreter executes.
#[derive(Clone, Debug)]
pub struct ProcessModel {
    pub id: String,
    pub name: String,
    pub graph: ProcessGraph,
    /// Declared merge rule per data-object name. Keys written on multiple
    /// parallel branches without an entry here conflict at the join.
    pub data_objects: BTreeMap<String, MergeRule>,
    /// Diverging parallel gateway id → its structurally matched join id.
    pub parallel_pairs: BTreeMap<String, String>,
}

impl ProcessModel {
    pub fn node_index(&self, element_id: &str) -> Option<NodeIndex> {
        self.graph
            .node_indices()
            .find(|&idx| self.graph[idx].id() == element_id)
    }

    pub fn start(&self) -> Option<NodeIndex> {
        self.graph
            .node_indices()
            .find(|&idx| matches!(&self.graph[idx], FlowNode::Start { .. }))
    }

    /// Outgoing edges in declared document order.
    pub fn outgoing_in_order(&self, idx: NodeIndex) -> Vec<(NodeIndex, SequenceFlow)> {
        let mut edges: Vec<_> = self
            .graph
            .edges_directed(idx, petgraph::Direction::Outgoing)
            .map(|e| (e.target(), e.weight().clone()))
            .collect();
        edges.sort_by_key(|(_, flow)| flow.order);
        edges
    }

    /// Boundary events attached to the given element.
    pub fn boundaries_of(&self, element_id: &str) -> Vec<NodeIndex> {
        self.graph
            .node_indices()
            .filter(|&idx| {
                matches!(&self.graph[idx], FlowNode::Boundary { attached_to, .. }
                    if attached_to == element_id)
            })
            .collect()
    }

    /// All service-task registry keys referenced by the model.
    pub fn task_refs(&self) -> Vec<&TaskNode> {
        self.graph
            .node_indices()
            .filter_map(|idx| match &self.graph[idx] {
                FlowNode::ServiceTask { task, .. } => Some(task),
                _ => None,
            })
            .collect()
    }

    /// SHA-256 over the canonical BPMN serialization; the model's version key.
    pub fn fingerprint(&self) -> [u8; 32] {
        use sha2::{Digest, Sha256};
        let xml = crate::model::export::to_bpmn_xml(self);
        let mut hasher = Sha256::new();
        hasher.update(xml.as_bytes());
        hasher.finalize().into()
    }

    pub fn fingerprint_hex(&self) -> String {
        use std::fmt::Write;
        self.fingerprint().iter().fold(String::new(), |mut acc, b| {
            let _ = write!(acc, "{b:02x}");
            acc
        })
    }
}
