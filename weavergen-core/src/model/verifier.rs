//! Structural verification of a parsed process model.
//!
//! Returns a list of errors naming the offending element; an empty list
//! means the model is executable. Parallel split/join matching doubles as
//! the source of `ProcessModel::parallel_pairs`.

use crate::error::{EngineError, EngineResult};
use crate::model::ir::*;
use petgraph::graph::NodeIndex;
use petgraph::visit::{Dfs, EdgeRef};
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Debug, Clone)]
pub struct VerifyError {
    pub message: String,
    pub element_id: Option<String>,
}

impl std::fmt::Display for VerifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(id) = &self.element_id {
            write!(f, "[{}] {}", id, self.message)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

fn err(message: impl Into<String>, element_id: Option<&str>) -> VerifyError {
    VerifyError {
        message: message.into(),
        element_id: element_id.map(str::to_string),
    }
}

/// Verify structural invariants. Empty result means valid.
pub fn verify(model: &ProcessModel) -> Vec<VerifyError> {
    let graph = &model.graph;
    let mut errors = Vec::new();

    // 1. Unique element ids.
    {
        let mut seen = HashSet::new();
        for idx in graph.node_indices() {
            if !seen.insert(graph[idx].id()) {
                errors.push(err("duplicate element id", Some(graph[idx].id())));
            }
        }
    }

    // 2. Exactly one start event.
    let starts: Vec<_> = graph
        .node_indices()
        .filter(|&idx| matches!(&graph[idx], FlowNode::Start { .. }))
        .collect();
    match starts.len() {
        0 => errors.push(err("no startEvent found", None)),
        1 => {}
        n => errors.push(err(format!("multiple startEvents found ({n})"), None)),
    }

    // 3. At least one end event; end events have no outgoing flow.
    let ends: Vec<_> = graph
        .node_indices()
        .filter(|&idx| matches!(&graph[idx], FlowNode::End { .. }))
        .collect();
    if ends.is_empty() {
        errors.push(err("no endEvent found", None));
    }
    for &idx in &ends {
        if graph
            .edges_directed(idx, petgraph::Direction::Outgoing)
            .count()
            > 0
        {
            errors.push(err("endEvent has outgoing flow", Some(graph[idx].id())));
        }
    }

    // 4. Acyclic: the interpreter has no loop semantics in this subset.
    if petgraph::algo::is_cyclic_directed(graph) {
        errors.push(err("process graph contains a cycle", None));
    }

    // 5. All nodes reachable from start; boundary events are alternative
    //    entry points for their escalation paths.
    if let Some(&start_idx) = starts.first() {
        let mut reachable = HashSet::new();
        let mut dfs = Dfs::new(graph, start_idx);
        while let Some(nx) = dfs.next(graph) {
            reachable.insert(nx);
        }
        for idx in graph.node_indices() {
            if matches!(&graph[idx], FlowNode::Boundary { .. }) && !reachable.contains(&idx) {
                reachable.insert(idx);
                let mut bdfs = Dfs::new(graph, idx);
                while let Some(nx) = bdfs.next(graph) {
                    reachable.insert(nx);
                }
            }
        }
        for idx in graph.node_indices() {
            if !reachable.contains(&idx) {
                errors.push(err("unreachable node", Some(graph[idx].id())));
            }
        }
    }

    // 6. Exclusive gateways: conditions partition the decision space with
    //    exactly one default.
    for idx in graph.node_indices() {
        if let FlowNode::ExclusiveGateway {
            id, default_flow, ..
        } = &graph[idx]
        {
            let outgoing = model.outgoing_in_order(idx);
            if outgoing.len() < 2 {
                continue; // converging or pass-through use
            }
            match default_flow {
                Some(default_id) => {
                    let Some((_, default_edge)) =
                        outgoing.iter().find(|(_, f)| &f.id == default_id)
                    else {
                        errors.push(err(
                            format!("default flow '{default_id}' is not an outgoing edge"),
                            Some(id),
                        ));
                        continue;
                    };
                    if default_edge.condition.is_some() {
                        errors.push(err(
                            format!("default flow '{default_id}' must not carry a condition"),
                            Some(id),
                        ));
                    }
                    for (_, flow) in &outgoing {
                        if &flow.id != default_id && flow.condition.is_none() {
                            errors.push(err(
                                format!("non-default flow '{}' is missing a condition", flow.id),
                                Some(id),
                            ));
                        }
                    }
                }
                None => {
                    let unconditioned: Vec<_> = outgoing
                        .iter()
                        .filter(|(_, f)| f.condition.is_none())
                        .collect();
                    if unconditioned.len() != 1 {
                        errors.push(err(
                            format!(
                                "exclusive gateway needs exactly one default flow, found {}",
                                unconditioned.len()
                            ),
                            Some(id),
                        ));
                    }
                }
            }
        }
    }

    // 7. Parallel gateways: degree sanity plus split/join matching.
    for idx in graph.node_indices() {
        if let FlowNode::ParallelGateway { id, direction, .. } = &graph[idx] {
            let out = graph
                .edges_directed(idx, petgraph::Direction::Outgoing)
                .count();
            let inc = graph
                .edges_directed(idx, petgraph::Direction::Incoming)
                .count();
            match direction {
                GatewayDirection::Diverging => {
                    if out < 1 {
                        errors.push(err("parallel split has no outgoing flow", Some(id)));
                    }
                }
                GatewayDirection::Converging => {
                    if out != 1 {
                        errors.push(err(
                            format!("parallel join must have exactly 1 outgoing flow, found {out}"),
                            Some(id),
                        ));
                    }
                    if inc < 1 {
                        errors.push(err("parallel join has no incoming flow", Some(id)));
                    }
                }
            }
        }
    }
    if errors.is_empty() {
        if let Err(e) = parallel_pairs(model) {
            errors.push(err(e.to_string(), None));
        }
    }

    // 8. Start events and service tasks continue on exactly one flow.
    for idx in graph.node_indices() {
        let needs_single = matches!(
            &graph[idx],
            FlowNode::Start { .. } | FlowNode::ServiceTask { .. }
        );
        if needs_single {
            let out = graph
                .edges_directed(idx, petgraph::Direction::Outgoing)
                .count();
            if out != 1 {
                errors.push(err(
                    format!("expected exactly 1 outgoing flow, found {out}"),
                    Some(graph[idx].id()),
                ));
            }
        }
    }

    // 9. Boundary events.
    let mut timers_per_host: HashMap<&str, u32> = HashMap::new();
    let mut compensations_per_host: HashMap<&str, u32> = HashMap::new();
    for idx in graph.node_indices() {
        if let FlowNode::Boundary {
            id,
            attached_to,
            kind,
        } = &graph[idx]
        {
            let host_is_task = graph.node_indices().any(|other| {
                matches!(&graph[other], FlowNode::ServiceTask { id: host, .. } if host == attached_to)
            });
            if !host_is_task {
                errors.push(err(
                    format!("attachedToRef '{attached_to}' does not reference a serviceTask"),
                    Some(id),
                ));
            }
            let out = graph
                .edges_directed(idx, petgraph::Direction::Outgoing)
                .count();
            if out != 1 {
                errors.push(err(
                    format!("boundaryEvent must have exactly 1 outgoing flow, found {out}"),
                    Some(id),
                ));
            }
            let book = match kind {
                BoundaryKind::Timer { .. } => &mut timers_per_host,
                BoundaryKind::Compensation => &mut compensations_per_host,
            };
            let count = book.entry(attached_to.as_str()).or_insert(0);
            *count += 1;
            if *count > 1 {
                errors.push(err(
                    "more than one boundary event of the same kind on a task",
                    Some(attached_to),
                ));
            }
        }
    }

    errors
}

/// Convenience wrapper converting the error list into an `EngineError`.
pub fn verify_or_err(model: &ProcessModel) -> EngineResult<()> {
    let errors = verify(model);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(EngineError::InvalidProcess(
            errors.iter().map(|e| e.to_string()).collect(),
        ))
    }
}

/// Match every diverging parallel gateway with the converging gateway all
/// of its branches reach. Walks every path, counting split depth; exclusive
/// branches inside a parallel branch must agree on the join they reach.
pub fn parallel_pairs(model: &ProcessModel) -> EngineResult<BTreeMap<String, String>> {
    let graph = &model.graph;
    let mut pairs = BTreeMap::new();
    for idx in graph.node_indices() {
        if matches!(
            &graph[idx],
            FlowNode::ParallelGateway {
                direction: GatewayDirection::Diverging,
                ..
            }
        ) {
            let join = find_join(model, idx)?;
            pairs.insert(
                graph[idx].id().to_string(),
                graph[join].id().to_string(),
            );
        }
    }
    Ok(pairs)
}

fn find_join(model: &ProcessModel, split: NodeIndex) -> EngineResult<NodeIndex> {
    let graph = &model.graph;
    let split_id = graph[split].id().to_string();
    let mut found: Option<NodeIndex> = None;
    for edge in graph.edges_directed(split, petgraph::Direction::Outgoing) {
        let join = walk_to_join(model, edge.target(), &split_id)?;
        match found {
            None => found = Some(join),
            Some(prev) if prev == join => {}
            Some(prev) => {
                return Err(EngineError::InvalidProcess(vec![format!(
                    "[{split_id}] branches reach different parallel joins ('{}' vs '{}')",
                    graph[prev].id(),
                    graph[join].id()
                )]))
            }
        }
    }
    found.ok_or_else(|| {
        EngineError::InvalidProcess(vec![format!("[{split_id}] parallel split has no branches")])
    })
}

/// Follow a branch until its first converging parallel gateway, descending
/// through nested splits via their own matched joins.
fn walk_to_join(model: &ProcessModel, from: NodeIndex, split_id: &str) -> EngineResult<NodeIndex> {
    let graph = &model.graph;
    let mut current = from;
    loop {
        match &graph[current] {
            FlowNode::ParallelGateway {
                direction: GatewayDirection::Converging,
                ..
            } => return Ok(current),
            FlowNode::ParallelGateway {
                direction: GatewayDirection::Diverging,
                ..
            } => {
                let nested_join = find_join(model, current)?;
                let Some(next) = graph
                    .edges_directed(nested_join, petgraph::Direction::Outgoing)
                    .map(|e| e.target())
                    .next()
                else {
                    return Err(EngineError::InvalidProcess(vec![format!(
                        "[{}] nested parallel join has no outgoing flow",
                        graph[nested_join].id()
                    )]));
                };
                current = next;
            }
            FlowNode::End { id, .. } => {
                return Err(EngineError::InvalidProcess(vec![format!(
                    "[{split_id}] branch reaches endEvent '{id}' before the parallel join"
                )]))
            }
            FlowNode::ExclusiveGateway { .. } => {
                // All alternatives must converge on the same join.
                let mut found: Option<NodeIndex> = None;
                for edge in graph.edges_directed(current, petgraph::Direction::Outgoing) {
                    let join = walk_to_join(model, edge.target(), split_id)?;
                    match found {
                        None => found = Some(join),
                        Some(prev) if prev == join => {}
                        Some(_) => {
                            return Err(EngineError::InvalidProcess(vec![format!(
                                "[{}] exclusive branches reach different parallel joins",
                                graph[current].id()
                            )]))
                        }
                    }
                }
                return found.ok_or_else(|| {
                    EngineError::InvalidProcess(vec![format!(
                        "[{}] exclusive gateway has no outgoing flow",
                        graph[current].id()
                    )])
                });
            }
            _ => {
                let Some(next) = graph
                    .edges_directed(current, petgraph::Direction::Outgoing)
                    .map(|e| e.target())
                    .next()
                else {
                    return Err(EngineError::InvalidProcess(vec![format!(
                        "[{split_id}] branch dead-ends at '{}' before the parallel join",
                        graph[current].id()
                    )]));
                };
                current = next;
            }
        }
    }
}
