//! Adaptive optimizer and process miner.
//!
//! The stats book keeps per-task EWMA duration and failure rates across
//! completed runs and proposes two kinds of optimization: raising the
//! retry delay of tasks that consistently fail their first attempt, and
//! lifting independent sequential neighbours under a parallel split. The
//! miner goes further: from a trace archive it induces a whole candidate
//! process model, which the operator may adopt — the engine never swaps a
//! running process by itself.

use crate::model::ir::*;
use crate::recorder::{SpanRecord, SpanStatus};
use crate::registry::ServiceTaskRegistry;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Exponentially weighted task statistics.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TaskStats {
    pub ewma_duration_ms: f64,
    pub ewma_failure_rate: f64,
    pub runs: u64,
    pub first_attempt_failures: u64,
}

/// Per-task statistics across observed runs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatsBook {
    alpha: f64,
    tasks: BTreeMap<String, TaskStats>,
}

impl StatsBook {
    pub fn new(alpha: f64) -> Self {
        StatsBook {
            alpha,
            tasks: BTreeMap::new(),
        }
    }

    /// Fold one completed run's spans into the book.
    pub fn observe(&mut self, spans: &[SpanRecord]) {
        // Group attempts per task: more than one attempt span for a task
        // in a run means its first attempt failed.
        let mut attempts: HashMap<&str, Vec<&SpanRecord>> = HashMap::new();
        for span in spans.iter().filter(|s| s.task_id.is_some()) {
            if span.name == "retry" {
                continue;
            }
            attempts
                .entry(span.task_id.as_deref().unwrap_or_default())
                .or_default()
                .push(span);
        }

        for (task_id, spans) in attempts {
            let stats = self.tasks.entry(task_id.to_string()).or_default();
            stats.runs += 1;
            let retried = spans.len() > 1;
            if retried {
                stats.first_attempt_failures += 1;
            }
            let failed = spans.iter().all(|s| s.status != SpanStatus::Ok);
            let failure = if failed { 1.0 } else { 0.0 };
            if let Some(duration) = spans
                .iter()
                .filter(|s| s.status == SpanStatus::Ok)
                .filter_map(|s| s.duration_ms())
                .next_back()
            {
                if stats.runs == 1 {
                    stats.ewma_duration_ms = duration as f64;
                } else {
                    stats.ewma_duration_ms =
                        self.alpha * duration as f64 + (1.0 - self.alpha) * stats.ewma_duration_ms;
                }
            }
            if stats.runs == 1 {
                stats.ewma_failure_rate = failure;
            } else {
                stats.ewma_failure_rate =
                    self.alpha * failure + (1.0 - self.alpha) * stats.ewma_failure_rate;
            }
        }
    }

    pub fn stats(&self, task_id: &str) -> Option<&TaskStats> {
        self.tasks.get(task_id)
    }

    /// Optimization suggestions for the given model.
    pub fn suggestions(
        &self,
        model: &ProcessModel,
        registry: &ServiceTaskRegistry,
    ) -> Vec<Suggestion> {
        let mut out = Vec::new();

        // Tasks that consistently fail first attempt: raise initial delay.
        for (task_id, stats) in &self.tasks {
            if stats.runs >= 3 && stats.first_attempt_failures * 2 > stats.runs {
                out.push(Suggestion::RaiseInitialDelay {
                    task_id: task_id.clone(),
                    first_attempt_failure_rate: stats.first_attempt_failures as f64
                        / stats.runs as f64,
                });
            }
        }

        // Sequential neighbours with no data dependency: parallelize.
        for pair in sequential_task_pairs(model) {
            let (first, second) = &pair;
            if !data_dependent(first, second, registry) {
                let overlap = self
                    .tasks
                    .get(first)
                    .zip(self.tasks.get(second))
                    .map(|(a, b)| a.ewma_duration_ms.min(b.ewma_duration_ms))
                    .unwrap_or(0.0);
                out.push(Suggestion::Parallelize {
                    first: first.clone(),
                    second: second.clone(),
                    overlap_potential_ms: overlap,
                });
            }
        }

        out
    }
}

/// A proposed optimization; advisory only.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Suggestion {
    RaiseInitialDelay {
        task_id: String,
        first_attempt_failure_rate: f64,
    },
    Parallelize {
        first: String,
        second: String,
        overlap_potential_ms: f64,
    },
}

/// Adjacent service-task pairs (`a` directly flows into `b`) in the model.
fn sequential_task_pairs(model: &ProcessModel) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for idx in model.graph.node_indices() {
        let FlowNode::ServiceTask { task, .. } = &model.graph[idx] else {
            continue;
        };
        for (target, _) in model.outgoing_in_order(idx) {
            if let FlowNode::ServiceTask { task: next, .. } = &model.graph[target] {
                pairs.push((task.task_ref.clone(), next.task_ref.clone()));
            }
        }
    }
    pairs
}

/// True when `second` reads anything `first` writes.
fn data_dependent(first: &str, second: &str, registry: &ServiceTaskRegistry) -> bool {
    let (Some(a), Some(b)) = (registry.lookup(first), registry.lookup(second)) else {
        // Unknown tasks are conservatively treated as dependent.
        return true;
    };
    let outputs = a.output_keys();
    b.input_keys().iter().any(|k| outputs.contains(k))
}

// ─── Miner ────────────────────────────────────────────────────

/// Induce a candidate process model from a trace archive.
///
/// The most frequent task-order prefix forms the backbone; tasks that
/// appear in both orders across traces with no data dependency are lifted
/// under one parallel split. The result is emitted in the supported BPMN
/// subset for the operator to adopt.
pub struct ProcessMiner;

impl ProcessMiner {
    pub fn mine(
        process_id: &str,
        traces: &[Vec<String>],
        registry: &ServiceTaskRegistry,
    ) -> Option<ProcessModel> {
        if traces.is_empty() {
            return None;
        }

        // Backbone: the most frequent trace (ties go to the latest seen).
        let mut counts: BTreeMap<&[String], usize> = BTreeMap::new();
        for trace in traces {
            *counts.entry(trace.as_slice()).or_insert(0) += 1;
        }
        let backbone: Vec<String> = traces
            .iter()
            .max_by_key(|t| counts.get(t.as_slice()).copied().unwrap_or(0))
            .cloned()?;

        // Unordered pairs: seen in both relative orders somewhere.
        let mut before: HashMap<(&str, &str), bool> = HashMap::new();
        for trace in traces {
            for i in 0..trace.len() {
                for j in (i + 1)..trace.len() {
                    before.insert((trace[i].as_str(), trace[j].as_str()), true);
                }
            }
        }
        let unordered = |a: &str, b: &str| {
            before.contains_key(&(a, b))
                && before.contains_key(&(b, a))
                && !data_dependent(a, b, registry)
                && !data_dependent(b, a, registry)
        };

        // Group consecutive backbone tasks into parallel blocks: a task
        // joins the current block when it is unordered with every member.
        let mut blocks: Vec<Vec<String>> = Vec::new();
        for task in backbone {
            let extends_block = blocks
                .last()
                .is_some_and(|block| block.iter().all(|t| unordered(t, &task)));
            if extends_block {
                if let Some(block) = blocks.last_mut() {
                    block.push(task);
                }
            } else {
                blocks.push(vec![task]);
            }
        }

        Some(build_model(process_id, &blocks))
    }
}

/// Assemble a model from sequence blocks; blocks with several tasks land
/// under a parallel split/join pair.
fn build_model(process_id: &str, blocks: &[Vec<String>]) -> ProcessModel {
    let mut graph = ProcessGraph::new();
    let mut order = 0u32;
    let mut flow = |graph: &mut ProcessGraph, from, to| {
        let id = format!("flow_{order}");
        graph.add_edge(
            from,
            to,
            SequenceFlow {
                id,
                order,
                condition: None,
            },
        );
        order += 1;
    };

    let start = graph.add_node(FlowNode::Start {
        id: "start".to_string(),
    });
    let mut cursor = start;
    let mut parallel_pairs = BTreeMap::new();

    for (index, block) in blocks.iter().enumerate() {
        if block.len() == 1 {
            let node = graph.add_node(task_node(&block[0]));
            flow(&mut graph, cursor, node);
            cursor = node;
        } else {
            let split_id = format!("split_{index}");
            let join_id = format!("join_{index}");
            let split = graph.add_node(FlowNode::ParallelGateway {
                id: split_id.clone(),
                name: String::new(),
                direction: GatewayDirection::Diverging,
            });
            let join = graph.add_node(FlowNode::ParallelGateway {
                id: join_id.clone(),
                name: String::new(),
                direction: GatewayDirection::Converging,
            });
            flow(&mut graph, cursor, split);
            for task in block {
                let node = graph.add_node(task_node(task));
                flow(&mut graph, split, node);
                flow(&mut graph, node, join);
            }
            parallel_pairs.insert(split_id, join_id);
            cursor = join;
        }
    }

    let end = graph.add_node(FlowNode::End {
        id: "end".to_string(),
        error: false,
    });
    flow(&mut graph, cursor, end);

    ProcessModel {
        id: process_id.to_string(),
        name: format!("{process_id} (mined)"),
        graph,
        data_objects: BTreeMap::new(),
        parallel_pairs,
    }
}

fn task_node(task_ref: &str) -> FlowNode {
    FlowNode::ServiceTask {
        id: format!("task_{task_ref}"),
        task: TaskNode {
            task_ref: task_ref.to_string(),
            name: task_ref.to_string(),
            retry: None,
            timeout: None,
            compensation: None,
            mockable: true,
        },
    }
}

/// Replay equivalence check used by round-trip tests: a trace is
/// compatible with a model when it is one of the model's admissible task
/// orders (parallel blocks admit any permutation).
pub fn trace_compatible(model: &ProcessModel, trace: &[String]) -> bool {
    let Some(start) = model.start() else {
        return false;
    };
    let mut remaining: Vec<&str> = trace.iter().map(String::as_str).collect();
    remaining.reverse();
    check_segment(model, start, &mut remaining) && remaining.is_empty()
}

fn check_segment(
    model: &ProcessModel,
    from: petgraph::graph::NodeIndex,
    remaining: &mut Vec<&str>,
) -> bool {
    let mut cursor = from;
    loop {
        match &model.graph[cursor] {
            FlowNode::End { .. } => return true,
            FlowNode::ServiceTask { task, .. } => {
                match remaining.pop() {
                    Some(next) if next == task.task_ref => {}
                    _ => return false,
                }
                let Some((next, _)) = model.outgoing_in_order(cursor).into_iter().next() else {
                    return false;
                };
                cursor = next;
            }
            FlowNode::ParallelGateway {
                direction: GatewayDirection::Diverging,
                id,
                ..
            } => {
                // Collect the block's task set; admit any permutation.
                let mut expected: BTreeSet<String> = BTreeSet::new();
                for (branch, _) in model.outgoing_in_order(cursor) {
                    if let FlowNode::ServiceTask { task, .. } = &model.graph[branch] {
                        expected.insert(task.task_ref.clone());
                    }
                }
                let mut seen: HashSet<String> = HashSet::new();
                for _ in 0..expected.len() {
                    match remaining.pop() {
                        Some(t) if expected.contains(t) && seen.insert(t.to_string()) => {}
                        _ => return false,
                    }
                }
                let join_id = model.parallel_pairs.get(id).cloned();
                let Some(join_idx) = join_id.and_then(|j| model.node_index(&j)) else {
                    return false;
                };
                let Some((next, _)) = model.outgoing_in_order(join_idx).into_iter().next() else {
                    return false;
                };
                cursor = next;
            }
            _ => {
                let Some((next, _)) = model.outgoing_in_order(cursor).into_iter().next() else {
                    return false;
                };
                cursor = next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{FnHandler, IoBinding, TaskCategory, TaskDefinition};
    use crate::types::ValueType;
    use std::collections::BTreeMap as Map;

    fn registry_with(defs: Vec<TaskDefinition>) -> ServiceTaskRegistry {
        let mut registry = ServiceTaskRegistry::new();
        for def in defs {
            registry
                .register(
                    def,
                    FnHandler::new(|_i, _s, _v| Box::pin(async { Ok(Map::new()) })),
                )
                .unwrap();
        }
        registry
    }

    fn independent_registry() -> ServiceTaskRegistry {
        registry_with(vec![
            TaskDefinition::new("load", TaskCategory::Semantic)
                .with_outputs(vec![IoBinding::new("semantics", ValueType::Map)]),
            TaskDefinition::new("gen_a", TaskCategory::Generation)
                .with_inputs(vec![IoBinding::new("semantics", ValueType::Map)])
                .with_outputs(vec![IoBinding::new("a_out", ValueType::Str)]),
            TaskDefinition::new("gen_b", TaskCategory::Generation)
                .with_inputs(vec![IoBinding::new("semantics", ValueType::Map)])
                .with_outputs(vec![IoBinding::new("b_out", ValueType::Str)]),
        ])
    }

    #[test]
    fn miner_lifts_unordered_independent_tasks_under_a_split() {
        let registry = independent_registry();
        let traces = vec![
            vec!["load".to_string(), "gen_a".to_string(), "gen_b".to_string()],
            vec!["load".to_string(), "gen_b".to_string(), "gen_a".to_string()],
        ];
        let model = ProcessMiner::mine("mined", &traces, &registry).unwrap();
        assert_eq!(model.parallel_pairs.len(), 1);
        // Both observed traces replay on the mined model.
        for trace in &traces {
            assert!(trace_compatible(&model, trace));
        }
        // The mined model serializes into the supported subset.
        let xml = crate::model::export::to_bpmn_xml(&model);
        let reloaded = crate::model::load_process(&xml).unwrap();
        assert_eq!(reloaded.parallel_pairs.len(), 1);
    }

    #[test]
    fn miner_keeps_dependent_tasks_sequential() {
        let registry = registry_with(vec![
            TaskDefinition::new("produce", TaskCategory::Generation)
                .with_outputs(vec![IoBinding::new("artifact", ValueType::Str)]),
            TaskDefinition::new("consume", TaskCategory::Validation)
                .with_inputs(vec![IoBinding::new("artifact", ValueType::Str)]),
        ]);
        // Noise trace shows them swapped, but the data dependency forbids
        // parallelizing.
        let traces = vec![
            vec!["produce".to_string(), "consume".to_string()],
            vec!["produce".to_string(), "consume".to_string()],
            vec!["consume".to_string(), "produce".to_string()],
        ];
        let model = ProcessMiner::mine("mined", &traces, &registry).unwrap();
        assert!(model.parallel_pairs.is_empty());
    }

    #[test]
    fn stats_book_tracks_first_attempt_failures() {
        use crate::recorder::SpanStatus;
        use uuid::Uuid;
        let mut book = StatsBook::new(0.3);
        let make_span = |task: &str, seq: u64, status: SpanStatus| SpanRecord {
            name: task.to_string(),
            task_id: Some(task.to_string()),
            run_id: Uuid::nil(),
            trace_id: Uuid::nil(),
            span_id: seq,
            parent_span_id: None,
            start_time: 0,
            end_time: Some(40),
            status,
            attributes: Map::new(),
            start_seq: seq,
            end_seq: Some(seq + 1),
        };
        for _ in 0..3 {
            // Two attempt spans: first failed, second succeeded.
            book.observe(&[
                make_span("flaky", 1, SpanStatus::Error),
                make_span("flaky", 3, SpanStatus::Ok),
            ]);
        }
        let stats = book.stats("flaky").unwrap();
        assert_eq!(stats.runs, 3);
        assert_eq!(stats.first_attempt_failures, 3);
        assert!(stats.ewma_duration_ms > 0.0);

        let registry = independent_registry();
        let model = build_model("m", &[vec!["flaky".to_string()]]);
        let suggestions = book.suggestions(&model, &registry);
        assert!(suggestions
            .iter()
            .any(|s| matches!(s, Suggestion::RaiseInitialDelay { task_id, .. } if task_id == "flaky")));
    }
}
