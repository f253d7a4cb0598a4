//! The workflow engine: interpreter and scheduler over the process graph.
//!
//! The graph is the program. The interpreter walks it as a chain of
//! node-state transitions; parallel splits spawn one task per branch onto
//! the runtime (capped by the worker-pool semaphore) and the matched join
//! reconciles branch contexts before flow continues. All resilience
//! behaviour (retry, timeout, mock fallback, compensation) lives in the
//! policy wrapper; gateways only ever see final task outcomes.

use crate::config::EngineConfig;
use crate::context::{reconcile_views, BranchView, ExecutionContext};
use crate::error::{EngineError, EngineResult};
use crate::model::ir::*;
use crate::policy::{self, CompensationRecord, TaskInvocation};
use crate::quality::{self, QualityScore};
use crate::recorder::{SpanRecord, SpanRecorder, SpanStatus};
use crate::registry::{ServiceTaskRegistry, TaskCategory, TaskDefinition};
use crate::truth::{self, ClaimVerdict, TruthReport};
use crate::types::{SpanId, Value};
use futures::future::BoxFuture;
use petgraph::graph::NodeIndex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Interpreter state of one flow node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Compensated,
    Skipped,
}

/// Terminal status of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
    Cancelled,
}

/// An error that escaped local recovery, with the span that carried it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span_id: Option<SpanId>,
}

impl RunError {
    fn from_engine(error: &EngineError) -> Self {
        RunError {
            code: error.code().to_string(),
            message: error.to_string(),
            span_id: None,
        }
    }
}

/// Summary of a finished run.
#[derive(Debug)]
pub struct RunResult {
    pub run_id: Uuid,
    pub trace_id: Uuid,
    pub process_id: String,
    pub status: RunStatus,
    pub spans: Vec<SpanRecord>,
    pub score: QualityScore,
    /// Fired task ids (registry keys) in completion order.
    pub task_trace: Vec<String>,
    pub errors: Vec<RunError>,
    pub node_states: BTreeMap<String, NodeState>,
    pub final_context: BTreeMap<String, Value>,
    pub truth: TruthReport,
}

impl RunResult {
    pub fn passed(&self) -> bool {
        self.status == RunStatus::Completed && self.score.passed
    }

    /// Exit code contract for embedding callers: 0 pass, 2 verdict fail,
    /// 3 run error.
    pub fn exit_code(&self) -> i32 {
        match self.status {
            RunStatus::Completed if self.score.passed => 0,
            RunStatus::Completed => 2,
            _ => 3,
        }
    }
}

/// Top-level facade: wires the model, registry, policy and recorder
/// together for a run.
pub struct WorkflowEngine {
    registry: Arc<ServiceTaskRegistry>,
    config: EngineConfig,
}

impl WorkflowEngine {
    /// The registry freezes here: no task registers after engine start.
    pub fn new(mut registry: ServiceTaskRegistry, config: EngineConfig) -> Self {
        registry.freeze();
        WorkflowEngine {
            registry: Arc::new(registry),
            config,
        }
    }

    pub fn registry(&self) -> &ServiceTaskRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Startup validation: every referenced registry key must resolve.
    /// Whole-run mock mode substitutes for unregistered handlers instead.
    pub fn validate_model(&self, model: &ProcessModel) -> EngineResult<()> {
        if self.config.mock_enabled_globally {
            return Ok(());
        }
        for idx in model.graph.node_indices() {
            if let FlowNode::ServiceTask { id, task } = &model.graph[idx] {
                if self.registry.lookup(&task.task_ref).is_none() {
                    return Err(EngineError::UnknownTaskRef {
                        element: id.clone(),
                        task_ref: task.task_ref.clone(),
                    });
                }
                if let Some(handler_id) = &task.compensation {
                    if self.registry.lookup(handler_id).is_none() {
                        return Err(EngineError::UnknownTaskRef {
                            element: id.clone(),
                            task_ref: handler_id.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    pub async fn run(
        &self,
        model: &ProcessModel,
        initial: BTreeMap<String, Value>,
    ) -> EngineResult<RunResult> {
        self.run_cancellable(model, initial, CancellationToken::new())
            .await
    }

    /// Run with an operator-held cancellation token.
    pub async fn run_cancellable(
        &self,
        model: &ProcessModel,
        initial: BTreeMap<String, Value>,
        operator: CancellationToken,
    ) -> EngineResult<RunResult> {
        self.validate_model(model)?;

        let run_id = Uuid::now_v7();
        let trace_id = Uuid::now_v7();
        let recorder = SpanRecorder::new(run_id, trace_id);
        let mut ctx = ExecutionContext::new(run_id, trace_id, initial, model.data_objects.clone());
        let cancel = operator.child_token();

        tracing::info!(%run_id, process = %model.id, "run starting");

        let deadline_watchdog = if self.config.run_deadline > Duration::ZERO {
            let deadline = self.config.run_deadline;
            let token = cancel.clone();
            Some(tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                tracing::warn!("run deadline exceeded; signalling cancellation");
                token.cancel();
            }))
        } else {
            None
        };

        let core = Arc::new(RunCore {
            model: model.clone(),
            registry: Arc::clone(&self.registry),
            config: self.config.clone(),
            recorder: Arc::clone(&recorder),
            cancel: cancel.clone(),
            semaphore: Arc::new(Semaphore::new(self.config.max_workers)),
            states: Mutex::new(
                model
                    .graph
                    .node_indices()
                    .map(|idx| (model.graph[idx].id().to_string(), NodeState::Pending))
                    .collect(),
            ),
            trace: Mutex::new(Vec::new()),
        });

        let run_span = recorder.start_span(&format!("run:{}", model.id), None);
        recorder.set_attribute(run_span, "process.id", Value::Str(model.id.clone()));
        recorder.set_attribute(
            run_span,
            "process.fingerprint",
            Value::Str(model.fingerprint_hex()),
        );

        let start = model.start().ok_or_else(|| {
            EngineError::Internal("verified model has no start event".to_string())
        })?;
        let root_scope = Scope {
            view: ctx.fork(0),
            compensation: Vec::new(),
            branch_index: 0,
            parent_span: run_span,
        };

        let chain = Arc::clone(&core).exec_chain(start, root_scope).await;

        let mut errors: Vec<RunError> = Vec::new();
        let mut status = match chain {
            Ok((ChainEnd::End { error, id }, scope)) => {
                // Adopt the root scope's writes; a single view cannot conflict.
                ctx.merge(vec![scope.view], "run")?;
                if cancel.is_cancelled() {
                    errors.push(RunError::from_engine(&EngineError::Cancelled));
                    RunStatus::Cancelled
                } else if error {
                    tracing::warn!(end = %id, "run reached an error end event");
                    RunStatus::Failed
                } else {
                    RunStatus::Completed
                }
            }
            Ok((ChainEnd::Join { .. }, _)) => {
                let internal =
                    EngineError::Internal("parallel join reached outside a split".to_string());
                errors.push(RunError::from_engine(&internal));
                RunStatus::Failed
            }
            Ok((ChainEnd::Failed(error), scope)) => {
                // Keep whatever the failing scope wrote; diagnostics read it.
                let _ = ctx.merge(vec![scope.view], "run");
                errors.push(RunError::from_engine(&error));
                if matches!(error, EngineError::Cancelled) || cancel.is_cancelled() {
                    RunStatus::Cancelled
                } else {
                    RunStatus::Failed
                }
            }
            Err(error) => {
                errors.push(RunError::from_engine(&error));
                RunStatus::Failed
            }
        };

        if let Some(watchdog) = deadline_watchdog {
            watchdog.abort();
        }

        recorder.end_span(
            run_span,
            match status {
                RunStatus::Completed => SpanStatus::Ok,
                RunStatus::Failed => SpanStatus::Error,
                RunStatus::Cancelled => SpanStatus::Cancelled,
            },
        );

        if status == RunStatus::Cancelled {
            // Stragglers past the grace period close as CANCELLED.
            let closed = recorder.force_close_open(SpanStatus::Cancelled);
            if closed > 0 {
                tracing::warn!(closed, "spans force-closed after cancellation");
            }
        } else if let Err(imbalance) = recorder.check_balanced() {
            errors.push(RunError::from_engine(&imbalance));
            status = RunStatus::Failed;
        }

        // Nodes never reached stay out of the way in the report.
        {
            let mut states = core.states.lock().unwrap_or_else(|p| p.into_inner());
            for state in states.values_mut() {
                if matches!(*state, NodeState::Pending | NodeState::Ready) {
                    *state = NodeState::Skipped;
                }
            }
        }

        let spans = recorder.snapshot();
        let mut score = quality::score(&spans, &self.registry.categories(), &self.config);
        let truth = truth::validate(
            &recorder.claims(),
            &spans,
            &recorder.mutations(),
            &self.registry,
        );
        if truth.contradicted() > 0 {
            // Contradicted claims downgrade the verdict without failing
            // the run.
            score.passed = false;
            for claim in truth
                .claims
                .iter()
                .filter(|c| c.verdict == ClaimVerdict::Contradicted)
            {
                errors.push(RunError {
                    code: "ErrValidationClaim".to_string(),
                    message: format!("{}: {}", claim.claim.text, claim.detail),
                    span_id: claim.supporting_spans.first().copied(),
                });
            }
        }

        let node_states = core
            .states
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        let task_trace = core.trace.lock().unwrap_or_else(|p| p.into_inner()).clone();

        tracing::info!(
            %run_id,
            ?status,
            score = score.total,
            passed = score.passed,
            tasks = task_trace.len(),
            "run finished"
        );

        Ok(RunResult {
            run_id,
            trace_id,
            process_id: model.id.clone(),
            status,
            spans,
            score,
            task_trace,
            errors,
            node_states,
            final_context: ctx.into_values(),
            truth,
        })
    }
}

// ─── Interpreter core ─────────────────────────────────────────

/// Per-branch execution scope: context view, compensation stack, span
/// parent for everything fired within the branch.
struct Scope {
    view: BranchView,
    compensation: Vec<CompensationRecord>,
    branch_index: usize,
    parent_span: SpanId,
}

/// How a chain segment ended.
enum ChainEnd {
    /// An end event fired.
    End { error: bool, id: String },
    /// Flow arrived at a converging parallel gateway.
    Join { at: NodeIndex },
    /// The branch failed after exhausted local recovery.
    Failed(EngineError),
}

enum TaskEnd {
    Completed,
    Diverted { boundary: NodeIndex },
    Failed(EngineError),
}

struct RunCore {
    model: ProcessModel,
    registry: Arc<ServiceTaskRegistry>,
    config: EngineConfig,
    recorder: Arc<SpanRecorder>,
    cancel: CancellationToken,
    semaphore: Arc<Semaphore>,
    states: Mutex<BTreeMap<String, NodeState>>,
    trace: Mutex<Vec<String>>,
}

impl RunCore {
    fn set_state(&self, id: &str, state: NodeState) {
        let mut states = self.states.lock().unwrap_or_else(|p| p.into_inner());
        states.insert(id.to_string(), state);
    }

    fn single_successor(&self, idx: NodeIndex) -> EngineResult<NodeIndex> {
        self.model
            .outgoing_in_order(idx)
            .into_iter()
            .next()
            .map(|(target, _)| target)
            .ok_or_else(|| {
                EngineError::Internal(format!(
                    "node '{}' has no outgoing flow",
                    self.model.graph[idx].id()
                ))
            })
    }

    fn join_of(&self, split_id: &str) -> EngineResult<NodeIndex> {
        let join_id = self.model.parallel_pairs.get(split_id).ok_or_else(|| {
            EngineError::Internal(format!("no matched join for split '{split_id}'"))
        })?;
        self.model.node_index(join_id).ok_or_else(|| {
            EngineError::Internal(format!("matched join '{join_id}' missing from graph"))
        })
    }

    fn timer_boundary(&self, node_id: &str) -> Option<(NodeIndex, Duration)> {
        self.model.boundaries_of(node_id).into_iter().find_map(|idx| {
            match &self.model.graph[idx] {
                FlowNode::Boundary {
                    kind: BoundaryKind::Timer { duration },
                    ..
                } => Some((idx, *duration)),
                _ => None,
            }
        })
    }

    fn compensation_boundary(&self, node_id: &str) -> Option<NodeIndex> {
        self.model.boundaries_of(node_id).into_iter().find(|&idx| {
            matches!(
                &self.model.graph[idx],
                FlowNode::Boundary {
                    kind: BoundaryKind::Compensation,
                    ..
                }
            )
        })
    }

    /// Execute a linear chain from `at` until an end event, the enclosing
    /// parallel join, or a failure. Parallel splits recurse via spawned
    /// branch chains.
    fn exec_chain(
        self: Arc<Self>,
        at: NodeIndex,
        scope: Scope,
    ) -> BoxFuture<'static, EngineResult<(ChainEnd, Scope)>> {
        Box::pin(async move {
            let mut scope = scope;
            let mut current = at;
            loop {
                let node = self.model.graph[current].clone();
                match node {
                    FlowNode::Start { id } => {
                        self.set_state(&id, NodeState::Completed);
                        current = self.single_successor(current)?;
                    }

                    FlowNode::Boundary { id, .. } => {
                        // Entered via diversion from its host task.
                        self.set_state(&id, NodeState::Completed);
                        current = self.single_successor(current)?;
                    }

                    FlowNode::End { id, error } => {
                        let span = self
                            .recorder
                            .start_span(&format!("end:{id}"), Some(scope.parent_span));
                        self.recorder.set_attribute(
                            span,
                            "event.kind",
                            Value::Str(if error { "error_end" } else { "end" }.to_string()),
                        );
                        self.recorder
                            .end_span(span, if error { SpanStatus::Error } else { SpanStatus::Ok });
                        self.set_state(&id, NodeState::Completed);
                        return Ok((ChainEnd::End { error, id }, scope));
                    }

                    FlowNode::ParallelGateway {
                        direction: GatewayDirection::Converging,
                        ..
                    } => {
                        return Ok((ChainEnd::Join { at: current }, scope));
                    }

                    FlowNode::ParallelGateway {
                        id,
                        direction: GatewayDirection::Diverging,
                        ..
                    } => match Arc::clone(&self).exec_parallel(&id, current, &mut scope).await? {
                        Some(failure) => return Ok((ChainEnd::Failed(failure), scope)),
                        None => {
                            let join_idx = self.join_of(&id)?;
                            current = self.single_successor(join_idx)?;
                        }
                    },

                    FlowNode::ExclusiveGateway {
                        id, default_flow, ..
                    } => {
                        let span = self
                            .recorder
                            .start_span(&format!("gateway:{id}"), Some(scope.parent_span));
                        self.recorder.set_attribute(
                            span,
                            "gateway.kind",
                            Value::Str("exclusive".to_string()),
                        );
                        let outgoing = self.model.outgoing_in_order(current);
                        let lookup = |key: &str| scope.view.get(key).cloned();
                        let mut chosen: Option<(NodeIndex, String)> = None;
                        for (target, flow) in &outgoing {
                            if let Some(condition) = &flow.condition {
                                if condition.eval(&lookup) {
                                    chosen = Some((*target, flow.id.clone()));
                                    break;
                                }
                            }
                        }
                        if chosen.is_none() {
                            // All conditions false: take the declared default.
                            chosen = outgoing
                                .iter()
                                .find(|(_, flow)| match &default_flow {
                                    Some(marked) => &flow.id == marked,
                                    None => flow.condition.is_none(),
                                })
                                .map(|(target, flow)| (*target, flow.id.clone()));
                        }
                        match chosen {
                            Some((target, flow_id)) => {
                                self.recorder.set_attribute(
                                    span,
                                    "gateway.taken",
                                    Value::Str(flow_id),
                                );
                                self.recorder.end_span(span, SpanStatus::Ok);
                                self.set_state(&id, NodeState::Completed);
                                current = target;
                            }
                            None => {
                                self.recorder.end_span(span, SpanStatus::Error);
                                self.set_state(&id, NodeState::Failed);
                                return Ok((
                                    ChainEnd::Failed(EngineError::GatewayNoMatch(id)),
                                    scope,
                                ));
                            }
                        }
                    }

                    FlowNode::ServiceTask { id, task } => {
                        if self.cancel.is_cancelled() {
                            // No ready → running transition after the signal.
                            return Ok((ChainEnd::Failed(EngineError::Cancelled), scope));
                        }
                        self.set_state(&id, NodeState::Ready);
                        match self.exec_service_task(&id, &task, &mut scope).await {
                            TaskEnd::Completed => {
                                current = self.single_successor(current)?;
                            }
                            TaskEnd::Diverted { boundary } => {
                                current = boundary;
                            }
                            TaskEnd::Failed(error) => {
                                return Ok((ChainEnd::Failed(error), scope));
                            }
                        }
                    }
                }
            }
        })
    }

    /// Fan out the split's branches, await them all, then merge or
    /// compensate. Returns `Some(error)` when the region failed.
    async fn exec_parallel(
        self: Arc<Self>,
        split_id: &str,
        split_idx: NodeIndex,
        scope: &mut Scope,
    ) -> EngineResult<Option<EngineError>> {
        if self.cancel.is_cancelled() {
            return Ok(Some(EngineError::Cancelled));
        }

        let branches = self.model.outgoing_in_order(split_idx);
        let join_idx = self.join_of(split_id)?;
        let join_id = self.model.graph[join_idx].id().to_string();

        let split_span = self
            .recorder
            .start_span(&format!("gateway:{split_id}"), Some(scope.parent_span));
        self.recorder.set_attribute(
            split_span,
            "gateway.kind",
            Value::Str("parallel_split".to_string()),
        );
        self.recorder.set_attribute(
            split_span,
            "gateway.branches",
            Value::Int(branches.len() as i64),
        );
        self.recorder.end_span(split_span, SpanStatus::Ok);
        self.set_state(split_id, NodeState::Completed);

        let mut set: JoinSet<EngineResult<(ChainEnd, Scope)>> = JoinSet::new();
        for (index, (head, _)) in branches.iter().enumerate() {
            let child = Scope {
                view: scope.view.fork(index),
                compensation: Vec::new(),
                branch_index: index,
                parent_span: scope.parent_span,
            };
            let core = Arc::clone(&self);
            let head = *head;
            set.spawn(async move { core.exec_chain(head, child).await });
        }

        let mut arrived: Vec<Scope> = Vec::new();
        let mut failures: Vec<(usize, EngineError)> = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok((ChainEnd::Join { at }, branch_scope))) => {
                    if at != join_idx {
                        failures.push((
                            branch_scope.branch_index,
                            EngineError::Internal(format!(
                                "branch of '{split_id}' reached a foreign join"
                            )),
                        ));
                    }
                    arrived.push(branch_scope);
                }
                Ok(Ok((ChainEnd::End { id, .. }, branch_scope))) => {
                    failures.push((
                        branch_scope.branch_index,
                        EngineError::Internal(format!(
                            "branch of '{split_id}' escaped to end event '{id}'"
                        )),
                    ));
                    arrived.push(branch_scope);
                }
                Ok(Ok((ChainEnd::Failed(error), branch_scope))) => {
                    failures.push((branch_scope.branch_index, error));
                    arrived.push(branch_scope);
                }
                Ok(Err(error)) => failures.push((usize::MAX, error)),
                Err(join_error) => failures.push((
                    usize::MAX,
                    EngineError::Internal(format!("branch task panicked: {join_error}")),
                )),
            }
        }
        arrived.sort_by_key(|s| s.branch_index);

        if let Some((branch, cause)) = failures.into_iter().next() {
            // The region failed: unwind every branch's compensation stack
            // in LIFO order before surfacing ErrBranchFailed.
            self.compensate_scopes(&mut arrived, scope.parent_span).await;
            self.set_state(&join_id, NodeState::Failed);
            if matches!(cause, EngineError::Cancelled) {
                return Ok(Some(EngineError::Cancelled));
            }
            return Ok(Some(EngineError::BranchFailed {
                branch: if branch == usize::MAX { 0 } else { branch },
                source: Box::new(cause),
            }));
        }

        // All branches arrived: reconcile their writes.
        let join_span = self
            .recorder
            .start_span(&format!("gateway:{join_id}"), Some(scope.parent_span));
        self.recorder.set_attribute(
            join_span,
            "gateway.kind",
            Value::Str("parallel_join".to_string()),
        );

        let mut views = Vec::new();
        let mut compensations = Vec::new();
        for branch_scope in arrived.iter_mut() {
            views.push(branch_scope.view.clone());
            compensations.append(&mut branch_scope.compensation);
        }

        match reconcile_views(views, &self.model.data_objects, &join_id) {
            Ok(reconciled) => {
                for (key, slot) in &reconciled {
                    if let Some(writer) = &slot.writer {
                        self.recorder.record_mutation(key, writer);
                    }
                }
                scope.view.absorb(reconciled);
                scope.compensation.extend(compensations);
                self.recorder.end_span(join_span, SpanStatus::Ok);
                self.set_state(&join_id, NodeState::Completed);
                Ok(None)
            }
            Err(conflict) => {
                self.recorder.set_attribute(
                    join_span,
                    "error.message",
                    Value::Str(conflict.to_string()),
                );
                self.recorder.end_span(join_span, SpanStatus::Error);
                self.set_state(&join_id, NodeState::Failed);
                // The conflicting region unwinds like a failed one.
                for record in &compensations {
                    self.set_state(&record.task_id, NodeState::Compensated);
                }
                policy::run_compensation(
                    compensations,
                    &self.registry,
                    &self.recorder,
                    scope.parent_span,
                    &self.cancel,
                )
                .await;
                Ok(Some(conflict))
            }
        }
    }

    async fn compensate_scopes(&self, scopes: &mut [Scope], parent_span: SpanId) {
        for branch_scope in scopes.iter_mut() {
            let records = std::mem::take(&mut branch_scope.compensation);
            if records.is_empty() {
                continue;
            }
            for record in &records {
                self.set_state(&record.task_id, NodeState::Compensated);
            }
            policy::run_compensation(
                records,
                &self.registry,
                &self.recorder,
                parent_span,
                &self.cancel,
            )
            .await;
        }
    }

    /// Dispatch one service task through the policy wrapper, racing any
    /// attached boundary timer.
    async fn exec_service_task(&self, node_id: &str, task: &TaskNode, scope: &mut Scope) -> TaskEnd {
        // Resolve the definition; whole-run mock synthesizes one for
        // unregistered refs.
        let synthesized;
        let definition: &TaskDefinition = match self.registry.lookup(&task.task_ref) {
            Some(def) => def,
            None => {
                synthesized = TaskDefinition::new(&task.task_ref, TaskCategory::Utility);
                &synthesized
            }
        };
        let handler = self
            .registry
            .handler(&task.task_ref)
            .unwrap_or_else(|| Arc::new(crate::mock::MockHandler::new(definition.clone())));

        // Capture declared inputs before dispatch; a compensation handler
        // gets exactly what the task saw.
        let captured_inputs: BTreeMap<String, Value> = definition
            .inputs
            .iter()
            .filter_map(|b| scope.view.get(&b.key).map(|v| (b.key.clone(), v.clone())))
            .collect();

        // Worker-pool cap: one permit per running handler.
        let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                return TaskEnd::Failed(EngineError::Internal(
                    "worker pool closed mid-run".to_string(),
                ))
            }
        };
        self.set_state(node_id, NodeState::Running);

        let task_token = self.cancel.child_token();
        let invocation = TaskInvocation {
            node_id,
            task,
            definition,
            handler,
            parent_span: scope.parent_span,
            visible: scope.view.visible(),
            force_mock: self.config.mock_enabled_globally,
        };

        let mut fut = Box::pin(policy::execute_task(
            invocation,
            &self.recorder,
            &self.config,
            &task_token,
        ));

        let result = match self.timer_boundary(node_id) {
            Some((boundary_idx, duration)) => {
                tokio::select! {
                    result = &mut fut => result,
                    _ = tokio::time::sleep(duration) => {
                        // Timer boundary fires: cancel the handler, let it
                        // unwind through the grace path, then divert.
                        tracing::info!(task = %node_id, "boundary timer fired; diverting");
                        task_token.cancel();
                        let _ = (&mut fut).await;
                        drop(permit);
                        self.set_state(node_id, NodeState::Skipped);
                        return TaskEnd::Diverted { boundary: boundary_idx };
                    }
                }
            }
            None => (&mut fut).await,
        };
        drop(fut);
        drop(permit);

        match result {
            Ok(outcome) => {
                // Apply declared outputs with writer attribution; the span
                // carries the same attribution and the observed read set.
                let writer = definition.id.clone();
                for (key, value) in &outcome.outputs {
                    scope.view.set(key, value.clone(), Some(&writer));
                    self.recorder.record_mutation(key, &writer);
                    self.recorder.set_attribute(
                        outcome.span_id,
                        &format!("context.write.{key}"),
                        Value::Str(writer.clone()),
                    );
                }
                self.recorder.set_attribute(
                    outcome.span_id,
                    "context.reads",
                    Value::List(
                        outcome
                            .observed_reads
                            .iter()
                            .map(|k| Value::Str(k.clone()))
                            .collect(),
                    ),
                );

                if definition.compensable {
                    if let Some(handler_id) = &task.compensation {
                        scope.compensation.push(CompensationRecord {
                            task_id: node_id.to_string(),
                            compensating_handler_id: handler_id.clone(),
                            captured_inputs,
                        });
                    }
                }

                self.trace
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .push(writer);
                self.set_state(node_id, NodeState::Completed);
                TaskEnd::Completed
            }
            Err(error) => {
                self.set_state(node_id, NodeState::Failed);
                if matches!(error, EngineError::Cancelled) {
                    return TaskEnd::Failed(error);
                }
                if let Some(boundary_idx) = self.compensation_boundary(node_id) {
                    // A compensation boundary recovers the branch: unwind
                    // the stack, then divert along the boundary path.
                    tracing::warn!(task = %node_id, "task failed; compensation boundary engaged");
                    let records = std::mem::take(&mut scope.compensation);
                    for record in &records {
                        self.set_state(&record.task_id, NodeState::Compensated);
                    }
                    policy::run_compensation(
                        records,
                        &self.registry,
                        &self.recorder,
                        scope.parent_span,
                        &self.cancel,
                    )
                    .await;
                    return TaskEnd::Diverted {
                        boundary: boundary_idx,
                    };
                }
                TaskEnd::Failed(error)
            }
        }
    }
}
