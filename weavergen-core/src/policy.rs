//! Retry / timeout / compensation policy around handler invocations.
//!
//! Every service-task dispatch goes through `execute_task`:
//!
//! 1. enforce the effective timeout via the task's cancellation token;
//! 2. retry errors whose kind is in `retry_on`, backing off per policy and
//!    emitting a `retry` span per re-attempt;
//! 3. fall back to the mock substitute when the policy allows it;
//! 4. hand back a `CompensationRecord` for compensable tasks.
//!
//! Gateways never see any of this: they observe final task outcomes only.

use crate::config::EngineConfig;
use crate::context::ContextView;
use crate::error::{EngineError, EngineResult, ErrorKind};
use crate::mock::MockHandler;
use crate::model::ir::TaskNode;
use crate::recorder::{SpanHandle, SpanRecorder, SpanStatus};
use crate::registry::{TaskDefinition, TaskHandler};
use crate::types::{RetryPolicy, SpanId, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Undo entry pushed on successful completion of a compensable task.
#[derive(Clone, Debug)]
pub struct CompensationRecord {
    pub task_id: String,
    pub compensating_handler_id: String,
    pub captured_inputs: BTreeMap<String, Value>,
}

/// Final outcome of a policy-wrapped dispatch.
#[derive(Debug)]
pub struct TaskOutcome {
    pub outputs: BTreeMap<String, Value>,
    pub mocked: bool,
    pub attempts: u32,
    /// Span of the successful attempt; context-write attribution lands here.
    pub span_id: SpanId,
    pub observed_reads: BTreeSet<String>,
}

/// Everything the policy needs to dispatch one node.
pub struct TaskInvocation<'a> {
    pub node_id: &'a str,
    pub task: &'a TaskNode,
    pub definition: &'a TaskDefinition,
    pub handler: Arc<dyn TaskHandler>,
    pub parent_span: SpanId,
    /// Context visible to the handler at dispatch time.
    pub visible: BTreeMap<String, Value>,
    /// Run the mock substitute instead of the real handler (whole-run mock).
    pub force_mock: bool,
}

/// Effective retry policy: the node override wins, then the definition.
pub fn effective_retry(task: &TaskNode, definition: &TaskDefinition) -> RetryPolicy {
    task.retry
        .clone()
        .unwrap_or_else(|| definition.default_retry.clone())
}

/// Effective timeout: node, then definition, then engine default.
/// Zero disables the deadline.
pub fn effective_timeout(
    task: &TaskNode,
    definition: &TaskDefinition,
    config: &EngineConfig,
) -> Duration {
    task.timeout
        .or(definition.default_timeout)
        .unwrap_or(config.default_task_timeout)
}

pub async fn execute_task(
    inv: TaskInvocation<'_>,
    recorder: &Arc<SpanRecorder>,
    config: &EngineConfig,
    cancel: &CancellationToken,
) -> EngineResult<TaskOutcome> {
    let policy = effective_retry(inv.task, inv.definition);
    policy
        .validate()
        .map_err(|message| EngineError::InvalidDefinition {
            id: inv.definition.id.clone(),
            message,
        })?;
    let timeout = effective_timeout(inv.task, inv.definition, config);

    if inv.force_mock {
        return invoke_once(&inv, recorder, config, cancel, timeout, 1, Attempt::ForcedMock).await;
    }

    let mut attempt = 1;
    loop {
        let result =
            invoke_once(&inv, recorder, config, cancel, timeout, attempt, Attempt::Real).await;
        let error = match result {
            Ok(outcome) => return Ok(outcome),
            Err(error) => error,
        };
        if matches!(error, EngineError::Cancelled) || cancel.is_cancelled() {
            return Err(error);
        }

        let kind = error.kind();
        let retryable = policy.retry_on.contains(&kind);
        if retryable && attempt < policy.max_attempts {
            let delay = policy.delay_for(attempt);
            let retry_span = recorder.start_span("retry", Some(inv.parent_span));
            recorder.set_attribute(retry_span, "attempt", Value::Int(attempt as i64));
            recorder.set_attribute(retry_span, "retry.delay_ms", Value::Int(delay.as_millis() as i64));
            recorder.set_attribute(retry_span, "error.kind", Value::Str(kind.as_str().to_string()));
            recorder.set_attribute(retry_span, "error.message", Value::Str(error.to_string()));
            recorder.end_span(retry_span, SpanStatus::Ok);
            tracing::debug!(
                task = %inv.definition.id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "retrying after {kind:?} failure"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
            continue;
        }

        // Attempts exhausted (or the kind is not retryable at all).
        if retryable
            && policy.fallback_to_mock
            && config.mock_on_fallback
            && inv.task.mockable
        {
            tracing::warn!(task = %inv.definition.id, "all attempts failed; falling back to mock");
            return invoke_once(
                &inv,
                recorder,
                config,
                cancel,
                timeout,
                attempt,
                Attempt::Fallback,
            )
            .await;
        }
        return Err(error);
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Attempt {
    Real,
    ForcedMock,
    Fallback,
}

async fn invoke_once(
    inv: &TaskInvocation<'_>,
    recorder: &Arc<SpanRecorder>,
    config: &EngineConfig,
    cancel: &CancellationToken,
    timeout: Duration,
    attempt: u32,
    mode: Attempt,
) -> EngineResult<TaskOutcome> {
    let definition = inv.definition;
    let span_id = recorder.start_task_span(inv.node_id, &definition.id, Some(inv.parent_span));
    recorder.set_attribute(
        span_id,
        "semantic.group.id",
        Value::Str(format!("weavergen.{}", definition.category.as_str())),
    );
    recorder.set_attribute(
        span_id,
        "semantic.operation",
        Value::Str(definition.operation.clone()),
    );
    recorder.set_attribute(span_id, "attempt", Value::Int(attempt as i64));
    if mode == Attempt::Fallback {
        recorder.set_attribute(span_id, "execution.fallback", Value::Str("mock".to_string()));
    }

    let span = SpanHandle::new(Arc::clone(recorder), span_id, cancel.clone());
    let view = ContextView::new(recorder.run_id(), recorder.trace_id(), inv.visible.clone());
    let reads_probe = view.clone();

    // Declared inputs, read through the view so reads are observed.
    let mut inputs = BTreeMap::new();
    for binding in &definition.inputs {
        if let Some(value) = view.get(&binding.key) {
            if !binding.ty.accepts(&value) {
                let failure = EngineError::HandlerFailed {
                    task: definition.id.clone(),
                    kind: ErrorKind::Validation,
                    message: format!(
                        "input '{}' violates its declared type constraint",
                        binding.key
                    ),
                };
                recorder.set_attribute(span_id, "execution.success", Value::Bool(false));
                recorder.set_attribute(span_id, "error.kind", Value::Str("validation".to_string()));
                recorder.set_attribute(span_id, "error.message", Value::Str(failure.to_string()));
                recorder.end_span(span_id, SpanStatus::Error);
                return Err(failure);
            }
            inputs.insert(binding.key.clone(), value);
        }
    }

    let mocked = mode != Attempt::Real;
    let mut future: futures::future::BoxFuture<'_, crate::registry::HandlerResult> = if mocked {
        let mock = MockHandler::new(definition.clone());
        Box::pin(async move { mock.invoke(inputs, span, view).await })
    } else {
        let handler = Arc::clone(&inv.handler);
        Box::pin(async move { handler.invoke(inputs, span, view).await })
    };

    let outcome = if timeout > Duration::ZERO {
        tokio::select! {
            result = &mut future => Race::Done(result),
            _ = tokio::time::sleep(timeout) => Race::TimedOut,
            _ = cancel.cancelled() => Race::Cancelled,
        }
    } else {
        tokio::select! {
            result = &mut future => Race::Done(result),
            _ = cancel.cancelled() => Race::Cancelled,
        }
    };

    let result = match outcome {
        Race::Done(result) => result,
        Race::TimedOut => {
            // Dropping the future cancels the handler; its dangling child
            // spans close as cancelled.
            drop(future);
            recorder.close_open_descendants(span_id, SpanStatus::Cancelled);
            recorder.set_attribute(span_id, "execution.success", Value::Bool(false));
            recorder.set_attribute(span_id, "error.kind", Value::Str("timeout".to_string()));
            recorder.end_span(span_id, SpanStatus::Error);
            return Err(EngineError::Timeout(definition.id.clone()));
        }
        Race::Cancelled => {
            // Grace period: a cooperative handler may still finish cleanly.
            match tokio::time::timeout(config.cancel_grace_period, &mut future).await {
                Ok(result) => result,
                Err(_) => {
                    drop(future);
                    recorder.close_open_descendants(span_id, SpanStatus::Cancelled);
                    recorder.end_span(span_id, SpanStatus::Cancelled);
                    return Err(EngineError::Cancelled);
                }
            }
        }
    };

    // A cooperative handler may answer cancellation with a cancelled
    // failure; that is a clean unwind, not a handler error.
    if let Err(failure) = &result {
        if failure.kind == ErrorKind::Cancelled {
            recorder.end_span(span_id, SpanStatus::Cancelled);
            return Err(EngineError::Cancelled);
        }
    }

    match result {
        Ok(outputs) => {
            for binding in &definition.outputs {
                if let Some(value) = outputs.get(&binding.key) {
                    if !binding.ty.accepts(value) {
                        let failure = EngineError::HandlerFailed {
                            task: definition.id.clone(),
                            kind: ErrorKind::Validation,
                            message: format!(
                                "output '{}' violates its declared type constraint",
                                binding.key
                            ),
                        };
                        recorder.set_attribute(span_id, "execution.success", Value::Bool(false));
                        recorder.set_attribute(
                            span_id,
                            "error.message",
                            Value::Str(failure.to_string()),
                        );
                        recorder.end_span(span_id, SpanStatus::Error);
                        return Err(failure);
                    }
                }
            }
            recorder.set_attribute(span_id, "execution.success", Value::Bool(true));
            // Mock output carries no validation evidence unless the task is
            // intrinsically evidenceless.
            let validation_default = !mocked || definition.outputs.is_empty();
            recorder.set_attribute_if_absent(
                span_id,
                "validation.passed",
                Value::Bool(validation_default),
            );
            recorder.end_span(span_id, SpanStatus::Ok);
            Ok(TaskOutcome {
                outputs,
                mocked,
                attempts: attempt,
                span_id,
                observed_reads: reads_probe.observed_reads(),
            })
        }
        Err(failure) => {
            recorder.set_attribute(span_id, "execution.success", Value::Bool(false));
            recorder.set_attribute(
                span_id,
                "error.kind",
                Value::Str(failure.kind.as_str().to_string()),
            );
            recorder.set_attribute(span_id, "error.message", Value::Str(failure.message.clone()));
            recorder.end_span(span_id, SpanStatus::Error);
            Err(EngineError::HandlerFailed {
                task: definition.id.clone(),
                kind: failure.kind,
                message: failure.message,
            })
        }
    }
}

enum Race {
    Done(crate::registry::HandlerResult),
    TimedOut,
    Cancelled,
}

/// Invoke compensation records in LIFO order. Each compensation runs with
/// `max_attempts = 1` and no fallback; failures are recorded on their span
/// and logged, never re-raised — the original branch error stays the cause.
pub async fn run_compensation(
    records: Vec<CompensationRecord>,
    registry: &crate::registry::ServiceTaskRegistry,
    recorder: &Arc<SpanRecorder>,
    parent_span: SpanId,
    cancel: &CancellationToken,
) {
    for record in records.into_iter().rev() {
        let span_id = recorder.start_task_span(
            &format!("compensate:{}", record.task_id),
            &record.compensating_handler_id,
            Some(parent_span),
        );
        recorder.set_attribute(span_id, "compensation.for", Value::Str(record.task_id.clone()));

        let Some(handler) = registry.handler(&record.compensating_handler_id) else {
            tracing::warn!(
                handler = %record.compensating_handler_id,
                task = %record.task_id,
                "compensating handler not registered"
            );
            recorder.set_attribute(
                span_id,
                "error.message",
                Value::Str("compensating handler not registered".to_string()),
            );
            recorder.end_span(span_id, SpanStatus::Error);
            continue;
        };

        if let Some(definition) = registry.lookup(&record.compensating_handler_id) {
            recorder.set_attribute(
                span_id,
                "semantic.group.id",
                Value::Str(format!("weavergen.{}", definition.category.as_str())),
            );
            recorder.set_attribute(
                span_id,
                "semantic.operation",
                Value::Str(definition.operation.clone()),
            );
        }

        let span = SpanHandle::new(Arc::clone(recorder), span_id, cancel.clone());
        let view = ContextView::new(
            recorder.run_id(),
            recorder.trace_id(),
            record.captured_inputs.clone(),
        );
        match handler.invoke(record.captured_inputs, span, view).await {
            Ok(_) => {
                recorder.set_attribute(span_id, "execution.success", Value::Bool(true));
                recorder.end_span(span_id, SpanStatus::Ok);
            }
            Err(failure) => {
                tracing::warn!(
                    task = %record.task_id,
                    handler = %record.compensating_handler_id,
                    "compensation failed: {failure}"
                );
                recorder.set_attribute(span_id, "execution.success", Value::Bool(false));
                recorder.set_attribute(span_id, "error.message", Value::Str(failure.message));
                recorder.end_span(span_id, SpanStatus::Error);
            }
        }
    }
}
