//! Service task registry: stable id → handler with declared I/O.
//!
//! Registered once at engine start and frozen before any run. Handlers
//! are trait objects behind `Arc`; the model references them by id only,
//! so there is no handler-to-engine ownership cycle.

use crate::context::ContextView;
use crate::error::{EngineError, EngineResult, ErrorKind};
use crate::recorder::SpanHandle;
use crate::types::{RetryPolicy, Value, ValueType};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Task category; feeds the quality scorer's coverage component.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    Semantic,
    Ai,
    Generation,
    Validation,
    Utility,
    Weaver,
}

impl TaskCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskCategory::Semantic => "semantic",
            TaskCategory::Ai => "ai",
            TaskCategory::Generation => "generation",
            TaskCategory::Validation => "validation",
            TaskCategory::Utility => "utility",
            TaskCategory::Weaver => "weaver",
        }
    }
}

/// Declared input or output key with its type constraint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IoBinding {
    pub key: String,
    pub ty: ValueType,
}

impl IoBinding {
    pub fn new(key: &str, ty: ValueType) -> Self {
        IoBinding {
            key: key.to_string(),
            ty,
        }
    }
}

/// Immutable description of a registered service task.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub id: String,
    pub category: TaskCategory,
    pub inputs: Vec<IoBinding>,
    pub outputs: Vec<IoBinding>,
    pub default_timeout: Option<Duration>,
    pub default_retry: RetryPolicy,
    pub compensable: bool,
    pub idempotent: bool,
    /// The semantic operation carried on this task's spans.
    pub operation: String,
}

impl TaskDefinition {
    pub fn new(id: &str, category: TaskCategory) -> Self {
        TaskDefinition {
            id: id.to_string(),
            category,
            inputs: Vec::new(),
            outputs: Vec::new(),
            default_timeout: None,
            default_retry: RetryPolicy::none(),
            compensable: false,
            idempotent: false,
            operation: id.to_string(),
        }
    }

    pub fn with_inputs(mut self, inputs: Vec<IoBinding>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_outputs(mut self, outputs: Vec<IoBinding>) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.default_retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    pub fn compensable(mut self) -> Self {
        self.compensable = true;
        self
    }

    pub fn idempotent(mut self) -> Self {
        self.idempotent = true;
        self
    }

    pub fn input_keys(&self) -> BTreeSet<&str> {
        self.inputs.iter().map(|b| b.key.as_str()).collect()
    }

    pub fn output_keys(&self) -> BTreeSet<&str> {
        self.outputs.iter().map(|b| b.key.as_str()).collect()
    }

    fn validate(&self) -> EngineResult<()> {
        let invalid = |message: String| EngineError::InvalidDefinition {
            id: self.id.clone(),
            message,
        };
        if self.id.trim().is_empty() {
            return Err(invalid("task id must be non-empty".to_string()));
        }
        for (what, bindings) in [("input", &self.inputs), ("output", &self.outputs)] {
            let mut seen = BTreeSet::new();
            for binding in bindings.iter() {
                if binding.key.trim().is_empty() {
                    return Err(invalid(format!("{what} key must be non-empty")));
                }
                if !seen.insert(binding.key.as_str()) {
                    return Err(invalid(format!("duplicate {what} key '{}'", binding.key)));
                }
            }
        }
        self.default_retry
            .validate()
            .map_err(|message| invalid(message))?;
        Ok(())
    }
}

/// Failure returned by a handler, classified for `retry_on` matching.
#[derive(Clone, Debug)]
pub struct HandlerFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl HandlerFailure {
    pub fn transient(message: impl Into<String>) -> Self {
        HandlerFailure {
            kind: ErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        HandlerFailure {
            kind: ErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        HandlerFailure {
            kind: ErrorKind::Validation,
            message: message.into(),
        }
    }

    pub fn io(message: impl Into<String>) -> Self {
        HandlerFailure {
            kind: ErrorKind::Io,
            message: message.into(),
        }
    }

    /// Clean unwind after observing the cancellation token.
    pub fn cancelled() -> Self {
        HandlerFailure {
            kind: ErrorKind::Cancelled,
            message: "cancellation observed".to_string(),
        }
    }
}

impl fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", self.message, self.kind)
    }
}

pub type HandlerResult = Result<BTreeMap<String, Value>, HandlerFailure>;

/// The service-task contract: consume declared inputs, emit spans through
/// the handle, return declared outputs. The engine owns the task span's
/// lifecycle; handlers only add attributes and child spans.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn invoke(
        &self,
        inputs: BTreeMap<String, Value>,
        span: SpanHandle,
        view: ContextView,
    ) -> HandlerResult;
}

/// Adapter turning an async closure into a handler; the registration
/// surface used by the built-in task set and tests.
pub struct FnHandler {
    f: Box<
        dyn Fn(BTreeMap<String, Value>, SpanHandle, ContextView) -> BoxFuture<'static, HandlerResult>
            + Send
            + Sync,
    >,
}

impl FnHandler {
    pub fn new<F>(f: F) -> Arc<Self>
    where
        F: Fn(BTreeMap<String, Value>, SpanHandle, ContextView) -> BoxFuture<'static, HandlerResult>
            + Send
            + Sync
            + 'static,
    {
        Arc::new(FnHandler { f: Box::new(f) })
    }
}

#[async_trait]
impl TaskHandler for FnHandler {
    async fn invoke(
        &self,
        inputs: BTreeMap<String, Value>,
        span: SpanHandle,
        view: ContextView,
    ) -> HandlerResult {
        (self.f)(inputs, span, view).await
    }
}

/// Human-readable catalog entry for `describe`.
#[derive(Clone, Debug, Serialize)]
pub struct CatalogEntry {
    pub id: String,
    pub category: TaskCategory,
    pub inputs: Vec<IoBinding>,
    pub outputs: Vec<IoBinding>,
    pub default_timeout_ms: Option<u128>,
    pub max_attempts: u32,
    pub compensable: bool,
    pub idempotent: bool,
}

impl fmt::Display for CatalogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let io = |bindings: &[IoBinding]| {
            bindings
                .iter()
                .map(|b| b.key.clone())
                .collect::<Vec<_>>()
                .join(", ")
        };
        write!(
            f,
            "{} [{}] inputs: {{{}}} outputs: {{{}}} attempts: {}{}{}",
            self.id,
            self.category.as_str(),
            io(&self.inputs),
            io(&self.outputs),
            self.max_attempts,
            if self.compensable { " compensable" } else { "" },
            if self.idempotent { " idempotent" } else { "" },
        )
    }
}

struct Entry {
    definition: TaskDefinition,
    handler: Arc<dyn TaskHandler>,
}

/// The registry. `register` is only allowed before `freeze`; runs observe
/// an immutable catalog.
pub struct ServiceTaskRegistry {
    entries: BTreeMap<String, Entry>,
    frozen: bool,
}

impl ServiceTaskRegistry {
    pub fn new() -> Self {
        ServiceTaskRegistry {
            entries: BTreeMap::new(),
            frozen: false,
        }
    }

    pub fn register(
        &mut self,
        definition: TaskDefinition,
        handler: Arc<dyn TaskHandler>,
    ) -> EngineResult<()> {
        if self.frozen {
            return Err(EngineError::Internal(
                "registry is frozen; tasks register before engine start".to_string(),
            ));
        }
        definition.validate()?;
        if self.entries.contains_key(&definition.id) {
            return Err(EngineError::DuplicateTaskId(definition.id));
        }
        tracing::debug!(task = %definition.id, category = definition.category.as_str(), "registered service task");
        self.entries
            .insert(definition.id.clone(), Entry { definition, handler });
        Ok(())
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn lookup(&self, id: &str) -> Option<&TaskDefinition> {
        self.entries.get(id).map(|e| &e.definition)
    }

    pub fn handler(&self, id: &str) -> Option<Arc<dyn TaskHandler>> {
        self.entries.get(id).map(|e| Arc::clone(&e.handler))
    }

    pub fn list(&self, category: Option<TaskCategory>) -> Vec<&TaskDefinition> {
        self.entries
            .values()
            .map(|e| &e.definition)
            .filter(|d| category.map_or(true, |c| d.category == c))
            .collect()
    }

    pub fn describe(&self, id: &str) -> Option<CatalogEntry> {
        self.lookup(id).map(|d| CatalogEntry {
            id: d.id.clone(),
            category: d.category,
            inputs: d.inputs.clone(),
            outputs: d.outputs.clone(),
            default_timeout_ms: d.default_timeout.map(|t| t.as_millis()),
            max_attempts: d.default_retry.max_attempts,
            compensable: d.compensable,
            idempotent: d.idempotent,
        })
    }

    /// Distinct categories across registered definitions; the scorer's
    /// coverage denominator.
    pub fn categories(&self) -> BTreeSet<TaskCategory> {
        self.entries.values().map(|e| e.definition.category).collect()
    }
}

impl Default for ServiceTaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_handler() -> Arc<dyn TaskHandler> {
        FnHandler::new(|_inputs, _span, _view| Box::pin(async { Ok(BTreeMap::new()) }))
    }

    #[test]
    fn duplicate_id_fails_registration() {
        let mut registry = ServiceTaskRegistry::new();
        registry
            .register(TaskDefinition::new("t", TaskCategory::Utility), noop_handler())
            .unwrap();
        match registry.register(TaskDefinition::new("t", TaskCategory::Utility), noop_handler()) {
            Err(EngineError::DuplicateTaskId(id)) => assert_eq!(id, "t"),
            other => panic!("expected DuplicateTaskId, got {other:?}"),
        }
    }

    #[test]
    fn empty_and_duplicate_io_keys_are_rejected() {
        let mut registry = ServiceTaskRegistry::new();
        let empty_key = TaskDefinition::new("a", TaskCategory::Utility)
            .with_inputs(vec![IoBinding::new("", ValueType::Any)]);
        assert!(registry.register(empty_key, noop_handler()).is_err());

        let dup_key = TaskDefinition::new("b", TaskCategory::Utility).with_outputs(vec![
            IoBinding::new("x", ValueType::Int),
            IoBinding::new("x", ValueType::Str),
        ]);
        assert!(registry.register(dup_key, noop_handler()).is_err());
    }

    #[test]
    fn frozen_registry_rejects_registration() {
        let mut registry = ServiceTaskRegistry::new();
        registry.freeze();
        assert!(registry
            .register(TaskDefinition::new("late", TaskCategory::Utility), noop_handler())
            .is_err());
    }

    #[test]
    fn list_filters_by_category() {
        let mut registry = ServiceTaskRegistry::new();
        registry
            .register(TaskDefinition::new("s", TaskCategory::Semantic), noop_handler())
            .unwrap();
        registry
            .register(TaskDefinition::new("g", TaskCategory::Generation), noop_handler())
            .unwrap();
        assert_eq!(registry.list(None).len(), 2);
        assert_eq!(registry.list(Some(TaskCategory::Semantic)).len(), 1);
        assert_eq!(registry.categories().len(), 2);
    }

    #[test]
    fn describe_renders_a_catalog_line() {
        let mut registry = ServiceTaskRegistry::new();
        registry
            .register(
                TaskDefinition::new("gen", TaskCategory::Generation)
                    .with_inputs(vec![IoBinding::new("semantics", ValueType::Map)])
                    .with_outputs(vec![IoBinding::new("model_code", ValueType::Str)])
                    .compensable(),
                noop_handler(),
            )
            .unwrap();
        let entry = registry.describe("gen").unwrap();
        let line = entry.to_string();
        assert!(line.contains("gen [generation]"));
        assert!(line.contains("semantics"));
        assert!(line.contains("compensable"));
    }
}
