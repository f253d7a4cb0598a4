//! Mock mode: deterministic, schema-correct handler substitutes.
//!
//! Mocks are first-class citizens in the production binary, not test
//! doubles: they run when an operator requests a whole-run mock execution
//! and when the retry policy falls back after exhausted attempts. Mock
//! outputs never claim validation evidence, so the quality scorer
//! penalises mocked runs.

use crate::context::ContextView;
use crate::recorder::SpanHandle;
use crate::registry::{HandlerResult, TaskDefinition, TaskHandler};
use crate::types::{Value, ValueType};
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Deterministic substitute for one task definition: same inputs, same
/// canned outputs, every time.
pub struct MockHandler {
    definition: TaskDefinition,
}

impl MockHandler {
    pub fn new(definition: TaskDefinition) -> Self {
        MockHandler { definition }
    }

    /// Canned value for a declared output. Keyed off the task and output
    /// name so distinct outputs stay distinguishable downstream.
    fn canned(&self, key: &str, ty: ValueType) -> Value {
        match ty {
            ValueType::Bool => Value::Bool(true),
            ValueType::Int => Value::Int(1),
            ValueType::Float => Value::Float(1.0),
            ValueType::Str | ValueType::Any => {
                Value::Str(format!("mock://{}/{}", self.definition.id, key))
            }
            ValueType::List => Value::List(vec![Value::Str(format!(
                "mock://{}/{}/0",
                self.definition.id, key
            ))]),
            ValueType::Map => Value::Map(
                [(
                    "mocked".to_string(),
                    Value::Str(format!("mock://{}/{}", self.definition.id, key)),
                )]
                .into_iter()
                .collect(),
            ),
        }
    }
}

#[async_trait]
impl TaskHandler for MockHandler {
    async fn invoke(
        &self,
        _inputs: BTreeMap<String, Value>,
        span: SpanHandle,
        _view: ContextView,
    ) -> HandlerResult {
        span.set_attribute("execution.mocked", true);
        let outputs = self
            .definition
            .outputs
            .iter()
            .map(|binding| (binding.key.clone(), self.canned(&binding.key, binding.ty)))
            .collect();
        Ok(outputs)
    }
}
