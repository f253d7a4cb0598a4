//! Semantic-convention loading and input validation tasks.

use crate::error::EngineResult;
use crate::registry::{
    FnHandler, HandlerFailure, IoBinding, ServiceTaskRegistry, TaskCategory, TaskDefinition,
};
use crate::truth::{Claim, RequiredEvidence};
use crate::types::{RetryPolicy, Value, ValueType};
use std::collections::BTreeMap;

pub fn register(registry: &mut ServiceTaskRegistry) -> EngineResult<()> {
    registry.register(
        TaskDefinition::new("load_semantics", TaskCategory::Semantic)
            .with_inputs(vec![IoBinding::new("semantic_file", ValueType::Str)])
            .with_outputs(vec![
                IoBinding::new("semantics", ValueType::Map),
                IoBinding::new("semantic_groups", ValueType::Int),
            ])
            .with_retry(RetryPolicy::default())
            .idempotent(),
        FnHandler::new(|inputs, span, _view| {
            Box::pin(async move {
                let Some(path) = inputs.get("semantic_file").and_then(|v| v.as_str()) else {
                    return Err(HandlerFailure::validation("semantic_file is required"));
                };
                let raw = tokio::fs::read_to_string(path)
                    .await
                    .map_err(|e| HandlerFailure::io(format!("reading '{path}': {e}")))?;
                let yaml: serde_yaml::Value = serde_yaml::from_str(&raw)
                    .map_err(|e| HandlerFailure::validation(format!("bad YAML in '{path}': {e}")))?;
                let semantics = yaml_to_value(yaml);

                let groups = semantics
                    .as_map()
                    .and_then(|m| m.get("groups"))
                    .and_then(|g| g.as_list())
                    .map(|l| l.len() as i64)
                    .unwrap_or(0);
                span.set_attribute("semantic.groups", Value::Int(groups));
                span.set_attribute("code.filepath", Value::Str(path.to_string()));
                span.record_claim(Claim {
                    text: format!("loaded {groups} semantic groups from {path}"),
                    task_id: "load_semantics".to_string(),
                    evidence: vec![RequiredEvidence::Count {
                        attribute: "semantic.groups".to_string(),
                        expected: groups,
                    }],
                });

                let mut outputs = BTreeMap::new();
                outputs.insert("semantics".to_string(), semantics);
                outputs.insert("semantic_groups".to_string(), Value::Int(groups));
                Ok(outputs)
            })
        }),
    )?;

    registry.register(
        TaskDefinition::new("validate_input", TaskCategory::Validation)
            .with_inputs(vec![IoBinding::new("semantics", ValueType::Map)])
            .with_outputs(vec![
                IoBinding::new("errors", ValueType::Int),
                IoBinding::new("validated", ValueType::Bool),
            ])
            .idempotent(),
        FnHandler::new(|inputs, span, _view| {
            Box::pin(async move {
                // Structural checks only; a failed validation is a normal
                // outcome routed by the gateway, not a handler error.
                let mut errors: i64 = 0;
                match inputs.get("semantics").and_then(|v| v.as_map()) {
                    None => errors += 1,
                    Some(semantics) => {
                        let groups = semantics.get("groups").and_then(|g| g.as_list());
                        match groups {
                            None => errors += 1,
                            Some(groups) => {
                                for group in groups {
                                    let has_id = group
                                        .as_map()
                                        .and_then(|g| g.get("id"))
                                        .is_some();
                                    if !has_id {
                                        errors += 1;
                                    }
                                }
                            }
                        }
                    }
                }
                span.set_attribute("validation.errors", Value::Int(errors));
                let mut outputs = BTreeMap::new();
                outputs.insert("errors".to_string(), Value::Int(errors));
                outputs.insert("validated".to_string(), Value::Bool(errors == 0));
                Ok(outputs)
            })
        }),
    )?;

    Ok(())
}

/// Convert parsed YAML into context values.
fn yaml_to_value(yaml: serde_yaml::Value) -> Value {
    match yaml {
        serde_yaml::Value::Null => Value::Null,
        serde_yaml::Value::Bool(b) => Value::Bool(b),
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else {
                Value::Float(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_yaml::Value::String(s) => Value::Str(s),
        serde_yaml::Value::Sequence(items) => {
            Value::List(items.into_iter().map(yaml_to_value).collect())
        }
        serde_yaml::Value::Mapping(mapping) => Value::Map(
            mapping
                .into_iter()
                .map(|(k, v)| {
                    let key = match k {
                        serde_yaml::Value::String(s) => s,
                        other => serde_yaml::to_string(&other)
                            .unwrap_or_default()
                            .trim()
                            .to_string(),
                    };
                    (key, yaml_to_value(v))
                })
                .collect(),
        ),
        serde_yaml::Value::Tagged(tagged) => yaml_to_value(tagged.value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_conversion_preserves_structure() {
        let yaml: serde_yaml::Value = serde_yaml::from_str(
            r#"
groups:
  - id: http.server
    stability: stable
  - id: db.client
attributes: 3
"#,
        )
        .unwrap();
        let value = yaml_to_value(yaml);
        let map = value.as_map().unwrap();
        assert_eq!(map.get("attributes"), Some(&Value::Int(3)));
        let groups = map.get("groups").and_then(|g| g.as_list()).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(
            groups[0].as_map().and_then(|g| g.get("id")),
            Some(&Value::Str("http.server".into()))
        );
    }
}
