//! Code-generation, integration and output tasks.
//!
//! Generators are deterministic: the same semantics always produce the
//! same code text, which keeps mining replays and idempotence checks
//! meaningful. The output task is the only one that touches the
//! filesystem; every written file gets a child span with file attribution.

use crate::error::EngineResult;
use crate::registry::{
    FnHandler, HandlerFailure, IoBinding, ServiceTaskRegistry, TaskCategory, TaskDefinition,
};
use crate::truth::{Claim, RequiredEvidence};
use crate::types::{RetryPolicy, Value, ValueType};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;

pub fn register(registry: &mut ServiceTaskRegistry, out_dir: PathBuf) -> EngineResult<()> {
    registry.register(
        TaskDefinition::new("generate_models", TaskCategory::Generation)
            .with_inputs(vec![IoBinding::new("semantics", ValueType::Map)])
            .with_outputs(vec![
                IoBinding::new("model_code", ValueType::Str),
                IoBinding::new("model_count", ValueType::Int),
            ])
            .with_retry(RetryPolicy::default())
            .compensable()
            .idempotent(),
        FnHandler::new(|inputs, span, _view| {
            Box::pin(async move {
                let groups = group_ids(inputs.get("semantics"));
                let mut code = String::from("// generated semantic models\n");
                for id in &groups {
                    let _ = writeln!(
                        code,
                        "pub struct {} {{ pub attributes: Vec<Attribute> }}",
                        type_name(id)
                    );
                }
                span.set_attribute("generation.models", Value::Int(groups.len() as i64));
                let mut outputs = BTreeMap::new();
                outputs.insert("model_code".to_string(), Value::Str(code));
                outputs.insert("model_count".to_string(), Value::Int(groups.len() as i64));
                Ok(outputs)
            })
        }),
    )?;

    registry.register(
        TaskDefinition::new("generate_agents", TaskCategory::Ai)
            .with_inputs(vec![IoBinding::new("agent_roles", ValueType::List)])
            .with_outputs(vec![IoBinding::new("agents", ValueType::List)])
            .with_retry(RetryPolicy::default())
            .idempotent(),
        FnHandler::new(|inputs, span, _view| {
            Box::pin(async move {
                let Some(roles) = inputs.get("agent_roles").and_then(|v| v.as_list()) else {
                    return Err(HandlerFailure::validation("agent_roles is required"));
                };
                let agents: Vec<Value> = roles
                    .iter()
                    .filter_map(|r| r.as_str())
                    .map(|role| {
                        Value::Map(
                            [
                                ("role".to_string(), Value::Str(role.to_string())),
                                (
                                    "instructions".to_string(),
                                    Value::Str(format!(
                                        "You are the {role} agent for generated pipelines."
                                    )),
                                ),
                            ]
                            .into_iter()
                            .collect(),
                        )
                    })
                    .collect();
                span.set_attribute("generation.agents", Value::Int(agents.len() as i64));
                let mut outputs = BTreeMap::new();
                outputs.insert("agents".to_string(), Value::List(agents));
                Ok(outputs)
            })
        }),
    )?;

    registry.register(
        TaskDefinition::new("generate_validators", TaskCategory::Validation)
            .with_inputs(vec![IoBinding::new("semantics", ValueType::Map)])
            .with_outputs(vec![IoBinding::new("validator_code", ValueType::Str)])
            .with_retry(RetryPolicy::default())
            .idempotent(),
        FnHandler::new(|inputs, span, _view| {
            Box::pin(async move {
                let groups = group_ids(inputs.get("semantics"));
                let mut code = String::from("// generated span validators\n");
                for id in &groups {
                    let _ = writeln!(
                        code,
                        "pub fn validate_{}(span: &SpanRecord) -> bool {{ span.name.starts_with(\"{id}\") }}",
                        snake_name(id)
                    );
                }
                span.set_attribute("generation.validators", Value::Int(groups.len() as i64));
                let mut outputs = BTreeMap::new();
                outputs.insert("validator_code".to_string(), Value::Str(code));
                Ok(outputs)
            })
        }),
    )?;

    registry.register(
        TaskDefinition::new("integration", TaskCategory::Utility)
            .with_inputs(vec![
                IoBinding::new("model_code", ValueType::Str),
                IoBinding::new("agents", ValueType::List),
                IoBinding::new("validator_code", ValueType::Str),
            ])
            .with_outputs(vec![
                IoBinding::new("integrated", ValueType::Bool),
                IoBinding::new("artifact_count", ValueType::Int),
            ]),
        FnHandler::new(|inputs, span, _view| {
            Box::pin(async move {
                let mut count = 0i64;
                for key in ["model_code", "agents", "validator_code"] {
                    if inputs.contains_key(key) {
                        count += 1;
                    }
                }
                span.set_attribute("integration.artifacts", Value::Int(count));
                let mut outputs = BTreeMap::new();
                outputs.insert("integrated".to_string(), Value::Bool(count == 3));
                outputs.insert("artifact_count".to_string(), Value::Int(count));
                Ok(outputs)
            })
        }),
    )?;

    let output_dir = out_dir.clone();
    registry.register(
        TaskDefinition::new("generate_output", TaskCategory::Weaver)
            .with_inputs(vec![
                IoBinding::new("model_code", ValueType::Str),
                IoBinding::new("validator_code", ValueType::Str),
                IoBinding::new("agents", ValueType::List),
            ])
            .with_outputs(vec![IoBinding::new("written_files", ValueType::List)])
            .with_retry(RetryPolicy::default())
            .compensable(),
        FnHandler::new(move |inputs, span, _view| {
            let dir = output_dir.clone();
            Box::pin(async move {
                tokio::fs::create_dir_all(&dir)
                    .await
                    .map_err(|e| HandlerFailure::io(format!("creating output dir: {e}")))?;

                let mut files: Vec<(String, String)> = Vec::new();
                if let Some(code) = inputs.get("model_code").and_then(|v| v.as_str()) {
                    files.push(("models.rs".to_string(), code.to_string()));
                }
                if let Some(code) = inputs.get("validator_code").and_then(|v| v.as_str()) {
                    files.push(("validators.rs".to_string(), code.to_string()));
                }
                if let Some(agents) = inputs.get("agents") {
                    let rendered = serde_json::to_string_pretty(agents)
                        .map_err(|e| HandlerFailure::permanent(format!("agents encode: {e}")))?;
                    files.push(("agents.json".to_string(), rendered));
                }

                let mut written = Vec::new();
                for (name, content) in files {
                    let path = dir.join(&name);
                    tokio::fs::write(&path, content).await.map_err(|e| {
                        HandlerFailure::io(format!("writing '{}': {e}", path.display()))
                    })?;
                    written.push(Value::Str(path.display().to_string()));
                }
                span.set_attribute("code.function", Value::Str("generate_output".into()));

                span.set_attribute("code.files_written", Value::List(written.clone()));
                span.set_attribute("files.count", Value::Int(written.len() as i64));
                for file in &written {
                    if let Some(path) = file.as_str() {
                        span.record_claim(Claim {
                            text: format!("wrote {path}"),
                            task_id: "generate_output".to_string(),
                            evidence: vec![RequiredEvidence::FileWritten {
                                path: path.to_string(),
                            }],
                        });
                    }
                }

                let mut outputs = BTreeMap::new();
                outputs.insert("written_files".to_string(), Value::List(written));
                Ok(outputs)
            })
        }),
    )?;

    registry.register(
        TaskDefinition::new("cleanup_generated", TaskCategory::Utility),
        FnHandler::new(|inputs, span, _view| {
            Box::pin(async move {
                // Compensation target: removes files the compensated task
                // reported, when any are named.
                let mut removed = 0i64;
                if let Some(files) = inputs.get("written_files").and_then(|v| v.as_list()) {
                    for file in files {
                        if let Some(path) = file.as_str() {
                            if tokio::fs::remove_file(path).await.is_ok() {
                                removed += 1;
                            }
                        }
                    }
                }
                span.set_attribute("cleanup.removed", Value::Int(removed));
                Ok(BTreeMap::new())
            })
        }),
    )?;

    registry.register(
        TaskDefinition::new("report_error", TaskCategory::Utility)
            .with_inputs(vec![IoBinding::new("errors", ValueType::Int)]),
        FnHandler::new(|inputs, span, _view| {
            Box::pin(async move {
                let errors = inputs.get("errors").and_then(|v| v.as_int()).unwrap_or(-1);
                span.set_attribute("report.errors", Value::Int(errors));
                tracing::warn!(errors, "pipeline rejected by validation");
                Ok(BTreeMap::new())
            })
        }),
    )?;

    Ok(())
}

/// Group ids from a loaded semantics map, in declaration order.
fn group_ids(semantics: Option<&Value>) -> Vec<String> {
    semantics
        .and_then(|v| v.as_map())
        .and_then(|m| m.get("groups"))
        .and_then(|g| g.as_list())
        .map(|groups| {
            groups
                .iter()
                .filter_map(|g| g.as_map())
                .filter_map(|g| g.get("id"))
                .filter_map(|id| id.as_str())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn type_name(group_id: &str) -> String {
    group_id
        .split(['.', '-', '_'])
        .filter(|s| !s.is_empty())
        .map(|s| {
            let mut chars = s.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}

fn snake_name(group_id: &str) -> String {
    group_id.replace(['.', '-'], "_")
}
