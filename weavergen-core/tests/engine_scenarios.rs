//! End-to-end interpreter scenarios, asserted over span records.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use weavergen_core::artifacts;
use weavergen_core::engine::{NodeState, RunStatus, WorkflowEngine};
use weavergen_core::handlers::register_builtin_tasks;
use weavergen_core::model;
use weavergen_core::recorder::SpanStatus;
use weavergen_core::registry::{
    FnHandler, HandlerFailure, IoBinding, ServiceTaskRegistry, TaskCategory, TaskDefinition,
};
use weavergen_core::{EngineConfig, Value, ValueType};

const SEMANTIC_YAML: &str = r#"
groups:
  - id: http.server
    stability: stable
  - id: db.client
    stability: experimental
"#;

fn generate_process_xml() -> String {
    r#"<?xml version="1.0" encoding="UTF-8"?>
<bpmn:definitions xmlns:bpmn="http://www.omg.org/spec/BPMN/20100524/MODEL"
                  xmlns:weaver="http://weavergen.dev/schema/bpmn/1.0">
  <bpmn:process id="generate" name="Generate">
    <bpmn:startEvent id="start" />
    <bpmn:serviceTask id="LoadSemantics" name="Load Semantics">
      <bpmn:extensionElements>
        <weaver:serviceTaskRef>load_semantics</weaver:serviceTaskRef>
      </bpmn:extensionElements>
    </bpmn:serviceTask>
    <bpmn:serviceTask id="ValidateInput" name="Validate Input">
      <bpmn:extensionElements>
        <weaver:serviceTaskRef>validate_input</weaver:serviceTaskRef>
      </bpmn:extensionElements>
    </bpmn:serviceTask>
    <bpmn:parallelGateway id="split" gatewayDirection="Diverging" />
    <bpmn:serviceTask id="GenerateModels" name="Generate Models">
      <bpmn:extensionElements>
        <weaver:serviceTaskRef>generate_models</weaver:serviceTaskRef>
      </bpmn:extensionElements>
    </bpmn:serviceTask>
    <bpmn:serviceTask id="GenerateAgents" name="Generate Agents">
      <bpmn:extensionElements>
        <weaver:serviceTaskRef>generate_agents</weaver:serviceTaskRef>
      </bpmn:extensionElements>
    </bpmn:serviceTask>
    <bpmn:serviceTask id="GenerateValidators" name="Generate Validators">
      <bpmn:extensionElements>
        <weaver:serviceTaskRef>generate_validators</weaver:serviceTaskRef>
      </bpmn:extensionElements>
    </bpmn:serviceTask>
    <bpmn:parallelGateway id="join" gatewayDirection="Converging" />
    <bpmn:serviceTask id="Integration" name="Integration">
      <bpmn:extensionElements>
        <weaver:serviceTaskRef>integration</weaver:serviceTaskRef>
      </bpmn:extensionElements>
    </bpmn:serviceTask>
    <bpmn:serviceTask id="GenerateOutput" name="Generate Output">
      <bpmn:extensionElements>
        <weaver:serviceTaskRef>generate_output</weaver:serviceTaskRef>
      </bpmn:extensionElements>
    </bpmn:serviceTask>
    <bpmn:endEvent id="end" />
    <bpmn:sequenceFlow id="f0" sourceRef="start" targetRef="LoadSemantics" />
    <bpmn:sequenceFlow id="f1" sourceRef="LoadSemantics" targetRef="ValidateInput" />
    <bpmn:sequenceFlow id="f2" sourceRef="ValidateInput" targetRef="split" />
    <bpmn:sequenceFlow id="f3" sourceRef="split" targetRef="GenerateModels" />
    <bpmn:sequenceFlow id="f4" sourceRef="split" targetRef="GenerateAgents" />
    <bpmn:sequenceFlow id="f5" sourceRef="split" targetRef="GenerateValidators" />
    <bpmn:sequenceFlow id="f6" sourceRef="GenerateModels" targetRef="join" />
    <bpmn:sequenceFlow id="f7" sourceRef="GenerateAgents" targetRef="join" />
    <bpmn:sequenceFlow id="f8" sourceRef="GenerateValidators" targetRef="join" />
    <bpmn:sequenceFlow id="f9" sourceRef="join" targetRef="Integration" />
    <bpmn:sequenceFlow id="f10" sourceRef="Integration" targetRef="GenerateOutput" />
    <bpmn:sequenceFlow id="f11" sourceRef="GenerateOutput" targetRef="end" />
  </bpmn:process>
</bpmn:definitions>"#
        .to_string()
}

fn builtin_engine(out_dir: &std::path::Path, config: EngineConfig) -> WorkflowEngine {
    let mut registry = ServiceTaskRegistry::new();
    register_builtin_tasks(&mut registry, out_dir.to_path_buf()).unwrap();
    WorkflowEngine::new(registry, config)
}

fn initial_context(semantic_file: &std::path::Path) -> BTreeMap<String, Value> {
    BTreeMap::from([
        (
            "semantic_file".to_string(),
            Value::Str(semantic_file.display().to_string()),
        ),
        (
            "agent_roles".to_string(),
            Value::List(vec![
                Value::Str("analyst".into()),
                Value::Str("coordinator".into()),
                Value::Str("validator".into()),
                Value::Str("facilitator".into()),
            ]),
        ),
    ])
}

/// Scenario 1: happy-path generation run.
#[tokio::test]
async fn happy_path_generation_run() {
    let dir = tempfile::tempdir().unwrap();
    let yaml = dir.path().join("t.yaml");
    std::fs::write(&yaml, SEMANTIC_YAML).unwrap();

    let engine = builtin_engine(dir.path(), EngineConfig::default());
    let process = model::load_process(&generate_process_xml()).unwrap();
    let result = engine
        .run(&process, initial_context(&yaml))
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert!(result.passed(), "verdict: {:?}", result.score);
    assert!(result.score.total >= 0.90, "score {:?}", result.score);
    assert_eq!(result.exit_code(), 0);

    // Four agent outputs present in context.
    let agents = result
        .final_context
        .get("agents")
        .and_then(|v| v.as_list())
        .expect("agents in context");
    assert_eq!(agents.len(), 4);

    // 11 spans: run + 7 tasks + split + join + end, none mocked.
    assert_eq!(result.spans.len(), 11, "spans: {:#?}", result.spans);
    assert!(result
        .spans
        .iter()
        .all(|s| !s.attr_is_true("execution.mocked")));
    assert!(result
        .spans
        .iter()
        .all(|s| s.status == SpanStatus::Ok));
    assert_eq!(result.task_trace.len(), 7);
    assert_eq!(result.task_trace.first().map(String::as_str), Some("load_semantics"));
    assert_eq!(
        result.task_trace.last().map(String::as_str),
        Some("generate_output")
    );

    // Files really were written and claims verified.
    assert!(dir.path().join("models.rs").exists());
    assert!(result.truth.contradicted() == 0);
}

fn single_task_xml(task_ref: &str, retry_attr: &str) -> String {
    format!(
        r#"<definitions xmlns:weaver="http://weavergen.dev/schema/bpmn/1.0"><process id="p">
        <startEvent id="start"/>
        <serviceTask id="T" name="T">
          <extensionElements>
            <weaver:serviceTaskRef>{task_ref}</weaver:serviceTaskRef>
            {retry_attr}
          </extensionElements>
        </serviceTask>
        <endEvent id="end"/>
        <sequenceFlow id="f0" sourceRef="start" targetRef="T"/>
        <sequenceFlow id="f1" sourceRef="T" targetRef="end"/>
    </process></definitions>"#
    )
}

/// A handler that fails `fail_times` with a transient error, then succeeds.
fn flaky(fail_times: u32) -> Arc<FnHandler> {
    let calls = Arc::new(AtomicU32::new(0));
    FnHandler::new(move |_inputs, _span, _view| {
        let calls = Arc::clone(&calls);
        Box::pin(async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < fail_times {
                Err(HandlerFailure::transient("synthetic transient failure"))
            } else {
                Ok(BTreeMap::from([(
                    "result".to_string(),
                    Value::Str("done".into()),
                )]))
            }
        })
    })
}

fn flaky_definition() -> TaskDefinition {
    TaskDefinition::new("flaky_task", TaskCategory::Generation)
        .with_outputs(vec![IoBinding::new("result", ValueType::Str)])
}

/// Scenario 2: retriable failure on attempt 1, success on attempt 2.
#[tokio::test]
async fn retry_then_success() {
    let mut registry = ServiceTaskRegistry::new();
    registry.register(flaky_definition(), flaky(1)).unwrap();
    let engine = WorkflowEngine::new(registry, EngineConfig::default());

    let xml = single_task_xml(
        "flaky_task",
        r#"<weaver:retry maxAttempts="3" backoff="exponential" initialDelayMs="10" retryOn="transient"/>"#,
    );
    let process = model::load_process(&xml).unwrap();
    let result = engine.run(&process, BTreeMap::new()).await.unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert!(result.score.passed);

    let attempts: Vec<_> = result
        .spans
        .iter()
        .filter(|s| s.task_id.as_deref() == Some("flaky_task"))
        .collect();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].attr("attempt"), Some(&Value::Int(1)));
    assert_eq!(attempts[1].attr("attempt"), Some(&Value::Int(2)));
    assert!(attempts[1].attr_is_true("execution.success"));

    let retries: Vec<_> = result.spans.iter().filter(|s| s.name == "retry").collect();
    assert_eq!(retries.len(), 1);
    assert_eq!(retries[0].attr("attempt"), Some(&Value::Int(1)));
}

/// Scenario 3: all attempts fail, mock fallback completes the run.
#[tokio::test]
async fn fallback_to_mock() {
    let mut registry = ServiceTaskRegistry::new();
    registry.register(flaky_definition(), flaky(u32::MAX)).unwrap();
    let engine = WorkflowEngine::new(registry, EngineConfig::default());

    let xml = single_task_xml(
        "flaky_task",
        r#"<weaver:retry maxAttempts="3" backoff="constant" initialDelayMs="5" retryOn="transient" fallbackToMock="true"/>"#,
    );
    let process = model::load_process(&xml).unwrap();
    let result = engine.run(&process, BTreeMap::new()).await.unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    let mock_span = result
        .spans
        .iter()
        .find(|s| s.attr("execution.fallback") == Some(&Value::Str("mock".into())))
        .expect("fallback span");
    assert!(mock_span.attr_is_true("execution.mocked"));
    assert!(mock_span.attr_is_true("execution.success"));
    // Mocked output carries no validation evidence, so valid_spans < 1.
    assert!(result.score.valid_spans < 1.0);
    // Real attempts: 3 failures + 1 mock span.
    let attempts = result
        .spans
        .iter()
        .filter(|s| s.task_id.as_deref() == Some("flaky_task"))
        .count();
    assert_eq!(attempts, 4);
}

/// Scenario 4: all gateway conditions false, default flow reports the error.
#[tokio::test]
async fn exclusive_gateway_default_route() {
    let dir = tempfile::tempdir().unwrap();
    let engine = builtin_engine(dir.path(), EngineConfig::default());

    let xml = r#"<definitions xmlns:weaver="http://weavergen.dev/schema/bpmn/1.0"><process id="p">
        <startEvent id="start"/>
        <exclusiveGateway id="gw" default="f_err"/>
        <serviceTask id="ReportError" name="Report Error">
          <extensionElements><weaver:serviceTaskRef>report_error</weaver:serviceTaskRef></extensionElements>
        </serviceTask>
        <serviceTask id="GenerateModels" name="Generate Models">
          <extensionElements><weaver:serviceTaskRef>generate_models</weaver:serviceTaskRef></extensionElements>
        </serviceTask>
        <endEvent id="ok_end"/>
        <endEvent id="err_end"><errorEventDefinition/></endEvent>
        <sequenceFlow id="f0" sourceRef="start" targetRef="gw"/>
        <sequenceFlow id="f_gen" sourceRef="gw" targetRef="GenerateModels">
          <conditionExpression>has semantic_file and errors = 0</conditionExpression>
        </sequenceFlow>
        <sequenceFlow id="f_err" sourceRef="gw" targetRef="ReportError"/>
        <sequenceFlow id="f1" sourceRef="GenerateModels" targetRef="ok_end"/>
        <sequenceFlow id="f2" sourceRef="ReportError" targetRef="err_end"/>
    </process></definitions>"#;
    let process = model::load_process(xml).unwrap();
    // `errors` is 3, so the generation condition is false.
    let result = engine
        .run(&process, BTreeMap::from([("errors".to_string(), Value::Int(3))]))
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.exit_code(), 3);
    assert_eq!(result.task_trace, vec!["report_error".to_string()]);
    assert!(result
        .spans
        .iter()
        .any(|s| s.task_id.as_deref() == Some("report_error")));
    assert!(!result
        .spans
        .iter()
        .any(|s| s.task_id.as_deref() == Some("generate_models")));
    assert_eq!(
        result.node_states.get("GenerateModels"),
        Some(&NodeState::Skipped)
    );
}

/// Scenario 4b: no matching condition and no default is ErrGatewayNoMatch
/// at run time (the model is built programmatically; the parser-level
/// verifier would reject it).
#[tokio::test]
async fn gateway_without_default_fails() {
    use weavergen_core::model::ir::*;
    use weavergen_core::model::Expr;

    let mut graph = ProcessGraph::new();
    let start = graph.add_node(FlowNode::Start { id: "start".into() });
    let gw = graph.add_node(FlowNode::ExclusiveGateway {
        id: "gw".into(),
        name: String::new(),
        default_flow: None,
    });
    let end = graph.add_node(FlowNode::End {
        id: "end".into(),
        error: false,
    });
    graph.add_edge(
        start,
        gw,
        SequenceFlow {
            id: "f0".into(),
            order: 0,
            condition: None,
        },
    );
    graph.add_edge(
        gw,
        end,
        SequenceFlow {
            id: "f1".into(),
            order: 1,
            condition: Some(Expr::parse("ready = true").unwrap()),
        },
    );
    let model = ProcessModel {
        id: "p".into(),
        name: String::new(),
        graph,
        data_objects: BTreeMap::new(),
        parallel_pairs: BTreeMap::new(),
    };

    let engine = WorkflowEngine::new(ServiceTaskRegistry::new(), EngineConfig::default());
    let result = engine.run(&model, BTreeMap::new()).await.unwrap();
    assert_eq!(result.status, RunStatus::Failed);
    assert!(result
        .errors
        .iter()
        .any(|e| e.code == "ErrGatewayNoMatch"));
}

/// Scenario 5: conflicting writes without a merge rule fail the join and
/// compensation unwinds both branches.
#[tokio::test]
async fn parallel_join_merge_conflict_compensates() {
    let writer = |name: &'static str| {
        FnHandler::new(move |_inputs, _span, _view| {
            Box::pin(async move {
                Ok(BTreeMap::from([(
                    "generated_files".to_string(),
                    Value::List(vec![Value::Str(format!("{name}.rs"))]),
                )]))
            })
        })
    };
    let undo_calls = Arc::new(AtomicU32::new(0));
    let undo_calls_probe = Arc::clone(&undo_calls);
    let mut registry = ServiceTaskRegistry::new();
    for name in ["gen_a", "gen_b"] {
        registry
            .register(
                TaskDefinition::new(name, TaskCategory::Generation)
                    .with_outputs(vec![IoBinding::new("generated_files", ValueType::List)])
                    .compensable(),
                writer(if name == "gen_a" { "a" } else { "b" }),
            )
            .unwrap();
    }
    registry
        .register(
            TaskDefinition::new("undo_gen", TaskCategory::Utility),
            FnHandler::new(move |_inputs, _span, _view| {
                let calls = Arc::clone(&undo_calls);
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(BTreeMap::new())
                })
            }),
        )
        .unwrap();
    let engine = WorkflowEngine::new(registry, EngineConfig::default());

    let xml = r#"<definitions xmlns:weaver="http://weavergen.dev/schema/bpmn/1.0"><process id="p">
        <startEvent id="start"/>
        <parallelGateway id="split" gatewayDirection="Diverging"/>
        <serviceTask id="A" name="A">
          <extensionElements>
            <weaver:serviceTaskRef>gen_a</weaver:serviceTaskRef>
            <weaver:compensation handler="undo_gen"/>
          </extensionElements>
        </serviceTask>
        <serviceTask id="B" name="B">
          <extensionElements>
            <weaver:serviceTaskRef>gen_b</weaver:serviceTaskRef>
            <weaver:compensation handler="undo_gen"/>
          </extensionElements>
        </serviceTask>
        <parallelGateway id="join" gatewayDirection="Converging"/>
        <endEvent id="end"/>
        <sequenceFlow id="f0" sourceRef="start" targetRef="split"/>
        <sequenceFlow id="f1" sourceRef="split" targetRef="A"/>
        <sequenceFlow id="f2" sourceRef="split" targetRef="B"/>
        <sequenceFlow id="f3" sourceRef="A" targetRef="join"/>
        <sequenceFlow id="f4" sourceRef="B" targetRef="join"/>
        <sequenceFlow id="f5" sourceRef="join" targetRef="end"/>
    </process></definitions>"#;
    let process = model::load_process(xml).unwrap();
    let result = engine.run(&process, BTreeMap::new()).await.unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.exit_code(), 3);
    assert!(result
        .errors
        .iter()
        .any(|e| e.code == "ErrContextMergeConflict"));
    // No merged value survives the conflict.
    assert!(!result.final_context.contains_key("generated_files"));
    // Both branches were compensated.
    assert_eq!(undo_calls_probe.load(Ordering::SeqCst), 2);
    assert_eq!(result.node_states.get("A"), Some(&NodeState::Compensated));
    assert_eq!(result.node_states.get("B"), Some(&NodeState::Compensated));
}

/// Scenario 6: operator cancellation mid-run.
#[tokio::test]
async fn cancellation_mid_run() {
    let mut registry = ServiceTaskRegistry::new();
    registry
        .register(
            TaskDefinition::new("first", TaskCategory::Utility),
            FnHandler::new(|_i, _s, _v| Box::pin(async { Ok(BTreeMap::new()) })),
        )
        .unwrap();
    registry
        .register(
            TaskDefinition::new("integration", TaskCategory::Utility),
            FnHandler::new(|_inputs, span, _view| {
                Box::pin(async move {
                    let token = span.cancellation();
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(30)) => {
                            Ok(BTreeMap::new())
                        }
                        _ = token.cancelled() => Err(HandlerFailure::cancelled()),
                    }
                })
            }),
        )
        .unwrap();
    registry
        .register(
            TaskDefinition::new("after", TaskCategory::Utility),
            FnHandler::new(|_i, _s, _v| Box::pin(async { Ok(BTreeMap::new()) })),
        )
        .unwrap();
    let engine = WorkflowEngine::new(registry, EngineConfig::default());

    let xml = r#"<definitions xmlns:weaver="http://weavergen.dev/schema/bpmn/1.0"><process id="p">
        <startEvent id="start"/>
        <serviceTask id="First" name="First">
          <extensionElements><weaver:serviceTaskRef>first</weaver:serviceTaskRef></extensionElements>
        </serviceTask>
        <serviceTask id="Integration" name="Integration">
          <extensionElements><weaver:serviceTaskRef>integration</weaver:serviceTaskRef></extensionElements>
        </serviceTask>
        <serviceTask id="After" name="After">
          <extensionElements><weaver:serviceTaskRef>after</weaver:serviceTaskRef></extensionElements>
        </serviceTask>
        <endEvent id="end"/>
        <sequenceFlow id="f0" sourceRef="start" targetRef="First"/>
        <sequenceFlow id="f1" sourceRef="First" targetRef="Integration"/>
        <sequenceFlow id="f2" sourceRef="Integration" targetRef="After"/>
        <sequenceFlow id="f3" sourceRef="After" targetRef="end"/>
    </process></definitions>"#;
    let process = model::load_process(xml).unwrap();

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        trigger.cancel();
    });

    let result = engine
        .run_cancellable(&process, BTreeMap::new(), token)
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Cancelled);
    assert_eq!(result.exit_code(), 3);
    assert!(result.errors.iter().any(|e| e.code == "ErrCancelled"));

    let integration_span = result
        .spans
        .iter()
        .find(|s| s.task_id.as_deref() == Some("integration"))
        .expect("integration span");
    assert_eq!(integration_span.status, SpanStatus::Cancelled);
    // The successor never left pending; it reports as skipped.
    assert_eq!(result.node_states.get("After"), Some(&NodeState::Skipped));
    assert!(!result
        .spans
        .iter()
        .any(|s| s.task_id.as_deref() == Some("after")));

    // Artefacts are still written for cancelled runs.
    let dir = tempfile::tempdir().unwrap();
    let paths = artifacts::write_artifacts(dir.path(), &result).await.unwrap();
    assert!(paths.spans.exists());
    assert!(paths.xes.exists());
    assert!(paths.report.exists());
}

/// Whole-run mock mode completes without touching any real handler.
#[tokio::test]
async fn global_mock_mode_runs_without_real_handlers() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = EngineConfig::default();
    config.mock_enabled_globally = true;
    let engine = builtin_engine(dir.path(), config);

    let process = model::load_process(&generate_process_xml()).unwrap();
    // No semantic file on disk: mock mode must not read it.
    let result = engine
        .run(&process, initial_context(std::path::Path::new("/nonexistent/t.yaml")))
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    for span in result.spans.iter().filter(|s| s.task_id.is_some()) {
        assert!(
            span.attr_is_true("execution.mocked"),
            "span {} not mocked",
            span.name
        );
    }
    // Nothing was generated for real.
    assert!(!dir.path().join("models.rs").exists());
}

/// Boundary behaviour: a start→end process completes with an empty trace
/// and a 1.0 score by convention.
#[tokio::test]
async fn empty_process_scores_one() {
    let engine = WorkflowEngine::new(ServiceTaskRegistry::new(), EngineConfig::default());
    let xml = r#"<definitions><process id="empty">
        <startEvent id="start"/>
        <endEvent id="end"/>
        <sequenceFlow id="f0" sourceRef="start" targetRef="end"/>
    </process></definitions>"#;
    let process = model::load_process(xml).unwrap();
    let result = engine.run(&process, BTreeMap::new()).await.unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert!(result.task_trace.is_empty());
    assert_eq!(result.score.total, 1.0);
    assert_eq!(result.exit_code(), 0);
}

/// Boundary behaviour: max_attempts=1 disables retries.
#[tokio::test]
async fn single_attempt_disables_retry() {
    let mut registry = ServiceTaskRegistry::new();
    registry.register(flaky_definition(), flaky(u32::MAX)).unwrap();
    let engine = WorkflowEngine::new(registry, EngineConfig::default());

    let xml = single_task_xml(
        "flaky_task",
        r#"<weaver:retry maxAttempts="1" retryOn="transient"/>"#,
    );
    let process = model::load_process(&xml).unwrap();
    let result = engine.run(&process, BTreeMap::new()).await.unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    let attempts = result
        .spans
        .iter()
        .filter(|s| s.task_id.as_deref() == Some("flaky_task"))
        .count();
    assert_eq!(attempts, 1);
    assert!(result.spans.iter().all(|s| s.name != "retry"));
}

/// Boundary behaviour: an empty retry_on set never retries, whatever
/// max_attempts says.
#[tokio::test]
async fn empty_retry_on_disables_retry() {
    let mut registry = ServiceTaskRegistry::new();
    registry.register(flaky_definition(), flaky(u32::MAX)).unwrap();
    let engine = WorkflowEngine::new(registry, EngineConfig::default());

    let xml = single_task_xml(
        "flaky_task",
        r#"<weaver:retry maxAttempts="5" retryOn=""/>"#,
    );
    let process = model::load_process(&xml).unwrap();
    let result = engine.run(&process, BTreeMap::new()).await.unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    let attempts = result
        .spans
        .iter()
        .filter(|s| s.task_id.as_deref() == Some("flaky_task"))
        .count();
    assert_eq!(attempts, 1);
}

/// Boundary behaviour: a one-branch split degenerates to sequential
/// execution with identical semantics.
#[tokio::test]
async fn single_branch_split_degenerates() {
    let mut registry = ServiceTaskRegistry::new();
    registry.register(flaky_definition(), flaky(0)).unwrap();
    let engine = WorkflowEngine::new(registry, EngineConfig::default());

    let xml = r#"<definitions xmlns:weaver="http://weavergen.dev/schema/bpmn/1.0"><process id="p">
        <startEvent id="start"/>
        <parallelGateway id="split" gatewayDirection="Diverging"/>
        <serviceTask id="T" name="T">
          <extensionElements><weaver:serviceTaskRef>flaky_task</weaver:serviceTaskRef></extensionElements>
        </serviceTask>
        <parallelGateway id="join" gatewayDirection="Converging"/>
        <endEvent id="end"/>
        <sequenceFlow id="f0" sourceRef="start" targetRef="split"/>
        <sequenceFlow id="f1" sourceRef="split" targetRef="T"/>
        <sequenceFlow id="f2" sourceRef="T" targetRef="join"/>
        <sequenceFlow id="f3" sourceRef="join" targetRef="end"/>
    </process></definitions>"#;
    let process = model::load_process(xml).unwrap();
    let result = engine.run(&process, BTreeMap::new()).await.unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.task_trace, vec!["flaky_task".to_string()]);
    assert_eq!(
        result.final_context.get("result"),
        Some(&Value::Str("done".into()))
    );
}

/// Boundary timer fires, cancels the host task and diverts flow.
#[tokio::test]
async fn boundary_timer_diverts() {
    let mut registry = ServiceTaskRegistry::new();
    registry
        .register(
            TaskDefinition::new("slow", TaskCategory::Utility),
            FnHandler::new(|_inputs, span, _view| {
                Box::pin(async move {
                    let token = span.cancellation();
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(30)) => Ok(BTreeMap::new()),
                        _ = token.cancelled() => Err(HandlerFailure::cancelled()),
                    }
                })
            }),
        )
        .unwrap();
    registry
        .register(
            TaskDefinition::new("escalate", TaskCategory::Utility),
            FnHandler::new(|_i, _s, _v| Box::pin(async { Ok(BTreeMap::new()) })),
        )
        .unwrap();
    let engine = WorkflowEngine::new(registry, EngineConfig::default());

    let xml = r#"<definitions xmlns:weaver="http://weavergen.dev/schema/bpmn/1.0"><process id="p">
        <startEvent id="start"/>
        <serviceTask id="Slow" name="Slow">
          <extensionElements><weaver:serviceTaskRef>slow</weaver:serviceTaskRef></extensionElements>
        </serviceTask>
        <boundaryEvent id="timeout_guard" attachedToRef="Slow">
          <timerEventDefinition><timeDuration>PT0.1S</timeDuration></timerEventDefinition>
        </boundaryEvent>
        <serviceTask id="Escalate" name="Escalate">
          <extensionElements><weaver:serviceTaskRef>escalate</weaver:serviceTaskRef></extensionElements>
        </serviceTask>
        <endEvent id="end"/>
        <endEvent id="slow_end"/>
        <sequenceFlow id="f0" sourceRef="start" targetRef="Slow"/>
        <sequenceFlow id="f1" sourceRef="Slow" targetRef="slow_end"/>
        <sequenceFlow id="f2" sourceRef="timeout_guard" targetRef="Escalate"/>
        <sequenceFlow id="f3" sourceRef="Escalate" targetRef="end"/>
    </process></definitions>"#;
    let process = model::load_process(xml).unwrap();
    let result = engine.run(&process, BTreeMap::new()).await.unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.task_trace, vec!["escalate".to_string()]);
    let slow_span = result
        .spans
        .iter()
        .find(|s| s.task_id.as_deref() == Some("slow"))
        .expect("slow span");
    assert_eq!(slow_span.status, SpanStatus::Cancelled);
    assert_eq!(
        result.node_states.get("Escalate"),
        Some(&NodeState::Completed)
    );
}

/// Append-list merge across branches, end to end.
#[tokio::test]
async fn parallel_branches_merge_with_declared_rule() {
    let writer = |name: &'static str| {
        FnHandler::new(move |_inputs, _span, _view| {
            Box::pin(async move {
                Ok(BTreeMap::from([(
                    "generated_files".to_string(),
                    Value::List(vec![Value::Str(format!("{name}.rs"))]),
                )]))
            })
        })
    };
    let mut registry = ServiceTaskRegistry::new();
    registry
        .register(
            TaskDefinition::new("gen_a", TaskCategory::Generation)
                .with_outputs(vec![IoBinding::new("generated_files", ValueType::List)]),
            writer("a"),
        )
        .unwrap();
    registry
        .register(
            TaskDefinition::new("gen_b", TaskCategory::Generation)
                .with_outputs(vec![IoBinding::new("generated_files", ValueType::List)]),
            writer("b"),
        )
        .unwrap();
    let engine = WorkflowEngine::new(registry, EngineConfig::default());

    let xml = r#"<definitions xmlns:weaver="http://weavergen.dev/schema/bpmn/1.0"><process id="p">
        <startEvent id="start"/>
        <parallelGateway id="split" gatewayDirection="Diverging"/>
        <serviceTask id="A" name="A">
          <extensionElements><weaver:serviceTaskRef>gen_a</weaver:serviceTaskRef></extensionElements>
        </serviceTask>
        <serviceTask id="B" name="B">
          <extensionElements><weaver:serviceTaskRef>gen_b</weaver:serviceTaskRef></extensionElements>
        </serviceTask>
        <parallelGateway id="join" gatewayDirection="Converging"/>
        <endEvent id="end"/>
        <sequenceFlow id="f0" sourceRef="start" targetRef="split"/>
        <sequenceFlow id="f1" sourceRef="split" targetRef="A"/>
        <sequenceFlow id="f2" sourceRef="split" targetRef="B"/>
        <sequenceFlow id="f3" sourceRef="A" targetRef="join"/>
        <sequenceFlow id="f4" sourceRef="B" targetRef="join"/>
        <sequenceFlow id="f5" sourceRef="join" targetRef="end"/>
        <dataObjectReference id="do_files" name="generated_files">
          <extensionElements><weaver:mergeRule>append_list</weaver:mergeRule></extensionElements>
        </dataObjectReference>
    </process></definitions>"#;
    let process = model::load_process(xml).unwrap();
    let result = engine.run(&process, BTreeMap::new()).await.unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(
        result.final_context.get("generated_files"),
        Some(&Value::List(vec![
            Value::Str("a.rs".into()),
            Value::Str("b.rs".into())
        ]))
    );
}

/// Mining round-trip: the trace of a run, mined, yields a model that
/// replays an equivalent trace under mock execution.
#[tokio::test]
async fn mining_roundtrip_replays_equivalent_trace() {
    let dir = tempfile::tempdir().unwrap();
    let yaml = dir.path().join("t.yaml");
    std::fs::write(&yaml, SEMANTIC_YAML).unwrap();

    let engine = builtin_engine(dir.path(), EngineConfig::default());
    let process = model::load_process(&generate_process_xml()).unwrap();
    let result = engine.run(&process, initial_context(&yaml)).await.unwrap();
    assert_eq!(result.status, RunStatus::Completed);

    let mut registry = ServiceTaskRegistry::new();
    register_builtin_tasks(&mut registry, dir.path().to_path_buf()).unwrap();
    let candidate = weavergen_core::mining::ProcessMiner::mine(
        "mined",
        &[result.task_trace.clone()],
        &registry,
    )
    .expect("candidate model");

    // Replay the candidate in mock mode; its trace must be admissible
    // for the mined model and contain the same task set.
    let mut config = EngineConfig::default();
    config.mock_enabled_globally = true;
    let replay_engine = builtin_engine(dir.path(), config);
    let replay = replay_engine
        .run(&candidate, BTreeMap::new())
        .await
        .unwrap();
    assert_eq!(replay.status, RunStatus::Completed);

    let mut original_sorted = result.task_trace.clone();
    let mut replay_sorted = replay.task_trace.clone();
    original_sorted.sort();
    replay_sorted.sort();
    assert_eq!(original_sorted, replay_sorted);
    assert!(weavergen_core::mining::trace_compatible(
        &candidate,
        &replay.task_trace
    ));
}

/// A task exceeding its declared timeout fails with ErrTimeout; the
/// handler is cancelled by dropping it.
#[tokio::test]
async fn task_timeout_raises_err_timeout() {
    let mut registry = ServiceTaskRegistry::new();
    registry
        .register(
            TaskDefinition::new("sleepy", TaskCategory::Utility),
            FnHandler::new(|_inputs, _span, _view| {
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(BTreeMap::new())
                })
            }),
        )
        .unwrap();
    let engine = WorkflowEngine::new(registry, EngineConfig::default());

    let xml = single_task_xml("sleepy", r#"<weaver:timeout ms="50"/>"#);
    let process = model::load_process(&xml).unwrap();
    let result = engine.run(&process, BTreeMap::new()).await.unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    assert!(result.errors.iter().any(|e| e.code == "ErrTimeout"));
    let span = result
        .spans
        .iter()
        .find(|s| s.task_id.as_deref() == Some("sleepy"))
        .expect("task span");
    assert_eq!(span.status, SpanStatus::Error);
    assert_eq!(span.attr("error.kind"), Some(&Value::Str("timeout".into())));
}

/// The run deadline cancels the whole run; a non-cooperative handler is
/// force-closed after the grace period.
#[tokio::test]
async fn run_deadline_cancels_the_run() {
    let mut registry = ServiceTaskRegistry::new();
    registry
        .register(
            TaskDefinition::new("stubborn", TaskCategory::Utility),
            FnHandler::new(|_inputs, _span, _view| {
                Box::pin(async move {
                    // Never observes the token.
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(BTreeMap::new())
                })
            }),
        )
        .unwrap();
    let mut config = EngineConfig::default();
    config.run_deadline = Duration::from_millis(100);
    config.cancel_grace_period = Duration::from_millis(100);
    config.default_task_timeout = Duration::ZERO;
    let engine = WorkflowEngine::new(registry, config);

    let xml = single_task_xml("stubborn", "");
    let process = model::load_process(&xml).unwrap();
    let result = engine.run(&process, BTreeMap::new()).await.unwrap();

    assert_eq!(result.status, RunStatus::Cancelled);
    assert!(result.errors.iter().any(|e| e.code == "ErrCancelled"));
    let span = result
        .spans
        .iter()
        .find(|s| s.task_id.as_deref() == Some("stubborn"))
        .expect("task span");
    assert_eq!(span.status, SpanStatus::Cancelled);
}

/// Unknown task refs fail at startup unless whole-run mock is on.
#[tokio::test]
async fn unknown_task_ref_is_a_startup_error() {
    let engine = WorkflowEngine::new(ServiceTaskRegistry::new(), EngineConfig::default());
    let xml = single_task_xml("never_registered", "");
    let process = model::load_process(&xml).unwrap();
    match engine.run(&process, BTreeMap::new()).await {
        Err(e) => {
            assert_eq!(e.code(), "ErrUnknownTaskRef");
            assert!(e.is_startup());
        }
        Ok(_) => panic!("expected startup error"),
    }
}
