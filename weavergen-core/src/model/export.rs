//! BPMN XML serialization of a process model, in the supported subset.
//!
//! Used for the round-trip property and for candidate models proposed by
//! the miner. Deterministic: node and flow order follow graph insertion
//! order, so parse → export → parse is structurally identical.

use crate::model::ir::*;
use crate::types::MergeRule;
use petgraph::visit::EdgeRef;
use std::fmt::Write;

const BPMN_NS: &str = "http://www.omg.org/spec/BPMN/20100524/MODEL";
const WEAVER_NS: &str = "http://weavergen.dev/schema/bpmn/1.0";

/// Escape XML attribute/text content.
fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

pub fn to_bpmn_xml(model: &ProcessModel) -> String {
    let mut xml = String::new();
    let _ = writeln!(xml, r#"<?xml version="1.0" encoding="UTF-8"?>"#);
    let _ = writeln!(
        xml,
        r#"<bpmn:definitions xmlns:bpmn="{BPMN_NS}" xmlns:weaver="{WEAVER_NS}" targetNamespace="http://weavergen.dev/bpmn">"#
    );
    let _ = writeln!(
        xml,
        r#"  <bpmn:process id="{}" name="{}" isExecutable="true">"#,
        escape_xml(&model.id),
        escape_xml(&model.name)
    );

    for idx in model.graph.node_indices() {
        match &model.graph[idx] {
            FlowNode::Start { id } => {
                let _ = writeln!(xml, r#"    <bpmn:startEvent id="{}" />"#, escape_xml(id));
            }
            FlowNode::End { id, error } => {
                if *error {
                    let _ = writeln!(xml, r#"    <bpmn:endEvent id="{}">"#, escape_xml(id));
                    let _ = writeln!(xml, r#"      <bpmn:errorEventDefinition />"#);
                    let _ = writeln!(xml, r#"    </bpmn:endEvent>"#);
                } else {
                    let _ = writeln!(xml, r#"    <bpmn:endEvent id="{}" />"#, escape_xml(id));
                }
            }
            FlowNode::ServiceTask { id, task } => {
                let _ = writeln!(
                    xml,
                    r#"    <bpmn:serviceTask id="{}" name="{}">"#,
                    escape_xml(id),
                    escape_xml(&task.name)
                );
                let _ = writeln!(xml, r#"      <bpmn:extensionElements>"#);
                let _ = writeln!(
                    xml,
                    r#"        <weaver:serviceTaskRef>{}</weaver:serviceTaskRef>"#,
                    escape_xml(&task.task_ref)
                );
                if let Some(retry) = &task.retry {
                    let retry_on: Vec<&str> =
                        retry.retry_on.iter().map(|k| k.as_str()).collect();
                    let _ = writeln!(
                        xml,
                        r#"        <weaver:retry maxAttempts="{}" backoff="{}" initialDelayMs="{}" maxDelayMs="{}" retryOn="{}" fallbackToMock="{}" />"#,
                        retry.max_attempts,
                        match retry.backoff {
                            crate::types::Backoff::Constant => "constant",
                            crate::types::Backoff::Exponential => "exponential",
                        },
                        retry.initial_delay.as_millis(),
                        retry.max_delay.as_millis(),
                        retry_on.join(","),
                        retry.fallback_to_mock
                    );
                }
                if let Some(timeout) = task.timeout {
                    let _ = writeln!(
                        xml,
                        r#"        <weaver:timeout ms="{}" />"#,
                        timeout.as_millis()
                    );
                }
                if let Some(handler) = &task.compensation {
                    let _ = writeln!(
                        xml,
                        r#"        <weaver:compensation handler="{}" />"#,
                        escape_xml(handler)
                    );
                }
                if !task.mockable {
                    let _ = writeln!(xml, r#"        <weaver:mockable>false</weaver:mockable>"#);
                }
                let _ = writeln!(xml, r#"      </bpmn:extensionElements>"#);
                let _ = writeln!(xml, r#"    </bpmn:serviceTask>"#);
            }
            FlowNode::ExclusiveGateway {
                id,
                name,
                default_flow,
            } => {
                let default_attr = default_flow
                    .as_ref()
                    .map(|d| format!(r#" default="{}""#, escape_xml(d)))
                    .unwrap_or_default();
                let _ = writeln!(
                    xml,
                    r#"    <bpmn:exclusiveGateway id="{}" name="{}"{} />"#,
                    escape_xml(id),
                    escape_xml(name),
                    default_attr
                );
            }
            FlowNode::ParallelGateway {
                id,
                name,
                direction,
            } => {
                let dir = match direction {
                    GatewayDirection::Diverging => "Diverging",
                    GatewayDirection::Converging => "Converging",
                };
                let _ = writeln!(
                    xml,
                    r#"    <bpmn:parallelGateway id="{}" name="{}" gatewayDirection="{}" />"#,
                    escape_xml(id),
                    escape_xml(name),
                    dir
                );
            }
            FlowNode::Boundary {
                id,
                attached_to,
                kind,
            } => {
                let _ = writeln!(
                    xml,
                    r#"    <bpmn:boundaryEvent id="{}" attachedToRef="{}">"#,
                    escape_xml(id),
                    escape_xml(attached_to)
                );
                match kind {
                    BoundaryKind::Timer { duration } => {
                        let _ = writeln!(xml, r#"      <bpmn:timerEventDefinition>"#);
                        let _ = writeln!(
                            xml,
                            r#"        <bpmn:timeDuration>PT{}S</bpmn:timeDuration>"#,
                            duration.as_secs_f64()
                        );
                        let _ = writeln!(xml, r#"      </bpmn:timerEventDefinition>"#);
                    }
                    BoundaryKind::Compensation => {
                        let _ = writeln!(xml, r#"      <bpmn:compensateEventDefinition />"#);
                    }
                }
                let _ = writeln!(xml, r#"    </bpmn:boundaryEvent>"#);
            }
        }
    }

    // Flows in declared order.
    let mut edges: Vec<_> = model.graph.edge_references().collect();
    edges.sort_by_key(|e| e.weight().order);
    for edge in edges {
        let flow = edge.weight();
        let source = model.graph[edge.source()].id();
        let target = model.graph[edge.target()].id();
        match &flow.condition {
            Some(cond) => {
                let _ = writeln!(
                    xml,
                    r#"    <bpmn:sequenceFlow id="{}" sourceRef="{}" targetRef="{}">"#,
                    escape_xml(&flow.id),
                    escape_xml(source),
                    escape_xml(target)
                );
                let _ = writeln!(
                    xml,
                    r#"      <bpmn:conditionExpression>{}</bpmn:conditionExpression>"#,
                    escape_xml(&cond.to_string())
                );
                let _ = writeln!(xml, r#"    </bpmn:sequenceFlow>"#);
            }
            None => {
                let _ = writeln!(
                    xml,
                    r#"    <bpmn:sequenceFlow id="{}" sourceRef="{}" targetRef="{}" />"#,
                    escape_xml(&flow.id),
                    escape_xml(source),
                    escape_xml(target)
                );
            }
        }
    }

    for (name, rule) in &model.data_objects {
        let rule = match rule {
            MergeRule::LastWriterWins => "last_writer_wins",
            MergeRule::AppendList => "append_list",
            MergeRule::NumericSum => "numeric_sum",
        };
        let _ = writeln!(
            xml,
            r#"    <bpmn:dataObjectReference id="do_{}" name="{}">"#,
            escape_xml(name),
            escape_xml(name)
        );
        let _ = writeln!(xml, r#"      <bpmn:extensionElements>"#);
        let _ = writeln!(
            xml,
            r#"        <weaver:mergeRule>{rule}</weaver:mergeRule>"#
        );
        let _ = writeln!(xml, r#"      </bpmn:extensionElements>"#);
        let _ = writeln!(xml, r#"    </bpmn:dataObjectReference>"#);
    }

    let _ = writeln!(xml, r#"  </bpmn:process>"#);
    let _ = write!(xml, r#"</bpmn:definitions>"#);
    xml
}
