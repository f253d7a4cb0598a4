//! BPMN 2.0 subset parser.
//!
//! Accepts both prefixed (`bpmn:serviceTask`) and default-namespace forms.
//! Only elements in the supported subset are accepted; anything else inside
//! the process produces `EngineError::UnsupportedConstructs` listing every
//! offending element — unknown nodes are never silently skipped.

use crate::error::{EngineError, EngineResult};
use crate::model::expr::Expr;
use crate::model::ir::*;
use crate::types::{Backoff, MergeRule, RetryPolicy};
use petgraph::graph::NodeIndex;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

/// Parse BPMN XML into a process model. Structural verification happens
/// separately; this rejects only malformed XML, out-of-subset elements,
/// and unparseable extensions.
pub fn parse_bpmn(xml: &str) -> EngineResult<ProcessModel> {
    let mut reader = Reader::from_str(xml);
    let mut builder = Builder::default();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => builder.open(e, false)?,
            Ok(Event::Empty(ref e)) => builder.open(e, true)?,
            Ok(Event::End(ref e)) => builder.close(&local_name(e.name().as_ref()))?,
            Ok(Event::Text(ref e)) => {
                if let Ok(text) = e.unescape() {
                    builder.text(text.trim());
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(EngineError::ParseProcess {
                    element: "<xml>".to_string(),
                    message: e.to_string(),
                })
            }
            _ => {}
        }
        buf.clear();
    }

    builder.finish()
}

// ─── Parser state ─────────────────────────────────────────────

#[derive(Debug)]
enum Element {
    ServiceTask {
        id: String,
        name: String,
        task_ref: Option<String>,
        retry: Option<RetryPolicy>,
        timeout: Option<Duration>,
        compensation: Option<String>,
        mockable: bool,
    },
    SequenceFlow {
        id: String,
        source: String,
        target: String,
        condition_text: Option<String>,
    },
    EndEvent {
        id: String,
        error: bool,
    },
    BoundaryEvent {
        id: String,
        attached_to: String,
        kind: Option<BoundaryKind>,
        timer_text: Option<String>,
    },
    DataObjectRef {
        name: String,
        rule: Option<MergeRule>,
    },
}

/// Extension child currently capturing text content.
#[derive(Clone, Copy, Debug, PartialEq)]
enum ExtText {
    ServiceTaskRef,
    MergeRule,
    Mockable,
}

struct PendingFlow {
    id: String,
    source: String,
    target: String,
    condition: Option<Expr>,
    order: u32,
}

#[derive(Default)]
struct Builder {
    process_id: String,
    process_name: String,
    in_process: bool,
    graph: ProcessGraph,
    node_map: HashMap<String, NodeIndex>,
    flows: Vec<PendingFlow>,
    flow_order: u32,
    data_objects: BTreeMap<String, MergeRule>,
    current: Option<Element>,
    in_extension: bool,
    in_condition: bool,
    in_time_duration: bool,
    ext_text: Option<ExtText>,
    /// Diverging/Converging resolved after edges exist when the attribute
    /// is absent.
    unresolved_parallel: Vec<String>,
    unsupported: Vec<String>,
}

/// Children tolerated inside supported elements: wiring and documentation,
/// not flow nodes.
const TOLERATED: &[&str] = &[
    "definitions",
    "documentation",
    "incoming",
    "outgoing",
    "dataObject",
    "dataObjectReference", // handled explicitly; listed for clarity
    "dataInputAssociation",
    "dataOutputAssociation",
    "sourceRef",
    "targetRef",
    "text",
];

impl Builder {
    fn open(&mut self, e: &BytesStart, is_empty: bool) -> EngineResult<()> {
        let local = local_name(e.name().as_ref());

        if self.in_extension {
            self.open_extension(&local, e)?;
            return Ok(());
        }

        match local.as_str() {
            "process" => {
                self.in_process = true;
                self.process_id = attr(e, "id").unwrap_or_else(|| "process".to_string());
                self.process_name = attr(e, "name").unwrap_or_default();
            }
            "startEvent" if self.in_process => {
                let id = req_attr(e, "id", "startEvent")?;
                self.add_node(FlowNode::Start { id });
            }
            "endEvent" if self.in_process => {
                let id = req_attr(e, "id", "endEvent")?;
                if is_empty {
                    self.add_node(FlowNode::End { id, error: false });
                } else {
                    self.current = Some(Element::EndEvent { id, error: false });
                }
            }
            "errorEventDefinition" => {
                if let Some(Element::EndEvent { error, .. }) = self.current.as_mut() {
                    *error = true;
                }
            }
            "serviceTask" if self.in_process => {
                let id = req_attr(e, "id", "serviceTask")?;
                let name = attr(e, "name").unwrap_or_default();
                let element = Element::ServiceTask {
                    id,
                    name,
                    task_ref: None,
                    retry: None,
                    timeout: None,
                    compensation: None,
                    mockable: true,
                };
                if is_empty {
                    self.current = Some(element);
                    self.finish_service_task()?;
                } else {
                    self.current = Some(element);
                }
            }
            "exclusiveGateway" if self.in_process => {
                let id = req_attr(e, "id", "exclusiveGateway")?;
                let name = attr(e, "name").unwrap_or_default();
                let default_flow = attr(e, "default");
                self.add_node(FlowNode::ExclusiveGateway {
                    id,
                    name,
                    default_flow,
                });
            }
            "parallelGateway" if self.in_process => {
                let id = req_attr(e, "id", "parallelGateway")?;
                let name = attr(e, "name").unwrap_or_default();
                let direction = match attr(e, "gatewayDirection").as_deref() {
                    Some("Converging") => Some(GatewayDirection::Converging),
                    Some("Diverging") => Some(GatewayDirection::Diverging),
                    _ => None,
                };
                if direction.is_none() {
                    self.unresolved_parallel.push(id.clone());
                }
                self.add_node(FlowNode::ParallelGateway {
                    id,
                    name,
                    direction: direction.unwrap_or(GatewayDirection::Diverging),
                });
            }
            "sequenceFlow" if self.in_process => {
                let id = req_attr(e, "id", "sequenceFlow")?;
                let source = req_attr(e, "sourceRef", "sequenceFlow")?;
                let target = req_attr(e, "targetRef", "sequenceFlow")?;
                if is_empty {
                    self.push_flow(id, source, target, None)?;
                } else {
                    self.current = Some(Element::SequenceFlow {
                        id,
                        source,
                        target,
                        condition_text: None,
                    });
                }
            }
            "conditionExpression" => {
                self.in_condition = true;
            }
            "boundaryEvent" if self.in_process => {
                let id = req_attr(e, "id", "boundaryEvent")?;
                let attached_to = req_attr(e, "attachedToRef", "boundaryEvent")?;
                let cancel = attr(e, "cancelActivity").unwrap_or_else(|| "true".to_string());
                if cancel == "false" {
                    self.unsupported
                        .push(format!("boundaryEvent[cancelActivity=false] (id={id})"));
                }
                self.current = Some(Element::BoundaryEvent {
                    id,
                    attached_to,
                    kind: None,
                    timer_text: None,
                });
            }
            "timerEventDefinition" => {
                // kind resolved when timeDuration text arrives
            }
            "timeDuration" => {
                self.in_time_duration = true;
            }
            "compensateEventDefinition" => {
                if let Some(Element::BoundaryEvent { kind, .. }) = self.current.as_mut() {
                    *kind = Some(BoundaryKind::Compensation);
                }
            }
            "dataObjectReference" if self.in_process => {
                let name = attr(e, "name")
                    .or_else(|| attr(e, "id"))
                    .unwrap_or_default();
                if is_empty {
                    // No declared merge rule: single-writer data object.
                    self.current = None;
                } else {
                    self.current = Some(Element::DataObjectRef { name, rule: None });
                }
            }
            "extensionElements" => {
                self.in_extension = true;
            }
            other if self.in_process => {
                if !TOLERATED.contains(&other) {
                    let id = attr(e, "id").unwrap_or_else(|| "?".to_string());
                    self.unsupported.push(format!("{other} (id={id})"));
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn open_extension(&mut self, local: &str, e: &BytesStart) -> EngineResult<()> {
        match local {
            "serviceTaskRef" => self.ext_text = Some(ExtText::ServiceTaskRef),
            "mergeRule" => self.ext_text = Some(ExtText::MergeRule),
            "mockable" => self.ext_text = Some(ExtText::Mockable),
            "retry" => {
                if let Some(Element::ServiceTask { id, retry, .. }) = self.current.as_mut() {
                    let id = id.clone();
                    *retry = Some(parse_retry(e, &id)?);
                }
            }
            "timeout" => {
                if let Some(Element::ServiceTask { id, timeout, .. }) = self.current.as_mut() {
                    let ms: u64 = attr(e, "ms")
                        .and_then(|v| v.parse().ok())
                        .ok_or_else(|| EngineError::ParseProcess {
                            element: id.clone(),
                            message: "timeout extension requires integer 'ms'".to_string(),
                        })?;
                    *timeout = Some(Duration::from_millis(ms));
                }
            }
            "compensation" => {
                if let Some(Element::ServiceTask { compensation, .. }) = self.current.as_mut() {
                    *compensation = attr(e, "handler");
                }
            }
            // Foreign vendor extensions are tolerated.
            _ => {}
        }
        Ok(())
    }

    fn text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if self.in_condition {
            if let Some(Element::SequenceFlow { condition_text, .. }) = self.current.as_mut() {
                *condition_text = Some(text.to_string());
            }
            return;
        }
        if self.in_time_duration {
            if let Some(Element::BoundaryEvent { timer_text, .. }) = self.current.as_mut() {
                *timer_text = Some(text.to_string());
            }
            return;
        }
        match self.ext_text {
            Some(ExtText::ServiceTaskRef) => {
                if let Some(Element::ServiceTask { task_ref, .. }) = self.current.as_mut() {
                    *task_ref = Some(text.to_string());
                }
            }
            Some(ExtText::MergeRule) => {
                if let Some(Element::DataObjectRef { rule, .. }) = self.current.as_mut() {
                    *rule = MergeRule::parse(text);
                }
            }
            Some(ExtText::Mockable) => {
                if let Some(Element::ServiceTask { mockable, .. }) = self.current.as_mut() {
                    *mockable = text != "false";
                }
            }
            None => {}
        }
    }

    fn close(&mut self, local: &str) -> EngineResult<()> {
        match local {
            "process" => self.in_process = false,
            "extensionElements" => self.in_extension = false,
            "conditionExpression" => self.in_condition = false,
            "timeDuration" => self.in_time_duration = false,
            "serviceTaskRef" | "mergeRule" | "mockable" => self.ext_text = None,
            "serviceTask" => self.finish_service_task()?,
            "endEvent" => {
                if let Some(Element::EndEvent { id, error }) = self.current.take() {
                    self.add_node(FlowNode::End { id, error });
                }
            }
            "sequenceFlow" => {
                if let Some(Element::SequenceFlow {
                    id,
                    source,
                    target,
                    condition_text,
                }) = self.current.take()
                {
                    let condition = match condition_text {
                        Some(text) => Some(Expr::parse(&text).map_err(|message| {
                            EngineError::ParseProcess {
                                element: id.clone(),
                                message,
                            }
                        })?),
                        None => None,
                    };
                    self.push_flow(id, source, target, condition)?;
                }
            }
            "boundaryEvent" => {
                if let Some(Element::BoundaryEvent {
                    id,
                    attached_to,
                    kind,
                    timer_text,
                }) = self.current.take()
                {
                    let kind = match (kind, timer_text) {
                        (Some(k), _) => k,
                        (None, Some(text)) => {
                            let duration = parse_iso8601_duration(&text).ok_or_else(|| {
                                EngineError::ParseProcess {
                                    element: id.clone(),
                                    message: format!("unparseable timer duration '{text}'"),
                                }
                            })?;
                            BoundaryKind::Timer { duration }
                        }
                        (None, None) => {
                            return Err(EngineError::ParseProcess {
                                element: id,
                                message: "boundaryEvent needs a timer or compensation definition"
                                    .to_string(),
                            })
                        }
                    };
                    self.add_node(FlowNode::Boundary {
                        id,
                        attached_to,
                        kind,
                    });
                }
            }
            "dataObjectReference" => {
                if let Some(Element::DataObjectRef { name, rule }) = self.current.take() {
                    if let Some(rule) = rule {
                        self.data_objects.insert(name, rule);
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn finish_service_task(&mut self) -> EngineResult<()> {
        if let Some(Element::ServiceTask {
            id,
            name,
            task_ref,
            retry,
            timeout,
            compensation,
            mockable,
        }) = self.current.take()
        {
            let task_ref = task_ref.ok_or_else(|| EngineError::ParseProcess {
                element: id.clone(),
                message: "serviceTask is missing the serviceTaskRef extension".to_string(),
            })?;
            if let Some(policy) = &retry {
                policy.validate().map_err(|message| EngineError::ParseProcess {
                    element: id.clone(),
                    message,
                })?;
            }
            self.add_node(FlowNode::ServiceTask {
                id,
                task: TaskNode {
                    task_ref,
                    name,
                    retry,
                    timeout,
                    compensation,
                    mockable,
                },
            });
        }
        Ok(())
    }

    fn add_node(&mut self, node: FlowNode) {
        let id = node.id().to_string();
        let idx = self.graph.add_node(node);
        self.node_map.insert(id, idx);
    }

    fn push_flow(
        &mut self,
        id: String,
        source: String,
        target: String,
        condition: Option<Expr>,
    ) -> EngineResult<()> {
        let order = self.flow_order;
        self.flow_order += 1;
        self.flows.push(PendingFlow {
            id,
            source,
            target,
            condition,
            order,
        });
        Ok(())
    }

    fn finish(mut self) -> EngineResult<ProcessModel> {
        if !self.unsupported.is_empty() {
            return Err(EngineError::UnsupportedConstructs(self.unsupported));
        }

        for flow in std::mem::take(&mut self.flows) {
            let from = *self.node_map.get(&flow.source).ok_or_else(|| {
                EngineError::ParseProcess {
                    element: flow.id.clone(),
                    message: format!("sequenceFlow references unknown sourceRef '{}'", flow.source),
                }
            })?;
            let to = *self.node_map.get(&flow.target).ok_or_else(|| {
                EngineError::ParseProcess {
                    element: flow.id.clone(),
                    message: format!("sequenceFlow references unknown targetRef '{}'", flow.target),
                }
            })?;
            self.graph.add_edge(
                from,
                to,
                SequenceFlow {
                    id: flow.id,
                    order: flow.order,
                    condition: flow.condition,
                },
            );
        }

        // Resolve parallel-gateway direction from degree when the attribute
        // was absent: more than one outgoing edge means a split.
        let unresolved: BTreeSet<String> = self.unresolved_parallel.drain(..).collect();
        for idx in self.graph.node_indices() {
            let out_degree = self
                .graph
                .edges_directed(idx, petgraph::Direction::Outgoing)
                .count();
            if let FlowNode::ParallelGateway { id, direction, .. } = &mut self.graph[idx] {
                if unresolved.contains(id) {
                    *direction = if out_degree > 1 {
                        GatewayDirection::Diverging
                    } else {
                        GatewayDirection::Converging
                    };
                }
            }
        }

        Ok(ProcessModel {
            id: self.process_id,
            name: self.process_name,
            graph: self.graph,
            data_objects: self.data_objects,
            parallel_pairs: BTreeMap::new(),
        })
    }
}

// ─── Attribute & duration helpers ─────────────────────────────

fn local_name(raw: &[u8]) -> String {
    let name = match raw.iter().rposition(|&b| b == b':') {
        Some(pos) => &raw[pos + 1..],
        None => raw,
    };
    String::from_utf8_lossy(name).into_owned()
}

fn attr(e: &BytesStart, name: &str) -> Option<String> {
    e.attributes().flatten().find_map(|a| {
        if local_name(a.key.as_ref()) == name {
            a.unescape_value().ok().map(|v| v.into_owned())
        } else {
            None
        }
    })
}

fn req_attr(e: &BytesStart, name: &str, element_kind: &str) -> EngineResult<String> {
    attr(e, name).ok_or_else(|| EngineError::ParseProcess {
        element: element_kind.to_string(),
        message: format!("missing required attribute '{name}'"),
    })
}

fn parse_retry(e: &BytesStart, element: &str) -> EngineResult<RetryPolicy> {
    let bad = |message: String| EngineError::ParseProcess {
        element: element.to_string(),
        message,
    };
    let mut policy = RetryPolicy::default();
    if let Some(v) = attr(e, "maxAttempts") {
        policy.max_attempts = v
            .parse()
            .map_err(|_| bad(format!("bad maxAttempts '{v}'")))?;
    }
    if let Some(v) = attr(e, "backoff") {
        policy.backoff = match v.as_str() {
            "constant" => Backoff::Constant,
            "exponential" => Backoff::Exponential,
            _ => return Err(bad(format!("bad backoff '{v}'"))),
        };
    }
    if let Some(v) = attr(e, "initialDelayMs") {
        let ms: u64 = v
            .parse()
            .map_err(|_| bad(format!("bad initialDelayMs '{v}'")))?;
        policy.initial_delay = Duration::from_millis(ms);
    }
    if let Some(v) = attr(e, "maxDelayMs") {
        let ms: u64 = v.parse().map_err(|_| bad(format!("bad maxDelayMs '{v}'")))?;
        policy.max_delay = Duration::from_millis(ms);
    }
    if let Some(v) = attr(e, "retryOn") {
        policy.retry_on = v
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.parse().map_err(|message: String| bad(message)))
            .collect::<EngineResult<_>>()?;
    }
    if let Some(v) = attr(e, "fallbackToMock") {
        policy.fallback_to_mock = v
            .parse()
            .map_err(|_| bad(format!("bad fallbackToMock '{v}'")))?;
    }
    Ok(policy)
}

/// ISO 8601 duration subset: `PnDTnHnMnS` with an optional fractional
/// seconds component (`PT0.5S`).
pub fn parse_iso8601_duration(text: &str) -> Option<Duration> {
    let rest = text.strip_prefix('P')?;
    let (date_part, time_part) = match rest.split_once('T') {
        Some((d, t)) => (d, t),
        None => (rest, ""),
    };

    let mut total = Duration::ZERO;
    let mut number = String::new();
    for c in date_part.chars() {
        if c.is_ascii_digit() {
            number.push(c);
        } else if c == 'D' {
            let days: u64 = number.parse().ok()?;
            total += Duration::from_secs(days * 86_400);
            number.clear();
        } else {
            return None;
        }
    }
    if !number.is_empty() {
        return None;
    }
    for c in time_part.chars() {
        if c.is_ascii_digit() || c == '.' {
            number.push(c);
        } else {
            let value: f64 = number.parse().ok()?;
            number.clear();
            total += match c {
                'H' => Duration::from_secs_f64(value * 3600.0),
                'M' => Duration::from_secs_f64(value * 60.0),
                'S' => Duration::from_secs_f64(value),
                _ => return None,
            };
        }
    }
    if !number.is_empty() {
        return None;
    }
    Some(total)
}
