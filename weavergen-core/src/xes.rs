//! XES (eXtensible Event Stream) export of a run's span set, and a
//! minimal reader for trace archives consumed by the miner.
//!
//! One trace per run (`concept:name` = run id); one event per task span
//! (`concept:name` = task id, `time:timestamp` ISO-8601), carrying the
//! same semantic attributes as the spans.

use crate::error::{EngineError, EngineResult};
use crate::recorder::{SpanRecord, SpanStatus};
use chrono::{TimeZone, Utc};
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use std::fmt::Write;

fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

fn iso8601(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
        .unwrap_or_else(|| "1970-01-01T00:00:00.000Z".to_string())
}

const HEADER: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<log xes.version="2.0" xes.features="nested-attributes">
  <extension name="Concept" prefix="concept" uri="http://www.xes-standard.org/concept.xesext"/>
  <extension name="Time" prefix="time" uri="http://www.xes-standard.org/time.xesext"/>
  <extension name="Lifecycle" prefix="lifecycle" uri="http://www.xes-standard.org/lifecycle.xesext"/>
  <classifier name="Activity" keys="concept:name"/>
"#;

/// Export one run's task spans as a single-trace XES document.
pub fn export_spans(run_id: &str, spans: &[SpanRecord]) -> String {
    let mut xml = String::from(HEADER);
    let _ = writeln!(xml, "  <trace>");
    let _ = writeln!(
        xml,
        r#"    <string key="concept:name" value="{}"/>"#,
        escape_xml(run_id)
    );

    let mut task_spans: Vec<&SpanRecord> = spans.iter().filter(|s| s.task_id.is_some()).collect();
    task_spans.sort_by_key(|s| s.start_seq);

    for span in task_spans {
        let task_id = span.task_id.as_deref().unwrap_or_default();
        let lifecycle = match span.status {
            SpanStatus::Ok => "complete",
            SpanStatus::Cancelled => "ate_abort",
            _ => "pi_abort",
        };
        let _ = writeln!(xml, "    <event>");
        let _ = writeln!(
            xml,
            r#"      <string key="concept:name" value="{}"/>"#,
            escape_xml(task_id)
        );
        let _ = writeln!(
            xml,
            r#"      <string key="lifecycle:transition" value="{lifecycle}"/>"#
        );
        let _ = writeln!(
            xml,
            r#"      <date key="time:timestamp" value="{}"/>"#,
            iso8601(span.end_time.unwrap_or(span.start_time))
        );
        for key in ["semantic.group.id", "semantic.operation"] {
            if let Some(value) = span.attr(key).and_then(|v| v.as_str().map(str::to_string)) {
                let _ = writeln!(
                    xml,
                    r#"      <string key="{key}" value="{}"/>"#,
                    escape_xml(&value)
                );
            }
        }
        if let Some(ms) = span.duration_ms() {
            let _ = writeln!(xml, r#"      <int key="duration.ms" value="{ms}"/>"#);
        }
        let _ = writeln!(xml, "    </event>");
    }

    let _ = writeln!(xml, "  </trace>");
    let _ = write!(xml, "</log>");
    xml
}

/// One archived trace: run id plus the ordered task ids.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchivedTrace {
    pub run_id: String,
    pub tasks: Vec<String>,
}

/// Read traces back out of an XES document (the miner's input format).
pub fn read_traces(xml: &str) -> EngineResult<Vec<ArchivedTrace>> {
    let mut reader = Reader::from_str(xml);
    let mut buf = Vec::new();
    let mut traces = Vec::new();
    let mut current: Option<ArchivedTrace> = None;
    let mut in_event = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                let local = local_name(e.name().as_ref());
                match local.as_str() {
                    "trace" => {
                        current = Some(ArchivedTrace {
                            run_id: String::new(),
                            tasks: Vec::new(),
                        });
                        in_event = false;
                    }
                    "event" => in_event = true,
                    "string" => {
                        let key = attr(e, "key");
                        let value = attr(e, "value");
                        if let (Some(key), Some(value), Some(trace)) =
                            (key, value, current.as_mut())
                        {
                            if key == "concept:name" {
                                if in_event {
                                    trace.tasks.push(value);
                                } else {
                                    trace.run_id = value;
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::End(ref e)) => {
                let local = local_name(e.name().as_ref());
                match local.as_str() {
                    "event" => in_event = false,
                    "trace" => {
                        if let Some(trace) = current.take() {
                            traces.push(trace);
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(EngineError::ParseProcess {
                    element: "<xes>".to_string(),
                    message: e.to_string(),
                })
            }
            _ => {}
        }
        buf.clear();
    }
    Ok(traces)
}

fn local_name(raw: &[u8]) -> String {
    let name = match raw.iter().rposition(|&b| b == b':') {
        Some(pos) => &raw[pos + 1..],
        None => raw,
    };
    String::from_utf8_lossy(name).into_owned()
}

fn attr(e: &quick_xml::events::BytesStart, name: &str) -> Option<String> {
    e.attributes().flatten().find_map(|a| {
        if local_name(a.key.as_ref()) == name {
            a.unescape_value().ok().map(|v| v.into_owned())
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn task_span(task: &str, seq: u64) -> SpanRecord {
        SpanRecord {
            name: task.to_string(),
            task_id: Some(task.to_string()),
            run_id: Uuid::nil(),
            trace_id: Uuid::nil(),
            span_id: seq,
            parent_span_id: None,
            start_time: 1_700_000_000_000,
            end_time: Some(1_700_000_000_050),
            status: SpanStatus::Ok,
            attributes: BTreeMap::from([(
                "semantic.operation".to_string(),
                Value::Str(task.to_string()),
            )]),
            start_seq: seq,
            end_seq: Some(seq + 100),
        }
    }

    #[test]
    fn export_then_read_recovers_task_order() {
        let spans = vec![task_span("load", 1), task_span("validate", 2), task_span("generate", 3)];
        let xml = export_spans("run-1", &spans);
        let traces = read_traces(&xml).unwrap();
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].run_id, "run-1");
        assert_eq!(traces[0].tasks, vec!["load", "validate", "generate"]);
    }

    #[test]
    fn non_task_spans_are_excluded() {
        let mut gateway = task_span("split", 2);
        gateway.task_id = None;
        let spans = vec![task_span("load", 1), gateway];
        let xml = export_spans("run-2", &spans);
        let traces = read_traces(&xml).unwrap();
        assert_eq!(traces[0].tasks, vec!["load"]);
    }
}
