//! Span recorder: thread-safe, append-only buffer of span records.
//!
//! Spans are the authoritative execution record; the quality scorer and
//! truth validator read nothing else. Every `start_span` must be matched
//! by exactly one `end_span`; the imbalance check runs when the run
//! closes and fails it with `ErrSpanLifecycle`.

use crate::error::{EngineError, EngineResult};
use crate::truth::Claim;
use crate::types::{now_ms, SpanId, Timestamp, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Terminal status of a span. `Unset` only while the span is open.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SpanStatus {
    Unset,
    Ok,
    Error,
    Cancelled,
}

/// One structured span record emitted by the engine or a task.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SpanRecord {
    pub name: String,
    pub task_id: Option<String>,
    pub run_id: Uuid,
    pub trace_id: Uuid,
    pub span_id: SpanId,
    pub parent_span_id: Option<SpanId>,
    pub start_time: Timestamp,
    pub end_time: Option<Timestamp>,
    pub status: SpanStatus,
    pub attributes: BTreeMap<String, Value>,
    /// Monotonic ordering within the run; survives equal wall-clock stamps.
    pub start_seq: u64,
    pub end_seq: Option<u64>,
}

impl SpanRecord {
    pub fn duration_ms(&self) -> Option<i64> {
        self.end_time.map(|end| end - self.start_time)
    }

    pub fn attr(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    pub fn attr_is_true(&self, key: &str) -> bool {
        matches!(self.attributes.get(key), Some(Value::Bool(true)))
    }
}

/// A context-mutation event, recorded by `ExecutionContext::set` with
/// writer attribution. The truth validator checks these against declared
/// outputs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MutationRecord {
    pub key: String,
    pub writer: String,
    pub at: Timestamp,
}

struct Inner {
    spans: Vec<SpanRecord>,
    index: HashMap<SpanId, usize>,
    next_id: SpanId,
    seq: u64,
    mutations: Vec<MutationRecord>,
    claims: Vec<Claim>,
}

/// Append-only span buffer for one run. Internally serialized; handles are
/// cheap to clone and safe to use from concurrent branches.
pub struct SpanRecorder {
    run_id: Uuid,
    trace_id: Uuid,
    inner: Mutex<Inner>,
}

impl SpanRecorder {
    pub fn new(run_id: Uuid, trace_id: Uuid) -> Arc<Self> {
        Arc::new(SpanRecorder {
            run_id,
            trace_id,
            inner: Mutex::new(Inner {
                spans: Vec::new(),
                index: HashMap::new(),
                next_id: 1,
                seq: 0,
                mutations: Vec::new(),
                claims: Vec::new(),
            }),
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn trace_id(&self) -> Uuid {
        self.trace_id
    }

    pub fn start_span(&self, name: &str, parent: Option<SpanId>) -> SpanId {
        self.start_span_inner(name, None, parent)
    }

    pub fn start_task_span(&self, name: &str, task_id: &str, parent: Option<SpanId>) -> SpanId {
        self.start_span_inner(name, Some(task_id.to_string()), parent)
    }

    fn start_span_inner(&self, name: &str, task_id: Option<String>, parent: Option<SpanId>) -> SpanId {
        let mut inner = self.lock();
        let span_id = inner.next_id;
        inner.next_id += 1;
        inner.seq += 1;
        let record = SpanRecord {
            name: name.to_string(),
            task_id,
            run_id: self.run_id,
            trace_id: self.trace_id,
            span_id,
            parent_span_id: parent,
            start_time: now_ms(),
            end_time: None,
            status: SpanStatus::Unset,
            attributes: BTreeMap::new(),
            start_seq: inner.seq,
            end_seq: None,
        };
        let pos = inner.spans.len();
        inner.spans.push(record);
        inner.index.insert(span_id, pos);
        span_id
    }

    pub fn set_attribute(&self, span: SpanId, key: &str, value: Value) {
        let mut inner = self.lock();
        if let Some(&pos) = inner.index.get(&span) {
            inner.spans[pos].attributes.insert(key.to_string(), value);
        }
    }

    /// Set an attribute only if the span does not already carry it; used
    /// where handlers may override engine defaults.
    pub fn set_attribute_if_absent(&self, span: SpanId, key: &str, value: Value) {
        let mut inner = self.lock();
        if let Some(&pos) = inner.index.get(&span) {
            inner.spans[pos]
                .attributes
                .entry(key.to_string())
                .or_insert(value);
        }
    }

    pub fn end_span(&self, span: SpanId, status: SpanStatus) {
        let mut inner = self.lock();
        inner.seq += 1;
        let seq = inner.seq;
        if let Some(&pos) = inner.index.get(&span) {
            let record = &mut inner.spans[pos];
            if record.end_time.is_some() {
                tracing::warn!(span, "span ended twice; second end ignored");
                return;
            }
            record.end_time = Some(now_ms());
            record.end_seq = Some(seq);
            record.status = status;
        }
    }

    pub fn record_mutation(&self, key: &str, writer: &str) {
        self.lock().mutations.push(MutationRecord {
            key: key.to_string(),
            writer: writer.to_string(),
            at: now_ms(),
        });
    }

    pub fn add_claim(&self, claim: Claim) {
        self.lock().claims.push(claim);
    }

    pub fn open_count(&self) -> usize {
        self.lock().spans.iter().filter(|s| s.end_time.is_none()).count()
    }

    /// Close every still-open span with the given status. Used after the
    /// cancellation grace period expires.
    pub fn force_close_open(&self, status: SpanStatus) -> usize {
        let mut inner = self.lock();
        inner.seq += 1;
        let seq = inner.seq;
        let now = now_ms();
        let mut closed = 0;
        for record in inner.spans.iter_mut().filter(|s| s.end_time.is_none()) {
            record.end_time = Some(now);
            record.end_seq = Some(seq);
            record.status = status;
            closed += 1;
        }
        closed
    }

    /// Close every open descendant of `root` with the given status. Used
    /// when a handler is dropped mid-flight (timeout, expired grace) and
    /// can no longer close its own child spans.
    pub fn close_open_descendants(&self, root: SpanId, status: SpanStatus) -> usize {
        let mut inner = self.lock();
        inner.seq += 1;
        let seq = inner.seq;
        let now = now_ms();

        let parents: HashMap<SpanId, Option<SpanId>> = inner
            .spans
            .iter()
            .map(|s| (s.span_id, s.parent_span_id))
            .collect();
        let descends = |mut id: SpanId| -> bool {
            while let Some(Some(parent)) = parents.get(&id) {
                if *parent == root {
                    return true;
                }
                id = *parent;
            }
            false
        };

        let mut closed = 0;
        for record in inner.spans.iter_mut() {
            if record.end_time.is_none() && record.span_id != root && descends(record.span_id) {
                record.end_time = Some(now);
                record.end_seq = Some(seq);
                record.status = status;
                closed += 1;
            }
        }
        closed
    }

    pub fn snapshot(&self) -> Vec<SpanRecord> {
        self.lock().spans.clone()
    }

    pub fn mutations(&self) -> Vec<MutationRecord> {
        self.lock().mutations.clone()
    }

    pub fn claims(&self) -> Vec<Claim> {
        self.lock().claims.clone()
    }

    /// Lifecycle check at run end: every span must be closed.
    pub fn check_balanced(&self) -> EngineResult<()> {
        let open = self.open_count();
        if open == 0 {
            Ok(())
        } else {
            Err(EngineError::SpanLifecycle(open))
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned recorder means a panicked handler thread; the spans
        // gathered so far are still the best available record.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Handle to one open span, passed into handlers. Carries the run's
/// cancellation token so cooperative handlers can observe it at their
/// suspension points.
#[derive(Clone)]
pub struct SpanHandle {
    recorder: Arc<SpanRecorder>,
    span_id: SpanId,
    cancel: CancellationToken,
}

impl SpanHandle {
    pub fn new(recorder: Arc<SpanRecorder>, span_id: SpanId, cancel: CancellationToken) -> Self {
        SpanHandle {
            recorder,
            span_id,
            cancel,
        }
    }

    pub fn id(&self) -> SpanId {
        self.span_id
    }

    pub fn set_attribute(&self, key: &str, value: impl Into<Value>) {
        self.recorder.set_attribute(self.span_id, key, value.into());
    }

    /// Record a declarative claim for post-run truth validation.
    pub fn record_claim(&self, claim: Claim) {
        self.recorder.add_claim(claim);
    }

    /// Start a child span. The creator owns its lifecycle; an unclosed
    /// child fails the run at end-time.
    pub fn child(&self, name: &str) -> SpanHandle {
        let id = self.recorder.start_span(name, Some(self.span_id));
        SpanHandle {
            recorder: Arc::clone(&self.recorder),
            span_id: id,
            cancel: self.cancel.clone(),
        }
    }

    pub fn end(&self, status: SpanStatus) {
        self.recorder.end_span(self.span_id, status);
    }

    /// The run's cancellation token; handlers must observe it at
    /// suspension points.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
