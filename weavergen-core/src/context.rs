//! Execution context: the typed key/value state carried through a run.
//!
//! The context is owned by the run. Parallel branches fork a shallow
//! snapshot and write copy-on-write; the join reconciles multi-branch
//! writes through each data object's declared merge rule. Handlers never
//! see the context directly — they get a read-only `ContextView` and
//! return their writes as declared outputs, which the interpreter applies
//! (and records) on their behalf.

use crate::error::{EngineError, EngineResult};
use crate::types::{now_ms, MergeRule, Timestamp, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// One stored value with writer attribution, used for merge decisions.
#[derive(Clone, Debug)]
pub struct Slot {
    pub value: Value,
    pub writer: Option<String>,
    pub at: Timestamp,
}

/// The run-scoped mutable state bag.
pub struct ExecutionContext {
    pub run_id: Uuid,
    pub trace_id: Uuid,
    slots: BTreeMap<String, Slot>,
    merge_rules: BTreeMap<String, MergeRule>,
}

impl ExecutionContext {
    pub fn new(
        run_id: Uuid,
        trace_id: Uuid,
        initial: BTreeMap<String, Value>,
        merge_rules: BTreeMap<String, MergeRule>,
    ) -> Self {
        let at = now_ms();
        let slots = initial
            .into_iter()
            .map(|(k, value)| {
                (
                    k,
                    Slot {
                        value,
                        writer: None,
                        at,
                    },
                )
            })
            .collect();
        ExecutionContext {
            run_id,
            trace_id,
            slots,
            merge_rules,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.slots.get(key).map(|s| &s.value)
    }

    pub fn set(&mut self, key: &str, value: Value, writer: Option<&str>) {
        self.slots.insert(
            key.to_string(),
            Slot {
                value,
                writer: writer.map(str::to_string),
                at: now_ms(),
            },
        );
    }

    pub fn merge_rules(&self) -> &BTreeMap<String, MergeRule> {
        &self.merge_rules
    }

    /// Immutable snapshot used when a parallel branch forks.
    pub fn snapshot(&self) -> Arc<BTreeMap<String, Slot>> {
        Arc::new(self.slots.clone())
    }

    pub fn fork(&self, branch_index: usize) -> BranchView {
        BranchView {
            base: self.snapshot(),
            writes: BTreeMap::new(),
            branch_index,
        }
    }

    /// Deterministic join into the root context: adopt single-branch
    /// writes, reconcile multi-branch writes by declared rule, fail on any
    /// conflicting key without a rule.
    pub fn merge(&mut self, branches: Vec<BranchView>, join_id: &str) -> EngineResult<()> {
        let reconciled = reconcile_views(branches, &self.merge_rules, join_id)?;
        for (key, slot) in reconciled {
            self.slots.insert(key, slot);
        }
        Ok(())
    }

    /// Final key/value view, for the run report.
    pub fn into_values(self) -> BTreeMap<String, Value> {
        self.slots
            .into_iter()
            .map(|(k, slot)| (k, slot.value))
            .collect()
    }

    pub fn values(&self) -> BTreeMap<String, Value> {
        self.slots
            .iter()
            .map(|(k, slot)| (k.clone(), slot.value.clone()))
            .collect()
    }
}

/// Copy-on-write view for one parallel branch: reads fall through to the
/// fork snapshot, writes stay branch-local until the join merges them.
#[derive(Clone, Debug)]
pub struct BranchView {
    base: Arc<BTreeMap<String, Slot>>,
    writes: BTreeMap<String, Slot>,
    pub branch_index: usize,
}

impl BranchView {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.writes
            .get(key)
            .or_else(|| self.base.get(key))
            .map(|s| &s.value)
    }

    pub fn set(&mut self, key: &str, value: Value, writer: Option<&str>) {
        self.writes.insert(
            key.to_string(),
            Slot {
                value,
                writer: writer.map(str::to_string),
                at: now_ms(),
            },
        );
    }

    /// Fork a nested branch from this view's current visible state.
    pub fn fork(&self, branch_index: usize) -> BranchView {
        let mut base = (*self.base).clone();
        for (k, slot) in &self.writes {
            base.insert(k.clone(), slot.clone());
        }
        BranchView {
            base: Arc::new(base),
            writes: BTreeMap::new(),
            branch_index,
        }
    }

    /// Absorb reconciled writes from a nested join into this branch.
    pub fn absorb(&mut self, writes: BTreeMap<String, Slot>) {
        for (k, slot) in writes {
            self.writes.insert(k, slot);
        }
    }

    pub fn writes(&self) -> &BTreeMap<String, Slot> {
        &self.writes
    }

    pub fn visible(&self) -> BTreeMap<String, Value> {
        let mut out: BTreeMap<String, Value> = self
            .base
            .iter()
            .map(|(k, s)| (k.clone(), s.value.clone()))
            .collect();
        for (k, s) in &self.writes {
            out.insert(k.clone(), s.value.clone());
        }
        out
    }
}

/// Reconcile branch views into a single write set per the declared merge
/// rules. Shared by the root-context merge and nested parallel joins.
pub fn reconcile_views(
    branches: Vec<BranchView>,
    rules: &BTreeMap<String, MergeRule>,
    join_id: &str,
) -> EngineResult<BTreeMap<String, Slot>> {
    let mut writes_per_key: BTreeMap<String, Vec<(usize, Slot)>> = BTreeMap::new();
    for branch in branches {
        let index = branch.branch_index;
        for (key, slot) in branch.writes {
            writes_per_key.entry(key).or_default().push((index, slot));
        }
    }

    let mut out = BTreeMap::new();
    for (key, mut writes) in writes_per_key {
        writes.sort_by_key(|(index, _)| *index);
        let merged = if writes.len() == 1 {
            writes.pop().map(|(_, slot)| slot)
        } else {
            match rules.get(&key) {
                None => {
                    return Err(EngineError::ContextMergeConflict {
                        key,
                        join: join_id.to_string(),
                    })
                }
                Some(MergeRule::LastWriterWins) => writes
                    .into_iter()
                    .max_by_key(|(index, slot)| (slot.at, *index))
                    .map(|(_, slot)| slot),
                Some(MergeRule::AppendList) => {
                    let mut items = Vec::new();
                    let mut last: Option<Slot> = None;
                    for (_, slot) in writes {
                        match &slot.value {
                            Value::List(vs) => items.extend(vs.clone()),
                            other => items.push(other.clone()),
                        }
                        last = Some(slot);
                    }
                    last.map(|slot| Slot {
                        value: Value::List(items),
                        ..slot
                    })
                }
                Some(MergeRule::NumericSum) => {
                    let mut int_sum: i64 = 0;
                    let mut float_sum: f64 = 0.0;
                    let mut any_float = false;
                    let mut last: Option<Slot> = None;
                    for (_, slot) in writes {
                        match &slot.value {
                            Value::Int(n) => int_sum += n,
                            Value::Float(f) => {
                                float_sum += f;
                                any_float = true;
                            }
                            _ => {
                                return Err(EngineError::ContextMergeConflict {
                                    key,
                                    join: join_id.to_string(),
                                });
                            }
                        }
                        last = Some(slot);
                    }
                    let value = if any_float {
                        Value::Float(float_sum + int_sum as f64)
                    } else {
                        Value::Int(int_sum)
                    };
                    last.map(|slot| Slot { value, ..slot })
                }
            }
        };
        if let Some(slot) = merged {
            out.insert(key, slot);
        }
    }
    Ok(out)
}

/// Read-only view handed to handlers. Records which keys the handler
/// actually read so the truth validator can flag undeclared reads; the
/// read set is shared across clones so the engine can inspect it after
/// the handler consumed its copy.
#[derive(Clone)]
pub struct ContextView {
    run_id: Uuid,
    trace_id: Uuid,
    data: Arc<BTreeMap<String, Value>>,
    reads: Arc<Mutex<BTreeSet<String>>>,
}

impl ContextView {
    pub fn new(run_id: Uuid, trace_id: Uuid, data: BTreeMap<String, Value>) -> Self {
        ContextView {
            run_id,
            trace_id,
            data: Arc::new(data),
            reads: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn trace_id(&self) -> Uuid {
        self.trace_id
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        if let Ok(mut reads) = self.reads.lock() {
            reads.insert(key.to_string());
        }
        self.data.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Keys the handler read through this view.
    pub fn observed_reads(&self) -> BTreeSet<String> {
        self.reads.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_with_rules(rules: &[(&str, MergeRule)]) -> ExecutionContext {
        ExecutionContext::new(
            Uuid::now_v7(),
            Uuid::now_v7(),
            BTreeMap::new(),
            rules.iter().map(|(k, r)| (k.to_string(), *r)).collect(),
        )
    }

    #[test]
    fn single_branch_writes_are_adopted() {
        let mut ctx = ctx_with_rules(&[]);
        let mut a = ctx.fork(0);
        let b = ctx.fork(1);
        a.set("result", Value::Int(7), Some("task_a"));
        ctx.merge(vec![a, b], "join").unwrap();
        assert_eq!(ctx.get("result"), Some(&Value::Int(7)));
    }

    #[test]
    fn conflicting_writes_without_rule_fail() {
        let mut ctx = ctx_with_rules(&[]);
        let mut a = ctx.fork(0);
        let mut b = ctx.fork(1);
        a.set(
            "generated_files",
            Value::List(vec![Value::Str("a.rs".into())]),
            Some("gen_a"),
        );
        b.set(
            "generated_files",
            Value::List(vec![Value::Str("b.rs".into())]),
            Some("gen_b"),
        );
        match ctx.merge(vec![a, b], "join") {
            Err(EngineError::ContextMergeConflict { key, join }) => {
                assert_eq!(key, "generated_files");
                assert_eq!(join, "join");
            }
            other => panic!("expected merge conflict, got {other:?}"),
        }
        // The unmerged key is absent from the context at failure.
        assert!(ctx.get("generated_files").is_none());
    }

    #[test]
    fn append_list_concatenates_in_branch_order() {
        let mut ctx = ctx_with_rules(&[("generated_files", MergeRule::AppendList)]);
        let mut a = ctx.fork(0);
        let mut b = ctx.fork(1);
        b.set(
            "generated_files",
            Value::List(vec![Value::Str("b.rs".into())]),
            Some("gen_b"),
        );
        a.set(
            "generated_files",
            Value::List(vec![Value::Str("a.rs".into())]),
            Some("gen_a"),
        );
        ctx.merge(vec![b, a], "join").unwrap();
        assert_eq!(
            ctx.get("generated_files"),
            Some(&Value::List(vec![
                Value::Str("a.rs".into()),
                Value::Str("b.rs".into())
            ]))
        );
    }

    #[test]
    fn numeric_sum_adds_across_branches() {
        let mut ctx = ctx_with_rules(&[("count", MergeRule::NumericSum)]);
        let mut a = ctx.fork(0);
        let mut b = ctx.fork(1);
        a.set("count", Value::Int(2), Some("a"));
        b.set("count", Value::Int(3), Some("b"));
        ctx.merge(vec![a, b], "join").unwrap();
        assert_eq!(ctx.get("count"), Some(&Value::Int(5)));
    }

    #[test]
    fn last_writer_wins_breaks_ties_by_branch_index() {
        let mut ctx = ctx_with_rules(&[("winner", MergeRule::LastWriterWins)]);
        let mut a = ctx.fork(0);
        let mut b = ctx.fork(1);
        // Same-millisecond timestamps are likely here; branch index decides.
        a.set("winner", Value::Str("a".into()), Some("a"));
        b.set("winner", Value::Str("b".into()), Some("b"));
        ctx.merge(vec![a, b], "join").unwrap();
        assert_eq!(ctx.get("winner"), Some(&Value::Str("b".into())));
    }

    #[test]
    fn branch_reads_fall_through_to_fork_snapshot() {
        let mut ctx = ctx_with_rules(&[]);
        ctx.set("seed", Value::Int(1), None);
        let mut branch = ctx.fork(0);
        assert_eq!(branch.get("seed"), Some(&Value::Int(1)));
        branch.set("seed", Value::Int(2), Some("t"));
        assert_eq!(branch.get("seed"), Some(&Value::Int(2)));
        // Parent unchanged until merge.
        assert_eq!(ctx.get("seed"), Some(&Value::Int(1)));
    }

    #[test]
    fn nested_fork_sees_branch_writes() {
        let ctx = ctx_with_rules(&[]);
        let mut outer = ctx.fork(0);
        outer.set("x", Value::Int(1), Some("outer"));
        let inner = outer.fork(0);
        assert_eq!(inner.get("x"), Some(&Value::Int(1)));
    }

    #[test]
    fn view_records_reads() {
        let view = ContextView::new(
            Uuid::now_v7(),
            Uuid::now_v7(),
            [("x".to_string(), Value::Int(1))].into_iter().collect(),
        );
        let _ = view.get("x");
        let _ = view.get("missing");
        let reads = view.observed_reads();
        assert!(reads.contains("x"));
        assert!(reads.contains("missing"));
    }
}
