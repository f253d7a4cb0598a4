//! Quality scorer: a deterministic weighted score over the span set.
//!
//! Pure function of the spans, the registered category set and the
//! performance budget — equal inputs always yield equal scores. Only task
//! spans (spans carrying a `task_id`) feed the semantic and validation
//! components; gateway and lifecycle spans are bookkeeping, not evidence.

use crate::config::EngineConfig;
use crate::recorder::SpanRecord;
use crate::registry::TaskCategory;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

const WEIGHT_SEMANTIC: f64 = 0.30;
const WEIGHT_VALID: f64 = 0.30;
const WEIGHT_COVERAGE: f64 = 0.20;
const WEIGHT_PERFORMANCE: f64 = 0.20;

/// Score breakdown plus the weighted total and verdict.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QualityScore {
    pub semantic_compliance: f64,
    pub valid_spans: f64,
    pub coverage: f64,
    pub performance: f64,
    pub total: f64,
    pub passed: bool,
    pub threshold: f64,
}

pub fn score(
    spans: &[SpanRecord],
    registered_categories: &BTreeSet<TaskCategory>,
    config: &EngineConfig,
) -> QualityScore {
    let task_spans: Vec<&SpanRecord> = spans.iter().filter(|s| s.task_id.is_some()).collect();

    // A process with no tasks scores 1.0 by convention.
    if task_spans.is_empty() {
        return QualityScore {
            semantic_compliance: 1.0,
            valid_spans: 1.0,
            coverage: 1.0,
            performance: 1.0,
            total: 1.0,
            passed: 1.0 >= config.quality_threshold,
            threshold: config.quality_threshold,
        };
    }

    let total_tasks = task_spans.len() as f64;

    let semantic_compliance = task_spans
        .iter()
        .filter(|s| s.attr("semantic.group.id").is_some() && s.attr("semantic.operation").is_some())
        .count() as f64
        / total_tasks;

    let valid_spans = task_spans
        .iter()
        .filter(|s| s.attr_is_true("validation.passed") && s.attr_is_true("execution.success"))
        .count() as f64
        / total_tasks;

    let coverage = if registered_categories.is_empty() {
        1.0
    } else {
        let seen: BTreeSet<&str> = task_spans
            .iter()
            .filter_map(|s| s.attr("semantic.group.id"))
            .filter_map(|v| v.as_str())
            .filter_map(|g| g.strip_prefix("weavergen."))
            .collect();
        let covered = registered_categories
            .iter()
            .filter(|c| seen.contains(c.as_str()))
            .count();
        covered as f64 / registered_categories.len() as f64
    };

    let performance = performance_component(&task_spans, config);

    let total = WEIGHT_SEMANTIC * semantic_compliance
        + WEIGHT_VALID * valid_spans
        + WEIGHT_COVERAGE * coverage
        + WEIGHT_PERFORMANCE * performance;

    QualityScore {
        semantic_compliance,
        valid_spans,
        coverage,
        performance,
        total,
        passed: total >= config.quality_threshold,
        threshold: config.quality_threshold,
    }
}

/// 1.0 when the p95 task duration is within budget, falling linearly to
/// 0.0 at three times the budget.
fn performance_component(task_spans: &[&SpanRecord], config: &EngineConfig) -> f64 {
    let budget_ms = config.performance_budget.as_millis() as f64;
    if budget_ms <= 0.0 {
        return 1.0;
    }
    let mut durations: Vec<i64> = task_spans.iter().filter_map(|s| s.duration_ms()).collect();
    if durations.is_empty() {
        return 1.0;
    }
    durations.sort_unstable();
    let rank = ((durations.len() as f64) * 0.95).ceil() as usize;
    let p95 = durations[rank.saturating_sub(1).min(durations.len() - 1)] as f64;

    if p95 <= budget_ms {
        1.0
    } else if p95 >= budget_ms * 3.0 {
        0.0
    } else {
        1.0 - (p95 - budget_ms) / (budget_ms * 2.0)
    }
}
