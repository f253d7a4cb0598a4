//! Execution artefacts: the three files emitted at run end.
//!
//! `execution_spans.json` — the span records, stable schema;
//! `execution_trace.xes` — the XES trace for external process miners;
//! `execution_report.json` — verdict, score, errors, per-task timings.
//!
//! Artefacts are written for every terminal status, failed and cancelled
//! runs included: the spans are the record of what actually happened.

use crate::engine::{NodeState, RunError, RunResult, RunStatus};
use crate::error::EngineResult;
use crate::quality::QualityScore;
use crate::recorder::SpanStatus;
use crate::xes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Per-task timing summary derived from the span set.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskTiming {
    pub attempts: u32,
    pub total_duration_ms: i64,
    pub final_status: SpanStatus,
}

/// The run report: what an embedding caller needs to judge the run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub trace_id: String,
    pub process_id: String,
    pub status: RunStatus,
    pub passed: bool,
    pub score: QualityScore,
    pub task_trace: Vec<String>,
    pub errors: Vec<RunError>,
    pub task_timings: BTreeMap<String, TaskTiming>,
    pub node_states: BTreeMap<String, NodeState>,
    pub span_count: usize,
}

impl RunReport {
    pub fn from_result(result: &RunResult) -> Self {
        let mut task_timings: BTreeMap<String, TaskTiming> = BTreeMap::new();
        for span in result.spans.iter().filter(|s| s.task_id.is_some()) {
            let task_id = span.task_id.clone().unwrap_or_default();
            let timing = task_timings.entry(task_id).or_insert(TaskTiming {
                attempts: 0,
                total_duration_ms: 0,
                final_status: span.status,
            });
            timing.attempts += 1;
            timing.total_duration_ms += span.duration_ms().unwrap_or(0);
            timing.final_status = span.status;
        }

        RunReport {
            run_id: result.run_id.to_string(),
            trace_id: result.trace_id.to_string(),
            process_id: result.process_id.clone(),
            status: result.status,
            passed: result.passed(),
            score: result.score.clone(),
            task_trace: result.task_trace.clone(),
            errors: result.errors.clone(),
            task_timings,
            node_states: result.node_states.clone(),
            span_count: result.spans.len(),
        }
    }

    /// Top failing tasks for the CLI's summary line.
    pub fn failing_tasks(&self, limit: usize) -> Vec<&str> {
        self.task_timings
            .iter()
            .filter(|(_, t)| t.final_status != SpanStatus::Ok)
            .map(|(id, _)| id.as_str())
            .take(limit)
            .collect()
    }
}

/// Paths of the emitted artefact files.
#[derive(Clone, Debug)]
pub struct ArtifactPaths {
    pub spans: PathBuf,
    pub xes: PathBuf,
    pub report: PathBuf,
}

/// Write the artefact trio into `out_dir` (created if absent).
pub async fn write_artifacts(out_dir: &Path, result: &RunResult) -> EngineResult<ArtifactPaths> {
    tokio::fs::create_dir_all(out_dir).await?;

    let spans_path = out_dir.join("execution_spans.json");
    let spans_json = serde_json::to_vec_pretty(&result.spans)
        .map_err(|e| crate::error::EngineError::Internal(format!("span serialization: {e}")))?;
    tokio::fs::write(&spans_path, spans_json).await?;

    let xes_path = out_dir.join("execution_trace.xes");
    let xes_doc = xes::export_spans(&result.run_id.to_string(), &result.spans);
    tokio::fs::write(&xes_path, xes_doc).await?;

    let report_path = out_dir.join("execution_report.json");
    let report = RunReport::from_result(result);
    let report_json = serde_json::to_vec_pretty(&report)
        .map_err(|e| crate::error::EngineError::Internal(format!("report serialization: {e}")))?;
    tokio::fs::write(&report_path, report_json).await?;

    tracing::info!(dir = %out_dir.display(), "artefacts written");
    Ok(ArtifactPaths {
        spans: spans_path,
        xes: xes_path,
        report: report_path,
    })
}
