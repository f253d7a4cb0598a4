//! Truth validation: confront declarative claims with span evidence.
//!
//! Tasks record claims ("generated 4 files") through their span handle;
//! after the run each claim is checked against the span set. A claim is
//! `verified` when every piece of required evidence is present,
//! `contradicted` when evidence actively disagrees (wrong count, file
//! never written), and `unverifiable` when the spans are silent. The
//! validator also flags context access outside a task's declared I/O.

use crate::recorder::{MutationRecord, SpanRecord};
use crate::registry::ServiceTaskRegistry;
use crate::types::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Evidence a claim requires from the span set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum RequiredEvidence {
    /// An attribute must be present on some span, optionally with an
    /// exact value.
    Attribute {
        key: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        equals: Option<Value>,
    },
    /// A file path must appear in a file-writer span's written-files list.
    FileWritten { path: String },
    /// A numeric attribute must match exactly on some span.
    Count { attribute: String, expected: i64 },
}

/// A declarative claim recorded by a task during the run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub text: String,
    pub task_id: String,
    pub evidence: Vec<RequiredEvidence>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimVerdict {
    Verified,
    Unverifiable,
    Contradicted,
}

/// Per-claim result with the spans that supported (or contradicted) it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClaimReport {
    pub claim: Claim,
    pub verdict: ClaimVerdict,
    pub supporting_spans: Vec<u64>,
    pub detail: String,
}

/// An access outside a task's declared inputs/outputs, spotted by
/// comparing observed reads and recorded mutations against the registry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IoViolation {
    pub task_id: String,
    pub key: String,
    pub access: IoAccess,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoAccess {
    UndeclaredRead,
    UndeclaredWrite,
}

/// The full truth-validation result.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TruthReport {
    pub claims: Vec<ClaimReport>,
    pub io_violations: Vec<IoViolation>,
}

impl TruthReport {
    pub fn contradicted(&self) -> usize {
        self.claims
            .iter()
            .filter(|c| c.verdict == ClaimVerdict::Contradicted)
            .count()
    }
}

pub fn validate(
    claims: &[Claim],
    spans: &[SpanRecord],
    mutations: &[MutationRecord],
    registry: &ServiceTaskRegistry,
) -> TruthReport {
    let claim_reports = claims.iter().map(|c| check_claim(c, spans)).collect();

    let mut io_violations = Vec::new();
    for mutation in mutations {
        if let Some(definition) = registry.lookup(&mutation.writer) {
            if !definition.output_keys().contains(mutation.key.as_str()) {
                io_violations.push(IoViolation {
                    task_id: mutation.writer.clone(),
                    key: mutation.key.clone(),
                    access: IoAccess::UndeclaredWrite,
                });
            }
        }
    }
    // Observed reads are attached to task spans as `context.reads`.
    for span in spans {
        let Some(task_id) = &span.task_id else { continue };
        let Some(definition) = registry.lookup(task_id) else {
            continue;
        };
        let Some(Value::List(reads)) = span.attr("context.reads") else {
            continue;
        };
        let declared: BTreeSet<&str> = definition.input_keys();
        for read in reads {
            if let Value::Str(key) = read {
                if !declared.contains(key.as_str()) {
                    io_violations.push(IoViolation {
                        task_id: task_id.clone(),
                        key: key.clone(),
                        access: IoAccess::UndeclaredRead,
                    });
                }
            }
        }
    }

    TruthReport {
        claims: claim_reports,
        io_violations,
    }
}

fn check_claim(claim: &Claim, spans: &[SpanRecord]) -> ClaimReport {
    let mut supporting = Vec::new();
    let mut verdict = ClaimVerdict::Verified;
    let mut detail = String::new();

    for evidence in &claim.evidence {
        match evidence {
            RequiredEvidence::Attribute { key, equals } => {
                let holders: Vec<&SpanRecord> =
                    spans.iter().filter(|s| s.attr(key).is_some()).collect();
                if holders.is_empty() {
                    downgrade(&mut verdict, ClaimVerdict::Unverifiable);
                    detail = format!("no span carries attribute '{key}'");
                    continue;
                }
                match equals {
                    None => supporting.extend(holders.iter().map(|s| s.span_id)),
                    Some(expected) => {
                        let matching: Vec<&&SpanRecord> = holders
                            .iter()
                            .filter(|s| s.attr(key) == Some(expected))
                            .collect();
                        if matching.is_empty() {
                            verdict = ClaimVerdict::Contradicted;
                            detail = format!("attribute '{key}' present but never equals the claimed value");
                        } else {
                            supporting.extend(matching.iter().map(|s| s.span_id));
                        }
                    }
                }
            }
            RequiredEvidence::FileWritten { path } => {
                let mut found = false;
                let mut any_writer = false;
                for span in spans {
                    if let Some(Value::List(files)) = span.attr("code.files_written") {
                        any_writer = true;
                        if files.iter().any(|f| f.as_str() == Some(path.as_str())) {
                            supporting.push(span.span_id);
                            found = true;
                        }
                    }
                    if span.attr("code.filepath").and_then(|v| v.as_str()) == Some(path.as_str()) {
                        supporting.push(span.span_id);
                        any_writer = true;
                        found = true;
                    }
                }
                if !found {
                    if any_writer {
                        verdict = ClaimVerdict::Contradicted;
                        detail = format!("file '{path}' does not appear in any file-writer span");
                    } else {
                        downgrade(&mut verdict, ClaimVerdict::Unverifiable);
                        detail = "no file-writer spans recorded".to_string();
                    }
                }
            }
            RequiredEvidence::Count { attribute, expected } => {
                let values: Vec<i64> = spans
                    .iter()
                    .filter_map(|s| s.attr(attribute))
                    .filter_map(|v| v.as_int())
                    .collect();
                if values.is_empty() {
                    downgrade(&mut verdict, ClaimVerdict::Unverifiable);
                    detail = format!("no span carries numeric attribute '{attribute}'");
                } else if values.contains(expected) {
                    supporting.extend(
                        spans
                            .iter()
                            .filter(|s| s.attr(attribute).and_then(|v| v.as_int()) == Some(*expected))
                            .map(|s| s.span_id),
                    );
                } else {
                    verdict = ClaimVerdict::Contradicted;
                    detail = format!(
                        "attribute '{attribute}' is {:?}, claim says {expected}",
                        values
                    );
                }
            }
        }
    }

    supporting.sort_unstable();
    supporting.dedup();
    ClaimReport {
        claim: claim.clone(),
        verdict,
        supporting_spans: supporting,
        detail,
    }
}

/// Contradicted sticks; unverifiable only downgrades verified.
fn downgrade(verdict: &mut ClaimVerdict, to: ClaimVerdict) {
    if *verdict == ClaimVerdict::Verified {
        *verdict = to;
    }
}
