//! ReplayVerifier -- field-level comparison of replayed ops against the
//! audit trail.
//!
//! Statuses are compared by family: `ok`, `completed`, `complete`,
//! `success`, `succeeded` and `stubbed` all mean success, anything else is
//! a failure. A family mismatch is critical. When both sides failed the
//! error codes are compared. Strict mode also compares result hashes and
//! status flavors. Embedding and key-value ops get structural checks on
//! the fields replay must reproduce.

use ledgerflow_types::audit::OpRecord;
use ledgerflow_types::replay::{DiffEntry, DiffSeverity, ReplayOpResult, VerificationResult};
use serde_json::{Value, json};

use crate::canonical::canonical_hash;
use crate::repository::audit::{AuditError, AuditStore};

const SUCCESS_STATUSES: &[&str] = &["ok", "completed", "complete", "success", "succeeded", "stubbed"];

/// Success or failure class of a free-form status string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFamily {
    Success,
    Failure,
}

pub fn status_family(status: &str) -> StatusFamily {
    let normalized = status.trim().to_ascii_lowercase();
    if SUCCESS_STATUSES.contains(&normalized.as_str()) {
        StatusFamily::Success
    } else {
        StatusFamily::Failure
    }
}

pub struct ReplayVerifier<'a, A: AuditStore> {
    audit: &'a A,
}

impl<'a, A: AuditStore> ReplayVerifier<'a, A> {
    pub fn new(audit: &'a A) -> Self {
        Self { audit }
    }

    /// Compare one stubbed replay result with the op it re-executed.
    pub fn compare_ops(original: &OpRecord, replay: &ReplayOpResult, strict: bool) -> Vec<DiffEntry> {
        let mut diffs = Vec::new();
        let original_family = status_family(original.status.as_str());
        let replay_family = status_family(&replay.status);

        if original_family != replay_family {
            diffs.push(diff(
                original,
                "status",
                json!(original.status.as_str()),
                json!(replay.status),
                DiffSeverity::Critical,
            ));
            return diffs;
        }

        if original_family == StatusFamily::Failure {
            if original.error_code != replay.error_code {
                diffs.push(diff(
                    original,
                    "error_code",
                    json!(original.error_code),
                    json!(replay.error_code),
                    DiffSeverity::Warning,
                ));
            }
            return diffs;
        }

        if strict {
            let replay_hash = replay.result.as_ref().map(canonical_hash);
            if original.result_hash != replay_hash {
                diffs.push(diff(
                    original,
                    "result_hash",
                    json!(original.result_hash),
                    json!(replay_hash),
                    DiffSeverity::Warning,
                ));
            }
            if !original.status.as_str().eq_ignore_ascii_case(replay.status.trim()) {
                diffs.push(diff(
                    original,
                    "status",
                    json!(original.status.as_str()),
                    json!(replay.status),
                    DiffSeverity::Info,
                ));
            }
        }

        diffs.extend(structural_diffs(original, replay));
        diffs
    }

    /// Compare a live re-execution with its op: same status family and, for
    /// successes, the exact same canonical result hash.
    pub fn compare_rehydrated(original: &OpRecord, replay: &ReplayOpResult) -> Vec<DiffEntry> {
        let mut diffs = Self::compare_ops(original, replay, false);
        if diffs.iter().any(|d| d.field == "status")
            || status_family(&replay.status) == StatusFamily::Failure
        {
            return diffs;
        }

        let replay_hash = replay.result.as_ref().map(canonical_hash);
        if original.result_hash != replay_hash {
            diffs.push(diff(
                original,
                "result_hash",
                json!(original.result_hash),
                json!(replay_hash),
                DiffSeverity::Critical,
            ));
        }
        diffs
    }

    /// Verify a run's replay results, one per recorded op in `op_index`
    /// order. Transient and uninvoked ops are skipped.
    pub async fn verify_workflow(
        &self,
        workflow_run_id: &str,
        replay_results: &[ReplayOpResult],
        strict: bool,
    ) -> Result<VerificationResult, AuditError> {
        let ops = self.audit.get_ops(workflow_run_id).await?;
        let mut diffs = Vec::new();
        let (mut matched, mut mismatched, mut skipped) = (0u64, 0u64, 0u64);

        if ops.len() != replay_results.len() {
            tracing::warn!(
                run_id = workflow_run_id,
                recorded = ops.len(),
                replayed = replay_results.len(),
                "replay result count differs from recorded ops"
            );
            diffs.push(DiffEntry {
                op_index: 0,
                op_type: "workflow".to_string(),
                field: "op_count".to_string(),
                original_value: json!(ops.len()),
                replay_value: json!(replay_results.len()),
                severity: DiffSeverity::Critical,
            });
        }

        for (op, replay) in ops.iter().zip(replay_results) {
            if !op.is_replayable() {
                skipped += 1;
                continue;
            }
            let op_diffs = Self::compare_ops(op, replay, strict);
            if op_diffs.iter().any(|d| d.severity.is_failure()) {
                mismatched += 1;
            } else {
                matched += 1;
            }
            diffs.extend(op_diffs);
        }

        let verified = !diffs.iter().any(|d| d.severity.is_failure());
        let summary = format!(
            "{}: {matched} matched, {mismatched} mismatched, {skipped} skipped of {} recorded ops",
            if verified { "verified" } else { "mismatch" },
            ops.len()
        );
        tracing::info!(run_id = workflow_run_id, verified, matched, mismatched, "workflow verified");

        Ok(VerificationResult {
            verified,
            matched,
            mismatched,
            skipped,
            diffs,
            summary,
        })
    }
}

fn diff(
    op: &OpRecord,
    field: &str,
    original_value: Value,
    replay_value: Value,
    severity: DiffSeverity,
) -> DiffEntry {
    DiffEntry {
        op_index: op.op_index,
        op_type: op.op_type.clone(),
        field: field.to_string(),
        original_value,
        replay_value,
        severity,
    }
}

fn op_type_has(op_type: &str, segments: &[&str]) -> bool {
    op_type
        .split(['.', '_', '-', ':', '/'])
        .any(|segment| segments.contains(&segment.to_ascii_lowercase().as_str()))
}

/// Dimensionality reported by an embedding-like result.
fn dimensions(result: Option<&Value>) -> Option<u64> {
    let result = result?;
    result
        .get("dimensions")
        .or_else(|| result.get("dimension"))
        .and_then(Value::as_u64)
        .or_else(|| result.get("embedding").and_then(Value::as_array).map(|v| v.len() as u64))
}

fn structural_diffs(original: &OpRecord, replay: &ReplayOpResult) -> Vec<DiffEntry> {
    let mut diffs = Vec::new();

    if op_type_has(&original.op_type, &["embed", "embedding", "embeddings"]) {
        let expected = dimensions(original.result.as_ref());
        let actual = dimensions(replay.result.as_ref());
        if expected.is_some() && expected != actual {
            diffs.push(diff(
                original,
                "dimensions",
                json!(expected),
                json!(actual),
                DiffSeverity::Critical,
            ));
        }
    }

    if op_type_has(&original.op_type, &["kv"]) {
        let expected = original.result.as_ref().and_then(|r| r.get("operation"));
        let actual = replay.result.as_ref().and_then(|r| r.get("operation"));
        if expected.is_some() && expected != actual {
            diffs.push(diff(
                original,
                "operation",
                expected.cloned().unwrap_or(Value::Null),
                actual.cloned().unwrap_or(Value::Null),
                DiffSeverity::Critical,
            ));
        }
    }

    diffs
}
