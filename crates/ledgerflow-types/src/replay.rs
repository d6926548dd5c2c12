//! Replay and verification types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ErrorCode;

/// Fidelity of a replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayMode {
    /// No invocation; only a planned-op trace.
    DryRun,
    /// Stubbed, side-effect-free invocation; compares status class.
    Verify,
    /// Real invocation; requires identical result hashes.
    Rehydrate,
}

impl ReplayMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplayMode::DryRun => "dry_run",
            ReplayMode::Verify => "verify",
            ReplayMode::Rehydrate => "rehydrate",
        }
    }
}

impl std::str::FromStr for ReplayMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dry_run" => Ok(ReplayMode::DryRun),
            "verify" => Ok(ReplayMode::Verify),
            "rehydrate" => Ok(ReplayMode::Rehydrate),
            other => Err(format!("invalid replay mode: '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayStatus {
    Running,
    /// Sealed with zero failed ops.
    Verified,
    /// Sealed with at least one failed op.
    Mismatch,
}

impl ReplayStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplayStatus::Running => "running",
            ReplayStatus::Verified => "verified",
            ReplayStatus::Mismatch => "mismatch",
        }
    }
}

impl std::str::FromStr for ReplayStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(ReplayStatus::Running),
            "verified" => Ok(ReplayStatus::Verified),
            "mismatch" => Ok(ReplayStatus::Mismatch),
            other => Err(format!("invalid replay status: '{other}'")),
        }
    }
}

/// Persisted record of one replay. Created at start, sealed at the end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayRun {
    pub replay_id: Uuid,
    pub workflow_run_id: String,
    pub mode: ReplayMode,
    pub status: ReplayStatus,
    pub ops_total: u64,
    pub ops_verified: u64,
    pub ops_failed: u64,
    pub ops_skipped: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_mismatch_op_index: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mismatch_diff: Option<Vec<DiffEntry>>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ReplayRun {
    pub fn start(workflow_run_id: impl Into<String>, mode: ReplayMode, ops_total: u64) -> Self {
        Self {
            replay_id: Uuid::now_v7(),
            workflow_run_id: workflow_run_id.into(),
            mode,
            status: ReplayStatus::Running,
            ops_total,
            ops_verified: 0,
            ops_failed: 0,
            ops_skipped: 0,
            first_mismatch_op_index: None,
            mismatch_diff: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Diffing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffSeverity {
    Info,
    Warning,
    Critical,
}

impl DiffSeverity {
    /// Whether a diff of this severity makes the op count as failed.
    pub fn is_failure(&self) -> bool {
        !matches!(self, DiffSeverity::Info)
    }
}

/// One field-level difference between an original op and its replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffEntry {
    pub op_index: u64,
    pub op_type: String,
    pub field: String,
    pub original_value: Value,
    pub replay_value: Value,
    pub severity: DiffSeverity,
}

/// Outcome of re-executing one recorded op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayOpResult {
    /// Free-form status reported by the re-execution ("ok", "stubbed",
    /// "completed", "failed", ...). Compared by family.
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ReplayOpResult {
    pub fn success(status: impl Into<String>, result: Value) -> Self {
        Self {
            status: status.into(),
            result: Some(result),
            error_code: None,
            error_message: None,
        }
    }

    pub fn failure(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: "failed".to_string(),
            result: None,
            error_code: Some(code),
            error_message: Some(message.into()),
        }
    }
}

/// Result of verifying a whole run's replay results against its audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub verified: bool,
    pub matched: u64,
    pub mismatched: u64,
    pub skipped: u64,
    pub diffs: Vec<DiffEntry>,
    pub summary: String,
}

// ---------------------------------------------------------------------------
// Replay result
// ---------------------------------------------------------------------------

/// Planned-op trace entry produced by a dry run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedOp {
    pub op_index: u64,
    pub op_type: String,
    pub args_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skill_version: Option<semver::Version>,
}

/// Structured result of a replay returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayResult {
    pub replay_id: Uuid,
    pub workflow_run_id: String,
    pub mode: ReplayMode,
    pub status: ReplayStatus,
    /// 0 when verified, 1 otherwise.
    pub exit_code: i32,
    pub ops_total: u64,
    pub ops_verified: u64,
    pub ops_failed: u64,
    pub ops_skipped: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_mismatch_op_index: Option<u64>,
    /// Diffs of the first mismatching op.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mismatch_diff: Option<Vec<DiffEntry>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub planned_ops: Vec<PlannedOp>,
    pub duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_mode_parse() {
        for mode in [ReplayMode::DryRun, ReplayMode::Verify, ReplayMode::Rehydrate] {
            assert_eq!(mode.as_str().parse::<ReplayMode>().unwrap(), mode);
        }
        assert!("fast".parse::<ReplayMode>().is_err());
    }

    #[test]
    fn severity_ordering() {
        assert!(DiffSeverity::Critical > DiffSeverity::Warning);
        assert!(DiffSeverity::Warning > DiffSeverity::Info);
        assert!(!DiffSeverity::Info.is_failure());
        assert!(DiffSeverity::Warning.is_failure());
    }

    #[test]
    fn replay_run_starts_running() {
        let run = ReplayRun::start("run-1", ReplayMode::Verify, 4);
        assert_eq!(run.status, ReplayStatus::Running);
        assert_eq!(run.ops_total, 4);
        assert!(run.completed_at.is_none());
    }
}
