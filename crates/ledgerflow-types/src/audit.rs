//! Audit trail types.
//!
//! Every skill invocation is recorded as an `OpRecord` with a gapless,
//! per-run `op_index`. Records are created `pending` and transition exactly
//! once to `completed` or `failed`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ErrorCode;

/// Lifecycle state of an audited op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpStatus {
    Pending,
    Completed,
    Failed,
}

impl OpStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpStatus::Pending => "pending",
            OpStatus::Completed => "completed",
            OpStatus::Failed => "failed",
        }
    }

    pub fn is_final(&self) -> bool {
        !matches!(self, OpStatus::Pending)
    }
}

impl std::fmt::Display for OpStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OpStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OpStatus::Pending),
            "completed" => Ok(OpStatus::Completed),
            "failed" => Ok(OpStatus::Failed),
            other => Err(format!("invalid op status: '{other}'")),
        }
    }
}

/// One recorded skill invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpRecord {
    pub op_id: Uuid,
    pub workflow_run_id: String,
    /// 1-based, gapless, assigned exactly once per run.
    pub op_index: u64,
    /// The skill identifier that was invoked.
    pub op_type: String,
    pub args: Value,
    pub args_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skill_version: Option<semver::Version>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_hash: Option<String>,
    pub status: OpStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Exempt from replay verification.
    pub transient: bool,
    /// False for a step that never reached its skill: rejected by policy,
    /// or left behind by an aborted run.
    #[serde(default = "default_invoked")]
    pub invoked: bool,
    /// Per-attempt timeout of the step, reapplied on replay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    pub tenant_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

fn default_invoked() -> bool {
    true
}

impl OpRecord {
    /// Whether replay re-executes this op: it was invoked and is not transient.
    pub fn is_replayable(&self) -> bool {
        self.invoked && !self.transient
    }
}

/// Arguments of `append_op`. The store assigns `op_id`, `op_index` and
/// `args_hash`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOp {
    pub workflow_run_id: String,
    pub op_type: String,
    pub args: Value,
    pub skill_version: Option<semver::Version>,
    pub idempotency_key: Option<String>,
    pub tenant_id: String,
    pub transient: bool,
    pub invoked: bool,
    pub timeout_ms: Option<u64>,
}

impl NewOp {
    pub fn new(
        workflow_run_id: impl Into<String>,
        op_type: impl Into<String>,
        args: Value,
        tenant_id: impl Into<String>,
    ) -> Self {
        Self {
            workflow_run_id: workflow_run_id.into(),
            op_type: op_type.into(),
            args,
            skill_version: None,
            idempotency_key: None,
            tenant_id: tenant_id.into(),
            transient: false,
            invoked: true,
            timeout_ms: None,
        }
    }
}

/// Arguments of `update_result`. The store computes `result_hash`.
#[derive(Debug, Clone, PartialEq)]
pub struct OpUpdate {
    pub op_id: Uuid,
    pub result: Option<Value>,
    pub status: OpStatus,
    pub error_code: Option<ErrorCode>,
    pub error_message: Option<String>,
    pub duration_ms: Option<u64>,
}

impl OpUpdate {
    pub fn completed(op_id: Uuid, result: Value) -> Self {
        Self {
            op_id,
            result: Some(result),
            status: OpStatus::Completed,
            error_code: None,
            error_message: None,
            duration_ms: None,
        }
    }

    pub fn failed(op_id: Uuid, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            op_id,
            result: None,
            status: OpStatus::Failed,
            error_code: Some(code),
            error_message: Some(message.into()),
            duration_ms: None,
        }
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }
}
