use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

/// Closed set of workflow error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Timeout,
    DnsFailure,
    ConnectionReset,
    ServiceUnavailable,
    StepCeilingExceeded,
    WorkflowCeilingExceeded,
    EmergencyStop,
    SkillNotFound,
    InvalidSkill,
    StepFailed,
}

impl ErrorCode {
    /// Every code, in declaration order.
    pub const ALL: [ErrorCode; 10] = [
        ErrorCode::Timeout,
        ErrorCode::DnsFailure,
        ErrorCode::ConnectionReset,
        ErrorCode::ServiceUnavailable,
        ErrorCode::StepCeilingExceeded,
        ErrorCode::WorkflowCeilingExceeded,
        ErrorCode::EmergencyStop,
        ErrorCode::SkillNotFound,
        ErrorCode::InvalidSkill,
        ErrorCode::StepFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::DnsFailure => "DNS_FAILURE",
            ErrorCode::ConnectionReset => "CONNECTION_RESET",
            ErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCode::StepCeilingExceeded => "STEP_CEILING_EXCEEDED",
            ErrorCode::WorkflowCeilingExceeded => "WORKFLOW_CEILING_EXCEEDED",
            ErrorCode::EmergencyStop => "EMERGENCY_STOP",
            ErrorCode::SkillNotFound => "SKILL_NOT_FOUND",
            ErrorCode::InvalidSkill => "INVALID_SKILL",
            ErrorCode::StepFailed => "STEP_FAILED",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ErrorCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ErrorCode::ALL
            .iter()
            .copied()
            .find(|code| code.as_str() == s)
            .ok_or_else(|| format!("unknown error code: '{s}'"))
    }
}

/// Broad failure class. Retryability is derived from the category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Transient,
    Permanent,
    Resource,
    Permission,
    Infrastructure,
}

impl ErrorCategory {
    /// Only transient failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCategory::Transient)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "TRANSIENT",
            ErrorCategory::Permanent => "PERMANENT",
            ErrorCategory::Resource => "RESOURCE",
            ErrorCategory::Permission => "PERMISSION",
            ErrorCategory::Infrastructure => "INFRASTRUCTURE",
        }
    }
}

/// A classified step failure.
///
/// Field order is fixed and `details` is a sorted map, so two logically
/// identical errors serialize to the same bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{code}: {message}")]
pub struct WorkflowError {
    pub code: ErrorCode,
    pub category: ErrorCategory,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default)]
    pub details: BTreeMap<String, Value>,
    pub retryable: bool,
}

impl WorkflowError {
    pub fn with_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    pub fn with_run(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Storage errors
// ---------------------------------------------------------------------------

/// Errors from repository operations (used by trait definitions in ledgerflow-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}
