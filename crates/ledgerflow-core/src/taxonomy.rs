//! Classification of raw failures into the closed error taxonomy.
//!
//! Every failure surfaced by the engine goes through [`classify_failure`],
//! so category and retryability are always derived from the code table in
//! [`get_error_metadata`] and never decided ad hoc.

use ledgerflow_types::error::{ErrorCategory, ErrorCode, WorkflowError};
use serde_json::Value;

use crate::canonical::canonical_json;
use crate::policy::{BreachType, PolicyViolation};
use crate::skill::SkillError;

/// Static facts about an error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorMetadata {
    pub category: ErrorCategory,
    pub retryable: bool,
    pub recovery_hint: &'static str,
}

const fn meta(category: ErrorCategory, recovery_hint: &'static str) -> ErrorMetadata {
    ErrorMetadata {
        category,
        retryable: matches!(category, ErrorCategory::Transient),
        recovery_hint,
    }
}

pub fn get_error_metadata(code: ErrorCode) -> ErrorMetadata {
    use ErrorCategory::*;
    match code {
        ErrorCode::Timeout => meta(Transient, "retry with backoff or raise the step timeout"),
        ErrorCode::DnsFailure => meta(Transient, "retry; check resolver configuration"),
        ErrorCode::ConnectionReset => meta(Transient, "retry with backoff"),
        ErrorCode::ServiceUnavailable => meta(Transient, "retry after the upstream recovers"),
        ErrorCode::StepCeilingExceeded => {
            meta(Resource, "lower the step cost or raise step_ceiling_cents")
        }
        ErrorCode::WorkflowCeilingExceeded => {
            meta(Resource, "raise workflow_ceiling_cents or trim the workflow")
        }
        ErrorCode::EmergencyStop => meta(Permission, "clear the emergency stop to resume"),
        ErrorCode::SkillNotFound => meta(Permanent, "register the skill or fix skill_id"),
        ErrorCode::InvalidSkill => meta(Permanent, "fix the skill definition"),
        ErrorCode::StepFailed => meta(Permanent, "inspect the step error message"),
    }
}

/// A taxonomy-consistent error for `code`.
pub fn workflow_error(code: ErrorCode, message: impl Into<String>) -> WorkflowError {
    let metadata = get_error_metadata(code);
    WorkflowError {
        code,
        category: metadata.category,
        message: message.into(),
        step_id: None,
        run_id: None,
        details: Default::default(),
        retryable: metadata.retryable,
    }
}

/// Where a failure happened.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorContext<'a> {
    pub run_id: Option<&'a str>,
    pub step_id: Option<&'a str>,
}

impl<'a> ErrorContext<'a> {
    pub fn step(run_id: &'a str, step_id: &'a str) -> Self {
        Self {
            run_id: Some(run_id),
            step_id: Some(step_id),
        }
    }
}

/// Map a raw skill failure onto the taxonomy. Unrecognized failures become
/// `STEP_FAILED`.
pub fn classify_failure(err: &SkillError, ctx: &ErrorContext<'_>) -> WorkflowError {
    let classified = match err {
        SkillError::Timeout { after_ms } => {
            let base = workflow_error(ErrorCode::Timeout, err.to_string());
            match after_ms {
                Some(ms) => base.with_detail("timeout_ms", *ms),
                None => base,
            }
        }
        SkillError::Dns(_) => workflow_error(ErrorCode::DnsFailure, err.to_string()),
        SkillError::ConnectionReset(_) => {
            workflow_error(ErrorCode::ConnectionReset, err.to_string())
        }
        SkillError::Unavailable(_) => {
            workflow_error(ErrorCode::ServiceUnavailable, err.to_string())
        }
        SkillError::Policy(violation) => classify_violation(violation),
        SkillError::NotFound(skill_id) => {
            workflow_error(ErrorCode::SkillNotFound, err.to_string())
                .with_detail("skill_id", skill_id.as_str())
        }
        SkillError::Invalid(_) => workflow_error(ErrorCode::InvalidSkill, err.to_string()),
        SkillError::Blocked(blocked) => workflow_error(ErrorCode::StepFailed, err.to_string())
            .with_detail("call_type", blocked.call_type.as_str())
            .with_detail("target", blocked.target.as_str()),
        SkillError::Failed(_) => workflow_error(ErrorCode::StepFailed, err.to_string()),
    };

    let classified = match ctx.run_id {
        Some(run_id) => classified.with_run(run_id),
        None => classified,
    };
    match ctx.step_id {
        Some(step_id) => classified.with_step(step_id),
        None => classified,
    }
}

fn classify_violation(violation: &PolicyViolation) -> WorkflowError {
    match violation {
        PolicyViolation::BudgetExceeded {
            breach_type,
            limit_cents,
            current_cents,
        } => {
            let code = match breach_type {
                BreachType::StepCeiling => ErrorCode::StepCeilingExceeded,
                BreachType::WorkflowCeiling => ErrorCode::WorkflowCeilingExceeded,
            };
            workflow_error(code, violation.to_string())
                .with_detail("breach_type", breach_type.as_str())
                .with_detail("limit_cents", *limit_cents)
                .with_detail("current_cents", *current_cents)
        }
        PolicyViolation::EmergencyStop { policy_version } => {
            workflow_error(ErrorCode::EmergencyStop, violation.to_string())
                .with_detail("policy_version", *policy_version)
        }
    }
}

/// Deterministic JSON form of an error.
pub fn serialize_error(err: &WorkflowError) -> String {
    serde_json::to_value(err)
        .map(|v| canonical_json(&v))
        .unwrap_or_else(|_| canonical_json(&Value::String(err.to_string())))
}
