//! Workflow domain types for Ledgerflow.
//!
//! `WorkflowSpec` is the declarative input to the engine: an ordered list of
//! skill invocations with per-step error policies. This module also contains
//! the execution result types (`RunResult`, `StepOutcome`) returned to callers.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::WorkflowError;

// ---------------------------------------------------------------------------
// Workflow Spec
// ---------------------------------------------------------------------------

/// A declarative workflow: an ordered list of skill invocations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct WorkflowSpec {
    /// Stable workflow identifier.
    pub id: String,
    /// Human-readable workflow name.
    pub name: String,
    /// Ordered step descriptors. Step ids are unique within a spec.
    pub steps: Vec<StepDescriptor>,
    /// Free-form metadata (not interpreted by the engine).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

/// A single step: one skill invocation plus its error policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StepDescriptor {
    /// User-defined step ID (e.g. "fetch-report"). Unique within a workflow.
    pub id: String,
    /// Identifier resolved against the skill registry.
    pub skill_id: String,
    /// Inputs passed verbatim to the skill.
    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,
    /// What to do when the step fails.
    #[serde(default)]
    pub on_error: OnError,
    /// Attempt budget and backoff for `on_error: RETRY`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    /// Skill invoked when the primary fails under `on_error: FALLBACK`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_skill: Option<String>,
    /// Inputs for the fallback skill. Defaults to the step inputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_params: Option<BTreeMap<String, Value>>,
    /// Step IDs that must run before this one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Projected cost of one invocation, checked against the active policy.
    #[serde(default)]
    pub estimated_cost_cents: u64,
    /// Per-attempt timeout. Expiry is classified as `TIMEOUT`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Recorded in the audit trail but exempt from replay verification.
    #[serde(default)]
    pub transient: bool,
}

impl StepDescriptor {
    /// Minimal step with default policy (ABORT, no retry, no fallback).
    pub fn new(id: impl Into<String>, skill_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            skill_id: skill_id.into(),
            inputs: BTreeMap::new(),
            on_error: OnError::Abort,
            retry_policy: None,
            fallback_skill: None,
            fallback_params: None,
            depends_on: Vec::new(),
            estimated_cost_cents: 0,
            timeout_ms: None,
            transient: false,
        }
    }

    /// The retry policy in effect, falling back to defaults for RETRY steps.
    pub fn effective_retry_policy(&self) -> RetryPolicy {
        self.retry_policy.clone().unwrap_or_default()
    }
}

/// Per-step error policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OnError {
    /// Halt the run with status failed.
    #[default]
    #[serde(alias = "abort")]
    Abort,
    /// Mark the step failed and proceed.
    #[serde(alias = "continue")]
    Continue,
    /// Re-invoke per `retry_policy`, then apply `on_exhausted`.
    #[serde(alias = "retry")]
    Retry,
    /// Invoke `fallback_skill` once; abort if it also fails.
    #[serde(alias = "fallback")]
    Fallback,
}

// ---------------------------------------------------------------------------
// Retry Policy
// ---------------------------------------------------------------------------

/// Attempt budget and exponential backoff for a RETRY step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RetryPolicy {
    /// Total attempts including the first (default 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(default)]
    pub backoff_ms: u64,
    /// Multiplier applied to the delay for each further retry.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Policy applied once the attempt budget is spent.
    #[serde(default)]
    pub on_exhausted: ExhaustedAction,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: 0,
            backoff_multiplier: default_backoff_multiplier(),
            on_exhausted: ExhaustedAction::Abort,
        }
    }
}

impl RetryPolicy {
    /// Delay in milliseconds before retry number `retry` (1-based).
    pub fn backoff_for(&self, retry: u32) -> u64 {
        if self.backoff_ms == 0 || retry == 0 {
            return 0;
        }
        let factor = self.backoff_multiplier.max(1.0).powi(retry as i32 - 1);
        (self.backoff_ms as f64 * factor).min(u64::MAX as f64) as u64
    }
}

/// What a RETRY step does after its last attempt fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExhaustedAction {
    #[default]
    #[serde(alias = "abort")]
    Abort,
    #[serde(alias = "continue")]
    Continue,
}

// ---------------------------------------------------------------------------
// Execution Status
// ---------------------------------------------------------------------------

/// Overall status of a workflow run. PENDING -> RUNNING -> {COMPLETED, FAILED}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    /// Whether no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("invalid run status: '{other}'")),
        }
    }
}

/// Final status of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// The primary skill succeeded (possibly after retries).
    Completed,
    /// The step failed; the run either continued or aborted.
    Failed,
    /// The primary failed and the fallback skill succeeded.
    Fallback,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Fallback => "fallback",
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, StepStatus::Failed)
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Outcome of one executed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step_id: String,
    /// The skill whose result was kept (the fallback skill for `Fallback`).
    pub skill_id: String,
    pub status: StepStatus,
    /// Number of invocations made for this step, fallback included.
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// The failure of a `Failed` step, or the primary failure a `Fallback`
    /// step recovered from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WorkflowError>,
    /// Canonical hash of the golden-normalized `output`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_hash: Option<String>,
}

/// Structured result of a workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: String,
    pub status: RunStatus,
    /// 0 when the run completed, 1 otherwise.
    pub exit_code: i32,
    /// Recorded ops: every skill invocation (retries and fallbacks
    /// included) plus one failed op per step whose skill never ran.
    pub total_ops: u64,
    pub completed_ops: u64,
    pub failed_ops: u64,
    pub duration_ms: u64,
    /// Outputs of successful steps keyed by step id.
    pub output: BTreeMap<String, Value>,
    /// Classified errors in the order they were raised.
    pub errors: Vec<WorkflowError>,
    /// Per-step outcomes in execution order.
    pub steps: Vec<StepOutcome>,
}

impl RunResult {
    /// Exit code convention for a final run status.
    pub fn exit_code_for(status: RunStatus) -> i32 {
        if status == RunStatus::Completed { 0 } else { 1 }
    }

    /// Per-step output hashes in execution order (`None` for failed steps).
    pub fn step_hashes(&self) -> Vec<(String, Option<String>)> {
        self.steps
            .iter()
            .map(|s| (s.step_id.clone(), s.output_hash.clone()))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
