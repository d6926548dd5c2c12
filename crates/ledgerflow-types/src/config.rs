//! Configuration types for Ledgerflow.
//!
//! `LedgerflowConfig` represents the top-level `ledgerflow.toml` that
//! controls budget policy, the external call allowlist and golden recording.

use serde::{Deserialize, Serialize};

use crate::golden::BudgetSnapshot;

/// Top-level configuration.
///
/// All sections have defaults. A missing `[policy]` table is meaningful: the
/// engine then runs unconstrained and emits no budget snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerflowConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<PolicyConfig>,

    #[serde(default)]
    pub guard: GuardConfig,

    #[serde(default)]
    pub golden: GoldenOptions,

    /// SQLite URL for the durable stores (defaults to the data directory).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
}

/// Budget ceilings and the kill switch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Maximum projected cost of a single step.
    pub step_ceiling_cents: u64,
    /// Maximum cumulative cost of one run.
    pub workflow_ceiling_cents: u64,
    /// Monotonic identifier of this policy revision.
    #[serde(default = "default_policy_version")]
    pub policy_version: u64,
    /// Reject every step regardless of budget.
    #[serde(default)]
    pub emergency_stop: bool,
}

fn default_policy_version() -> u64 {
    1
}

impl PolicyConfig {
    pub fn new(step_ceiling_cents: u64, workflow_ceiling_cents: u64, policy_version: u64) -> Self {
        Self {
            step_ceiling_cents,
            workflow_ceiling_cents,
            policy_version,
            emergency_stop: false,
        }
    }

    /// The three budget fields, verbatim.
    pub fn snapshot(&self) -> BudgetSnapshot {
        BudgetSnapshot {
            step_ceiling_cents: self.step_ceiling_cents,
            workflow_ceiling_cents: self.workflow_ceiling_cents,
            policy_version: self.policy_version,
        }
    }
}

/// Hosts that stay reachable while external calls are being blocked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardConfig {
    #[serde(default = "default_allowed_hosts")]
    pub allowed_hosts: Vec<String>,
}

fn default_allowed_hosts() -> Vec<String> {
    vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
        "::1".to_string(),
    ]
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            allowed_hosts: default_allowed_hosts(),
        }
    }
}

/// Canonicalization settings applied to golden event payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoldenOptions {
    #[serde(default = "default_redact_sensitive")]
    pub redact_sensitive: bool,
    /// Decimal places kept for floating point values.
    #[serde(default = "default_float_precision")]
    pub float_precision: u32,
}

fn default_redact_sensitive() -> bool {
    true
}

fn default_float_precision() -> u32 {
    6
}

impl Default for GoldenOptions {
    fn default() -> Self {
        Self {
            redact_sensitive: default_redact_sensitive(),
            float_precision: default_float_precision(),
        }
    }
}
