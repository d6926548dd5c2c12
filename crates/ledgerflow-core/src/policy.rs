//! Pre-step budget and kill-switch enforcement.
//!
//! `PolicyEnforcer` is consulted before every step invocation. A rejection is
//! a [`PolicyViolation`]; the engine classifies it through the error taxonomy
//! and never retries it.

use std::sync::atomic::{AtomicBool, Ordering};

use ledgerflow_types::config::PolicyConfig;
use ledgerflow_types::golden::BudgetSnapshot;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Which ceiling a step would have crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreachType {
    StepCeiling,
    WorkflowCeiling,
}

impl BreachType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreachType::StepCeiling => "step_ceiling",
            BreachType::WorkflowCeiling => "workflow_ceiling",
        }
    }
}

impl std::fmt::Display for BreachType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A step rejected before it ran.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyViolation {
    #[error("{breach_type} exceeded: {current_cents} cents against a limit of {limit_cents}")]
    BudgetExceeded {
        breach_type: BreachType,
        limit_cents: u64,
        current_cents: u64,
    },

    #[error("emergency stop is active (policy version {policy_version})")]
    EmergencyStop { policy_version: u64 },
}

/// Budget ceilings plus a runtime-togglable emergency stop.
#[derive(Debug)]
pub struct PolicyEnforcer {
    config: PolicyConfig,
    emergency_stop: AtomicBool,
}

impl PolicyEnforcer {
    pub fn new(config: PolicyConfig) -> Self {
        let emergency_stop = AtomicBool::new(config.emergency_stop);
        Self {
            config,
            emergency_stop,
        }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// The budget fields recorded in a run's `run_start` golden event.
    pub fn budget_snapshot(&self) -> BudgetSnapshot {
        self.config.snapshot()
    }

    pub fn is_emergency_stopped(&self) -> bool {
        self.emergency_stop.load(Ordering::SeqCst)
    }

    /// Flip the kill switch. Takes effect at the next step boundary.
    pub fn set_emergency_stop(&self, active: bool) {
        self.emergency_stop.store(active, Ordering::SeqCst);
        warn!(
            active,
            policy_version = self.config.policy_version,
            "emergency stop toggled"
        );
    }

    /// Check a step projected to cost `step_cost_cents` in a run that has
    /// already spent `spent_cents`.
    ///
    /// The emergency stop wins over any budget breach. The per-step ceiling
    /// is checked before the cumulative one.
    pub fn check_step(&self, step_cost_cents: u64, spent_cents: u64) -> Result<(), PolicyViolation> {
        if self.is_emergency_stopped() {
            return Err(PolicyViolation::EmergencyStop {
                policy_version: self.config.policy_version,
            });
        }

        if step_cost_cents > self.config.step_ceiling_cents {
            return Err(PolicyViolation::BudgetExceeded {
                breach_type: BreachType::StepCeiling,
                limit_cents: self.config.step_ceiling_cents,
                current_cents: step_cost_cents,
            });
        }

        let projected = spent_cents.saturating_add(step_cost_cents);
        if projected > self.config.workflow_ceiling_cents {
            return Err(PolicyViolation::BudgetExceeded {
                breach_type: BreachType::WorkflowCeiling,
                limit_cents: self.config.workflow_ceiling_cents,
                current_cents: projected,
            });
        }

        Ok(())
    }
}
