//! Checkpoint types: the persisted progress marker of one workflow run.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::workflow::RunStatus;

/// Persisted progress of one run, guarded by an optimistic version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: String,
    /// Starts at 1 and grows by exactly 1 per accepted save.
    pub version: u64,
    /// Index into the run's execution order of the next step to execute.
    pub next_step_index: usize,
    pub status: RunStatus,
    /// Outputs of successful steps keyed by step id.
    #[serde(default)]
    pub step_outputs: BTreeMap<String, Value>,
    /// Cumulative projected cost of the steps the policy admitted so far.
    #[serde(default)]
    pub spent_cents: u64,
    /// Sticky: once set, survives saves that omit it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Arguments of one checkpoint save.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointWrite {
    pub run_id: String,
    pub next_step_index: usize,
    pub status: RunStatus,
    /// `None` keeps the stored outputs.
    pub step_outputs: Option<BTreeMap<String, Value>>,
    /// `None` keeps the stored spend.
    pub spent_cents: Option<u64>,
    /// `None` keeps the stored tenant.
    pub tenant_id: Option<String>,
    /// Required for every save but the first one of a run.
    pub expected_version: Option<u64>,
}

impl CheckpointWrite {
    pub fn new(run_id: impl Into<String>, next_step_index: usize, status: RunStatus) -> Self {
        Self {
            run_id: run_id.into(),
            next_step_index,
            status,
            step_outputs: None,
            spent_cents: None,
            tenant_id: None,
            expected_version: None,
        }
    }

    pub fn with_outputs(mut self, outputs: BTreeMap<String, Value>) -> Self {
        self.step_outputs = Some(outputs);
        self
    }

    pub fn with_spent(mut self, spent_cents: u64) -> Self {
        self.spent_cents = Some(spent_cents);
        self
    }

    pub fn with_tenant(mut self, tenant_id: Option<String>) -> Self {
        self.tenant_id = tenant_id;
        self
    }

    pub fn expecting(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }

    /// Build the checkpoint that results from applying this write on top of
    /// `previous` (or creating it when `previous` is `None`).
    pub fn apply(self, previous: Option<&Checkpoint>) -> Checkpoint {
        let (version, outputs, spent, tenant) = match previous {
            Some(prev) => (
                prev.version + 1,
                self.step_outputs.unwrap_or_else(|| prev.step_outputs.clone()),
                self.spent_cents.unwrap_or(prev.spent_cents),
                self.tenant_id.or_else(|| prev.tenant_id.clone()),
            ),
            None => (
                1,
                self.step_outputs.unwrap_or_default(),
                self.spent_cents.unwrap_or(0),
                self.tenant_id,
            ),
        };

        Checkpoint {
            run_id: self.run_id,
            version,
            next_step_index: self.next_step_index,
            status: self.status,
            step_outputs: outputs,
            spent_cents: spent,
            tenant_id: tenant,
            updated_at: Utc::now(),
        }
    }
}

/// A save lost the optimistic race: the stored version is not the one the
/// writer last observed.
///
/// `expected_version` is `None` when the writer claimed a first save but a
/// checkpoint already existed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "version conflict on run '{run_id}': expected {}, found {actual_version}",
    .expected_version.map_or_else(|| "no checkpoint".to_string(), |v| v.to_string())
)]
pub struct VersionConflictError {
    pub run_id: String,
    pub expected_version: Option<u64>,
    /// 0 when no checkpoint exists yet.
    pub actual_version: u64,
}
