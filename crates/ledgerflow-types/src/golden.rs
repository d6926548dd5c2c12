//! Golden recording types.
//!
//! A golden event is a canonicalized milestone of a run. Two logically
//! identical runs produce the same sequence of deterministic dicts.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Kind of milestone a golden event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoldenEventType {
    RunStart,
    Step,
    RunEnd,
}

impl GoldenEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GoldenEventType::RunStart => "run_start",
            GoldenEventType::Step => "step",
            GoldenEventType::RunEnd => "run_end",
        }
    }
}

impl std::str::FromStr for GoldenEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "run_start" => Ok(GoldenEventType::RunStart),
            "step" => Ok(GoldenEventType::Step),
            "run_end" => Ok(GoldenEventType::RunEnd),
            other => Err(format!("invalid golden event type: '{other}'")),
        }
    }
}

/// One append-only golden log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoldenEvent {
    pub run_id: String,
    pub event_type: GoldenEventType,
    /// Canonicalized payload (volatile keys stripped, secrets redacted).
    pub data: Value,
    /// 0-based position within the run's log.
    pub position: u64,
}

impl GoldenEvent {
    /// The event minus its `run_id`, for cross-run comparison.
    pub fn to_deterministic_dict(&self) -> Value {
        json!({
            "event_type": self.event_type.as_str(),
            "data": self.data,
            "position": self.position,
        })
    }
}

/// Budget configuration captured in the `run_start` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub step_ceiling_cents: u64,
    pub workflow_ceiling_cents: u64,
    pub policy_version: u64,
}
