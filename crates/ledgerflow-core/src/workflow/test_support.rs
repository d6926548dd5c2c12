//! Shared fixtures for engine, runner and replay tests.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::Utc;
use ledgerflow_types::workflow::{StepDescriptor, WorkflowSpec};
use semver::Version;
use serde_json::{Value, json};

use crate::guard::ExternalCallGuard;
use crate::skill::{FnSkill, Skill, SkillContext, SkillError, SkillRegistry};
use crate::storage::{InMemoryAuditStore, InMemoryCheckpointStore, InMemoryGoldenLog};

use super::engine::WorkflowEngine;
use super::runner::WorkflowRunner;

pub(crate) type MemEngine = WorkflowEngine<InMemoryCheckpointStore, InMemoryGoldenLog>;
pub(crate) type MemRunner =
    WorkflowRunner<InMemoryCheckpointStore, InMemoryGoldenLog, InMemoryAuditStore>;

/// Fails with SERVICE_UNAVAILABLE for the first `failures` calls.
pub(crate) struct Flaky {
    failures: u32,
    calls: AtomicU32,
}

impl Flaky {
    pub(crate) fn new(failures: u32) -> Self {
        Self {
            failures,
            calls: AtomicU32::new(0),
        }
    }
}

impl Skill for Flaky {
    async fn execute(&self, inputs: &Value, _ctx: &SkillContext) -> Result<Value, SkillError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            Err(SkillError::Unavailable(format!("call {call}")))
        } else {
            Ok(json!({"recovered": true, "inputs": inputs}))
        }
    }
}

/// Sleeps before answering.
pub(crate) struct Slow {
    pub(crate) delay_ms: u64,
}

impl Skill for Slow {
    async fn execute(&self, _inputs: &Value, _ctx: &SkillContext) -> Result<Value, SkillError> {
        tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        Ok(json!({"slept_ms": self.delay_ms}))
    }
}

/// Returns a fresh value on every call.
pub(crate) struct Counter {
    calls: AtomicU32,
}

impl Counter {
    pub(crate) fn new() -> Self {
        Self {
            calls: AtomicU32::new(0),
        }
    }
}

impl Skill for Counter {
    async fn execute(&self, _inputs: &Value, _ctx: &SkillContext) -> Result<Value, SkillError> {
        Ok(json!({"count": self.calls.fetch_add(1, Ordering::SeqCst) + 1}))
    }
}

pub(crate) fn registry() -> SkillRegistry {
    SkillRegistry::new()
        .with(
            "echo",
            FnSkill::new(|inputs: &Value, _: &SkillContext| Ok(json!({"echo": inputs})))
                .with_version(Version::new(1, 0, 0)),
        )
        .with(
            "fail",
            FnSkill::new(|_: &Value, _: &SkillContext| Err(SkillError::Failed("boom".into()))),
        )
        .with(
            "unavailable",
            FnSkill::new(|_: &Value, _: &SkillContext| {
                Err(SkillError::Unavailable("503 from upstream".into()))
            }),
        )
        .with(
            "stamp",
            FnSkill::new(|inputs: &Value, _: &SkillContext| {
                Ok(json!({
                    "value": inputs.get("x").cloned().unwrap_or(Value::Null),
                    "timestamp": Utc::now().to_rfc3339(),
                    "api_key": "sk-live-123",
                    "score": 0.5,
                }))
            }),
        )
        .with(
            "stub_aware",
            FnSkill::new(|inputs: &Value, ctx: &SkillContext| {
                if ctx.stub {
                    Ok(json!({"status": "stubbed", "echo": inputs}))
                } else {
                    ctx.check_external_call("http", "https://api.example.com/v1")?;
                    Ok(json!({"status": "ok", "echo": inputs}))
                }
            }),
        )
        .with("slow", Slow { delay_ms: 200 })
}

pub(crate) fn step(id: &str, skill_id: &str) -> StepDescriptor {
    StepDescriptor::new(id, skill_id)
}

pub(crate) fn step_with_inputs(id: &str, skill_id: &str, inputs: Value) -> StepDescriptor {
    let mut s = StepDescriptor::new(id, skill_id);
    if let Value::Object(map) = inputs {
        s.inputs = map.into_iter().collect::<BTreeMap<String, Value>>();
    }
    s
}

pub(crate) fn spec(steps: Vec<StepDescriptor>) -> WorkflowSpec {
    WorkflowSpec {
        id: "wf-test".to_string(),
        name: "test-workflow".to_string(),
        steps,
        metadata: BTreeMap::new(),
    }
}

pub(crate) fn engine(registry: SkillRegistry) -> MemEngine {
    WorkflowEngine::new(
        Arc::new(InMemoryCheckpointStore::new()),
        Arc::new(InMemoryGoldenLog::new()),
        registry,
    )
    .with_guard(Arc::new(ExternalCallGuard::disabled()))
}

pub(crate) fn runner(registry: SkillRegistry) -> MemRunner {
    WorkflowRunner::new(engine(registry), Arc::new(InMemoryAuditStore::new()))
}
