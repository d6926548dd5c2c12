//! Replay of a recorded run from its audit trail.
//!
//! Ops are loaded in `op_index` order. Transient ops and ops of steps that
//! never reached their skill are skipped; the rest are re-checked according
//! to the mode, under the step timeout they were recorded with:
//!
//! - `dry_run`: nothing is invoked; a planned-op trace is returned.
//! - `verify`: the skill runs with a stubbed context behind an enabled
//!   external call guard, and only status family and error codes are
//!   compared.
//! - `rehydrate`: the skill runs live and must reproduce the recorded
//!   result hash exactly.
//!
//! Every op is processed even after the first mismatch. The replay record
//! is persisted as `running` when the replay starts and sealed at the end.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use ledgerflow_types::audit::OpRecord;
use ledgerflow_types::replay::{
    PlannedOp, ReplayMode, ReplayOpResult, ReplayResult, ReplayRun, ReplayStatus,
};
use ledgerflow_types::error::ErrorCode;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::guard::ExternalCallGuard;
use crate::repository::audit::{AuditError, AuditStore};
use crate::repository::checkpoint::CheckpointStore;
use crate::repository::golden::GoldenLog;
use crate::skill::{SkillContext, SkillRegistry, execute_with_timeout};
use crate::taxonomy::{ErrorContext, classify_failure};

use super::runner::WorkflowRunner;
use super::verifier::{ReplayVerifier, StatusFamily, status_family};

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("no audit ops recorded for run '{0}'")]
    NoOps(String),

    #[error(transparent)]
    Audit(#[from] AuditError),
}

impl<C: CheckpointStore, G: GoldenLog, A: AuditStore> WorkflowRunner<C, G, A> {
    /// Replay run `workflow_run_id` in `mode`. `skill_config` replaces the
    /// engine's registry for the re-invocations.
    pub async fn replay(
        &self,
        workflow_run_id: &str,
        mode: ReplayMode,
        skill_config: Option<&SkillRegistry>,
    ) -> Result<ReplayResult, ReplayError> {
        let started = Instant::now();
        let ops = self.audit.get_ops(workflow_run_id).await?;
        if ops.is_empty() {
            return Err(ReplayError::NoOps(workflow_run_id.to_string()));
        }

        let mut run = ReplayRun::start(workflow_run_id, mode, ops.len() as u64);
        self.audit.save_replay_run(&run).await?;
        info!(
            run_id = workflow_run_id,
            replay_id = %run.replay_id,
            mode = mode.as_str(),
            ops = ops.len(),
            "replay starting"
        );

        let registry = skill_config.unwrap_or_else(|| self.engine.registry());
        let context = match mode {
            ReplayMode::Verify => Some(SkillContext::stubbed(Arc::new(ExternalCallGuard::new(
                true,
                self.engine.guard().allowed_hosts().to_vec(),
            )))),
            ReplayMode::Rehydrate => Some(SkillContext::live(self.engine.guard().clone())),
            ReplayMode::DryRun => None,
        };
        let mut planned_ops = Vec::new();

        for op in &ops {
            if !op.is_replayable() {
                debug!(
                    run_id = workflow_run_id,
                    op_index = op.op_index,
                    transient = op.transient,
                    invoked = op.invoked,
                    "skipping op"
                );
                run.ops_skipped += 1;
                continue;
            }

            let Some(ctx) = &context else {
                planned_ops.push(PlannedOp {
                    op_index: op.op_index,
                    op_type: op.op_type.clone(),
                    args_hash: op.args_hash.clone(),
                    skill_version: op.skill_version.clone(),
                });
                continue;
            };

            let replayed = reinvoke(registry, op, ctx).await;
            let diffs = match mode {
                ReplayMode::Rehydrate => {
                    ReplayVerifier::<A>::compare_rehydrated(op, &replayed)
                }
                _ => ReplayVerifier::<A>::compare_ops(op, &replayed, false),
            };

            if diffs.iter().any(|d| d.severity.is_failure()) {
                run.ops_failed += 1;
                warn!(
                    run_id = workflow_run_id,
                    op_index = op.op_index,
                    op_type = %op.op_type,
                    diffs = diffs.len(),
                    "replay mismatch"
                );
                if run.first_mismatch_op_index.is_none() {
                    run.first_mismatch_op_index = Some(op.op_index);
                    run.mismatch_diff = Some(diffs);
                }
            } else {
                run.ops_verified += 1;
            }
        }

        run.status = if run.ops_failed == 0 {
            ReplayStatus::Verified
        } else {
            ReplayStatus::Mismatch
        };
        run.completed_at = Some(Utc::now());
        self.audit.save_replay_run(&run).await?;

        let duration_ms = started.elapsed().as_millis() as u64;
        info!(
            run_id = workflow_run_id,
            replay_id = %run.replay_id,
            status = run.status.as_str(),
            verified = run.ops_verified,
            failed = run.ops_failed,
            skipped = run.ops_skipped,
            duration_ms,
            "replay finished"
        );

        Ok(ReplayResult {
            replay_id: run.replay_id,
            workflow_run_id: run.workflow_run_id,
            mode,
            status: run.status,
            exit_code: if run.status == ReplayStatus::Verified { 0 } else { 1 },
            ops_total: run.ops_total,
            ops_verified: run.ops_verified,
            ops_failed: run.ops_failed,
            ops_skipped: run.ops_skipped,
            first_mismatch_op_index: run.first_mismatch_op_index,
            mismatch_diff: run.mismatch_diff,
            planned_ops,
            duration_ms,
        })
    }
}

/// Re-execute one recorded op with its original arguments.
async fn reinvoke(registry: &SkillRegistry, op: &OpRecord, ctx: &SkillContext) -> ReplayOpResult {
    let Some(skill) = registry.get(&op.op_type) else {
        return ReplayOpResult::failure(
            ErrorCode::SkillNotFound,
            format!("skill '{}' is not registered", op.op_type),
        );
    };

    match execute_with_timeout(skill.as_ref(), &op.args, ctx, op.timeout_ms).await {
        Ok(result) => ReplayOpResult::success(reported_status(&result), result),
        Err(err) => {
            let error = classify_failure(
                &err,
                &ErrorContext {
                    run_id: Some(&op.workflow_run_id),
                    step_id: None,
                },
            );
            ReplayOpResult::failure(error.code, error.message)
        }
    }
}

/// A result's own `status` field when it names a success flavor, else `ok`.
fn reported_status(result: &Value) -> String {
    match result.get("status").and_then(Value::as_str) {
        Some(status) if status_family(status) == StatusFamily::Success => status.to_string(),
        _ => "ok".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skill::{FnSkill, SkillError};
    use crate::workflow::engine::RunParams;
    use crate::workflow::test_support::{Counter, Slow, registry, runner, spec, step, step_with_inputs};
    use ledgerflow_types::replay::DiffSeverity;
    use serde_json::json;

    fn recorded_spec() -> ledgerflow_types::workflow::WorkflowSpec {
        spec(vec![
            step_with_inputs("a", "echo", json!({"x": 1})),
            step_with_inputs("b", "stub_aware", json!({"y": 2})),
            step_with_inputs("c", "echo", json!({"x": 3})),
        ])
    }

    #[tokio::test]
    async fn unknown_run_is_an_error() {
        let runner = runner(registry());
        let err = runner.replay("never-ran", ReplayMode::Verify, None).await.unwrap_err();
        assert!(matches!(err, ReplayError::NoOps(id) if id == "never-ran"));
    }

    #[tokio::test]
    async fn dry_run_plans_without_invoking() {
        let runner = runner(registry());
        runner
            .run(&recorded_spec(), &RunParams::new("dry", 0))
            .await
            .unwrap();

        let result = runner.replay("dry", ReplayMode::DryRun, None).await.unwrap();
        assert_eq!(result.status, ReplayStatus::Verified);
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.ops_total, 3);
        assert_eq!(result.ops_verified, 0);
        assert_eq!(result.planned_ops.len(), 3);
        assert_eq!(result.planned_ops[0].op_type, "echo");
        assert_eq!(result.planned_ops[0].skill_version, Some(semver::Version::new(1, 0, 0)));

        let ops = runner.audit().get_ops("dry").await.unwrap();
        assert_eq!(result.planned_ops[1].args_hash, ops[1].args_hash);
    }

    #[tokio::test]
    async fn verify_replay_of_clean_run_passes() {
        let runner = runner(registry());
        runner
            .run(&recorded_spec(), &RunParams::new("clean", 0))
            .await
            .unwrap();

        let result = runner.replay("clean", ReplayMode::Verify, None).await.unwrap();
        assert_eq!(result.status, ReplayStatus::Verified);
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.ops_verified, 3);
        assert_eq!(result.ops_failed, 0);
        assert!(result.first_mismatch_op_index.is_none());

        let stored = runner.audit().get_replay_run(&result.replay_id).await.unwrap().unwrap();
        assert_eq!(stored.status, ReplayStatus::Verified);
        assert!(stored.completed_at.is_some());
    }

    #[tokio::test]
    async fn verify_replay_reports_first_mismatch_and_continues() {
        let runner = runner(registry());
        runner
            .run(&recorded_spec(), &RunParams::new("drift", 0))
            .await
            .unwrap();

        let broken = registry().with(
            "echo",
            FnSkill::new(|_: &Value, _: &SkillContext| Err(SkillError::Failed("changed".into()))),
        );
        let result = runner
            .replay("drift", ReplayMode::Verify, Some(&broken))
            .await
            .unwrap();

        assert_eq!(result.status, ReplayStatus::Mismatch);
        assert_eq!(result.exit_code, 1);
        assert_eq!(result.ops_failed, 2);
        assert_eq!(result.ops_verified, 1);
        assert_eq!(result.first_mismatch_op_index, Some(1));
        let diff = result.mismatch_diff.unwrap();
        assert_eq!(diff.len(), 1);
        assert_eq!(diff[0].field, "status");
        assert_eq!(diff[0].severity, DiffSeverity::Critical);
    }

    #[tokio::test]
    async fn verify_mode_blocks_external_calls() {
        let runner = runner(registry());
        runner
            .run(&spec(vec![step("a", "stub_aware")]), &RunParams::new("net", 0))
            .await
            .unwrap();

        let leaky = SkillRegistry::new().with(
            "stub_aware",
            FnSkill::new(|_: &Value, ctx: &SkillContext| {
                ctx.check_external_call("http", "https://api.example.com/v1")?;
                Ok(json!({"status": "ok"}))
            }),
        );
        let result = runner.replay("net", ReplayMode::Verify, Some(&leaky)).await.unwrap();
        assert_eq!(result.ops_failed, 1);
        assert_eq!(result.first_mismatch_op_index, Some(1));
    }

    #[tokio::test]
    async fn transient_ops_are_skipped() {
        let runner = runner(registry().with("counter", Counter::new()));
        let mut b = step("b", "counter");
        b.transient = true;
        runner
            .run(&spec(vec![step("a", "echo"), b]), &RunParams::new("transient", 0))
            .await
            .unwrap();

        let result = runner.replay("transient", ReplayMode::Rehydrate, None).await.unwrap();
        assert_eq!(result.status, ReplayStatus::Verified);
        assert_eq!(result.ops_skipped, 1);
        assert_eq!(result.ops_verified, 1);
    }

    #[tokio::test]
    async fn uninvoked_ops_are_skipped() {
        let runner = runner(registry());
        runner
            .run(
                &spec(vec![step("a", "echo"), step("b", "fail"), step("c", "echo")]),
                &RunParams::new("cut-short", 0),
            )
            .await
            .unwrap();

        for mode in [ReplayMode::DryRun, ReplayMode::Verify, ReplayMode::Rehydrate] {
            let result = runner.replay("cut-short", mode, None).await.unwrap();
            assert_eq!(result.ops_total, 3);
            assert_eq!(result.ops_skipped, 1);
            assert_eq!(result.ops_failed, 0);
            assert_eq!(result.status, ReplayStatus::Verified);
        }
    }

    #[tokio::test]
    async fn replay_honors_recorded_timeout() {
        let runner = runner(registry());
        let mut a = step("a", "echo");
        a.timeout_ms = Some(50);
        runner
            .run(&spec(vec![a]), &RunParams::new("timed", 0))
            .await
            .unwrap();
        let ops = runner.audit().get_ops("timed").await.unwrap();
        assert_eq!(ops[0].timeout_ms, Some(50));

        let sluggish = registry().with("echo", Slow { delay_ms: 500 });
        let result = runner
            .replay("timed", ReplayMode::Verify, Some(&sluggish))
            .await
            .unwrap();
        assert_eq!(result.status, ReplayStatus::Mismatch);
        let diff = result.mismatch_diff.unwrap();
        assert_eq!(diff[0].field, "status");
        assert_eq!(diff[0].replay_value, json!("failed"));
    }

    #[tokio::test]
    async fn rehydrate_detects_changed_results() {
        let runner = runner(registry().with("counter", Counter::new()));
        runner
            .run(
                &spec(vec![step("a", "echo"), step("b", "counter")]),
                &RunParams::new("rehydrate", 0),
            )
            .await
            .unwrap();

        let result = runner.replay("rehydrate", ReplayMode::Rehydrate, None).await.unwrap();
        assert_eq!(result.status, ReplayStatus::Mismatch);
        assert_eq!(result.ops_verified, 1);
        assert_eq!(result.first_mismatch_op_index, Some(2));
        let diff = result.mismatch_diff.unwrap();
        assert_eq!(diff[0].field, "result_hash");
        assert_eq!(diff[0].severity, DiffSeverity::Critical);
    }

    #[tokio::test]
    async fn failed_ops_replay_as_failures() {
        let runner = runner(registry());
        let mut a = step("a", "unavailable");
        a.on_error = ledgerflow_types::workflow::OnError::Continue;
        runner
            .run(&spec(vec![a, step("b", "echo")]), &RunParams::new("failing", 0))
            .await
            .unwrap();

        let result = runner.replay("failing", ReplayMode::Verify, None).await.unwrap();
        assert_eq!(result.status, ReplayStatus::Verified);
        assert_eq!(result.ops_verified, 2);
    }
}
