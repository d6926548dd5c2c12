//! Workflow engine: sequential step execution with durable checkpointing.
//!
//! The `WorkflowEngine` walks a spec's steps in dependency order. Each step
//! is checked against the active policy, invoked through the skill registry,
//! classified on failure and dispatched per its `on_error` policy. Progress
//! is checkpointed after every step with optimistic locking, and the run is
//! mirrored into a canonicalized golden event sequence.
//!
//! # Execution flow
//!
//! 1. Validate the workflow spec and compute the execution order.
//! 2. Save the first checkpoint (version 1). A conflict here means the run
//!    id is already taken.
//! 3. Record `run_start` (workflow, seed, order, budget snapshot).
//! 4. For each step: policy check -> invoke (retry / fallback) ->
//!    checkpoint with the last observed version -> record `step`.
//! 5. On abort, record a failed op for every step left behind.
//! 6. Save the terminal checkpoint and record `run_end`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use ledgerflow_types::checkpoint::{Checkpoint, VersionConflictError};
use ledgerflow_types::config::{GoldenOptions, LedgerflowConfig};
use ledgerflow_types::error::{RepositoryError, WorkflowError};
use ledgerflow_types::golden::GoldenEventType;
use ledgerflow_types::workflow::{
    OnError, RunResult, RunStatus, StepDescriptor, StepOutcome, StepStatus, WorkflowSpec,
};
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::canonical::{canonical_hash, canonicalize_for_golden};
use crate::golden::GoldenRecorder;
use crate::guard::ExternalCallGuard;
use crate::policy::PolicyEnforcer;
use crate::repository::audit::AuditError;
use crate::repository::checkpoint::{CheckpointError, CheckpointStore};
use crate::repository::golden::GoldenLog;
use crate::skill::{SkillContext, SkillError, SkillRegistry, execute_with_timeout};
use crate::taxonomy::{ErrorContext, classify_failure, workflow_error};

use super::checkpoint::CheckpointManager;
use super::dag::execution_order;
use super::definition::{SpecError, validate_spec};
use super::recorder::{Invocation, NullRecorder, OpRecorder};
use super::retry::{FailureDisposition, RetryHandler};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures of the run itself, as opposed to step failures (which end up in
/// [`RunResult::errors`]).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid workflow spec: {0}")]
    Spec(#[from] SpecError),

    /// Another executor advanced the same run. Never retried here.
    #[error(transparent)]
    VersionConflict(#[from] VersionConflictError),

    #[error("checkpoint store error: {0}")]
    Checkpoint(RepositoryError),

    #[error("golden log error: {0}")]
    Golden(RepositoryError),

    #[error("audit error: {0}")]
    Audit(#[from] AuditError),

    #[error("no checkpoint found for run '{0}'")]
    CheckpointNotFound(String),

    #[error("checkpoint of run '{run_id}' points at step {next_step_index} but the workflow has {steps} steps")]
    CheckpointOutOfRange {
        run_id: String,
        next_step_index: usize,
        steps: usize,
    },
}

impl From<CheckpointError> for EngineError {
    fn from(err: CheckpointError) -> Self {
        match err {
            CheckpointError::VersionConflict(conflict) => EngineError::VersionConflict(conflict),
            CheckpointError::Repository(repo) => EngineError::Checkpoint(repo),
        }
    }
}

// ---------------------------------------------------------------------------
// Run parameters and internal state
// ---------------------------------------------------------------------------

/// Caller-supplied identity of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunParams {
    pub run_id: String,
    /// Recorded in `run_start`; identical spec + seed + skill outputs yield
    /// an identical golden sequence.
    pub seed: u64,
    pub tenant_id: Option<String>,
}

impl RunParams {
    pub fn new(run_id: impl Into<String>, seed: u64) -> Self {
        Self {
            run_id: run_id.into(),
            seed,
            tenant_id: None,
        }
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }
}

#[derive(Debug, Default)]
struct RunState {
    outputs: BTreeMap<String, Value>,
    steps: Vec<StepOutcome>,
    errors: Vec<WorkflowError>,
    spent_cents: u64,
    ops_total: u64,
    ops_completed: u64,
    ops_failed: u64,
}

/// A finished step plus what the run does next. `disposition` is `None`
/// for successful steps.
struct StepResult {
    outcome: StepOutcome,
    disposition: Option<FailureDisposition>,
}

/// The fixed part of every invocation of one step.
struct StepScope<'a> {
    run_id: &'a str,
    tenant_id: Option<&'a str>,
    step: &'a StepDescriptor,
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Generic over the checkpoint and golden stores for storage flexibility.
pub struct WorkflowEngine<C: CheckpointStore, G: GoldenLog> {
    checkpoints: CheckpointManager<C>,
    golden: GoldenRecorder<G>,
    registry: SkillRegistry,
    policy: Option<Arc<PolicyEnforcer>>,
    guard: Arc<ExternalCallGuard>,
}

impl<C: CheckpointStore, G: GoldenLog> WorkflowEngine<C, G> {
    /// Unconstrained engine using the process-wide external call guard.
    pub fn new(checkpoints: Arc<C>, golden: Arc<G>, registry: SkillRegistry) -> Self {
        Self {
            checkpoints: CheckpointManager::new(checkpoints),
            golden: GoldenRecorder::new(golden),
            registry,
            policy: None,
            guard: ExternalCallGuard::global(),
        }
    }

    /// Engine configured from `ledgerflow.toml` settings.
    pub fn from_config(
        checkpoints: Arc<C>,
        golden: Arc<G>,
        registry: SkillRegistry,
        config: &LedgerflowConfig,
    ) -> Self {
        let engine = Self::new(checkpoints, golden, registry)
            .with_golden_options(config.golden)
            .with_guard(Arc::new(ExternalCallGuard::from_env(&config.guard)));
        match &config.policy {
            Some(policy) => engine.with_policy(PolicyEnforcer::new(policy.clone())),
            None => engine,
        }
    }

    pub fn with_policy(mut self, policy: PolicyEnforcer) -> Self {
        self.policy = Some(Arc::new(policy));
        self
    }

    pub fn with_golden_options(mut self, options: GoldenOptions) -> Self {
        self.golden.set_options(options);
        self
    }

    pub fn with_guard(mut self, guard: Arc<ExternalCallGuard>) -> Self {
        self.guard = guard;
        self
    }

    pub fn registry(&self) -> &SkillRegistry {
        &self.registry
    }

    pub fn policy(&self) -> Option<&PolicyEnforcer> {
        self.policy.as_deref()
    }

    pub fn guard(&self) -> &Arc<ExternalCallGuard> {
        &self.guard
    }

    pub fn golden(&self) -> &GoldenRecorder<G> {
        &self.golden
    }

    pub fn checkpoints(&self) -> &CheckpointManager<C> {
        &self.checkpoints
    }

    // -----------------------------------------------------------------------
    // Entry points
    // -----------------------------------------------------------------------

    /// Execute `spec` from the beginning under `params.run_id`.
    pub async fn run(&self, spec: &WorkflowSpec, params: &RunParams) -> Result<RunResult, EngineError> {
        self.execute(spec, params, &NullRecorder).await
    }

    /// Continue a run from its last checkpoint.
    pub async fn resume(
        &self,
        spec: &WorkflowSpec,
        params: &RunParams,
    ) -> Result<RunResult, EngineError> {
        self.resume_with(spec, params, &NullRecorder).await
    }

    pub(crate) async fn execute<R: OpRecorder>(
        &self,
        spec: &WorkflowSpec,
        params: &RunParams,
        recorder: &R,
    ) -> Result<RunResult, EngineError> {
        let started = Instant::now();
        validate_spec(spec)?;
        let order = execution_order(&spec.steps)?;

        info!(
            run_id = %params.run_id,
            workflow_id = %spec.id,
            steps = order.len(),
            seed = params.seed,
            "workflow run starting"
        );

        let checkpoint = self
            .checkpoints
            .begin(&params.run_id, params.tenant_id.clone())
            .await?;
        self.record(
            &params.run_id,
            GoldenEventType::RunStart,
            &self.run_start_data(spec, &order, params),
        )
        .await?;

        self.drive(&order, params, checkpoint, RunState::default(), recorder, started)
            .await
    }

    pub(crate) async fn resume_with<R: OpRecorder>(
        &self,
        spec: &WorkflowSpec,
        params: &RunParams,
        recorder: &R,
    ) -> Result<RunResult, EngineError> {
        let started = Instant::now();
        validate_spec(spec)?;
        let order = execution_order(&spec.steps)?;

        let checkpoint = self
            .checkpoints
            .restore(&params.run_id)
            .await
            .map_err(EngineError::Checkpoint)?
            .ok_or_else(|| EngineError::CheckpointNotFound(params.run_id.clone()))?;

        if checkpoint.status.is_terminal() {
            info!(
                run_id = %params.run_id,
                status = %checkpoint.status,
                "run already finished, nothing to resume"
            );
            return Ok(RunResult {
                run_id: params.run_id.clone(),
                status: checkpoint.status,
                exit_code: RunResult::exit_code_for(checkpoint.status),
                total_ops: 0,
                completed_ops: 0,
                failed_ops: 0,
                duration_ms: 0,
                output: checkpoint.step_outputs,
                errors: Vec::new(),
                steps: Vec::new(),
            });
        }

        if checkpoint.next_step_index > order.len() {
            return Err(EngineError::CheckpointOutOfRange {
                run_id: params.run_id.clone(),
                next_step_index: checkpoint.next_step_index,
                steps: order.len(),
            });
        }

        let state = RunState {
            outputs: checkpoint.step_outputs.clone(),
            spent_cents: checkpoint.spent_cents,
            ..RunState::default()
        };

        info!(
            run_id = %params.run_id,
            next_step_index = checkpoint.next_step_index,
            version = checkpoint.version,
            "resuming workflow run"
        );
        self.drive(&order, params, checkpoint, state, recorder, started)
            .await
    }

    // -----------------------------------------------------------------------
    // Run loop
    // -----------------------------------------------------------------------

    async fn drive<R: OpRecorder>(
        &self,
        order: &[&StepDescriptor],
        params: &RunParams,
        mut checkpoint: Checkpoint,
        mut state: RunState,
        recorder: &R,
        started: Instant,
    ) -> Result<RunResult, EngineError> {
        let run_id = params.run_id.as_str();
        let tenant_id = params
            .tenant_id
            .clone()
            .or_else(|| checkpoint.tenant_id.clone());
        let mut status = RunStatus::Completed;

        for (index, &step) in order.iter().enumerate().skip(checkpoint.next_step_index) {
            let scope = StepScope {
                run_id,
                tenant_id: tenant_id.as_deref(),
                step,
            };
            let StepResult {
                outcome,
                disposition,
            } = self.execute_step(&scope, &mut state, recorder).await?;

            if outcome.status.is_success() {
                if let Some(output) = &outcome.output {
                    state.outputs.insert(step.id.clone(), output.clone());
                }
            } else if let Some(error) = &outcome.error {
                state.errors.push(error.clone());
            }

            checkpoint = self
                .checkpoints
                .advance(
                    &checkpoint,
                    index + 1,
                    RunStatus::Running,
                    &state.outputs,
                    state.spent_cents,
                )
                .await?;

            self.record(run_id, GoldenEventType::Step, &step_event_data(&outcome))
                .await?;
            let aborted = disposition == Some(FailureDisposition::Abort);
            let abort_error = outcome.error.clone().filter(|_| aborted);
            state.steps.push(outcome);

            if aborted {
                warn!(run_id, step_id = %step.id, "aborting workflow run");
                status = RunStatus::Failed;
                if let Some(error) = abort_error {
                    self.record_skipped(
                        &order[index + 1..],
                        run_id,
                        tenant_id.as_deref(),
                        &error,
                        &mut state,
                        recorder,
                    )
                    .await?;
                }
                break;
            }
        }

        self.checkpoints
            .advance(
                &checkpoint,
                checkpoint.next_step_index,
                status,
                &state.outputs,
                state.spent_cents,
            )
            .await?;
        self.record(run_id, GoldenEventType::RunEnd, &run_end_data(status, &state))
            .await?;

        let duration_ms = started.elapsed().as_millis() as u64;
        info!(
            run_id,
            status = %status,
            ops = state.ops_total,
            errors = state.errors.len(),
            duration_ms,
            "workflow run finished"
        );

        Ok(RunResult {
            run_id: run_id.to_string(),
            status,
            exit_code: RunResult::exit_code_for(status),
            total_ops: state.ops_total,
            completed_ops: state.ops_completed,
            failed_ops: state.ops_failed,
            duration_ms,
            output: state.outputs,
            errors: state.errors,
            steps: state.steps,
        })
    }

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    async fn execute_step<R: OpRecorder>(
        &self,
        scope: &StepScope<'_>,
        state: &mut RunState,
        recorder: &R,
    ) -> Result<StepResult, EngineError> {
        let step = scope.step;
        debug!(
            run_id = scope.run_id,
            step_id = %step.id,
            skill_id = %step.skill_id,
            "executing step"
        );

        if let Some(policy) = &self.policy {
            if let Err(violation) = policy.check_step(step.estimated_cost_cents, state.spent_cents)
            {
                let error = classify_failure(
                    &SkillError::Policy(violation),
                    &ErrorContext::step(scope.run_id, &step.id),
                );
                warn!(
                    run_id = scope.run_id,
                    step_id = %step.id,
                    code = %error.code,
                    "step rejected by policy"
                );
                self.record_uninvoked(scope, &error, state, recorder).await?;
                return Ok(failed(step, &step.skill_id, 0, error, RetryHandler::disposition(step)));
            }
        }
        state.spent_cents = state.spent_cents.saturating_add(step.estimated_cost_cents);

        match step.on_error {
            OnError::Retry => self.run_with_retry(scope, state, recorder).await,
            OnError::Fallback => self.run_with_fallback(scope, state, recorder).await,
            OnError::Abort | OnError::Continue => {
                match self.invoke(scope, &step.skill_id, &step.inputs, 1, state, recorder).await? {
                    Ok(output) => Ok(self.succeeded(step, &step.skill_id, 1, output, StepStatus::Completed)),
                    Err(error) => {
                        warn!(
                            run_id = scope.run_id,
                            step_id = %step.id,
                            code = %error.code,
                            "step failed"
                        );
                        Ok(failed(step, &step.skill_id, 1, error, RetryHandler::disposition(step)))
                    }
                }
            }
        }
    }

    async fn run_with_retry<R: OpRecorder>(
        &self,
        scope: &StepScope<'_>,
        state: &mut RunState,
        recorder: &R,
    ) -> Result<StepResult, EngineError> {
        let step = scope.step;
        let policy = step.effective_retry_policy();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let error = match self
                .invoke(scope, &step.skill_id, &step.inputs, attempt, state, recorder)
                .await?
            {
                Ok(output) => {
                    return Ok(self.succeeded(step, &step.skill_id, attempt, output, StepStatus::Completed));
                }
                Err(error) => error,
            };

            if !RetryHandler::should_retry(&policy, attempt, &error) {
                warn!(
                    run_id = scope.run_id,
                    step_id = %step.id,
                    attempts = attempt,
                    code = %error.code,
                    "step failed, retries exhausted or not applicable"
                );
                return Ok(failed(step, &step.skill_id, attempt, error, RetryHandler::disposition(step)));
            }

            let delay = RetryHandler::backoff(&policy, attempt);
            warn!(
                run_id = scope.run_id,
                step_id = %step.id,
                attempt,
                code = %error.code,
                delay_ms = delay.as_millis() as u64,
                "retrying step"
            );
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }

    async fn run_with_fallback<R: OpRecorder>(
        &self,
        scope: &StepScope<'_>,
        state: &mut RunState,
        recorder: &R,
    ) -> Result<StepResult, EngineError> {
        let step = scope.step;
        let primary_error = match self
            .invoke(scope, &step.skill_id, &step.inputs, 1, state, recorder)
            .await?
        {
            Ok(output) => {
                return Ok(self.succeeded(step, &step.skill_id, 1, output, StepStatus::Completed));
            }
            Err(error) => error,
        };

        let Some(fallback_skill) = step.fallback_skill.as_deref() else {
            return Ok(failed(step, &step.skill_id, 1, primary_error, FailureDisposition::Abort));
        };
        warn!(
            run_id = scope.run_id,
            step_id = %step.id,
            code = %primary_error.code,
            fallback_skill,
            "primary skill failed, invoking fallback"
        );

        let params = step.fallback_params.as_ref().unwrap_or(&step.inputs);
        match self.invoke(scope, fallback_skill, params, 2, state, recorder).await? {
            Ok(output) => {
                let mut result = self.succeeded(step, fallback_skill, 2, output, StepStatus::Fallback);
                result.outcome.error = Some(primary_error);
                Ok(result)
            }
            Err(error) => {
                warn!(
                    run_id = scope.run_id,
                    step_id = %step.id,
                    code = %error.code,
                    "fallback skill failed"
                );
                Ok(failed(step, fallback_skill, 2, error, FailureDisposition::Abort))
            }
        }
    }

    /// One skill invocation: record, call (under the step timeout),
    /// classify, record the outcome.
    async fn invoke<R: OpRecorder>(
        &self,
        scope: &StepScope<'_>,
        skill_id: &str,
        inputs: &BTreeMap<String, Value>,
        attempt: u32,
        state: &mut RunState,
        recorder: &R,
    ) -> Result<Result<Value, WorkflowError>, EngineError> {
        let step = scope.step;
        let args = step_args(inputs);
        let skill = self.registry.get(skill_id);

        let invocation = Invocation {
            run_id: scope.run_id,
            step,
            skill_id,
            args: &args,
            skill_version: skill.as_ref().and_then(|s| s.version_dyn()),
            attempt,
            tenant_id: scope.tenant_id,
        };
        let op_id = recorder.begin(&invocation).await?;

        let started = Instant::now();
        let raw = match skill {
            None => Err(SkillError::NotFound(skill_id.to_string())),
            Some(skill) => {
                let ctx = SkillContext::live(self.guard.clone());
                execute_with_timeout(skill.as_ref(), &args, &ctx, step.timeout_ms).await
            }
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let outcome = raw.map_err(|e| classify_failure(&e, &ErrorContext::step(scope.run_id, &step.id)));
        recorder.finish(op_id, &outcome, duration_ms).await?;

        state.ops_total += 1;
        if outcome.is_ok() {
            state.ops_completed += 1;
        } else {
            state.ops_failed += 1;
        }
        Ok(outcome)
    }

    /// Record a failed op for a step whose skill never ran.
    async fn record_uninvoked<R: OpRecorder>(
        &self,
        scope: &StepScope<'_>,
        error: &WorkflowError,
        state: &mut RunState,
        recorder: &R,
    ) -> Result<(), EngineError> {
        let step = scope.step;
        let args = step_args(&step.inputs);
        let invocation = Invocation {
            run_id: scope.run_id,
            step,
            skill_id: &step.skill_id,
            args: &args,
            skill_version: self.registry.get(&step.skill_id).and_then(|s| s.version_dyn()),
            attempt: 1,
            tenant_id: scope.tenant_id,
        };
        recorder.record_uninvoked(&invocation, error).await?;
        state.ops_total += 1;
        state.ops_failed += 1;
        Ok(())
    }

    /// Steps cut off by an abort each get a failed op carrying the aborting code.
    async fn record_skipped<R: OpRecorder>(
        &self,
        remaining: &[&StepDescriptor],
        run_id: &str,
        tenant_id: Option<&str>,
        abort: &WorkflowError,
        state: &mut RunState,
        recorder: &R,
    ) -> Result<(), EngineError> {
        for &step in remaining {
            let error = workflow_error(
                abort.code,
                format!("not executed: run aborted with {}", abort.code),
            )
            .with_run(run_id)
            .with_step(&step.id);
            let scope = StepScope {
                run_id,
                tenant_id,
                step,
            };
            self.record_uninvoked(&scope, &error, state, recorder).await?;
        }
        Ok(())
    }

    fn succeeded(
        &self,
        step: &StepDescriptor,
        skill_id: &str,
        attempts: u32,
        output: Value,
        status: StepStatus,
    ) -> StepResult {
        let output_hash = canonical_hash(&canonicalize_for_golden(&output, self.golden.options()));
        StepResult {
            outcome: StepOutcome {
                step_id: step.id.clone(),
                skill_id: skill_id.to_string(),
                status,
                attempts,
                output: Some(output),
                error: None,
                output_hash: Some(output_hash),
            },
            disposition: None,
        }
    }

    // -----------------------------------------------------------------------
    // Golden events
    // -----------------------------------------------------------------------

    async fn record(
        &self,
        run_id: &str,
        event_type: GoldenEventType,
        data: &Value,
    ) -> Result<(), EngineError> {
        self.golden
            .record(run_id, event_type, data)
            .await
            .map_err(EngineError::Golden)?;
        Ok(())
    }

    fn run_start_data(&self, spec: &WorkflowSpec, order: &[&StepDescriptor], params: &RunParams) -> Value {
        let mut data = json!({
            "workflow_id": spec.id,
            "workflow_name": spec.name,
            "seed": params.seed,
            "step_count": order.len(),
            "step_order": order.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
        });
        if let Some(policy) = &self.policy {
            let snapshot = policy.budget_snapshot();
            data["budget_snapshot"] = json!({
                "step_ceiling_cents": snapshot.step_ceiling_cents,
                "workflow_ceiling_cents": snapshot.workflow_ceiling_cents,
                "policy_version": snapshot.policy_version,
            });
        }
        data
    }
}

fn step_args(inputs: &BTreeMap<String, Value>) -> Value {
    Value::Object(
        inputs
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect::<Map<String, Value>>(),
    )
}

fn failed(
    step: &StepDescriptor,
    skill_id: &str,
    attempts: u32,
    error: WorkflowError,
    disposition: FailureDisposition,
) -> StepResult {
    StepResult {
        outcome: StepOutcome {
            step_id: step.id.clone(),
            skill_id: skill_id.to_string(),
            status: StepStatus::Failed,
            attempts,
            output: None,
            error: Some(error),
            output_hash: None,
        },
        disposition: Some(disposition),
    }
}

fn step_event_data(outcome: &StepOutcome) -> Value {
    let mut data = json!({
        "step_id": outcome.step_id,
        "skill_id": outcome.skill_id,
        "status": outcome.status.as_str(),
        "attempts": outcome.attempts,
    });
    if let Some(error) = &outcome.error {
        data["error_code"] = json!(error.code.as_str());
    }
    if let Some(output) = &outcome.output {
        data["output"] = output.clone();
    }
    if let Some(hash) = &outcome.output_hash {
        data["output_hash"] = json!(hash);
    }
    data
}

fn run_end_data(status: RunStatus, state: &RunState) -> Value {
    let completed = state.steps.iter().filter(|s| s.status.is_success()).count();
    json!({
        "status": status.as_str(),
        "steps_total": state.steps.len(),
        "steps_completed": completed,
        "steps_failed": state.steps.len() - completed,
        "error_codes": state.errors.iter().map(|e| e.code.as_str()).collect::<Vec<_>>(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::checkpoint::CheckpointStore;
    use crate::skill::Skill;
    use crate::storage::{InMemoryCheckpointStore, InMemoryGoldenLog};
    use crate::workflow::test_support::{Flaky, engine, registry, spec, step, step_with_inputs};
    use ledgerflow_types::checkpoint::CheckpointWrite;
    use ledgerflow_types::config::PolicyConfig;
    use ledgerflow_types::error::ErrorCode;
    use ledgerflow_types::workflow::{ExhaustedAction, RetryPolicy};

    fn retrying(id: &str, skill_id: &str, max_attempts: u32, on_exhausted: ExhaustedAction) -> StepDescriptor {
        let mut s = step(id, skill_id);
        s.on_error = OnError::Retry;
        s.retry_policy = Some(RetryPolicy {
            max_attempts,
            backoff_ms: 1,
            on_exhausted,
            ..RetryPolicy::default()
        });
        s
    }

    fn costing(id: &str, cents: u64) -> StepDescriptor {
        let mut s = step(id, "echo");
        s.estimated_cost_cents = cents;
        s
    }

    #[tokio::test]
    async fn completes_all_steps_in_order() {
        let engine = engine(registry());
        let wf = spec(vec![
            step_with_inputs("a", "echo", json!({"x": 1})),
            step_with_inputs("b", "echo", json!({"x": 2})),
            step_with_inputs("c", "echo", json!({"x": 3})),
        ]);
        let result = engine.run(&wf, &RunParams::new("run-1", 42)).await.unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.total_ops, 3);
        assert_eq!(result.completed_ops, 3);
        assert!(result.errors.is_empty());
        assert_eq!(result.output["b"], json!({"echo": {"x": 2}}));
        assert!(result.steps.iter().all(|s| s.output_hash.is_some()));

        let events = engine.golden().get_events("run-1").await.unwrap();
        assert_eq!(events.len(), 5);
        assert_eq!(events[0].event_type, GoldenEventType::RunStart);
        assert_eq!(events[0].data["seed"], json!(42));
        assert_eq!(events[0].data["step_order"], json!(["a", "b", "c"]));
        assert_eq!(events[4].event_type, GoldenEventType::RunEnd);
        assert_eq!(events[4].data["status"], json!("completed"));

        let checkpoint = engine.checkpoints().restore("run-1").await.unwrap().unwrap();
        assert_eq!(checkpoint.version, 5);
        assert_eq!(checkpoint.next_step_index, 3);
        assert_eq!(checkpoint.status, RunStatus::Completed);
        assert_eq!(checkpoint.step_outputs.len(), 3);
    }

    #[tokio::test]
    async fn abort_halts_the_run() {
        let engine = engine(registry());
        let wf = spec(vec![step("a", "echo"), step("b", "fail"), step("c", "echo")]);
        let result = engine.run(&wf, &RunParams::new("run-abort", 0)).await.unwrap();

        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.exit_code, 1);
        assert_eq!(result.steps.len(), 2);
        assert_eq!(result.total_ops, 3);
        assert_eq!(result.failed_ops, 2);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].code, ErrorCode::StepFailed);
        assert_eq!(result.errors[0].step_id.as_deref(), Some("b"));
        assert!(!result.output.contains_key("c"));

        let checkpoint = engine.checkpoints().restore("run-abort").await.unwrap().unwrap();
        assert_eq!(checkpoint.status, RunStatus::Failed);
        assert_eq!(checkpoint.next_step_index, 2);
    }

    #[tokio::test]
    async fn continue_proceeds_past_failure() {
        let engine = engine(registry());
        let mut b = step("b", "fail");
        b.on_error = OnError::Continue;
        let wf = spec(vec![step("a", "echo"), b, step("c", "echo")]);
        let result = engine.run(&wf, &RunParams::new("run-cont", 0)).await.unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.steps.len(), 3);
        assert_eq!(result.steps[1].status, StepStatus::Failed);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.failed_ops, 1);
        assert!(result.output.contains_key("c"));
        assert!(!result.output.contains_key("b"));

        let events = engine.golden().get_events("run-cont").await.unwrap();
        assert_eq!(events[4].data["error_codes"], json!(["STEP_FAILED"]));
        assert_eq!(events[4].data["steps_failed"], json!(1));
    }

    #[tokio::test]
    async fn retry_until_success() {
        let registry = registry().with("flaky", Flaky::new(2));
        let engine = engine(registry);
        let wf = spec(vec![retrying("a", "flaky", 3, ExhaustedAction::Abort)]);
        let result = engine.run(&wf, &RunParams::new("run-retry", 0)).await.unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.steps[0].attempts, 3);
        assert_eq!(result.total_ops, 3);
        assert_eq!(result.failed_ops, 2);
        assert!(result.errors.is_empty());
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let engine = engine(registry());
        let wf = spec(vec![retrying("a", "fail", 5, ExhaustedAction::Abort)]);
        let result = engine.run(&wf, &RunParams::new("run-perm", 0)).await.unwrap();

        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.steps[0].attempts, 1);
        assert_eq!(result.total_ops, 1);
    }

    #[tokio::test]
    async fn exhausted_retries_follow_on_exhausted() {
        let engine = engine(registry());
        let wf = spec(vec![
            retrying("a", "unavailable", 3, ExhaustedAction::Continue),
            step("b", "echo"),
        ]);
        let result = engine.run(&wf, &RunParams::new("run-exhaust", 0)).await.unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.steps[0].attempts, 3);
        assert_eq!(result.steps[0].status, StepStatus::Failed);
        assert_eq!(result.errors[0].code, ErrorCode::ServiceUnavailable);
        assert_eq!(result.steps[1].status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn fallback_replaces_failed_primary() {
        let engine = engine(registry());
        let mut a = step_with_inputs("a", "fail", json!({"x": 1}));
        a.on_error = OnError::Fallback;
        a.fallback_skill = Some("echo".to_string());
        let wf = spec(vec![a, step("b", "echo")]);
        let result = engine.run(&wf, &RunParams::new("run-fb", 0)).await.unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        let outcome = &result.steps[0];
        assert_eq!(outcome.status, StepStatus::Fallback);
        assert_eq!(outcome.skill_id, "echo");
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.error.as_ref().map(|e| e.code), Some(ErrorCode::StepFailed));
        assert_eq!(result.output["a"], json!({"echo": {"x": 1}}));
        assert!(result.errors.is_empty());
        assert_eq!(result.total_ops, 3);
    }

    #[tokio::test]
    async fn failing_fallback_aborts() {
        let engine = engine(registry());
        let mut a = step("a", "fail");
        a.on_error = OnError::Fallback;
        a.fallback_skill = Some("unavailable".to_string());
        let wf = spec(vec![a, step("b", "echo")]);
        let result = engine.run(&wf, &RunParams::new("run-fb-fail", 0)).await.unwrap();

        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.steps.len(), 1);
        assert_eq!(result.errors[0].code, ErrorCode::ServiceUnavailable);
    }

    #[tokio::test]
    async fn missing_skill_is_classified() {
        let engine = engine(registry());
        let wf = spec(vec![step("a", "no.such.skill")]);
        let result = engine.run(&wf, &RunParams::new("run-missing", 0)).await.unwrap();

        assert_eq!(result.status, RunStatus::Failed);
        let error = &result.errors[0];
        assert_eq!(error.code, ErrorCode::SkillNotFound);
        assert_eq!(error.details["skill_id"], json!("no.such.skill"));
    }

    #[tokio::test]
    async fn step_timeout_is_classified() {
        let engine = engine(registry());
        let mut a = step("a", "slow");
        a.timeout_ms = Some(20);
        let wf = spec(vec![a]);
        let result = engine.run(&wf, &RunParams::new("run-timeout", 0)).await.unwrap();

        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.errors[0].code, ErrorCode::Timeout);
        assert!(result.errors[0].retryable);
    }

    #[tokio::test]
    async fn step_ceiling_rejects_before_invocation() {
        let engine = engine(registry()).with_policy(PolicyEnforcer::new(PolicyConfig::new(10, 100, 3)));
        let wf = spec(vec![costing("a", 5), costing("b", 11)]);
        let result = engine.run(&wf, &RunParams::new("run-step-ceiling", 0)).await.unwrap();

        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.total_ops, 2);
        assert_eq!(result.completed_ops, 1);
        assert_eq!(result.steps[1].attempts, 0);
        let error = &result.errors[0];
        assert_eq!(error.code, ErrorCode::StepCeilingExceeded);
        assert_eq!(error.details["limit_cents"], json!(10));
        assert_eq!(error.details["current_cents"], json!(11));

        let events = engine.golden().get_events("run-step-ceiling").await.unwrap();
        assert_eq!(
            events[0].data["budget_snapshot"],
            json!({"step_ceiling_cents": 10, "workflow_ceiling_cents": 100, "policy_version": 3})
        );
    }

    #[tokio::test]
    async fn workflow_ceiling_counts_projected_spend() {
        let engine = engine(registry()).with_policy(PolicyEnforcer::new(PolicyConfig::new(50, 100, 1)));
        let wf = spec(vec![costing("a", 40), costing("b", 40), costing("c", 40)]);
        let result = engine.run(&wf, &RunParams::new("run-wf-ceiling", 0)).await.unwrap();

        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.steps.len(), 3);
        let error = &result.errors[0];
        assert_eq!(error.code, ErrorCode::WorkflowCeilingExceeded);
        assert_eq!(error.step_id.as_deref(), Some("c"));
        assert_eq!(error.details["current_cents"], json!(120));
    }

    #[tokio::test]
    async fn spend_is_checkpointed_per_step() {
        let engine = engine(registry()).with_policy(PolicyEnforcer::new(PolicyConfig::new(50, 100, 1)));
        let mut a = costing("a", 60);
        a.on_error = OnError::Continue;
        let wf = spec(vec![a, costing("b", 40), costing("c", 40)]);
        let result = engine.run(&wf, &RunParams::new("run-spend", 0)).await.unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(
            result.errors.iter().map(|e| e.code).collect::<Vec<_>>(),
            vec![ErrorCode::StepCeilingExceeded]
        );
        let checkpoint = engine.checkpoints().restore("run-spend").await.unwrap().unwrap();
        assert_eq!(checkpoint.spent_cents, 80);
    }

    #[tokio::test]
    async fn resume_restores_admitted_spend() {
        let engine = engine(registry()).with_policy(PolicyEnforcer::new(PolicyConfig::new(50, 100, 1)));
        let mut a = costing("a", 60);
        a.on_error = OnError::Continue;
        let wf = spec(vec![a, costing("b", 40), costing("c", 40)]);

        // a was rejected by policy, only b's cost was admitted.
        let mut outputs = BTreeMap::new();
        outputs.insert("b".to_string(), json!({"echo": {}}));
        engine
            .checkpoints()
            .store()
            .save(
                CheckpointWrite::new("run-resume-spend", 2, RunStatus::Running)
                    .with_outputs(outputs)
                    .with_spent(40),
            )
            .await
            .unwrap();

        let result = engine
            .resume(&wf, &RunParams::new("run-resume-spend", 0))
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        assert!(result.errors.is_empty());
        assert_eq!(result.steps.len(), 1);
        assert_eq!(result.steps[0].step_id, "c");

        let checkpoint = engine.checkpoints().restore("run-resume-spend").await.unwrap().unwrap();
        assert_eq!(checkpoint.spent_cents, 80);
    }

    #[tokio::test]
    async fn emergency_stop_rejects_every_step() {
        let policy = PolicyEnforcer::new(PolicyConfig::new(100, 1000, 9));
        policy.set_emergency_stop(true);
        let engine = engine(registry()).with_policy(policy);
        let mut a = step("a", "echo");
        a.on_error = OnError::Continue;
        let wf = spec(vec![a, step("b", "echo")]);
        let result = engine.run(&wf, &RunParams::new("run-stop", 0)).await.unwrap();

        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.total_ops, 2);
        assert_eq!(result.completed_ops, 0);
        assert_eq!(result.errors.len(), 2);
        assert!(result.errors.iter().all(|e| e.code == ErrorCode::EmergencyStop));
        assert_eq!(result.errors[0].details["policy_version"], json!(9));
    }

    #[tokio::test]
    async fn unconstrained_run_has_no_budget_snapshot() {
        let engine = engine(registry());
        engine
            .run(&spec(vec![step("a", "echo")]), &RunParams::new("run-free", 0))
            .await
            .unwrap();
        let events = engine.golden().get_events("run-free").await.unwrap();
        assert!(events[0].data.get("budget_snapshot").is_none());
    }

    #[tokio::test]
    async fn golden_sequence_is_deterministic_across_runs() {
        let engine = engine(registry());
        let wf = spec(vec![
            step_with_inputs("a", "stamp", json!({"x": "alpha"})),
            step_with_inputs("b", "echo", json!({"y": 2.5})),
        ]);

        let first = engine.run(&wf, &RunParams::new("det-0", 7)).await.unwrap();
        let expected = engine.golden().deterministic_sequence("det-0").await.unwrap();
        assert!(!expected.contains("sk-live-123"));

        for i in 1..100 {
            let run_id = format!("det-{i}");
            let result = engine.run(&wf, &RunParams::new(run_id.clone(), 7)).await.unwrap();
            let sequence = engine.golden().deterministic_sequence(&run_id).await.unwrap();
            assert_eq!(sequence, expected);
            let hashes: Vec<_> = result.steps.iter().map(|s| s.output_hash.clone()).collect();
            let first_hashes: Vec<_> = first.steps.iter().map(|s| s.output_hash.clone()).collect();
            assert_eq!(hashes, first_hashes);
        }
    }

    #[tokio::test]
    async fn duplicate_run_id_conflicts() {
        let engine = engine(registry());
        let wf = spec(vec![step("a", "echo")]);
        engine.run(&wf, &RunParams::new("dup", 0)).await.unwrap();

        let err = engine.run(&wf, &RunParams::new("dup", 0)).await.unwrap_err();
        match err {
            EngineError::VersionConflict(conflict) => {
                assert_eq!(conflict.expected_version, None);
                assert_eq!(conflict.actual_version, 3);
            }
            other => panic!("expected version conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_spec_is_rejected() {
        let engine = engine(registry());
        let err = engine
            .run(&spec(vec![]), &RunParams::new("empty", 0))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Spec(_)));
    }

    #[tokio::test]
    async fn resume_continues_from_checkpoint() {
        let engine = engine(registry());
        let wf = spec(vec![step("a", "echo"), step("b", "echo"), step("c", "echo")]);

        let mut outputs = BTreeMap::new();
        outputs.insert("a".to_string(), json!({"echo": {}}));
        engine
            .checkpoints()
            .store()
            .save(
                CheckpointWrite::new("run-resume", 1, RunStatus::Running)
                    .with_outputs(outputs)
                    .with_tenant(Some("acme".to_string())),
            )
            .await
            .unwrap();

        let result = engine.resume(&wf, &RunParams::new("run-resume", 0)).await.unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.total_ops, 2);
        assert_eq!(
            result.steps.iter().map(|s| s.step_id.as_str()).collect::<Vec<_>>(),
            vec!["b", "c"]
        );
        assert_eq!(result.output.len(), 3);

        let checkpoint = engine.checkpoints().restore("run-resume").await.unwrap().unwrap();
        assert_eq!(checkpoint.version, 4);
        assert_eq!(checkpoint.tenant_id.as_deref(), Some("acme"));
    }

    /// Saves a checkpoint of its own run mid-step, like a second executor would.
    struct Interloper {
        store: Arc<InMemoryCheckpointStore>,
        run_id: &'static str,
    }

    impl Skill for Interloper {
        async fn execute(&self, _inputs: &Value, _ctx: &SkillContext) -> Result<Value, SkillError> {
            let current = self
                .store
                .load(self.run_id)
                .await
                .map_err(|e| SkillError::Failed(e.to_string()))?
                .ok_or_else(|| SkillError::Failed("no checkpoint".into()))?;
            self.store
                .save(
                    CheckpointWrite::new(self.run_id, current.next_step_index, RunStatus::Running)
                        .expecting(current.version),
                )
                .await
                .map_err(|e| SkillError::Failed(e.to_string()))?;
            Ok(json!({"hijacked": true}))
        }
    }

    #[tokio::test]
    async fn step_event_is_not_recorded_when_checkpoint_conflicts() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let registry = registry().with(
            "interloper",
            Interloper {
                store: store.clone(),
                run_id: "run-hijack",
            },
        );
        let engine = WorkflowEngine::new(store, Arc::new(InMemoryGoldenLog::new()), registry)
            .with_guard(Arc::new(ExternalCallGuard::disabled()));
        let wf = spec(vec![step("a", "echo"), step("b", "interloper")]);

        let err = engine.run(&wf, &RunParams::new("run-hijack", 0)).await.unwrap_err();
        assert!(matches!(err, EngineError::VersionConflict(_)));

        let events = engine.golden().get_events("run-hijack").await.unwrap();
        assert_eq!(
            events.iter().map(|e| e.event_type).collect::<Vec<_>>(),
            vec![GoldenEventType::RunStart, GoldenEventType::Step]
        );
        assert_eq!(events[1].data["step_id"], json!("a"));
    }

    #[tokio::test]
    async fn resume_of_finished_run_executes_nothing() {
        let engine = engine(registry());
        let wf = spec(vec![step("a", "echo")]);
        engine.run(&wf, &RunParams::new("done", 0)).await.unwrap();

        let result = engine.resume(&wf, &RunParams::new("done", 0)).await.unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.total_ops, 0);
        assert!(result.steps.is_empty());
        assert!(result.output.contains_key("a"));

        let checkpoint = engine.checkpoints().restore("done").await.unwrap().unwrap();
        assert_eq!(checkpoint.version, 3);
    }

    #[tokio::test]
    async fn resume_without_checkpoint_fails() {
        let engine = engine(registry());
        let err = engine
            .resume(&spec(vec![step("a", "echo")]), &RunParams::new("ghost", 0))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::CheckpointNotFound(id) if id == "ghost"));
    }
}
