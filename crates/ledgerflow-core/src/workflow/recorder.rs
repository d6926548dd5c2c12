//! Per-invocation op recording hook.
//!
//! The engine reports every skill invocation (first attempts, retries and
//! fallbacks alike) to an [`OpRecorder`] before and after calling the skill.
//! Steps that never reach a skill (policy rejections, steps cut off by an
//! abort) are reported once through [`OpRecorder::record_uninvoked`].
//! A bare engine uses [`NullRecorder`]; the runner plugs in an
//! [`AuditRecorder`] so each report becomes one audit op.

use std::future::Future;

use ledgerflow_types::audit::{NewOp, OpUpdate};
use ledgerflow_types::error::WorkflowError;
use ledgerflow_types::workflow::StepDescriptor;
use semver::Version;
use serde_json::Value;
use uuid::Uuid;

use crate::repository::audit::{AuditError, AuditStore};

/// Tenant recorded on ops of runs that did not name one.
pub const DEFAULT_TENANT: &str = "default";

/// One skill invocation about to happen.
#[derive(Debug)]
pub struct Invocation<'a> {
    pub run_id: &'a str,
    pub step: &'a StepDescriptor,
    pub skill_id: &'a str,
    pub args: &'a Value,
    pub skill_version: Option<Version>,
    /// 1-based; a fallback invocation follows the primary's attempts.
    pub attempt: u32,
    pub tenant_id: Option<&'a str>,
}

impl Invocation<'_> {
    /// `{run_id}-{step_id}-{attempt}`, unique per invocation of a run.
    pub fn idempotency_key(&self) -> String {
        format!("{}-{}-{}", self.run_id, self.step.id, self.attempt)
    }
}

pub trait OpRecorder: Send + Sync {
    /// Called before the skill runs. Returns the id of the recorded op, if any.
    fn begin(
        &self,
        invocation: &Invocation<'_>,
    ) -> impl Future<Output = Result<Option<Uuid>, AuditError>> + Send;

    /// Called with the classified outcome once the skill has returned.
    fn finish(
        &self,
        op_id: Option<Uuid>,
        outcome: &Result<Value, WorkflowError>,
        duration_ms: u64,
    ) -> impl Future<Output = Result<(), AuditError>> + Send;

    /// Called for a step that ends without its skill running.
    fn record_uninvoked(
        &self,
        invocation: &Invocation<'_>,
        error: &WorkflowError,
    ) -> impl Future<Output = Result<(), AuditError>> + Send;
}

/// Records nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullRecorder;

impl OpRecorder for NullRecorder {
    async fn begin(&self, _invocation: &Invocation<'_>) -> Result<Option<Uuid>, AuditError> {
        Ok(None)
    }

    async fn finish(
        &self,
        _op_id: Option<Uuid>,
        _outcome: &Result<Value, WorkflowError>,
        _duration_ms: u64,
    ) -> Result<(), AuditError> {
        Ok(())
    }

    async fn record_uninvoked(
        &self,
        _invocation: &Invocation<'_>,
        _error: &WorkflowError,
    ) -> Result<(), AuditError> {
        Ok(())
    }
}

/// Appends one audit op per invocation and finalizes it with the outcome.
pub struct AuditRecorder<'a, A: AuditStore> {
    audit: &'a A,
}

impl<'a, A: AuditStore> AuditRecorder<'a, A> {
    pub fn new(audit: &'a A) -> Self {
        Self { audit }
    }
}

fn new_op(invocation: &Invocation<'_>, invoked: bool) -> NewOp {
    NewOp {
        workflow_run_id: invocation.run_id.to_string(),
        op_type: invocation.skill_id.to_string(),
        args: invocation.args.clone(),
        skill_version: invocation.skill_version.clone(),
        idempotency_key: Some(invocation.idempotency_key()),
        tenant_id: invocation.tenant_id.unwrap_or(DEFAULT_TENANT).to_string(),
        transient: invocation.step.transient,
        invoked,
        timeout_ms: invocation.step.timeout_ms,
    }
}

impl<A: AuditStore> OpRecorder for AuditRecorder<'_, A> {
    async fn begin(&self, invocation: &Invocation<'_>) -> Result<Option<Uuid>, AuditError> {
        let record = self.audit.append_op(new_op(invocation, true)).await?;
        tracing::debug!(
            run_id = invocation.run_id,
            step_id = %invocation.step.id,
            op_index = record.op_index,
            attempt = invocation.attempt,
            "audit op appended"
        );
        Ok(Some(record.op_id))
    }

    async fn finish(
        &self,
        op_id: Option<Uuid>,
        outcome: &Result<Value, WorkflowError>,
        duration_ms: u64,
    ) -> Result<(), AuditError> {
        let Some(op_id) = op_id else {
            return Ok(());
        };
        let update = match outcome {
            Ok(result) => OpUpdate::completed(op_id, result.clone()),
            Err(error) => OpUpdate::failed(op_id, error.code, error.message.clone()),
        };
        self.audit.update_result(update.with_duration(duration_ms)).await?;
        Ok(())
    }

    async fn record_uninvoked(
        &self,
        invocation: &Invocation<'_>,
        error: &WorkflowError,
    ) -> Result<(), AuditError> {
        let record = self.audit.append_op(new_op(invocation, false)).await?;
        self.audit
            .update_result(OpUpdate::failed(record.op_id, error.code, error.message.clone()))
            .await?;
        tracing::debug!(
            run_id = invocation.run_id,
            step_id = %invocation.step.id,
            op_index = record.op_index,
            code = %error.code,
            "uninvoked step recorded"
        );
        Ok(())
    }
}
