//! Audit repository trait definition.
//!
//! The audit trail records one op per skill invocation with a gapless,
//! 1-based `op_index` per workflow run. Ops are appended as `pending` and
//! finalized exactly once through [`AuditStore::update_result`]. Replay runs
//! are persisted alongside the ops they verified.

use chrono::Utc;
use ledgerflow_types::audit::{NewOp, OpRecord, OpStatus, OpUpdate};
use ledgerflow_types::error::RepositoryError;
use ledgerflow_types::replay::ReplayRun;
use thiserror::Error;
use uuid::Uuid;

use crate::canonical::canonical_hash;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("op {0} not found")]
    OpNotFound(Uuid),

    #[error("op {op_id} is already {status}")]
    AlreadyFinalized { op_id: Uuid, status: OpStatus },

    #[error("op {0} can only be finalized as completed or failed")]
    InvalidTransition(Uuid),

    #[error("audit repository error: {0}")]
    Repository(#[from] RepositoryError),
}

/// Repository trait for the audit trail.
pub trait AuditStore: Send + Sync {
    /// Append a pending op and assign the next `op_index` for its run.
    ///
    /// Index assignment is serialized per run: concurrent appends never
    /// produce duplicate or skipped indices.
    fn append_op(
        &self,
        op: NewOp,
    ) -> impl std::future::Future<Output = Result<OpRecord, AuditError>> + Send;

    /// Finalize a pending op. The store computes `result_hash`.
    fn update_result(
        &self,
        update: OpUpdate,
    ) -> impl std::future::Future<Output = Result<OpRecord, AuditError>> + Send;

    /// Ops of a run ordered by `op_index`.
    fn get_ops(
        &self,
        workflow_run_id: &str,
    ) -> impl std::future::Future<Output = Result<Vec<OpRecord>, AuditError>> + Send;

    fn get_op(
        &self,
        op_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<OpRecord>, AuditError>> + Send;

    /// Insert or replace a replay run by `replay_id`.
    fn save_replay_run(
        &self,
        run: &ReplayRun,
    ) -> impl std::future::Future<Output = Result<(), AuditError>> + Send;

    fn get_replay_run(
        &self,
        replay_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<ReplayRun>, AuditError>> + Send;
}

/// Validate a finalization against the op's current status.
pub fn check_finalization(current: &OpRecord, update: &OpUpdate) -> Result<(), AuditError> {
    if current.status.is_final() {
        return Err(AuditError::AlreadyFinalized {
            op_id: current.op_id,
            status: current.status,
        });
    }
    if !update.status.is_final() {
        return Err(AuditError::InvalidTransition(update.op_id));
    }
    Ok(())
}

/// Build the pending record for an op appended at `op_index`.
pub fn pending_record(op: NewOp, op_index: u64) -> OpRecord {
    OpRecord {
        op_id: Uuid::now_v7(),
        args_hash: canonical_hash(&op.args),
        workflow_run_id: op.workflow_run_id,
        op_index,
        op_type: op.op_type,
        args: op.args,
        skill_version: op.skill_version,
        result: None,
        result_hash: None,
        status: OpStatus::Pending,
        error_code: None,
        error_message: None,
        duration_ms: None,
        transient: op.transient,
        invoked: op.invoked,
        timeout_ms: op.timeout_ms,
        idempotency_key: op.idempotency_key,
        tenant_id: op.tenant_id,
        created_at: Utc::now(),
        completed_at: None,
    }
}

/// Apply a validated finalization to `record`.
pub fn apply_update(record: &mut OpRecord, update: OpUpdate) {
    record.result_hash = update.result.as_ref().map(canonical_hash);
    record.result = update.result;
    record.status = update.status;
    record.error_code = update.error_code;
    record.error_message = update.error_message;
    record.duration_ms = update.duration_ms;
    record.completed_at = Some(Utc::now());
}
