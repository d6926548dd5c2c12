//! WorkflowRunner -- the engine plus an audit trail.
//!
//! Every skill invocation the engine makes is appended to the
//! [`AuditStore`] as a pending op before the call and finalized after it,
//! whatever the outcome. Declared steps whose skill never ran (rejected by
//! policy, or cut off by an abort) still get one failed op with
//! `invoked = false`, so the trail covers every step. The op counts of the returned [`RunResult`] are
//! read back from the trail, so they cover the whole run even after a
//! resume. Replay of a recorded run lives in [`super::replay`].

use std::sync::Arc;

use ledgerflow_types::audit::OpStatus;
use ledgerflow_types::workflow::{RunResult, WorkflowSpec};

use crate::repository::audit::AuditStore;
use crate::repository::checkpoint::CheckpointStore;
use crate::repository::golden::GoldenLog;

use super::engine::{EngineError, RunParams, WorkflowEngine};
use super::recorder::AuditRecorder;

pub struct WorkflowRunner<C: CheckpointStore, G: GoldenLog, A: AuditStore> {
    pub(crate) engine: WorkflowEngine<C, G>,
    pub(crate) audit: Arc<A>,
}

impl<C: CheckpointStore, G: GoldenLog, A: AuditStore> WorkflowRunner<C, G, A> {
    pub fn new(engine: WorkflowEngine<C, G>, audit: Arc<A>) -> Self {
        Self { engine, audit }
    }

    pub fn engine(&self) -> &WorkflowEngine<C, G> {
        &self.engine
    }

    pub fn audit(&self) -> &A {
        &self.audit
    }

    /// Execute `spec` with every invocation recorded as an audit op.
    pub async fn run(&self, spec: &WorkflowSpec, params: &RunParams) -> Result<RunResult, EngineError> {
        let recorder = AuditRecorder::new(self.audit.as_ref());
        let result = self.engine.execute(spec, params, &recorder).await?;
        self.with_audited_counts(result).await
    }

    /// Resume a run from its checkpoint, appending to the same trail.
    pub async fn resume(
        &self,
        spec: &WorkflowSpec,
        params: &RunParams,
    ) -> Result<RunResult, EngineError> {
        let recorder = AuditRecorder::new(self.audit.as_ref());
        let result = self.engine.resume_with(spec, params, &recorder).await?;
        self.with_audited_counts(result).await
    }

    async fn with_audited_counts(&self, mut result: RunResult) -> Result<RunResult, EngineError> {
        let ops = self.audit.get_ops(&result.run_id).await?;
        result.total_ops = ops.len() as u64;
        result.completed_ops = ops.iter().filter(|op| op.status == OpStatus::Completed).count() as u64;
        result.failed_ops = ops.iter().filter(|op| op.status == OpStatus::Failed).count() as u64;
        tracing::debug!(
            run_id = %result.run_id,
            total_ops = result.total_ops,
            failed_ops = result.failed_ops,
            "audit trail counted"
        );
        Ok(result)
    }
}
