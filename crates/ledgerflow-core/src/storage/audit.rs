use dashmap::DashMap;
use ledgerflow_types::audit::{NewOp, OpRecord, OpUpdate};
use ledgerflow_types::replay::ReplayRun;
use uuid::Uuid;

use crate::repository::audit::{
    AuditError, AuditStore, apply_update, check_finalization, pending_record,
};

/// Audit trail held in memory.
///
/// Ops are stored per run in `op_index` order; the per-run entry lock
/// serializes index assignment.
#[derive(Debug, Default)]
pub struct InMemoryAuditStore {
    ops: DashMap<String, Vec<OpRecord>>,
    locations: DashMap<Uuid, (String, usize)>,
    replays: DashMap<Uuid, ReplayRun>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AuditStore for InMemoryAuditStore {
    async fn append_op(&self, op: NewOp) -> Result<OpRecord, AuditError> {
        let run_id = op.workflow_run_id.clone();
        let record = {
            let mut ops = self.ops.entry(run_id.clone()).or_default();
            let record = pending_record(op, ops.len() as u64 + 1);
            ops.push(record.clone());
            record
        };
        self.locations
            .insert(record.op_id, (run_id, record.op_index as usize - 1));
        Ok(record)
    }

    async fn update_result(&self, update: OpUpdate) -> Result<OpRecord, AuditError> {
        let (run_id, position) = self
            .locations
            .get(&update.op_id)
            .map(|loc| loc.clone())
            .ok_or(AuditError::OpNotFound(update.op_id))?;

        let mut ops = self
            .ops
            .get_mut(&run_id)
            .ok_or(AuditError::OpNotFound(update.op_id))?;
        let record = ops
            .get_mut(position)
            .ok_or(AuditError::OpNotFound(update.op_id))?;
        check_finalization(record, &update)?;
        apply_update(record, update);
        Ok(record.clone())
    }

    async fn get_ops(&self, workflow_run_id: &str) -> Result<Vec<OpRecord>, AuditError> {
        Ok(self
            .ops
            .get(workflow_run_id)
            .map(|ops| ops.clone())
            .unwrap_or_default())
    }

    async fn get_op(&self, op_id: &Uuid) -> Result<Option<OpRecord>, AuditError> {
        let Some((run_id, position)) = self.locations.get(op_id).map(|loc| loc.clone()) else {
            return Ok(None);
        };
        Ok(self
            .ops
            .get(&run_id)
            .and_then(|ops| ops.get(position).cloned()))
    }

    async fn save_replay_run(&self, run: &ReplayRun) -> Result<(), AuditError> {
        self.replays.insert(run.replay_id, run.clone());
        Ok(())
    }

    async fn get_replay_run(&self, replay_id: &Uuid) -> Result<Option<ReplayRun>, AuditError> {
        Ok(self.replays.get(replay_id).map(|r| r.clone()))
    }
}
