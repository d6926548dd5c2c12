//! Checkpoint manager for run progress.
//!
//! Wraps a [`CheckpointStore`] with the save discipline the engine follows:
//! the first save of a run carries no expected version, every later save
//! carries the version returned by the previous one. A conflict means some
//! other executor advanced the same run and is handed back to the caller.

use std::collections::BTreeMap;
use std::sync::Arc;

use ledgerflow_types::checkpoint::{Checkpoint, CheckpointWrite};
use ledgerflow_types::error::RepositoryError;
use ledgerflow_types::workflow::RunStatus;
use serde_json::Value;

use crate::repository::checkpoint::{CheckpointError, CheckpointStore};

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Generic over `C: CheckpointStore` so it works with any storage backend
/// (SQLite, in-memory, etc.).
pub struct CheckpointManager<C: CheckpointStore> {
    store: Arc<C>,
}

impl<C: CheckpointStore> CheckpointManager<C> {
    pub fn new(store: Arc<C>) -> Self {
        Self { store }
    }

    /// Access the underlying store.
    pub fn store(&self) -> &C {
        &self.store
    }

    /// First save of a run: version 1, nothing executed yet.
    pub async fn begin(
        &self,
        run_id: &str,
        tenant_id: Option<String>,
    ) -> Result<Checkpoint, CheckpointError> {
        let write = CheckpointWrite::new(run_id, 0, RunStatus::Running).with_tenant(tenant_id);
        let checkpoint = self.save(write).await?;
        tracing::debug!(run_id, version = checkpoint.version, "checkpointed run start");
        Ok(checkpoint)
    }

    /// Save progress on top of `current`, expecting its version.
    pub async fn advance(
        &self,
        current: &Checkpoint,
        next_step_index: usize,
        status: RunStatus,
        step_outputs: &BTreeMap<String, Value>,
        spent_cents: u64,
    ) -> Result<Checkpoint, CheckpointError> {
        let write = CheckpointWrite::new(current.run_id.clone(), next_step_index, status)
            .with_outputs(step_outputs.clone())
            .with_spent(spent_cents)
            .expecting(current.version);
        let checkpoint = self.save(write).await?;
        tracing::debug!(
            run_id = %checkpoint.run_id,
            version = checkpoint.version,
            next_step_index,
            status = %status,
            "checkpointed run progress"
        );
        Ok(checkpoint)
    }

    /// Latest checkpoint of a run.
    pub async fn restore(&self, run_id: &str) -> Result<Option<Checkpoint>, RepositoryError> {
        self.store.load(run_id).await
    }

    async fn save(&self, write: CheckpointWrite) -> Result<Checkpoint, CheckpointError> {
        let run_id = write.run_id.clone();
        self.store.save(write).await.inspect_err(|e| {
            if let CheckpointError::VersionConflict(conflict) = e {
                tracing::warn!(
                    run_id = %run_id,
                    expected = ?conflict.expected_version,
                    actual = conflict.actual_version,
                    "checkpoint version conflict"
                );
            }
        })
    }
}

impl<C: CheckpointStore> Clone for CheckpointManager<C> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
