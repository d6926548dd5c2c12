use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use ledgerflow_types::checkpoint::{Checkpoint, CheckpointWrite};
use ledgerflow_types::error::RepositoryError;

use crate::repository::checkpoint::{CheckpointError, CheckpointStore, check_expected_version};

/// Checkpoints keyed by run id.
///
/// The compare-and-set runs under the shard lock of the run's entry, so the
/// version check and the write are one atomic step.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: DashMap<String, Checkpoint>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, write: CheckpointWrite) -> Result<Checkpoint, CheckpointError> {
        match self.checkpoints.entry(write.run_id.clone()) {
            Entry::Occupied(mut entry) => {
                check_expected_version(&write, Some(entry.get()))?;
                let next = write.apply(Some(entry.get()));
                entry.insert(next.clone());
                Ok(next)
            }
            Entry::Vacant(entry) => {
                check_expected_version(&write, None)?;
                let first = write.apply(None);
                entry.insert(first.clone());
                Ok(first)
            }
        }
    }

    async fn load(&self, run_id: &str) -> Result<Option<Checkpoint>, RepositoryError> {
        Ok(self.checkpoints.get(run_id).map(|c| c.clone()))
    }
}
