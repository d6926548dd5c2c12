//! Checkpoint repository trait definition.
//!
//! One checkpoint row per run, guarded by optimistic locking: every save
//! names the version it last observed and fails with a
//! [`VersionConflictError`] when the stored version has moved.

use ledgerflow_types::checkpoint::{Checkpoint, CheckpointWrite, VersionConflictError};
use ledgerflow_types::error::RepositoryError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error(transparent)]
    VersionConflict(#[from] VersionConflictError),

    #[error("checkpoint repository error: {0}")]
    Repository(#[from] RepositoryError),
}

/// Repository trait for run checkpoints.
///
/// Implementations must make [`save`](Self::save) an atomic
/// compare-and-set: of N concurrent writers holding the same
/// `expected_version`, exactly one succeeds.
pub trait CheckpointStore: Send + Sync {
    /// Create (no `expected_version`) or advance (matching
    /// `expected_version`) the checkpoint of `write.run_id`. Returns the
    /// stored checkpoint with its new version.
    fn save(
        &self,
        write: CheckpointWrite,
    ) -> impl std::future::Future<Output = Result<Checkpoint, CheckpointError>> + Send;

    /// Latest checkpoint of a run, if any.
    fn load(
        &self,
        run_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<Checkpoint>, RepositoryError>> + Send;
}

/// The compare half of compare-and-set, shared by every binding.
///
/// A write without `expected_version` is only valid for a run that has no
/// checkpoint yet; any other write must name the stored version exactly.
pub fn check_expected_version(
    write: &CheckpointWrite,
    current: Option<&Checkpoint>,
) -> Result<(), VersionConflictError> {
    let actual_version = current.map_or(0, |c| c.version);
    let ok = match (write.expected_version, current) {
        (None, None) => true,
        (Some(expected), Some(current)) => expected == current.version,
        _ => false,
    };
    if ok {
        Ok(())
    } else {
        Err(VersionConflictError {
            run_id: write.run_id.clone(),
            expected_version: write.expected_version,
            actual_version,
        })
    }
}
