//! Golden event log trait definition.

use ledgerflow_types::error::RepositoryError;
use ledgerflow_types::golden::{GoldenEvent, GoldenEventType};
use serde_json::Value;

/// Append-only, per-run ordered event log.
///
/// Positions start at 0 and increase by one per appended event within a
/// run. `data` is stored exactly as given; normalization is the caller's
/// job (see [`crate::golden::GoldenRecorder`]).
pub trait GoldenLog: Send + Sync {
    fn append(
        &self,
        run_id: &str,
        event_type: GoldenEventType,
        data: Value,
    ) -> impl std::future::Future<Output = Result<GoldenEvent, RepositoryError>> + Send;

    /// All events of a run, ordered by position.
    fn events(
        &self,
        run_id: &str,
    ) -> impl std::future::Future<Output = Result<Vec<GoldenEvent>, RepositoryError>> + Send;
}
