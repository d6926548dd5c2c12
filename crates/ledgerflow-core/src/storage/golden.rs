use dashmap::DashMap;
use ledgerflow_types::error::RepositoryError;
use ledgerflow_types::golden::{GoldenEvent, GoldenEventType};
use serde_json::Value;

use crate::repository::golden::GoldenLog;

/// Golden events keyed by run id, in append order.
#[derive(Debug, Default)]
pub struct InMemoryGoldenLog {
    events: DashMap<String, Vec<GoldenEvent>>,
}

impl InMemoryGoldenLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl GoldenLog for InMemoryGoldenLog {
    async fn append(
        &self,
        run_id: &str,
        event_type: GoldenEventType,
        data: Value,
    ) -> Result<GoldenEvent, RepositoryError> {
        let mut events = self.events.entry(run_id.to_string()).or_default();
        let event = GoldenEvent {
            run_id: run_id.to_string(),
            event_type,
            data,
            position: events.len() as u64,
        };
        events.push(event.clone());
        Ok(event)
    }

    async fn events(&self, run_id: &str) -> Result<Vec<GoldenEvent>, RepositoryError> {
        Ok(self
            .events
            .get(run_id)
            .map(|events| events.clone())
            .unwrap_or_default())
    }
}
