//! GoldenRecorder -- canonicalizing front end of a [`GoldenLog`].
//!
//! Every payload is passed through [`canonicalize_for_golden`] before it is
//! appended, so the stored sequence is free of timestamps, durations and
//! secrets and can be compared byte-for-byte across runs.

use std::sync::Arc;

use ledgerflow_types::config::GoldenOptions;
use ledgerflow_types::error::RepositoryError;
use ledgerflow_types::golden::{GoldenEvent, GoldenEventType};
use serde_json::Value;

use crate::canonical::{canonical_json, canonicalize_for_golden};
use crate::repository::golden::GoldenLog;

pub struct GoldenRecorder<L: GoldenLog> {
    log: Arc<L>,
    options: GoldenOptions,
}

impl<L: GoldenLog> GoldenRecorder<L> {
    pub fn new(log: Arc<L>) -> Self {
        Self::with_options(log, GoldenOptions::default())
    }

    pub fn with_options(log: Arc<L>, options: GoldenOptions) -> Self {
        Self { log, options }
    }

    pub fn options(&self) -> &GoldenOptions {
        &self.options
    }

    pub fn set_options(&mut self, options: GoldenOptions) {
        self.options = options;
    }

    pub fn log(&self) -> &L {
        &self.log
    }

    /// Canonicalize `data` and append it to the run's sequence.
    pub async fn record(
        &self,
        run_id: &str,
        event_type: GoldenEventType,
        data: &Value,
    ) -> Result<GoldenEvent, RepositoryError> {
        let normalized = canonicalize_for_golden(data, &self.options);
        let event = self.log.append(run_id, event_type, normalized).await?;
        tracing::debug!(
            run_id,
            event_type = event_type.as_str(),
            position = event.position,
            "golden event recorded"
        );
        Ok(event)
    }

    pub async fn get_events(&self, run_id: &str) -> Result<Vec<GoldenEvent>, RepositoryError> {
        self.log.events(run_id).await
    }

    /// The run's sequence without run ids, as canonical JSON. Two runs of
    /// the same spec and seed produce identical strings.
    pub async fn deterministic_sequence(&self, run_id: &str) -> Result<String, RepositoryError> {
        let events = self.get_events(run_id).await?;
        let dicts: Vec<Value> = events.iter().map(GoldenEvent::to_deterministic_dict).collect();
        Ok(canonical_json(&Value::Array(dicts)))
    }
}

impl<L: GoldenLog> Clone for GoldenRecorder<L> {
    fn clone(&self) -> Self {
        Self {
            log: self.log.clone(),
            options: self.options,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryGoldenLog;
    use serde_json::json;

    #[tokio::test]
    async fn record_canonicalizes_payload() {
        let recorder = GoldenRecorder::new(Arc::new(InMemoryGoldenLog::new()));
        let event = recorder
            .record(
                "r1",
                GoldenEventType::Step,
                &json!({"step_id": "a", "timestamp": "now", "auth": {"token": "abc"}, "score": 0.1234567891}),
            )
            .await
            .unwrap();
        assert_eq!(event.position, 0);
        assert_eq!(
            event.data,
            json!({"step_id": "a", "auth": {"token": "[REDACTED]"}, "score": 0.123457})
        );
    }

    #[tokio::test]
    async fn sequences_ignore_run_id() {
        let recorder = GoldenRecorder::new(Arc::new(InMemoryGoldenLog::new()));
        for run in ["r1", "r2"] {
            recorder
                .record(run, GoldenEventType::RunStart, &json!({"seed": 7}))
                .await
                .unwrap();
            recorder
                .record(run, GoldenEventType::RunEnd, &json!({"status": "completed", "duration_ms": run.len()}))
                .await
                .unwrap();
        }
        let a = recorder.deterministic_sequence("r1").await.unwrap();
        let b = recorder.deterministic_sequence("r2").await.unwrap();
        assert_eq!(a, b);
        assert!(!a.contains("r1"));
    }
}
