//! SQLite golden event log.

use ledgerflow_core::repository::golden::GoldenLog;
use ledgerflow_types::error::RepositoryError;
use ledgerflow_types::golden::{GoldenEvent, GoldenEventType};
use serde_json::Value;
use sqlx::Row;

use super::pool::DatabasePool;
use super::{parse_json, query_error};

pub struct SqliteGoldenLog {
    pool: DatabasePool,
}

impl SqliteGoldenLog {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

impl GoldenLog for SqliteGoldenLog {
    async fn append(
        &self,
        run_id: &str,
        event_type: GoldenEventType,
        data: Value,
    ) -> Result<GoldenEvent, RepositoryError> {
        let data_json = serde_json::to_string(&data)
            .map_err(|e| RepositoryError::Query(format!("serialize golden data: {e}")))?;

        let position: i64 = sqlx::query_scalar(
            r#"INSERT INTO golden_events (run_id, position, event_type, data)
               SELECT ?, COALESCE(MAX(position) + 1, 0), ?, ?
               FROM golden_events WHERE run_id = ?
               RETURNING position"#,
        )
        .bind(run_id)
        .bind(event_type.as_str())
        .bind(&data_json)
        .bind(run_id)
        .fetch_one(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(GoldenEvent {
            run_id: run_id.to_string(),
            event_type,
            data,
            position: position as u64,
        })
    }

    async fn events(&self, run_id: &str) -> Result<Vec<GoldenEvent>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT position, event_type, data FROM golden_events WHERE run_id = ? ORDER BY position ASC",
        )
        .bind(run_id)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut events = Vec::with_capacity(rows.len());
        for row in &rows {
            let position: i64 = row.try_get("position").map_err(query_error)?;
            let event_type: String = row.try_get("event_type").map_err(query_error)?;
            let data: String = row.try_get("data").map_err(query_error)?;
            events.push(GoldenEvent {
                run_id: run_id.to_string(),
                event_type: event_type.parse().map_err(RepositoryError::Query)?,
                data: parse_json(&data, "golden data")?,
                position: position as u64,
            });
        }
        Ok(events)
    }
}
