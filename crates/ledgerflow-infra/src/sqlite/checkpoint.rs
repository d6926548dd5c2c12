//! SQLite checkpoint store.
//!
//! The first save of a run is an INSERT guarded by the primary key; every
//! later save is `UPDATE ... WHERE version = ?`. Both run inside a
//! transaction on the single writer connection, so the version read and
//! the write it guards cannot interleave with another save.

use std::collections::BTreeMap;

use ledgerflow_core::repository::checkpoint::{
    CheckpointError, CheckpointStore, check_expected_version,
};
use ledgerflow_types::checkpoint::{Checkpoint, CheckpointWrite, VersionConflictError};
use ledgerflow_types::error::RepositoryError;
use ledgerflow_types::workflow::RunStatus;
use serde_json::Value;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime, parse_json, query_error};

pub struct SqliteCheckpointStore {
    pool: DatabasePool,
}

impl SqliteCheckpointStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row type
// ---------------------------------------------------------------------------

struct CheckpointRow {
    run_id: String,
    version: i64,
    next_step_index: i64,
    status: String,
    step_outputs: String,
    spent_cents: i64,
    tenant_id: Option<String>,
    updated_at: String,
}

impl CheckpointRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            run_id: row.try_get("run_id")?,
            version: row.try_get("version")?,
            next_step_index: row.try_get("next_step_index")?,
            status: row.try_get("status")?,
            step_outputs: row.try_get("step_outputs")?,
            spent_cents: row.try_get("spent_cents")?,
            tenant_id: row.try_get("tenant_id")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_checkpoint(self) -> Result<Checkpoint, RepositoryError> {
        let status: RunStatus = self.status.parse().map_err(RepositoryError::Query)?;
        let step_outputs: BTreeMap<String, Value> =
            serde_json::from_value(parse_json(&self.step_outputs, "step_outputs")?)
                .map_err(|e| RepositoryError::Query(format!("invalid step_outputs: {e}")))?;

        Ok(Checkpoint {
            run_id: self.run_id,
            version: self.version as u64,
            next_step_index: self.next_step_index as usize,
            status,
            step_outputs,
            spent_cents: self.spent_cents as u64,
            tenant_id: self.tenant_id,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

const SELECT_CHECKPOINT: &str = "SELECT run_id, version, next_step_index, status, step_outputs, spent_cents, tenant_id, updated_at FROM checkpoints WHERE run_id = ?";

// ---------------------------------------------------------------------------
// CheckpointStore impl
// ---------------------------------------------------------------------------

impl CheckpointStore for SqliteCheckpointStore {
    async fn save(&self, write: CheckpointWrite) -> Result<Checkpoint, CheckpointError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        let current = sqlx::query(SELECT_CHECKPOINT)
            .bind(&write.run_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(query_error)?
            .map(|row| {
                CheckpointRow::from_row(&row)
                    .map_err(query_error)
                    .and_then(CheckpointRow::into_checkpoint)
            })
            .transpose()?;

        if let Err(conflict) = check_expected_version(&write, current.as_ref()) {
            tracing::warn!(
                run_id = %conflict.run_id,
                expected = ?conflict.expected_version,
                actual = conflict.actual_version,
                "checkpoint version conflict"
            );
            return Err(conflict.into());
        }

        let expected_version = write.expected_version;
        let next = write.apply(current.as_ref());
        let outputs = serde_json::to_string(&next.step_outputs)
            .map_err(|e| RepositoryError::Query(format!("serialize step_outputs: {e}")))?;

        let affected = match &current {
            None => sqlx::query(
                r#"INSERT INTO checkpoints
                   (run_id, version, next_step_index, status, step_outputs, spent_cents, tenant_id, updated_at)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
            )
            .bind(&next.run_id)
            .bind(next.version as i64)
            .bind(next.next_step_index as i64)
            .bind(next.status.as_str())
            .bind(&outputs)
            .bind(next.spent_cents as i64)
            .bind(&next.tenant_id)
            .bind(format_datetime(&next.updated_at))
            .execute(&mut *tx)
            .await,
            Some(previous) => sqlx::query(
                r#"UPDATE checkpoints
                   SET version = ?, next_step_index = ?, status = ?, step_outputs = ?,
                       spent_cents = ?, tenant_id = ?, updated_at = ?
                   WHERE run_id = ? AND version = ?"#,
            )
            .bind(next.version as i64)
            .bind(next.next_step_index as i64)
            .bind(next.status.as_str())
            .bind(&outputs)
            .bind(next.spent_cents as i64)
            .bind(&next.tenant_id)
            .bind(format_datetime(&next.updated_at))
            .bind(&next.run_id)
            .bind(previous.version as i64)
            .execute(&mut *tx)
            .await,
        };

        let affected = match affected {
            Ok(result) => result.rows_affected(),
            Err(e) if e.as_database_error().is_some_and(|d| d.is_unique_violation()) => 0,
            Err(e) => return Err(query_error(e).into()),
        };
        if affected == 0 {
            let actual: Option<i64> = sqlx::query_scalar("SELECT version FROM checkpoints WHERE run_id = ?")
                .bind(&next.run_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(query_error)?;
            return Err(VersionConflictError {
                run_id: next.run_id,
                expected_version,
                actual_version: actual.unwrap_or(0) as u64,
            }
            .into());
        }

        tx.commit().await.map_err(query_error)?;
        tracing::debug!(run_id = %next.run_id, version = next.version, "checkpoint saved");
        Ok(next)
    }

    async fn load(&self, run_id: &str) -> Result<Option<Checkpoint>, RepositoryError> {
        let row = sqlx::query(SELECT_CHECKPOINT)
            .bind(run_id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = CheckpointRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_checkpoint()?))
            }
            None => Ok(None),
        }
    }
}
