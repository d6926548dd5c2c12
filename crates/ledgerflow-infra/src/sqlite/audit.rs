//! SQLite audit trail.
//!
//! `op_index` is computed by the INSERT itself
//! (`COALESCE(MAX(op_index), 0) + 1` over the run's rows) on the single
//! writer connection, and `UNIQUE(workflow_run_id, op_index)` rejects any
//! duplicate that slips past. Finalization is a read-check-write inside a
//! writer transaction.

use ledgerflow_core::repository::audit::{
    AuditError, AuditStore, apply_update, check_finalization, pending_record,
};
use ledgerflow_types::audit::{NewOp, OpRecord, OpUpdate};
use ledgerflow_types::error::RepositoryError;
use ledgerflow_types::replay::{DiffEntry, ReplayRun};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime, parse_json, query_error};

pub struct SqliteAuditStore {
    pool: DatabasePool,
}

impl SqliteAuditStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

const OP_COLUMNS: &str = "op_id, workflow_run_id, op_index, op_type, args, args_hash, skill_version, result, result_hash, status, error_code, error_message, duration_ms, transient, invoked, timeout_ms, idempotency_key, tenant_id, created_at, completed_at";

struct OpRow {
    op_id: String,
    workflow_run_id: String,
    op_index: i64,
    op_type: String,
    args: String,
    args_hash: String,
    skill_version: Option<String>,
    result: Option<String>,
    result_hash: Option<String>,
    status: String,
    error_code: Option<String>,
    error_message: Option<String>,
    duration_ms: Option<i64>,
    transient: bool,
    invoked: bool,
    timeout_ms: Option<i64>,
    idempotency_key: Option<String>,
    tenant_id: String,
    created_at: String,
    completed_at: Option<String>,
}

impl OpRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            op_id: row.try_get("op_id")?,
            workflow_run_id: row.try_get("workflow_run_id")?,
            op_index: row.try_get("op_index")?,
            op_type: row.try_get("op_type")?,
            args: row.try_get("args")?,
            args_hash: row.try_get("args_hash")?,
            skill_version: row.try_get("skill_version")?,
            result: row.try_get("result")?,
            result_hash: row.try_get("result_hash")?,
            status: row.try_get("status")?,
            error_code: row.try_get("error_code")?,
            error_message: row.try_get("error_message")?,
            duration_ms: row.try_get("duration_ms")?,
            transient: row.try_get("transient")?,
            invoked: row.try_get("invoked")?,
            timeout_ms: row.try_get("timeout_ms")?,
            idempotency_key: row.try_get("idempotency_key")?,
            tenant_id: row.try_get("tenant_id")?,
            created_at: row.try_get("created_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn into_record(self) -> Result<OpRecord, RepositoryError> {
        let skill_version = self
            .skill_version
            .as_deref()
            .map(|v| {
                v.parse::<semver::Version>()
                    .map_err(|e| RepositoryError::Query(format!("invalid skill_version: {e}")))
            })
            .transpose()?;

        Ok(OpRecord {
            op_id: parse_uuid(&self.op_id)?,
            workflow_run_id: self.workflow_run_id,
            op_index: self.op_index as u64,
            op_type: self.op_type,
            args: parse_json(&self.args, "args")?,
            args_hash: self.args_hash,
            skill_version,
            result: self
                .result
                .as_deref()
                .map(|r| parse_json(r, "result"))
                .transpose()?,
            result_hash: self.result_hash,
            status: self.status.parse().map_err(RepositoryError::Query)?,
            error_code: self
                .error_code
                .as_deref()
                .map(|c| c.parse().map_err(RepositoryError::Query))
                .transpose()?,
            error_message: self.error_message,
            duration_ms: self.duration_ms.map(|d| d as u64),
            transient: self.transient,
            invoked: self.invoked,
            timeout_ms: self.timeout_ms.map(|t| t as u64),
            idempotency_key: self.idempotency_key,
            tenant_id: self.tenant_id,
            created_at: parse_datetime(&self.created_at)?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

fn record_from(row: &SqliteRow) -> Result<OpRecord, RepositoryError> {
    OpRow::from_row(row).map_err(query_error)?.into_record()
}

struct ReplayRow {
    replay_id: String,
    workflow_run_id: String,
    mode: String,
    status: String,
    ops_total: i64,
    ops_verified: i64,
    ops_failed: i64,
    ops_skipped: i64,
    first_mismatch_op_index: Option<i64>,
    mismatch_diff: Option<String>,
    started_at: String,
    completed_at: Option<String>,
}

impl ReplayRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            replay_id: row.try_get("replay_id")?,
            workflow_run_id: row.try_get("workflow_run_id")?,
            mode: row.try_get("mode")?,
            status: row.try_get("status")?,
            ops_total: row.try_get("ops_total")?,
            ops_verified: row.try_get("ops_verified")?,
            ops_failed: row.try_get("ops_failed")?,
            ops_skipped: row.try_get("ops_skipped")?,
            first_mismatch_op_index: row.try_get("first_mismatch_op_index")?,
            mismatch_diff: row.try_get("mismatch_diff")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn into_replay_run(self) -> Result<ReplayRun, RepositoryError> {
        let mismatch_diff = self
            .mismatch_diff
            .as_deref()
            .map(|d| {
                serde_json::from_str::<Vec<DiffEntry>>(d)
                    .map_err(|e| RepositoryError::Query(format!("invalid mismatch_diff: {e}")))
            })
            .transpose()?;

        Ok(ReplayRun {
            replay_id: parse_uuid(&self.replay_id)?,
            workflow_run_id: self.workflow_run_id,
            mode: self.mode.parse().map_err(RepositoryError::Query)?,
            status: self.status.parse().map_err(RepositoryError::Query)?,
            ops_total: self.ops_total as u64,
            ops_verified: self.ops_verified as u64,
            ops_failed: self.ops_failed as u64,
            ops_skipped: self.ops_skipped as u64,
            first_mismatch_op_index: self.first_mismatch_op_index.map(|i| i as u64),
            mismatch_diff,
            started_at: parse_datetime(&self.started_at)?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn to_json(value: &impl serde::Serialize, what: &str) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(format!("serialize {what}: {e}")))
}

// ---------------------------------------------------------------------------
// AuditStore impl
// ---------------------------------------------------------------------------

impl AuditStore for SqliteAuditStore {
    async fn append_op(&self, op: NewOp) -> Result<OpRecord, AuditError> {
        let mut record = pending_record(op, 0);
        let args = to_json(&record.args, "args")?;

        let op_index: i64 = sqlx::query_scalar(
            r#"INSERT INTO audit_ops
               (op_id, workflow_run_id, op_index, op_type, args, args_hash, skill_version,
                status, transient, invoked, timeout_ms, idempotency_key, tenant_id, created_at)
               SELECT ?, ?, COALESCE(MAX(op_index), 0) + 1, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?
               FROM audit_ops WHERE workflow_run_id = ?
               RETURNING op_index"#,
        )
        .bind(record.op_id.to_string())
        .bind(&record.workflow_run_id)
        .bind(&record.op_type)
        .bind(&args)
        .bind(&record.args_hash)
        .bind(record.skill_version.as_ref().map(ToString::to_string))
        .bind(record.status.as_str())
        .bind(record.transient)
        .bind(record.invoked)
        .bind(record.timeout_ms.map(|t| t as i64))
        .bind(&record.idempotency_key)
        .bind(&record.tenant_id)
        .bind(format_datetime(&record.created_at))
        .bind(&record.workflow_run_id)
        .fetch_one(&self.pool.writer)
        .await
        .map_err(query_error)?;

        record.op_index = op_index as u64;
        tracing::debug!(
            run_id = %record.workflow_run_id,
            op_index = record.op_index,
            op_type = %record.op_type,
            "audit op appended"
        );
        Ok(record)
    }

    async fn update_result(&self, update: OpUpdate) -> Result<OpRecord, AuditError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        let row = sqlx::query(&format!("SELECT {OP_COLUMNS} FROM audit_ops WHERE op_id = ?"))
            .bind(update.op_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(query_error)?
            .ok_or(AuditError::OpNotFound(update.op_id))?;
        let mut record = record_from(&row)?;

        check_finalization(&record, &update)?;
        apply_update(&mut record, update);

        let result = record.result.as_ref().map(|r| to_json(r, "result")).transpose()?;
        sqlx::query(
            r#"UPDATE audit_ops
               SET result = ?, result_hash = ?, status = ?, error_code = ?, error_message = ?,
                   duration_ms = ?, completed_at = ?
               WHERE op_id = ? AND status = 'pending'"#,
        )
        .bind(&result)
        .bind(&record.result_hash)
        .bind(record.status.as_str())
        .bind(record.error_code.map(|c| c.as_str()))
        .bind(&record.error_message)
        .bind(record.duration_ms.map(|d| d as i64))
        .bind(record.completed_at.as_ref().map(format_datetime))
        .bind(record.op_id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(query_error)?;

        tx.commit().await.map_err(query_error)?;
        Ok(record)
    }

    async fn get_ops(&self, workflow_run_id: &str) -> Result<Vec<OpRecord>, AuditError> {
        let rows = sqlx::query(&format!(
            "SELECT {OP_COLUMNS} FROM audit_ops WHERE workflow_run_id = ? ORDER BY op_index ASC"
        ))
        .bind(workflow_run_id)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut ops = Vec::with_capacity(rows.len());
        for row in &rows {
            ops.push(record_from(row)?);
        }
        Ok(ops)
    }

    async fn get_op(&self, op_id: &Uuid) -> Result<Option<OpRecord>, AuditError> {
        let row = sqlx::query(&format!("SELECT {OP_COLUMNS} FROM audit_ops WHERE op_id = ?"))
            .bind(op_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => Ok(Some(record_from(&row)?)),
            None => Ok(None),
        }
    }

    async fn save_replay_run(&self, run: &ReplayRun) -> Result<(), AuditError> {
        let mismatch_diff = run
            .mismatch_diff
            .as_ref()
            .map(|d| to_json(d, "mismatch_diff"))
            .transpose()?;

        sqlx::query(
            r#"INSERT INTO replay_runs
               (replay_id, workflow_run_id, mode, status, ops_total, ops_verified, ops_failed,
                ops_skipped, first_mismatch_op_index, mismatch_diff, started_at, completed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(replay_id) DO UPDATE SET
                 status = excluded.status,
                 ops_total = excluded.ops_total,
                 ops_verified = excluded.ops_verified,
                 ops_failed = excluded.ops_failed,
                 ops_skipped = excluded.ops_skipped,
                 first_mismatch_op_index = excluded.first_mismatch_op_index,
                 mismatch_diff = excluded.mismatch_diff,
                 completed_at = excluded.completed_at"#,
        )
        .bind(run.replay_id.to_string())
        .bind(&run.workflow_run_id)
        .bind(run.mode.as_str())
        .bind(run.status.as_str())
        .bind(run.ops_total as i64)
        .bind(run.ops_verified as i64)
        .bind(run.ops_failed as i64)
        .bind(run.ops_skipped as i64)
        .bind(run.first_mismatch_op_index.map(|i| i as i64))
        .bind(&mismatch_diff)
        .bind(format_datetime(&run.started_at))
        .bind(run.completed_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn get_replay_run(&self, replay_id: &Uuid) -> Result<Option<ReplayRun>, AuditError> {
        let row = sqlx::query("SELECT * FROM replay_runs WHERE replay_id = ?")
            .bind(replay_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = ReplayRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_replay_run()?))
            }
            None => Ok(None),
        }
    }
}
