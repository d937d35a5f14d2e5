use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgArguments, PgPool};
use sqlx::query::Query;
use sqlx::Postgres;
use tokio::time::sleep;

use tollgate_common::config::{CAS_RETRY_ATTEMPTS, CAS_RETRY_BACKOFF_MS};
use tollgate_common::run::{FinalizeStage, MoneyState, ReasonCode, RunRecord, RunStatus};
use tollgate_common::{Money, RunId, TenantId};

use crate::error::{EngineError, EngineResult};
use crate::store::{FinalizeCommit, RunStore};

const RUN_COLUMNS: &str = "run_id, tenant_id, pack_type, status, money_state, idempotency_key, \
     payload_fingerprint, version, reserved_amount, actual_amount, minimum_fee_amount, \
     timebox_sec, inputs, result_bucket, result_key, result_hash, retention_until, \
     lease_token, lease_expires_at, finalize_stage, finalize_token, finalize_claimed_at, \
     last_error_reason, trace_id, created_at, updated_at";

/// Authoritative store backed by PostgreSQL.
pub struct PgRunStore {
    pool: PgPool,
}

impl PgRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Execute a CAS statement with a bounded transient-error retry.
    /// Returns whether exactly one row was affected.
    async fn execute_cas<'q, F>(&self, mut build: F) -> EngineResult<bool>
    where
        F: FnMut() -> Query<'q, Postgres, PgArguments> + Send,
    {
        let mut attempt = 0;
        loop {
            match build().execute(&self.pool).await {
                Ok(done) => return Ok(done.rows_affected() == 1),
                Err(err) if attempt + 1 < CAS_RETRY_ATTEMPTS && is_transient(&err) => {
                    attempt += 1;
                    sleep(Duration::from_millis(CAS_RETRY_BACKOFF_MS * attempt as u64)).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn fetch_page<'q>(
        &self,
        query: Query<'q, Postgres, PgArguments>,
    ) -> EngineResult<Vec<RunRecord>> {
        let rows: Vec<RunRow> = query
            .try_map(|row| RunRow::from_pg_row(&row))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(RunRow::into_record).collect()
    }
}

fn is_transient(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut)
}

/// Raw row shape; converted into `RunRecord` with enum/id parsing.
struct RunRow {
    run_id: String,
    tenant_id: String,
    pack_type: String,
    status: String,
    money_state: String,
    idempotency_key: String,
    payload_fingerprint: String,
    version: i64,
    reserved_amount: i64,
    actual_amount: Option<i64>,
    minimum_fee_amount: i64,
    timebox_sec: i32,
    inputs: serde_json::Value,
    result_bucket: Option<String>,
    result_key: Option<String>,
    result_hash: Option<String>,
    retention_until: DateTime<Utc>,
    lease_token: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    finalize_stage: Option<String>,
    finalize_token: Option<String>,
    finalize_claimed_at: Option<DateTime<Utc>>,
    last_error_reason: Option<String>,
    trace_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl RunRow {
    fn from_pg_row(row: &sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(Self {
            run_id: row.try_get("run_id")?,
            tenant_id: row.try_get("tenant_id")?,
            pack_type: row.try_get("pack_type")?,
            status: row.try_get("status")?,
            money_state: row.try_get("money_state")?,
            idempotency_key: row.try_get("idempotency_key")?,
            payload_fingerprint: row.try_get("payload_fingerprint")?,
            version: row.try_get("version")?,
            reserved_amount: row.try_get("reserved_amount")?,
            actual_amount: row.try_get("actual_amount")?,
            minimum_fee_amount: row.try_get("minimum_fee_amount")?,
            timebox_sec: row.try_get("timebox_sec")?,
            inputs: row.try_get("inputs")?,
            result_bucket: row.try_get("result_bucket")?,
            result_key: row.try_get("result_key")?,
            result_hash: row.try_get("result_hash")?,
            retention_until: row.try_get("retention_until")?,
            lease_token: row.try_get("lease_token")?,
            lease_expires_at: row.try_get("lease_expires_at")?,
            finalize_stage: row.try_get("finalize_stage")?,
            finalize_token: row.try_get("finalize_token")?,
            finalize_claimed_at: row.try_get("finalize_claimed_at")?,
            last_error_reason: row.try_get("last_error_reason")?,
            trace_id: row.try_get("trace_id")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_record(self) -> EngineResult<RunRecord> {
        let corrupt = |what: &str, raw: &str| {
            EngineError::Corrupt(format!("run row has bad {}: {}", what, raw))
        };

        Ok(RunRecord {
            run_id: self
                .run_id
                .parse()
                .map_err(|_| corrupt("run_id", &self.run_id))?,
            tenant_id: TenantId(self.tenant_id),
            pack_type: self.pack_type,
            status: RunStatus::parse(&self.status).ok_or_else(|| corrupt("status", &self.status))?,
            money_state: MoneyState::parse(&self.money_state)
                .ok_or_else(|| corrupt("money_state", &self.money_state))?,
            idempotency_key: self.idempotency_key,
            payload_fingerprint: self.payload_fingerprint,
            version: self.version,
            reserved_amount: Money::from_micros(self.reserved_amount),
            actual_amount: self.actual_amount.map(Money::from_micros),
            minimum_fee_amount: Money::from_micros(self.minimum_fee_amount),
            timebox_sec: self.timebox_sec as u32,
            inputs: self.inputs,
            result_bucket: self.result_bucket,
            result_key: self.result_key,
            result_hash: self.result_hash,
            retention_until: self.retention_until,
            lease_token: self.lease_token,
            lease_expires_at: self.lease_expires_at,
            finalize_stage: match self.finalize_stage {
                Some(raw) => {
                    Some(FinalizeStage::parse(&raw).ok_or_else(|| corrupt("finalize_stage", &raw))?)
                }
                None => None,
            },
            finalize_token: self.finalize_token,
            finalize_claimed_at: self.finalize_claimed_at,
            last_error_reason: self.last_error_reason.as_deref().and_then(ReasonCode::parse),
            trace_id: self.trace_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[async_trait]
impl RunStore for PgRunStore {
    async fn insert_run(&self, run: &RunRecord) -> EngineResult<()> {
        sqlx::query(
            "INSERT INTO runs (run_id, tenant_id, pack_type, status, money_state, \
             idempotency_key, payload_fingerprint, version, reserved_amount, actual_amount, \
             minimum_fee_amount, timebox_sec, inputs, retention_until, last_error_reason, \
             trace_id, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)",
        )
        .bind(run.run_id.to_hex())
        .bind(run.tenant_id.as_str())
        .bind(run.pack_type.as_str())
        .bind(run.status.as_str())
        .bind(run.money_state.as_str())
        .bind(run.idempotency_key.as_str())
        .bind(run.payload_fingerprint.as_str())
        .bind(run.version)
        .bind(run.reserved_amount.micros())
        .bind(run.actual_amount.map(Money::micros))
        .bind(run.minimum_fee_amount.micros())
        .bind(run.timebox_sec as i32)
        .bind(run.inputs.clone())
        .bind(run.retention_until)
        .bind(run.last_error_reason.map(ReasonCode::as_str))
        .bind(run.trace_id.as_deref())
        .bind(run.created_at)
        .bind(run.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_run(&self, run_id: &RunId) -> EngineResult<Option<RunRecord>> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM runs WHERE run_id = $1");
        let row: Option<RunRow> = sqlx::query(&sql)
            .bind(run_id.to_hex())
            .try_map(|row| RunRow::from_pg_row(&row))
            .fetch_optional(&self.pool)
            .await?;
        row.map(RunRow::into_record).transpose()
    }

    async fn list_runs(
        &self,
        tenant_id: &TenantId,
        before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> EngineResult<Vec<RunRecord>> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM runs \
             WHERE tenant_id = $1 AND ($2::timestamptz IS NULL OR created_at < $2) \
             ORDER BY created_at DESC LIMIT $3"
        );
        let query = sqlx::query(&sql)
            .bind(tenant_id.as_str())
            .bind(before)
            .bind(limit as i64);
        self.fetch_page(query).await
    }

    async fn cas_start_processing(
        &self,
        run_id: &RunId,
        version: i64,
        lease_token: &str,
        lease_expires_at: DateTime<Utc>,
    ) -> EngineResult<bool> {
        let id = run_id.to_hex();
        self.execute_cas(|| {
            sqlx::query(
                "UPDATE runs SET status = 'PROCESSING', lease_token = $3, \
                 lease_expires_at = $4, version = version + 1, updated_at = now() \
                 WHERE run_id = $1 AND version = $2 AND status = 'QUEUED'",
            )
            .bind(id.clone())
            .bind(version)
            .bind(lease_token.to_string())
            .bind(lease_expires_at)
        })
        .await
    }

    async fn cas_heartbeat(
        &self,
        run_id: &RunId,
        version: i64,
        lease_token: &str,
        lease_expires_at: DateTime<Utc>,
    ) -> EngineResult<bool> {
        let id = run_id.to_hex();
        self.execute_cas(|| {
            sqlx::query(
                "UPDATE runs SET lease_expires_at = $4, updated_at = now() \
                 WHERE run_id = $1 AND version = $2 AND lease_token = $3 \
                 AND status = 'PROCESSING' AND finalize_stage IS NULL",
            )
            .bind(id.clone())
            .bind(version)
            .bind(lease_token.to_string())
            .bind(lease_expires_at)
        })
        .await
    }

    async fn cas_claim_finalize(
        &self,
        run_id: &RunId,
        version: i64,
        lease_token: &str,
        finalize_token: &str,
        claimed_at: DateTime<Utc>,
    ) -> EngineResult<bool> {
        let id = run_id.to_hex();
        self.execute_cas(|| {
            sqlx::query(
                "UPDATE runs SET finalize_stage = 'CLAIMED', finalize_token = $4, \
                 finalize_claimed_at = $5, version = version + 1, updated_at = now() \
                 WHERE run_id = $1 AND version = $2 AND status = 'PROCESSING' \
                 AND lease_token = $3 AND finalize_stage IS NULL",
            )
            .bind(id.clone())
            .bind(version)
            .bind(lease_token.to_string())
            .bind(finalize_token.to_string())
            .bind(claimed_at)
        })
        .await
    }

    async fn cas_claim_expired(
        &self,
        run_id: &RunId,
        version: i64,
        finalize_token: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<bool> {
        let id = run_id.to_hex();
        self.execute_cas(|| {
            sqlx::query(
                "UPDATE runs SET finalize_stage = 'CLAIMED', finalize_token = $3, \
                 finalize_claimed_at = $4, version = version + 1, updated_at = now() \
                 WHERE run_id = $1 AND version = $2 AND status = 'PROCESSING' \
                 AND lease_expires_at < $4 AND finalize_stage IS NULL",
            )
            .bind(id.clone())
            .bind(version)
            .bind(finalize_token.to_string())
            .bind(now)
        })
        .await
    }

    async fn cas_claim_queued(
        &self,
        run_id: &RunId,
        version: i64,
        finalize_token: &str,
        claimed_at: DateTime<Utc>,
    ) -> EngineResult<bool> {
        let id = run_id.to_hex();
        self.execute_cas(|| {
            sqlx::query(
                "UPDATE runs SET finalize_stage = 'CLAIMED', finalize_token = $3, \
                 finalize_claimed_at = $4, version = version + 1, updated_at = now() \
                 WHERE run_id = $1 AND version = $2 AND status = 'QUEUED' \
                 AND finalize_stage IS NULL",
            )
            .bind(id.clone())
            .bind(version)
            .bind(finalize_token.to_string())
            .bind(claimed_at)
        })
        .await
    }

    async fn cas_commit(
        &self,
        run_id: &RunId,
        version: i64,
        finalize_token: &str,
        commit: &FinalizeCommit,
    ) -> EngineResult<bool> {
        let id = run_id.to_hex();
        let (bucket, key, hash) = match &commit.result {
            Some(result) => (
                Some(result.bucket.clone()),
                Some(result.key.clone()),
                Some(result.hash.clone()),
            ),
            None => (None, None, None),
        };
        self.execute_cas(|| {
            sqlx::query(
                "UPDATE runs SET status = $4, money_state = $5, actual_amount = $6, \
                 result_bucket = $7, result_key = $8, result_hash = $9, \
                 last_error_reason = $10, finalize_stage = 'COMMITTED', \
                 lease_token = NULL, lease_expires_at = NULL, \
                 version = version + 1, updated_at = now() \
                 WHERE run_id = $1 AND version = $2 AND finalize_stage = 'CLAIMED' \
                 AND finalize_token = $3",
            )
            .bind(id.clone())
            .bind(version)
            .bind(finalize_token.to_string())
            .bind(commit.status.as_str())
            .bind(commit.money_state.as_str())
            .bind(commit.actual_amount.map(Money::micros))
            .bind(bucket.clone())
            .bind(key.clone())
            .bind(hash.clone())
            .bind(commit.reason.map(ReasonCode::as_str))
        })
        .await
    }

    async fn cas_mark_disputed(&self, run_id: &RunId, version: i64) -> EngineResult<bool> {
        let id = run_id.to_hex();
        self.execute_cas(|| {
            sqlx::query(
                "UPDATE runs SET money_state = 'DISPUTED', version = version + 1, \
                 updated_at = now() \
                 WHERE run_id = $1 AND version = $2 AND money_state <> 'DISPUTED'",
            )
            .bind(id.clone())
            .bind(version)
        })
        .await
    }

    async fn cas_expire(&self, run_id: &RunId, version: i64) -> EngineResult<bool> {
        let id = run_id.to_hex();
        self.execute_cas(|| {
            sqlx::query(
                "UPDATE runs SET status = 'EXPIRED', result_bucket = NULL, \
                 result_key = NULL, result_hash = NULL, version = version + 1, \
                 updated_at = now() \
                 WHERE run_id = $1 AND version = $2 AND status IN ('COMPLETED', 'FAILED')",
            )
            .bind(id.clone())
            .bind(version)
        })
        .await
    }

    async fn find_expired_leases(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> EngineResult<Vec<RunRecord>> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM runs \
             WHERE status = 'PROCESSING' AND lease_expires_at < $1 \
             AND finalize_stage IS NULL \
             ORDER BY lease_expires_at ASC LIMIT $2"
        );
        let query = sqlx::query(&sql).bind(now).bind(limit as i64);
        self.fetch_page(query).await
    }

    async fn find_stuck_reservations(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> EngineResult<Vec<RunRecord>> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM runs \
             WHERE status = 'QUEUED' AND created_at < $1 AND finalize_stage IS NULL \
             ORDER BY created_at ASC LIMIT $2"
        );
        let query = sqlx::query(&sql).bind(created_before).bind(limit as i64);
        self.fetch_page(query).await
    }

    async fn find_claimed_before(
        &self,
        claimed_before: DateTime<Utc>,
        limit: usize,
    ) -> EngineResult<Vec<RunRecord>> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM runs \
             WHERE finalize_stage = 'CLAIMED' AND finalize_claimed_at < $1 \
             AND money_state <> 'DISPUTED' \
             ORDER BY finalize_claimed_at ASC LIMIT $2"
        );
        let query = sqlx::query(&sql).bind(claimed_before).bind(limit as i64);
        self.fetch_page(query).await
    }

    async fn find_retention_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> EngineResult<Vec<RunRecord>> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM runs \
             WHERE status IN ('COMPLETED', 'FAILED') AND retention_until < $1 \
             ORDER BY retention_until ASC LIMIT $2"
        );
        let query = sqlx::query(&sql).bind(now).bind(limit as i64);
        self.fetch_page(query).await
    }
}
