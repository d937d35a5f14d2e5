//! Authoritative run storage.
//!
//! The database is the single source of truth for run state. Every state
//! transition is an optimistic-lock update predicated on the version column
//! (and a stage predicate); callers inspect the boolean result and perform
//! side-effects only on a win. Losers exit side-effect-free.

mod postgres;

pub use postgres::PgRunStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use tollgate_common::run::{MoneyState, ReasonCode, RunRecord, RunStatus};
use tollgate_common::{Money, RunId, TenantId};

use crate::error::EngineResult;

/// Result artifact pointer written at commit time.
#[derive(Clone, Debug)]
pub struct ResultRef {
    pub bucket: String,
    pub key: String,
    pub hash: String,
}

/// Terminal write applied by Phase C of the finalize protocol.
#[derive(Clone, Debug)]
pub struct FinalizeCommit {
    pub status: RunStatus,
    pub money_state: MoneyState,
    pub actual_amount: Option<Money>,
    pub result: Option<ResultRef>,
    pub reason: Option<ReasonCode>,
}

impl FinalizeCommit {
    pub fn completed(actual: Money, result: ResultRef) -> Self {
        Self {
            status: RunStatus::Completed,
            money_state: MoneyState::Settled,
            actual_amount: Some(actual),
            result: Some(result),
            reason: None,
        }
    }

    pub fn failed_settled(minimum_fee: Money, reason: ReasonCode) -> Self {
        Self {
            status: RunStatus::Failed,
            money_state: MoneyState::Settled,
            actual_amount: Some(minimum_fee),
            result: None,
            reason: Some(reason),
        }
    }

    pub fn failed_refunded(reason: ReasonCode) -> Self {
        Self {
            status: RunStatus::Failed,
            money_state: MoneyState::Refunded,
            actual_amount: None,
            result: None,
            reason: Some(reason),
        }
    }
}

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn insert_run(&self, run: &RunRecord) -> EngineResult<()>;

    async fn get_run(&self, run_id: &RunId) -> EngineResult<Option<RunRecord>>;

    /// Newest-first page of a tenant's runs.
    async fn list_runs(
        &self,
        tenant_id: &TenantId,
        before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> EngineResult<Vec<RunRecord>>;

    /// QUEUED -> PROCESSING with a fresh lease. Bumps version.
    async fn cas_start_processing(
        &self,
        run_id: &RunId,
        version: i64,
        lease_token: &str,
        lease_expires_at: DateTime<Utc>,
    ) -> EngineResult<bool>;

    /// Heartbeat lease extension. Version-CAS but does NOT bump the version:
    /// extending a lease is not a state transition, and bumping here would
    /// invalidate the version the worker holds for Phase A. A false return
    /// means a reaper has claimed the run.
    async fn cas_heartbeat(
        &self,
        run_id: &RunId,
        version: i64,
        lease_token: &str,
        lease_expires_at: DateTime<Utc>,
    ) -> EngineResult<bool>;

    /// Phase A for the worker path: claim while still holding the lease.
    async fn cas_claim_finalize(
        &self,
        run_id: &RunId,
        version: i64,
        lease_token: &str,
        finalize_token: &str,
        claimed_at: DateTime<Utc>,
    ) -> EngineResult<bool>;

    /// Phase A for the reaper path: claim away from an expired lease.
    async fn cas_claim_expired(
        &self,
        run_id: &RunId,
        version: i64,
        finalize_token: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<bool>;

    /// Phase A for the reservation sweeper: claim a stuck QUEUED run.
    async fn cas_claim_queued(
        &self,
        run_id: &RunId,
        version: i64,
        finalize_token: &str,
        claimed_at: DateTime<Utc>,
    ) -> EngineResult<bool>;

    /// Phase C: terminal commit. Clears the lease, seals the row.
    async fn cas_commit(
        &self,
        run_id: &RunId,
        version: i64,
        finalize_token: &str,
        commit: &FinalizeCommit,
    ) -> EngineResult<bool>;

    /// Reconciler parking: actual > reserved must never commit silently.
    async fn cas_mark_disputed(&self, run_id: &RunId, version: i64) -> EngineResult<bool>;

    /// Retention sweep: terminal -> EXPIRED, result pointers cleared. The
    /// only mutation permitted on a COMMITTED row.
    async fn cas_expire(&self, run_id: &RunId, version: i64) -> EngineResult<bool>;

    async fn find_expired_leases(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> EngineResult<Vec<RunRecord>>;

    async fn find_stuck_reservations(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> EngineResult<Vec<RunRecord>>;

    async fn find_claimed_before(
        &self,
        claimed_before: DateTime<Utc>,
        limit: usize,
    ) -> EngineResult<Vec<RunRecord>>;

    async fn find_retention_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> EngineResult<Vec<RunRecord>>;
}
