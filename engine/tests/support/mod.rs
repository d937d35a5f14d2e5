//! In-memory doubles for the four shared stores, honoring the same CAS and
//! atomicity contracts as the production implementations. Fault injection
//! flags let tests exercise the partial-failure paths.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;

use tollgate_common::api::{JobMessage, SubmitRunRequest};
use tollgate_common::config::EngineConfig;
use tollgate_common::run::{FinalizeStage, MoneyState, RunRecord, RunStatus};
use tollgate_common::{Money, RunId, TenantId};
use tollgate_engine::error::{EngineError, EngineResult};
use tollgate_engine::executor::{
    ExecutorError, ExecutorRegistry, PackExecutor, PackOutput, PackRequest,
};
use tollgate_engine::ledger::{IdempotencyRecord, Ledger, ReserveOutcome, SettleOutcome};
use tollgate_engine::objstore::{HeadResult, ResultStore, METADATA_ACTUAL_COST, METADATA_RUN_ID};
use tollgate_engine::queue::{ReceivedJob, WorkQueue};
use tollgate_engine::store::{FinalizeCommit, RunStore};
use tollgate_engine::submit::SubmissionEngine;

// ---------------------------------------------------------------------------
// Run store
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryRunStore {
    runs: Mutex<HashMap<RunId, RunRecord>>,
}

impl MemoryRunStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn dump(&self, run_id: &RunId) -> RunRecord {
        self.runs
            .lock()
            .unwrap()
            .get(run_id)
            .expect("run must exist")
            .clone()
    }

    pub fn all_runs(&self) -> Vec<RunRecord> {
        self.runs.lock().unwrap().values().cloned().collect()
    }

    /// Test hook: mutate a row directly (simulate elapsed time etc).
    pub fn mutate<F: FnOnce(&mut RunRecord)>(&self, run_id: &RunId, f: F) {
        let mut runs = self.runs.lock().unwrap();
        f(runs.get_mut(run_id).expect("run must exist"));
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn insert_run(&self, run: &RunRecord) -> EngineResult<()> {
        let mut runs = self.runs.lock().unwrap();
        if runs.contains_key(&run.run_id) {
            return Err(EngineError::Internal("duplicate run_id".into()));
        }
        if runs.values().any(|existing| {
            existing.tenant_id == run.tenant_id && existing.idempotency_key == run.idempotency_key
        }) {
            return Err(EngineError::Internal("duplicate idempotency key".into()));
        }
        runs.insert(run.run_id, run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: &RunId) -> EngineResult<Option<RunRecord>> {
        Ok(self.runs.lock().unwrap().get(run_id).cloned())
    }

    async fn list_runs(
        &self,
        tenant_id: &TenantId,
        before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> EngineResult<Vec<RunRecord>> {
        let runs = self.runs.lock().unwrap();
        let mut page: Vec<RunRecord> = runs
            .values()
            .filter(|run| run.tenant_id == *tenant_id)
            .filter(|run| before.map_or(true, |cutoff| run.created_at < cutoff))
            .cloned()
            .collect();
        page.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        page.truncate(limit);
        Ok(page)
    }

    async fn cas_start_processing(
        &self,
        run_id: &RunId,
        version: i64,
        lease_token: &str,
        lease_expires_at: DateTime<Utc>,
    ) -> EngineResult<bool> {
        let mut runs = self.runs.lock().unwrap();
        let Some(run) = runs.get_mut(run_id) else {
            return Ok(false);
        };
        if run.version != version || run.status != RunStatus::Queued {
            return Ok(false);
        }
        run.status = RunStatus::Processing;
        run.lease_token = Some(lease_token.to_string());
        run.lease_expires_at = Some(lease_expires_at);
        run.version += 1;
        run.updated_at = Utc::now();
        debug_assert!(run.holds_invariants());
        Ok(true)
    }

    async fn cas_heartbeat(
        &self,
        run_id: &RunId,
        version: i64,
        lease_token: &str,
        lease_expires_at: DateTime<Utc>,
    ) -> EngineResult<bool> {
        let mut runs = self.runs.lock().unwrap();
        let Some(run) = runs.get_mut(run_id) else {
            return Ok(false);
        };
        if run.version != version
            || run.status != RunStatus::Processing
            || run.lease_token.as_deref() != Some(lease_token)
            || run.finalize_stage.is_some()
        {
            return Ok(false);
        }
        run.lease_expires_at = Some(lease_expires_at);
        run.updated_at = Utc::now();
        Ok(true)
    }

    async fn cas_claim_finalize(
        &self,
        run_id: &RunId,
        version: i64,
        lease_token: &str,
        finalize_token: &str,
        claimed_at: DateTime<Utc>,
    ) -> EngineResult<bool> {
        let mut runs = self.runs.lock().unwrap();
        let Some(run) = runs.get_mut(run_id) else {
            return Ok(false);
        };
        if run.version != version
            || run.status != RunStatus::Processing
            || run.lease_token.as_deref() != Some(lease_token)
            || run.finalize_stage.is_some()
        {
            return Ok(false);
        }
        run.finalize_stage = Some(FinalizeStage::Claimed);
        run.finalize_token = Some(finalize_token.to_string());
        run.finalize_claimed_at = Some(claimed_at);
        run.version += 1;
        run.updated_at = Utc::now();
        Ok(true)
    }

    async fn cas_claim_expired(
        &self,
        run_id: &RunId,
        version: i64,
        finalize_token: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<bool> {
        let mut runs = self.runs.lock().unwrap();
        let Some(run) = runs.get_mut(run_id) else {
            return Ok(false);
        };
        let lease_expired = run.lease_expires_at.map_or(false, |expiry| expiry < now);
        if run.version != version
            || run.status != RunStatus::Processing
            || !lease_expired
            || run.finalize_stage.is_some()
        {
            return Ok(false);
        }
        run.finalize_stage = Some(FinalizeStage::Claimed);
        run.finalize_token = Some(finalize_token.to_string());
        run.finalize_claimed_at = Some(now);
        run.version += 1;
        run.updated_at = Utc::now();
        Ok(true)
    }

    async fn cas_claim_queued(
        &self,
        run_id: &RunId,
        version: i64,
        finalize_token: &str,
        claimed_at: DateTime<Utc>,
    ) -> EngineResult<bool> {
        let mut runs = self.runs.lock().unwrap();
        let Some(run) = runs.get_mut(run_id) else {
            return Ok(false);
        };
        if run.version != version
            || run.status != RunStatus::Queued
            || run.finalize_stage.is_some()
        {
            return Ok(false);
        }
        run.finalize_stage = Some(FinalizeStage::Claimed);
        run.finalize_token = Some(finalize_token.to_string());
        run.finalize_claimed_at = Some(claimed_at);
        run.version += 1;
        run.updated_at = Utc::now();
        Ok(true)
    }

    async fn cas_commit(
        &self,
        run_id: &RunId,
        version: i64,
        finalize_token: &str,
        commit: &FinalizeCommit,
    ) -> EngineResult<bool> {
        let mut runs = self.runs.lock().unwrap();
        let Some(run) = runs.get_mut(run_id) else {
            return Ok(false);
        };
        if run.version != version
            || run.finalize_stage != Some(FinalizeStage::Claimed)
            || run.finalize_token.as_deref() != Some(finalize_token)
        {
            return Ok(false);
        }
        run.status = commit.status;
        run.money_state = commit.money_state;
        run.actual_amount = commit.actual_amount;
        if let Some(result) = &commit.result {
            run.result_bucket = Some(result.bucket.clone());
            run.result_key = Some(result.key.clone());
            run.result_hash = Some(result.hash.clone());
        }
        run.last_error_reason = commit.reason;
        run.finalize_stage = Some(FinalizeStage::Committed);
        run.lease_token = None;
        run.lease_expires_at = None;
        run.version += 1;
        run.updated_at = Utc::now();
        debug_assert!(run.holds_invariants());
        Ok(true)
    }

    async fn cas_mark_disputed(&self, run_id: &RunId, version: i64) -> EngineResult<bool> {
        let mut runs = self.runs.lock().unwrap();
        let Some(run) = runs.get_mut(run_id) else {
            return Ok(false);
        };
        if run.version != version || run.money_state == MoneyState::Disputed {
            return Ok(false);
        }
        run.money_state = MoneyState::Disputed;
        run.version += 1;
        run.updated_at = Utc::now();
        Ok(true)
    }

    async fn cas_expire(&self, run_id: &RunId, version: i64) -> EngineResult<bool> {
        let mut runs = self.runs.lock().unwrap();
        let Some(run) = runs.get_mut(run_id) else {
            return Ok(false);
        };
        if run.version != version
            || !matches!(run.status, RunStatus::Completed | RunStatus::Failed)
        {
            return Ok(false);
        }
        run.status = RunStatus::Expired;
        run.result_bucket = None;
        run.result_key = None;
        run.result_hash = None;
        run.version += 1;
        run.updated_at = Utc::now();
        Ok(true)
    }

    async fn find_expired_leases(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> EngineResult<Vec<RunRecord>> {
        let runs = self.runs.lock().unwrap();
        let mut page: Vec<RunRecord> = runs
            .values()
            .filter(|run| {
                run.status == RunStatus::Processing
                    && run.finalize_stage.is_none()
                    && run.lease_expires_at.map_or(false, |expiry| expiry < now)
            })
            .cloned()
            .collect();
        page.sort_by_key(|run| run.lease_expires_at);
        page.truncate(limit);
        Ok(page)
    }

    async fn find_stuck_reservations(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> EngineResult<Vec<RunRecord>> {
        let runs = self.runs.lock().unwrap();
        let mut page: Vec<RunRecord> = runs
            .values()
            .filter(|run| {
                run.status == RunStatus::Queued
                    && run.finalize_stage.is_none()
                    && run.created_at < created_before
            })
            .cloned()
            .collect();
        page.sort_by_key(|run| run.created_at);
        page.truncate(limit);
        Ok(page)
    }

    async fn find_claimed_before(
        &self,
        claimed_before: DateTime<Utc>,
        limit: usize,
    ) -> EngineResult<Vec<RunRecord>> {
        let runs = self.runs.lock().unwrap();
        let mut page: Vec<RunRecord> = runs
            .values()
            .filter(|run| {
                run.finalize_stage == Some(FinalizeStage::Claimed)
                    && run.money_state != MoneyState::Disputed
                    && run
                        .finalize_claimed_at
                        .map_or(false, |claimed| claimed < claimed_before)
            })
            .cloned()
            .collect();
        page.sort_by_key(|run| run.finalize_claimed_at);
        page.truncate(limit);
        Ok(page)
    }

    async fn find_retention_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> EngineResult<Vec<RunRecord>> {
        let runs = self.runs.lock().unwrap();
        let mut page: Vec<RunRecord> = runs
            .values()
            .filter(|run| {
                matches!(run.status, RunStatus::Completed | RunStatus::Failed)
                    && run.retention_until < now
            })
            .cloned()
            .collect();
        page.sort_by_key(|run| run.retention_until);
        page.truncate(limit);
        Ok(page)
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

#[derive(Default)]
struct LedgerState {
    balances: HashMap<TenantId, i64>,
    reservations: HashMap<RunId, (TenantId, i64)>,
    locks: HashMap<String, String>,
    mappings: HashMap<String, IdempotencyRecord>,
    leases: HashMap<RunId, String>,
}

#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
    settles: AtomicUsize,
}

impl MemoryLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// How many Settle invocations actually consumed a reservation.
    pub fn settle_count(&self) -> usize {
        self.settles.load(Ordering::SeqCst)
    }

    pub fn reservation_total(&self, tenant: &TenantId) -> i64 {
        self.state
            .lock()
            .unwrap()
            .reservations
            .values()
            .filter(|(owner, _)| owner == tenant)
            .map(|(_, amount)| amount)
            .sum()
    }

    pub fn has_reservation(&self, run_id: &RunId) -> bool {
        self.state.lock().unwrap().reservations.contains_key(run_id)
    }
}

fn mapping_key(tenant: &TenantId, key: &str) -> String {
    format!("{tenant}:{key}")
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn balance(&self, tenant: &TenantId) -> EngineResult<Money> {
        let state = self.state.lock().unwrap();
        Ok(Money::from_micros(
            state.balances.get(tenant).copied().unwrap_or(0),
        ))
    }

    async fn credit(&self, tenant: &TenantId, amount: Money) -> EngineResult<Money> {
        let mut state = self.state.lock().unwrap();
        let balance = state.balances.entry(tenant.clone()).or_insert(0);
        *balance += amount.micros();
        Ok(Money::from_micros(*balance))
    }

    async fn reserve(
        &self,
        tenant: &TenantId,
        run_id: &RunId,
        amount: Money,
        _reservation_ttl: Duration,
    ) -> EngineResult<ReserveOutcome> {
        let mut state = self.state.lock().unwrap();
        if state.reservations.contains_key(run_id) {
            return Ok(ReserveOutcome::AlreadyReserved);
        }
        let balance = state.balances.entry(tenant.clone()).or_insert(0);
        if *balance < amount.micros() {
            return Ok(ReserveOutcome::Insufficient {
                balance: Money::from_micros(*balance),
            });
        }
        *balance -= amount.micros();
        let new_balance = *balance;
        state
            .reservations
            .insert(*run_id, (tenant.clone(), amount.micros()));
        Ok(ReserveOutcome::Reserved {
            balance: Money::from_micros(new_balance),
        })
    }

    async fn settle(
        &self,
        tenant: &TenantId,
        run_id: &RunId,
        charge: Money,
    ) -> EngineResult<SettleOutcome> {
        let mut state = self.state.lock().unwrap();
        let Some((_, reserved)) = state.reservations.remove(run_id) else {
            return Ok(SettleOutcome::NoReservation);
        };
        let charged = charge.micros().min(reserved);
        let refunded = reserved - charged;
        let balance = state.balances.entry(tenant.clone()).or_insert(0);
        *balance += refunded;
        let new_balance = *balance;
        self.settles.fetch_add(1, Ordering::SeqCst);
        Ok(SettleOutcome::Settled {
            charged: Money::from_micros(charged),
            refunded: Money::from_micros(refunded),
            balance: Money::from_micros(new_balance),
        })
    }

    async fn refund_full(&self, tenant: &TenantId, run_id: &RunId) -> EngineResult<SettleOutcome> {
        self.settle(tenant, run_id, Money::ZERO).await
    }

    async fn put_lease(&self, run_id: &RunId, token: &str, _ttl: Duration) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        state.leases.insert(*run_id, token.to_string());
        Ok(())
    }

    async fn extend_lease(
        &self,
        run_id: &RunId,
        token: &str,
        _ttl: Duration,
    ) -> EngineResult<bool> {
        let state = self.state.lock().unwrap();
        Ok(state.leases.get(run_id).map(String::as_str) == Some(token))
    }

    async fn clear_lease(&self, run_id: &RunId, token: &str) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.leases.get(run_id).map(String::as_str) == Some(token) {
            state.leases.remove(run_id);
        }
        Ok(())
    }

    async fn acquire_submit_lock(
        &self,
        tenant: &TenantId,
        idempotency_key: &str,
        token: &str,
        _ttl: Duration,
    ) -> EngineResult<bool> {
        let mut state = self.state.lock().unwrap();
        let key = mapping_key(tenant, idempotency_key);
        if state.locks.contains_key(&key) {
            return Ok(false);
        }
        state.locks.insert(key, token.to_string());
        Ok(true)
    }

    async fn release_submit_lock(
        &self,
        tenant: &TenantId,
        idempotency_key: &str,
        token: &str,
    ) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        let key = mapping_key(tenant, idempotency_key);
        if state.locks.get(&key).map(String::as_str) == Some(token) {
            state.locks.remove(&key);
        }
        Ok(())
    }

    async fn get_idempotency(
        &self,
        tenant: &TenantId,
        idempotency_key: &str,
    ) -> EngineResult<Option<IdempotencyRecord>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .mappings
            .get(&mapping_key(tenant, idempotency_key))
            .cloned())
    }

    async fn put_idempotency(
        &self,
        tenant: &TenantId,
        idempotency_key: &str,
        record: &IdempotencyRecord,
        _ttl: Duration,
    ) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        state
            .mappings
            .insert(mapping_key(tenant, idempotency_key), record.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Result store
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryResultStore {
    objects: Mutex<HashMap<String, (Vec<u8>, HashMap<String, String>)>>,
    pub fail_uploads: AtomicBool,
}

impl MemoryResultStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }

    pub fn body(&self, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .map(|(body, _)| body.clone())
    }

    /// Test hook: plant an artifact as a crashed finalizer would have left it.
    pub fn plant(&self, key: &str, body: Vec<u8>, actual_cost: i64, run_id: &RunId) {
        let mut metadata = HashMap::new();
        metadata.insert(METADATA_ACTUAL_COST.to_string(), actual_cost.to_string());
        metadata.insert(METADATA_RUN_ID.to_string(), run_id.to_hex());
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), (body, metadata));
    }

    /// Test hook: plant an artifact missing the cost tag.
    pub fn plant_untagged(&self, key: &str, body: Vec<u8>) {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), (body, HashMap::new()));
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    fn bucket(&self) -> &str {
        "memory-results"
    }

    async fn put_result(
        &self,
        key: &str,
        body: Vec<u8>,
        actual_cost: Money,
        run_id: &RunId,
    ) -> EngineResult<String> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(EngineError::object_store(anyhow::anyhow!(
                "injected upload failure"
            )));
        }
        let hash = tollgate_common::fingerprint::sha256_hex(&body);
        self.plant(key, body, actual_cost.micros(), run_id);
        Ok(hash)
    }

    async fn head_result(&self, key: &str) -> EngineResult<Option<HeadResult>> {
        let objects = self.objects.lock().unwrap();
        Ok(objects
            .get(key)
            .map(|(_, metadata)| HeadResult::from_metadata(metadata)))
    }

    async fn presign_get(&self, key: &str, ttl: Duration) -> EngineResult<String> {
        if !self.objects.lock().unwrap().contains_key(key) {
            return Err(EngineError::object_store(anyhow::anyhow!(
                "no such object: {key}"
            )));
        }
        Ok(format!("memory://results/{key}?expires={}", ttl.as_secs()))
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryQueue {
    ready: Mutex<VecDeque<JobMessage>>,
    inflight: Mutex<HashMap<String, JobMessage>>,
    counter: AtomicUsize,
    pub fail_sends: AtomicBool,
}

impl MemoryQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn ready_len(&self) -> usize {
        self.ready.lock().unwrap().len()
    }

    pub fn inflight_len(&self) -> usize {
        self.inflight.lock().unwrap().len()
    }

    /// Simulate a visibility timeout: everything in flight goes back on
    /// the queue for redelivery. Lock order matches `receive`.
    pub fn redeliver_inflight(&self) {
        let mut ready = self.ready.lock().unwrap();
        let mut inflight = self.inflight.lock().unwrap();
        for (_, message) in inflight.drain() {
            ready.push_back(message);
        }
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn send(&self, message: &JobMessage) -> EngineResult<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(EngineError::queue(anyhow::anyhow!("injected send failure")));
        }
        self.ready.lock().unwrap().push_back(message.clone());
        Ok(())
    }

    async fn receive(&self, max: usize, _wait: Duration) -> EngineResult<Vec<ReceivedJob>> {
        let mut ready = self.ready.lock().unwrap();
        let mut inflight = self.inflight.lock().unwrap();
        let mut jobs = Vec::new();
        while jobs.len() < max {
            let Some(message) = ready.pop_front() else {
                break;
            };
            let receipt = format!("receipt-{}", self.counter.fetch_add(1, Ordering::SeqCst));
            inflight.insert(receipt.clone(), message.clone());
            jobs.push(ReceivedJob { message, receipt });
        }
        Ok(jobs)
    }

    async fn delete(&self, receipt: &str) -> EngineResult<()> {
        self.inflight.lock().unwrap().remove(receipt);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Packs
// ---------------------------------------------------------------------------

/// Deterministic pack returning a fixed cost.
pub struct FixedPack {
    pub cost: Money,
}

#[async_trait]
impl PackExecutor for FixedPack {
    fn pack_type(&self) -> &str {
        "fixed"
    }

    async fn execute(&self, request: &PackRequest) -> Result<PackOutput, ExecutorError> {
        Ok(PackOutput {
            data: json!({"inputs": request.inputs, "ok": true}),
            artifacts: None,
            actual_amount: self.cost,
        })
    }
}

/// Pack that always raises.
pub struct FailingPack;

#[async_trait]
impl PackExecutor for FailingPack {
    fn pack_type(&self) -> &str {
        "failing"
    }

    async fn execute(&self, _request: &PackRequest) -> Result<PackOutput, ExecutorError> {
        Err(ExecutorError::Failed("synthetic pack failure".into()))
    }
}

/// Pack that never finishes within any timebox.
pub struct StallingPack;

#[async_trait]
impl PackExecutor for StallingPack {
    fn pack_type(&self) -> &str {
        "stalling"
    }

    async fn execute(&self, _request: &PackRequest) -> Result<PackOutput, ExecutorError> {
        tokio::time::sleep(Duration::from_secs(86_400)).await;
        unreachable!("stalling pack must be timed out")
    }
}

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

pub const TENANT: &str = "tenant-1";

pub struct TestEnv {
    pub store: Arc<MemoryRunStore>,
    pub ledger: Arc<MemoryLedger>,
    pub queue: Arc<MemoryQueue>,
    pub results: Arc<MemoryResultStore>,
    pub config: EngineConfig,
    pub submission: SubmissionEngine,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let store = MemoryRunStore::new();
        let ledger = MemoryLedger::new();
        let queue = MemoryQueue::new();
        let results = MemoryResultStore::new();
        let submission = SubmissionEngine::new(
            store.clone(),
            ledger.clone(),
            queue.clone(),
            config.clone(),
        );
        Self {
            store,
            ledger,
            queue,
            results,
            config,
            submission,
        }
    }

    pub fn tenant(&self) -> TenantId {
        TenantId::from(TENANT)
    }

    pub async fn fund(&self, micros: i64) {
        self.ledger
            .credit(&self.tenant(), Money::from_micros(micros))
            .await
            .unwrap();
    }

    pub async fn balance_micros(&self) -> i64 {
        self.ledger.balance(&self.tenant()).await.unwrap().micros()
    }

    pub fn request(&self, pack_type: &str, max_cost: &str) -> SubmitRunRequest {
        serde_json::from_value(json!({
            "pack_type": pack_type,
            "inputs": {"text": "hello"},
            "reservation": {"max_cost": max_cost, "timebox_sec": 30},
        }))
        .unwrap()
    }

    pub fn worker(&self, registry: ExecutorRegistry) -> tollgate_engine::worker::WorkerService {
        tollgate_engine::worker::WorkerService::new(
            self.store.clone(),
            self.ledger.clone(),
            self.queue.clone(),
            self.results.clone(),
            Arc::new(registry),
            self.config.clone(),
            Arc::new(AtomicBool::new(true)),
        )
    }

    pub fn reaper(&self) -> tollgate_engine::reaper::ReaperService {
        tollgate_engine::reaper::ReaperService::new(
            self.store.clone(),
            self.ledger.clone(),
            self.config.clone(),
            Arc::new(AtomicBool::new(true)),
        )
    }

    pub fn reconciler(&self) -> tollgate_engine::reconcile::Reconciler {
        tollgate_engine::reconcile::Reconciler::new(
            self.store.clone(),
            self.ledger.clone(),
            self.results.clone(),
            self.config.clone(),
            Arc::new(AtomicBool::new(true)),
        )
    }

    pub fn fixed_registry(&self, cost_micros: i64) -> ExecutorRegistry {
        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(FixedPack {
            cost: Money::from_micros(cost_micros),
        }));
        registry
    }

    /// Submit a `fixed`-pack run and return its id.
    pub async fn submit_fixed(&self, idempotency_key: &str, max_cost: &str) -> RunId {
        let (receipt, _) = self
            .submission
            .submit(&self.tenant(), idempotency_key, &self.request("fixed", max_cost))
            .await
            .unwrap();
        receipt.run_id
    }

    /// Pull one message off the queue.
    pub async fn receive_one(&self) -> ReceivedJob {
        let mut jobs = self
            .queue
            .receive(1, Duration::from_secs(0))
            .await
            .unwrap();
        assert_eq!(jobs.len(), 1, "expected one queued message");
        jobs.remove(0)
    }
}
