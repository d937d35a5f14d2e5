//! Submission flow: idempotency gate, budget reservation, authoritative
//! insert, enqueue, plus the read side (poll and list).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{error, warn};
use metrics::counter;

use tollgate_common::api::{
    CostBreakdown, FailureDetails, JobMessage, ResultPointer, RunListEntry, RunListResponse,
    RunReceipt, RunStatusResponse, SubmitRunRequest, SCHEMA_VERSION,
};
use tollgate_common::config::{EngineConfig, MAX_LIST_RUNS};
use tollgate_common::error::ValidationError;
use tollgate_common::fingerprint::payload_fingerprint;
use tollgate_common::id::fresh_token;
use tollgate_common::run::{MoneyState, ReasonCode, RunRecord, RunStatus};
use tollgate_common::{Money, RunId, TenantId};

use crate::error::{EngineError, EngineResult};
use crate::ledger::{IdempotencyRecord, Ledger, ReserveOutcome};
use crate::queue::WorkQueue;
use crate::store::{FinalizeCommit, RunStore};

/// Amounts backing the cost headers on run endpoint responses.
#[derive(Clone, Copy, Debug)]
pub struct CostHeaders {
    pub reserved: Money,
    pub used: Money,
    pub balance: Money,
}

pub struct SubmissionEngine {
    store: Arc<dyn RunStore>,
    ledger: Arc<dyn Ledger>,
    queue: Arc<dyn WorkQueue>,
    config: EngineConfig,
}

impl SubmissionEngine {
    pub fn new(
        store: Arc<dyn RunStore>,
        ledger: Arc<dyn Ledger>,
        queue: Arc<dyn WorkQueue>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            queue,
            config,
        }
    }

    /// Accept a run submission. Client retries with the same idempotency key
    /// collapse into one run and exactly one reservation.
    pub async fn submit(
        &self,
        tenant: &TenantId,
        idempotency_key: &str,
        request: &SubmitRunRequest,
    ) -> EngineResult<(RunReceipt, CostHeaders)> {
        validate_idempotency_key(idempotency_key)?;
        self.validate_timebox(request.reservation.timebox_sec)?;
        let max_cost = Money::parse_decimal(&request.reservation.max_cost)?;
        if max_cost.is_zero() {
            return Err(ValidationError::ZeroReservation.into());
        }

        let body = serde_json::to_value(request)
            .map_err(|err| EngineError::Internal(format!("request re-encode: {err}")))?;
        let fingerprint = payload_fingerprint(&body);
        let trace_id = request
            .meta
            .as_ref()
            .and_then(|meta| meta.trace_id.clone());

        let lock_token = fresh_token();
        let lock_ttl = Duration::from_millis(self.config.idempotency_lock_ttl_ms);
        let locked = self
            .ledger
            .acquire_submit_lock(tenant, idempotency_key, &lock_token, lock_ttl)
            .await?;
        if !locked {
            return self.replay_or_conflict(tenant, idempotency_key, &fingerprint).await;
        }

        // Re-check under the lock: a prior submission may have finished
        // between our miss and the lock acquisition.
        if let Some(existing) = self.ledger.get_idempotency(tenant, idempotency_key).await? {
            self.ledger
                .release_submit_lock(tenant, idempotency_key, &lock_token)
                .await?;
            return self.resolve_existing(tenant, existing, &fingerprint).await;
        }

        let run_id = RunId::generate();
        let reservation_ttl = Duration::from_secs(self.config.reservation_ttl_seconds);
        let balance = match self
            .ledger
            .reserve(tenant, &run_id, max_cost, reservation_ttl)
            .await?
        {
            ReserveOutcome::Reserved { balance } => balance,
            ReserveOutcome::Insufficient { balance } => {
                self.ledger
                    .release_submit_lock(tenant, idempotency_key, &lock_token)
                    .await?;
                counter!("tollgate_submit_rejected_total", "reason" => "budget_drained")
                    .increment(1);
                return Err(EngineError::InsufficientBalance {
                    need: max_cost.micros(),
                    have: balance.micros(),
                });
            }
            ReserveOutcome::AlreadyReserved => {
                // A fresh 128-bit id colliding with a live reservation means
                // a bug, not a race.
                self.ledger
                    .release_submit_lock(tenant, idempotency_key, &lock_token)
                    .await?;
                return Err(EngineError::AlreadyReserved(run_id));
            }
        };

        let now = Utc::now();
        let run = RunRecord {
            run_id,
            tenant_id: tenant.clone(),
            pack_type: request.pack_type.clone(),
            status: RunStatus::Queued,
            money_state: MoneyState::Reserved,
            idempotency_key: idempotency_key.to_string(),
            payload_fingerprint: fingerprint.clone(),
            version: 0,
            reserved_amount: max_cost,
            actual_amount: None,
            minimum_fee_amount: self.config.minimum_fee_schedule().fee_for(max_cost),
            timebox_sec: request.reservation.timebox_sec,
            inputs: request.inputs.clone(),
            result_bucket: None,
            result_key: None,
            result_hash: None,
            retention_until: now + self.config.retention_window(),
            lease_token: None,
            lease_expires_at: None,
            finalize_stage: None,
            finalize_token: None,
            finalize_claimed_at: None,
            last_error_reason: None,
            trace_id,
            created_at: now,
            updated_at: now,
        };

        if let Err(err) = self.store.insert_run(&run).await {
            // The reservation exists but the authoritative row does not:
            // undo the money move before surfacing.
            if let Err(refund_err) = self.ledger.refund_full(tenant, &run_id).await {
                error!(
                    "Failed to refund reservation for {} after insert failure: {}",
                    run_id, refund_err
                );
            }
            let _ = self
                .ledger
                .release_submit_lock(tenant, idempotency_key, &lock_token)
                .await;
            return Err(err);
        }

        let mapping = IdempotencyRecord {
            run_id,
            payload_fingerprint: fingerprint,
        };
        let retention_ttl = Duration::from_secs(self.config.retention_days as u64 * 86_400);
        if let Err(err) = self
            .ledger
            .put_idempotency(tenant, idempotency_key, &mapping, retention_ttl)
            .await
        {
            // Without the mapping a client retry would reserve twice; roll
            // the whole submission back.
            error!("Idempotency mapping write failed for {}: {}", run_id, err);
            self.abort_fresh_run(tenant, &run, ReasonCode::Internal).await;
            let _ = self
                .ledger
                .release_submit_lock(tenant, idempotency_key, &lock_token)
                .await;
            return Err(err);
        }

        let message = JobMessage {
            run_id,
            tenant_id: tenant.clone(),
            pack_type: run.pack_type.clone(),
            enqueued_at: now,
            schema_version: SCHEMA_VERSION.to_string(),
        };
        if let Err(err) = self.queue.send(&message).await {
            warn!("Enqueue failed for {}: {}; refunding reservation", run_id, err);
            self.abort_fresh_run(tenant, &run, ReasonCode::QueueEnqueueFailed)
                .await;
            let _ = self
                .ledger
                .release_submit_lock(tenant, idempotency_key, &lock_token)
                .await;
            counter!("tollgate_submit_rejected_total", "reason" => "enqueue_failed")
                .increment(1);
            return Err(EngineError::EnqueueFailed);
        }

        self.ledger
            .release_submit_lock(tenant, idempotency_key, &lock_token)
            .await?;

        counter!("tollgate_runs_submitted_total").increment(1);
        let receipt = RunReceipt {
            run_id,
            status: RunStatus::Queued,
            reserved: max_cost.to_display(),
            poll_interval_ms: self.config.poll_recommended_interval_ms,
        };
        let headers = CostHeaders {
            reserved: max_cost,
            used: Money::ZERO,
            balance,
        };
        Ok((receipt, headers))
    }

    /// Roll a freshly inserted QUEUED run back to FAILED/REFUNDED after a
    /// post-insert step failed. Uses the normal claim/commit primitives so
    /// the row follows the same lifecycle discipline as every other write.
    async fn abort_fresh_run(&self, tenant: &TenantId, run: &RunRecord, reason: ReasonCode) {
        let finalize_token = fresh_token();
        let now = Utc::now();
        match self
            .store
            .cas_claim_queued(&run.run_id, run.version, &finalize_token, now)
            .await
        {
            Ok(true) => {
                if let Err(err) = self.ledger.refund_full(tenant, &run.run_id).await {
                    error!("RefundFull failed for {}: {}", run.run_id, err);
                }
                let commit = FinalizeCommit::failed_refunded(reason);
                match self
                    .store
                    .cas_commit(&run.run_id, run.version + 1, &finalize_token, &commit)
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => error!(
                        "Abort commit lost the race for {}; reconciler will repair",
                        run.run_id
                    ),
                    Err(err) => error!("Abort commit failed for {}: {}", run.run_id, err),
                }
            }
            Ok(false) => {
                // Someone else already owns the row; leave the money to them.
                warn!("Abort claim lost for fresh run {}", run.run_id);
            }
            Err(err) => error!("Abort claim failed for {}: {}", run.run_id, err),
        }
    }

    async fn replay_or_conflict(
        &self,
        tenant: &TenantId,
        idempotency_key: &str,
        fingerprint: &str,
    ) -> EngineResult<(RunReceipt, CostHeaders)> {
        match self.ledger.get_idempotency(tenant, idempotency_key).await? {
            Some(existing) => self.resolve_existing(tenant, existing, fingerprint).await,
            // The other submission is still mid-flight; the client should
            // retry shortly and hit the mapping.
            None => Err(EngineError::IdempotencyInFlight),
        }
    }

    async fn resolve_existing(
        &self,
        tenant: &TenantId,
        existing: IdempotencyRecord,
        fingerprint: &str,
    ) -> EngineResult<(RunReceipt, CostHeaders)> {
        if existing.payload_fingerprint != fingerprint {
            counter!("tollgate_submit_rejected_total", "reason" => "idempotency_conflict")
                .increment(1);
            return Err(EngineError::IdempotencyConflict {
                run_id: existing.run_id,
            });
        }

        let run = self
            .store
            .get_run(&existing.run_id)
            .await?
            .ok_or_else(|| {
                EngineError::Internal(format!(
                    "idempotency mapping points at missing run {}",
                    existing.run_id
                ))
            })?;

        counter!("tollgate_submit_replayed_total").increment(1);
        let receipt = RunReceipt {
            run_id: run.run_id,
            status: run.status,
            reserved: run.reserved_amount.to_display(),
            poll_interval_ms: self.config.poll_recommended_interval_ms,
        };
        let headers = CostHeaders {
            reserved: run.reserved_amount,
            used: run.actual_amount.unwrap_or(Money::ZERO),
            balance: self.ledger.balance(tenant).await?,
        };
        Ok((receipt, headers))
    }

    /// Status poll. Stealth policy: a missing run and a tenant mismatch are
    /// the same 404; only the owner ever learns a run existed (410).
    pub async fn poll(
        &self,
        tenant: &TenantId,
        run_id: &RunId,
        results: &dyn crate::objstore::ResultStore,
    ) -> EngineResult<(RunStatusResponse, CostHeaders)> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or(EngineError::RunNotFound)?;
        if run.tenant_id != *tenant {
            return Err(EngineError::RunNotFound);
        }
        if run.status == RunStatus::Expired || Utc::now() > run.retention_until {
            return Err(EngineError::RunExpired(*run_id));
        }

        let used = run.actual_amount.unwrap_or(Money::ZERO);
        let cost = CostBreakdown {
            reserved: run.reserved_amount.to_display(),
            used: used.to_display(),
            minimum_fee: run.minimum_fee_amount.to_display(),
        };

        let mut response = RunStatusResponse {
            run_id: run.run_id,
            status: run.status,
            cost,
            created_at: run.created_at,
            poll_interval_ms: None,
            result: None,
            failure: None,
            trace_id: run.trace_id.clone(),
        };

        match run.status {
            RunStatus::Queued | RunStatus::Processing => {
                response.poll_interval_ms = Some(self.config.poll_recommended_interval_ms);
            }
            RunStatus::Completed => {
                let key = run.result_key.as_deref().ok_or_else(|| {
                    EngineError::Corrupt(format!("completed run {} has no result key", run.run_id))
                })?;
                let hash = run.result_hash.clone().unwrap_or_default();
                let ttl = Duration::from_secs(self.config.presigned_url_ttl_seconds);
                let download_url = results.presign_get(key, ttl).await?;
                response.result = Some(ResultPointer {
                    download_url,
                    content_hash: hash,
                    url_expires_in_seconds: self.config.presigned_url_ttl_seconds,
                });
            }
            RunStatus::Failed => {
                response.failure = Some(FailureDetails {
                    reason_code: run.last_error_reason.unwrap_or(ReasonCode::Internal),
                    detail: None,
                });
            }
            RunStatus::Expired => unreachable!("expired handled above"),
        }

        let headers = CostHeaders {
            reserved: run.reserved_amount,
            used,
            balance: self.ledger.balance(tenant).await?,
        };
        Ok((response, headers))
    }

    /// Newest-first page of the tenant's runs.
    pub async fn list(
        &self,
        tenant: &TenantId,
        before: Option<chrono::DateTime<Utc>>,
        limit: Option<usize>,
    ) -> EngineResult<RunListResponse> {
        let limit = limit.unwrap_or(MAX_LIST_RUNS).min(MAX_LIST_RUNS);
        let runs = self.store.list_runs(tenant, before, limit).await?;
        Ok(RunListResponse {
            runs: runs
                .into_iter()
                .map(|run| RunListEntry {
                    run_id: run.run_id,
                    pack_type: run.pack_type,
                    status: run.status,
                    created_at: run.created_at,
                })
                .collect(),
        })
    }

    fn validate_timebox(&self, timebox_sec: u32) -> EngineResult<()> {
        if timebox_sec == 0 || timebox_sec > self.config.timebox_sec_max {
            return Err(ValidationError::BadTimebox {
                got: timebox_sec,
                max: self.config.timebox_sec_max,
            }
            .into());
        }
        Ok(())
    }
}

fn validate_idempotency_key(key: &str) -> EngineResult<()> {
    let length_ok = (8..=64).contains(&key.len());
    let printable = key
        .chars()
        .all(|c| c.is_ascii_graphic() || c == ' ');
    if length_ok && printable {
        Ok(())
    } else {
        Err(ValidationError::BadIdempotencyKey.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_key_bounds() {
        assert!(validate_idempotency_key("12345678").is_ok());
        assert!(validate_idempotency_key(&"k".repeat(64)).is_ok());
        assert!(validate_idempotency_key("1234567").is_err());
        assert!(validate_idempotency_key(&"k".repeat(65)).is_err());
        assert!(validate_idempotency_key("key\nwith\ncontrol").is_err());
    }
}
