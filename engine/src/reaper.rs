//! Background repair: zombie-lease reaping, stuck-reservation sweeping and
//! retention sweeping.
//!
//! Every pass is the same shape: page through candidates, revalidate each
//! one with a CAS claim, and only then touch money. A candidate that fails
//! its claim was handled by someone faster; skipping it is the correct and
//! side-effect-free response.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{error, info, warn};
use metrics::counter;
use tokio::time::interval;

use tollgate_common::config::EngineConfig;
use tollgate_common::id::fresh_token;
use tollgate_common::run::{ReasonCode, RunRecord};

use crate::error::EngineResult;
use crate::ledger::{Ledger, SettleOutcome};
use crate::store::{FinalizeCommit, RunStore};

pub struct ReaperService {
    store: Arc<dyn RunStore>,
    ledger: Arc<dyn Ledger>,
    config: EngineConfig,
    running: Arc<AtomicBool>,
}

impl ReaperService {
    pub fn new(
        store: Arc<dyn RunStore>,
        ledger: Arc<dyn Ledger>,
        config: EngineConfig,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            store,
            ledger,
            config,
            running,
        }
    }

    /// Periodic loop driving all three sweeps on their own cadences.
    pub async fn run_loop(self: Arc<Self>) {
        let mut reap_timer = interval(Duration::from_secs(self.config.reaper_interval_seconds));
        let mut reservation_timer = interval(Duration::from_secs(
            self.config.reservation_sweep_interval_seconds,
        ));
        let mut retention_timer = interval(Duration::from_secs(
            self.config.retention_sweep_interval_seconds,
        ));

        info!("Reaper loop started");
        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                _ = reap_timer.tick() => {
                    if let Err(err) = self.reap_expired_leases().await {
                        error!("Lease reap pass failed: {}", err);
                    }
                }
                _ = reservation_timer.tick() => {
                    if let Err(err) = self.sweep_stuck_reservations().await {
                        error!("Reservation sweep failed: {}", err);
                    }
                }
                _ = retention_timer.tick() => {
                    if let Err(err) = self.sweep_retention().await {
                        error!("Retention sweep failed: {}", err);
                    }
                }
            }
        }
        info!("Reaper loop stopped");
    }

    /// Claim runs whose lease expired and drive them to FAILED + SETTLED
    /// (minimum fee). Returns how many runs were reaped.
    pub async fn reap_expired_leases(&self) -> EngineResult<usize> {
        let now = Utc::now();
        let candidates = self
            .store
            .find_expired_leases(now, self.config.sweep_batch)
            .await?;
        let mut reaped = 0;

        for run in candidates {
            if self.reap_one(&run).await? {
                reaped += 1;
            }
        }
        if reaped > 0 {
            warn!("Reaped {} expired leases", reaped);
        }
        Ok(reaped)
    }

    async fn reap_one(&self, run: &RunRecord) -> EngineResult<bool> {
        let finalize_token = fresh_token();
        let claimed = self
            .store
            .cas_claim_expired(&run.run_id, run.version, &finalize_token, Utc::now())
            .await?;
        if !claimed {
            // The worker finished in the meantime, or another reaper won.
            return Ok(false);
        }

        match self
            .ledger
            .settle(&run.tenant_id, &run.run_id, run.minimum_fee_amount)
            .await
        {
            Ok(SettleOutcome::Settled { .. }) => {}
            Ok(SettleOutcome::NoReservation) => {
                error!(
                    "Reaper found no reservation for claimed run {}",
                    run.run_id
                );
            }
            Err(err) => {
                // The claim stands; the reconciler will finish the job if
                // this commit never lands.
                error!("Reaper settle failed for {}: {}", run.run_id, err);
            }
        }

        let commit =
            FinalizeCommit::failed_settled(run.minimum_fee_amount, ReasonCode::WorkerTimeout);
        let committed = self
            .store
            .cas_commit(&run.run_id, run.version + 1, &finalize_token, &commit)
            .await?;
        if !committed {
            error!(
                "Reaper commit affected 0 rows for {}; leaving to reconciler",
                run.run_id
            );
            return Ok(false);
        }

        counter!("tollgate_reaped_total").increment(1);
        warn!(
            "Run {} reaped after lease expiry; settled minimum fee {}",
            run.run_id,
            run.minimum_fee_amount.to_display()
        );
        Ok(true)
    }

    /// Refund QUEUED runs whose queue message evidently never arrived.
    pub async fn sweep_stuck_reservations(&self) -> EngineResult<usize> {
        let cutoff =
            Utc::now() - chrono::Duration::seconds(self.config.reservation_ttl_seconds as i64);
        let candidates = self
            .store
            .find_stuck_reservations(cutoff, self.config.sweep_batch)
            .await?;
        let mut swept = 0;

        for run in candidates {
            let finalize_token = fresh_token();
            let claimed = self
                .store
                .cas_claim_queued(&run.run_id, run.version, &finalize_token, Utc::now())
                .await?;
            if !claimed {
                continue;
            }

            if let Err(err) = self.ledger.refund_full(&run.tenant_id, &run.run_id).await {
                error!("RefundFull failed for stuck run {}: {}", run.run_id, err);
            }
            let commit = FinalizeCommit::failed_refunded(ReasonCode::ReservationExpired);
            let committed = self
                .store
                .cas_commit(&run.run_id, run.version + 1, &finalize_token, &commit)
                .await?;
            if committed {
                counter!("tollgate_reservations_swept_total").increment(1);
                warn!("Stuck reservation for {} refunded", run.run_id);
                swept += 1;
            }
        }
        Ok(swept)
    }

    /// Move terminal runs past their retention window to EXPIRED and drop
    /// the result pointers. The artifact itself is removed by the object
    /// store's lifecycle rule.
    pub async fn sweep_retention(&self) -> EngineResult<usize> {
        let now = Utc::now();
        let candidates = self
            .store
            .find_retention_expired(now, self.config.sweep_batch)
            .await?;
        let mut expired = 0;

        for run in candidates {
            if self.store.cas_expire(&run.run_id, run.version).await? {
                expired += 1;
            }
        }
        if expired > 0 {
            info!("Retention sweep expired {} runs", expired);
            counter!("tollgate_runs_expired_total").increment(expired as u64);
        }
        Ok(expired)
    }
}
