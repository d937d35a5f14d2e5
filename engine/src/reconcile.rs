//! Reconciliation: repair runs stranded between Phase A and Phase C.
//!
//! A row stuck in CLAIMED means a finalizer died between claiming and
//! committing. The object store is the tie-breaker: an artifact carrying the
//! actual-cost metadata proves the work physically finished, so the run
//! commits COMPLETED with that amount; no artifact means it never finished,
//! so the run commits FAILED with the minimum fee. Either way the
//! reservation is consumed at most once: Settle returns NO_RESERVE if the
//! dead finalizer already got that far.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{error, info, warn};
use metrics::counter;
use tokio::time::interval;

use tollgate_common::config::EngineConfig;
use tollgate_common::run::{ReasonCode, RunRecord};

use crate::error::EngineResult;
use crate::ledger::Ledger;
use crate::objstore::{result_key, ResultStore};
use crate::store::{FinalizeCommit, ResultRef, RunStore};

/// What a reconciliation pass did with one claimed row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RepairAction {
    CommittedCompleted,
    CommittedFailed,
    MarkedDisputed,
    Skipped,
}

pub struct Reconciler {
    store: Arc<dyn RunStore>,
    ledger: Arc<dyn Ledger>,
    results: Arc<dyn ResultStore>,
    config: EngineConfig,
    running: Arc<AtomicBool>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn RunStore>,
        ledger: Arc<dyn Ledger>,
        results: Arc<dyn ResultStore>,
        config: EngineConfig,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            store,
            ledger,
            results,
            config,
            running,
        }
    }

    pub async fn run_loop(self: Arc<Self>) {
        let mut timer = interval(Duration::from_secs(self.config.reconcile_interval_seconds));
        info!("Reconciler loop started");
        while self.running.load(Ordering::SeqCst) {
            timer.tick().await;
            match self.reconcile_pass().await {
                Ok(0) => {}
                Ok(repaired) => {
                    // These should be rare; every one is a crash artifact.
                    warn!("Reconciler repaired {} stranded runs", repaired);
                }
                Err(err) => error!("Reconcile pass failed: {}", err),
            }
        }
        info!("Reconciler loop stopped");
    }

    /// One pass over rows claimed longer ago than the grace period.
    pub async fn reconcile_pass(&self) -> EngineResult<usize> {
        let cutoff = Utc::now() - chrono::Duration::seconds(self.config.reconcile_grace_seconds as i64);
        let stranded = self
            .store
            .find_claimed_before(cutoff, self.config.sweep_batch)
            .await?;

        let mut repaired = 0;
        for run in stranded {
            match self.repair_one(&run).await {
                Ok(RepairAction::Skipped) => {}
                Ok(action) => {
                    warn!("Reconciled run {}: {:?}", run.run_id, action);
                    repaired += 1;
                }
                Err(err) => error!("Reconcile of {} failed: {}", run.run_id, err),
            }
        }
        Ok(repaired)
    }

    pub async fn repair_one(&self, run: &RunRecord) -> EngineResult<RepairAction> {
        let finalize_token = match run.finalize_token.as_deref() {
            Some(token) => token,
            None => {
                error!("Claimed run {} has no finalize token", run.run_id);
                return Ok(RepairAction::Skipped);
            }
        };

        // A claim over a still-QUEUED row comes from the reservation
        // sweeper dying mid-repair: nothing ever executed, so the tenant
        // gets the full refund, not a minimum fee.
        if run.status == tollgate_common::run::RunStatus::Queued {
            let _ = self.ledger.refund_full(&run.tenant_id, &run.run_id).await?;
            let commit = FinalizeCommit::failed_refunded(ReasonCode::ReservationExpired);
            let committed = self
                .store
                .cas_commit(&run.run_id, run.version, finalize_token, &commit)
                .await?;
            return Ok(if committed {
                RepairAction::CommittedFailed
            } else {
                RepairAction::Skipped
            });
        }

        let key = result_key(&run.tenant_id, run.created_at, &run.run_id);
        let head = self.results.head_result(&key).await?;

        match head {
            Some(head) => {
                let actual = match head.actual_cost {
                    Some(actual) => actual,
                    None => {
                        // Artifact without the cost tag: can't prove the
                        // charge, so treat it like a missing result.
                        warn!(
                            "Artifact for {} lacks the actual-cost tag; settling minimum fee",
                            run.run_id
                        );
                        return self.commit_failed(run, finalize_token).await;
                    }
                };

                if actual > run.reserved_amount {
                    // Impossible by construction; never commit it silently.
                    error!(
                        "Run {} artifact claims {} micros against a {} micro reservation; \
                         marking DISPUTED for manual intervention",
                        run.run_id,
                        actual.micros(),
                        run.reserved_amount.micros()
                    );
                    counter!("tollgate_reconcile_disputed_total").increment(1);
                    self.store.cas_mark_disputed(&run.run_id, run.version).await?;
                    return Ok(RepairAction::MarkedDisputed);
                }

                // Work is physically done: settle (idempotently) and commit
                // COMPLETED with the metadata amount.
                let _ = self.ledger.settle(&run.tenant_id, &run.run_id, actual).await?;
                let hash = run.result_hash.clone().unwrap_or_default();
                let commit = FinalizeCommit::completed(
                    actual,
                    ResultRef {
                        bucket: self.results.bucket().to_string(),
                        key,
                        hash,
                    },
                );
                let committed = self
                    .store
                    .cas_commit(&run.run_id, run.version, finalize_token, &commit)
                    .await?;
                if committed {
                    counter!("tollgate_reconcile_completed_total").increment(1);
                    Ok(RepairAction::CommittedCompleted)
                } else {
                    Ok(RepairAction::Skipped)
                }
            }
            None => self.commit_failed(run, finalize_token).await,
        }
    }

    async fn commit_failed(
        &self,
        run: &RunRecord,
        finalize_token: &str,
    ) -> EngineResult<RepairAction> {
        let _ = self
            .ledger
            .settle(&run.tenant_id, &run.run_id, run.minimum_fee_amount)
            .await?;
        let commit = FinalizeCommit::failed_settled(
            run.minimum_fee_amount,
            ReasonCode::ReconcileNoResult,
        );
        let committed = self
            .store
            .cas_commit(&run.run_id, run.version, finalize_token, &commit)
            .await?;
        if committed {
            counter!("tollgate_reconcile_failed_total").increment(1);
            Ok(RepairAction::CommittedFailed)
        } else {
            Ok(RepairAction::Skipped)
        }
    }
}
