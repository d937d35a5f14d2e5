//! Worker service: dequeue, lease, execute, upload, finalize.
//!
//! The pipeline is committed to one discipline: ledger and queue
//! side-effects happen only after winning a database CAS. A worker that
//! loses any race exits without touching money, and a worker that wins
//! Phase A drives the run to a terminal, settled state no matter what
//! breaks afterwards.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{error, info, warn};
use metrics::counter;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use tollgate_common::api::{CostBreakdown, EnvelopeMeta, ResultEnvelope, SCHEMA_VERSION};
use tollgate_common::config::EngineConfig;
use tollgate_common::id::fresh_token;
use tollgate_common::run::{ReasonCode, RunRecord, RunStatus};
use tollgate_common::time::to_rfc3339;
use tollgate_common::{Money, RunId};

use crate::error::EngineResult;
use crate::executor::{ExecutorRegistry, PackOutput, PackRequest};
use crate::ledger::{Ledger, SettleOutcome};
use crate::objstore::{result_key, ResultStore};
use crate::queue::{ReceivedJob, WorkQueue};
use crate::store::{FinalizeCommit, ResultRef, RunStore};

/// What `process_job` did with a message; drives tests and metrics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    /// Phase C committed COMPLETED.
    Completed,
    /// Phase C committed FAILED with this reason.
    Failed(ReasonCode),
    /// The row was already terminal or claimed; message discarded.
    DuplicateDelivery,
    /// Lost the QUEUED -> PROCESSING race; message discarded.
    LostStart,
    /// Lost the lease (heartbeat mismatch) or Phase A; no side-effects done.
    LostFinalize,
    /// Pack raised an error; lease left to expire, reaper settles.
    AbandonedToReaper,
    /// Phase C found 0 rows; message retained for the reconciler path.
    CommitLost,
}

enum ExecResult {
    Done(PackOutput),
    PackError(String),
    TimedOut,
    LeaseLost,
    UnknownPack,
}

pub struct WorkerService {
    store: Arc<dyn RunStore>,
    ledger: Arc<dyn Ledger>,
    queue: Arc<dyn WorkQueue>,
    results: Arc<dyn ResultStore>,
    registry: Arc<ExecutorRegistry>,
    config: EngineConfig,
    running: Arc<AtomicBool>,
}

impl WorkerService {
    pub fn new(
        store: Arc<dyn RunStore>,
        ledger: Arc<dyn Ledger>,
        queue: Arc<dyn WorkQueue>,
        results: Arc<dyn ResultStore>,
        registry: Arc<ExecutorRegistry>,
        config: EngineConfig,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            store,
            ledger,
            queue,
            results,
            registry,
            config,
            running,
        }
    }

    /// Long-poll consume loop; one batch of up to `worker_concurrency`
    /// messages is processed concurrently.
    pub async fn run_loop(self: Arc<Self>) {
        info!(
            "Worker loop started (concurrency {}, packs: {:?})",
            self.config.worker_concurrency,
            self.registry.known_types()
        );
        while self.running.load(Ordering::SeqCst) {
            let jobs = match self
                .queue
                .receive(
                    self.config.worker_concurrency,
                    Duration::from_secs(self.config.queue_wait_seconds),
                )
                .await
            {
                Ok(jobs) => jobs,
                Err(err) => {
                    error!("Queue receive failed: {}", err);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            let tasks = jobs.into_iter().map(|job| {
                let worker = Arc::clone(&self);
                async move {
                    let run_id = job.message.run_id;
                    match worker.process_job(job).await {
                        Ok(outcome) => {
                            info!("Run {} processed: {:?}", run_id, outcome);
                        }
                        Err(err) => {
                            error!("Run {} processing error: {}", run_id, err);
                        }
                    }
                }
            });
            futures::future::join_all(tasks).await;
        }
        info!("Worker loop stopped");
    }

    /// Process one queue message to completion or explicit abandonment.
    pub async fn process_job(&self, job: ReceivedJob) -> EngineResult<JobOutcome> {
        let run_id = job.message.run_id;

        let run = match self.store.get_run(&run_id).await? {
            Some(run) => run,
            None => {
                // The queue outlived the row (or the insert never landed);
                // nothing to execute.
                warn!("Queue message for unknown run {}; discarding", run_id);
                self.queue.delete(&job.receipt).await?;
                return Ok(JobOutcome::DuplicateDelivery);
            }
        };

        if run.status.is_terminal() || run.finalize_stage.is_some() {
            self.queue.delete(&job.receipt).await?;
            counter!("tollgate_worker_duplicate_deliveries_total").increment(1);
            return Ok(JobOutcome::DuplicateDelivery);
        }

        // QUEUED -> PROCESSING under version-CAS; losers walk away.
        let lease_token = fresh_token();
        let lease_ttl = Duration::from_secs(self.config.lease_ttl_seconds);
        let lease_expires_at = Utc::now() + chrono::Duration::seconds(self.config.lease_ttl_seconds as i64);
        let started = self
            .store
            .cas_start_processing(&run_id, run.version, &lease_token, lease_expires_at)
            .await?;
        if !started {
            self.queue.delete(&job.receipt).await?;
            return Ok(JobOutcome::LostStart);
        }
        let version = run.version + 1;
        self.ledger.put_lease(&run_id, &lease_token, lease_ttl).await?;
        counter!("tollgate_worker_leases_acquired_total").increment(1);

        let exec = self.execute_with_heartbeat(&run, version, &lease_token).await;

        match exec {
            ExecResult::LeaseLost => {
                // A reaper owns the run now; our claim would lose anyway.
                counter!("tollgate_worker_lease_lost_total").increment(1);
                self.queue.delete(&job.receipt).await?;
                Ok(JobOutcome::LostFinalize)
            }
            ExecResult::PackError(detail) => {
                // Executor exceptions are left to the reaper: no upload, no
                // claim, the lease simply expires.
                error!("Pack failed for run {}: {}", run_id, detail);
                counter!("tollgate_worker_pack_errors_total").increment(1);
                Ok(JobOutcome::AbandonedToReaper)
            }
            ExecResult::TimedOut => {
                self.finalize_failure(&job, &run, version, &lease_token, ReasonCode::ExecutorTimeout)
                    .await
            }
            ExecResult::UnknownPack => {
                self.finalize_failure(&job, &run, version, &lease_token, ReasonCode::ValidationFailed)
                    .await
            }
            ExecResult::Done(output) => {
                self.finalize_success(&job, &run, version, &lease_token, output)
                    .await
            }
        }
    }

    async fn execute_with_heartbeat(
        &self,
        run: &RunRecord,
        version: i64,
        lease_token: &str,
    ) -> ExecResult {
        let executor = match self.registry.get(&run.pack_type) {
            Some(executor) => executor,
            None => {
                error!("No executor registered for pack type {:?}", run.pack_type);
                return ExecResult::UnknownPack;
            }
        };

        let (lost_tx, mut lost_rx) = watch::channel(false);
        let heartbeat = {
            let store = Arc::clone(&self.store);
            let ledger = Arc::clone(&self.ledger);
            let run_id = run.run_id;
            let lease_token = lease_token.to_string();
            let heartbeat_secs = self.config.heartbeat_interval_seconds;
            let lease_ttl_secs = self.config.lease_ttl_seconds;
            tokio::spawn(async move {
                let mut ticker = interval(Duration::from_secs(heartbeat_secs));
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // The first tick fires immediately; the lease was just set.
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let expiry = Utc::now() + chrono::Duration::seconds(lease_ttl_secs as i64);
                    let cache_ok = ledger
                        .extend_lease(&run_id, &lease_token, Duration::from_secs(lease_ttl_secs))
                        .await
                        .unwrap_or(false);
                    let db_ok = store
                        .cas_heartbeat(&run_id, version, &lease_token, expiry)
                        .await
                        .unwrap_or(false);
                    if !(cache_ok && db_ok) {
                        warn!("Heartbeat lost for run {}; aborting executor", run_id);
                        let _ = lost_tx.send(true);
                        break;
                    }
                }
            })
        };

        let request = PackRequest {
            run_id: run.run_id.to_hex(),
            tenant_id: run.tenant_id.to_string(),
            inputs: run.inputs.clone(),
            reserved_amount: run.reserved_amount,
        };
        let timebox = Duration::from_secs(run.timebox_sec as u64);

        let result = tokio::select! {
            _ = lost_rx.changed() => ExecResult::LeaseLost,
            execution = tokio::time::timeout(timebox, executor.execute(&request)) => {
                match execution {
                    Ok(Ok(output)) => ExecResult::Done(output),
                    Ok(Err(err)) => ExecResult::PackError(err.to_string()),
                    Err(_) => ExecResult::TimedOut,
                }
            }
        };
        heartbeat.abort();
        result
    }

    async fn finalize_success(
        &self,
        job: &ReceivedJob,
        run: &RunRecord,
        version: i64,
        lease_token: &str,
        output: PackOutput,
    ) -> EngineResult<JobOutcome> {
        let run_id = run.run_id;

        // Anything above the reservation is clipped; the ledger script
        // enforces the same bound independently.
        let mut actual = output.actual_amount;
        if actual > run.reserved_amount {
            warn!(
                "Pack metered {} micros above the {} micro reservation for {}; clipping",
                actual.micros(),
                run.reserved_amount.micros(),
                run_id
            );
            counter!("tollgate_worker_cost_clipped_total").increment(1);
            actual = run.reserved_amount;
        }

        let key = result_key(&run.tenant_id, run.created_at, &run_id);
        let envelope = build_envelope(run, RunStatus::Completed, actual, &output);
        let body = serde_json::to_vec(&envelope)
            .map_err(|err| crate::error::EngineError::Internal(format!("envelope encode: {err}")))?;

        let uploaded = self
            .results
            .put_result(&key, body, actual, &run_id)
            .await;
        let upload = match uploaded {
            Ok(hash) => Some(ResultRef {
                bucket: self.results.bucket().to_string(),
                key: key.clone(),
                hash,
            }),
            Err(err) => {
                error!("Result upload failed for {}: {}", run_id, err);
                None
            }
        };

        // Phase A: claim the finalize while the lease still holds.
        let finalize_token = fresh_token();
        let claimed = self
            .store
            .cas_claim_finalize(&run_id, version, lease_token, &finalize_token, Utc::now())
            .await?;
        if !claimed {
            // A reaper got here first. No settle, no second upload, no
            // ledger touch of any kind.
            counter!("tollgate_worker_finalize_lost_total").increment(1);
            self.queue.delete(&job.receipt).await?;
            return Ok(JobOutcome::LostFinalize);
        }
        let version = version + 1;

        let (commit, outcome) = match upload {
            Some(result) => {
                self.settle_logged(run, actual).await;
                (FinalizeCommit::completed(actual, result), JobOutcome::Completed)
            }
            None => {
                // Claim is ours, so the run must still reach a terminal,
                // settled state: minimum fee, FAILED.
                self.settle_logged(run, run.minimum_fee_amount).await;
                (
                    FinalizeCommit::failed_settled(
                        run.minimum_fee_amount,
                        ReasonCode::ResultUploadFailed,
                    ),
                    JobOutcome::Failed(ReasonCode::ResultUploadFailed),
                )
            }
        };

        self.commit_and_delete(job, &run_id, version, &finalize_token, lease_token, commit, outcome)
            .await
    }

    async fn finalize_failure(
        &self,
        job: &ReceivedJob,
        run: &RunRecord,
        version: i64,
        lease_token: &str,
        reason: ReasonCode,
    ) -> EngineResult<JobOutcome> {
        let run_id = run.run_id;
        let finalize_token = fresh_token();
        let claimed = self
            .store
            .cas_claim_finalize(&run_id, version, lease_token, &finalize_token, Utc::now())
            .await?;
        if !claimed {
            counter!("tollgate_worker_finalize_lost_total").increment(1);
            self.queue.delete(&job.receipt).await?;
            return Ok(JobOutcome::LostFinalize);
        }
        let version = version + 1;

        self.settle_logged(run, run.minimum_fee_amount).await;
        let commit = FinalizeCommit::failed_settled(run.minimum_fee_amount, reason);
        self.commit_and_delete(
            job,
            &run_id,
            version,
            &finalize_token,
            lease_token,
            commit,
            JobOutcome::Failed(reason),
        )
        .await
    }

    /// Phase B. A missing reservation here is a serious anomaly (we hold the
    /// claim), logged loudly but not fatal: the commit must still happen.
    async fn settle_logged(&self, run: &RunRecord, charge: Money) {
        match self.ledger.settle(&run.tenant_id, &run.run_id, charge).await {
            Ok(SettleOutcome::Settled { charged, refunded, .. }) => {
                counter!("tollgate_settled_total").increment(1);
                counter!("tollgate_settled_micros").increment(charged.micros() as u64);
                counter!("tollgate_refunded_micros").increment(refunded.micros() as u64);
            }
            Ok(SettleOutcome::NoReservation) => {
                error!(
                    "Settle for {} found no reservation while holding the finalize claim",
                    run.run_id
                );
            }
            Err(err) => {
                error!("Settle failed for {}: {}", run.run_id, err);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn commit_and_delete(
        &self,
        job: &ReceivedJob,
        run_id: &RunId,
        version: i64,
        finalize_token: &str,
        lease_token: &str,
        commit: FinalizeCommit,
        outcome: JobOutcome,
    ) -> EngineResult<JobOutcome> {
        let committed = self
            .store
            .cas_commit(run_id, version, finalize_token, &commit)
            .await?;
        if !committed {
            // Claimed but not committed: exactly the window the reconciler
            // exists for. Keep the message; redelivery is harmless.
            error!(
                "Phase C commit affected 0 rows for {} (stage CLAIMED); leaving to reconciler",
                run_id
            );
            counter!("tollgate_worker_commit_lost_total").increment(1);
            return Ok(JobOutcome::CommitLost);
        }

        let _ = self.ledger.clear_lease(run_id, lease_token).await;
        self.queue.delete(&job.receipt).await?;
        match outcome {
            JobOutcome::Completed => counter!("tollgate_runs_completed_total").increment(1),
            JobOutcome::Failed(_) => counter!("tollgate_runs_failed_total").increment(1),
            _ => {}
        }
        Ok(outcome)
    }
}

fn build_envelope(
    run: &RunRecord,
    status: RunStatus,
    actual: Money,
    output: &PackOutput,
) -> ResultEnvelope {
    ResultEnvelope {
        schema_version: SCHEMA_VERSION.to_string(),
        run_id: run.run_id,
        pack_type: run.pack_type.clone(),
        status,
        generated_at: to_rfc3339(Utc::now()),
        cost: CostBreakdown {
            reserved: run.reserved_amount.to_display(),
            used: actual.to_display(),
            minimum_fee: run.minimum_fee_amount.to_display(),
        },
        data: output.data.clone(),
        artifacts: output.artifacts.clone(),
        meta: EnvelopeMeta {
            trace_id: run.trace_id.clone(),
            profile_version: SCHEMA_VERSION.to_string(),
        },
    }
}
