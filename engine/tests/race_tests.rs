//! Forced interleavings of the worker and reaper finalize paths, and the
//! ledger's behavior under contention. The version-CAS primitives make
//! interleavings testable: losers observe affected-rows = 0.

mod support;

use chrono::{Duration as ChronoDuration, Utc};
use std::time::Duration;

use support::{TestEnv, TENANT};
use tollgate_common::id::fresh_token;
use tollgate_common::run::{MoneyState, ReasonCode, RunStatus};
use tollgate_common::{Money, RunId, TenantId};
use tollgate_engine::ledger::{Ledger, ReserveOutcome, SettleOutcome};
use tollgate_engine::store::{FinalizeCommit, ResultRef, RunStore};

async fn processing_run(env: &TestEnv, key: &str) -> (RunId, String) {
    let run_id = env.submit_fixed(key, "0.5000").await;
    let _job = env.receive_one().await;
    let lease_token = fresh_token();
    assert!(env
        .store
        .cas_start_processing(
            &run_id,
            0,
            &lease_token,
            Utc::now() + ChronoDuration::seconds(120),
        )
        .await
        .unwrap());
    (run_id, lease_token)
}

/// Interleaving A: the reaper claims first. The worker's Phase A sees
/// 0 affected rows and must not settle or commit.
#[tokio::test]
async fn reaper_first_worker_phase_a_loses() {
    let env = TestEnv::new();
    env.fund(10_000_000).await;
    let (run_id, lease_token) = processing_run(&env, "interleave-a1").await;

    env.store.mutate(&run_id, |run| {
        run.lease_expires_at = Some(Utc::now() - ChronoDuration::seconds(60));
    });
    assert_eq!(env.reaper().reap_expired_leases().await.unwrap(), 1);

    // The worker finishes its (now worthless) execution and tries to claim.
    let worker_claim = env
        .store
        .cas_claim_finalize(&run_id, 1, &lease_token, &fresh_token(), Utc::now())
        .await
        .unwrap();
    assert!(!worker_claim);

    // Exactly one side ran Phase C.
    let run = env.store.dump(&run_id);
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.last_error_reason, Some(ReasonCode::WorkerTimeout));
    assert_eq!(env.ledger.settle_count(), 1);
    assert_eq!(env.balance_micros().await, 9_990_000);
}

/// Interleaving B: the worker claims first (even with an expired lease on
/// the wall clock, its CAS wins the version race). The reaper's candidate
/// scan and claim both come up empty.
#[tokio::test]
async fn worker_first_reaper_finds_nothing() {
    let env = TestEnv::new();
    env.fund(10_000_000).await;
    let (run_id, lease_token) = processing_run(&env, "interleave-b1").await;

    let finalize_token = fresh_token();
    assert!(env
        .store
        .cas_claim_finalize(&run_id, 1, &lease_token, &finalize_token, Utc::now())
        .await
        .unwrap());

    // Lease looks expired, but the claim already excludes the row.
    env.store.mutate(&run_id, |run| {
        run.lease_expires_at = Some(Utc::now() - ChronoDuration::seconds(60));
    });
    assert_eq!(env.reaper().reap_expired_leases().await.unwrap(), 0);

    // The worker finishes Phase B and C normally.
    let settled = env
        .ledger
        .settle(&env.tenant(), &run_id, Money::from_micros(120_000))
        .await
        .unwrap();
    assert!(matches!(settled, SettleOutcome::Settled { .. }));
    let commit = FinalizeCommit::completed(
        Money::from_micros(120_000),
        ResultRef {
            bucket: "memory-results".into(),
            key: "k".into(),
            hash: "h".into(),
        },
    );
    assert!(env
        .store
        .cas_commit(&run_id, 2, &finalize_token, &commit)
        .await
        .unwrap());

    let run = env.store.dump(&run_id);
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.money_state, MoneyState::Settled);
    assert_eq!(env.ledger.settle_count(), 1);
    assert_eq!(env.balance_micros().await, 9_880_000);
}

/// Two reaper instances race over the same zombie: the version CAS lets
/// exactly one claim through.
#[tokio::test]
async fn two_reapers_one_settle() {
    let env = TestEnv::new();
    env.fund(10_000_000).await;
    let (run_id, _) = processing_run(&env, "tworeapers-1").await;
    env.store.mutate(&run_id, |run| {
        run.lease_expires_at = Some(Utc::now() - ChronoDuration::seconds(60));
    });

    let first = env.reaper();
    let second = env.reaper();
    let (a, b) = tokio::join!(first.reap_expired_leases(), second.reap_expired_leases());
    assert_eq!(a.unwrap() + b.unwrap(), 1);
    assert_eq!(env.ledger.settle_count(), 1);
    assert_eq!(env.balance_micros().await, 9_990_000);
}

#[tokio::test]
async fn settle_consumes_the_reservation_exactly_once() {
    let env = TestEnv::new();
    env.fund(10_000_000).await;
    let run_id = env.submit_fixed("once-key-001", "0.5000").await;

    let first = env
        .ledger
        .settle(&env.tenant(), &run_id, Money::from_micros(100_000))
        .await
        .unwrap();
    assert!(matches!(first, SettleOutcome::Settled { .. }));

    let second = env
        .ledger
        .settle(&env.tenant(), &run_id, Money::from_micros(100_000))
        .await
        .unwrap();
    assert_eq!(second, SettleOutcome::NoReservation);

    assert_eq!(env.ledger.settle_count(), 1);
    // 10.0000 - 0.5000 + 0.4000 refund, charged once.
    assert_eq!(env.balance_micros().await, 9_900_000);
}

#[tokio::test]
async fn concurrent_reserves_never_drive_balance_negative() {
    let env = TestEnv::new();
    env.fund(1_000_000).await; // 1.0000: room for exactly 3 x 0.3000

    let tenant = TenantId::from(TENANT);
    let attempts = (0..10).map(|_| {
        let ledger = env.ledger.clone();
        let tenant = tenant.clone();
        async move {
            ledger
                .reserve(
                    &tenant,
                    &RunId::generate(),
                    Money::from_micros(300_000),
                    Duration::from_secs(3600),
                )
                .await
                .unwrap()
        }
    });
    let outcomes = futures::future::join_all(attempts).await;

    let reserved = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, ReserveOutcome::Reserved { .. }))
        .count();
    let refused = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, ReserveOutcome::Insufficient { .. }))
        .count();
    assert_eq!(reserved, 3);
    assert_eq!(refused, 7);

    let balance = env.balance_micros().await;
    assert_eq!(balance, 100_000);
    assert!(balance >= 0);
    assert_eq!(env.ledger.reservation_total(&tenant), 900_000);
}
