use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::id::{RunId, TenantId};
use crate::money::Money;

/// Execution state of a run.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Accepted and reserved, waiting for a worker.
    Queued,
    /// A worker holds the lease and is executing.
    Processing,
    /// Finalized with a result artifact.
    Completed,
    /// Finalized without a usable result.
    Failed,
    /// Past retention; artifact gone, row kept as a tombstone.
    Expired,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed | RunStatus::Expired)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Queued => "QUEUED",
            RunStatus::Processing => "PROCESSING",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Failed => "FAILED",
            RunStatus::Expired => "EXPIRED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "QUEUED" => RunStatus::Queued,
            "PROCESSING" => RunStatus::Processing,
            "COMPLETED" => RunStatus::Completed,
            "FAILED" => RunStatus::Failed,
            "EXPIRED" => RunStatus::Expired,
            _ => return None,
        })
    }
}

/// Financial state of a run. Moves independently of `RunStatus` but the two
/// are linked by invariants (see `transition_allowed`).
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MoneyState {
    /// Pre-reservation. Never persisted on an accepted run.
    None,
    /// Budget held on the ledger, not yet consumed.
    Reserved,
    /// Actual charge consumed, remainder refunded.
    Settled,
    /// Full reservation returned to balance.
    Refunded,
    /// Manual-intervention parking state (reconciler found actual > reserved).
    Disputed,
}

impl MoneyState {
    pub fn as_str(self) -> &'static str {
        match self {
            MoneyState::None => "NONE",
            MoneyState::Reserved => "RESERVED",
            MoneyState::Settled => "SETTLED",
            MoneyState::Refunded => "REFUNDED",
            MoneyState::Disputed => "DISPUTED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "NONE" => MoneyState::None,
            "RESERVED" => MoneyState::Reserved,
            "SETTLED" => MoneyState::Settled,
            "REFUNDED" => MoneyState::Refunded,
            "DISPUTED" => MoneyState::Disputed,
            _ => return None,
        })
    }
}

/// Two-phase finalize cursor.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinalizeStage {
    /// One finalizer won the claim; side-effects may be in flight.
    Claimed,
    /// Terminal commit done. The row is immutable apart from retention.
    Committed,
}

impl FinalizeStage {
    pub fn as_str(self) -> &'static str {
        match self {
            FinalizeStage::Claimed => "CLAIMED",
            FinalizeStage::Committed => "COMMITTED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "CLAIMED" => FinalizeStage::Claimed,
            "COMMITTED" => FinalizeStage::Committed,
            _ => return None,
        })
    }
}

/// Machine-readable failure/rejection tags, independent of HTTP mapping.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    InvalidMoneyScale,
    AuthInvalid,
    TenantMismatch,
    BudgetDrained,
    IdempotencyConflict,
    IdempotencyRetry,
    QueueEnqueueFailed,
    RateLimited,
    RunNotFound,
    RunExpired,
    ExecutorTimeout,
    WorkerTimeout,
    ReservationExpired,
    ResultUploadFailed,
    ReconcileNoResult,
    ValidationFailed,
    Internal,
}

impl ReasonCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ReasonCode::InvalidMoneyScale => "INVALID_MONEY_SCALE",
            ReasonCode::AuthInvalid => "AUTH_INVALID",
            ReasonCode::TenantMismatch => "TENANT_MISMATCH",
            ReasonCode::BudgetDrained => "BUDGET_DRAINED",
            ReasonCode::IdempotencyConflict => "IDEMPOTENCY_CONFLICT",
            ReasonCode::IdempotencyRetry => "IDEMPOTENCY_RETRY",
            ReasonCode::QueueEnqueueFailed => "QUEUE_ENQUEUE_FAILED",
            ReasonCode::RateLimited => "RATE_LIMITED",
            ReasonCode::RunNotFound => "RUN_NOT_FOUND",
            ReasonCode::RunExpired => "RUN_EXPIRED",
            ReasonCode::ExecutorTimeout => "EXECUTOR_TIMEOUT",
            ReasonCode::WorkerTimeout => "WORKER_TIMEOUT",
            ReasonCode::ReservationExpired => "RESERVATION_EXPIRED",
            ReasonCode::ResultUploadFailed => "RESULT_UPLOAD_FAILED",
            ReasonCode::ReconcileNoResult => "RECONCILE_NO_RESULT",
            ReasonCode::ValidationFailed => "VALIDATION_FAILED",
            ReasonCode::Internal => "INTERNAL",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "INVALID_MONEY_SCALE" => ReasonCode::InvalidMoneyScale,
            "AUTH_INVALID" => ReasonCode::AuthInvalid,
            "TENANT_MISMATCH" => ReasonCode::TenantMismatch,
            "BUDGET_DRAINED" => ReasonCode::BudgetDrained,
            "IDEMPOTENCY_CONFLICT" => ReasonCode::IdempotencyConflict,
            "IDEMPOTENCY_RETRY" => ReasonCode::IdempotencyRetry,
            "QUEUE_ENQUEUE_FAILED" => ReasonCode::QueueEnqueueFailed,
            "RATE_LIMITED" => ReasonCode::RateLimited,
            "RUN_NOT_FOUND" => ReasonCode::RunNotFound,
            "RUN_EXPIRED" => ReasonCode::RunExpired,
            "EXECUTOR_TIMEOUT" => ReasonCode::ExecutorTimeout,
            "WORKER_TIMEOUT" => ReasonCode::WorkerTimeout,
            "RESERVATION_EXPIRED" => ReasonCode::ReservationExpired,
            "RESULT_UPLOAD_FAILED" => ReasonCode::ResultUploadFailed,
            "RECONCILE_NO_RESULT" => ReasonCode::ReconcileNoResult,
            "VALIDATION_FAILED" => ReasonCode::ValidationFailed,
            "INTERNAL" => ReasonCode::Internal,
            _ => return None,
        })
    }
}

/// The authoritative run record. One row per accepted submission; the
/// database copy is the single source of truth, everything else is cache.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub tenant_id: TenantId,
    pub pack_type: String,
    pub status: RunStatus,
    pub money_state: MoneyState,
    pub idempotency_key: String,
    pub payload_fingerprint: String,
    /// Optimistic-locking cursor; bumped on every mutation.
    pub version: i64,
    pub reserved_amount: Money,
    pub actual_amount: Option<Money>,
    pub minimum_fee_amount: Money,
    pub timebox_sec: u32,
    pub inputs: Value,
    pub result_bucket: Option<String>,
    pub result_key: Option<String>,
    pub result_hash: Option<String>,
    pub retention_until: DateTime<Utc>,
    pub lease_token: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub finalize_stage: Option<FinalizeStage>,
    pub finalize_token: Option<String>,
    pub finalize_claimed_at: Option<DateTime<Utc>>,
    pub last_error_reason: Option<ReasonCode>,
    pub trace_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunRecord {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Invariant check for a persisted row; exercised by tests and debug
    /// assertions in the in-memory store.
    pub fn holds_invariants(&self) -> bool {
        let money_present = self.money_state != MoneyState::None;
        let terminal_settled = !self.status.is_terminal()
            || matches!(self.money_state, MoneyState::Settled | MoneyState::Refunded);
        let lease_during_processing = self.status != RunStatus::Processing
            || (self.lease_token.is_some() && self.lease_expires_at.is_some());
        let actual_clipped = match self.actual_amount {
            Some(actual) => actual <= self.reserved_amount || self.money_state == MoneyState::Disputed,
            None => true,
        };
        money_present && terminal_settled && lease_during_processing && actual_clipped
    }
}

/// Legal moves of the coupled (execution, financial) state machine.
pub fn transition_allowed(
    from: (RunStatus, MoneyState),
    to: (RunStatus, MoneyState),
) -> bool {
    use MoneyState::*;
    use RunStatus::*;

    matches!(
        (from, to),
        ((Queued, Reserved), (Processing, Reserved))
            | ((Queued, Reserved), (Failed, Refunded))
            | ((Processing, Reserved), (Completed, Settled))
            | ((Processing, Reserved), (Failed, Settled))
            | ((Completed, Settled), (Expired, Settled))
            | ((Failed, Settled), (Expired, Settled))
            | ((Failed, Refunded), (Expired, Refunded))
    )
}
