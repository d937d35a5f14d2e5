use thiserror::Error;

use tollgate_common::error::{MoneyError, ValidationError};
use tollgate_common::run::ReasonCode;
use tollgate_common::RunId;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("Ledger error: {0}")]
    Ledger(#[from] redis::RedisError),

    #[error("Object store error: {0}")]
    ObjectStore(#[source] anyhow::Error),

    #[error("Queue error: {0}")]
    Queue(#[source] anyhow::Error),

    #[error(transparent)]
    Money(#[from] MoneyError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Insufficient balance: need {need} micros, have {have} micros")]
    InsufficientBalance { need: i64, have: i64 },

    #[error("Reservation already exists for run {0}")]
    AlreadyReserved(RunId),

    #[error("Idempotency key replayed with a different payload (run {run_id})")]
    IdempotencyConflict { run_id: RunId },

    #[error("A submission with this idempotency key is in flight")]
    IdempotencyInFlight,

    #[error("Poll rate limit exceeded, retry after {retry_after_seconds}s")]
    RateLimited { retry_after_seconds: u64 },

    #[error("Bearer token missing or unknown")]
    AuthInvalid,

    #[error("Run not found")]
    RunNotFound,

    #[error("Run {0} is past its retention window")]
    RunExpired(RunId),

    #[error("Work could not be enqueued; reservation refunded")]
    EnqueueFailed,

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Internal invariant violated: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn object_store(err: impl Into<anyhow::Error>) -> Self {
        EngineError::ObjectStore(err.into())
    }

    pub fn queue(err: impl Into<anyhow::Error>) -> Self {
        EngineError::Queue(err.into())
    }

    pub fn reason_code(&self) -> ReasonCode {
        match self {
            EngineError::Money(_) => ReasonCode::InvalidMoneyScale,
            EngineError::Validation(_) => ReasonCode::ValidationFailed,
            EngineError::InsufficientBalance { .. } => ReasonCode::BudgetDrained,
            EngineError::IdempotencyConflict { .. } => ReasonCode::IdempotencyConflict,
            EngineError::IdempotencyInFlight => ReasonCode::IdempotencyRetry,
            EngineError::RateLimited { .. } => ReasonCode::RateLimited,
            EngineError::AuthInvalid => ReasonCode::AuthInvalid,
            EngineError::RunNotFound => ReasonCode::RunNotFound,
            EngineError::RunExpired(_) => ReasonCode::RunExpired,
            EngineError::EnqueueFailed => ReasonCode::QueueEnqueueFailed,
            _ => ReasonCode::Internal,
        }
    }

    /// HTTP status for the gateway. Stealth policy: not-found and
    /// tenant-mismatch are indistinguishable 404s.
    pub fn http_status(&self) -> u16 {
        match self {
            EngineError::Money(_) => 422,
            EngineError::Validation(_) => 422,
            EngineError::InsufficientBalance { .. } => 402,
            EngineError::IdempotencyConflict { .. } => 409,
            EngineError::IdempotencyInFlight => 409,
            EngineError::RateLimited { .. } => 429,
            EngineError::AuthInvalid => 401,
            EngineError::RunNotFound => 404,
            EngineError::RunExpired(_) => 410,
            EngineError::EnqueueFailed => 503,
            _ => 500,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
