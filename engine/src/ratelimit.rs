//! Per-tenant token bucket for status polls.
//!
//! Integer arithmetic in milli-tokens; one bucket per tenant in a concurrent
//! map. Buckets refill continuously at `limit_per_minute` and hold at most
//! one minute of budget.

use dashmap::DashMap;

use tollgate_common::time::{get_current_time_in_millis, TimestampMillis};
use tollgate_common::TenantId;

use crate::error::{EngineError, EngineResult};

const MILLIS_PER_MINUTE: u64 = 60_000;
const MILLI_TOKENS_PER_TOKEN: u64 = 1_000;

struct Bucket {
    milli_tokens: u64,
    refilled_at: TimestampMillis,
}

pub struct PollRateLimiter {
    limit_per_minute: u32,
    buckets: DashMap<TenantId, Bucket>,
}

impl PollRateLimiter {
    pub fn new(limit_per_minute: u32) -> Self {
        Self {
            limit_per_minute,
            buckets: DashMap::new(),
        }
    }

    /// Take one token or fail with a retry hint.
    pub fn check(&self, tenant: &TenantId) -> EngineResult<()> {
        self.check_at(tenant, get_current_time_in_millis())
    }

    fn check_at(&self, tenant: &TenantId, now: TimestampMillis) -> EngineResult<()> {
        let capacity = self.limit_per_minute as u64 * MILLI_TOKENS_PER_TOKEN;
        let mut bucket = self
            .buckets
            .entry(tenant.clone())
            .or_insert_with(|| Bucket {
                milli_tokens: capacity,
                refilled_at: now,
            });

        let elapsed = now.saturating_sub(bucket.refilled_at);
        let refill = elapsed * self.limit_per_minute as u64 * MILLI_TOKENS_PER_TOKEN
            / MILLIS_PER_MINUTE;
        if refill > 0 {
            bucket.milli_tokens = (bucket.milli_tokens + refill).min(capacity);
            bucket.refilled_at = now;
        }

        if bucket.milli_tokens >= MILLI_TOKENS_PER_TOKEN {
            bucket.milli_tokens -= MILLI_TOKENS_PER_TOKEN;
            return Ok(());
        }

        // How long until a whole token accumulates.
        let deficit = MILLI_TOKENS_PER_TOKEN - bucket.milli_tokens;
        let wait_ms = deficit * MILLIS_PER_MINUTE
            / (self.limit_per_minute as u64 * MILLI_TOKENS_PER_TOKEN);
        Err(EngineError::RateLimited {
            retry_after_seconds: (wait_ms / 1_000).max(1),
        })
    }
}
