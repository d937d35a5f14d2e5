use serde::{Deserialize, Serialize};

use crate::money::{MinimumFeeSchedule, Money};

// Retention window for run rows and result artifacts
// The object-store lifecycle rule must match this value
pub const DEFAULT_RETENTION_DAYS: u32 = 30;

// Maximum worker grace before the reaper can claim an expired lease
pub const DEFAULT_LEASE_TTL_SECONDS: u64 = 120;

// Lease refresh cadence; must stay at or below a third of the lease TTL
// so a single missed heartbeat never hands the run to the reaper
pub const DEFAULT_HEARTBEAT_INTERVAL_SECONDS: u64 = 30;

// Zombie-lease scan cadence; bounds cleanup latency after a worker dies
pub const DEFAULT_REAPER_INTERVAL_SECONDS: u64 = 30;

// Deadline after which a QUEUED run with no queue delivery is refunded
pub const DEFAULT_RESERVATION_TTL_SECONDS: u64 = 3600;

// Lifetime of presigned result download URLs
pub const DEFAULT_PRESIGNED_URL_TTL_SECONDS: u64 = 600;

// Poll interval advertised to clients on QUEUED/PROCESSING responses
pub const DEFAULT_POLL_RECOMMENDED_INTERVAL_MS: u64 = 1500;

// Upper bound on reservation.timebox_sec
pub const DEFAULT_TIMEBOX_SEC_MAX: u32 = 90;

// Minimum-fee schedule: 2% of the reservation, floored,
// clamped to [5000, 100000] micros
pub const DEFAULT_MINIMUM_FEE_RATE_BPS: u32 = 200;
pub const DEFAULT_MINIMUM_FEE_FLOOR_MICROS: i64 = 5_000;
pub const DEFAULT_MINIMUM_FEE_CEILING_MICROS: i64 = 100_000;

// Per-tenant GET poll budget
pub const DEFAULT_RATE_LIMIT_POLL_PER_MINUTE: u32 = 60;

// Reconciler cadence and the grace it gives an in-flight finalizer before
// treating a CLAIMED row as abandoned
pub const DEFAULT_RECONCILE_INTERVAL_SECONDS: u64 = 300;
pub const DEFAULT_RECONCILE_GRACE_SECONDS: u64 = 300;

// Stuck-reservation sweep cadence
pub const DEFAULT_RESERVATION_SWEEP_INTERVAL_SECONDS: u64 = 300;

// Retention sweep cadence (daily)
pub const DEFAULT_RETENTION_SWEEP_INTERVAL_SECONDS: u64 = 86_400;

// Reaper/sweeper page size; small batches keep each CAS window short
pub const DEFAULT_SWEEP_BATCH: usize = 256;

// Queue long-poll wait and per-process consumer parallelism
pub const DEFAULT_QUEUE_WAIT_SECONDS: u64 = 20;
pub const DEFAULT_WORKER_CONCURRENCY: usize = 4;

// Idempotency submission lock TTL; long enough for reserve+insert+enqueue,
// short enough that a crashed submission releases quickly
pub const DEFAULT_IDEMPOTENCY_LOCK_TTL_MS: u64 = 5_000;

// Retry budget for transient store errors inside a single CAS
pub const CAS_RETRY_ATTEMPTS: u32 = 3;
pub const CAS_RETRY_BACKOFF_MS: u64 = 50;

// Listing page cap for GET /v1/runs
pub const MAX_LIST_RUNS: usize = 100;

/// Engine configuration. Defaults mirror the constants above; deployments
/// override via config file or flags in the binaries.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub retention_days: u32,
    pub lease_ttl_seconds: u64,
    pub heartbeat_interval_seconds: u64,
    pub reaper_interval_seconds: u64,
    pub reservation_ttl_seconds: u64,
    pub presigned_url_ttl_seconds: u64,
    pub poll_recommended_interval_ms: u64,
    pub timebox_sec_max: u32,
    pub minimum_fee_rate_bps: u32,
    pub minimum_fee_floor_micros: i64,
    pub minimum_fee_ceiling_micros: i64,
    pub rate_limit_poll_per_minute: u32,
    pub reconcile_interval_seconds: u64,
    pub reconcile_grace_seconds: u64,
    pub reservation_sweep_interval_seconds: u64,
    pub retention_sweep_interval_seconds: u64,
    pub sweep_batch: usize,
    pub queue_wait_seconds: u64,
    pub worker_concurrency: usize,
    pub idempotency_lock_ttl_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retention_days: DEFAULT_RETENTION_DAYS,
            lease_ttl_seconds: DEFAULT_LEASE_TTL_SECONDS,
            heartbeat_interval_seconds: DEFAULT_HEARTBEAT_INTERVAL_SECONDS,
            reaper_interval_seconds: DEFAULT_REAPER_INTERVAL_SECONDS,
            reservation_ttl_seconds: DEFAULT_RESERVATION_TTL_SECONDS,
            presigned_url_ttl_seconds: DEFAULT_PRESIGNED_URL_TTL_SECONDS,
            poll_recommended_interval_ms: DEFAULT_POLL_RECOMMENDED_INTERVAL_MS,
            timebox_sec_max: DEFAULT_TIMEBOX_SEC_MAX,
            minimum_fee_rate_bps: DEFAULT_MINIMUM_FEE_RATE_BPS,
            minimum_fee_floor_micros: DEFAULT_MINIMUM_FEE_FLOOR_MICROS,
            minimum_fee_ceiling_micros: DEFAULT_MINIMUM_FEE_CEILING_MICROS,
            rate_limit_poll_per_minute: DEFAULT_RATE_LIMIT_POLL_PER_MINUTE,
            reconcile_interval_seconds: DEFAULT_RECONCILE_INTERVAL_SECONDS,
            reconcile_grace_seconds: DEFAULT_RECONCILE_GRACE_SECONDS,
            reservation_sweep_interval_seconds: DEFAULT_RESERVATION_SWEEP_INTERVAL_SECONDS,
            retention_sweep_interval_seconds: DEFAULT_RETENTION_SWEEP_INTERVAL_SECONDS,
            sweep_batch: DEFAULT_SWEEP_BATCH,
            queue_wait_seconds: DEFAULT_QUEUE_WAIT_SECONDS,
            worker_concurrency: DEFAULT_WORKER_CONCURRENCY,
            idempotency_lock_ttl_ms: DEFAULT_IDEMPOTENCY_LOCK_TTL_MS,
        }
    }
}

impl EngineConfig {
    pub fn minimum_fee_schedule(&self) -> MinimumFeeSchedule {
        MinimumFeeSchedule {
            rate_bps: self.minimum_fee_rate_bps,
            floor: Money::from_micros(self.minimum_fee_floor_micros),
            ceiling: Money::from_micros(self.minimum_fee_ceiling_micros),
        }
    }

    pub fn retention_window(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention_days as i64)
    }

    /// Reject configurations that would let a healthy worker lose its lease.
    pub fn validate(&self) -> Result<(), String> {
        if self.heartbeat_interval_seconds == 0 {
            return Err("heartbeat_interval_seconds must be positive".into());
        }
        if self.heartbeat_interval_seconds * 3 > self.lease_ttl_seconds {
            return Err(format!(
                "heartbeat_interval_seconds ({}) must be <= lease_ttl_seconds / 3 ({})",
                self.heartbeat_interval_seconds,
                self.lease_ttl_seconds / 3
            ));
        }
        if self.timebox_sec_max == 0 {
            return Err("timebox_sec_max must be positive".into());
        }
        if self.minimum_fee_floor_micros <= 0 {
            return Err("minimum_fee_floor_micros must be positive".into());
        }
        if self.minimum_fee_ceiling_micros < self.minimum_fee_floor_micros {
            return Err("minimum_fee_ceiling_micros must be >= floor".into());
        }
        if self.worker_concurrency == 0 {
            return Err("worker_concurrency must be positive".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn heartbeat_must_fit_three_times_in_lease() {
        let mut config = EngineConfig::default();
        config.lease_ttl_seconds = 60;
        config.heartbeat_interval_seconds = 30;
        assert!(config.validate().is_err());

        config.heartbeat_interval_seconds = 20;
        config.validate().unwrap();
    }

    #[test]
    fn fee_ceiling_below_floor_rejected() {
        let mut config = EngineConfig::default();
        config.minimum_fee_ceiling_micros = 100;
        assert!(config.validate().is_err());
    }
}
