//! Reservation/settlement ledger on a scripting KV store.
//!
//! Balances, reservations, leases and the idempotency gate live here. The
//! cache is ephemeral and never authoritative for run state; the scripts are
//! what make multi-key money moves atomic. Amounts stay far below 2^53, so
//! Lua's number type is exact for every value the scripts touch.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use serde::{Deserialize, Serialize};

use tollgate_common::{Money, RunId, TenantId};

use crate::error::{EngineError, EngineResult};

/// Outcome of the scripted Reserve operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReserveOutcome {
    Reserved { balance: Money },
    Insufficient { balance: Money },
    AlreadyReserved,
}

/// Outcome of the scripted Settle operation (RefundFull is charge = 0).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SettleOutcome {
    Settled {
        charged: Money,
        refunded: Money,
        balance: Money,
    },
    /// The reservation was already consumed (or never existed). The caller
    /// must treat this as "someone else settled" and do nothing.
    NoReservation,
}

/// Idempotency mapping value: which run a (tenant, key) pair resolved to.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdempotencyRecord {
    pub run_id: RunId,
    pub payload_fingerprint: String,
}

#[async_trait]
pub trait Ledger: Send + Sync {
    async fn balance(&self, tenant: &TenantId) -> EngineResult<Money>;

    /// Provisioning/top-up credit. Returns the new balance.
    async fn credit(&self, tenant: &TenantId, amount: Money) -> EngineResult<Money>;

    async fn reserve(
        &self,
        tenant: &TenantId,
        run_id: &RunId,
        amount: Money,
        reservation_ttl: Duration,
    ) -> EngineResult<ReserveOutcome>;

    async fn settle(
        &self,
        tenant: &TenantId,
        run_id: &RunId,
        charge: Money,
    ) -> EngineResult<SettleOutcome>;

    async fn refund_full(&self, tenant: &TenantId, run_id: &RunId) -> EngineResult<SettleOutcome>;

    async fn put_lease(&self, run_id: &RunId, token: &str, ttl: Duration) -> EngineResult<()>;

    /// Refresh the lease TTL iff the stored token still matches.
    async fn extend_lease(&self, run_id: &RunId, token: &str, ttl: Duration)
        -> EngineResult<bool>;

    async fn clear_lease(&self, run_id: &RunId, token: &str) -> EngineResult<()>;

    /// SETNX submission lock; true when this caller acquired it.
    async fn acquire_submit_lock(
        &self,
        tenant: &TenantId,
        idempotency_key: &str,
        token: &str,
        ttl: Duration,
    ) -> EngineResult<bool>;

    async fn release_submit_lock(
        &self,
        tenant: &TenantId,
        idempotency_key: &str,
        token: &str,
    ) -> EngineResult<()>;

    async fn get_idempotency(
        &self,
        tenant: &TenantId,
        idempotency_key: &str,
    ) -> EngineResult<Option<IdempotencyRecord>>;

    async fn put_idempotency(
        &self,
        tenant: &TenantId,
        idempotency_key: &str,
        record: &IdempotencyRecord,
        ttl: Duration,
    ) -> EngineResult<()>;
}

// Reserve(balance, reservation, amount, tenant, created_at, ttl_sec)
const RESERVE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[2]) == 1 then
  return {'ALREADY_RESERVED', '0'}
end
local balance = tonumber(redis.call('GET', KEYS[1]) or '0')
local amount = tonumber(ARGV[1])
if balance < amount then
  return {'INSUFFICIENT', tostring(balance)}
end
balance = balance - amount
redis.call('SET', KEYS[1], tostring(balance))
redis.call('HSET', KEYS[2], 'tenant_id', ARGV[2], 'reserved_amount', ARGV[1], 'created_at', ARGV[3])
redis.call('EXPIRE', KEYS[2], tonumber(ARGV[4]))
return {'OK', tostring(balance)}
"#;

// Settle(balance, reservation, charge): clip, refund remainder, consume.
const SETTLE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[2]) == 0 then
  return {'NO_RESERVE', '0', '0', '0'}
end
local reserved = tonumber(redis.call('HGET', KEYS[2], 'reserved_amount') or '0')
local charge = tonumber(ARGV[1])
if charge > reserved then
  charge = reserved
end
local refund = reserved - charge
local balance = tonumber(redis.call('GET', KEYS[1]) or '0') + refund
redis.call('SET', KEYS[1], tostring(balance))
redis.call('DEL', KEYS[2])
return {'OK', tostring(charge), tostring(refund), tostring(balance)}
"#;

// ExtendLease(lease, token, ttl_ms)
const EXTEND_LEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  redis.call('PEXPIRE', KEYS[1], tonumber(ARGV[2]))
  return 1
end
return 0
"#;

// Compare-and-delete for locks and leases.
const UNLOCK_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

fn balance_key(tenant: &TenantId) -> String {
    format!("balance:{}", tenant)
}

fn reservation_key(run_id: &RunId) -> String {
    format!("reservation:{}", run_id)
}

fn lease_key(run_id: &RunId) -> String {
    format!("lease:{}", run_id)
}

fn idempotency_key_name(tenant: &TenantId, key: &str) -> String {
    format!("idem:{}:{}", tenant, key)
}

fn idempotency_lock_name(tenant: &TenantId, key: &str) -> String {
    format!("idemlock:{}:{}", tenant, key)
}

/// Production ledger on Redis. All multi-key mutations go through EVAL.
pub struct RedisLedger {
    conn: ConnectionManager,
    reserve_script: Script,
    settle_script: Script,
    extend_lease_script: Script,
    unlock_script: Script,
}

impl RedisLedger {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            reserve_script: Script::new(RESERVE_SCRIPT),
            settle_script: Script::new(SETTLE_SCRIPT),
            extend_lease_script: Script::new(EXTEND_LEASE_SCRIPT),
            unlock_script: Script::new(UNLOCK_SCRIPT),
        }
    }

    fn parse_micros(raw: &str) -> EngineResult<Money> {
        raw.parse::<i64>()
            .map(Money::from_micros)
            .map_err(|_| EngineError::Corrupt(format!("ledger returned bad amount: {raw}")))
    }

    async fn run_settle(&self, tenant: &TenantId, run_id: &RunId, charge: Money) -> EngineResult<SettleOutcome> {
        let mut conn = self.conn.clone();
        let reply: Vec<String> = self
            .settle_script
            .key(balance_key(tenant))
            .key(reservation_key(run_id))
            .arg(charge.micros())
            .invoke_async(&mut conn)
            .await?;

        match reply.first().map(String::as_str) {
            Some("NO_RESERVE") => Ok(SettleOutcome::NoReservation),
            Some("OK") if reply.len() == 4 => Ok(SettleOutcome::Settled {
                charged: Self::parse_micros(&reply[1])?,
                refunded: Self::parse_micros(&reply[2])?,
                balance: Self::parse_micros(&reply[3])?,
            }),
            _ => Err(EngineError::Corrupt(format!(
                "settle script returned unexpected reply: {reply:?}"
            ))),
        }
    }
}

#[async_trait]
impl Ledger for RedisLedger {
    async fn balance(&self, tenant: &TenantId) -> EngineResult<Money> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(balance_key(tenant))
            .query_async(&mut conn)
            .await?;
        match raw {
            Some(value) => Self::parse_micros(&value),
            None => Ok(Money::ZERO),
        }
    }

    async fn credit(&self, tenant: &TenantId, amount: Money) -> EngineResult<Money> {
        let mut conn = self.conn.clone();
        let balance: i64 = redis::cmd("INCRBY")
            .arg(balance_key(tenant))
            .arg(amount.micros())
            .query_async(&mut conn)
            .await?;
        Ok(Money::from_micros(balance))
    }

    async fn reserve(
        &self,
        tenant: &TenantId,
        run_id: &RunId,
        amount: Money,
        reservation_ttl: Duration,
    ) -> EngineResult<ReserveOutcome> {
        let mut conn = self.conn.clone();
        let reply: Vec<String> = self
            .reserve_script
            .key(balance_key(tenant))
            .key(reservation_key(run_id))
            .arg(amount.micros())
            .arg(tenant.as_str())
            .arg(tollgate_common::time::get_current_time_in_seconds())
            .arg(reservation_ttl.as_secs())
            .invoke_async(&mut conn)
            .await?;

        match reply.first().map(String::as_str) {
            Some("OK") if reply.len() == 2 => Ok(ReserveOutcome::Reserved {
                balance: Self::parse_micros(&reply[1])?,
            }),
            Some("INSUFFICIENT") if reply.len() == 2 => Ok(ReserveOutcome::Insufficient {
                balance: Self::parse_micros(&reply[1])?,
            }),
            Some("ALREADY_RESERVED") => Ok(ReserveOutcome::AlreadyReserved),
            _ => Err(EngineError::Corrupt(format!(
                "reserve script returned unexpected reply: {reply:?}"
            ))),
        }
    }

    async fn settle(
        &self,
        tenant: &TenantId,
        run_id: &RunId,
        charge: Money,
    ) -> EngineResult<SettleOutcome> {
        self.run_settle(tenant, run_id, charge).await
    }

    async fn refund_full(&self, tenant: &TenantId, run_id: &RunId) -> EngineResult<SettleOutcome> {
        self.run_settle(tenant, run_id, Money::ZERO).await
    }

    async fn put_lease(&self, run_id: &RunId, token: &str, ttl: Duration) -> EngineResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(lease_key(run_id))
            .arg(token)
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn extend_lease(
        &self,
        run_id: &RunId,
        token: &str,
        ttl: Duration,
    ) -> EngineResult<bool> {
        let mut conn = self.conn.clone();
        let extended: i64 = self
            .extend_lease_script
            .key(lease_key(run_id))
            .arg(token)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }

    async fn clear_lease(&self, run_id: &RunId, token: &str) -> EngineResult<()> {
        let mut conn = self.conn.clone();
        self.unlock_script
            .key(lease_key(run_id))
            .arg(token)
            .invoke_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn acquire_submit_lock(
        &self,
        tenant: &TenantId,
        idempotency_key: &str,
        token: &str,
        ttl: Duration,
    ) -> EngineResult<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(idempotency_lock_name(tenant, idempotency_key))
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn release_submit_lock(
        &self,
        tenant: &TenantId,
        idempotency_key: &str,
        token: &str,
    ) -> EngineResult<()> {
        let mut conn = self.conn.clone();
        self.unlock_script
            .key(idempotency_lock_name(tenant, idempotency_key))
            .arg(token)
            .invoke_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_idempotency(
        &self,
        tenant: &TenantId,
        idempotency_key: &str,
    ) -> EngineResult<Option<IdempotencyRecord>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(idempotency_key_name(tenant, idempotency_key))
            .query_async(&mut conn)
            .await?;
        match raw {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|err| EngineError::Corrupt(format!("bad idempotency record: {err}"))),
            None => Ok(None),
        }
    }

    async fn put_idempotency(
        &self,
        tenant: &TenantId,
        idempotency_key: &str,
        record: &IdempotencyRecord,
        ttl: Duration,
    ) -> EngineResult<()> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(record)
            .map_err(|err| EngineError::Internal(format!("idempotency encode: {err}")))?;
        redis::cmd("SET")
            .arg(idempotency_key_name(tenant, idempotency_key))
            .arg(json)
            .arg("EX")
            .arg(ttl.as_secs())
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }
}
