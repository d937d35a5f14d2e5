//! Wire types for the HTTP surface, the work queue and the result envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::id::{RunId, TenantId};
use crate::run::{ReasonCode, RunStatus};

/// Envelope and queue message schema version.
pub const SCHEMA_VERSION: &str = "1";

// Cost headers carried by every run endpoint response.
pub const HEADER_COST_RESERVED: &str = "X-Cost-Reserved";
pub const HEADER_COST_USED: &str = "X-Cost-Used";
pub const HEADER_BALANCE_REMAINING: &str = "X-Balance-Remaining";
pub const HEADER_IDEMPOTENCY_KEY: &str = "Idempotency-Key";

/// `POST /v1/runs` body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubmitRunRequest {
    pub pack_type: String,
    pub inputs: Value,
    pub reservation: ReservationParams,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<RequestMeta>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReservationParams {
    /// Decimal string, at most 4 fractional digits.
    pub max_cost: String,
    pub timebox_sec: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_reliability_score: Option<f64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

/// 202 receipt for an accepted (or replayed) submission.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunReceipt {
    pub run_id: RunId,
    pub status: RunStatus,
    /// Reserved amount as a 4-decimal string.
    pub reserved: String,
    pub poll_interval_ms: u64,
}

/// Cost breakdown attached to poll responses and envelopes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub reserved: String,
    pub used: String,
    pub minimum_fee: String,
}

/// `GET /v1/runs/{run_id}` body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunStatusResponse {
    pub run_id: RunId,
    pub status: RunStatus,
    pub cost: CostBreakdown,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultPointer>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureDetails>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResultPointer {
    /// Presigned GET URL, short-lived.
    pub download_url: String,
    /// SHA-256 of the stored envelope body.
    pub content_hash: String,
    pub url_expires_in_seconds: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FailureDetails {
    pub reason_code: ReasonCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// `GET /v1/runs` body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunListResponse {
    pub runs: Vec<RunListEntry>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunListEntry {
    pub run_id: RunId,
    pub pack_type: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
}

/// RFC 9457 problem details with the platform's extension members.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub problem_type: String,
    pub title: String,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub reason_code: ReasonCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
}

impl ProblemDetails {
    pub fn new(status: u16, title: &str, reason_code: ReasonCode) -> Self {
        Self {
            problem_type: format!("urn:tollgate:problem:{}", reason_code.as_str()),
            title: title.to_string(),
            status,
            detail: None,
            reason_code,
            trace_id: None,
            run_id: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_trace(mut self, trace_id: Option<String>) -> Self {
        self.trace_id = trace_id;
        self
    }

    pub fn with_run(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }
}

/// Message carried on the work queue. Small on purpose: the worker reads the
/// authoritative row before doing anything.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobMessage {
    pub run_id: RunId,
    pub tenant_id: TenantId,
    pub pack_type: String,
    pub enqueued_at: DateTime<Utc>,
    pub schema_version: String,
}

/// The artifact stored in the object store for a finalized run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub schema_version: String,
    pub run_id: RunId,
    pub pack_type: String,
    pub status: RunStatus,
    /// ISO-8601.
    pub generated_at: String,
    pub cost: CostBreakdown,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<Value>,
    pub meta: EnvelopeMeta,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvelopeMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    pub profile_version: String,
}
