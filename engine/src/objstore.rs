//! Result artifact storage.
//!
//! Artifacts live at a deterministic, date-partitioned key per run, so
//! re-uploads are idempotent and the reconciler can probe for them without
//! any pointer from the database. The actual cost is mirrored into object
//! metadata: it is what lets the reconciler distinguish "work done, commit
//! lost" from "work never finished".

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use chrono::{DateTime, Datelike, Utc};

use tollgate_common::fingerprint::sha256_hex;
use tollgate_common::{Money, RunId, TenantId};

use crate::error::{EngineError, EngineResult};

pub const METADATA_ACTUAL_COST: &str = "actual-cost";
pub const METADATA_RUN_ID: &str = "run-id";

/// Deterministic artifact key: `tenants/{tenant}/{yyyy}/{mm}/{dd}/{run}/result.json`.
pub fn result_key(tenant: &TenantId, created_at: DateTime<Utc>, run_id: &RunId) -> String {
    format!(
        "tenants/{}/{:04}/{:02}/{:02}/{}/result.json",
        tenant,
        created_at.year(),
        created_at.month(),
        created_at.day(),
        run_id
    )
}

/// Metadata read back by the reconciler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeadResult {
    pub actual_cost: Option<Money>,
    pub run_id: Option<String>,
}

impl HeadResult {
    pub fn from_metadata(metadata: &HashMap<String, String>) -> Self {
        Self {
            actual_cost: metadata
                .get(METADATA_ACTUAL_COST)
                .and_then(|raw| raw.parse::<i64>().ok())
                .map(Money::from_micros),
            run_id: metadata.get(METADATA_RUN_ID).cloned(),
        }
    }
}

#[async_trait]
pub trait ResultStore: Send + Sync {
    fn bucket(&self) -> &str;

    /// Upload the envelope body; returns its SHA-256 hex.
    async fn put_result(
        &self,
        key: &str,
        body: Vec<u8>,
        actual_cost: Money,
        run_id: &RunId,
    ) -> EngineResult<String>;

    /// Probe for the artifact; `None` when absent.
    async fn head_result(&self, key: &str) -> EngineResult<Option<HeadResult>>;

    /// Short-lived download URL for the owner.
    async fn presign_get(&self, key: &str, ttl: Duration) -> EngineResult<String>;
}

/// Production store on S3. Lifecycle expiry of old artifacts is a bucket
/// rule matching retention_days; the engine never deletes objects itself.
pub struct S3ResultStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3ResultStore {
    pub fn new(client: aws_sdk_s3::Client, bucket: String) -> Self {
        Self { client, bucket }
    }
}

#[async_trait]
impl ResultStore for S3ResultStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put_result(
        &self,
        key: &str,
        body: Vec<u8>,
        actual_cost: Money,
        run_id: &RunId,
    ) -> EngineResult<String> {
        let hash = sha256_hex(&body);
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type("application/json")
            .metadata(METADATA_ACTUAL_COST, actual_cost.micros().to_string())
            .metadata(METADATA_RUN_ID, run_id.to_hex())
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(EngineError::object_store)?;
        Ok(hash)
    }

    async fn head_result(&self, key: &str) -> EngineResult<Option<HeadResult>> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => {
                let empty = HashMap::new();
                let metadata = output.metadata().unwrap_or(&empty);
                Ok(Some(HeadResult::from_metadata(metadata)))
            }
            Err(err) => {
                let not_found = err
                    .as_service_error()
                    .map(|service| service.is_not_found())
                    .unwrap_or(false);
                if not_found {
                    Ok(None)
                } else {
                    Err(EngineError::object_store(err))
                }
            }
        }
    }

    async fn presign_get(&self, key: &str, ttl: Duration) -> EngineResult<String> {
        let config = PresigningConfig::expires_in(ttl).map_err(EngineError::object_store)?;
        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(config)
            .await
            .map_err(EngineError::object_store)?;
        Ok(presigned.uri().to_string())
    }
}
