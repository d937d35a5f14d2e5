//! Opaque bearer-token lookup. Tokens are stored as SHA-256 hashes; the
//! plaintext exists only in the request. Anything beyond lookup (issuance,
//! rotation, scopes) lives outside the engine.

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::Row;

use tollgate_common::fingerprint::sha256_hex;
use tollgate_common::TenantId;

use crate::error::{EngineError, EngineResult};

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Resolve a bearer token to its tenant, or `AuthInvalid`.
    async fn authenticate(&self, bearer_token: &str) -> EngineResult<TenantId>;
}

pub struct PgAuthenticator {
    pool: PgPool,
}

impl PgAuthenticator {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Authenticator for PgAuthenticator {
    async fn authenticate(&self, bearer_token: &str) -> EngineResult<TenantId> {
        if bearer_token.is_empty() {
            return Err(EngineError::AuthInvalid);
        }
        let token_hash = sha256_hex(bearer_token.as_bytes());
        let row = sqlx::query("SELECT tenant_id FROM tenants WHERE token_hash = $1")
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(TenantId(row.try_get("tenant_id")?)),
            None => Err(EngineError::AuthInvalid),
        }
    }
}
