use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use serde::{Deserialize, Serialize};

pub const RUN_ID_SIZE: usize = 16;

/// Unguessable run identifier: 128 bits of OS randomness, hex on the wire.
///
/// The stealth-404 policy leans on this being unenumerable, so it must never
/// be derived from anything predictable.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RunId([u8; RUN_ID_SIZE]);

impl RunId {
    pub fn generate() -> Self {
        let mut bytes = [0u8; RUN_ID_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        RunId(bytes)
    }

    pub const fn from_bytes(bytes: [u8; RUN_ID_SIZE]) -> Self {
        RunId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; RUN_ID_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RunId({})", self.to_hex())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Invalid run id")]
pub struct InvalidRunId;

impl FromStr for RunId {
    type Err = InvalidRunId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(s).map_err(|_| InvalidRunId)?;
        let bytes: [u8; RUN_ID_SIZE] = raw.try_into().map_err(|_| InvalidRunId)?;
        Ok(RunId(bytes))
    }
}

impl Serialize for RunId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for RunId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Tenant scope identifier. Opaque to the engine; assigned at provisioning.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub String);

impl TenantId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(value: &str) -> Self {
        TenantId(value.to_string())
    }
}

/// Fresh random token for leases, finalize claims and idempotency locks.
pub fn fresh_token() -> String {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
