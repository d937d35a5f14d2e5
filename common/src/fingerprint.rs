//! Canonical-JSON payload fingerprints for the idempotency gate.
//!
//! Canonical form: object keys sorted recursively (byte order), compact
//! separators, serde_json's escaping and number rendering. The top-level
//! `meta` member is excluded before hashing so that trace hints and client
//! version strings cannot break retry collapsing.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Top-level members excluded from the fingerprint.
const INSIGNIFICANT_FIELDS: &[&str] = &["meta"];

/// Render a JSON value in canonical form.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // serde_json handles escaping; a String never fails to serialize.
                out.push_str(&serde_json::to_string(key).expect("string serialization"));
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => {
            out.push_str(&other.to_string());
        }
    }
}

/// SHA-256 (hex) of the canonical form of `body`, with insignificant
/// top-level members removed.
pub fn payload_fingerprint(body: &Value) -> String {
    let normalized = match body {
        Value::Object(map) => {
            let mut trimmed = map.clone();
            for field in INSIGNIFICANT_FIELDS {
                trimmed.remove(*field);
            }
            Value::Object(trimmed)
        }
        other => other.clone(),
    };

    let canonical = canonical_json(&normalized);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// SHA-256 (hex) of raw bytes; used for result artifact hashes and bearer
/// token lookups.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
