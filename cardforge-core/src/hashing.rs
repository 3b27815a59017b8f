//! Hashing System - SHA-256 for Content Identity
//!
//! Content hashes drive change detection for sync. They must be stable
//! across runs and across field ordering.

use serde::Serialize;
use serde_json::{to_string, Value};
use sha2::{Digest, Sha256};

use crate::model::{CardContent, Category};

/// Compute SHA-256 hash of bytes, return hex string
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Convert to canonical JSON (sorted keys, no whitespace)
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let v: Value = serde_json::to_value(value)?;
    to_string(&sort_value(&v))
}

fn sort_value(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut sorted: Vec<_> = map.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(b.0));
            let sorted_map: serde_json::Map<String, Value> = sorted
                .into_iter()
                .map(|(k, v)| (k.clone(), sort_value(v)))
                .collect();
            Value::Object(sorted_map)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_value).collect()),
        _ => v.clone(),
    }
}

/// Content hash of a card.
///
/// content_hash = sha256(canonical {category, content, art_hash})
///
/// The art hash is folded in so a rebuild that only regenerates art still
/// marks the item dirty for sync.
pub fn compute_content_hash(
    category: &Category,
    content: &CardContent,
    art_hash: Option<&str>,
) -> Result<String, serde_json::Error> {
    let canonical = canonical_json(&serde_json::json!({
        "category": category,
        "content": content,
        "art": art_hash,
    }))?;
    Ok(sha256_hex(canonical.as_bytes()))
}
