//! Order-insensitive canonical JSON encoding.
//!
//! Every mapping is written with its keys sorted and every array with its members sorted by
//! their own canonical encoding. Two values that differ only in the order of object keys or
//! array members therefore encode to identical bytes, and so hash to the same version.

use alloy::primitives::keccak256;
use serde_json::Value;

/// Encodes `value` canonically.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

/// Hex-encoded keccak256 digest of the canonical encoding of `value`.
#[must_use]
pub fn content_digest(value: &Value) -> String {
    hex::encode(keccak256(canonical_json(value).as_bytes()))
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => {
            // Scalars have exactly one serde_json rendering.
            out.push_str(&value.to_string());
        }
        Value::Array(items) => {
            let mut members: Vec<String> = items.iter().map(canonical_json).collect();
            members.sort_unstable();
            out.push('[');
            out.push_str(&members.join(","));
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
    }
}
