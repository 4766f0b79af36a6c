//! Deterministic request hashing (the idempotency key).
//!
//! `request_hash = sha256(templateId(s) | outputFormat | sha256(canonical(data)))`
//! where `canonical` serializes the data tree compactly with recursively
//! sorted object keys. Two envelopes that differ only in JSON key order hash
//! identically; any change in templates, format, or data changes the hash.

use sha2::{Digest, Sha256};

use crate::envelope::GenerationRequest;

/// Serialize a JSON value canonically: compact, object keys sorted
/// recursively, arrays kept in order.
pub fn canonical_json(value: &serde_json::Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Keys and scalars reuse serde_json's escaping rules.
                out.push_str(&serde_json::Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

fn sha256_hex(input: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input);
    hex::encode(hasher.finalize())
}

/// Compute the idempotency hash for an envelope.
pub fn request_hash(request: &GenerationRequest) -> String {
    let data_digest = sha256_hex(canonical_json(&request.data).as_bytes());

    let mut material = String::new();
    for id in request.template_ids() {
        material.push_str(id.as_str());
        material.push('|');
    }
    material.push_str(request.output_format.as_str());
    material.push('|');
    material.push_str(&data_digest);

    sha256_hex(material.as_bytes())
}
