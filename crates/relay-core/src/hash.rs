//! Canonical JSON serialization and SHA-256 hashing.
//!
//! `stable_hash_context` implements spec.md §4.2's `stableHashContext`:
//! recursively sort object keys, keep array order, serialize with no
//! insignificant whitespace, hash with SHA-256, return lowercase hex.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Recursively canonicalize a [`Value`]: object keys are sorted, arrays keep
/// their original order, scalars pass through unchanged.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), canonicalize(v)))
                .collect();
            let mut out = serde_json::Map::new();
            for (k, v) in sorted {
                out.insert(k, v);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Serialize `value` to its canonical minimal-JSON form: keys recursively
/// sorted, no insignificant whitespace.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let raw = serde_json::to_value(value)?;
    let canon = canonicalize(&raw);
    serde_json::to_string(&canon)
}

/// Compute the hex-encoded SHA-256 digest of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Compute `stableHashContext(envelope)`: the canonical-JSON SHA-256 hash of
/// a context envelope, identical for any two structurally-equal envelopes
/// regardless of the original key order.
pub fn stable_hash_context<T: Serialize>(envelope: &T) -> Result<String, serde_json::Error> {
    let json = canonical_json(envelope)?;
    Ok(sha256_hex(json.as_bytes()))
}

/// Compute `decision_key = SHA-256(ask_type ‖ prompt ‖ context_hash ‖ policy_version)`
/// per spec.md §4.6.
#[must_use]
pub fn decision_key(ask_type: &str, prompt: &str, context_hash: &str, policy_version: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(ask_type.as_bytes());
    hasher.update(prompt.as_bytes());
    hasher.update(context_hash.as_bytes());
    hasher.update(policy_version.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hash_is_deterministic_under_key_reordering() {
        let a = json!({"b": 1, "a": 2, "c": {"y": 1, "x": 2}});
        let b = json!({"a": 2, "c": {"x": 2, "y": 1}, "b": 1});
        assert_eq!(
            stable_hash_context(&a).unwrap(),
            stable_hash_context(&b).unwrap()
        );
    }

    #[test]
    fn array_order_is_significant() {
        let a = json!({"items": [1, 2, 3]});
        let b = json!({"items": [3, 2, 1]});
        assert_ne!(
            stable_hash_context(&a).unwrap(),
            stable_hash_context(&b).unwrap()
        );
    }

    #[test]
    fn hash_is_lowercase_hex_sha256_length() {
        let h = stable_hash_context(&json!({"a": 1})).unwrap();
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn mutated_envelope_changes_hash() {
        let original = json!({"facts": {"x": 1}});
        let mutated = json!({"facts": {"x": 2}});
        assert_ne!(
            stable_hash_context(&original).unwrap(),
            stable_hash_context(&mutated).unwrap()
        );
    }

    #[test]
    fn decision_key_is_sensitive_to_every_component() {
        let base = decision_key("CLARIFICATION", "p", "h", "v1");
        assert_ne!(base, decision_key("RESOURCE_FETCH", "p", "h", "v1"));
        assert_ne!(base, decision_key("CLARIFICATION", "p2", "h", "v1"));
        assert_ne!(base, decision_key("CLARIFICATION", "p", "h2", "v1"));
        assert_ne!(base, decision_key("CLARIFICATION", "p", "h", "v2"));
    }

    #[test]
    fn canonical_json_has_no_insignificant_whitespace() {
        let s = canonical_json(&json!({"a": 1, "b": [1, 2]})).unwrap();
        assert!(!s.contains(' '));
    }

    proptest::proptest! {
        #[test]
        fn hash_ignores_key_shuffling(a in 0i64..1000, b in 0i64..1000) {
            let e1 = json!({"a": a, "b": b});
            let e2 = json!({"b": b, "a": a});
            proptest::prop_assert_eq!(
                stable_hash_context(&e1).unwrap(),
                stable_hash_context(&e2).unwrap()
            );
        }
    }
}
