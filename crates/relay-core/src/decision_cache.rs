//! DecisionCacheEntry: memoized Answer Runner results keyed by `decision_key`
//! (spec.md §3, §4.6).

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default TTL applied to a cache entry after a successful cacheable
/// answer (spec.md §4.6, 24 hours).
pub const DEFAULT_TTL_SECONDS: u64 = 86_400;

/// A memoized Answer Runner result, keyed externally by
/// `decision_key = SHA-256(ask_type ‖ prompt ‖ context_hash ‖ policy_version)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DecisionCacheEntry {
    /// Structured answer, mirroring `Answer::answer_json`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer_json: Option<Value>,
    /// Free-text answer, mirroring `Answer::answer_text`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer_text: Option<String>,
    /// Policy trace captured at cache-write time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_trace: Option<Value>,
    /// Creation timestamp, ms since epoch.
    pub created_at: i64,
    /// Seconds this entry remains valid for.
    pub ttl_seconds: u64,
}

impl DecisionCacheEntry {
    /// `true` iff `created_at + ttl_seconds*1000 < now_ms` (spec.md §3).
    #[must_use]
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.created_at + (self.ttl_seconds as i64) * 1000 < now_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(created_at: i64, ttl_seconds: u64) -> DecisionCacheEntry {
        DecisionCacheEntry {
            answer_json: None,
            answer_text: Some("cached".to_string()),
            policy_trace: None,
            created_at,
            ttl_seconds,
        }
    }

    #[test]
    fn not_expired_before_ttl_elapses() {
        let e = entry(1_000, 60);
        assert!(!e.is_expired(1_000 + 59_000));
    }

    #[test]
    fn expired_after_ttl_elapses() {
        let e = entry(1_000, 60);
        assert!(e.is_expired(1_000 + 60_001));
    }

    #[test]
    fn default_ttl_is_one_day() {
        assert_eq!(DEFAULT_TTL_SECONDS, 86_400);
    }
}
