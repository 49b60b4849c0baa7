//! Answer: one-to-one response to an Ask (spec.md §3, §4.6).

use crate::ask::AskStatus;
use crate::ids::AskId;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Attestation attached to every `ANSWERED` result (spec.md GLOSSARY).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Attestation {
    /// Must equal the originating Ask's `context_hash`.
    pub context_hash: String,
    /// Role that produced this answer.
    pub role_id: String,
    /// Version of that role definition.
    pub role_version: String,
    /// LLM identifier used for the call.
    pub model: String,
    /// `SHA-256(prompt)` of the fully assembled layered prompt.
    pub prompt_fingerprint: String,
    /// Tools the answer referenced, checked against the Ask's whitelist.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools_used: Vec<String>,
    /// Policy version carried in the context envelope's `job_snapshot`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_version: Option<String>,
}

/// Answer record, one-to-one with its Ask (spec.md §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Answer {
    /// Primary key, shared with the Ask it answers.
    pub ask_id: AskId,
    /// Outcome of answering.
    pub status: AskStatus,
    /// Free-text answer, present when the runner had no structured schema
    /// to fill or fell back to raw text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer_text: Option<String>,
    /// Structured answer payload, validated against the role's output schema.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer_json: Option<Value>,
    /// Present on every `ANSWERED` result unless context verification
    /// short-circuited before an LLM call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attestation: Option<Attestation>,
    /// Artifact references produced alongside the answer, if any.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Value>,
    /// Free-form trace of policy checks performed while answering.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_trace: Option<Value>,
    /// Whether this answer may be served from the decision cache for an
    /// identical future Ask. Defaults to `true`.
    #[serde(default = "default_cacheable")]
    pub cacheable: bool,
    /// Optional follow-up question the executor should consider; does not
    /// reopen the Ask (single-round, see SPEC_FULL.md).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ask_back: Option<Value>,
    /// Present when `status` is `REJECTED`, `TIMEOUT`, or `ERROR`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Creation timestamp, ms since epoch.
    pub created_at: i64,
}

fn default_cacheable() -> bool {
    true
}

/// Wire payload accepted by `POST /answers` (spec.md §6, verbatim wire shape).
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct AnswerPayload {
    /// Must be the literal string `"Answer"`.
    #[serde(rename = "type")]
    pub kind: String,
    pub ask_id: String,
    pub job_id: String,
    pub step_id: String,
    pub status: AskStatus,
    #[serde(default)]
    pub answer_text: Option<String>,
    #[serde(default)]
    pub answer_json: Option<Value>,
    #[serde(default)]
    pub attestation: Option<Attestation>,
    #[serde(default)]
    pub artifacts: Option<Vec<Value>>,
    #[serde(default)]
    pub policy_trace: Option<Value>,
    #[serde(default)]
    pub cacheable: Option<bool>,
    #[serde(default)]
    pub ask_back: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Answer {
    /// `true` iff this answer's attestation context hash matches the
    /// owning Ask's context hash (spec.md §8 "Attestation integrity").
    #[must_use]
    pub fn attestation_matches(&self, ask_context_hash: &str) -> bool {
        self.attestation
            .as_ref()
            .is_some_and(|a| a.context_hash == ask_context_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_attestation(hash: &str) -> Attestation {
        Attestation {
            context_hash: hash.to_string(),
            role_id: "role.clarifier".to_string(),
            role_version: "1".to_string(),
            model: "gpt-4".to_string(),
            prompt_fingerprint: "abc".to_string(),
            tools_used: vec![],
            policy_version: None,
        }
    }

    #[test]
    fn attestation_matches_detects_mismatch() {
        let answer = Answer {
            ask_id: AskId::new("ask_1"),
            status: AskStatus::Answered,
            answer_text: None,
            answer_json: None,
            attestation: Some(sample_attestation("hash_a")),
            artifacts: vec![],
            policy_trace: None,
            cacheable: true,
            ask_back: None,
            error: None,
            created_at: 0,
        };
        assert!(answer.attestation_matches("hash_a"));
        assert!(!answer.attestation_matches("hash_b"));
    }

    #[test]
    fn cacheable_defaults_to_true_on_deserialize() {
        let json = serde_json::json!({
            "askId": "ask_1",
            "status": "ANSWERED",
            "createdAt": 0,
        });
        let answer: Answer = serde_json::from_value(json).unwrap();
        assert!(answer.cacheable);
    }
}
