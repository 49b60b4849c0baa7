//! Context envelope canonical shape (spec.md §6 "Context envelope canonical
//! shape").

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Snapshot of the job the executor was operating on when it raised an Ask.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JobSnapshot {
    /// Repository reference, opaque to the core beyond round-tripping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<Value>,
    /// Commit the executor's working tree is at.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    /// Deployment/runtime profile label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_profile: Option<String>,
    /// Policy version in effect, echoed into the Answer's attestation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_version: Option<String>,
}

/// The structured snapshot that travels with every Ask and is hashed to
/// produce `context_hash` (spec.md GLOSSARY).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ContextEnvelope {
    /// Snapshot of job state at Ask time; absent on the wire (e.g. a bare
    /// `{"role":"default"}` envelope) deserializes to the default snapshot
    /// rather than rejecting the payload (spec.md §8 scenario 4).
    #[serde(default)]
    pub job_snapshot: JobSnapshot,
    /// Opaque facts relevant to the question (e.g. seeded from
    /// `TASK_RELAY_FACT_*` environment variables).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub facts: Option<BTreeMap<String, Value>>,
    /// Capabilities the executor's tools expose, if relevant to the Ask.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_caps: Option<Value>,
    /// Role identifier the envelope was built for.
    pub role: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_envelope_round_trips() {
        let env = ContextEnvelope {
            role: "default".to_string(),
            ..Default::default()
        };
        let json = serde_json::to_string(&env).unwrap();
        let back: ContextEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(env, back);
    }

    #[test]
    fn hash_is_stable_regardless_of_facts_key_order() {
        let mut facts_a = BTreeMap::new();
        facts_a.insert("b".to_string(), Value::from(2));
        facts_a.insert("a".to_string(), Value::from(1));

        let env = ContextEnvelope {
            role: "default".to_string(),
            facts: Some(facts_a),
            ..Default::default()
        };
        let h1 = crate::hash::stable_hash_context(&env).unwrap();
        let h2 = crate::hash::stable_hash_context(&env).unwrap();
        assert_eq!(h1, h2);
    }
}
