//! Ask: a question raised by a running job (spec.md §3, §4.6).

use crate::ids::{AskId, JobId};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// The kind of question an Ask raises, used to select a default role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AskType {
    /// Ambiguous instructions need disambiguation.
    Clarification,
    /// Executor needs a piece of external information.
    ResourceFetch,
    /// Executor needs a policy call (e.g. "is this dependency allowed?").
    PolicyDecision,
    /// Executor needs explicit sign-off before a risky action.
    Approval,
    /// Executor needs to pick among enumerated options.
    Choice,
}

/// Lifecycle status of an Ask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AskStatus {
    /// Awaiting an Answer.
    Pending,
    /// Answer recorded successfully.
    Answered,
    /// Runner or policy rejected the Ask.
    Rejected,
    /// No Answer arrived before the deadline.
    Timeout,
    /// Answering failed for some other reason.
    Error,
}

/// Per-Ask constraints on the Answer Runner's call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AskConstraints {
    /// Abort the LLM call after this many seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_s: Option<u64>,
    /// Cap on generated tokens.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Tools the runner is permitted to reference in its answer.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_tools: Vec<String>,
}

/// A structured question raised by a running job (spec.md §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Ask {
    /// UUID identifying this Ask.
    pub ask_id: AskId,
    /// Owning job.
    pub job_id: JobId,
    /// Executor-assigned step identifier; `(job_id, step_id)` is unique
    /// while the Ask is open.
    pub step_id: String,
    /// What kind of question this is.
    pub ask_type: AskType,
    /// The question text shown to the Answer Runner.
    pub prompt: String,
    /// The context envelope this Ask was raised against, stored verbatim.
    pub context_envelope: Value,
    /// `stableHashContext(context_envelope)`, lowercase hex SHA-256.
    pub context_hash: String,
    /// Optional per-Ask constraints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<AskConstraints>,
    /// Explicit role override; if set and the role is not found, the Ask
    /// fails with `ERROR` rather than falling back to a default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_id: Option<String>,
    /// Opaque extra metadata (e.g. `prompt_overrides`), passed through
    /// verbatim to the layered prompt builder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<BTreeMap<String, Value>>,
    /// Creation timestamp, ms since epoch.
    pub created_at: i64,
    /// Current status.
    pub status: AskStatus,
}

impl AskType {
    /// Default role id for this Ask type, per spec.md §4.6 step 2's table.
    #[must_use]
    pub fn default_role_id(self) -> &'static str {
        match self {
            Self::Clarification | Self::Choice => "role.clarifier",
            Self::ResourceFetch => "role.finder",
            Self::PolicyDecision | Self::Approval => "role.policy_decider",
        }
    }
}

/// Wire payload accepted by `POST /asks` (spec.md §6, verbatim wire shape).
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct AskPayload {
    /// Must be the literal string `"Ask"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Caller-chosen ask id; the server uses its own UUID if absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ask_id: Option<String>,
    pub job_id: String,
    pub step_id: String,
    pub ask_type: AskType,
    pub prompt: String,
    pub context_hash: String,
    pub context_envelope: Value,
    #[serde(default)]
    pub constraints: Option<AskConstraints>,
    #[serde(default)]
    pub role_id: Option<String>,
    #[serde(default)]
    pub meta: Option<BTreeMap<String, Value>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_role_table_matches_spec() {
        assert_eq!(AskType::Clarification.default_role_id(), "role.clarifier");
        assert_eq!(AskType::Choice.default_role_id(), "role.clarifier");
        assert_eq!(AskType::ResourceFetch.default_role_id(), "role.finder");
        assert_eq!(
            AskType::PolicyDecision.default_role_id(),
            "role.policy_decider"
        );
        assert_eq!(AskType::Approval.default_role_id(), "role.policy_decider");
    }

    #[test]
    fn ask_type_wire_format_is_screaming_snake() {
        let json = serde_json::to_string(&AskType::ResourceFetch).unwrap();
        assert_eq!(json, r#""RESOURCE_FETCH""#);
    }
}
