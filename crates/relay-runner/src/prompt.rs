//! Layered prompt assembly (spec.md §4.6 step 3): four labeled sections —
//! Base, Role, Context, Task — concatenated with `\n---\n` separators into
//! one fully-resolved string, which is then fingerprinted into
//! `Attestation.prompt_fingerprint`.
//!
//! `AssembledPrompt.system` carries the Base section; `AssembledPrompt.user`
//! carries Role, Context, and Task joined by the same separator, so
//! `fingerprint()`'s `system ++ "\n---\n" ++ user` reproduces all four
//! sections in spec order without a second concatenation scheme to keep in
//! sync.

use crate::role::{render_user_prompt, Role};
use relay_core::{sha256_hex, Ask, ContextEnvelope};

/// A fully assembled prompt, ready to send to an [`crate::client::LlmClient`].
#[derive(Debug, Clone)]
pub struct AssembledPrompt {
    /// System-turn text: the Base section.
    pub system: String,
    /// User-turn text: Role, Context, and Task sections joined by `\n---\n`.
    pub user: String,
}

impl AssembledPrompt {
    /// `SHA-256(system ++ "\n---\n" ++ user)`, the value stored verbatim in
    /// `Attestation.prompt_fingerprint`.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        sha256_hex(format!("{}\n---\n{}", self.system, self.user).as_bytes())
    }
}

const BASE_SECTION: &str = "Base:\nReturn exactly one JSON object and nothing else, with optional fields \
answer_text (string), answer_json (object matching the role's output schema), and ask_back (object). \
Summarize aggressively. Do not emit any text outside the JSON object.";

/// Assemble the layered prompt for one Ask against its resolved role.
#[must_use]
pub fn assemble(
    role: &Role,
    envelope: &ContextEnvelope,
    ask: &Ask,
    timeout_s: u64,
    max_tokens: Option<u32>,
) -> AssembledPrompt {
    let sections = [
        role_section(role),
        context_section(ask, envelope, timeout_s, max_tokens),
        task_section(role, ask),
    ];
    AssembledPrompt {
        system: BASE_SECTION.to_string(),
        user: sections.join("\n---\n"),
    }
}

fn role_section(role: &Role) -> String {
    let mut s = format!("Role: {} v{}\n{}", role.id, role.version, role.system_prompt);
    if !role.purpose.is_empty() {
        s.push_str(&format!("\nPurpose: {}", role.purpose));
    }
    if let Some(schema) = &role.input_schema {
        s.push_str(&format!("\nInput schema: {schema}"));
    }
    if let Some(schema) = &role.output_schema {
        s.push_str(&format!("\nOutput schema: {schema}"));
    }
    if !role.allowed_tools.is_empty() {
        s.push_str(&format!("\nTool whitelist: {}", role.allowed_tools.join(", ")));
    }
    if let Some(max_tokens) = role.limits.max_tokens {
        s.push_str(&format!("\nLimits: max_tokens={max_tokens}"));
    }
    if !role.guardrails.is_empty() {
        s.push_str(&format!("\nGuardrails: {}", role.guardrails.join("; ")));
    }
    s
}

fn context_section(ask: &Ask, envelope: &ContextEnvelope, timeout_s: u64, max_tokens: Option<u32>) -> String {
    let ask_type = serde_json::to_value(ask.ask_type)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();
    let max_tokens_str = max_tokens.map_or_else(|| "none".to_string(), |t| t.to_string());
    let mut s = format!(
        "Context:\njobId: {}\nstepId: {}\naskType: {}\ntimeout: {}s\nmax tokens: {}",
        ask.job_id, ask.step_id, ask_type, timeout_s, max_tokens_str
    );
    let allowed_tools = ask.constraints.as_ref().map(|c| c.allowed_tools.as_slice()).unwrap_or(&[]);
    if !allowed_tools.is_empty() {
        s.push_str(&format!("\nAllowed tools: {}", allowed_tools.join(", ")));
    }
    if let Some(repo) = &envelope.job_snapshot.repo {
        s.push_str(&format!("\nRepository context: {repo}"));
    }
    if let Some(commit) = &envelope.job_snapshot.commit_sha {
        s.push_str(&format!("\nCommit: {commit}"));
    }
    if let Some(facts) = &envelope.facts {
        if !facts.is_empty() {
            if let Ok(json) = serde_json::to_string(facts) {
                s.push_str(&format!("\nKnown facts: {json}"));
            }
        }
    }
    if let Some(meta) = &ask.meta {
        if let Ok(json) = serde_json::to_string(meta) {
            s.push_str(&format!("\nMeta: {json}"));
        }
    }
    s
}

fn task_section(role: &Role, ask: &Ask) -> String {
    let mut s = format!("Task:\n{}", render_user_prompt(role, &ask.prompt));
    if let Some(overrides) = ask
        .meta
        .as_ref()
        .and_then(|meta| meta.get("prompt_overrides"))
        .and_then(|v| v.as_object())
    {
        if let Some(append) = overrides.get("system_append").and_then(|v| v.as_str()) {
            s.push_str(&format!("\n{append}"));
        }
        if let Some(schema) = overrides.get("output_schema") {
            s.push_str(&format!("\nOutput schema override: {schema}"));
        }
    }
    s.push_str("\nReturn JSON only.");
    s
}
