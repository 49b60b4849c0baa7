//! Answer Runner orchestration (spec.md §4.6 steps 1-8): the component that
//! turns an `AskCreated` event into a recorded `Answer`.
//!
//! Subscribes to the Event Bus for `AskCreated`, and for each Ask:
//! verifies the context envelope hash, checks the decision cache, resolves
//! a role, assembles a layered prompt, calls the configured
//! [`crate::client::LlmClient`] with schema-guarded retries, checks the
//! tool-use policy, attests the result, and records it back through
//! `relay_manager::JobManager::record_answer`.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use relay_core::{
    decision_key, stable_hash_context, AnswerPayload, Ask, AskStatus, Attestation, ContextEnvelope,
    DecisionCacheEntry, RelayEvent, DEFAULT_TTL_SECONDS,
};
use relay_error::{ErrorCode, RelayError, Result};
use relay_manager::JobManager;
use relay_policy::ToolPolicy;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

use crate::client::{LlmClient, LlmRequest};
use crate::prompt::{self, AssembledPrompt};
use crate::role::{Role, RoleStore};

/// Tuning knobs for an [`AnswerRunner`].
#[derive(Debug, Clone)]
pub struct AnswerRunnerConfig {
    /// Policy version stamped into `Attestation.policy_version` when the
    /// context envelope's own `job_snapshot.policy_version` is unset.
    pub policy_version: String,
    /// Used when an Ask carries no `constraints.timeout_s`.
    pub default_timeout_ms: u64,
    /// Model used when a role declares none.
    pub default_model: String,
}

impl Default for AnswerRunnerConfig {
    fn default() -> Self {
        Self {
            policy_version: "v1".to_string(),
            default_timeout_ms: 30_000,
            default_model: "gpt-4".to_string(),
        }
    }
}

/// Fallback token budget when neither the Ask nor its resolved role declares
/// one (spec.md §4.6 step 4).
const DEFAULT_MAX_TOKENS: u32 = 4096;

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// The Answer Runner (C6).
pub struct AnswerRunner {
    manager: Arc<JobManager>,
    roles: RoleStore,
    llm: Arc<dyn LlmClient>,
    config: AnswerRunnerConfig,
}

impl AnswerRunner {
    /// Build a runner over the given manager, role directory, and LLM client.
    #[must_use]
    pub fn new(manager: Arc<JobManager>, roles: RoleStore, llm: Arc<dyn LlmClient>, config: AnswerRunnerConfig) -> Self {
        Self { manager, roles, llm, config }
    }

    /// Subscribe to the Event Bus and answer every `AskCreated` event as it
    /// arrives, each on its own task so one slow LLM call never blocks
    /// another Ask.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut sub = self.manager.bus().subscribe();
            loop {
                match sub.recv().await {
                    Some(RelayEvent::AskCreated { ask }) => {
                        let this = Arc::clone(&self);
                        tokio::spawn(async move { this.handle(&ask).await });
                    }
                    Some(_) => continue,
                    None => {
                        warn!("event bus closed; answer runner loop exiting");
                        return;
                    }
                }
            }
        })
    }

    async fn handle(&self, ask: &Ask) {
        let payload = match self.answer(ask).await {
            Ok(payload) => payload,
            Err(e) => {
                error!(ask_id = %ask.ask_id, error = %e, "answer runner failed unexpectedly");
                error_payload(ask, e.code, &e.message)
            }
        };
        if let Err(e) = self.manager.record_answer(payload).await {
            error!(ask_id = %ask.ask_id, error = %e, "failed to record answer");
        }
    }

    /// Run the full answer pipeline for one Ask, always returning an
    /// `Ok(AnswerPayload)` — failures are encoded as a rejected/error
    /// payload rather than propagated, since every Ask must be resolved one
    /// way or another.
    pub async fn answer(&self, ask: &Ask) -> Result<AnswerPayload> {
        let recomputed = stable_hash_context(&ask.context_envelope).map_err(|e| {
            RelayError::new(ErrorCode::InternalError, "failed to hash context envelope").with_source(e)
        })?;
        if recomputed != ask.context_hash {
            return Ok(error_payload(ask, ErrorCode::EContextMismatch, "recomputed context hash does not match the ask's declared hash"));
        }

        let envelope: ContextEnvelope = match serde_json::from_value(ask.context_envelope.clone()) {
            Ok(e) => e,
            Err(e) => {
                return Ok(error_payload(
                    ask,
                    ErrorCode::ENoContextEnvelope,
                    &format!("context envelope did not parse: {e}"),
                ))
            }
        };

        let policy_version = envelope
            .job_snapshot
            .policy_version
            .clone()
            .unwrap_or_else(|| self.config.policy_version.clone());
        let ask_type_str = serde_json::to_value(ask.ask_type)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        let cache_key = decision_key(&ask_type_str, &ask.prompt, &ask.context_hash, &policy_version);

        if let Some(cached) = self.manager.store().decision_cache_get(&cache_key, now_ms()).await? {
            info!(ask_id = %ask.ask_id, "decision cache hit");
            return Ok(cached_answer_payload(ask, cached));
        }

        let role_id = ask.role_id.clone().unwrap_or_else(|| ask.ask_type.default_role_id().to_string());
        let role = match self.roles.get(&role_id).await {
            Ok(role) => role,
            Err(e) => return Ok(error_payload(ask, e.code, &e.message)),
        };

        let tool_policy = ToolPolicy::new(&role.allowed_tools, ask.constraints.as_ref());
        let timeout_ms = ask
            .constraints
            .as_ref()
            .and_then(|c| c.timeout_s)
            .map(|s| s.saturating_mul(1000))
            .unwrap_or(self.config.default_timeout_ms);
        let model = role.model.clone().unwrap_or_else(|| self.config.default_model.clone());
        let max_tokens = Some(
            ask.constraints
                .as_ref()
                .and_then(|c| c.max_tokens)
                .or(role.limits.max_tokens)
                .unwrap_or(DEFAULT_MAX_TOKENS),
        );
        let assembled = prompt::assemble(&role, &envelope, ask, timeout_ms / 1000, max_tokens);

        let call = match self
            .call_with_retry(&role, &assembled, &model, max_tokens, timeout_ms)
            .await
        {
            Ok(result) => result,
            Err(e) => return Ok(error_payload(ask, e.code, &e.message)),
        };

        if let Err(e) = tool_policy.check_tools_used(&call.tools_used) {
            return Ok(error_payload(ask, e.code, &e.message));
        }

        let attestation = Attestation {
            context_hash: ask.context_hash.clone(),
            role_id: role.id.clone(),
            role_version: role.version.clone(),
            model,
            prompt_fingerprint: assembled.fingerprint(),
            tools_used: call.tools_used.clone(),
            policy_version: Some(policy_version),
        };

        if !call.downgraded {
            self.manager
                .store()
                .decision_cache_upsert(
                    &cache_key,
                    DecisionCacheEntry {
                        answer_json: call.answer_json.clone(),
                        answer_text: call.answer_text.clone(),
                        policy_trace: None,
                        created_at: now_ms(),
                        ttl_seconds: DEFAULT_TTL_SECONDS,
                    },
                )
                .await?;
        }

        Ok(AnswerPayload {
            kind: "Answer".to_string(),
            ask_id: ask.ask_id.as_str().to_string(),
            job_id: ask.job_id.as_str().to_string(),
            step_id: ask.step_id.clone(),
            status: AskStatus::Answered,
            answer_text: call.answer_text,
            answer_json: call.answer_json,
            attestation: Some(attestation),
            artifacts: None,
            policy_trace: None,
            cacheable: Some(!call.downgraded),
            ask_back: call.ask_back,
            error: None,
        })
    }

    /// LLM call with exponential backoff (`2^attempt` seconds), retrying on
    /// transient call failure or schema-validation failure up to
    /// `role.max_retries` times. On final schema-validation failure the Ask
    /// is still answered — downgraded to the raw LLM text with
    /// `cacheable=false` per spec.md §4.6 step 6, rather than erroring out.
    async fn call_with_retry(
        &self,
        role: &Role,
        assembled: &AssembledPrompt,
        model: &str,
        max_tokens: Option<u32>,
        timeout_ms: u64,
    ) -> Result<CallResult> {
        let mut attempt = 0u32;
        loop {
            let request = LlmRequest {
                system: assembled.system.clone(),
                user: assembled.user.clone(),
                model: model.to_string(),
                max_tokens,
                response_schema: role.output_schema.clone(),
            };
            match self.llm.complete(request, timeout_ms).await {
                Ok(response) => {
                    let parsed = extract_response_fields(&response.text);
                    match &role.output_schema {
                        None => {
                            return Ok(CallResult {
                                answer_text: parsed.answer_text.or(Some(response.text)),
                                answer_json: parsed.answer_json,
                                ask_back: parsed.ask_back,
                                tools_used: response.tools_used,
                                downgraded: false,
                            })
                        }
                        Some(schema) => match validate_answer_json(parsed.answer_json.as_ref(), schema) {
                            Ok(value) => {
                                return Ok(CallResult {
                                    answer_text: parsed.answer_text,
                                    answer_json: Some(value),
                                    ask_back: parsed.ask_back,
                                    tools_used: response.tools_used,
                                    downgraded: false,
                                })
                            }
                            Err(e) if attempt < role.max_retries => {
                                warn!(role = %role.id, attempt, error = %e, "llm output failed schema validation; retrying");
                                attempt += 1;
                                sleep(backoff(attempt)).await;
                                continue;
                            }
                            Err(e) => {
                                warn!(role = %role.id, error = %e, "llm output never passed schema validation; downgrading to raw text");
                                return Ok(CallResult {
                                    answer_text: Some(response.text),
                                    answer_json: None,
                                    ask_back: parsed.ask_back,
                                    tools_used: response.tools_used,
                                    downgraded: true,
                                });
                            }
                        },
                    }
                }
                Err(e) if attempt < role.max_retries && e.code != ErrorCode::Policy => {
                    warn!(role = %role.id, attempt, error = %e, "llm call failed; retrying");
                    attempt += 1;
                    sleep(backoff(attempt)).await;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

struct CallResult {
    answer_text: Option<String>,
    answer_json: Option<serde_json::Value>,
    ask_back: Option<serde_json::Value>,
    tools_used: Vec<String>,
    /// `true` iff this result is the schema-validation downgrade path
    /// (spec.md §4.6 step 6): raw text stands in for `answer_json`, and the
    /// caller must mark the answer non-cacheable.
    downgraded: bool,
}

/// The three optional fields lifted out of the LLM's outer JSON object
/// (spec.md §4.6 step 5).
struct ParsedResponse {
    answer_text: Option<String>,
    answer_json: Option<serde_json::Value>,
    ask_back: Option<serde_json::Value>,
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(attempt))
}

/// Locates the outermost `{...}` JSON object in `text` and lifts out
/// `answer_text`/`answer_json`/`ask_back`. If no balanced JSON object is
/// found, the whole response stands in as `answer_text` (spec.md §4.6
/// step 5).
fn extract_response_fields(text: &str) -> ParsedResponse {
    match locate_outer_json_object(text) {
        Some(obj) => ParsedResponse {
            answer_text: obj.get("answer_text").and_then(|v| v.as_str()).map(str::to_string),
            answer_json: obj.get("answer_json").cloned(),
            ask_back: obj.get("ask_back").cloned(),
        },
        None => ParsedResponse {
            answer_text: Some(text.to_string()),
            answer_json: None,
            ask_back: None,
        },
    }
}

/// Scans for the first balanced top-level `{...}` span and parses it,
/// tolerating surrounding prose the LLM may emit despite being told to
/// return JSON only.
fn locate_outer_json_object(text: &str) -> Option<serde_json::Value> {
    let start = text.find('{')?;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text.char_indices().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return serde_json::from_str(&text[start..=i]).ok();
                }
            }
            _ => {}
        }
    }
    None
}

fn validate_answer_json(answer_json: Option<&serde_json::Value>, schema: &serde_json::Value) -> Result<serde_json::Value> {
    let value = answer_json.ok_or_else(|| {
        RelayError::new(ErrorCode::BadArtifacts, "llm output carried no answer_json field")
    })?;
    let validator = jsonschema::validator_for(schema).map_err(|e| {
        RelayError::new(ErrorCode::InternalError, "role output_schema is not a valid JSON Schema").with_source(e)
    })?;
    let errors: Vec<String> = validator.iter_errors(value).map(|e| e.to_string()).collect();
    if errors.is_empty() {
        Ok(value.clone())
    } else {
        Err(RelayError::new(
            ErrorCode::BadArtifacts,
            format!("llm output failed role output_schema: {}", errors.join("; ")),
        ))
    }
}

fn error_payload(ask: &Ask, code: ErrorCode, message: &str) -> AnswerPayload {
    let status = match code {
        ErrorCode::Policy | ErrorCode::ECapsViolation => AskStatus::Rejected,
        ErrorCode::Timeout => AskStatus::Timeout,
        _ => AskStatus::Error,
    };
    AnswerPayload {
        kind: "Answer".to_string(),
        ask_id: ask.ask_id.as_str().to_string(),
        job_id: ask.job_id.as_str().to_string(),
        step_id: ask.step_id.clone(),
        status,
        answer_text: None,
        answer_json: None,
        attestation: None,
        artifacts: None,
        policy_trace: None,
        cacheable: Some(false),
        ask_back: None,
        error: Some(format!("{code}: {message}")),
    }
}

fn cached_answer_payload(ask: &Ask, cached: DecisionCacheEntry) -> AnswerPayload {
    AnswerPayload {
        kind: "Answer".to_string(),
        ask_id: ask.ask_id.as_str().to_string(),
        job_id: ask.job_id.as_str().to_string(),
        step_id: ask.step_id.clone(),
        status: AskStatus::Answered,
        answer_text: cached.answer_text,
        answer_json: cached.answer_json,
        attestation: None,
        artifacts: None,
        policy_trace: cached.policy_trace,
        cacheable: Some(true),
        ask_back: None,
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use relay_bus::EventBus;
    use relay_core::{AskId, AskType, JobId};
    use relay_storage::MemoryStore;
    use std::sync::Mutex;

    struct StubLlm {
        responses: Mutex<Vec<Result<crate::client::LlmResponse>>>,
    }

    #[async_trait]
    impl LlmClient for StubLlm {
        async fn complete(&self, _request: LlmRequest, _timeout_ms: u64) -> Result<crate::client::LlmResponse> {
            self.responses.lock().unwrap().remove(0)
        }
    }

    fn clarifier_role() -> Role {
        Role {
            id: "role.clarifier".to_string(),
            version: "1".to_string(),
            purpose: "Resolve ambiguous instructions.".to_string(),
            model: None,
            system_prompt: "Be concise.".to_string(),
            user_prompt_template: "{prompt}".to_string(),
            allowed_tools: vec![],
            input_schema: None,
            output_schema: None,
            max_retries: 1,
            limits: crate::role::RoleLimits::default(),
            guardrails: vec![],
        }
    }

    fn sample_ask() -> Ask {
        let envelope = serde_json::json!({
            "job_snapshot": {},
            "role": "role.clarifier",
        });
        let context_hash = stable_hash_context(&envelope).unwrap();
        Ask {
            ask_id: AskId::new("ask_1"),
            job_id: JobId::new("job_1"),
            step_id: "s1".to_string(),
            ask_type: AskType::Clarification,
            prompt: "which branch?".to_string(),
            context_envelope: envelope,
            context_hash,
            constraints: None,
            role_id: None,
            meta: None,
            created_at: 0,
            status: AskStatus::Pending,
        }
    }

    async fn runner_with(roles_dir: &std::path::Path, responses: Vec<Result<crate::client::LlmResponse>>) -> AnswerRunner {
        runner_with_role(roles_dir, clarifier_role(), responses).await
    }

    async fn runner_with_role(
        roles_dir: &std::path::Path,
        role: Role,
        responses: Vec<Result<crate::client::LlmResponse>>,
    ) -> AnswerRunner {
        let manager = Arc::new(JobManager::new(Arc::new(MemoryStore::new()), Arc::new(EventBus::new())));
        let role_yaml = serde_yaml::to_string(&role).unwrap();
        tokio::fs::write(roles_dir.join(format!("{}.yaml", role.id)), role_yaml).await.unwrap();
        let llm = Arc::new(StubLlm { responses: Mutex::new(responses) });
        AnswerRunner::new(manager, RoleStore::new(roles_dir), llm, AnswerRunnerConfig::default())
    }

    #[tokio::test]
    async fn context_mismatch_is_rejected_without_calling_the_llm() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner_with(dir.path(), vec![]).await;
        let mut ask = sample_ask();
        ask.context_hash = "wrong".to_string();
        let payload = runner.answer(&ask).await.unwrap();
        assert_eq!(payload.status, AskStatus::Error);
        assert!(payload.error.unwrap().starts_with("E_CONTEXT_MISMATCH"));
    }

    #[tokio::test]
    async fn successful_answer_carries_attestation() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner_with(
            dir.path(),
            vec![Ok(crate::client::LlmResponse {
                text: "take main".to_string(),
                tools_used: vec![],
            })],
        )
        .await;
        let payload = runner.answer(&sample_ask()).await.unwrap();
        assert_eq!(payload.status, AskStatus::Answered);
        assert_eq!(payload.answer_text.as_deref(), Some("take main"));
        assert!(payload.attestation.is_some());
    }

    #[tokio::test]
    async fn tool_outside_whitelist_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner_with(
            dir.path(),
            vec![Ok(crate::client::LlmResponse {
                text: "done".to_string(),
                tools_used: vec!["exec.shell".to_string()],
            })],
        )
        .await;
        let mut ask = sample_ask();
        ask.constraints = Some(relay_core::AskConstraints {
            timeout_s: None,
            max_tokens: None,
            allowed_tools: vec!["fs.read".to_string()],
        });
        let payload = runner.answer(&ask).await.unwrap();
        assert_eq!(payload.status, AskStatus::Rejected);
    }

    #[tokio::test]
    async fn exhausted_schema_retries_downgrade_to_answered_with_raw_text() {
        let dir = tempfile::tempdir().unwrap();
        let mut role = clarifier_role();
        role.output_schema = Some(serde_json::json!({
            "type": "object",
            "required": ["decision"],
        }));
        role.max_retries = 1;
        // Every attempt returns plain non-JSON text, so schema validation
        // never passes; two attempts (initial + one retry) are consumed.
        let runner = runner_with_role(
            dir.path(),
            role,
            vec![
                Ok(crate::client::LlmResponse {
                    text: "not json".to_string(),
                    tools_used: vec![],
                }),
                Ok(crate::client::LlmResponse {
                    text: "still not json".to_string(),
                    tools_used: vec![],
                }),
            ],
        )
        .await;
        let payload = runner.answer(&sample_ask()).await.unwrap();
        assert_eq!(payload.status, AskStatus::Answered);
        assert_eq!(payload.answer_text.as_deref(), Some("still not json"));
        assert!(payload.answer_json.is_none());
        assert_eq!(payload.cacheable, Some(false));
        assert!(payload.attestation.is_some());
    }

    #[tokio::test]
    async fn tool_outside_roles_own_whitelist_is_rejected_even_with_no_ask_constraint() {
        let dir = tempfile::tempdir().unwrap();
        let mut role = clarifier_role();
        role.allowed_tools = vec!["fs.read".to_string()];
        let runner = runner_with_role(
            dir.path(),
            role,
            vec![Ok(crate::client::LlmResponse {
                text: "done".to_string(),
                tools_used: vec!["exec.shell".to_string()],
            })],
        )
        .await;
        // sample_ask() carries no constraints at all; the role's own
        // whitelist must still gate the tool.
        let payload = runner.answer(&sample_ask()).await.unwrap();
        assert_eq!(payload.status, AskStatus::Rejected);
    }
}
