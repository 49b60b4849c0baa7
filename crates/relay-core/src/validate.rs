//! Schema validation boundary for external payloads (spec.md §4.2).
//!
//! Every external payload (JobSpec, AskPayload, AnswerPayload) is validated
//! against a JSON Schema before persisting. This module derives schemas via
//! [`schemars`] and compiles/evaluates them via [`jsonschema`], resolving
//! spec.md §9's open question in favor of full conformance checking rather
//! than a shape-only check.

use crate::ask::AskPayload;
use crate::answer::AnswerPayload;
use crate::job::JobSpec;
use relay_error::{ErrorCode, RelayError};
use schemars::{JsonSchema, schema_for};
use serde::Serialize;

fn validate_against_schema<T: Serialize + JsonSchema>(value: &T, label: &str) -> Result<(), RelayError> {
    let schema = schema_for!(T);
    let schema_value = serde_json::to_value(&schema).map_err(|e| {
        RelayError::new(ErrorCode::InternalError, format!("schema serialization failed for {label}"))
            .with_source(e)
    })?;
    let instance = serde_json::to_value(value).map_err(|e| {
        RelayError::new(ErrorCode::ValidationFailed, format!("{label} is not representable as JSON"))
            .with_source(e)
    })?;
    let compiled = jsonschema::validator_for(&schema_value).map_err(|e| {
        RelayError::new(ErrorCode::InternalError, format!("invalid schema for {label}"))
            .with_source(e)
    })?;
    let errors: Vec<String> = compiled
        .iter_errors(&instance)
        .map(|e| e.to_string())
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(RelayError::new(
            ErrorCode::ValidationFailed,
            format!("{label} failed schema validation: {}", errors.join("; ")),
        ))
    }
}

/// Validate a [`JobSpec`] before `createJob`.
pub fn validate_job_spec(spec: &JobSpec) -> Result<(), RelayError> {
    validate_against_schema(spec, "JobSpec")
}

/// Validate an [`AskPayload`] before `createAsk`.
pub fn validate_ask_payload(payload: &AskPayload) -> Result<(), RelayError> {
    if payload.kind != "Ask" {
        return Err(RelayError::new(
            ErrorCode::ValidationFailed,
            format!("AskPayload.type must be \"Ask\", got {:?}", payload.kind),
        ));
    }
    validate_against_schema(payload, "AskPayload")
}

/// Validate an [`AnswerPayload`] before `recordAnswer`.
pub fn validate_answer_payload(payload: &AnswerPayload) -> Result<(), RelayError> {
    if payload.kind != "Answer" {
        return Err(RelayError::new(
            ErrorCode::ValidationFailed,
            format!("AnswerPayload.type must be \"Answer\", got {:?}", payload.kind),
        ));
    }
    validate_against_schema(payload, "AnswerPayload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ask::AskType;
    use crate::job::{ExecutionSpec, Priority, RepoRef, ScopeSpec, TaskSpec};
    use crate::ids::CommitHash;

    fn sample_spec() -> JobSpec {
        JobSpec {
            repo: RepoRef {
                repo_type: "git".to_string(),
                url: Some("https://example.invalid/repo.git".to_string()),
                path: None,
                base_branch: "main".to_string(),
                baseline_commit: CommitHash::new("deadbeef"),
            },
            task: TaskSpec {
                title: "t".to_string(),
                description: "d".to_string(),
                acceptance: vec![],
            },
            scope: ScopeSpec::default(),
            context: None,
            execution: ExecutionSpec {
                preferred_model: "gpt-4".to_string(),
                sandbox: "read-only".to_string(),
                ask_policy: "untrusted".to_string(),
                timeout_s: None,
                priority: Priority::P1,
                ttl_s: 3600,
            },
            idempotency_key: "k1".to_string(),
            notify: None,
        }
    }

    #[test]
    fn valid_job_spec_passes() {
        assert!(validate_job_spec(&sample_spec()).is_ok());
    }

    #[test]
    fn ask_payload_rejects_wrong_type_tag() {
        let payload = AskPayload {
            kind: "NotAnAsk".to_string(),
            ask_id: None,
            job_id: "job_1".to_string(),
            step_id: "s1".to_string(),
            ask_type: AskType::Clarification,
            prompt: "p".to_string(),
            context_hash: "h".to_string(),
            context_envelope: serde_json::json!({}),
            constraints: None,
            role_id: None,
            meta: None,
        };
        let err = validate_ask_payload(&payload).unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationFailed);
    }

    #[test]
    fn answer_payload_rejects_wrong_type_tag() {
        let payload = AnswerPayload {
            kind: "Wrong".to_string(),
            ask_id: "ask_1".to_string(),
            job_id: "job_1".to_string(),
            step_id: "s1".to_string(),
            status: crate::ask::AskStatus::Answered,
            answer_text: None,
            answer_json: None,
            attestation: None,
            artifacts: None,
            policy_trace: None,
            cacheable: None,
            ask_back: None,
            error: None,
        };
        let err = validate_answer_payload(&payload).unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationFailed);
    }
}
