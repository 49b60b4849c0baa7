//! Unified error taxonomy with stable error codes for the task-relay scheduler.
//!
//! Every error carries an [`ErrorCode`] (a machine-readable, stable string
//! tag exposed verbatim over the HTTP bridge and MCP surface), a
//! human-readable message, an optional cause chain, and arbitrary key-value
//! context. Use the builder returned by [`RelayError::new`] to construct
//! errors fluently.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorCategory
// ---------------------------------------------------------------------------

/// Broad family that an [`ErrorCode`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Context envelope / ask-answer protocol violations.
    Protocol,
    /// Job state machine and lifecycle violations.
    Lifecycle,
    /// Executor backend or apply-check failures.
    Executor,
    /// Answer Runner failures (role, LLM call, schema).
    Runner,
    /// Policy / capability enforcement.
    Policy,
    /// Storage Kernel failures.
    Storage,
    /// Configuration load/validation failures.
    Config,
    /// Anything else.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Protocol => "protocol",
            Self::Lifecycle => "lifecycle",
            Self::Executor => "executor",
            Self::Runner => "runner",
            Self::Policy => "policy",
            Self::Storage => "storage",
            Self::Config => "config",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Stable, user-visible error codes.
///
/// The nine variants matching spec.md §7 are the codes that may appear in
/// `Answer.error` and HTTP error bodies; the remaining variants are internal
/// and surface only through `INTERNAL_ERROR` or component logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // -- Protocol (spec.md §7) --
    /// Context envelope hash does not equal the Ask's declared `context_hash`.
    EContextMismatch,
    /// Runner attempted a tool outside the Ask's `allowed_tools` whitelist.
    ECapsViolation,
    /// Ask is missing a required context envelope.
    ENoContextEnvelope,

    // -- Executor (spec.md §7) --
    /// Executor output did not parse into the three required sections.
    BadArtifacts,
    /// Generated diff failed the apply-check against baseline.
    Conflict,
    /// Executor backend exited non-zero or crashed.
    ExecutorError,

    // -- Shared (spec.md §7) --
    /// Runner or executor refused on policy grounds.
    Policy,
    /// Operation exceeded its configured time budget.
    Timeout,
    /// Anything not covered by a more specific code.
    InternalError,

    // -- Internal-only (not part of the externally-documented taxonomy) --
    /// A JobSpec, AskPayload, or AnswerPayload failed schema validation.
    ValidationFailed,
    /// `submit`/`createAsk`/`recordAnswer` violated the job state table.
    IllegalTransition,
    /// `acquireLease`/`renewLease` lost a race or found no eligible job.
    LeaseUnavailable,
    /// Storage Kernel transaction failed (I/O, constraint violation).
    StorageFailure,
    /// Configuration file or environment value failed validation.
    ConfigInvalid,
    /// Role definition file was requested but not found or malformed.
    RoleNotFound,
    /// MCP tool input failed to parse.
    McpInvalidInput,
    /// `updateJobState`/`getJob`-style lookup targeted a row that does not exist.
    JobNotFound,
}

impl ErrorCode {
    /// Returns the broad [`ErrorCategory`] this code belongs to.
    #[must_use]
    pub fn category(self) -> ErrorCategory {
        match self {
            Self::EContextMismatch | Self::ENoContextEnvelope => ErrorCategory::Protocol,
            Self::ECapsViolation => ErrorCategory::Policy,
            Self::BadArtifacts | Self::Conflict | Self::ExecutorError => ErrorCategory::Executor,
            Self::Policy => ErrorCategory::Policy,
            Self::Timeout => ErrorCategory::Lifecycle,
            Self::InternalError => ErrorCategory::Internal,
            Self::ValidationFailed | Self::IllegalTransition | Self::LeaseUnavailable => {
                ErrorCategory::Lifecycle
            }
            Self::StorageFailure => ErrorCategory::Storage,
            Self::ConfigInvalid => ErrorCategory::Config,
            Self::RoleNotFound => ErrorCategory::Runner,
            Self::McpInvalidInput => ErrorCategory::Protocol,
            Self::JobNotFound => ErrorCategory::Lifecycle,
        }
    }

    /// Stable `&'static str` representation, e.g. `"E_CONTEXT_MISMATCH"`.
    ///
    /// The nine spec-fixed codes keep their documented spelling (with the
    /// `E_` prefix on the two that have one); internal codes use plain
    /// `SCREAMING_SNAKE_CASE`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EContextMismatch => "E_CONTEXT_MISMATCH",
            Self::ECapsViolation => "E_CAPS_VIOLATION",
            Self::ENoContextEnvelope => "E_NO_CONTEXT_ENVELOPE",
            Self::BadArtifacts => "BAD_ARTIFACTS",
            Self::Conflict => "CONFLICT",
            Self::ExecutorError => "EXECUTOR_ERROR",
            Self::Policy => "POLICY",
            Self::Timeout => "TIMEOUT",
            Self::InternalError => "INTERNAL_ERROR",
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::IllegalTransition => "ILLEGAL_TRANSITION",
            Self::LeaseUnavailable => "LEASE_UNAVAILABLE",
            Self::StorageFailure => "STORAGE_FAILURE",
            Self::ConfigInvalid => "CONFIG_INVALID",
            Self::RoleNotFound => "ROLE_NOT_FOUND",
            Self::McpInvalidInput => "MCP_INVALID_INPUT",
            Self::JobNotFound => "JOB_NOT_FOUND",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// RelayError
// ---------------------------------------------------------------------------

/// Unified scheduler error.
///
/// Carries a stable [`ErrorCode`], a human-readable message, an optional
/// source error for cause-chaining, and arbitrary structured context.
///
/// # Examples
///
/// ```
/// use relay_error::{RelayError, ErrorCode};
///
/// let err = RelayError::new(ErrorCode::Timeout, "llm call exceeded budget")
///     .with_context("timeout_s", 30)
///     .with_context("ask_id", "abc123");
/// assert_eq!(err.code, ErrorCode::Timeout);
/// ```
pub struct RelayError {
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Arbitrary structured context for diagnostics.
    pub context: BTreeMap<String, serde_json::Value>,
}

impl RelayError {
    /// Create a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
        }
    }

    /// Attach a key-value pair to the diagnostic context.
    ///
    /// The value is converted via [`serde_json::to_value`]; if serialization
    /// fails, the entry is silently skipped.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying cause.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Shorthand for `self.code.category()`.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }

    /// Map this error onto the HTTP status code the Bridge (C5) should
    /// return, per spec.md §7's propagation policy.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self.code {
            ErrorCode::ValidationFailed
            | ErrorCode::IllegalTransition
            | ErrorCode::McpInvalidInput
            | ErrorCode::ENoContextEnvelope => 400,
            ErrorCode::RoleNotFound | ErrorCode::LeaseUnavailable | ErrorCode::JobNotFound => 404,
            _ => 500,
        }
    }
}

impl fmt::Debug for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("RelayError");
        d.field("code", &self.code);
        d.field("message", &self.message);
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        if !self.context.is_empty() {
            d.field("context", &self.context);
        }
        d.finish()
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)?;
        if !self.context.is_empty() {
            if let Ok(ctx) = serde_json::to_string(&self.context) {
                write!(f, " {ctx}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for RelayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Result alias used throughout the scheduler's component crates.
pub type Result<T> = std::result::Result<T, RelayError>;

// ---------------------------------------------------------------------------
// Serialization support (wire-facing error body)
// ---------------------------------------------------------------------------

/// Wire-serializable snapshot of a [`RelayError`] (without the opaque source).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelayErrorBody {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Structured context.
    pub context: BTreeMap<String, serde_json::Value>,
}

impl From<&RelayError> for RelayErrorBody {
    fn from(err: &RelayError) -> Self {
        Self {
            code: err.code,
            message: err.message.clone(),
            context: err.context.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::io;

    const SPEC_CODES: &[ErrorCode] = &[
        ErrorCode::EContextMismatch,
        ErrorCode::ECapsViolation,
        ErrorCode::ENoContextEnvelope,
        ErrorCode::BadArtifacts,
        ErrorCode::Conflict,
        ErrorCode::Policy,
        ErrorCode::ExecutorError,
        ErrorCode::Timeout,
        ErrorCode::InternalError,
    ];

    #[test]
    fn spec_codes_match_documented_strings() {
        assert_eq!(ErrorCode::EContextMismatch.as_str(), "E_CONTEXT_MISMATCH");
        assert_eq!(ErrorCode::ECapsViolation.as_str(), "E_CAPS_VIOLATION");
        assert_eq!(
            ErrorCode::ENoContextEnvelope.as_str(),
            "E_NO_CONTEXT_ENVELOPE"
        );
        assert_eq!(ErrorCode::BadArtifacts.as_str(), "BAD_ARTIFACTS");
        assert_eq!(ErrorCode::Conflict.as_str(), "CONFLICT");
        assert_eq!(ErrorCode::Policy.as_str(), "POLICY");
        assert_eq!(ErrorCode::ExecutorError.as_str(), "EXECUTOR_ERROR");
        assert_eq!(ErrorCode::Timeout.as_str(), "TIMEOUT");
        assert_eq!(ErrorCode::InternalError.as_str(), "INTERNAL_ERROR");
    }

    #[test]
    fn all_spec_codes_unique() {
        let mut seen = HashSet::new();
        for c in SPEC_CODES {
            assert!(seen.insert(c.as_str()));
        }
    }

    #[test]
    fn display_without_context() {
        let err = RelayError::new(ErrorCode::Conflict, "diff failed apply-check");
        assert_eq!(err.to_string(), "[CONFLICT] diff failed apply-check");
    }

    #[test]
    fn display_with_context() {
        let err = RelayError::new(ErrorCode::Timeout, "exceeded").with_context("timeout_s", 30);
        let s = err.to_string();
        assert!(s.starts_with("[TIMEOUT] exceeded"));
        assert!(s.contains("timeout_s"));
    }

    #[test]
    fn debug_with_source() {
        let src = io::Error::new(io::ErrorKind::NotFound, "file missing");
        let err =
            RelayError::new(ErrorCode::StorageFailure, "open failed").with_source(src);
        let dbg = format!("{err:?}");
        assert!(dbg.contains("StorageFailure"));
        assert!(dbg.contains("file missing"));
    }

    #[test]
    fn http_status_mapping() {
        assert_eq!(
            RelayError::new(ErrorCode::ValidationFailed, "x").http_status(),
            400
        );
        assert_eq!(
            RelayError::new(ErrorCode::RoleNotFound, "x").http_status(),
            404
        );
        assert_eq!(
            RelayError::new(ErrorCode::InternalError, "x").http_status(),
            500
        );
    }

    #[test]
    fn error_code_serde_roundtrip() {
        let json = serde_json::to_string(&ErrorCode::EContextMismatch).unwrap();
        assert_eq!(json, r#""E_CONTEXT_MISMATCH""#);
        let back: ErrorCode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ErrorCode::EContextMismatch);
    }

    #[test]
    fn body_roundtrip() {
        let err =
            RelayError::new(ErrorCode::BadArtifacts, "bad").with_context("kind", "out.md");
        let body: RelayErrorBody = (&err).into();
        let json = serde_json::to_string(&body).unwrap();
        let back: RelayErrorBody = serde_json::from_str(&json).unwrap();
        assert_eq!(body, back);
    }

    #[test]
    fn std_error_source_chain() {
        let inner = io::Error::new(io::ErrorKind::NotFound, "not found");
        let err = RelayError::new(ErrorCode::ExecutorError, "spawn failed").with_source(inner);
        let src = std::error::Error::source(&err).unwrap();
        assert_eq!(src.to_string(), "not found");
    }
}
