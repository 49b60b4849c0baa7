//! Tool and path capability enforcement (spec.md §4.6 step 6's "caps
//! violation" check, §4.4's scope enforcement).
//!
//! Two independent checks live here, both built on [`relay_glob`]'s
//! include/exclude matcher:
//!
//! - [`ToolPolicy`] — the Answer Runner consults this before honoring a
//!   `tools_used` entry in its attestation; a tool outside either the
//!   resolved role's own `allowed_tools` or the Ask's `allowed_tools`
//!   whitelist is rejected with [`relay_error::ErrorCode::ECapsViolation`].
//! - [`ScopePolicy`] — the Worker Pool consults this to keep an executor's
//!   reads/writes inside `JobSpec.scope`.
//!
//! Generalized from this codebase's flat `PolicyProfile`/`PolicyEngine`,
//! retargeted from a single global tool allow/deny list to the per-Ask
//! whitelist and per-job scope this scheduler's domain model carries.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use relay_core::AskConstraints;
use relay_core::job::ScopeSpec;
use relay_error::{ErrorCode, RelayError};
use relay_glob::{IncludeExcludeGlobs, MatchDecision};

/// Outcome of a policy check, carrying a human-readable reason either way —
/// mirrors this codebase's `Decision{allowed, reason}` shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// Whether the checked tool/path is permitted.
    pub allowed: bool,
    /// Why the decision came out this way.
    pub reason: String,
}

impl Decision {
    fn allow(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }

    /// Convert a denied decision into an [`ErrorCode::ECapsViolation`]
    /// [`RelayError`]; panics if called on an allowed decision (programmer
    /// error — callers should check `allowed` first).
    #[must_use]
    pub fn into_caps_violation(self, tool: &str) -> RelayError {
        debug_assert!(!self.allowed, "into_caps_violation called on an allow decision");
        RelayError::new(
            ErrorCode::ECapsViolation,
            format!("tool {tool:?} is outside the ask's allowed_tools whitelist"),
        )
        .with_context("reason", self.reason)
    }
}

/// Whitelist-based tool capability check for a single Ask (spec.md §7
/// `E_CAPS_VIOLATION`).
///
/// Combines two independent whitelist layers — the role's own
/// `allowed_tools` and the Ask's `constraints.allowed_tools` — a tool must
/// clear both to be used. `None`/absent on either layer means that layer
/// placed no restriction; a present, empty list means no tool use is
/// permitted at all under that layer.
pub struct ToolPolicy {
    role_tools: Option<Vec<String>>,
    ask_tools: Option<Vec<String>>,
}

impl ToolPolicy {
    /// Build a tool policy from an Ask's optional constraints alone, with no
    /// role-level restriction.
    #[must_use]
    pub fn from_constraints(constraints: Option<&AskConstraints>) -> Self {
        Self {
            role_tools: None,
            ask_tools: constraints.map(|c| c.allowed_tools.clone()),
        }
    }

    /// Build a tool policy combining a role's `allowed_tools` (empty means
    /// the role declared no tools usable) with an Ask's own constraints.
    #[must_use]
    pub fn new(role_allowed_tools: &[String], constraints: Option<&AskConstraints>) -> Self {
        Self {
            role_tools: if role_allowed_tools.is_empty() {
                None
            } else {
                Some(role_allowed_tools.to_vec())
            },
            ask_tools: constraints.map(|c| c.allowed_tools.clone()),
        }
    }

    /// Check whether `tool` may be referenced by the Answer Runner.
    #[must_use]
    pub fn can_use_tool(&self, tool: &str) -> Decision {
        if let Some(decision) = Self::check_layer(&self.role_tools, tool, "role's allowed_tools") {
            if !decision.allowed {
                return decision;
            }
        }
        match Self::check_layer(&self.ask_tools, tool, "ask's allowed_tools whitelist") {
            Some(decision) => decision,
            None => Decision::allow("no tool constraint applies"),
        }
    }

    fn check_layer(layer: &Option<Vec<String>>, tool: &str, label: &str) -> Option<Decision> {
        match layer {
            None => None,
            Some(list) if list.is_empty() => Some(Decision::deny(format!("{label} is empty"))),
            Some(list) if list.iter().any(|t| t == tool) => {
                Some(Decision::allow(format!("{tool} is in the {label}")))
            }
            Some(_) => Some(Decision::deny(format!("{tool} is not in the {label}"))),
        }
    }

    /// Check every tool the runner's answer claims to have used, returning
    /// the first violation if any.
    pub fn check_tools_used(&self, tools_used: &[String]) -> Result<(), RelayError> {
        for tool in tools_used {
            let decision = self.can_use_tool(tool);
            if !decision.allowed {
                return Err(decision.into_caps_violation(tool));
            }
        }
        Ok(())
    }
}

/// Read/write path sandboxing for one job's `ScopeSpec` (spec.md §3, §4.4).
pub struct ScopePolicy {
    read: IncludeExcludeGlobs,
    write: IncludeExcludeGlobs,
    disallow_reformatting: bool,
}

impl ScopePolicy {
    /// Compile a `ScopeSpec` into reusable matchers.
    pub fn new(scope: &ScopeSpec) -> Result<Self, RelayError> {
        let read = IncludeExcludeGlobs::new(&scope.read_paths, &[]).map_err(|e| {
            RelayError::new(ErrorCode::Policy, "invalid readPaths glob in job scope").with_source(
                std::io::Error::other(e.to_string()),
            )
        })?;
        let write_include = scope.file_globs.clone().unwrap_or_default();
        let write = IncludeExcludeGlobs::new(&write_include, &[]).map_err(|e| {
            RelayError::new(ErrorCode::Policy, "invalid fileGlobs glob in job scope").with_source(
                std::io::Error::other(e.to_string()),
            )
        })?;
        Ok(Self {
            read,
            write,
            disallow_reformatting: scope.disallow_reformatting,
        })
    }

    /// Check whether `path` is inside the job's declared read scope.
    #[must_use]
    pub fn can_read_path(&self, path: &str) -> Decision {
        match self.read.decide_str(path) {
            MatchDecision::Allowed => Decision::allow("path is within readPaths"),
            MatchDecision::DeniedByExclude => Decision::deny("path is explicitly excluded"),
            MatchDecision::DeniedByMissingInclude => {
                Decision::deny("path is outside the declared readPaths")
            }
        }
    }

    /// Check whether `path` is a file the executor may touch, per the
    /// job's optional `fileGlobs` restriction.
    #[must_use]
    pub fn can_write_path(&self, path: &str) -> Decision {
        match self.write.decide_str(path) {
            MatchDecision::Allowed => Decision::allow("path matches the declared fileGlobs"),
            MatchDecision::DeniedByExclude => Decision::deny("path is explicitly excluded"),
            MatchDecision::DeniedByMissingInclude => {
                Decision::deny("path does not match the declared fileGlobs")
            }
        }
    }

    /// Whether wholesale reformatting of untouched files is disallowed.
    #[must_use]
    pub fn disallow_reformatting(&self) -> bool {
        self.disallow_reformatting
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constraints(tools: &[&str]) -> AskConstraints {
        AskConstraints {
            timeout_s: None,
            max_tokens: None,
            allowed_tools: tools.iter().map(|t| t.to_string()).collect(),
        }
    }

    #[test]
    fn no_constraints_means_unrestricted() {
        let policy = ToolPolicy::from_constraints(None);
        assert!(policy.can_use_tool("fs.read").allowed);
    }

    #[test]
    fn empty_whitelist_denies_everything() {
        let c = constraints(&[]);
        let policy = ToolPolicy::from_constraints(Some(&c));
        assert!(!policy.can_use_tool("fs.read").allowed);
    }

    #[test]
    fn tool_in_whitelist_is_allowed() {
        let c = constraints(&["fs.read", "web.search"]);
        let policy = ToolPolicy::from_constraints(Some(&c));
        assert!(policy.can_use_tool("fs.read").allowed);
        assert!(!policy.can_use_tool("fs.write").allowed);
    }

    #[test]
    fn role_layer_restricts_independently_of_ask_layer() {
        let role_tools = vec!["fs.read".to_string(), "web.search".to_string()];
        let policy = ToolPolicy::new(&role_tools, None);
        assert!(policy.can_use_tool("fs.read").allowed);
        assert!(!policy.can_use_tool("exec.shell").allowed);
    }

    #[test]
    fn a_tool_must_clear_both_role_and_ask_layers() {
        let role_tools = vec!["fs.read".to_string(), "web.search".to_string()];
        let c = constraints(&["web.search"]);
        let policy = ToolPolicy::new(&role_tools, Some(&c));
        // allowed by the role, but not by the tighter ask constraint
        assert!(!policy.can_use_tool("fs.read").allowed);
        // allowed by both
        assert!(policy.can_use_tool("web.search").allowed);
    }

    #[test]
    fn empty_role_allowed_tools_means_no_role_level_restriction() {
        let policy = ToolPolicy::new(&[], None);
        assert!(policy.can_use_tool("anything").allowed);
    }

    #[test]
    fn check_tools_used_reports_first_violation() {
        let c = constraints(&["fs.read"]);
        let policy = ToolPolicy::from_constraints(Some(&c));
        let err = policy
            .check_tools_used(&["fs.read".to_string(), "exec.shell".to_string()])
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ECapsViolation);
    }

    fn scope(read_paths: &[&str], file_globs: Option<&[&str]>) -> ScopeSpec {
        ScopeSpec {
            read_paths: read_paths.iter().map(|s| s.to_string()).collect(),
            file_globs: file_globs.map(|g| g.iter().map(|s| s.to_string()).collect()),
            disallow_reformatting: false,
        }
    }

    #[test]
    fn unrestricted_scope_allows_any_read() {
        let policy = ScopePolicy::new(&scope(&[], None)).unwrap();
        assert!(policy.can_read_path("src/lib.rs").allowed);
    }

    #[test]
    fn read_paths_gate_reads() {
        let policy = ScopePolicy::new(&scope(&["src/**"], None)).unwrap();
        assert!(policy.can_read_path("src/lib.rs").allowed);
        assert!(!policy.can_read_path("secrets/key.pem").allowed);
    }

    #[test]
    fn file_globs_gate_writes_when_present() {
        let policy = ScopePolicy::new(&scope(&[], Some(&["src/**/*.rs"]))).unwrap();
        assert!(policy.can_write_path("src/lib.rs").allowed);
        assert!(!policy.can_write_path("Cargo.toml").allowed);
    }

    #[test]
    fn no_file_globs_allows_any_write() {
        let policy = ScopePolicy::new(&scope(&[], None)).unwrap();
        assert!(policy.can_write_path("anything.rs").allowed);
    }
}
