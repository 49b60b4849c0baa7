//! Role definitions: the YAML-configured personas the Answer Runner picks
//! among by `AskType::default_role_id`/`Ask.role_id` (spec.md §4.6 step 2).

use relay_error::{ErrorCode, RelayError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// A loaded role definition.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Role {
    /// Stable identifier, e.g. `"role.clarifier"`.
    pub id: String,
    /// Version string echoed into `Attestation.role_version`.
    pub version: String,
    /// One-line description of what this role is for, shown verbatim in the
    /// Role prompt section (spec.md §4.6 step 3).
    #[serde(default)]
    pub purpose: String,
    /// LLM identifier this role prefers, overridable by `JobSpec.execution.preferred_model`.
    #[serde(default)]
    pub model: Option<String>,
    /// The role's fixed system prompt layer.
    pub system_prompt: String,
    /// Template for the user-turn layer; `{prompt}` is replaced with the
    /// Ask's own prompt text.
    #[serde(default = "default_user_template")]
    pub user_prompt_template: String,
    /// Tools this role may reference in its answer, independent of any
    /// tighter per-Ask `AskConstraints.allowed_tools` whitelist.
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    /// Optional JSON Schema the Ask's input is expected to satisfy, quoted
    /// verbatim into the Role prompt section.
    #[serde(default)]
    pub input_schema: Option<serde_json::Value>,
    /// Optional JSON Schema the answer's structured output must satisfy.
    #[serde(default)]
    pub output_schema: Option<serde_json::Value>,
    /// Maximum LLM-call retries on a transient or schema-validation failure.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Resource limits this role operates under.
    #[serde(default)]
    pub limits: RoleLimits,
    /// Free-text behavioral guardrails quoted verbatim into the Role prompt
    /// section (e.g. "never fabricate a file path").
    #[serde(default)]
    pub guardrails: Vec<String>,
}

/// A role's declared resource limits (spec.md §4.6 step 2).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RoleLimits {
    /// Fallback token budget used when the Ask itself declares none
    /// (spec.md §4.6 step 4: `constraints.max_tokens ?? role.limits.max_tokens ?? 4096`).
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

fn default_user_template() -> String {
    "{prompt}".to_string()
}

fn default_max_retries() -> u32 {
    2
}

/// Loads [`Role`] definitions from a directory of `<role_id>.yaml` files,
/// caching them in memory after first read.
pub struct RoleStore {
    dir: PathBuf,
    cache: tokio::sync::RwLock<HashMap<String, Role>>,
}

impl RoleStore {
    /// Point a store at a directory of role YAML files.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: tokio::sync::RwLock::new(HashMap::new()),
        }
    }

    /// Resolve a role by id, reading `<dir>/<role_id>.yaml` on first use.
    pub async fn get(&self, role_id: &str) -> Result<Role> {
        if let Some(role) = self.cache.read().await.get(role_id) {
            return Ok(role.clone());
        }
        let role = self.load_from_disk(role_id).await?;
        self.cache.write().await.insert(role_id.to_string(), role.clone());
        Ok(role)
    }

    async fn load_from_disk(&self, role_id: &str) -> Result<Role> {
        let path = self.path_for(role_id);
        let contents = tokio::fs::read_to_string(&path).await.map_err(|e| {
            RelayError::new(ErrorCode::RoleNotFound, format!("role {role_id:?} not found at {path:?}"))
                .with_source(e)
        })?;
        parse_role(&contents).map_err(|e| {
            RelayError::new(ErrorCode::RoleNotFound, format!("role {role_id:?} failed to parse")).with_source(e)
        })
    }

    fn path_for(&self, role_id: &str) -> PathBuf {
        self.dir.join(format!("{role_id}.yaml"))
    }
}

fn parse_role(yaml: &str) -> std::result::Result<Role, serde_yaml::Error> {
    serde_yaml::from_str(yaml)
}

/// Render a role's user-turn template against an Ask's prompt text.
#[must_use]
pub fn render_user_prompt(role: &Role, ask_prompt: &str) -> String {
    role.user_prompt_template.replace("{prompt}", ask_prompt)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLARIFIER_YAML: &str = r#"
id: role.clarifier
version: "1"
system_prompt: "You resolve ambiguous instructions concisely."
user_prompt_template: "Clarify: {prompt}"
allowed_tools: []
max_retries: 3
"#;

    #[test]
    fn parses_minimal_role() {
        let role = parse_role(CLARIFIER_YAML).unwrap();
        assert_eq!(role.id, "role.clarifier");
        assert_eq!(role.max_retries, 3);
        assert!(role.output_schema.is_none());
    }

    #[test]
    fn render_user_prompt_substitutes_placeholder() {
        let role = parse_role(CLARIFIER_YAML).unwrap();
        assert_eq!(render_user_prompt(&role, "what now?"), "Clarify: what now?");
    }

    #[tokio::test]
    async fn role_store_caches_after_first_read() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("role.clarifier.yaml"), CLARIFIER_YAML)
            .await
            .unwrap();
        let store = RoleStore::new(dir.path());
        let first = store.get("role.clarifier").await.unwrap();
        tokio::fs::remove_file(dir.path().join("role.clarifier.yaml")).await.unwrap();
        let second = store.get("role.clarifier").await.unwrap();
        assert_eq!(first.version, second.version);
    }

    #[tokio::test]
    async fn missing_role_file_is_role_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = RoleStore::new(dir.path());
        let err = store.get("role.nonexistent").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::RoleNotFound);
    }
}
