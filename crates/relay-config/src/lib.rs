//! Configuration loading, validation, and env/flag precedence for the
//! task-relay scheduler (spec.md §6).
//!
//! Precedence is **flags > env > config-dir files > built-in defaults**.
//! [`RelayConfig::load`] applies them in that order: start from
//! [`RelayConfig::default`], overlay an optional TOML file found under
//! `--config-dir`, overlay `TASK_RELAY_*` environment variables, then
//! overlay [`CliOverrides`] collected from parsed CLI flags.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Errors / warnings
// ---------------------------------------------------------------------------

/// Hard failures that abort startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file named by `--config-dir` could not be read.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },
    /// The file did not parse as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },
    /// One or more semantic validation checks failed.
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

/// Advisory issues that do not prevent startup but deserve attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// The Answer Runner is enabled but no LLM API key env var is set.
    MissingApiKey {
        /// Name of the expected environment variable.
        env_var: String,
    },
    /// A timeout value is unusually large.
    LargeTimeout {
        /// Field name.
        field: String,
        /// Value in milliseconds.
        ms: u64,
    },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingApiKey { env_var } => {
                write!(f, "answer runner enabled but {env_var} is not set")
            }
            Self::LargeTimeout { field, ms } => {
                write!(f, "'{field}' has an unusually large timeout ({ms}ms)")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Enumerations mirroring the CLI flags
// ---------------------------------------------------------------------------

/// `--profile {dev|staging|prod}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    /// Local development.
    Dev,
    /// Staging deployment.
    Staging,
    /// Production deployment.
    Prod,
}

/// `--storage {memory|sqlite}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Shared-cache in-memory store; lost on process exit.
    Memory,
    /// `rusqlite` WAL-journaled file at `--sqlite <path>`.
    Sqlite,
}

/// `--transport stdio` (the only control-surface transport spec.md names).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// MCP over stdio.
    Stdio,
}

// ---------------------------------------------------------------------------
// Component sub-configs
// ---------------------------------------------------------------------------

/// Worker Pool tuning (spec.md §4.4, §5 "Lease discipline").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkerConfig {
    /// `maxConcurrency`: number of cooperative workers.
    pub max_concurrency: u32,
    /// Lease TTL, default 60 000 ms.
    pub lease_ttl_ms: u64,
    /// Heartbeat renewal interval, default 15 000 ms.
    pub heartbeat_interval_ms: u64,
    /// Sleep between failed lease-acquire attempts.
    pub poll_interval_ms: u64,
    /// Default per-job timeout when `execution.timeoutS` is absent.
    pub default_job_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            lease_ttl_ms: 60_000,
            heartbeat_interval_ms: 15_000,
            poll_interval_ms: 1_000,
            default_job_timeout_ms: 300_000,
        }
    }
}

/// Ask/Answer HTTP Bridge tuning (spec.md §4.5).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    /// Listener port, default 3415.
    pub port: u16,
    /// Ceiling clamping the requested `wait=Ns` long-poll duration.
    pub long_poll_timeout_ms: u64,
    /// SSE heartbeat cadence per client.
    pub sse_heartbeat_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            port: 3415,
            long_poll_timeout_ms: 30_000,
            sse_heartbeat_ms: 15_000,
        }
    }
}

/// Answer Runner tuning (spec.md §4.6).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RunnerConfig {
    /// Whether the runner subscribes to `ask.created` at all.
    pub enabled: bool,
    /// Base URL of the LLM vendor's chat-completion endpoint.
    pub llm_base_url: String,
    /// Model identifier passed to the LLM client.
    pub llm_model: String,
    /// Name of the environment variable holding the API key
    /// (spec.md §6: "`ANTHROPIC_API_KEY` (or equivalent)").
    pub llm_api_key_env: String,
    /// Default max tokens when neither the Ask nor the role specifies one.
    pub default_max_tokens: u32,
    /// Default per-call timeout in seconds.
    pub default_timeout_s: u64,
    /// Schema-validation / LLM-call retry ceiling (§4.6 step 6).
    pub max_retries: u32,
    /// Decision cache TTL applied to new entries, default 86 400s.
    pub decision_cache_ttl_s: u64,
    /// Directory role YAML definitions are loaded from.
    pub roles_dir: PathBuf,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            llm_base_url: "https://api.anthropic.com/v1/messages".to_string(),
            llm_model: "claude-3-5-sonnet-latest".to_string(),
            llm_api_key_env: "ANTHROPIC_API_KEY".to_string(),
            default_max_tokens: 4096,
            default_timeout_s: 60,
            max_retries: 3,
            decision_cache_ttl_s: relay_core::DEFAULT_TTL_SECONDS,
            roles_dir: PathBuf::from("roles"),
        }
    }
}

// ---------------------------------------------------------------------------
// RelayConfig
// ---------------------------------------------------------------------------

/// Top-level runtime configuration for `relay-cli serve`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RelayConfig {
    /// Deployment profile.
    pub profile: Profile,
    /// Directory searched for a `config.toml` overlay.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_dir: Option<PathBuf>,
    /// Storage Kernel backend.
    pub storage: StorageBackend,
    /// Path to the sqlite file, required when `storage == Sqlite`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sqlite_path: Option<PathBuf>,
    /// MCP control-surface transport.
    pub transport: Transport,
    /// Worker Pool tuning.
    pub worker: WorkerConfig,
    /// HTTP Bridge tuning.
    pub bridge: BridgeConfig,
    /// Answer Runner tuning.
    pub runner: RunnerConfig,
    /// Root directory artifacts are written under (`artifactRoot/{jobId}/{kind}`).
    pub artifact_root: PathBuf,
    /// Command invoked by the default `SubprocessBackend`, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executor_cmd: Option<String>,
    /// `TASK_RELAY_FACT_*` environment variables, collected for the
    /// executor-side context envelope's `facts` field.
    #[serde(default)]
    pub facts: BTreeMap<String, String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            profile: Profile::Dev,
            config_dir: None,
            storage: StorageBackend::Memory,
            sqlite_path: None,
            transport: Transport::Stdio,
            worker: WorkerConfig::default(),
            bridge: BridgeConfig::default(),
            runner: RunnerConfig::default(),
            artifact_root: PathBuf::from("artifacts"),
            executor_cmd: None,
            facts: BTreeMap::new(),
        }
    }
}

/// CLI-flag overlay, the highest-precedence layer. Every field mirrors a
/// flag named in spec.md §6; `None` means "flag not passed".
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    /// `--profile`.
    pub profile: Option<Profile>,
    /// `--config-dir`.
    pub config_dir: Option<PathBuf>,
    /// `--storage`.
    pub storage: Option<StorageBackend>,
    /// `--sqlite`.
    pub sqlite_path: Option<PathBuf>,
    /// `--transport`.
    pub transport: Option<Transport>,
}

impl RelayConfig {
    /// Load configuration following spec.md §6's precedence:
    /// flags > env > config-dir files > built-in defaults.
    pub fn load(
        cli: &CliOverrides,
    ) -> Result<(Self, Vec<ConfigWarning>), ConfigError> {
        let mut config = Self::default();

        // `--config-dir` must itself be resolved before we can look inside
        // it for a file, so CLI overrides the directory lookup ahead of the
        // env/file layers below, but the *file contents* still sit beneath
        // env and flags in priority.
        let config_dir = cli.config_dir.clone().or_else(|| {
            std::env::var("TASK_RELAY_CONFIG_DIR").ok().map(PathBuf::from)
        });

        if let Some(ref dir) = config_dir {
            let candidate = dir.join("config.toml");
            if candidate.is_file() {
                let content =
                    std::fs::read_to_string(&candidate).map_err(|_| ConfigError::FileNotFound {
                        path: candidate.display().to_string(),
                    })?;
                config = parse_toml(&content)?;
            }
            config.config_dir = Some(dir.clone());
        }

        apply_env_overrides(&mut config);
        apply_cli_overrides(&mut config, cli);

        let warnings = validate_config(&config)?;
        Ok((config, warnings))
    }

    /// The `TASK_RELAY_FACT_*` facts collected at load time, ready to seed
    /// a context envelope's `facts` field.
    #[must_use]
    pub fn executor_facts(&self) -> BTreeMap<String, String> {
        self.facts.clone()
    }
}

/// Parse a TOML string into a [`RelayConfig`] overlaid on defaults.
pub fn parse_toml(content: &str) -> Result<RelayConfig, ConfigError> {
    #[derive(Deserialize, Default)]
    #[serde(rename_all = "camelCase")]
    struct PartialConfig {
        profile: Option<Profile>,
        storage: Option<StorageBackend>,
        sqlite_path: Option<PathBuf>,
        transport: Option<Transport>,
        worker: Option<WorkerConfig>,
        bridge: Option<BridgeConfig>,
        runner: Option<PartialRunnerConfig>,
        artifact_root: Option<PathBuf>,
        executor_cmd: Option<String>,
    }

    #[derive(Deserialize, Default)]
    #[serde(rename_all = "camelCase")]
    struct PartialRunnerConfig {
        enabled: Option<bool>,
        llm_base_url: Option<String>,
        llm_model: Option<String>,
        llm_api_key_env: Option<String>,
        default_max_tokens: Option<u32>,
        default_timeout_s: Option<u64>,
        max_retries: Option<u32>,
        decision_cache_ttl_s: Option<u64>,
        roles_dir: Option<PathBuf>,
    }

    let partial: PartialConfig = toml::from_str(content).map_err(|e| ConfigError::ParseError {
        reason: e.to_string(),
    })?;

    let mut config = RelayConfig::default();
    if let Some(v) = partial.profile {
        config.profile = v;
    }
    if let Some(v) = partial.storage {
        config.storage = v;
    }
    if let Some(v) = partial.sqlite_path {
        config.sqlite_path = Some(v);
    }
    if let Some(v) = partial.transport {
        config.transport = v;
    }
    if let Some(v) = partial.worker {
        config.worker = v;
    }
    if let Some(v) = partial.bridge {
        config.bridge = v;
    }
    if let Some(r) = partial.runner {
        if let Some(v) = r.enabled {
            config.runner.enabled = v;
        }
        if let Some(v) = r.llm_base_url {
            config.runner.llm_base_url = v;
        }
        if let Some(v) = r.llm_model {
            config.runner.llm_model = v;
        }
        if let Some(v) = r.llm_api_key_env {
            config.runner.llm_api_key_env = v;
        }
        if let Some(v) = r.default_max_tokens {
            config.runner.default_max_tokens = v;
        }
        if let Some(v) = r.default_timeout_s {
            config.runner.default_timeout_s = v;
        }
        if let Some(v) = r.max_retries {
            config.runner.max_retries = v;
        }
        if let Some(v) = r.decision_cache_ttl_s {
            config.runner.decision_cache_ttl_s = v;
        }
        if let Some(v) = r.roles_dir {
            config.runner.roles_dir = v;
        }
    }
    if let Some(v) = partial.artifact_root {
        config.artifact_root = v;
    }
    if let Some(v) = partial.executor_cmd {
        config.executor_cmd = Some(v);
    }
    Ok(config)
}

/// Apply `TASK_RELAY_*` environment variable overrides (spec.md §6).
pub fn apply_env_overrides(config: &mut RelayConfig) {
    if let Ok(val) = std::env::var("TASK_RELAY_PROFILE") {
        if let Some(p) = parse_profile(&val) {
            config.profile = p;
        }
    }
    if let Ok(val) = std::env::var("TASK_RELAY_STORAGE") {
        if let Some(s) = parse_storage(&val) {
            config.storage = s;
        }
    }
    if let Ok(val) = std::env::var("TASK_RELAY_SQLITE") {
        config.sqlite_path = Some(PathBuf::from(val));
    }
    if let Ok(val) = std::env::var("TASK_RELAY_TRANSPORT") {
        if val.eq_ignore_ascii_case("stdio") {
            config.transport = Transport::Stdio;
        }
    }
    if let Ok(val) = std::env::var("TASK_RELAY_ARTIFACT_ROOT") {
        config.artifact_root = PathBuf::from(val);
    }
    if let Ok(val) = std::env::var("TASK_RELAY_EXECUTOR_CMD") {
        config.executor_cmd = Some(val);
    }
    if let Ok(Ok(n)) = std::env::var("TASK_RELAY_MAX_CONCURRENCY").map(|v| v.parse()) {
        config.worker.max_concurrency = n;
    }
    if let Ok(Ok(n)) = std::env::var("TASK_RELAY_LEASE_TTL_MS").map(|v| v.parse()) {
        config.worker.lease_ttl_ms = n;
    }
    if let Ok(Ok(n)) = std::env::var("TASK_RELAY_HEARTBEAT_INTERVAL_MS").map(|v| v.parse()) {
        config.worker.heartbeat_interval_ms = n;
    }
    if let Ok(Ok(n)) = std::env::var("TASK_RELAY_BRIDGE_PORT").map(|v| v.parse()) {
        config.bridge.port = n;
    }
    if let Ok(val) = std::env::var("TASK_RELAY_RUNNER_ENABLED") {
        config.runner.enabled = val.eq_ignore_ascii_case("true") || val == "1";
    }
    if let Ok(val) = std::env::var("TASK_RELAY_LLM_BASE_URL") {
        config.runner.llm_base_url = val;
    }
    if let Ok(val) = std::env::var("TASK_RELAY_LLM_MODEL") {
        config.runner.llm_model = val;
    }
    if let Ok(val) = std::env::var("TASK_RELAY_LLM_API_KEY_ENV") {
        config.runner.llm_api_key_env = val;
    }

    // `TASK_RELAY_FACT_*` → facts["FOO"] = "bar" from `TASK_RELAY_FACT_FOO`.
    for (key, value) in std::env::vars() {
        if let Some(fact_name) = key.strip_prefix("TASK_RELAY_FACT_") {
            config.facts.insert(fact_name.to_string(), value);
        }
    }
}

fn apply_cli_overrides(config: &mut RelayConfig, cli: &CliOverrides) {
    if let Some(v) = cli.profile {
        config.profile = v;
    }
    if let Some(ref v) = cli.config_dir {
        config.config_dir = Some(v.clone());
    }
    if let Some(v) = cli.storage {
        config.storage = v;
    }
    if let Some(ref v) = cli.sqlite_path {
        config.sqlite_path = Some(v.clone());
    }
    if let Some(v) = cli.transport {
        config.transport = v;
    }
}

fn parse_profile(s: &str) -> Option<Profile> {
    match s.to_ascii_lowercase().as_str() {
        "dev" => Some(Profile::Dev),
        "staging" => Some(Profile::Staging),
        "prod" => Some(Profile::Prod),
        _ => None,
    }
}

fn parse_storage(s: &str) -> Option<StorageBackend> {
    match s.to_ascii_lowercase().as_str() {
        "memory" => Some(StorageBackend::Memory),
        "sqlite" => Some(StorageBackend::Sqlite),
        _ => None,
    }
}

/// Validate a loaded configuration.
///
/// Hard errors (invalid combinations per spec.md §6's "Exit non-zero on
/// invalid combinations") are returned as [`ConfigError::ValidationError`];
/// soft issues come back as warnings.
pub fn validate_config(config: &RelayConfig) -> Result<Vec<ConfigWarning>, ConfigError> {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if config.storage == StorageBackend::Sqlite && config.sqlite_path.is_none() {
        errors.push("--storage sqlite requires --sqlite <path>".to_string());
    }

    if config.worker.max_concurrency == 0 {
        errors.push("worker.maxConcurrency must be at least 1".to_string());
    }

    if config.runner.enabled && std::env::var(&config.runner.llm_api_key_env).is_err() {
        warnings.push(ConfigWarning::MissingApiKey {
            env_var: config.runner.llm_api_key_env.clone(),
        });
    }

    if config.worker.lease_ttl_ms > 3_600_000 {
        warnings.push(ConfigWarning::LargeTimeout {
            field: "worker.leaseTtlMs".to_string(),
            ms: config.worker.lease_ttl_ms,
        });
    }

    if errors.is_empty() {
        Ok(warnings)
    } else {
        Err(ConfigError::ValidationError { reasons: errors })
    }
}

/// Load a [`RelayConfig`] from an explicit TOML file path, applying env
/// overrides on top. Convenience used by tests and by callers that already
/// know the concrete file (bypassing `--config-dir`'s directory-lookup
/// convention).
pub fn load_config_file(path: &Path) -> Result<RelayConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
        path: path.display().to_string(),
    })?;
    let mut config = parse_toml(&content)?;
    apply_env_overrides(&mut config);
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_memory_storage() {
        let config = RelayConfig::default();
        assert_eq!(config.storage, StorageBackend::Memory);
        assert_eq!(config.transport, Transport::Stdio);
    }

    #[test]
    fn sqlite_storage_without_path_is_a_hard_error() {
        let mut config = RelayConfig::default();
        config.storage = StorageBackend::Sqlite;
        let err = validate_config(&config).unwrap_err();
        match err {
            ConfigError::ValidationError { reasons } => {
                assert!(reasons.iter().any(|r| r.contains("--sqlite")));
            }
            other => panic!("expected ValidationError, got {other:?}"),
        }
    }

    #[test]
    fn zero_concurrency_is_a_hard_error() {
        let mut config = RelayConfig::default();
        config.worker.max_concurrency = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn cli_overrides_take_precedence_over_defaults() {
        let mut config = RelayConfig::default();
        let cli = CliOverrides {
            profile: Some(Profile::Prod),
            storage: Some(StorageBackend::Sqlite),
            sqlite_path: Some(PathBuf::from("/tmp/relay.db")),
            ..Default::default()
        };
        apply_cli_overrides(&mut config, &cli);
        assert_eq!(config.profile, Profile::Prod);
        assert_eq!(config.storage, StorageBackend::Sqlite);
        assert_eq!(config.sqlite_path, Some(PathBuf::from("/tmp/relay.db")));
    }

    #[test]
    fn parse_toml_overlay_leaves_unset_fields_at_default() {
        let toml = r#"
            profile = "staging"

            [worker]
            maxConcurrency = 8
            leaseTtlMs = 60000
            heartbeatIntervalMs = 15000
            pollIntervalMs = 1000
            defaultJobTimeoutMs = 300000
        "#;
        let config = parse_toml(toml).unwrap();
        assert_eq!(config.profile, Profile::Staging);
        assert_eq!(config.worker.max_concurrency, 8);
        assert_eq!(config.bridge.port, BridgeConfig::default().port);
    }

    #[test]
    fn fact_env_vars_are_collected_into_facts_map() {
        // SAFETY-equivalent: test-only env mutation, single-threaded test binary assumption
        // acknowledged via serial execution; no unsafe code is used.
        unsafe {
            std::env::set_var("TASK_RELAY_FACT_TEAM", "platform");
        }
        let mut config = RelayConfig::default();
        apply_env_overrides(&mut config);
        assert_eq!(config.facts.get("TEAM"), Some(&"platform".to_string()));
        unsafe {
            std::env::remove_var("TASK_RELAY_FACT_TEAM");
        }
    }

    #[test]
    fn invalid_profile_env_value_is_ignored() {
        unsafe {
            std::env::set_var("TASK_RELAY_PROFILE", "nonsense");
        }
        let mut config = RelayConfig::default();
        apply_env_overrides(&mut config);
        assert_eq!(config.profile, Profile::Dev);
        unsafe {
            std::env::remove_var("TASK_RELAY_PROFILE");
        }
    }
}
