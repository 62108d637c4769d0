//! Configuration loading, validation, and management for Corvid.
//!
//! Loads configuration from `~/.corvid/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use corvid_core::agent::{AgentInfo, AgentMode, Permission, builtin_agents};
use corvid_core::provider::{ModelCost, ModelInfo, ModelLimit, ModelRef};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.corvid/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Default model as `provider/model`
    #[serde(default = "default_model")]
    pub model: String,

    /// Cheaper model for titles, as `provider/model`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub small_model: Option<String>,

    /// Agent used when a prompt names none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_agent: Option<String>,

    /// Provider-specific configurations
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,

    /// Agent definitions, merged over the built-in agents
    #[serde(default)]
    pub agents: BTreeMap<String, AgentConfig>,

    /// Named prompt templates for `command`
    #[serde(default)]
    pub commands: BTreeMap<String, CommandConfig>,

    /// Global tool switches (id or glob → enabled)
    #[serde(default)]
    pub tools: BTreeMap<String, bool>,

    /// Extra instruction files appended to the system prompt
    #[serde(default)]
    pub instructions: Vec<String>,

    #[serde(default)]
    pub compaction: CompactionConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub security: SecurityConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

fn default_model() -> String {
    "openai/gpt-4o".into()
}
fn default_true() -> bool {
    true
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Base URL of an OpenAI-compatible endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Environment variable holding the API key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    /// Model id used for side tasks such as titles
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub small_model: Option<String>,

    #[serde(default)]
    pub models: BTreeMap<String, ModelConfig>,
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_url", &self.api_url)
            .field("api_key", &redact(&self.api_key))
            .field("api_key_env", &self.api_key_env)
            .field("small_model", &self.small_model)
            .field("models", &self.models)
            .finish()
    }
}

impl ProviderConfig {
    /// The API key from config, else from the configured environment variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key.clone().or_else(|| {
            self.api_key_env
                .as_deref()
                .and_then(|var| std::env::var(var).ok())
                .filter(|v| !v.is_empty())
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Context window in tokens (0 = unknown)
    #[serde(default)]
    pub context: u64,

    /// Maximum output tokens (0 = unknown)
    #[serde(default)]
    pub output: u64,

    #[serde(default = "default_true")]
    pub tool_call: bool,

    #[serde(default)]
    pub reasoning: bool,

    #[serde(default = "default_true")]
    pub temperature: bool,

    #[serde(default)]
    pub cost: ModelCost,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            context: 0,
            output: 0,
            tool_call: true,
            reasoning: false,
            temperature: true,
            cost: ModelCost::default(),
        }
    }
}

impl ModelConfig {
    pub fn to_info(&self, provider_id: &str, model_id: &str) -> ModelInfo {
        ModelInfo {
            id: model_id.to_string(),
            provider_id: provider_id.to_string(),
            limit: ModelLimit {
                context: self.context,
                output: self.output,
            },
            cost: self.cost,
            tool_call: self.tool_call,
            reasoning: self.reasoning,
            temperature: self.temperature,
        }
    }
}

/// Overrides for one agent. Unset fields keep the built-in value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<AgentMode>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,

    /// `provider/model`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    #[serde(default)]
    pub tools: BTreeMap<String, bool>,

    #[serde(default)]
    pub permission: PermissionConfig,

    /// Remove a built-in agent
    #[serde(default)]
    pub disable: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermissionConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edit: Option<Permission>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bash: Option<BTreeMap<String, Permission>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webfetch: Option<Permission>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandConfig {
    pub template: String,

    #[serde(default)]
    pub description: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,

    /// `provider/model`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Turn off automatic summarization on context overflow
    #[serde(default)]
    pub disabled: bool,

    /// Clear old tool output after each turn
    #[serde(default = "default_true")]
    pub prune: bool,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            prune: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Ceiling for computed backoff when the provider gives no hint
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Overall time budget for retries of one step
    #[serde(default = "default_max_duration_secs")]
    pub max_duration_secs: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_initial_delay_ms() -> u64 {
    2_000
}
fn default_backoff_factor() -> f64 {
    2.0
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_max_duration_secs() -> u64 {
    600
}
fn default_max_attempts() -> u32 {
    5
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            backoff_factor: default_backoff_factor(),
            max_delay_ms: default_max_delay_ms(),
            max_duration_secs: default_max_duration_secs(),
            max_attempts: default_max_attempts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Generate a title from the first message
    #[serde(default = "default_true")]
    pub auto_title: bool,

    /// Safety limit on model steps per turn
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
}

fn default_max_steps() -> usize {
    1000
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_title: true,
            max_steps: default_max_steps(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Roots file tools may touch (empty = anywhere not forbidden)
    #[serde(default)]
    pub allowed_roots: Vec<String>,

    #[serde(default = "default_forbidden_paths")]
    pub forbidden_paths: Vec<String>,
}

fn default_forbidden_paths() -> Vec<String> {
    vec![
        "~/.ssh".into(),
        "~/.gnupg".into(),
        "~/.aws".into(),
        "/etc/shadow".into(),
    ]
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            allowed_roots: Vec::new(),
            forbidden_paths: default_forbidden_paths(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// "file" or "memory"
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

fn default_storage_backend() -> String {
    "file".into()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            path: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from the default location (`~/.corvid/config.toml`).
    ///
    /// Environment variables override file values.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_dir().join("config.toml");
        Self::load_from(&path)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
            toml::from_str::<Self>(&content).map_err(|e| ConfigError::ParseError {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?
        } else {
            tracing::info!("No config file found at {}, using defaults", path.display());
            Self::default()
        };

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(model) = std::env::var("CORVID_MODEL")
            && !model.is_empty()
        {
            self.model = model;
        }
        if let Ok(agent) = std::env::var("CORVID_AGENT")
            && !agent.is_empty()
        {
            self.default_agent = Some(agent);
        }
        if let Ok(flag) = std::env::var("CORVID_DISABLE_AUTOCOMPACT") {
            self.compaction.disabled = matches!(flag.as_str(), "1" | "true" | "yes");
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".corvid")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if ModelRef::parse(&self.model).is_none() {
            return Err(ConfigError::ValidationError(format!(
                "model '{}' must look like provider/model",
                self.model
            )));
        }
        if let Some(small) = &self.small_model
            && ModelRef::parse(small).is_none()
        {
            return Err(ConfigError::ValidationError(format!(
                "small_model '{small}' must look like provider/model"
            )));
        }

        for (name, agent) in &self.agents {
            if let Some(t) = agent.temperature
                && !(0.0..=2.0).contains(&t)
            {
                return Err(ConfigError::ValidationError(format!(
                    "agent '{name}': temperature must be between 0.0 and 2.0"
                )));
            }
            if let Some(model) = &agent.model
                && ModelRef::parse(model).is_none()
            {
                return Err(ConfigError::ValidationError(format!(
                    "agent '{name}': model '{model}' must look like provider/model"
                )));
            }
        }

        for (name, command) in &self.commands {
            if command.template.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "command '{name}' has an empty template"
                )));
            }
        }

        if self.retry.backoff_factor < 1.0 {
            return Err(ConfigError::ValidationError(
                "retry.backoff_factor must be >= 1.0".into(),
            ));
        }

        if !matches!(self.storage.backend.as_str(), "file" | "memory") {
            return Err(ConfigError::ValidationError(format!(
                "storage.backend must be 'file' or 'memory', got '{}'",
                self.storage.backend
            )));
        }

        Ok(())
    }

    /// The default model as a parsed reference.
    pub fn default_model(&self) -> Option<ModelRef> {
        ModelRef::parse(&self.model)
    }

    /// Built-in agents with configured overrides applied, plus configured agents.
    pub fn agents(&self) -> Vec<AgentInfo> {
        let mut agents: BTreeMap<String, AgentInfo> = builtin_agents()
            .into_iter()
            .map(|a| (a.name.clone(), a))
            .collect();

        for (name, cfg) in &self.agents {
            if cfg.disable {
                agents.remove(name);
                continue;
            }
            let agent = agents
                .entry(name.clone())
                .or_insert_with(|| AgentInfo::new(name.clone()));
            if let Some(d) = &cfg.description {
                agent.description = d.clone();
            }
            if let Some(mode) = cfg.mode {
                agent.mode = mode;
            }
            if cfg.prompt.is_some() {
                agent.prompt = cfg.prompt.clone();
            }
            if let Some(model) = cfg.model.as_deref().and_then(ModelRef::parse) {
                agent.model = Some(model);
            }
            if cfg.temperature.is_some() {
                agent.temperature = cfg.temperature;
            }
            if cfg.top_p.is_some() {
                agent.top_p = cfg.top_p;
            }
            agent.tools.extend(cfg.tools.clone());
            if let Some(edit) = cfg.permission.edit {
                agent.permission.edit = edit;
            }
            if let Some(bash) = &cfg.permission.bash {
                agent.permission.bash = bash.clone();
            }
            if let Some(webfetch) = cfg.permission.webfetch {
                agent.permission.webfetch = webfetch;
            }
        }

        agents.into_values().collect()
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            small_model: None,
            default_agent: None,
            providers: BTreeMap::new(),
            agents: BTreeMap::new(),
            commands: BTreeMap::new(),
            tools: BTreeMap::new(),
            instructions: Vec::new(),
            compaction: CompactionConfig::default(),
            retry: RetryConfig::default(),
            session: SessionConfig::default(),
            security: SecurityConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.model, "openai/gpt-4o");
        assert!(config.compaction.prune);
        assert_eq!(config.session.max_steps, 1000);
        assert_eq!(config.retry.max_duration_secs, 600);
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.model, config.model);
        assert_eq!(parsed.retry.initial_delay_ms, config.retry.initial_delay_ms);
    }

    #[test]
    fn malformed_model_rejected() {
        let config = AppConfig {
            model: "gpt-4o".into(),
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn invalid_agent_temperature_rejected() {
        let mut config = AppConfig::default();
        config.agents.insert(
            "hot".into(),
            AgentConfig {
                temperature: Some(5.0),
                ..Default::default()
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let config = AppConfig::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.storage.backend, "file");
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
model = "local/qwen"

[providers.local]
api_url = "http://localhost:11434/v1"

[providers.local.models.qwen]
context = 32000
output = 4096
cost = { input = 0.5, output = 1.5 }

[commands.review]
template = "Review $1 carefully"
description = "Code review"

[compaction]
disabled = true
"#,
        )
        .unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.model, "local/qwen");
        let model = &config.providers["local"].models["qwen"];
        assert_eq!(model.context, 32000);
        assert_eq!(model.cost.output, 1.5);
        let info = model.to_info("local", "qwen");
        assert_eq!(info.limit.output, 4096);
        assert_eq!(config.commands["review"].description, "Code review");
        assert!(config.compaction.disabled);
    }

    #[test]
    fn parse_error_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "model = [").unwrap();
        let err = AppConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn agents_merge_over_builtins() {
        let config: AppConfig = toml::from_str(
            r#"
[agents.plan]
disable = true

[agents.build.permission]
bash = { "*" = "ask", "git status" = "allow" }

[agents.reviewer]
description = "Reviews diffs"
mode = "subagent"
model = "openai/gpt-4o-mini"
tools = { write = false, edit = false }
"#,
        )
        .unwrap();

        let agents = config.agents();
        let names: Vec<_> = agents.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["build", "general", "reviewer"]);

        let build = &agents[0];
        assert_eq!(build.permission.bash["git status"], Permission::Allow);
        assert_eq!(build.permission.bash["*"], Permission::Ask);

        let reviewer = &agents[2];
        assert_eq!(reviewer.mode, AgentMode::Subagent);
        assert_eq!(reviewer.tools["write"], false);
        assert_eq!(reviewer.model.as_ref().unwrap().model_id, "gpt-4o-mini");
    }

    #[test]
    fn debug_redacts_api_key() {
        let provider = ProviderConfig {
            api_key: Some("sk-secret".into()),
            ..Default::default()
        };
        let debug = format!("{provider:?}");
        assert!(!debug.contains("sk-secret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn api_key_from_env_var() {
        let provider = ProviderConfig {
            api_key_env: Some("CORVID_TEST_KEY_THAT_IS_UNSET".into()),
            ..Default::default()
        };
        assert!(provider.resolve_api_key().is_none());
    }
}
