use crate::errors::ConfigError;
use crate::retry::RetryBackoffConfig;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

/// Runtime configuration for the agent core.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub turn: TurnConfig,
    pub exec: ExecConfig,
    pub subagents: SubagentConfig,
    pub providers: ProviderChainConfig,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct TurnConfig {
    pub max_tool_rounds: usize,
    pub max_provider_retries: u32,
    pub retry_backoff: RetryBackoffConfig,
    pub system_prompt: Option<String>,
    pub model: String,
    pub parallel_tool_calls: bool,
    pub tool_output_limits: HashMap<String, usize>,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: 10,
            max_provider_retries: 2,
            retry_backoff: RetryBackoffConfig::default(),
            system_prompt: None,
            model: String::new(),
            parallel_tool_calls: false,
            tool_output_limits: default_tool_output_limits(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct ExecConfig {
    pub default_yield_ms: u64,
    pub log_buffer_bytes: usize,
    pub static_allowlist: Vec<String>,
    /// Feature or skill name mapped to the binaries it unlocks while enabled.
    pub feature_binaries: BTreeMap<String, Vec<String>>,
    pub enabled_features: Vec<String>,
    pub fallback_dirs: Vec<PathBuf>,
    /// `None` means the process `PATH`.
    pub search_path: Option<Vec<PathBuf>>,
    /// Zero means sessions may run forever.
    pub max_session_secs: u64,
    pub shell: String,
    pub workspace_root: PathBuf,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            default_yield_ms: 10_000,
            log_buffer_bytes: 64 * 1024,
            static_allowlist: Vec::new(),
            feature_binaries: BTreeMap::new(),
            enabled_features: Vec::new(),
            fallback_dirs: Vec::new(),
            search_path: None,
            max_session_secs: 0,
            shell: "sh".to_string(),
            workspace_root: PathBuf::from("."),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct SubagentConfig {
    pub max_concurrent: usize,
    /// Zero disables archiving of `keep` runs.
    pub archive_after_secs: u64,
    pub max_depth: usize,
}

impl Default for SubagentConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            archive_after_secs: 3_600,
            max_depth: 1,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ProviderChainConfig {
    pub chain: Vec<String>,
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.turn.max_tool_rounds == 0 {
            return Err(ConfigError::Validation(
                "turn.max_tool_rounds must be greater than zero".to_string(),
            ));
        }
        if self.subagents.max_concurrent == 0 {
            return Err(ConfigError::Validation(
                "subagents.max_concurrent must be greater than zero".to_string(),
            ));
        }
        if self.turn.retry_backoff.backoff_factor < 1.0 {
            return Err(ConfigError::Validation(
                "turn.retry_backoff.backoff_factor must be at least 1.0".to_string(),
            ));
        }
        if self.exec.log_buffer_bytes == 0 {
            return Err(ConfigError::Validation(
                "exec.log_buffer_bytes must be greater than zero".to_string(),
            ));
        }
        if self.providers.chain.is_empty() {
            return Err(ConfigError::Validation(
                "providers.chain must name at least one provider".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for provider in &self.providers.chain {
            if provider.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "providers.chain contains an empty provider id".to_string(),
                ));
            }
            if !seen.insert(provider.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "providers.chain lists `{provider}` more than once"
                )));
            }
        }
        Ok(())
    }
}

pub fn default_tool_output_limits() -> HashMap<String, usize> {
    HashMap::from([
        ("exec".to_string(), 30_000),
        ("process".to_string(), 30_000),
        ("read_file".to_string(), 50_000),
        ("agent_history".to_string(), 20_000),
        ("send_input".to_string(), 20_000),
    ])
}
