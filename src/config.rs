use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{SeeFlowError, SeeFlowResult};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub operator: OperatorConfig,
    #[serde(default)]
    pub trace: TraceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LlmConfig {
    #[serde(default)]
    pub active_provider: String,
    #[serde(default)]
    pub providers: HashMap<String, ProviderEntry>,
    /// Role-to-model mapping. If a role is absent, falls back to active_provider defaults.
    #[serde(default)]
    pub roles: RolesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEntry {
    pub display_name: String,
    /// Full chat-completions endpoint URL.
    pub api_base: String,
    /// Default model for this provider (used as fallback when no role config exists).
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// Optional API key stored in config.toml (falls back to env var SEEFLOW_<ID>_API_KEY).
    #[serde(default)]
    pub api_key: Option<String>,
    /// Use SSE streaming for this provider's responses.
    #[serde(default)]
    pub stream: bool,
}

/// Maps agent roles to specific provider+model combinations.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RolesConfig {
    /// Picks the next action from the screenshot. Needs the strongest vision model.
    pub decision: Option<RoleEntry>,
    /// Scene captions and element grounding. A cheaper model is fine here.
    pub perception: Option<RoleEntry>,
    /// Before/after verification.
    pub verification: Option<RoleEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleEntry {
    /// Must match a key under [llm.providers.*].
    pub provider: String,
    /// Model name sent to the API.
    pub model: String,
    /// Overrides the provider-level temperature for this role.
    pub temperature: Option<f64>,
}

fn default_temperature() -> f64 {
    0.1
}

fn default_true() -> bool {
    true
}

/// Orchestrator timings and limits. All durations are milliseconds unless the name says otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub max_retries: u32,
    pub history_images: usize,
    pub model_timeout_ms: u64,
    pub perception_timeout_ms: u64,
    pub retry_backoff_ms: u64,
    pub parse_retry_delay_ms: u64,
    pub inter_step_delay_ms: u64,
    pub settle_ms: u64,
    /// Per-action settle delays instead of the fixed `settle_ms`.
    pub adaptive_settle: bool,
    pub unchanged_recheck_ms: u64,
    pub direct_retries: u32,
    pub direct_backoff_ms: u64,
    pub run_timeout_secs: u64,
    pub max_image_dim: u32,
    pub verify_image_dim: u32,
    pub prefetch_scene: bool,
    pub skip_scene_for_non_visual: bool,
    pub require_visible_change: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            history_images: 2,
            model_timeout_ms: 30_000,
            perception_timeout_ms: 20_000,
            retry_backoff_ms: 1_000,
            parse_retry_delay_ms: 500,
            inter_step_delay_ms: 1_000,
            settle_ms: 500,
            adaptive_settle: true,
            unchanged_recheck_ms: 1_500,
            direct_retries: 3,
            direct_backoff_ms: 1_000,
            run_timeout_secs: 300,
            max_image_dim: 1280,
            verify_image_dim: 768,
            prefetch_scene: true,
            skip_scene_for_non_visual: true,
            require_visible_change: true,
        }
    }
}

impl AgentConfig {
    pub fn model_timeout(&self) -> Duration {
        Duration::from_millis(self.model_timeout_ms)
    }

    pub fn perception_timeout(&self) -> Duration {
        Duration::from_millis(self.perception_timeout_ms)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    /// Every delay zeroed and adaptive settle disabled; limits stay at their defaults.
    pub fn without_delays() -> Self {
        Self {
            retry_backoff_ms: 0,
            parse_retry_delay_ms: 0,
            inter_step_delay_ms: 0,
            settle_ms: 0,
            adaptive_settle: false,
            unchanged_recheck_ms: 0,
            direct_backoff_ms: 0,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorConfig {
    #[serde(default = "default_capture_retries")]
    pub capture_retries: u32,
    #[serde(default = "default_capture_retry_delay_ms")]
    pub capture_retry_delay_ms: u64,
    /// Monitor to capture and drive. Defaults to the primary monitor.
    #[serde(default)]
    pub monitor_index: Option<usize>,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            capture_retries: default_capture_retries(),
            capture_retry_delay_ms: default_capture_retry_delay_ms(),
            monitor_index: None,
        }
    }
}

fn default_capture_retries() -> u32 {
    3
}

fn default_capture_retry_delay_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Overrides the platform data directory for run traces.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
        }
    }
}

impl TraceConfig {
    /// Returns the configured trace dir, else `<data_dir>/SeeFlow/traces`, else the cwd.
    pub fn resolve_dir(&self) -> PathBuf {
        if let Some(dir) = &self.dir {
            return dir.clone();
        }
        if let Some(data_dir) = dirs::data_local_dir() {
            return data_dir.join("SeeFlow").join("traces");
        }
        std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
    }
}

fn resolve_config_path() -> SeeFlowResult<PathBuf> {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(parent) = exe.parent() {
            let candidate = parent.join("config.toml");
            if candidate.exists() {
                tracing::debug!(path = %candidate.display(), "config found next to executable");
                return Ok(candidate);
            }
        }
    }

    let cwd = std::env::current_dir()?;
    let candidate = cwd.join("config.toml");
    if candidate.exists() {
        tracing::debug!(path = %candidate.display(), "config found in working directory");
        return Ok(candidate);
    }

    if let Some(config_dir) = dirs::config_dir() {
        let candidate = config_dir.join("seeflow").join("config.toml");
        if candidate.exists() {
            tracing::debug!(path = %candidate.display(), "config found in user config dir");
            return Ok(candidate);
        }
    }

    Err(SeeFlowError::Config(
        "config.toml not found next to executable, in working directory, or in the user config dir"
            .into(),
    ))
}

pub fn load_config() -> SeeFlowResult<AppConfig> {
    let path = resolve_config_path()?;
    load_config_from(&path)
}

pub fn load_config_from(path: &Path) -> SeeFlowResult<AppConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: AppConfig = toml::from_str(&content)?;
    config.validate()?;
    tracing::info!(path = %path.display(), provider = %config.llm.active_provider, "config loaded");
    Ok(config)
}

pub fn save_config(config: &AppConfig, path: &Path) -> SeeFlowResult<()> {
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    tracing::info!(path = %path.display(), "config saved");
    Ok(())
}

impl AppConfig {
    /// Cross-field checks that serde cannot express.
    pub fn validate(&self) -> SeeFlowResult<()> {
        let roles = [
            ("decision", &self.llm.roles.decision),
            ("perception", &self.llm.roles.perception),
            ("verification", &self.llm.roles.verification),
        ];
        for (role, entry) in roles {
            if let Some(entry) = entry {
                if !self.llm.providers.contains_key(&entry.provider) {
                    return Err(SeeFlowError::Config(format!(
                        "role '{role}' references unknown provider '{}'",
                        entry.provider
                    )));
                }
            }
        }
        if !self.llm.active_provider.is_empty()
            && !self.llm.providers.contains_key(&self.llm.active_provider)
        {
            return Err(SeeFlowError::Config(format!(
                "active_provider '{}' is not defined under [llm.providers]",
                self.llm.active_provider
            )));
        }
        if self.agent.history_images == 0 {
            return Err(SeeFlowError::Config(
                "agent.history_images must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
