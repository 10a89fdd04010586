use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::config::{AppConfig, LlmConfig};
use crate::errors::{SeeFlowError, SeeFlowResult};
use crate::llm::provider::ModelClient;
use crate::llm::providers::openai_compatible::OpenAiCompatibleClient;

/// The three model roles the agent loop calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelRole {
    Decision,
    Perception,
    Verification,
}

impl ModelRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Decision => "decision",
            Self::Perception => "perception",
            Self::Verification => "verification",
        }
    }
}

/// A model client paired with the model name and temperature to use for one role.
#[derive(Clone)]
pub struct RoleBinding {
    pub client: Arc<dyn ModelClient>,
    pub model: String,
    pub temperature: f64,
}

impl fmt::Debug for RoleBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoleBinding")
            .field("provider", &self.client.name())
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .finish()
    }
}

impl RoleBinding {
    pub fn new(client: Arc<dyn ModelClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            temperature: 0.0,
        }
    }
}

/// Role bindings resolved once per run.
#[derive(Debug, Clone)]
pub struct ModelRoles {
    pub decision: RoleBinding,
    pub perception: RoleBinding,
    pub verification: RoleBinding,
}

impl ModelRoles {
    /// All three roles served by one client and model.
    pub fn uniform(client: Arc<dyn ModelClient>, model: impl Into<String>) -> Self {
        let binding = RoleBinding::new(client, model);
        Self {
            decision: binding.clone(),
            perception: binding.clone(),
            verification: binding,
        }
    }
}

/// Registry of all available model providers, keyed by their config.toml identifier.
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ModelClient>>,
    active: String,
    llm_config: LlmConfig,
}

impl ProviderRegistry {
    pub fn new(active: String) -> Self {
        Self {
            providers: HashMap::new(),
            active,
            llm_config: LlmConfig::default(),
        }
    }

    pub fn register(&mut self, provider: Arc<dyn ModelClient>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn get_active(&self) -> SeeFlowResult<Arc<dyn ModelClient>> {
        self.providers.get(&self.active).cloned().ok_or_else(|| {
            SeeFlowError::Config(format!(
                "Active provider '{}' not found in registry",
                self.active
            ))
        })
    }

    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Resolves a role.
    ///
    /// Role resolution order:
    /// 1. `[llm.roles.<role>]` in config.toml
    /// 2. Fallback: active provider with its default model / temperature
    pub fn binding_for_role(&self, role: ModelRole) -> SeeFlowResult<RoleBinding> {
        let role_entry = match role {
            ModelRole::Decision => self.llm_config.roles.decision.as_ref(),
            ModelRole::Perception => self.llm_config.roles.perception.as_ref(),
            ModelRole::Verification => self.llm_config.roles.verification.as_ref(),
        };

        if let Some(entry) = role_entry {
            let client = self.providers.get(&entry.provider).cloned().ok_or_else(|| {
                SeeFlowError::Config(format!(
                    "Role '{}' references unknown provider '{}'",
                    role.as_str(),
                    entry.provider
                ))
            })?;
            let temperature = entry.temperature.unwrap_or_else(|| {
                self.llm_config
                    .providers
                    .get(&entry.provider)
                    .map(|p| p.temperature)
                    .unwrap_or(0.1)
            });
            tracing::debug!(
                role = role.as_str(),
                provider = %entry.provider,
                model = %entry.model,
                temperature,
                "resolved role config"
            );
            return Ok(RoleBinding {
                client,
                model: entry.model.clone(),
                temperature,
            });
        }

        let client = self.get_active()?;
        let (model, temperature) = self
            .llm_config
            .providers
            .get(&self.active)
            .map(|p| (p.model.clone(), p.temperature))
            .unwrap_or_else(|| (String::new(), 0.1));
        tracing::debug!(
            role = role.as_str(),
            provider = %self.active,
            model = %model,
            "role not configured, using active provider fallback"
        );
        Ok(RoleBinding {
            client,
            model,
            temperature,
        })
    }

    pub fn roles(&self) -> SeeFlowResult<ModelRoles> {
        Ok(ModelRoles {
            decision: self.binding_for_role(ModelRole::Decision)?,
            perception: self.binding_for_role(ModelRole::Perception)?,
            verification: self.binding_for_role(ModelRole::Verification)?,
        })
    }

    /// Build a registry from the loaded app config.
    /// API keys are read from environment variables named `SEEFLOW_<ID>_API_KEY`.
    pub fn from_config(config: &AppConfig) -> Self {
        let mut registry = Self {
            providers: HashMap::new(),
            active: config.llm.active_provider.clone(),
            llm_config: config.llm.clone(),
        };
        for (id, entry) in &config.llm.providers {
            let api_key = std::env::var(format!("SEEFLOW_{}_API_KEY", id.to_uppercase()))
                .unwrap_or_else(|_| entry.api_key.clone().unwrap_or_default());
            if api_key.is_empty() {
                tracing::warn!(provider = %id, "no API key configured");
            }
            let client = OpenAiCompatibleClient::new(
                id.clone(),
                entry.api_base.clone(),
                api_key,
                entry.stream,
            );
            registry.register(Arc::new(client));
        }
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
        [llm]
        active_provider = "main"

        [llm.providers.main]
        display_name = "Main"
        api_base = "http://localhost:1/v1/chat/completions"
        model = "big-vision"
        temperature = 0.3

        [llm.providers.cheap]
        display_name = "Cheap"
        api_base = "http://localhost:2/v1/chat/completions"
        model = "small-vision"

        [llm.roles.perception]
        provider = "cheap"
        model = "small-vision-fast"
    "#;

    #[test]
    fn roles_resolve_with_fallback_to_active() {
        let cfg: AppConfig = toml::from_str(CONFIG).expect("parse");
        let registry = ProviderRegistry::from_config(&cfg);
        assert_eq!(registry.list_names(), vec!["cheap".to_string(), "main".to_string()]);

        let roles = registry.roles().expect("roles");
        assert_eq!(roles.decision.client.name(), "main");
        assert_eq!(roles.decision.model, "big-vision");
        assert!((roles.decision.temperature - 0.3).abs() < f64::EPSILON);

        assert_eq!(roles.perception.client.name(), "cheap");
        assert_eq!(roles.perception.model, "small-vision-fast");
        assert!((roles.perception.temperature - 0.1).abs() < f64::EPSILON);

        assert_eq!(roles.verification.client.name(), "main");
    }

    #[test]
    fn missing_active_provider_is_a_config_error() {
        let registry = ProviderRegistry::new("ghost".into());
        assert!(matches!(
            registry.binding_for_role(ModelRole::Decision),
            Err(SeeFlowError::Config(_))
        ));
    }
}
