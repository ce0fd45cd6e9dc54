use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{HaloError, Result};
use crate::provider_config::normalize_model_key;
use crate::types::ProviderKind;

/// Top-level Halo configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub defaults: DefaultsConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub guardrails: HashMap<String, GuardrailConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Static bearer keys. Empty means anonymous access.
    #[serde(default)]
    pub api_keys: Vec<String>,
    /// Maximum accepted request body in bytes.
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            api_keys: vec![],
            body_limit_bytes: default_body_limit(),
        }
    }
}

fn default_bind() -> String { "127.0.0.1:8080".to_string() }
// Room for a 20 MiB attachment after base64 expansion.
fn default_body_limit() -> usize { 32 * 1024 * 1024 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    #[serde(default = "default_provider")]
    pub provider: ProviderKind,
    #[serde(default = "default_model")]
    pub model: String,
    /// Model behind the `nano` task-profile alias.
    #[serde(default = "default_nano_model")]
    pub nano_model: String,
    /// Model behind the `flagship` task-profile alias.
    #[serde(default = "default_flagship_model")]
    pub flagship_model: String,
    /// Model id -> deployment name, for Azure-style deployments.
    #[serde(default)]
    pub deployments: HashMap<String, String>,
    /// Admit chat requests for models outside the capability registry.
    #[serde(default)]
    pub allow_unregistered_models: bool,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            nano_model: default_nano_model(),
            flagship_model: default_flagship_model(),
            deployments: HashMap::new(),
            allow_unregistered_models: false,
        }
    }
}

fn default_provider() -> ProviderKind { ProviderKind::AzureOpenAi }
fn default_model() -> String { "gpt-4o".to_string() }
fn default_nano_model() -> String { "gpt-5-nano".to_string() }
fn default_flagship_model() -> String { "gpt-5".to_string() }

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub azure_openai: AzureOpenAiConfig,
    #[serde(default)]
    pub openai: OpenAiConfig,
    #[serde(default)]
    pub foundry: FoundryConfig,
}

/// How a provider client authenticates.
#[derive(Debug, Clone, Copy, Default, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum AuthType {
    #[default]
    #[serde(rename = "api-key")]
    ApiKey,
    #[serde(rename = "aad")]
    Aad,
}

impl AuthType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApiKey => "api-key",
            Self::Aad => "aad",
        }
    }
}

impl std::str::FromStr for AuthType {
    type Err = HaloError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "api-key" | "api_key" | "apikey" | "key" => Ok(Self::ApiKey),
            "aad" | "entra" | "entra-id" | "managed-identity" => Ok(Self::Aad),
            other => Err(HaloError::Config(format!("unknown auth type: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AzureOpenAiConfig {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_version: Option<String>,
    #[serde(default)]
    pub auth_type: AuthType,
    #[serde(default)]
    pub deployment: Option<String>,
    /// Entra ID client-credentials for `auth_type = "aad"`.
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    /// Per-model credential blocks, keyed by model id.
    #[serde(default)]
    pub models: HashMap<String, ModelCredentials>,
    /// Per-endpoint credential blocks, keyed by endpoint URL.
    #[serde(default)]
    pub endpoints: HashMap<String, EndpointCredentials>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelCredentials {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_version: Option<String>,
    #[serde(default)]
    pub auth_type: Option<AuthType>,
    #[serde(default)]
    pub deployment: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointCredentials {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_version: Option<String>,
    #[serde(default)]
    pub auth_type: Option<AuthType>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpenAiConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub organization: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FoundryConfig {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_version: Option<String>,
}

/// A named guardrail profile injected as a system prefix.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuardrailConfig {
    pub prefix: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| HaloError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| HaloError::Config(e.to_string()))
    }

    /// Overlay provider settings from environment-style key/value pairs.
    /// Environment values override file values.
    pub fn apply_env<I, K, V>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut endpoint_aliases: HashMap<String, (Option<String>, EndpointCredentials)> =
            HashMap::new();
        let ProvidersConfig {
            azure_openai: azure,
            openai,
            foundry,
        } = &mut self.providers;

        for (key, value) in vars {
            let key = key.as_ref();
            let value: String = value.into();
            if value.is_empty() {
                continue;
            }

            match key {
                "AZURE_OPENAI_ENDPOINT" => azure.endpoint = Some(value),
                "AZURE_OPENAI_API_KEY" => azure.api_key = Some(value),
                "AZURE_OPENAI_API_VERSION" => azure.api_version = Some(value),
                "AZURE_OPENAI_AUTH_TYPE" => azure.auth_type = value.parse()?,
                "AZURE_OPENAI_DEPLOYMENT" => azure.deployment = Some(value),
                "AZURE_TENANT_ID" => azure.tenant_id = Some(value),
                "AZURE_CLIENT_ID" => azure.client_id = Some(value),
                "AZURE_CLIENT_SECRET" => azure.client_secret = Some(value),
                "OPENAI_API_KEY" => openai.api_key = Some(value),
                "OPENAI_BASE_URL" => openai.base_url = Some(value),
                "OPENAI_ORGANIZATION" => openai.organization = Some(value),
                "AZURE_FOUNDRY_ENDPOINT" => foundry.endpoint = Some(value),
                "AZURE_FOUNDRY_API_KEY" => foundry.api_key = Some(value),
                "AZURE_FOUNDRY_API_VERSION" => foundry.api_version = Some(value),
                _ => {
                    if let Some(rest) = key.strip_prefix("AZURE_OPENAI_MODEL_") {
                        if let Some((model, field)) = split_field(rest, MODEL_FIELDS) {
                            let entry = model_entry(&mut azure.models, model);
                            match field {
                                "ENDPOINT" => entry.endpoint = Some(value),
                                "API_KEY" => entry.api_key = Some(value),
                                "API_VERSION" => entry.api_version = Some(value),
                                "AUTH_TYPE" => entry.auth_type = Some(value.parse()?),
                                "DEPLOYMENT" => entry.deployment = Some(value),
                                _ => {}
                            }
                        }
                    } else if let Some(rest) = key.strip_prefix("AZURE_OPENAI_ENDPOINT_") {
                        if let Some((alias, field)) = split_field(rest, ENDPOINT_FIELDS) {
                            let (url, creds) = endpoint_aliases.entry(alias.to_string()).or_default();
                            match field {
                                "URL" => *url = Some(value),
                                "API_KEY" => creds.api_key = Some(value),
                                "API_VERSION" => creds.api_version = Some(value),
                                "AUTH_TYPE" => creds.auth_type = Some(value.parse()?),
                                _ => {}
                            }
                        }
                    }
                }
            }
        }

        for (alias, (url, creds)) in endpoint_aliases {
            match url {
                Some(url) => {
                    azure.endpoints.insert(url, creds);
                }
                None => tracing::warn!(alias = %alias, "Endpoint credentials without a URL ignored"),
            }
        }

        Ok(())
    }

    /// Copy of the configuration with every secret replaced.
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        let azure = &mut config.providers.azure_openai;
        redact(&mut azure.api_key);
        redact(&mut azure.client_secret);
        for creds in azure.models.values_mut() {
            redact(&mut creds.api_key);
        }
        for creds in azure.endpoints.values_mut() {
            redact(&mut creds.api_key);
        }
        redact(&mut config.providers.openai.api_key);
        redact(&mut config.providers.foundry.api_key);
        config.gateway.api_keys = config
            .gateway
            .api_keys
            .iter()
            .map(|_| "***".to_string())
            .collect();
        config
    }
}

const MODEL_FIELDS: &[&str] = &["API_VERSION", "AUTH_TYPE", "API_KEY", "DEPLOYMENT", "ENDPOINT"];
const ENDPOINT_FIELDS: &[&str] = &["API_VERSION", "AUTH_TYPE", "API_KEY", "URL"];

/// Split `GPT_4O_API_KEY` into (`GPT_4O`, `API_KEY`).
fn split_field<'a>(rest: &'a str, fields: &[&'static str]) -> Option<(&'a str, &'static str)> {
    fields.iter().find_map(|field| {
        rest.strip_suffix(field)
            .and_then(|head| head.strip_suffix('_'))
            .filter(|head| !head.is_empty())
            .map(|head| (head, *field))
    })
}

/// The per-model block `model` addresses. An existing block whose key
/// normalizes the same way (`"gpt-5"` for `GPT_5`) is reused so
/// environment fields overlay file fields one by one.
fn model_entry<'a>(
    models: &'a mut HashMap<String, ModelCredentials>,
    model: &str,
) -> &'a mut ModelCredentials {
    let wanted = normalize_model_key(model);
    let mut matching: Vec<String> = models
        .keys()
        .filter(|key| normalize_model_key(key) == wanted)
        .cloned()
        .collect();
    matching.sort();
    let key = matching.into_iter().next().unwrap_or(wanted);
    models.entry(key).or_default()
}

fn redact(value: &mut Option<String>) {
    if value.is_some() {
        *value = Some("***".to_string());
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_HALO_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_HALO_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_HALO_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_HALO_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_HALO_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.gateway.bind, "127.0.0.1:8080");
        assert_eq!(config.defaults.provider, ProviderKind::AzureOpenAi);
        assert_eq!(config.defaults.model, "gpt-4o");
        assert_eq!(config.providers.azure_openai.auth_type, AuthType::ApiKey);
        assert!(config.guardrails.is_empty());
    }

    #[test]
    fn test_model_and_endpoint_blocks() {
        let toml_str = r#"
[providers.azure_openai]
endpoint = "https://main.openai.azure.com"
api_key = "main-key"

[providers.azure_openai.models."gpt-5"]
endpoint = "https://reasoning.openai.azure.com"
api_key = "reasoning-key"
auth_type = "aad"

[providers.azure_openai.endpoints."https://other.openai.azure.com"]
api_key = "other-key"
api_version = "2025-01-01-preview"
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        let azure = &config.providers.azure_openai;
        assert_eq!(azure.models["gpt-5"].auth_type, Some(AuthType::Aad));
        assert_eq!(
            azure.endpoints["https://other.openai.azure.com"].api_version.as_deref(),
            Some("2025-01-01-preview")
        );
    }

    #[test]
    fn test_env_overlay_scans_model_and_endpoint_blocks() {
        let mut config = AppConfig::default();
        config
            .apply_env(vec![
                ("AZURE_OPENAI_ENDPOINT", "https://main.openai.azure.com"),
                ("AZURE_OPENAI_API_KEY", "main-key"),
                ("AZURE_OPENAI_MODEL_GPT_4O_MINI_API_KEY", "mini-key"),
                ("AZURE_OPENAI_MODEL_GPT_4O_MINI_AUTH_TYPE", "aad"),
                ("AZURE_OPENAI_ENDPOINT_EAST_URL", "https://east.openai.azure.com/"),
                ("AZURE_OPENAI_ENDPOINT_EAST_API_KEY", "east-key"),
                ("OPENAI_API_KEY", "sk-test"),
                ("UNRELATED", "ignored"),
            ])
            .unwrap();

        let azure = &config.providers.azure_openai;
        assert_eq!(azure.endpoint.as_deref(), Some("https://main.openai.azure.com"));
        let mini = &azure.models["gpt_4o_mini"];
        assert_eq!(mini.api_key.as_deref(), Some("mini-key"));
        assert_eq!(mini.auth_type, Some(AuthType::Aad));
        assert_eq!(
            azure.endpoints["https://east.openai.azure.com/"].api_key.as_deref(),
            Some("east-key")
        );
        assert_eq!(config.providers.openai.api_key.as_deref(), Some("sk-test"));
    }

    #[test]
    fn test_env_overlay_merges_into_file_model_block() {
        let mut config: AppConfig = toml::from_str(
            r#"
[providers.azure_openai.models."gpt-5"]
endpoint = "https://reasoning.openai.azure.com"
api_key = "file-key"
deployment = "gpt5-prod"
"#,
        )
        .unwrap();
        config
            .apply_env(vec![("AZURE_OPENAI_MODEL_GPT_5_API_KEY", "env-key")])
            .unwrap();

        let azure = &config.providers.azure_openai;
        assert_eq!(azure.models.len(), 1);
        let block = &azure.models["gpt-5"];
        assert_eq!(block.api_key.as_deref(), Some("env-key"));
        assert_eq!(block.endpoint.as_deref(), Some("https://reasoning.openai.azure.com"));
        assert_eq!(block.deployment.as_deref(), Some("gpt5-prod"));

        let resolved = crate::provider_config::ProviderConfigResolver::new(&config.providers)
            .resolve(ProviderKind::AzureOpenAi, None, Some("gpt-5"))
            .unwrap();
        assert_eq!(resolved.api_key.as_deref(), Some("env-key"));
        assert_eq!(resolved.deployment.as_deref(), Some("gpt5-prod"));
    }

    #[test]
    fn test_env_overlay_rejects_bad_auth_type() {
        let mut config = AppConfig::default();
        let err = config
            .apply_env(vec![("AZURE_OPENAI_AUTH_TYPE", "kerberos")])
            .unwrap_err();
        assert!(matches!(err, HaloError::Config(_)));
    }

    #[test]
    fn test_redacted_hides_secrets() {
        let mut config = AppConfig::default();
        config.providers.openai.api_key = Some("sk-secret".into());
        config.gateway.api_keys = vec!["hk_secret".into()];
        let redacted = config.redacted();
        assert_eq!(redacted.providers.openai.api_key.as_deref(), Some("***"));
        assert_eq!(redacted.gateway.api_keys, vec!["***"]);
        assert!(redacted.providers.foundry.api_key.is_none());
    }
}
