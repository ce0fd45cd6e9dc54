//! Per-call provider configuration resolution.
//!
//! Azure OpenAI precedence, highest first:
//! 1. the per-model credential block for the requested model,
//! 2. the per-endpoint credential block for the candidate endpoint,
//! 3. request-supplied endpoint / deployment / API version,
//! 4. global defaults.
//!
//! OpenAI and Foundry read their flat provider block; missing credentials
//! are a configuration error.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::config::{
    AuthType, AzureOpenAiConfig, EndpointCredentials, FoundryConfig, ModelCredentials,
    OpenAiConfig, ProvidersConfig,
};
use crate::error::{HaloError, Result};
use crate::types::{ProviderKind, ProviderOverrides};

pub const DEFAULT_AZURE_API_VERSION: &str = "2024-10-21";
pub const DEFAULT_FOUNDRY_API_VERSION: &str = "2024-05-01-preview";
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Fully resolved configuration for a single provider call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderConfig {
    pub provider: ProviderKind,
    pub endpoint: String,
    pub deployment: Option<String>,
    pub model: Option<String>,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub api_version: String,
    pub auth_type: AuthType,
    pub organization: Option<String>,
}

fn deployment_segment() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)/(openai/)?deployments/[^/]*(/.*)?$").expect("valid regex"))
}

/// Reduce an endpoint URL to its resource root: no query string, no
/// deployment path, no `/chat/completions` suffix, no trailing slash.
/// Idempotent.
pub fn normalize_endpoint(url: &str) -> String {
    let mut current = url.trim().to_string();
    loop {
        let mut next = current.split('?').next().unwrap_or_default().to_string();
        next = deployment_segment().replace(&next, "").into_owned();
        next = next.trim_end_matches('/').to_string();
        if let Some(stripped) = strip_suffix_ignore_case(&next, "/chat/completions") {
            next = stripped.to_string();
        }
        if let Some(stripped) = strip_suffix_ignore_case(&next, "/openai") {
            next = stripped.to_string();
        }
        next = next.trim_end_matches('/').to_ascii_lowercase();
        if next == current {
            return next;
        }
        current = next;
    }
}

fn strip_suffix_ignore_case<'a>(s: &'a str, suffix: &str) -> Option<&'a str> {
    let cut = s.len().checked_sub(suffix.len())?;
    if s.is_char_boundary(cut) && s[cut..].eq_ignore_ascii_case(suffix) {
        Some(&s[..cut])
    } else {
        None
    }
}

/// Normalized lookup key for a model id: lowercase, runs of
/// non-alphanumerics collapsed to a single `_`.
pub fn normalize_model_key(model: &str) -> String {
    let mut key = String::with_capacity(model.len());
    for c in model.trim().chars() {
        if c.is_ascii_alphanumeric() {
            key.push(c.to_ascii_lowercase());
        } else if !key.ends_with('_') {
            key.push('_');
        }
    }
    key.trim_matches('_').to_string()
}

/// Credential bundles keyed by normalized model and endpoint identifiers.
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    models: HashMap<String, ModelCredentials>,
    endpoints: HashMap<String, EndpointCredentials>,
}

impl CredentialStore {
    pub fn from_config(config: &AzureOpenAiConfig) -> Self {
        let mut store = Self::default();
        // Sorted so keys that normalize alike resolve the same way every run.
        let mut models: Vec<_> = config.models.iter().collect();
        models.sort_by(|a, b| b.0.cmp(a.0));
        for (model, creds) in models {
            store.insert_model(model, creds.clone());
        }
        for (endpoint, creds) in &config.endpoints {
            store.insert_endpoint(endpoint, creds.clone());
        }
        store
    }

    pub fn insert_model(&mut self, model: &str, creds: ModelCredentials) {
        self.models.insert(normalize_model_key(model), creds);
    }

    pub fn insert_endpoint(&mut self, endpoint: &str, creds: EndpointCredentials) {
        self.endpoints.insert(normalize_endpoint(endpoint), creds);
    }

    pub fn model(&self, model: &str) -> Option<&ModelCredentials> {
        self.models.get(&normalize_model_key(model))
    }

    pub fn endpoint(&self, endpoint: &str) -> Option<&EndpointCredentials> {
        self.endpoints.get(&normalize_endpoint(endpoint))
    }
}

/// Builds a fresh [`ProviderConfig`] for every call.
#[derive(Debug, Clone)]
pub struct ProviderConfigResolver {
    azure: AzureOpenAiConfig,
    openai: OpenAiConfig,
    foundry: FoundryConfig,
    credentials: CredentialStore,
}

impl ProviderConfigResolver {
    pub fn new(providers: &ProvidersConfig) -> Self {
        Self {
            azure: providers.azure_openai.clone(),
            openai: providers.openai.clone(),
            foundry: providers.foundry.clone(),
            credentials: CredentialStore::from_config(&providers.azure_openai),
        }
    }

    pub fn resolve(
        &self,
        provider: ProviderKind,
        overrides: Option<&ProviderOverrides>,
        model_id: Option<&str>,
    ) -> Result<ProviderConfig> {
        let empty = ProviderOverrides::default();
        let overrides = overrides.unwrap_or(&empty);
        match provider {
            ProviderKind::AzureOpenAi => self.resolve_azure(overrides, model_id),
            ProviderKind::OpenAi => self.resolve_openai(model_id),
            ProviderKind::Foundry => self.resolve_foundry(model_id),
        }
    }

    fn resolve_azure(
        &self,
        overrides: &ProviderOverrides,
        model_id: Option<&str>,
    ) -> Result<ProviderConfig> {
        let request_deployment = overrides.deployment.clone();

        if let Some(creds) = model_id.and_then(|m| self.credentials.model(m)) {
            let endpoint = creds
                .endpoint
                .clone()
                .or_else(|| overrides.endpoint.clone())
                .or_else(|| self.azure.endpoint.clone())
                .ok_or_else(|| missing("azure-openai", "endpoint"))?;
            let auth_type = creds.auth_type.unwrap_or(self.azure.auth_type);
            let api_key = creds.api_key.clone().or_else(|| self.azure.api_key.clone());
            require_key(ProviderKind::AzureOpenAi, auth_type, &api_key)?;

            return Ok(ProviderConfig {
                provider: ProviderKind::AzureOpenAi,
                endpoint: normalize_endpoint(&endpoint),
                deployment: creds
                    .deployment
                    .clone()
                    .or(request_deployment)
                    .or_else(|| model_id.map(str::to_string)),
                model: model_id.map(str::to_string),
                api_key,
                api_version: creds
                    .api_version
                    .clone()
                    .or_else(|| overrides.api_version.clone())
                    .or_else(|| self.azure.api_version.clone())
                    .unwrap_or_else(|| DEFAULT_AZURE_API_VERSION.to_string()),
                auth_type,
                organization: None,
            });
        }

        let endpoint = overrides
            .endpoint
            .clone()
            .or_else(|| self.azure.endpoint.clone())
            .ok_or_else(|| missing("azure-openai", "endpoint"))?;
        let endpoint_creds = self.credentials.endpoint(&endpoint);

        let auth_type = endpoint_creds
            .and_then(|c| c.auth_type)
            .unwrap_or(self.azure.auth_type);
        let api_key = endpoint_creds
            .and_then(|c| c.api_key.clone())
            .or_else(|| self.azure.api_key.clone());
        require_key(ProviderKind::AzureOpenAi, auth_type, &api_key)?;

        let api_version = endpoint_creds
            .and_then(|c| c.api_version.clone())
            .or_else(|| overrides.api_version.clone())
            .or_else(|| self.azure.api_version.clone())
            .unwrap_or_else(|| DEFAULT_AZURE_API_VERSION.to_string());

        Ok(ProviderConfig {
            provider: ProviderKind::AzureOpenAi,
            endpoint: normalize_endpoint(&endpoint),
            deployment: request_deployment
                .or_else(|| self.azure.deployment.clone())
                .or_else(|| model_id.map(str::to_string)),
            model: model_id.map(str::to_string),
            api_key,
            api_version,
            auth_type,
            organization: None,
        })
    }

    fn resolve_openai(&self, model_id: Option<&str>) -> Result<ProviderConfig> {
        let api_key = self
            .openai
            .api_key
            .clone()
            .ok_or_else(|| missing("openai", "api_key"))?;
        Ok(ProviderConfig {
            provider: ProviderKind::OpenAi,
            endpoint: self
                .openai
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            deployment: None,
            model: model_id.map(str::to_string),
            api_key: Some(api_key),
            api_version: String::new(),
            auth_type: AuthType::ApiKey,
            organization: self.openai.organization.clone(),
        })
    }

    fn resolve_foundry(&self, model_id: Option<&str>) -> Result<ProviderConfig> {
        let endpoint = self
            .foundry
            .endpoint
            .clone()
            .ok_or_else(|| missing("foundry", "endpoint"))?;
        let api_key = self
            .foundry
            .api_key
            .clone()
            .ok_or_else(|| missing("foundry", "api_key"))?;
        Ok(ProviderConfig {
            provider: ProviderKind::Foundry,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            deployment: None,
            model: model_id.map(str::to_string),
            api_key: Some(api_key),
            api_version: self
                .foundry
                .api_version
                .clone()
                .unwrap_or_else(|| DEFAULT_FOUNDRY_API_VERSION.to_string()),
            auth_type: AuthType::ApiKey,
            organization: None,
        })
    }
}

fn missing(provider: &str, field: &str) -> HaloError {
    HaloError::Config(format!("{provider}: {field} is not configured"))
}

fn require_key(provider: ProviderKind, auth_type: AuthType, api_key: &Option<String>) -> Result<()> {
    if auth_type == AuthType::ApiKey && api_key.as_deref().map_or(true, str::is_empty) {
        return Err(missing(provider.as_str(), "api_key"));
    }
    Ok(())
}
