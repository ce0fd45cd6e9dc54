use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;
use tracing::debug;

use halo_core::config::AuthType;
use halo_core::error::{HaloError, Result};
use halo_core::provider_config::ProviderConfig;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Identity of a cached client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey {
    pub endpoint: String,
    pub target: String,
    pub auth_type: AuthType,
}

impl ClientKey {
    pub fn for_config(config: &ProviderConfig) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            target: config
                .deployment
                .clone()
                .or_else(|| config.model.clone())
                .unwrap_or_default(),
            auth_type: config.auth_type,
        }
    }
}

/// Append-only map of HTTP clients. Entries are immutable once inserted,
/// so a lost insert race only costs one extra client construction.
#[derive(Default)]
pub struct ClientCache {
    clients: RwLock<HashMap<ClientKey, Client>>,
}

impl ClientCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch or lazily build the client for `config`. `auth_header` is the
    /// static credential header for the api-key path.
    pub fn get_or_create(&self, config: &ProviderConfig, auth_header: &str) -> Result<Client> {
        let key = ClientKey::for_config(config);

        {
            let clients = self.clients.read().unwrap_or_else(|e| e.into_inner());
            if let Some(client) = clients.get(&key) {
                return Ok(client.clone());
            }
        }

        let client = build_client(config, auth_header)?;
        let mut clients = self.clients.write().unwrap_or_else(|e| e.into_inner());
        let entry = clients.entry(key).or_insert_with(|| {
            debug!(
                provider = %config.provider,
                endpoint = %config.endpoint,
                auth_type = config.auth_type.as_str(),
                "Created provider client"
            );
            client
        });
        Ok(entry.clone())
    }

    pub fn len(&self) -> usize {
        self.clients.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn build_client(config: &ProviderConfig, auth_header: &str) -> Result<Client> {
    let mut headers = HeaderMap::new();
    if config.auth_type == AuthType::ApiKey {
        if let Some(key) = &config.api_key {
            let name = HeaderName::from_bytes(auth_header.as_bytes())
                .map_err(|e| HaloError::Internal(format!("invalid header name: {e}")))?;
            let value = if name == reqwest::header::AUTHORIZATION {
                HeaderValue::from_str(&format!("Bearer {key}"))
            } else {
                HeaderValue::from_str(key)
            };
            let mut value = value.map_err(|_| {
                HaloError::Config(format!("{} API key contains invalid characters", config.provider))
            })?;
            value.set_sensitive(true);
            headers.insert(name, value);
        }
    }
    if let Some(org) = &config.organization {
        if let Ok(value) = HeaderValue::from_str(org) {
            headers.insert("openai-organization", value);
        }
    }

    Client::builder()
        .default_headers(headers)
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .map_err(|e| HaloError::Internal(format!("failed to build HTTP client: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use halo_core::types::ProviderKind;

    fn config(deployment: &str, auth_type: AuthType) -> ProviderConfig {
        ProviderConfig {
            provider: ProviderKind::AzureOpenAi,
            endpoint: "https://res.openai.azure.com".into(),
            deployment: Some(deployment.into()),
            model: None,
            api_key: Some("k".into()),
            api_version: "2024-10-21".into(),
            auth_type,
            organization: None,
        }
    }

    #[test]
    fn test_clients_are_reused_per_key() {
        let cache = ClientCache::new();
        cache.get_or_create(&config("gpt-4o", AuthType::ApiKey), "api-key").unwrap();
        cache.get_or_create(&config("gpt-4o", AuthType::ApiKey), "api-key").unwrap();
        assert_eq!(cache.len(), 1);

        cache.get_or_create(&config("gpt-5", AuthType::ApiKey), "api-key").unwrap();
        cache.get_or_create(&config("gpt-4o", AuthType::Aad), "api-key").unwrap();
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_invalid_key_is_config_error() {
        let mut bad = config("gpt-4o", AuthType::ApiKey);
        bad.api_key = Some("line\nbreak".into());
        let err = ClientCache::new().get_or_create(&bad, "api-key").unwrap_err();
        assert!(matches!(err, HaloError::Config(_)));
    }
}
