//! Identity-token credentials for the `aad` auth type.

use futures::future::BoxFuture;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use halo_core::error::{HaloError, Result};

/// OAuth scope for Azure Cognitive Services data-plane calls.
pub const COGNITIVE_SERVICES_SCOPE: &str = "https://cognitiveservices.azure.com/.default";

pub const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com";

/// Source of bearer tokens. Implementations are called once per outgoing
/// request and must not hand back a token they know to be expired.
pub trait TokenCredential: Send + Sync + 'static {
    fn get_token<'a>(&'a self, scope: &'a str) -> BoxFuture<'a, Result<String>>;
}

/// OAuth2 client-credentials grant against Azure AD.
pub struct ClientSecretCredential {
    http: Client,
    authority: String,
    tenant_id: String,
    client_id: String,
    client_secret: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct TokenError {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

impl ClientSecretCredential {
    pub fn new(
        tenant_id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            http: Client::new(),
            authority: DEFAULT_AUTHORITY.to_string(),
            tenant_id: tenant_id.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    /// Point at a different token authority (sovereign clouds, test stubs).
    pub fn with_authority(mut self, authority: impl Into<String>) -> Self {
        self.authority = authority.into().trim_end_matches('/').to_string();
        self
    }

    fn token_url(&self) -> String {
        format!("{}/{}/oauth2/v2.0/token", self.authority, self.tenant_id)
    }
}

fn auth_error(message: impl Into<String>) -> HaloError {
    HaloError::Auth {
        provider: "azure-ad".to_string(),
        message: message.into(),
    }
}

impl TokenCredential for ClientSecretCredential {
    fn get_token<'a>(&'a self, scope: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            debug!(tenant = %self.tenant_id, scope, "Requesting access token");
            let form = [
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", scope),
            ];

            let response = self
                .http
                .post(self.token_url())
                .form(&form)
                .send()
                .await
                .map_err(|e| auth_error(format!("token request failed: {e}")))?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                let detail = serde_json::from_str::<TokenError>(&body)
                    .ok()
                    .and_then(|e| e.error_description.or(e.error))
                    .unwrap_or(body);
                return Err(auth_error(format!("HTTP {status}: {detail}")));
            }

            let token: TokenResponse = response
                .json()
                .await
                .map_err(|e| auth_error(format!("malformed token response: {e}")))?;
            Ok(token.access_token)
        })
    }
}

/// A fixed token. Useful when an outer system manages rotation.
pub struct StaticTokenCredential(pub String);

impl TokenCredential for StaticTokenCredential {
    fn get_token<'a>(&'a self, _scope: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move { Ok(self.0.clone()) })
    }
}
