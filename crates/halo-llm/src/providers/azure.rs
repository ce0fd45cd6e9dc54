use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use reqwest::RequestBuilder;

use halo_core::config::AuthType;
use halo_core::error::{HaloError, Result};
use halo_core::provider_config::ProviderConfig;
use halo_core::traits::ProviderAdapter;
use halo_core::types::*;

use super::openai::{self, ParamFamily, FALLBACK_MODEL};
use crate::auth::{TokenCredential, COGNITIVE_SERVICES_SCOPE};
use crate::client_cache::ClientCache;

/// Azure OpenAI client. Uses the same wire format as OpenAI but different
/// endpoint structure and `api-key` header instead of Bearer token.
/// With `auth_type = aad` a fresh bearer token is fetched for every call.
pub struct AzureOpenAiAdapter {
    clients: ClientCache,
    credential: Option<Arc<dyn TokenCredential>>,
}

impl AzureOpenAiAdapter {
    pub fn new(credential: Option<Arc<dyn TokenCredential>>) -> Self {
        Self {
            clients: ClientCache::new(),
            credential,
        }
    }

    fn deployment(config: &ProviderConfig, request: &ProviderRequest) -> String {
        request
            .deployment
            .clone()
            .filter(|d| !d.is_empty())
            .or_else(|| config.deployment.clone())
            .unwrap_or_else(|| request.model.clone())
    }

    fn url(config: &ProviderConfig, deployment: &str, operation: &str) -> String {
        format!(
            "{}/openai/deployments/{deployment}/{operation}?api-version={}",
            config.endpoint.trim_end_matches('/'),
            config.api_version
        )
    }

    /// Attach the per-call bearer token when running under identity auth.
    async fn authorize(&self, config: &ProviderConfig, builder: RequestBuilder) -> Result<RequestBuilder> {
        if config.auth_type != AuthType::Aad {
            return Ok(builder);
        }
        let credential = self.credential.as_ref().ok_or_else(|| HaloError::Auth {
            provider: ProviderKind::AzureOpenAi.to_string(),
            message: "auth_type is aad but no tenant_id/client_id/client_secret are configured"
                .to_string(),
        })?;
        let token = credential.get_token(COGNITIVE_SERVICES_SCOPE).await?;
        Ok(builder.bearer_auth(token))
    }

    async fn post(
        &self,
        config: &ProviderConfig,
        url: String,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response> {
        let http = self.clients.get_or_create(config, "api-key")?;
        let builder = self.authorize(config, http.post(url).json(body)).await?;
        openai::send(ProviderKind::AzureOpenAi, builder).await
    }
}

impl ProviderAdapter for AzureOpenAiAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::AzureOpenAi
    }

    fn build_request(&self, request: &ChatRequest, config: &ProviderConfig) -> Result<ProviderRequest> {
        let deployment = config
            .deployment
            .as_deref()
            .or(config.model.as_deref())
            .or(request.model.as_deref())
            .unwrap_or(FALLBACK_MODEL)
            .to_string();
        let capability_model = openai::capability_model(request, config);

        // Azure routes by deployment; the body carries no model field.
        let body = openai::build_body(request, None, capability_model, ParamFamily::OpenAi);
        Ok(ProviderRequest {
            provider: ProviderKind::AzureOpenAi,
            model: capability_model.to_string(),
            deployment: Some(deployment),
            stream: request.stream,
            body,
        })
    }

    fn execute_stream<'a>(
        &'a self,
        request: ProviderRequest,
        config: &'a ProviderConfig,
    ) -> BoxFuture<'a, Result<BoxStream<'static, Result<SseChunk>>>> {
        Box::pin(async move {
            let deployment = Self::deployment(config, &request);
            let url = Self::url(config, &deployment, "chat/completions");
            let response = self.post(config, url, &request.body).await?;
            Ok(openai::chunk_stream(ProviderKind::AzureOpenAi, response))
        })
    }

    fn execute_json<'a>(
        &'a self,
        request: ProviderRequest,
        config: &'a ProviderConfig,
    ) -> BoxFuture<'a, Result<ChatCompletionResponse>> {
        Box::pin(async move {
            let deployment = Self::deployment(config, &request);
            let url = Self::url(config, &deployment, "chat/completions");
            let response = self.post(config, url, &request.body).await?;
            openai::read_completion(ProviderKind::AzureOpenAi, response, &request.model).await
        })
    }

    fn generate_image<'a>(
        &'a self,
        request: &'a ImageGenerationRequest,
        config: &'a ProviderConfig,
    ) -> BoxFuture<'a, Result<ImageGenerationResponse>> {
        Box::pin(async move {
            let deployment = config
                .deployment
                .as_deref()
                .or(request.model.as_deref())
                .ok_or_else(|| HaloError::Config("azure-openai: no image deployment".into()))?;
            let url = Self::url(config, deployment, "images/generations");
            let response = self
                .post(config, url, &openai::image_body(request, None))
                .await?;
            let body = openai::read_body(ProviderKind::AzureOpenAi, response).await?;
            openai::read_images(ProviderKind::AzureOpenAi, &body)
        })
    }
}
