use futures::future::BoxFuture;
use futures::stream::BoxStream;

use halo_core::error::Result;
use halo_core::provider_config::ProviderConfig;
use halo_core::traits::ProviderAdapter;
use halo_core::types::*;

use super::openai::{self, ParamFamily, FALLBACK_MODEL};
use crate::client_cache::ClientCache;

/// Azure AI Foundry model-as-a-service. OpenAI-shaped chat API, routed by
/// the `model` field, keyed with a bearer API key, and without the
/// OpenAI-only parameters (`reasoning_effort`, `n`, `user`).
pub struct FoundryAdapter {
    clients: ClientCache,
}

impl FoundryAdapter {
    pub fn new() -> Self {
        Self {
            clients: ClientCache::new(),
        }
    }

    fn url(config: &ProviderConfig) -> String {
        let base = config.endpoint.trim_end_matches('/');
        if config.api_version.is_empty() {
            format!("{base}/chat/completions")
        } else {
            format!("{base}/chat/completions?api-version={}", config.api_version)
        }
    }

    async fn post(&self, request: &ProviderRequest, config: &ProviderConfig) -> Result<reqwest::Response> {
        let http = self.clients.get_or_create(config, "authorization")?;
        openai::send(
            ProviderKind::Foundry,
            http.post(Self::url(config)).json(&request.body),
        )
        .await
    }
}

impl Default for FoundryAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderAdapter for FoundryAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Foundry
    }

    fn build_request(&self, request: &ChatRequest, config: &ProviderConfig) -> Result<ProviderRequest> {
        let model = config
            .deployment
            .as_deref()
            .or(config.model.as_deref())
            .or(request.model.as_deref())
            .unwrap_or(FALLBACK_MODEL)
            .to_string();
        let body = openai::build_body(
            request,
            Some(&model),
            openai::capability_model(request, config),
            ParamFamily::Maas,
        );
        Ok(ProviderRequest {
            provider: ProviderKind::Foundry,
            model,
            deployment: None,
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
            let response = self.post(&request, config).await?;
            Ok(openai::chunk_stream(ProviderKind::Foundry, response))
        })
    }

    fn execute_json<'a>(
        &'a self,
        request: ProviderRequest,
        config: &'a ProviderConfig,
    ) -> BoxFuture<'a, Result<ChatCompletionResponse>> {
        Box::pin(async move {
            let response = self.post(&request, config).await?;
            openai::read_completion(ProviderKind::Foundry, response, &request.model).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use halo_core::config::AuthType;

    fn config(endpoint: &str) -> ProviderConfig {
        ProviderConfig {
            provider: ProviderKind::Foundry,
            endpoint: endpoint.to_string(),
            deployment: None,
            model: Some("Llama-3.3-70B-Instruct".into()),
            api_key: Some("maas-key".into()),
            api_version: "2024-05-01-preview".into(),
            auth_type: AuthType::ApiKey,
            organization: None,
        }
    }

    #[test]
    fn test_openai_only_parameters_are_dropped() {
        let req = ChatRequest {
            model: Some("Llama-3.3-70B-Instruct".into()),
            messages: vec![ChatMessage::user("Hi")],
            reasoning_effort: Some(ReasoningEffort::High),
            n: Some(2),
            user: Some("u-1".into()),
            temperature: Some(0.2),
            max_completion_tokens: Some(256),
            stream: true,
            ..Default::default()
        };
        let built = FoundryAdapter::new()
            .build_request(&req, &config("https://x.models.ai.azure.com"))
            .unwrap();
        let body = &built.body;
        assert_eq!(body["model"], "Llama-3.3-70B-Instruct");
        assert_eq!(body["max_tokens"], 256);
        assert_eq!(body["temperature"], 0.2_f32 as f64);
        for key in ["reasoning_effort", "n", "user", "stream_options", "max_completion_tokens"] {
            assert!(body.get(key).is_none(), "{key} should not be sent");
        }
    }

    #[tokio::test]
    async fn test_stream_against_stub() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .match_query(mockito::Matcher::UrlEncoded(
                "api-version".into(),
                "2024-05-01-preview".into(),
            ))
            .match_header("authorization", "Bearer maas-key")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(concat!(
                "data: {\"id\":\"m1\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hi\"}}]}\n\n",
                "data: {\"id\":\"m1\",\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}],\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":1,\"total_tokens\":4}}\n\n",
                "data: [DONE]\n\n",
            ))
            .create_async()
            .await;

        let adapter = FoundryAdapter::new();
        let cfg = config(&server.url());
        let req = adapter
            .build_request(
                &ChatRequest {
                    messages: vec![ChatMessage::user("Hi")],
                    stream: true,
                    ..Default::default()
                },
                &cfg,
            )
            .unwrap();
        let chunks: Vec<_> = adapter.execute_stream(req, &cfg).await.unwrap().collect().await;
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.is_ok()));
        mock.assert_async().await;
    }
}
