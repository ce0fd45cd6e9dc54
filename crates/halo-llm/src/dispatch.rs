//! Request dispatch: validation, model selection, admission, provider
//! configuration, attachment folding, guardrails, then the adapter call.

use std::sync::Arc;
use std::time::Instant;

use futures::stream::BoxStream;
use serde::Serialize;
use tracing::{debug, info, warn};

use halo_core::attachments;
use halo_core::capabilities::{self, ModelCapabilities, UNREGISTERED_MODEL};
use halo_core::config::{AppConfig, DefaultsConfig};
use halo_core::error::{HaloError, Result};
use halo_core::guardrails::Guardrails;
use halo_core::provider_config::{ProviderConfig, ProviderConfigResolver};
use halo_core::task_profile::{apply_settings, ResolveInput, ResolvedModel, TaskProfileResolver};
use halo_core::traits::ProviderAdapter;
use halo_core::types::*;

use crate::aggregator::StreamAggregator;
use crate::auth::{ClientSecretCredential, TokenCredential};
use crate::providers::{AzureOpenAiAdapter, FoundryAdapter, OpenAiAdapter};

/// Image model used when an image request names none.
pub const DEFAULT_IMAGE_MODEL: &str = "gpt-image-1";

/// The fixed set of provider adapters.
pub struct Adapters {
    pub azure_openai: AzureOpenAiAdapter,
    pub openai: OpenAiAdapter,
    pub foundry: FoundryAdapter,
}

impl Adapters {
    pub fn get(&self, kind: ProviderKind) -> &dyn ProviderAdapter {
        match kind {
            ProviderKind::AzureOpenAi => &self.azure_openai,
            ProviderKind::OpenAi => &self.openai,
            ProviderKind::Foundry => &self.foundry,
        }
    }
}

/// Everything decided about a request before the backend call.
#[derive(Debug, Clone)]
pub struct PreparedCall {
    pub provider: ProviderKind,
    pub resolved: ResolvedModel,
    pub config: ProviderConfig,
    pub request: ProviderRequest,
}

/// Image generation output: the backend payload plus attachment objects.
#[derive(Debug, Clone, Serialize)]
pub struct ImageGenerationOutput {
    #[serde(flatten)]
    pub response: ImageGenerationResponse,
    pub attachments: Vec<Attachment>,
}

pub type ChunkStream = StreamAggregator<BoxStream<'static, Result<SseChunk>>>;

pub struct ChatDispatcher {
    defaults: DefaultsConfig,
    profiles: TaskProfileResolver,
    resolver: ProviderConfigResolver,
    guardrails: Guardrails,
    adapters: Adapters,
}

impl ChatDispatcher {
    pub fn new(config: &AppConfig) -> Self {
        let azure = &config.providers.azure_openai;
        let credential: Option<Arc<dyn TokenCredential>> =
            match (&azure.tenant_id, &azure.client_id, &azure.client_secret) {
                (Some(tenant), Some(client), Some(secret)) => Some(Arc::new(
                    ClientSecretCredential::new(tenant, client, secret),
                )),
                _ => None,
            };
        Self::with_adapters(
            config,
            Adapters {
                azure_openai: AzureOpenAiAdapter::new(credential),
                openai: OpenAiAdapter::new(),
                foundry: FoundryAdapter::new(),
            },
        )
    }

    pub fn with_adapters(config: &AppConfig, adapters: Adapters) -> Self {
        Self {
            defaults: config.defaults.clone(),
            profiles: TaskProfileResolver::new(&config.defaults),
            resolver: ProviderConfigResolver::new(&config.providers),
            guardrails: Guardrails::from_config(&config.guardrails),
            adapters,
        }
    }

    pub fn guardrails(&self) -> &Guardrails {
        &self.guardrails
    }

    pub fn adapter(&self, kind: ProviderKind) -> &dyn ProviderAdapter {
        self.adapters.get(kind)
    }

    fn select_provider(&self, requested: Option<&str>) -> Result<ProviderKind> {
        match requested.map(str::trim).filter(|p| !p.is_empty()) {
            Some(name) => name.parse(),
            None => Ok(self.defaults.provider),
        }
    }

    fn capabilities_for(&self, adapter: &dyn ProviderAdapter, model: &str) -> Result<ModelCapabilities> {
        match adapter.get_capabilities(model) {
            Some(caps) => Ok(caps),
            None if self.defaults.allow_unregistered_models => {
                warn!(model, provider = %adapter.kind(), "Model not in capability registry; admitting as plain chat");
                Ok(UNREGISTERED_MODEL)
            }
            None => Err(HaloError::UnsupportedModel(model.to_string())),
        }
    }

    /// Run every pre-dispatch step and build the provider request.
    pub fn prepare(&self, request: ChatRequest) -> Result<PreparedCall> {
        request.validate()?;

        let provider = self.select_provider(request.provider.as_deref())?;
        let resolved = self.profiles.resolve(ResolveInput {
            request_model: request.model.as_deref(),
            task_profile: request.task_profile.as_deref(),
            default_model: &self.defaults.model,
        })?;
        debug!(
            model = %resolved.model,
            source = ?resolved.source,
            task_profile = ?resolved.task_profile,
            "Resolved model"
        );

        let mut request = apply_settings(&resolved, request);
        request.model = Some(resolved.model.clone());

        let adapter = self.adapter(provider);
        let caps = self.capabilities_for(adapter, &resolved.model)?;
        capabilities::admit(&resolved.model, &caps, &request)?;
        if !adapter.validate_request(&request) {
            return Err(HaloError::InvalidRequest(format!(
                "{provider} does not accept this request"
            )));
        }

        let mut overrides = request.provider_options.clone().unwrap_or_default();
        if overrides.deployment.is_none() && resolved.deployment != resolved.model {
            overrides.deployment = Some(resolved.deployment.clone());
        }
        let config = self
            .resolver
            .resolve(provider, Some(&overrides), Some(&resolved.model))?;

        let messages = std::mem::take(&mut request.messages);
        let messages = attachments::normalize(messages, &resolved.model, &caps)?;
        request.messages = self
            .guardrails
            .apply(messages, request.guardrail_profile.as_deref());

        let provider_request = adapter.build_request(&request, &config)?;
        Ok(PreparedCall {
            provider,
            resolved,
            config,
            request: provider_request,
        })
    }

    /// Single-shot completion, stamped with the gateway extension fields.
    pub async fn complete(&self, request: ChatRequest, request_id: &str) -> Result<ChatCompletionResponse> {
        let started = Instant::now();
        let call = self.prepare(ChatRequest {
            stream: false,
            ..request
        })?;
        let model = call.request.model.clone();

        let mut response = self
            .adapter(call.provider)
            .execute_json(call.request, &call.config)
            .await?;

        let latency_ms = started.elapsed().as_millis() as u64;
        response.request_id = Some(request_id.to_string());
        response.provider = Some(call.provider.to_string());
        response.latency_ms = Some(latency_ms);

        info!(
            request_id,
            provider = %call.provider,
            model = %model,
            latency_ms,
            "Chat completion"
        );
        Ok(response)
    }

    /// Open a streaming completion. Errors before the first byte are
    /// returned directly; later ones arrive as the stream's last frame.
    pub async fn stream(&self, request: ChatRequest, request_id: &str) -> Result<ChunkStream> {
        let started = Instant::now();
        let call = self.prepare(ChatRequest {
            stream: true,
            ..request
        })?;
        let model = call.request.model.clone();

        let upstream = self
            .adapter(call.provider)
            .execute_stream(call.request, &call.config)
            .await?;

        info!(
            request_id,
            provider = %call.provider,
            model = %model,
            "Stream opened"
        );
        Ok(StreamAggregator::new(upstream, model)
            .with_start(started)
            .with_request_id(request_id))
    }

    pub async fn generate_image(&self, request: ImageGenerationRequest) -> Result<ImageGenerationOutput> {
        request.validate()?;
        let provider = self.select_provider(request.provider.as_deref())?;
        let model = request
            .model
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_IMAGE_MODEL.to_string());

        let adapter = self.adapter(provider);
        if let Some(caps) = adapter.get_capabilities(&model) {
            if !caps.image_generate {
                return Err(HaloError::capability(&model, "image generation"));
            }
        }

        let config = self
            .resolver
            .resolve(provider, request.provider_options.as_ref(), Some(&model))?;
        let request = ImageGenerationRequest {
            model: Some(model),
            ..request
        };
        let response = adapter.generate_image(&request, &config).await?;
        let attachments = attachments::from_image_generation_response(&response);
        Ok(ImageGenerationOutput {
            response,
            attachments,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use halo_core::config::GuardrailConfig;

    use crate::aggregator::StreamFrame;

    fn config(base_url: &str) -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.defaults.provider = ProviderKind::OpenAi;
        cfg.providers.openai.api_key = Some("sk-test".into());
        cfg.providers.openai.base_url = Some(base_url.to_string());
        cfg.guardrails.insert(
            "support".into(),
            GuardrailConfig {
                prefix: "Only discuss billing.".into(),
                description: None,
            },
        );
        cfg
    }

    fn request(model: Option<&str>) -> ChatRequest {
        ChatRequest {
            model: model.map(str::to_string),
            messages: vec![ChatMessage::user("Hi")],
            ..Default::default()
        }
    }

    #[test]
    fn test_prepare_runs_profile_guardrail_and_shaping() {
        let dispatcher = ChatDispatcher::new(&config("http://127.0.0.1:9"));
        let call = dispatcher
            .prepare(ChatRequest {
                task_profile: Some("reasoning".into()),
                guardrail_profile: Some("support".into()),
                ..request(None)
            })
            .unwrap();

        assert_eq!(call.provider, ProviderKind::OpenAi);
        assert_eq!(call.request.model, "gpt-5");
        assert_eq!(call.request.body["reasoning_effort"], "high");
        let messages = call.request.body["messages"].as_array().unwrap();
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[0]["content"], "Only discuss billing.");
        assert_eq!(messages[1]["content"], "Hi");
    }

    #[test]
    fn test_prepare_rejects_before_building() {
        let dispatcher = ChatDispatcher::new(&config("http://127.0.0.1:9"));

        let err = dispatcher
            .prepare(ChatRequest {
                task_profile: Some("turbo".into()),
                ..request(None)
            })
            .unwrap_err();
        assert!(matches!(err, HaloError::UnknownTaskProfile(_)));

        let err = dispatcher
            .prepare(ChatRequest {
                provider: Some("anthropic".into()),
                ..request(Some("gpt-4o"))
            })
            .unwrap_err();
        assert!(matches!(err, HaloError::UnsupportedProvider(_)));

        let mut msg = ChatMessage::user("what is this");
        msg.attachments = Some(vec![Attachment {
            kind: AttachmentKind::Image,
            mime_type: "image/png".into(),
            data: Some("AAAA".into()),
            url: None,
            filename: None,
            size_bytes: None,
        }]);
        let err = dispatcher
            .prepare(ChatRequest {
                messages: vec![msg],
                ..request(Some("o3-mini"))
            })
            .unwrap_err();
        assert!(matches!(err, HaloError::Capability { .. }));
    }

    #[test]
    fn test_unregistered_model_is_rejected_unless_allowed() {
        let mut cfg = config("http://127.0.0.1:9");
        let err = ChatDispatcher::new(&cfg)
            .prepare(request(Some("my-private-finetune")))
            .unwrap_err();
        assert!(matches!(err, HaloError::UnsupportedModel(ref m) if m == "my-private-finetune"));
        assert_eq!(err.status_code(), 400);
        assert_eq!(err.code(), "unsupported_model");

        cfg.defaults.allow_unregistered_models = true;
        let dispatcher = ChatDispatcher::new(&cfg);
        let call = dispatcher.prepare(request(Some("my-private-finetune"))).unwrap();
        assert_eq!(call.request.model, "my-private-finetune");

        // allowed, but only as plain chat
        let err = dispatcher
            .prepare(ChatRequest {
                tools: Some(vec![serde_json::json!({"type": "function"})]),
                ..request(Some("my-private-finetune"))
            })
            .unwrap_err();
        assert!(matches!(err, HaloError::Capability { .. }));
    }

    #[test]
    fn test_missing_credentials_is_config_error() {
        let mut cfg = config("http://127.0.0.1:9");
        cfg.providers.openai.api_key = None;
        let err = ChatDispatcher::new(&cfg)
            .prepare(request(Some("gpt-4o")))
            .unwrap_err();
        assert_eq!(err.status_code(), 500);
        assert_eq!(err.code(), "configuration_error");
    }

    #[tokio::test]
    async fn test_complete_stamps_extension_fields() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_body(
                r#"{"choices":[{"message":{"role":"assistant","content":"Hello!"},"finish_reason":"stop"}],"usage":{"prompt_tokens":5,"completion_tokens":3,"total_tokens":8}}"#,
            )
            .create_async()
            .await;

        let dispatcher = ChatDispatcher::new(&config(&server.url()));
        let resp = dispatcher.complete(request(Some("gpt-4o")), "req-1").await.unwrap();
        assert_eq!(resp.request_id.as_deref(), Some("req-1"));
        assert_eq!(resp.provider.as_deref(), Some("openai"));
        assert!(resp.latency_ms.is_some());
        assert_eq!(resp.object, "chat.completion");
    }

    #[tokio::test]
    async fn test_stream_is_aggregated() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({"stream": true})))
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(concat!(
                "data: {\"id\":\"c1\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hello\"}}]}\n\n",
                "data: {\"id\":\"c1\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\" world\"},\"finish_reason\":\"stop\"}]}\n\n",
                "data: [DONE]\n\n",
            ))
            .create_async()
            .await;

        let dispatcher = ChatDispatcher::new(&config(&server.url()));
        let frames: Vec<StreamFrame> = dispatcher
            .stream(request(Some("gpt-4o")), "req-2")
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(frames.len(), 4);
        let StreamFrame::Final(f) = &frames[2] else {
            panic!("expected final chunk");
        };
        assert_eq!(f.chunk.choices[0].delta.content.as_deref(), Some("Hello world"));
        assert!(matches!(frames[3], StreamFrame::Done));
    }

    #[tokio::test]
    async fn test_image_generation_returns_attachments() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/images/generations")
            .match_body(mockito::Matcher::PartialJson(
                serde_json::json!({"model": "gpt-image-1", "prompt": "a red fox"}),
            ))
            .with_status(200)
            .with_body(r#"{"created":1700000000,"data":[{"b64_json":"aGVsbG8="}]}"#)
            .create_async()
            .await;

        let dispatcher = ChatDispatcher::new(&config(&server.url()));
        let out = dispatcher
            .generate_image(ImageGenerationRequest {
                prompt: "a red fox".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(out.attachments.len(), 1);
        assert_eq!(out.attachments[0].size_bytes, Some(5));

        let err = dispatcher
            .generate_image(ImageGenerationRequest {
                model: Some("gpt-4o".into()),
                prompt: "a red fox".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, HaloError::Capability { .. }));
    }
}
