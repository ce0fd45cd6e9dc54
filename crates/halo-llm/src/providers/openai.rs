use futures::future::BoxFuture;
use futures::stream::{BoxStream, StreamExt};
use reqwest::{RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::warn;

use halo_core::attachments::content_parts;
use halo_core::capabilities::get_capabilities;
use halo_core::error::{HaloError, Result};
use halo_core::provider_config::ProviderConfig;
use halo_core::traits::ProviderAdapter;
use halo_core::types::*;

use crate::client_cache::ClientCache;
use crate::streaming::{SseEvent, SseStream};

/// Model used when neither configuration nor the request names one.
pub const FALLBACK_MODEL: &str = "gpt-4o";

/// Direct OpenAI client. Also works with any OpenAI-compatible base URL.
pub struct OpenAiAdapter {
    clients: ClientCache,
}

impl OpenAiAdapter {
    pub fn new() -> Self {
        Self {
            clients: ClientCache::new(),
        }
    }
}

impl Default for OpenAiAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// Which generation parameters a backend family accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ParamFamily {
    /// OpenAI and Azure OpenAI.
    OpenAi,
    /// Azure AI Foundry model-as-a-service.
    Maas,
}

#[derive(Serialize)]
pub(crate) struct OaiMessage<'a> {
    role: Role,
    content: Option<MessageContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<&'a [Value]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<&'a str>,
}

pub(crate) fn convert_messages(messages: &[ChatMessage]) -> Vec<OaiMessage<'_>> {
    messages
        .iter()
        .map(|msg| OaiMessage {
            role: msg.role,
            content: if msg.has_attachments() {
                Some(MessageContent::Parts(content_parts(msg)))
            } else {
                msg.content.clone()
            },
            name: msg.name.as_deref(),
            tool_calls: msg.tool_calls.as_deref().filter(|c| !c.is_empty()),
            tool_call_id: msg.tool_call_id.as_deref(),
        })
        .collect()
}

fn insert_opt<T: Serialize>(body: &mut Map<String, Value>, key: &str, value: Option<&T>) {
    if let Some(v) = value {
        if let Ok(v) = serde_json::to_value(v) {
            body.insert(key.to_string(), v);
        }
    }
}

/// Model id used for capability lookups: what the caller asked for, else
/// what configuration names.
pub(crate) fn capability_model<'a>(request: &'a ChatRequest, config: &'a ProviderConfig) -> &'a str {
    request
        .model
        .as_deref()
        .or(config.model.as_deref())
        .or(config.deployment.as_deref())
        .unwrap_or(FALLBACK_MODEL)
}

/// Build an OpenAI-shaped chat body, copying only the parameters `family`
/// accepts.
pub(crate) fn build_body(
    request: &ChatRequest,
    model: Option<&str>,
    capability_model: &str,
    family: ParamFamily,
) -> Value {
    let reasoning = family == ParamFamily::OpenAi
        && get_capabilities(capability_model).is_some_and(|c| c.reasoning);

    let mut body = Map::new();
    if let Some(model) = model {
        body.insert("model".into(), json!(model));
    }
    body.insert("messages".into(), json!(convert_messages(&request.messages)));

    if request.stream {
        body.insert("stream".into(), json!(true));
        if family == ParamFamily::OpenAi {
            body.insert("stream_options".into(), json!({ "include_usage": true }));
        }
    }

    let max_tokens = request.max_completion_tokens.or(request.max_tokens);
    if reasoning {
        insert_opt(&mut body, "max_completion_tokens", max_tokens.as_ref());
        insert_opt(
            &mut body,
            "reasoning_effort",
            request.reasoning_effort.as_ref().map(ReasoningEffort::as_str).as_ref(),
        );
    } else {
        insert_opt(&mut body, "max_tokens", max_tokens.as_ref());
    }

    insert_opt(&mut body, "temperature", request.temperature.as_ref());
    insert_opt(&mut body, "top_p", request.top_p.as_ref());
    insert_opt(&mut body, "tools", request.tools.as_ref().filter(|t| !t.is_empty()));
    insert_opt(&mut body, "tool_choice", request.tool_choice.as_ref());
    insert_opt(&mut body, "response_format", request.response_format.as_ref());
    insert_opt(&mut body, "stop", request.stop.as_ref());
    insert_opt(&mut body, "presence_penalty", request.presence_penalty.as_ref());
    insert_opt(&mut body, "frequency_penalty", request.frequency_penalty.as_ref());
    insert_opt(&mut body, "seed", request.seed.as_ref());
    if family == ParamFamily::OpenAi {
        insert_opt(&mut body, "n", request.n.as_ref());
        insert_opt(&mut body, "user", request.user.as_ref());
    }

    Value::Object(body)
}

// Error payloads
#[derive(Deserialize, Debug)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize, Debug)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<Value>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

fn error_code(body: &ErrorBody) -> Option<String> {
    match &body.code {
        Some(Value::String(code)) => Some(code.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => body.kind.clone(),
    }
}

/// Wrap a backend error payload into a single provider error.
pub(crate) fn map_error_response(provider: ProviderKind, status: u16, body: &str) -> HaloError {
    let payload: Option<Value> = serde_json::from_str(body).ok();
    let parsed = payload
        .as_ref()
        .and_then(|p| serde_json::from_value::<ErrorEnvelope>(p.clone()).ok());

    let (message, code) = match &parsed {
        Some(envelope) => (
            envelope
                .error
                .message
                .clone()
                .unwrap_or_else(|| format!("HTTP {status}")),
            error_code(&envelope.error),
        ),
        None if body.trim().is_empty() => (format!("HTTP {status}"), None),
        None => (format!("HTTP {status}: {}", truncate(body, 512)), None),
    };

    HaloError::Provider {
        provider: provider.to_string(),
        status: Some(status),
        code,
        message,
        provider_error: payload.map(|p| p.get("error").cloned().unwrap_or(p)),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Send a request, mapping transport failures and non-2xx statuses.
pub(crate) async fn send(provider: ProviderKind, request: RequestBuilder) -> Result<Response> {
    let response = request.send().await.map_err(|e| {
        let code = if e.is_timeout() { "timeout" } else { "network_error" };
        HaloError::Provider {
            provider: provider.to_string(),
            status: e.status().map(|s| s.as_u16()),
            code: Some(code.to_string()),
            message: e.to_string(),
            provider_error: None,
        }
    })?;

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        return Err(map_error_response(provider, status, &body));
    }
    Ok(response)
}

/// Map one upstream SSE event into a chunk. `None` for the `[DONE]`
/// sentinel and for frames that carry nothing (Azure prompt-filter preludes).
pub(crate) fn parse_chunk(provider: ProviderKind, event: &SseEvent) -> Option<Result<SseChunk>> {
    if event.is_done() {
        return None;
    }

    let value: Value = match serde_json::from_str(&event.data) {
        Ok(v) => v,
        Err(e) => {
            warn!(%provider, data = %event.data, error = %e, "Failed to parse SSE chunk");
            return Some(Err(HaloError::Stream {
                provider: provider.to_string(),
                message: format!("malformed chunk: {e}"),
            }));
        }
    };

    if value.get("error").is_some() {
        return Some(Err(map_error_response(provider, 500, &event.data)));
    }

    match serde_json::from_value::<SseChunk>(value) {
        Ok(chunk) if chunk.choices.is_empty() && chunk.usage.is_none() => None,
        Ok(chunk) => Some(Ok(chunk)),
        Err(e) => Some(Err(HaloError::Stream {
            provider: provider.to_string(),
            message: format!("unexpected chunk shape: {e}"),
        })),
    }
}

/// Turn a streaming HTTP response into a chunk stream that owns the
/// connection.
pub(crate) fn chunk_stream(
    provider: ProviderKind,
    response: Response,
) -> BoxStream<'static, Result<SseChunk>> {
    SseStream::new(response.bytes_stream(), provider)
        .filter_map(move |event| {
            futures::future::ready(match event {
                Ok(event) => parse_chunk(provider, &event),
                Err(e) => Some(Err(e)),
            })
        })
        .boxed()
}

/// Read a successful response body; a connection lost mid-body is a
/// network error, not an empty payload.
pub(crate) async fn read_body(provider: ProviderKind, response: Response) -> Result<String> {
    response.text().await.map_err(|e| HaloError::Provider {
        provider: provider.to_string(),
        status: None,
        code: Some("network_error".into()),
        message: format!("failed to read response body: {e}"),
        provider_error: None,
    })
}

/// Parse a single-shot body and fill fields some backends omit.
pub(crate) async fn read_completion(
    provider: ProviderKind,
    response: Response,
    model: &str,
) -> Result<ChatCompletionResponse> {
    let body = read_body(provider, response).await?;

    let mut completion: ChatCompletionResponse =
        serde_json::from_str(&body).map_err(|e| HaloError::Provider {
            provider: provider.to_string(),
            status: Some(502),
            code: Some("malformed_response".into()),
            message: format!("malformed response body: {e}"),
            provider_error: serde_json::from_str(&body).ok(),
        })?;

    if completion.id.is_empty() {
        completion.id = completion_id();
    }
    if completion.created == 0 {
        completion.created = chrono::Utc::now().timestamp();
    }
    if completion.model.is_empty() {
        completion.model = model.to_string();
    }
    Ok(completion)
}

pub(crate) fn read_images(provider: ProviderKind, body: &str) -> Result<ImageGenerationResponse> {
    serde_json::from_str(body).map_err(|e| HaloError::Provider {
        provider: provider.to_string(),
        status: Some(502),
        code: Some("malformed_response".into()),
        message: format!("malformed image response: {e}"),
        provider_error: serde_json::from_str(body).ok(),
    })
}

pub(crate) fn image_body(request: &ImageGenerationRequest, model: Option<&str>) -> Value {
    let mut body = Map::new();
    if let Some(model) = model {
        body.insert("model".into(), json!(model));
    }
    body.insert("prompt".into(), json!(request.prompt));
    insert_opt(&mut body, "n", request.n.as_ref());
    insert_opt(&mut body, "size", request.size.as_ref());
    insert_opt(&mut body, "quality", request.quality.as_ref());
    insert_opt(&mut body, "response_format", request.response_format.as_ref());
    Value::Object(body)
}

impl OpenAiAdapter {
    fn url(config: &ProviderConfig, path: &str) -> String {
        format!("{}/{path}", config.endpoint.trim_end_matches('/'))
    }
}

impl ProviderAdapter for OpenAiAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    fn build_request(&self, request: &ChatRequest, config: &ProviderConfig) -> Result<ProviderRequest> {
        let model = config
            .deployment
            .as_deref()
            .or(config.model.as_deref())
            .or(request.model.as_deref())
            .unwrap_or(FALLBACK_MODEL)
            .to_string();
        let body = build_body(
            request,
            Some(&model),
            capability_model(request, config),
            ParamFamily::OpenAi,
        );
        Ok(ProviderRequest {
            provider: ProviderKind::OpenAi,
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
            let http = self.clients.get_or_create(config, "authorization")?;
            let response = send(
                ProviderKind::OpenAi,
                http.post(Self::url(config, "chat/completions")).json(&request.body),
            )
            .await?;
            Ok(chunk_stream(ProviderKind::OpenAi, response))
        })
    }

    fn execute_json<'a>(
        &'a self,
        request: ProviderRequest,
        config: &'a ProviderConfig,
    ) -> BoxFuture<'a, Result<ChatCompletionResponse>> {
        Box::pin(async move {
            let http = self.clients.get_or_create(config, "authorization")?;
            let response = send(
                ProviderKind::OpenAi,
                http.post(Self::url(config, "chat/completions")).json(&request.body),
            )
            .await?;
            read_completion(ProviderKind::OpenAi, response, &request.model).await
        })
    }

    fn generate_image<'a>(
        &'a self,
        request: &'a ImageGenerationRequest,
        config: &'a ProviderConfig,
    ) -> BoxFuture<'a, Result<ImageGenerationResponse>> {
        Box::pin(async move {
            let http = self.clients.get_or_create(config, "authorization")?;
            let model = request.model.as_deref().or(config.model.as_deref());
            let response = send(
                ProviderKind::OpenAi,
                http.post(Self::url(config, "images/generations"))
                    .json(&image_body(request, model)),
            )
            .await?;
            let body = read_body(ProviderKind::OpenAi, response).await?;
            read_images(ProviderKind::OpenAi, &body)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use halo_core::config::AuthType;

    fn config(base_url: &str) -> ProviderConfig {
        ProviderConfig {
            provider: ProviderKind::OpenAi,
            endpoint: base_url.to_string(),
            deployment: None,
            model: Some("gpt-4o".into()),
            api_key: Some("sk-test".into()),
            api_version: String::new(),
            auth_type: AuthType::ApiKey,
            organization: None,
        }
    }

    fn request(model: &str) -> ChatRequest {
        ChatRequest {
            model: Some(model.into()),
            messages: vec![ChatMessage::user("Hi")],
            ..Default::default()
        }
    }

    #[test]
    fn test_reasoning_models_get_completion_tokens_and_effort() {
        let req = ChatRequest {
            max_tokens: Some(100),
            reasoning_effort: Some(ReasoningEffort::High),
            ..request("gpt-5")
        };
        let body = build_body(&req, Some("gpt-5"), "gpt-5", ParamFamily::OpenAi);
        assert_eq!(body["max_completion_tokens"], 100);
        assert_eq!(body["reasoning_effort"], "high");
        assert!(body.get("max_tokens").is_none());

        let body = build_body(&req, Some("gpt-4o"), "gpt-4o", ParamFamily::OpenAi);
        assert_eq!(body["max_tokens"], 100);
        assert!(body.get("reasoning_effort").is_none());
    }

    #[test]
    fn test_streaming_requests_usage() {
        let req = ChatRequest {
            stream: true,
            ..request("gpt-4o")
        };
        let body = build_body(&req, Some("gpt-4o"), "gpt-4o", ParamFamily::OpenAi);
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
    }

    #[test]
    fn test_attachments_become_content_parts() {
        let mut msg = ChatMessage::user("look");
        msg.attachments = Some(vec![Attachment {
            kind: AttachmentKind::Image,
            mime_type: "image/png".into(),
            data: Some("AAAA".into()),
            url: None,
            filename: None,
            size_bytes: None,
        }]);
        let req = ChatRequest {
            messages: vec![msg],
            ..request("gpt-4o")
        };
        let body = build_body(&req, None, "gpt-4o", ParamFamily::OpenAi);
        let content = &body["messages"][0]["content"];
        assert_eq!(content[0]["type"], "text");
        assert_eq!(content[1]["image_url"]["url"], "data:image/png;base64,AAAA");
        assert!(body["messages"][0].get("attachments").is_none());
    }

    #[test]
    fn test_error_payload_mapping() {
        let err = map_error_response(
            ProviderKind::OpenAi,
            429,
            r#"{"error":{"message":"Rate limit reached","type":"requests","code":"rate_limit_exceeded"}}"#,
        );
        assert_eq!(err.status_code(), 429);
        assert_eq!(err.code(), "rate_limit_exceeded");
        assert_eq!(err.provider_error().unwrap()["message"], "Rate limit reached");

        let err = map_error_response(ProviderKind::OpenAi, 502, "<html>bad gateway</html>");
        assert!(err.to_string().contains("bad gateway"));
        assert!(err.provider_error().is_none());
    }

    #[test]
    fn test_parse_chunk_skips_done_and_empty_frames() {
        let done = SseEvent { event_type: None, data: "[DONE]".into() };
        assert!(parse_chunk(ProviderKind::OpenAi, &done).is_none());

        let prelude = SseEvent {
            event_type: None,
            data: r#"{"id":"","choices":[],"prompt_filter_results":[]}"#.into(),
        };
        assert!(parse_chunk(ProviderKind::AzureOpenAi, &prelude).is_none());

        let delta = SseEvent {
            event_type: None,
            data: r#"{"id":"c1","object":"chat.completion.chunk","created":1,"model":"gpt-4o","choices":[{"index":0,"delta":{"content":"Hi"},"finish_reason":null}]}"#.into(),
        };
        let chunk = parse_chunk(ProviderKind::OpenAi, &delta).unwrap().unwrap();
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("Hi"));

        let broken = SseEvent { event_type: None, data: "{not json".into() };
        assert!(parse_chunk(ProviderKind::OpenAi, &broken).unwrap().is_err());
    }

    #[tokio::test]
    async fn test_execute_json_against_stub() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .match_header("authorization", "Bearer sk-test")
            .match_body(mockito::Matcher::PartialJson(json!({"model": "gpt-4o"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"choices":[{"index":0,"message":{"role":"assistant","content":"Hello!"},"finish_reason":"stop"}],"usage":{"prompt_tokens":5,"completion_tokens":3,"total_tokens":8}}"#,
            )
            .create_async()
            .await;

        let adapter = OpenAiAdapter::new();
        let cfg = config(&server.url());
        let req = adapter.build_request(&request("gpt-4o"), &cfg).unwrap();
        let resp = adapter.execute_json(req, &cfg).await.unwrap();

        assert!(resp.id.starts_with("chatcmpl-"));
        assert_eq!(resp.model, "gpt-4o");
        assert_eq!(resp.choices[0].message.content.as_deref(), Some("Hello!"));
        assert_eq!(resp.usage.unwrap().total_tokens, 8);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_execute_stream_against_stub() {
        let mut server = mockito::Server::new_async().await;
        let body = concat!(
            "data: {\"id\":\"c1\",\"model\":\"gpt-4o\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"Hel\"}}]}\n\n",
            "data: {\"id\":\"c1\",\"model\":\"gpt-4o\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo\"},\"finish_reason\":\"stop\"}]}\n\n",
            "data: {\"id\":\"c1\",\"model\":\"gpt-4o\",\"choices\":[],\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":2,\"total_tokens\":7}}\n\n",
            "data: [DONE]\n\n",
        );
        server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create_async()
            .await;

        let adapter = OpenAiAdapter::new();
        let cfg = config(&server.url());
        let req = adapter
            .build_request(&ChatRequest { stream: true, ..request("gpt-4o") }, &cfg)
            .unwrap();
        let chunks: Vec<SseChunk> = adapter
            .execute_stream(req, &cfg)
            .await
            .unwrap()
            .map(|c| c.unwrap())
            .collect()
            .await;

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[1].choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(chunks[2].usage.as_ref().unwrap().total_tokens, 7);
    }

    #[tokio::test]
    async fn test_backend_error_is_single_typed_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(401)
            .with_body(r#"{"error":{"message":"Incorrect API key provided","code":"invalid_api_key"}}"#)
            .create_async()
            .await;

        let adapter = OpenAiAdapter::new();
        let cfg = config(&server.url());
        let req = adapter.build_request(&request("gpt-4o"), &cfg).unwrap();
        let err = match adapter.execute_stream(req, &cfg).await {
            Ok(_) => panic!("expected an error"),
            Err(e) => e,
        };
        assert_eq!(err.status_code(), 401);
        assert_eq!(err.code(), "invalid_api_key");
    }

    #[tokio::test]
    async fn test_truncated_image_body_is_network_error() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        // Promises 512 bytes, sends a few, then hangs up.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let _ = socket.read(&mut buf).await;
            socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 512\r\n\r\n{\"created\":1,",
                )
                .await
                .unwrap();
            socket.shutdown().await.unwrap();
        });

        let adapter = OpenAiAdapter::new();
        let err = adapter
            .generate_image(
                &ImageGenerationRequest {
                    prompt: "a red fox".into(),
                    ..Default::default()
                },
                &config(&format!("http://{addr}")),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "network_error");
        assert_eq!(err.status_code(), 503);
    }
}
