use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::capabilities::{self, ModelCapabilities};
use crate::error::{HaloError, Result};
use crate::provider_config::ProviderConfig;
use crate::types::*;

/// Backend provider adapter: builds provider-shaped requests and executes
/// them, mapping responses into the common wire types.
pub trait ProviderAdapter: Send + Sync + 'static {
    fn kind(&self) -> ProviderKind;

    /// Shape a validated, normalized request for this provider.
    fn build_request(&self, request: &ChatRequest, config: &ProviderConfig)
        -> Result<ProviderRequest>;

    /// Open a streaming call. The returned stream owns its connection, so it
    /// may outlive the adapter borrow; dropping it aborts the backend call.
    fn execute_stream<'a>(
        &'a self,
        request: ProviderRequest,
        config: &'a ProviderConfig,
    ) -> BoxFuture<'a, Result<BoxStream<'static, Result<SseChunk>>>>;

    /// Single-shot call.
    fn execute_json<'a>(
        &'a self,
        request: ProviderRequest,
        config: &'a ProviderConfig,
    ) -> BoxFuture<'a, Result<ChatCompletionResponse>>;

    fn get_capabilities(&self, model: &str) -> Option<ModelCapabilities> {
        capabilities::get_capabilities(model)
    }

    /// Provider-specific acceptance check.
    fn validate_request(&self, request: &ChatRequest) -> bool {
        let _ = request;
        true
    }

    /// Image generation, for providers that host image models.
    fn generate_image<'a>(
        &'a self,
        request: &'a ImageGenerationRequest,
        config: &'a ProviderConfig,
    ) -> BoxFuture<'a, Result<ImageGenerationResponse>> {
        let _ = (request, config);
        let provider = self.kind();
        Box::pin(async move {
            Err(HaloError::UnsupportedProvider(format!(
                "{provider} does not support image generation"
            )))
        })
    }
}
