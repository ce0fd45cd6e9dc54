use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use tracing::debug;

use halo_core::capabilities;
use halo_core::error::{FieldError, HaloError};
use halo_core::types::{ChatRequest, ImageGenerationRequest};
use halo_llm::ImageGenerationOutput;

use crate::error::ApiError;
use crate::middleware::{Authenticated, RequestId};
use crate::state::AppState;

/// Malformed, mistyped, or oversized bodies are all reported as validation
/// failures on `body`.
fn body_error(rejection: JsonRejection) -> HaloError {
    let constraint = if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
        "exceeds the configured size limit".to_string()
    } else {
        rejection.body_text()
    };
    HaloError::Validation(vec![FieldError::new("body", constraint)])
}

// GET /api/health, unauthenticated
pub async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "default_provider": state.config.defaults.provider.as_str(),
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}

// GET /v1/models
pub async fn list_models(Authenticated(_caller): Authenticated) -> Json<serde_json::Value> {
    let data: Vec<serde_json::Value> = capabilities::registered_models()
        .map(|(id, caps)| {
            serde_json::json!({
                "id": id,
                "object": "model",
                "created": 0,
                "owned_by": "halo",
                "capabilities": caps,
            })
        })
        .collect();
    Json(serde_json::json!({ "object": "list", "data": data }))
}

/// POST /v1/chat/completions
///
/// `stream: true` answers with `text/event-stream`: every upstream chunk,
/// one aggregate chunk, then `[DONE]`. Failures before the first frame use
/// the JSON error envelope; later ones arrive as an error frame.
pub async fn chat_completions(
    RequestId(request_id): RequestId,
    Authenticated(_caller): Authenticated,
    State(state): State<Arc<AppState>>,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body.map_err(|r| ApiError::new(body_error(r), &request_id))?;
    debug!(
        request_id = %request_id,
        model = ?request.model,
        task_profile = ?request.task_profile,
        stream = request.stream,
        "Chat request"
    );

    if request.stream {
        let frames = state
            .dispatcher
            .stream(request, &request_id)
            .await
            .map_err(|e| ApiError::new(e, &request_id))?;
        let events = frames.map(|frame| Ok::<_, Infallible>(Event::default().data(frame.data())));
        return Ok(Sse::new(events).into_response());
    }

    let response = state
        .dispatcher
        .complete(request, &request_id)
        .await
        .map_err(|e| ApiError::new(e, &request_id))?;
    Ok(Json(response).into_response())
}

// POST /v1/images/generations
pub async fn image_generations(
    RequestId(request_id): RequestId,
    Authenticated(_caller): Authenticated,
    State(state): State<Arc<AppState>>,
    body: Result<Json<ImageGenerationRequest>, JsonRejection>,
) -> Result<Json<ImageGenerationOutput>, ApiError> {
    let Json(request) = body.map_err(|r| ApiError::new(body_error(r), &request_id))?;
    state
        .dispatcher
        .generate_image(request)
        .await
        .map(Json)
        .map_err(|e| ApiError::new(e, request_id))
}
