use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::{error, warn};

use halo_core::error::HaloError;

/// A `HaloError` bound to the request it failed, rendered as the error
/// envelope `{error:{code, message, status, provider_error?, request_id, timestamp}}`.
#[derive(Debug)]
pub struct ApiError {
    pub error: HaloError,
    pub request_id: String,
}

impl ApiError {
    pub fn new(error: HaloError, request_id: impl Into<String>) -> Self {
        Self {
            error,
            request_id: request_id.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    pub fn body(&self) -> serde_json::Value {
        self.error.envelope(&self.request_id)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(request_id = %self.request_id, code = self.error.code(), error = %self.error, "Request failed");
        } else {
            warn!(request_id = %self.request_id, code = self.error.code(), error = %self.error, "Request rejected");
        }
        (status, Json(self.body())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_mirrors_status_and_carries_provider_payload() {
        let err = ApiError::new(
            HaloError::Provider {
                provider: "azure-openai".into(),
                status: Some(429),
                code: Some("429".into()),
                message: "Rate limit".into(),
                provider_error: Some(serde_json::json!({"code": "429", "message": "Rate limit"})),
            },
            "req-1",
        );
        let body = err.body();
        assert_eq!(err.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error"]["status"], 429);
        assert_eq!(body["error"]["request_id"], "req-1");
        assert_eq!(body["error"]["provider_error"]["message"], "Rate limit");
        assert!(body["error"]["timestamp"].is_string());
    }

    #[test]
    fn test_internal_detail_is_not_echoed() {
        let err = ApiError::new(HaloError::Internal("db password is hunter2".into()), "req-2");
        let body = err.body();
        assert_eq!(body["error"]["status"], 500);
        assert_eq!(body["error"]["message"], "Internal server error");
        assert!(body["error"].get("provider_error").is_none());
    }
}
