use thiserror::Error;

/// A single failing field in a request body.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldError {
    pub path: String,
    pub constraint: String,
}

impl FieldError {
    pub fn new(path: impl Into<String>, constraint: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            constraint: constraint.into(),
        }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.constraint)
    }
}

#[derive(Debug, Error)]
pub enum HaloError {
    // Request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("{}", join_fields(.0))]
    Validation(Vec<FieldError>),

    #[error("Unknown task profile: {0}")]
    UnknownTaskProfile(String),

    #[error("Provider not supported: {0}")]
    UnsupportedProvider(String),

    #[error("Model not supported: {0}")]
    UnsupportedModel(String),

    #[error("Model {model} does not support {capability}")]
    Capability { model: String, capability: String },

    #[error("Invalid attachment: {0}")]
    Attachment(String),

    #[error("Unauthorized")]
    Unauthorized,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Provider errors
    #[error("Authentication with {provider} failed: {message}")]
    Auth { provider: String, message: String },

    #[error("{provider} request failed: {message}")]
    Provider {
        provider: String,
        status: Option<u16>,
        code: Option<String>,
        message: String,
        provider_error: Option<serde_json::Value>,
    },

    #[error("{provider} stream failed: {message}")]
    Stream { provider: String, message: String },

    #[error("Internal error: {0}")]
    Internal(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn join_fields(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl HaloError {
    /// HTTP status this error maps to at the gateway boundary.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest(_)
            | Self::Validation(_)
            | Self::UnknownTaskProfile(_)
            | Self::UnsupportedProvider(_)
            | Self::UnsupportedModel(_)
            | Self::Capability { .. }
            | Self::Attachment(_)
            | Self::Json(_) => 400,
            Self::Unauthorized => 401,
            Self::Provider { status, .. } => match status {
                Some(s) if *s >= 400 => *s,
                Some(_) => 502,
                None => 503,
            },
            Self::Stream { .. } => 502,
            Self::Config(_)
            | Self::ConfigNotFound(_)
            | Self::Auth { .. }
            | Self::Internal(_)
            | Self::Io(_) => 500,
        }
    }

    /// Machine-readable error code for the error envelope.
    pub fn code(&self) -> &str {
        match self {
            Self::InvalidRequest(_) | Self::Json(_) => "invalid_request",
            Self::Validation(_) => "validation_error",
            Self::UnknownTaskProfile(_) => "unknown_task_profile",
            Self::UnsupportedProvider(_) => "unsupported_provider",
            Self::UnsupportedModel(_) => "unsupported_model",
            Self::Capability { .. } => "capability_mismatch",
            Self::Attachment(_) => "invalid_attachment",
            Self::Unauthorized => "unauthorized",
            Self::Config(_) | Self::ConfigNotFound(_) => "configuration_error",
            Self::Auth { .. } => "authentication_error",
            Self::Provider { code, .. } => code.as_deref().unwrap_or("provider_error"),
            Self::Stream { .. } => "stream_error",
            Self::Internal(_) | Self::Io(_) => "internal_error",
        }
    }

    /// Message safe to return to the caller. Internal failures are reduced
    /// to a generic description; the detail stays in the server logs.
    pub fn public_message(&self) -> String {
        match self {
            Self::Internal(_) | Self::Io(_) => "Internal server error".to_string(),
            Self::Json(e) => format!("Malformed JSON: {e}"),
            _ => self.to_string(),
        }
    }

    pub fn provider_error(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Provider { provider_error, .. } => provider_error.as_ref(),
            _ => None,
        }
    }

    /// The client-facing error envelope, shared by JSON responses and
    /// stream error frames.
    pub fn envelope(&self, request_id: &str) -> serde_json::Value {
        let mut body = serde_json::json!({
            "code": self.code(),
            "message": self.public_message(),
            "status": self.status_code(),
            "request_id": request_id,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        if let Some(provider_error) = self.provider_error() {
            body["provider_error"] = provider_error.clone();
        }
        serde_json::json!({ "error": body })
    }

    pub fn capability(model: impl Into<String>, capability: impl Into<String>) -> Self {
        Self::Capability {
            model: model.into(),
            capability: capability.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, HaloError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_lists_every_field() {
        let err = HaloError::Validation(vec![
            FieldError::new("temperature", "must be <= 2"),
            FieldError::new("messages", "must contain at least 1 item"),
        ]);
        assert_eq!(
            err.to_string(),
            "temperature: must be <= 2; messages: must contain at least 1 item"
        );
        assert_eq!(err.status_code(), 400);
        assert_eq!(err.code(), "validation_error");
    }

    #[test]
    fn test_provider_status_mapping() {
        let upstream = HaloError::Provider {
            provider: "openai".into(),
            status: Some(429),
            code: Some("rate_limit_exceeded".into()),
            message: "slow down".into(),
            provider_error: None,
        };
        assert_eq!(upstream.status_code(), 429);
        assert_eq!(upstream.code(), "rate_limit_exceeded");

        let network = HaloError::Provider {
            provider: "openai".into(),
            status: None,
            code: None,
            message: "connection refused".into(),
            provider_error: None,
        };
        assert_eq!(network.status_code(), 503);
        assert_eq!(network.code(), "provider_error");
    }

    #[test]
    fn test_internal_message_is_generic() {
        let err = HaloError::Internal("db password leaked in stack".into());
        assert_eq!(err.status_code(), 500);
        assert_eq!(err.public_message(), "Internal server error");
    }

    #[test]
    fn test_envelope_carries_request_and_provider_detail() {
        let err = HaloError::Provider {
            provider: "azure-openai".into(),
            status: Some(500),
            code: Some("server_error".into()),
            message: "upstream exploded".into(),
            provider_error: Some(serde_json::json!({"type": "server_error"})),
        };
        let envelope = err.envelope("req-9");
        assert_eq!(envelope["error"]["code"], "server_error");
        assert_eq!(envelope["error"]["status"], 500);
        assert_eq!(envelope["error"]["request_id"], "req-9");
        assert_eq!(envelope["error"]["provider_error"]["type"], "server_error");
        assert!(envelope["error"]["timestamp"].is_string());

        let plain = HaloError::Unauthorized.envelope("req-10");
        assert!(plain["error"].get("provider_error").is_none());
    }

    #[test]
    fn test_config_is_operator_error() {
        assert_eq!(HaloError::Config("no key".into()).status_code(), 500);
    }
}
