//! Schema checks for inbound requests. Every failing field is collected so
//! the caller sees the whole list in one response.

use crate::error::{FieldError, HaloError, Result};
use crate::types::{ChatRequest, ImageGenerationRequest, Role};

const MAX_N: u32 = 128;

fn check_range(
    errors: &mut Vec<FieldError>,
    path: &str,
    value: Option<f32>,
    min: f32,
    max: f32,
) {
    let Some(v) = value else { return };
    if v.is_nan() {
        errors.push(FieldError::new(path, "must be a number"));
    } else if v < min {
        errors.push(FieldError::new(path, format!("must be >= {min}")));
    } else if v > max {
        errors.push(FieldError::new(path, format!("must be <= {max}")));
    }
}

fn finish(errors: Vec<FieldError>) -> Result<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(HaloError::Validation(errors))
    }
}

impl ChatRequest {
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        check_range(&mut errors, "temperature", self.temperature, 0.0, 2.0);
        check_range(&mut errors, "top_p", self.top_p, 0.0, 1.0);
        check_range(&mut errors, "presence_penalty", self.presence_penalty, -2.0, 2.0);
        check_range(&mut errors, "frequency_penalty", self.frequency_penalty, -2.0, 2.0);

        if self.max_tokens == Some(0) {
            errors.push(FieldError::new("max_tokens", "must be >= 1"));
        }
        if self.max_completion_tokens == Some(0) {
            errors.push(FieldError::new("max_completion_tokens", "must be >= 1"));
        }
        match self.n {
            Some(0) => errors.push(FieldError::new("n", "must be >= 1")),
            Some(n) if n > MAX_N => {
                errors.push(FieldError::new("n", format!("must be <= {MAX_N}")))
            }
            _ => {}
        }

        if self.model.as_deref().is_some_and(|m| m.trim().is_empty()) {
            errors.push(FieldError::new("model", "must not be blank"));
        }

        if self.messages.is_empty() {
            errors.push(FieldError::new("messages", "must contain at least 1 item"));
        }
        for (i, message) in self.messages.iter().enumerate() {
            let empty_content = message.content.as_ref().map_or(true, |c| c.is_empty());
            if empty_content && !message.has_attachments() && !message.has_tool_calls() {
                errors.push(FieldError::new(
                    format!("messages[{i}].content"),
                    "must not be empty when no attachments are given",
                ));
            }
            if message.role == Role::Tool && message.tool_call_id.is_none() {
                errors.push(FieldError::new(
                    format!("messages[{i}].tool_call_id"),
                    "is required for tool messages",
                ));
            }
        }

        finish(errors)
    }
}

impl ImageGenerationRequest {
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        if self.prompt.trim().is_empty() {
            errors.push(FieldError::new("prompt", "must not be empty"));
        }
        if self.n == Some(0) {
            errors.push(FieldError::new("n", "must be >= 1"));
        }
        if let Some(format) = self.response_format.as_deref() {
            if format != "url" && format != "b64_json" {
                errors.push(FieldError::new("response_format", "must be one of: url, b64_json"));
            }
        }
        finish(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChatMessage;

    fn request() -> ChatRequest {
        ChatRequest {
            model: Some("gpt-4o".into()),
            messages: vec![ChatMessage::user("Hi")],
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_request() {
        assert!(request().validate().is_ok());
    }

    #[test]
    fn test_errors_are_aggregated() {
        let req = ChatRequest {
            temperature: Some(3.0),
            messages: Vec::new(),
            ..request()
        };
        let err = req.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "temperature: must be <= 2; messages: must contain at least 1 item"
        );
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn test_message_rules() {
        let mut tool = ChatMessage::new(Role::Tool, "42");
        tool.tool_call_id = None;
        let req = ChatRequest {
            messages: vec![ChatMessage::user(""), tool],
            n: Some(500),
            ..request()
        };
        let HaloError::Validation(fields) = req.validate().unwrap_err() else {
            panic!("expected validation error");
        };
        let paths: Vec<&str> = fields.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["n", "messages[0].content", "messages[1].tool_call_id"]);
    }

    #[test]
    fn test_image_request() {
        let req = ImageGenerationRequest {
            prompt: " ".into(),
            response_format: Some("png".into()),
            ..Default::default()
        };
        let HaloError::Validation(fields) = req.validate().unwrap_err() else {
            panic!("expected validation error");
        };
        assert_eq!(fields.len(), 2);
    }
}
