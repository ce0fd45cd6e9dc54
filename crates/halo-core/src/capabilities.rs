//! Static model capability registry.
//!
//! Lookup order: exact id, case-insensitive id, then the longest registered
//! id that is a prefix of the requested one. The prefix step lets deployment
//! names with date or version suffixes (`gpt-4o-2024-08-06`) resolve to
//! their base record.

use serde::Serialize;

use crate::error::{HaloError, Result};
use crate::types::ChatRequest;

/// Capability flags and limits for one model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModelCapabilities {
    pub chat: bool,
    pub vision: bool,
    pub image_generate: bool,
    pub tool_calls: bool,
    pub json_mode: bool,
    pub reasoning: bool,
    pub max_context_tokens: u32,
    pub max_output_tokens: u32,
    pub supports_streaming: bool,
}

/// A single capability that a request may require.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Chat,
    Vision,
    ImageGenerate,
    ToolCalls,
    JsonMode,
    Reasoning,
    MaxContextTokens,
    MaxOutputTokens,
    Streaming,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Vision => "vision",
            Self::ImageGenerate => "image generation",
            Self::ToolCalls => "tool calls",
            Self::JsonMode => "JSON mode",
            Self::Reasoning => "reasoning",
            Self::MaxContextTokens => "max_context_tokens",
            Self::MaxOutputTokens => "max_output_tokens",
            Self::Streaming => "streaming",
        }
    }
}

impl ModelCapabilities {
    pub fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::Chat => self.chat,
            Capability::Vision => self.vision,
            Capability::ImageGenerate => self.image_generate,
            Capability::ToolCalls => self.tool_calls,
            Capability::JsonMode => self.json_mode,
            Capability::Reasoning => self.reasoning,
            Capability::MaxContextTokens => self.max_context_tokens > 0,
            Capability::MaxOutputTokens => self.max_output_tokens > 0,
            Capability::Streaming => self.supports_streaming,
        }
    }
}

const fn chat_model(
    vision: bool,
    reasoning: bool,
    max_context_tokens: u32,
    max_output_tokens: u32,
) -> ModelCapabilities {
    ModelCapabilities {
        chat: true,
        vision,
        image_generate: false,
        tool_calls: true,
        json_mode: true,
        reasoning,
        max_context_tokens,
        max_output_tokens,
        supports_streaming: true,
    }
}

const IMAGE_MODEL: ModelCapabilities = ModelCapabilities {
    chat: false,
    vision: false,
    image_generate: true,
    tool_calls: false,
    json_mode: false,
    reasoning: false,
    max_context_tokens: 0,
    max_output_tokens: 0,
    supports_streaming: false,
};

/// Assumed for models outside the registry when they are allowed at all:
/// plain chat and streaming, nothing else.
pub const UNREGISTERED_MODEL: ModelCapabilities = ModelCapabilities {
    chat: true,
    vision: false,
    image_generate: false,
    tool_calls: false,
    json_mode: false,
    reasoning: false,
    max_context_tokens: 0,
    max_output_tokens: 0,
    supports_streaming: true,
};

static REGISTRY: &[(&str, ModelCapabilities)] = &[
    // OpenAI / Azure OpenAI
    ("gpt-4o", chat_model(true, false, 128_000, 16_384)),
    ("gpt-4o-mini", chat_model(true, false, 128_000, 16_384)),
    ("gpt-4.1", chat_model(true, false, 1_047_576, 32_768)),
    ("gpt-4.1-mini", chat_model(true, false, 1_047_576, 32_768)),
    ("gpt-4.1-nano", chat_model(true, false, 1_047_576, 32_768)),
    ("gpt-5", chat_model(true, true, 400_000, 128_000)),
    ("gpt-5-mini", chat_model(true, true, 400_000, 128_000)),
    ("gpt-5-nano", chat_model(true, true, 400_000, 128_000)),
    ("gpt-5.1", chat_model(true, true, 400_000, 128_000)),
    ("o1", chat_model(true, true, 200_000, 100_000)),
    ("o3", chat_model(true, true, 200_000, 100_000)),
    ("o3-mini", chat_model(false, true, 200_000, 100_000)),
    ("o4-mini", chat_model(true, true, 200_000, 100_000)),
    ("gpt-35-turbo", chat_model(false, false, 16_385, 4_096)),
    ("gpt-image-1", IMAGE_MODEL),
    ("dall-e-3", IMAGE_MODEL),
    // Azure AI Foundry model-as-a-service
    (
        "Phi-4",
        ModelCapabilities {
            tool_calls: false,
            ..chat_model(false, false, 16_384, 4_096)
        },
    ),
    ("Phi-4-multimodal-instruct", chat_model(true, false, 128_000, 4_096)),
    ("Llama-3.3-70B-Instruct", chat_model(false, false, 128_000, 4_096)),
    ("Mistral-Large-2411", chat_model(false, false, 128_000, 4_096)),
    (
        "DeepSeek-R1",
        ModelCapabilities {
            tool_calls: false,
            json_mode: false,
            ..chat_model(false, true, 128_000, 32_768)
        },
    ),
];

/// Look up the capabilities of a model.
pub fn get_capabilities(model_id: &str) -> Option<ModelCapabilities> {
    if let Some((_, caps)) = REGISTRY.iter().find(|(id, _)| *id == model_id) {
        return Some(*caps);
    }

    let lowered = model_id.to_ascii_lowercase();
    if let Some((_, caps)) = REGISTRY
        .iter()
        .find(|(id, _)| id.to_ascii_lowercase() == lowered)
    {
        return Some(*caps);
    }

    REGISTRY
        .iter()
        .filter(|(id, _)| lowered.starts_with(&id.to_ascii_lowercase()))
        .max_by_key(|(id, _)| id.len())
        .map(|(_, caps)| *caps)
}

/// `false` for unknown models and for known models lacking the capability.
pub fn has_capability(model_id: &str, capability: Capability) -> bool {
    get_capabilities(model_id).is_some_and(|caps| caps.supports(capability))
}

/// All registered models, in registration order.
pub fn registered_models() -> impl Iterator<Item = (&'static str, ModelCapabilities)> {
    REGISTRY.iter().map(|(id, caps)| (*id, *caps))
}

/// Reject a request whose features the model lacks. Runs before any
/// provider request is built.
pub fn admit(model: &str, caps: &ModelCapabilities, request: &ChatRequest) -> Result<()> {
    let required = [
        (true, Capability::Chat),
        (request.has_images(), Capability::Vision),
        (request.has_tools(), Capability::ToolCalls),
        (request.wants_json(), Capability::JsonMode),
        (request.stream, Capability::Streaming),
    ];
    match required
        .iter()
        .find(|(needed, capability)| *needed && !caps.supports(*capability))
    {
        Some((_, capability)) => Err(HaloError::capability(model, capability.as_str())),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_is_case_insensitive_and_prefix_tolerant() {
        let base = get_capabilities("gpt-4o").unwrap();
        assert_eq!(get_capabilities("GPT-4O"), Some(base));
        assert_eq!(get_capabilities("gpt-4o-2024-08-06"), Some(base));
    }

    #[test]
    fn test_longest_prefix_wins() {
        // gpt-4o-mini must not resolve to the gpt-4o record
        let mini = get_capabilities("gpt-4o-mini-2024-07-18").unwrap();
        assert_eq!(mini, get_capabilities("gpt-4o-mini").unwrap());

        let o3_mini = get_capabilities("o3-mini-2025-01-31").unwrap();
        assert!(!o3_mini.vision);
        assert!(get_capabilities("o3-2025-04-16").unwrap().vision);
    }

    #[test]
    fn test_unknown_model() {
        assert!(get_capabilities("totally-made-up").is_none());
        assert!(!has_capability("totally-made-up", Capability::Chat));
    }

    #[test]
    fn test_has_capability_never_panics_for_missing_flags() {
        assert!(has_capability("gpt-4o", Capability::Vision));
        assert!(!has_capability("gpt-4o", Capability::ImageGenerate));
        assert!(!has_capability("Phi-4", Capability::ToolCalls));
        assert!(has_capability("deepseek-r1", Capability::Reasoning));
    }

    #[test]
    fn test_numeric_capabilities() {
        assert!(has_capability("gpt-5", Capability::MaxContextTokens));
        assert!(has_capability("gpt-5", Capability::MaxOutputTokens));
        assert!(!has_capability("dall-e-3", Capability::MaxOutputTokens));
    }

    #[test]
    fn test_registry_keys_are_unique() {
        let mut ids: Vec<String> = registered_models()
            .map(|(id, _)| id.to_ascii_lowercase())
            .collect();
        let total = ids.len();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), total);
    }

    #[test]
    fn test_admission() {
        use crate::types::ChatMessage;

        let base = ChatRequest {
            messages: vec![ChatMessage::user("hi")],
            ..Default::default()
        };
        let phi = get_capabilities("Phi-4").unwrap();
        assert!(admit("Phi-4", &phi, &base).is_ok());

        let with_tools = ChatRequest {
            tools: Some(vec![serde_json::json!({"type": "function"})]),
            ..base.clone()
        };
        let err = admit("Phi-4", &phi, &with_tools).unwrap_err();
        assert_eq!(err.to_string(), "Model Phi-4 does not support tool calls");
        assert_eq!(err.status_code(), 400);

        let dalle = get_capabilities("dall-e-3").unwrap();
        assert!(admit("dall-e-3", &dalle, &base).is_err());

        let json = ChatRequest {
            response_format: Some(serde_json::json!({"type": "json_object"})),
            ..base
        };
        assert!(admit("DeepSeek-R1", &get_capabilities("DeepSeek-R1").unwrap(), &json).is_err());
        assert!(admit("anything", &UNREGISTERED_MODEL, &json).is_err());
        assert!(admit("anything", &UNREGISTERED_MODEL, &ChatRequest { response_format: None, ..json }).is_ok());
    }
}
