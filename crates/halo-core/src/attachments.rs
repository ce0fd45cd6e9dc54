//! Attachment normalization.
//!
//! Inbound: `attachments` on a message become `image_url` content parts and
//! the field is dropped before anything reaches a provider.
//! Outbound: image generation results become attachment objects.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::capabilities::ModelCapabilities;
use crate::error::{HaloError, Result};
use crate::types::{
    Attachment, AttachmentKind, ChatMessage, ContentPart, ImageGenerationResponse, ImageUrl,
    MessageContent,
};

/// Upper bound on raw attachment bytes (20 MiB).
pub const MAX_ATTACHMENT_BYTES: u64 = 20 * 1024 * 1024;

pub const ALLOWED_IMAGE_TYPES: &[&str] = &[
    "image/png",
    "image/jpeg",
    "image/jpg",
    "image/gif",
    "image/webp",
];

/// Check a single attachment against type, source, and size rules.
pub fn validate_attachment(attachment: &Attachment) -> Result<()> {
    if attachment.kind != AttachmentKind::Image {
        return Err(HaloError::Attachment(
            "only image attachments are supported".to_string(),
        ));
    }

    let mime = attachment.mime_type.to_ascii_lowercase();
    if !ALLOWED_IMAGE_TYPES.contains(&mime.as_str()) {
        return Err(HaloError::Attachment(format!(
            "unsupported image type '{}' (allowed: {})",
            attachment.mime_type,
            ALLOWED_IMAGE_TYPES.join(", ")
        )));
    }

    match (&attachment.data, &attachment.url) {
        (Some(_), Some(_)) => {
            return Err(HaloError::Attachment(
                "image attachment must carry either data or url, not both".to_string(),
            ))
        }
        (None, None) => {
            return Err(HaloError::Attachment(
                "image attachment must carry data or url".to_string(),
            ))
        }
        _ => {}
    }

    // A declared size never hides a larger inline payload.
    let inline = attachment.data.as_deref().map_or(0, decoded_len);
    let size = attachment.size_bytes.unwrap_or(0).max(inline);
    if size > MAX_ATTACHMENT_BYTES {
        return Err(HaloError::Attachment(format!(
            "attachment is {size} bytes; limit is {MAX_ATTACHMENT_BYTES}"
        )));
    }

    Ok(())
}

/// Decoded length of a base64 payload, computed without decoding.
fn decoded_len(data: &str) -> u64 {
    let trimmed = data.trim();
    let padding = trimmed.bytes().rev().take_while(|b| *b == b'=').count() as u64;
    let len = trimmed.len() as u64;
    let tail = match len % 4 {
        2 => 1,
        3 => 2,
        _ => 0,
    };
    ((len / 4) * 3 + tail).saturating_sub(padding)
}

/// The URL a provider should fetch: the literal URL, or a data URI.
pub fn attachment_url(attachment: &Attachment) -> String {
    match (&attachment.url, &attachment.data) {
        (Some(url), _) => url.clone(),
        (None, Some(data)) => format!("data:{};base64,{}", attachment.mime_type, data),
        (None, None) => String::new(),
    }
}

/// Content parts for a message: original text first (when not blank),
/// then one `image_url` part per image attachment.
pub fn content_parts(message: &ChatMessage) -> Vec<ContentPart> {
    let mut parts = match &message.content {
        Some(MessageContent::Parts(existing)) => existing.clone(),
        Some(MessageContent::Text(text)) if !text.trim().is_empty() => {
            vec![ContentPart::Text { text: text.clone() }]
        }
        _ => Vec::new(),
    };

    for attachment in message.attachments.iter().flatten() {
        if attachment.kind == AttachmentKind::Image {
            parts.push(ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: attachment_url(attachment),
                    detail: Some("auto".to_string()),
                },
            });
        }
    }
    parts
}

/// Fold every message's attachments into its content.
pub fn normalize(
    messages: Vec<ChatMessage>,
    model: &str,
    capabilities: &ModelCapabilities,
) -> Result<Vec<ChatMessage>> {
    messages
        .into_iter()
        .map(|message| {
            if !message.has_attachments() {
                return Ok(ChatMessage {
                    attachments: None,
                    ..message
                });
            }

            let attachments = message.attachments.as_deref().unwrap_or_default();
            if !capabilities.vision && attachments.iter().any(|a| a.kind == AttachmentKind::Image) {
                return Err(HaloError::capability(model, "image attachments"));
            }
            for attachment in attachments {
                validate_attachment(attachment)?;
            }

            let parts = content_parts(&message);
            Ok(ChatMessage {
                content: Some(MessageContent::Parts(parts)),
                attachments: None,
                ..message
            })
        })
        .collect()
}

/// Turn image generation output into attachments. A literal URL is
/// preferred over inline base64.
pub fn from_image_generation_response(response: &ImageGenerationResponse) -> Vec<Attachment> {
    response
        .data
        .iter()
        .enumerate()
        .filter_map(|(i, image)| {
            let filename = Some(synthesize_filename(image.url.as_deref(), response.created, i));
            if let Some(url) = &image.url {
                Some(Attachment {
                    kind: AttachmentKind::Image,
                    mime_type: mime_from_name(url).to_string(),
                    data: None,
                    url: Some(url.clone()),
                    filename,
                    size_bytes: None,
                })
            } else {
                image.b64_json.as_ref().map(|b64| Attachment {
                    kind: AttachmentKind::Image,
                    mime_type: "image/png".to_string(),
                    size_bytes: Some(
                        STANDARD
                            .decode(b64.trim())
                            .map(|bytes| bytes.len() as u64)
                            .unwrap_or_else(|_| decoded_len(b64)),
                    ),
                    data: Some(b64.clone()),
                    url: None,
                    filename,
                })
            }
        })
        .collect()
}

fn synthesize_filename(url: Option<&str>, created: i64, index: usize) -> String {
    let from_url = url
        .and_then(|u| u.split('?').next())
        .and_then(|u| u.rsplit('/').next())
        .filter(|name| name.contains('.') && name.len() <= 128);
    match from_url {
        Some(name) => name.to_string(),
        None => format!("generated-{created}-{index}.png"),
    }
}

fn mime_from_name(name: &str) -> &'static str {
    let path = name.split('?').next().unwrap_or_default().to_ascii_lowercase();
    if path.ends_with(".jpg") || path.ends_with(".jpeg") {
        "image/jpeg"
    } else if path.ends_with(".webp") {
        "image/webp"
    } else if path.ends_with(".gif") {
        "image/gif"
    } else {
        "image/png"
    }
}
