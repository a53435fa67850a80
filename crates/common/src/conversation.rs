//! Conversation normalization: turns heterogeneous wire messages (plain
//! text, null content, typed part arrays with embedded images, tool-call
//! and tool-result roles) into a uniform sequence of [`ConversationMessage`]
//! records ready to hand to the model backend.

use base64::Engine;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::protocol::{MessageContent, RawChatMessage, ToolCall};

const IMAGE_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// A decoded image attachment: RGB8 pixels, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

/// One normalized conversation turn.
#[derive(Debug, Clone, Default)]
pub struct ConversationMessage {
    pub role: String,
    pub content: Option<String>,
    pub tool_calls: Option<Vec<ToolCall>>,
    pub tool_call_id: Option<String>,
    pub name: Option<String>,
    pub reasoning: Option<String>,
    pub images: Vec<DecodedImage>,
}

impl ConversationMessage {
    pub fn text(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: Some(content.into()),
            ..Default::default()
        }
    }
}

/// Normalize a full request message list. Returns the conversation plus all
/// images collected across it, in message order. Rejects an empty result.
pub async fn normalize_conversation(
    messages: &[RawChatMessage],
    http: &reqwest::Client,
) -> Result<(Vec<ConversationMessage>, Vec<DecodedImage>)> {
    let mut conversation = Vec::with_capacity(messages.len());
    let mut all_images = Vec::new();

    for raw in messages {
        for msg in parse_chat_message(raw, http).await? {
            all_images.extend(msg.images.iter().cloned());
            conversation.push(msg);
        }
    }

    if conversation.is_empty() {
        return Err(Error::BadRequest("messages cannot be empty".into()));
    }
    Ok((conversation, all_images))
}

/// Normalize one wire message. Assistant messages carrying tool calls and
/// tool-result messages get role-level handling; everything else goes
/// through content parsing.
pub async fn parse_chat_message(
    message: &RawChatMessage,
    http: &reqwest::Client,
) -> Result<Vec<ConversationMessage>> {
    if message.role == "assistant" {
        if let Some(tool_calls) = &message.tool_calls {
            return Ok(vec![ConversationMessage {
                role: message.role.clone(),
                content: flatten_text_content(message.content.as_ref()),
                tool_calls: Some(tool_calls.clone()),
                reasoning: message.reasoning.clone(),
                ..Default::default()
            }]);
        }
    }

    if message.role == "tool" {
        let tool_call_id = message
            .tool_call_id
            .clone()
            .ok_or_else(|| Error::BadRequest("tool message requires tool_call_id".into()))?;
        return Ok(vec![ConversationMessage {
            role: message.role.clone(),
            content: flatten_text_content(message.content.as_ref()),
            tool_call_id: Some(tool_call_id),
            name: message.name.clone(),
            ..Default::default()
        }]);
    }

    let mut msg = parse_message_content(&message.role, message.content.as_ref(), http).await?;
    msg.reasoning = message.reasoning.clone();
    msg.name = message.name.clone();
    Ok(vec![msg])
}

/// Parse free-form content into one message. Text parts are newline-joined,
/// images are decoded and collected separately, tool-related and unsupported
/// part kinds are skipped. A structurally unrecognized content shape is the
/// one fatal case.
async fn parse_message_content(
    role: &str,
    content: Option<&MessageContent>,
    http: &reqwest::Client,
) -> Result<ConversationMessage> {
    let content = match content {
        None => return Ok(ConversationMessage::text(role, "")),
        Some(MessageContent::Text(text)) => return Ok(ConversationMessage::text(role, text.clone())),
        Some(MessageContent::Parts(parts)) => parts,
        Some(MessageContent::Other(value)) => {
            warn!(role, "unsupported content shape: {}", value);
            return Err(Error::UnsupportedContent(
                "content must be null, a string, or an array of parts".into(),
            ));
        }
    };

    let mut text = String::new();
    let mut images = Vec::new();

    for item in content {
        match item {
            Value::String(piece) => append_line(&mut text, piece),
            Value::Object(part) => {
                let part_type = part.get("type").and_then(Value::as_str).unwrap_or("");
                match part_type {
                    "text" => {
                        let piece = part.get("text").and_then(Value::as_str).unwrap_or("");
                        append_line(&mut text, piece);
                    }
                    "image_url" | "image" => match parse_image_part(part, http).await {
                        Some(image) => {
                            debug!(width = image.width, height = image.height, "parsed image part");
                            images.push(image);
                        }
                        None => warn!("failed to parse image content part"),
                    },
                    // Tool parts are handled at the role level
                    "tool_use" | "tool_result" | "tool_calls" | "function" => {
                        debug!(part_type, "skipping tool-related content part");
                    }
                    "audio" | "audio_url" | "video" | "video_url" | "input_audio" => {
                        warn!(part_type, "multimodal content type not supported");
                    }
                    "refusal" => {
                        if let Some(refusal) = part.get("refusal").and_then(Value::as_str) {
                            if !refusal.is_empty() {
                                append_line(&mut text, refusal);
                            }
                        }
                    }
                    other => warn!(part_type = other, "skipping unknown content part type"),
                }
            }
            other => warn!("skipping unsupported content part: {}", other),
        }
    }

    Ok(ConversationMessage {
        role: role.to_string(),
        content: Some(text),
        images,
        ..Default::default()
    })
}

fn append_line(text: &mut String, piece: &str) {
    if !text.is_empty() {
        text.push('\n');
    }
    text.push_str(piece);
}

/// Extract just the text of a content field, concatenated without
/// separators. Used when a role-level rule needs flat text and the part
/// structure was already consumed elsewhere.
pub fn flatten_text_content(content: Option<&MessageContent>) -> Option<String> {
    match content {
        None => None,
        Some(MessageContent::Text(text)) => Some(text.clone()),
        Some(MessageContent::Parts(parts)) => {
            let mut out = String::new();
            for item in parts {
                match item {
                    Value::String(piece) => out.push_str(piece),
                    Value::Object(part) => {
                        if part.get("type").and_then(Value::as_str) == Some("text") {
                            if let Some(piece) = part.get("text").and_then(Value::as_str) {
                                out.push_str(piece);
                            }
                        }
                    }
                    _ => {}
                }
            }
            if out.is_empty() {
                None
            } else {
                Some(out)
            }
        }
        Some(MessageContent::Other(_)) => None,
    }
}

/// Decode an image content part. Supports `image_url` parts carrying data
/// URLs or http(s) URLs, and `image` parts carrying bare base64. Returns
/// None on any failure; image problems are never fatal to the request.
async fn parse_image_part(
    part: &serde_json::Map<String, Value>,
    http: &reqwest::Client,
) -> Option<DecodedImage> {
    let part_type = part.get("type").and_then(Value::as_str).unwrap_or("");

    if part_type == "image_url" {
        let url = match part.get("image_url") {
            Some(Value::String(url)) => url.clone(),
            Some(Value::Object(obj)) => obj
                .get("url")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
            _ => String::new(),
        };
        if url.is_empty() {
            warn!("empty image URL");
            return None;
        }

        if let Some(encoded) = url.strip_prefix("data:") {
            let encoded = encoded.split_once(',').map(|(_, data)| data)?;
            return decode_base64_image(encoded);
        }
        if url.starts_with("http://") || url.starts_with("https://") {
            return fetch_image(&url, http).await;
        }
        warn!("unsupported image URL scheme: {}", truncate(&url, 50));
        return None;
    }

    if part_type == "image" {
        let encoded = part.get("image").and_then(Value::as_str).unwrap_or("");
        if !encoded.is_empty() {
            return decode_base64_image(encoded);
        }
    }

    None
}

async fn fetch_image(url: &str, http: &reqwest::Client) -> Option<DecodedImage> {
    let response = http
        .get(url)
        .timeout(IMAGE_FETCH_TIMEOUT)
        .send()
        .await
        .and_then(|r| r.error_for_status());
    match response {
        Ok(response) => match response.bytes().await {
            Ok(bytes) => decode_image_bytes(&bytes),
            Err(e) => {
                warn!("failed to read image body from {}: {}", truncate(url, 50), e);
                None
            }
        },
        Err(e) => {
            warn!("failed to download image from {}: {}", truncate(url, 50), e);
            None
        }
    }
}

fn decode_base64_image(encoded: &str) -> Option<DecodedImage> {
    match base64::engine::general_purpose::STANDARD.decode(encoded.trim()) {
        Ok(bytes) => decode_image_bytes(&bytes),
        Err(e) => {
            warn!("failed to decode base64 image: {}", e);
            None
        }
    }
}

fn decode_image_bytes(bytes: &[u8]) -> Option<DecodedImage> {
    match image::load_from_memory(bytes) {
        Ok(img) => {
            let rgb = img.to_rgb8();
            Some(DecodedImage {
                width: rgb.width(),
                height: rgb.height(),
                pixels: rgb.into_raw(),
            })
        }
        Err(e) => {
            warn!("failed to decode image bytes: {}", e);
            None
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
