//! Request-direction conversion: OpenAI chat completions -> Gemini
//! generateContent. Pure functions, no IO.

use crate::error::{AppError, AppResult};
use crate::models::config::ModelSettingsConfig;
use crate::proxy::mappers::gemini::{
    Content, FileData, GenerateContentRequest, GenerationConfig, InlineData, Part, ThinkingConfig,
};
use crate::proxy::mappers::openai::models::{
    ChatCompletionRequest, ContentPart, ImageUrl, Message, MessageContent,
};

pub fn transform_request(req: &ChatCompletionRequest) -> AppResult<GenerateContentRequest> {
    if req.messages.is_empty() {
        return Err(AppError::invalid_messages("Messages array cannot be empty"));
    }

    let (contents, system_instruction) = convert_messages(&req.messages)?;

    Ok(GenerateContentRequest {
        contents,
        system_instruction,
        generation_config: convert_generation_config(req),
    })
}

/// Converts the message list, lifting a `system` message (wherever it
/// appears) into the system instruction.
fn convert_messages(messages: &[Message]) -> AppResult<(Vec<Content>, Option<Content>)> {
    let mut contents = Vec::with_capacity(messages.len());
    let mut system_instruction = None;

    for message in messages {
        let parts = convert_message_parts(message)?;

        if message.role == "system" {
            system_instruction = Some(Content { parts, role: None });
            continue;
        }

        let role = match message.role.as_str() {
            "assistant" => "model",
            "user" => "user",
            other => {
                return Err(AppError::invalid_messages(format!("Invalid role: {other}")));
            }
        };

        contents.push(Content {
            parts,
            role: Some(role.to_string()),
        });
    }

    Ok((contents, system_instruction))
}

fn convert_message_parts(message: &Message) -> AppResult<Vec<Part>> {
    match &message.content {
        MessageContent::Text(text) => Ok(vec![Part::text(text.clone())]),
        MessageContent::Parts(parts) => parts.iter().map(convert_content_part).collect(),
    }
}

fn convert_content_part(part: &ContentPart) -> AppResult<Part> {
    match part {
        ContentPart::Text { text } => Ok(Part::text(text.clone())),
        ContentPart::ImageUrl { image_url } => convert_image_url(image_url),
    }
}

fn convert_image_url(image: &ImageUrl) -> AppResult<Part> {
    if image.url.starts_with("data:") {
        return parse_data_uri(&image.url);
    }

    Ok(Part {
        file_data: Some(FileData {
            mime_type: infer_mime_type(&image.url).to_string(),
            file_uri: image.url.clone(),
        }),
        ..Part::default()
    })
}

/// Splits a `data:[<mediatype>][;base64],<data>` URI into mime type and
/// payload. The payload is forwarded as-is; Gemini expects base64.
fn parse_data_uri(uri: &str) -> AppResult<Part> {
    let rest = uri.strip_prefix("data:").unwrap_or(uri);
    let Some((media_info, data)) = rest.split_once(',') else {
        return Err(AppError::invalid_messages("Invalid data URI format"));
    };

    let mime_type = media_info.strip_suffix(";base64").unwrap_or(media_info);
    let mime_type = if mime_type.is_empty() {
        "application/octet-stream"
    } else {
        mime_type
    };

    Ok(Part {
        inline_data: Some(InlineData {
            mime_type: mime_type.to_string(),
            data: data.to_string(),
        }),
        ..Part::default()
    })
}

fn infer_mime_type(url: &str) -> &'static str {
    let lower = url.to_ascii_lowercase();
    if lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
        "image/jpeg"
    } else if lower.ends_with(".png") {
        "image/png"
    } else if lower.ends_with(".gif") {
        "image/gif"
    } else if lower.ends_with(".webp") {
        "image/webp"
    } else {
        "image/jpeg"
    }
}

/// The config sub-object is omitted entirely when the request sets none of
/// the generation parameters.
fn convert_generation_config(req: &ChatCompletionRequest) -> Option<GenerationConfig> {
    let mut config = GenerationConfig {
        temperature: req.temperature,
        top_p: req.top_p,
        max_output_tokens: req.max_tokens,
        candidate_count: req.n,
        ..GenerationConfig::default()
    };

    if let Some(stop) = req.stop.as_ref().filter(|stop| !stop.is_empty()) {
        config.stop_sequences = Some(stop.to_vec());
    }

    if config.is_empty() {
        None
    } else {
        Some(config)
    }
}

/// Layers the stored generation defaults under the request. Every field is
/// written only when the request left it unset; request > overlay > upstream
/// default. Thinking level and media resolution have no OpenAI analog and
/// come only from the overlay.
pub fn apply_model_settings(req: &mut GenerateContentRequest, settings: &ModelSettingsConfig) {
    if req.system_instruction.is_none() {
        if let Some(prompt) = settings.system_prompt.as_ref().filter(|p| !p.is_empty()) {
            req.system_instruction = Some(Content {
                parts: vec![Part::text(prompt.clone())],
                role: None,
            });
        }
    }

    let config = req.generation_config.get_or_insert_with(GenerationConfig::default);

    if config.temperature.is_none() {
        config.temperature = settings.temperature;
    }
    if config.top_p.is_none() {
        config.top_p = settings.top_p;
    }
    if config.top_k.is_none() {
        config.top_k = settings.top_k;
    }
    if config.max_output_tokens.is_none() {
        config.max_output_tokens = settings.max_output_tokens;
    }

    if let Some(level) = settings.thinking_level.as_ref().filter(|l| !l.is_empty()) {
        config.thinking_config = Some(ThinkingConfig {
            thinking_level: Some(level.clone()),
        });
    }
    if let Some(resolution) = settings
        .media_resolution
        .as_ref()
        .filter(|r| !r.is_empty())
    {
        config.media_resolution = Some(resolution.clone());
    }

    if config.is_empty() {
        req.generation_config = None;
    }
}
