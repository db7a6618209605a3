//! Response-direction conversion: Gemini generateContent -> OpenAI chat
//! completion. The `model` echoed to the client is the name it asked for,
//! not the mapped upstream name.

use chrono::Utc;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::proxy::mappers::gemini::{
    self, Candidate, GenerateContentResponse,
};
use crate::proxy::mappers::openai::models::{
    ChatCompletionResponse, Choice, ResponseMessage, Usage,
};

pub fn transform_response(
    resp: &GenerateContentResponse,
    model: &str,
) -> AppResult<ChatCompletionResponse> {
    if resp.candidates.is_empty() {
        return Err(AppError::upstream("No candidates in upstream response"));
    }

    let choices = resp.candidates.iter().map(convert_candidate).collect();

    let usage = resp
        .usage_metadata
        .map(|meta| Usage {
            prompt_tokens: meta.prompt_token_count,
            completion_tokens: meta.candidates_token_count,
            total_tokens: meta.total_token_count,
        })
        .unwrap_or_default();

    Ok(ChatCompletionResponse {
        id: generate_response_id(),
        object: "chat.completion".to_string(),
        created: created_timestamp(),
        model: model.to_string(),
        choices,
        usage,
    })
}

fn convert_candidate(candidate: &Candidate) -> Choice {
    Choice {
        index: candidate.index,
        message: ResponseMessage {
            role: "assistant".to_string(),
            content: candidate.text().to_string(),
        },
        finish_reason: map_finish_reason(candidate.finish_reason.as_deref().unwrap_or(""))
            .to_string(),
    }
}

pub fn map_finish_reason(reason: &str) -> &'static str {
    match reason {
        gemini::FINISH_REASON_MAX_TOKENS => "length",
        gemini::FINISH_REASON_SAFETY | gemini::FINISH_REASON_RECITATION => "content_filter",
        // STOP and anything unrecognized both read as a normal stop.
        _ => "stop",
    }
}

/// `chatcmpl-` followed by 32 hex characters of randomness.
pub fn generate_response_id() -> String {
    format!("chatcmpl-{}", Uuid::new_v4().simple())
}

pub fn created_timestamp() -> i64 {
    Utc::now().timestamp()
}
