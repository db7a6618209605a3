//! OpenAI-compatible surface: chat completions and the model catalogue.

use axum::body::Bytes;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{AppError, AppResult};
use crate::proxy::common::model_mapping::advertised_models;
use crate::proxy::handlers::streaming::sse_response;
use crate::proxy::mappers::openai::models::{
    ChatCompletionRequest, ModelInfo, ModelsResponse,
};
use crate::proxy::state::AppState;

/// POST /v1/chat/completions. The body is parsed by hand so malformed JSON
/// produces the error envelope instead of a bare 400.
pub async fn handle_chat_completions(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, AppError> {
    let req: ChatCompletionRequest = serde_json::from_slice(&body)
        .map_err(|err| AppError::invalid_request(format!("Invalid request body: {err}")))?;

    validate_chat_request(&req)?;

    debug!(
        model = %req.model,
        stream = req.stream,
        messages = req.messages.len(),
        "processing chat completion request"
    );

    if req.stream {
        handle_streaming(&state, req).await
    } else {
        let response = state.client.chat_completion(req).await?;
        Ok(Json(response).into_response())
    }
}

async fn handle_streaming(state: &AppState, req: ChatCompletionRequest) -> Result<Response, AppError> {
    let cancel = CancellationToken::new();
    // Errors before the first byte surface as plain status + envelope;
    // from here on the stream is committed at 200.
    let rx = state
        .client
        .chat_completion_stream(req, cancel.clone())
        .await?;
    Ok(sse_response(rx, cancel.drop_guard()))
}

fn validate_chat_request(req: &ChatCompletionRequest) -> AppResult<()> {
    if req.model.is_empty() {
        return Err(AppError::invalid_request("Model field is required").with_param("model"));
    }
    if req.messages.is_empty() {
        return Err(AppError::invalid_messages("Messages array cannot be empty"));
    }
    for (index, message) in req.messages.iter().enumerate() {
        match message.role.as_str() {
            "system" | "user" | "assistant" => {}
            "" => {
                return Err(AppError::invalid_messages(format!(
                    "Message at index {index} is missing role"
                )));
            }
            other => {
                return Err(AppError::invalid_messages(format!("Invalid role: {other}")));
            }
        }
    }
    Ok(())
}

/// GET /v1/models — the static catalogue of ids this proxy accepts.
pub async fn handle_list_models() -> Json<ModelsResponse> {
    let created = Utc::now().timestamp();
    let data = advertised_models()
        .map(|id| ModelInfo {
            id: id.to_string(),
            object: "model".to_string(),
            created,
            owned_by: "google".to_string(),
        })
        .collect();

    Json(ModelsResponse {
        object: "list".to_string(),
        data,
    })
}
