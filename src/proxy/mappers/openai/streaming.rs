//! Chunk-direction conversion for streaming responses. One upstream chunk
//! becomes one OpenAI `chat.completion.chunk`; the id stays stable for the
//! whole stream.

use crate::proxy::mappers::gemini::GenerateContentResponse;
use crate::proxy::mappers::openai::models::{ChatCompletionChunk, ChunkChoice, Delta};
use crate::proxy::mappers::openai::response::map_finish_reason;

/// Converts one upstream streaming chunk. A chunk with no candidates yields
/// an empty delta (keepalive shape), never an error.
pub fn transform_stream_chunk(
    chunk: &GenerateContentResponse,
    model: &str,
    stream_id: &str,
    created: i64,
    index: u32,
) -> ChatCompletionChunk {
    if chunk.candidates.is_empty() {
        return ChatCompletionChunk {
            id: stream_id.to_string(),
            object: "chat.completion.chunk".to_string(),
            created,
            model: model.to_string(),
            choices: vec![ChunkChoice {
                index,
                delta: Delta::default(),
                finish_reason: None,
            }],
        };
    }

    let choices = chunk
        .candidates
        .iter()
        .map(|candidate| ChunkChoice {
            index: candidate.index,
            delta: Delta {
                role: None,
                content: Some(candidate.text().to_string()),
            },
            finish_reason: candidate
                .finish_reason
                .as_deref()
                .filter(|reason| !reason.is_empty())
                .map(|reason| map_finish_reason(reason).to_string()),
        })
        .collect();

    ChatCompletionChunk {
        id: stream_id.to_string(),
        object: "chat.completion.chunk".to_string(),
        created,
        model: model.to_string(),
        choices,
    }
}
