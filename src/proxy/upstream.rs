//! Dispatch client for the Gemini API: one upstream call per client call,
//! key acquisition and outcome reporting around every dispatch.
//!
//! Ordering rule: on any failed dispatch the pool hears `report_failure`
//! before `release`. Streams additionally guarantee the key is released
//! exactly once and the event channel closes exactly once.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, AppResult};
use crate::models::config::{ModelSettingsConfig, UpstreamConfig};
use crate::models::key::ApiKey;
use crate::proxy::common::model_mapping::map_model_name;
use crate::proxy::mappers::gemini::{
    GenerateContentRequest, GenerateContentResponse, ModelListResponse, UpstreamErrorResponse,
    UsageMetadata,
};
use crate::proxy::mappers::openai::{
    apply_model_settings, created_timestamp, generate_response_id, transform_request,
    transform_response, transform_stream_chunk, ChatCompletionChunk, ChatCompletionRequest,
    ChatCompletionResponse,
};
use crate::proxy::pool::KeyProvider;

/// One event on a streaming response: exactly one of a chunk, a terminal
/// error, or the done marker.
#[derive(Debug)]
pub enum StreamEvent {
    Chunk(ChatCompletionChunk),
    Error(AppError),
    Done,
}

enum StreamOutcome {
    Success,
    Failure(AppError),
}

#[derive(Debug, Clone, Serialize)]
pub struct KeyProbeResult {
    pub valid: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct GeminiClient {
    http: reqwest::Client,
    pool: Arc<dyn KeyProvider>,
    base_url: String,
    request_timeout: Duration,
    model_settings: ModelSettingsConfig,
}

impl GeminiClient {
    pub fn new(
        pool: Arc<dyn KeyProvider>,
        config: &UpstreamConfig,
        model_settings: ModelSettingsConfig,
    ) -> AppResult<Self> {
        // The client-level timeout covers connection establishment only;
        // blocking calls add a per-request deadline, streams must not.
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .build()
            .map_err(|e| AppError::internal("Failed to build HTTP client").with_cause(e))?;

        Ok(Self {
            http,
            pool,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            request_timeout: Duration::from_secs(config.request_timeout_seconds),
            model_settings,
        })
    }

    /// Blocking chat completion. Runs on a detached task awaited by the
    /// caller so the report-then-release pair executes even when the caller
    /// disconnects mid-flight.
    pub async fn chat_completion(
        self: &Arc<Self>,
        req: ChatCompletionRequest,
    ) -> AppResult<ChatCompletionResponse> {
        let client = Arc::clone(self);
        match tokio::spawn(async move { client.dispatch_blocking(req).await }).await {
            Ok(result) => result,
            Err(err) => Err(AppError::internal("Dispatch task failed").with_cause(err)),
        }
    }

    async fn dispatch_blocking(&self, req: ChatCompletionRequest) -> AppResult<ChatCompletionResponse> {
        let key = self.pool.acquire()?;

        let gemini_req = match self.build_upstream_request(&req) {
            Ok(gemini_req) => gemini_req,
            Err(err) => {
                // Conversion failures are local: no report, just release.
                self.pool.release(Some(&key));
                return Err(err);
            }
        };

        let url = self.build_url(map_model_name(&req.model), &key.api_key, false);

        let response = match self
            .http
            .post(&url)
            .json(&gemini_req)
            .timeout(self.request_timeout)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                let err = wrap_transport_error(err);
                self.pool.report_failure(&key, &err, &req.model);
                self.pool.release(Some(&key));
                return Err(err);
            }
        };

        let status = response.status();
        if !status.is_success() {
            let err = parse_error_response(status, response).await;
            self.pool.report_failure(&key, &err, &req.model);
            self.pool.release(Some(&key));
            return Err(err);
        }

        let gemini_resp: GenerateContentResponse = match response.json().await {
            Ok(gemini_resp) => gemini_resp,
            Err(err) => {
                let err = AppError::upstream("Failed to parse upstream response").with_cause(err);
                self.pool.report_failure(&key, &err, &req.model);
                self.pool.release(Some(&key));
                return Err(err);
            }
        };

        match transform_response(&gemini_resp, &req.model) {
            Ok(openai_resp) => {
                let usage = gemini_resp.usage_metadata.unwrap_or_default();
                self.pool.report_success(
                    &key,
                    usage.prompt_token_count,
                    usage.candidates_token_count,
                    &req.model,
                );
                self.pool.release(Some(&key));
                Ok(openai_resp)
            }
            Err(err) => {
                // Zero candidates and friends classify as upstream failures.
                self.pool.report_failure(&key, &err, &req.model);
                self.pool.release(Some(&key));
                Err(err)
            }
        }
    }

    /// Streaming chat completion. On success the returned channel is fed by
    /// a producer task that owns the response body and the acquired key and
    /// outlives the caller.
    pub async fn chat_completion_stream(
        self: &Arc<Self>,
        req: ChatCompletionRequest,
        cancel: CancellationToken,
    ) -> AppResult<mpsc::Receiver<StreamEvent>> {
        let key = self.pool.acquire()?;

        let gemini_req = match self.build_upstream_request(&req) {
            Ok(gemini_req) => gemini_req,
            Err(err) => {
                self.pool.release(Some(&key));
                return Err(err);
            }
        };

        let url = self.build_url(map_model_name(&req.model), &key.api_key, true);

        let response = match self.http.post(&url).json(&gemini_req).send().await {
            Ok(response) => response,
            Err(err) => {
                let err = wrap_transport_error(err);
                self.pool.report_failure(&key, &err, &req.model);
                self.pool.release(Some(&key));
                return Err(err);
            }
        };

        let status = response.status();
        if !status.is_success() {
            let err = parse_error_response(status, response).await;
            self.pool.report_failure(&key, &err, &req.model);
            self.pool.release(Some(&key));
            return Err(err);
        }

        let (tx, rx) = mpsc::channel(16);
        let client = Arc::clone(self);
        let original_model = req.model.clone();
        tokio::spawn(async move {
            client
                .stream_response(response, key, original_model, tx, cancel)
                .await;
        });
        Ok(rx)
    }

    async fn stream_response(
        &self,
        response: reqwest::Response,
        key: ApiKey,
        model: String,
        tx: mpsc::Sender<StreamEvent>,
        cancel: CancellationToken,
    ) {
        let mut usage: Option<UsageMetadata> = None;
        let outcome = pump_stream(response, &model, &tx, &cancel, &mut usage).await;

        let (prompt_tokens, completion_tokens) = usage
            .map(|meta| (meta.prompt_token_count, meta.candidates_token_count))
            .unwrap_or((0, 0));

        match outcome {
            StreamOutcome::Success => {
                self.pool
                    .report_success(&key, prompt_tokens, completion_tokens, &model);
            }
            StreamOutcome::Failure(err) => {
                self.pool.report_failure(&key, &err, &model);
            }
        }
        self.pool.release(Some(&key));
        // Dropping tx here closes the channel, exactly once.
    }

    fn build_upstream_request(&self, req: &ChatCompletionRequest) -> AppResult<GenerateContentRequest> {
        let mut gemini_req = transform_request(req)?;
        apply_model_settings(&mut gemini_req, &self.model_settings);
        Ok(gemini_req)
    }

    fn build_url(&self, model: &str, api_key: &str, stream: bool) -> String {
        let endpoint = if stream {
            "streamGenerateContent"
        } else {
            "generateContent"
        };
        let mut url = format!("{}/models/{model}:{endpoint}?key={api_key}", self.base_url);
        if stream {
            url.push_str("&alt=sse");
        }
        url
    }

    /// Real validation probe: lists models with the candidate key and
    /// measures latency.
    pub async fn probe_key(&self, api_key: &str) -> KeyProbeResult {
        let url = format!("{}/models?key={api_key}&pageSize=50", self.base_url);
        let started = Instant::now();
        let response = self
            .http
            .get(&url)
            .timeout(Duration::from_secs(15))
            .send()
            .await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match response {
            Ok(response) if response.status().is_success() => {
                let models = response
                    .json::<ModelListResponse>()
                    .await
                    .map(|list| list.models.into_iter().map(|m| m.name).collect())
                    .unwrap_or_default();
                KeyProbeResult {
                    valid: true,
                    latency_ms,
                    models,
                    error: None,
                }
            }
            Ok(response) => {
                let status = response.status();
                let err = parse_error_response(status, response).await;
                KeyProbeResult {
                    valid: false,
                    latency_ms,
                    models: Vec::new(),
                    error: Some(err.message),
                }
            }
            Err(err) => KeyProbeResult {
                valid: false,
                latency_ms,
                models: Vec::new(),
                error: Some(wrap_transport_error(err).message),
            },
        }
    }
}

/// Reads the upstream body as newline-framed SSE, forwarding each `data: `
/// payload as one chunk event. Returns how the stream ended; the caller
/// reports the outcome and releases the key.
async fn pump_stream(
    response: reqwest::Response,
    model: &str,
    tx: &mpsc::Sender<StreamEvent>,
    cancel: &CancellationToken,
    usage: &mut Option<UsageMetadata>,
) -> StreamOutcome {
    let mut body = Box::pin(response.bytes_stream());
    let mut buffer = BytesMut::new();
    let stream_id = generate_response_id();
    let created = created_timestamp();
    let mut chunk_index: u32 = 0;

    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => {
                let err = cancellation_error();
                let report = err.shallow_clone();
                let _ = tx.try_send(StreamEvent::Error(err));
                return StreamOutcome::Failure(report);
            }
            item = body.next() => item,
        };

        let bytes = match item {
            Some(Ok(bytes)) => bytes,
            Some(Err(err)) => {
                let err = AppError::upstream("Stream read error").with_cause(err);
                let report = err.shallow_clone();
                let _ = tx.send(StreamEvent::Error(err)).await;
                return StreamOutcome::Failure(report);
            }
            // EOF without a finish reason still counts as success.
            None => return StreamOutcome::Success,
        };

        buffer.extend_from_slice(&bytes);
        while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
            let line_raw = buffer.split_to(pos + 1);
            let Ok(line) = std::str::from_utf8(&line_raw) else {
                continue;
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            // Anything without a data: prefix (comments, event names) is
            // ignored.
            let Some(payload) = line.strip_prefix("data: ") else {
                continue;
            };

            let gemini_chunk: GenerateContentResponse = match serde_json::from_str(payload) {
                Ok(chunk) => chunk,
                Err(err) => {
                    let err = AppError::upstream("Failed to parse stream chunk").with_cause(err);
                    let report = err.shallow_clone();
                    let _ = tx.send(StreamEvent::Error(err)).await;
                    return StreamOutcome::Failure(report);
                }
            };

            // Usage typically rides on the final chunk.
            if let Some(meta) = gemini_chunk.usage_metadata {
                *usage = Some(meta);
            }

            let finished = gemini_chunk
                .candidates
                .first()
                .and_then(|candidate| candidate.finish_reason.as_deref())
                .is_some_and(|reason| !reason.is_empty());

            let openai_chunk =
                transform_stream_chunk(&gemini_chunk, model, &stream_id, created, chunk_index);
            chunk_index += 1;

            tokio::select! {
                _ = cancel.cancelled() => {
                    let err = cancellation_error();
                    let report = err.shallow_clone();
                    let _ = tx.try_send(StreamEvent::Error(err));
                    return StreamOutcome::Failure(report);
                }
                sent = tx.send(StreamEvent::Chunk(openai_chunk)) => {
                    if sent.is_err() {
                        // Receiver gone: the client disconnected.
                        return StreamOutcome::Failure(cancellation_error());
                    }
                }
            }

            if finished {
                let _ = tx.send(StreamEvent::Done).await;
                return StreamOutcome::Success;
            }
        }
    }
}

fn cancellation_error() -> AppError {
    AppError::internal("Request cancelled by client")
}

fn wrap_transport_error(err: reqwest::Error) -> AppError {
    let message = err.to_string().to_ascii_lowercase();
    if err.is_timeout() {
        return AppError::internal("Request cancelled or timed out").with_cause(err);
    }
    if err.is_connect()
        || message.contains("connection refused")
        || message.contains("no such host")
        || message.contains("dns error")
    {
        return AppError::service_unavailable("Failed to connect to upstream API").with_cause(err);
    }
    AppError::upstream("HTTP request failed").with_cause(err)
}

async fn parse_error_response(
    status: reqwest::StatusCode,
    response: reqwest::Response,
) -> AppError {
    let body = response.bytes().await.unwrap_or_default();
    let message = serde_json::from_slice::<UpstreamErrorResponse>(&body)
        .ok()
        .filter(|parsed| parsed.error.code != 0 || !parsed.error.message.is_empty())
        .map(|parsed| parsed.error.message)
        .unwrap_or_else(|| String::from_utf8_lossy(&body).trim().to_string());
    map_status_to_error(status, message)
}

fn map_status_to_error(status: reqwest::StatusCode, message: String) -> AppError {
    match status.as_u16() {
        429 => AppError::rate_limit(crate::constants::RATE_LIMIT_RETRY_AFTER_SECS)
            .with_message(message),
        401 => AppError::authentication(message),
        403 => AppError::permission(message),
        400 => AppError::invalid_request(message),
        404 => {
            if message.is_empty() {
                AppError::not_found("model")
            } else {
                AppError::not_found(message)
            }
        }
        503 => AppError::service_unavailable(message),
        other => {
            if message.is_empty() {
                AppError::upstream(format!("Upstream API returned status {other}"))
            } else {
                AppError::upstream(message)
            }
        }
    }
}
