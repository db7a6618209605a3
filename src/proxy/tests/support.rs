//! Shared fixtures: throwaway upstream servers, a recording pool, and
//! request builders.

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::error::{AppError, AppResult};
use crate::models::config::{
    AppConfig, KeyConfig, ModelSettingsConfig, PoolConfig, UpstreamConfig,
};
use crate::models::key::ApiKey;
use crate::modules::persistence::SqliteStore;
use crate::proxy::pool::{KeyPool, KeyProvider, KeyStore};
use crate::proxy::routes::build_router;
use crate::proxy::state::AppState;
use crate::proxy::upstream::GeminiClient;

pub fn key_configs(n: usize) -> Vec<KeyConfig> {
    (0..n)
        .map(|i| KeyConfig {
            key: format!("AIzaSyE2EKEY{i:04}"),
            name: format!("k{i}"),
            enabled: true,
            tags: vec![],
        })
        .collect()
}

pub fn pool_config(threshold: u32) -> PoolConfig {
    PoolConfig {
        strategy: "round_robin".to_string(),
        cooldown_seconds: 60,
        max_consecutive_failures: threshold,
    }
}

pub async fn spawn_server(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

/// The S1 upstream response: one candidate "Hi!", STOP, usage 1/1/2.
pub fn gemini_ok_response() -> Value {
    json!({
        "candidates": [{
            "content": {"parts": [{"text": "Hi!"}], "role": "model"},
            "finishReason": "STOP",
            "index": 0
        }],
        "usageMetadata": {
            "promptTokenCount": 1,
            "candidatesTokenCount": 1,
            "totalTokenCount": 2
        }
    })
}

pub fn ok_upstream() -> Router {
    Router::new().fallback(|| async { Json(gemini_ok_response()) })
}

/// Records every request body it receives, then answers like `ok_upstream`.
pub fn capturing_upstream(captured: Arc<Mutex<Vec<Value>>>) -> Router {
    Router::new().fallback(move |body: Bytes| {
        let captured = Arc::clone(&captured);
        async move {
            if let Ok(value) = serde_json::from_slice::<Value>(&body) {
                captured.lock().push(value);
            }
            Json(gemini_ok_response())
        }
    })
}

pub fn error_upstream(status: u16, body: Value) -> Router {
    Router::new().fallback(move || {
        let body = body.clone();
        async move {
            (StatusCode::from_u16(status).unwrap(), Json(body)).into_response()
        }
    })
}

pub fn counting_upstream(counter: Arc<AtomicUsize>) -> Router {
    Router::new().fallback(move || {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Json(gemini_ok_response())
        }
    })
}

/// SSE upstream replaying the given pre-framed body.
pub fn sse_upstream(frames: &str) -> Router {
    let frames = frames.to_string();
    Router::new().fallback(move || {
        let frames = frames.clone();
        async move {
            Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/event-stream")
                .body(Body::from(frames))
                .unwrap()
        }
    })
}

/// The three S5 frames: "Hel", "lo", "!"+STOP with usage 5/3.
pub fn s5_frames() -> String {
    concat!(
        "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hel\"}],\"role\":\"model\"},\"index\":0}]}\n\n",
        "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"lo\"}],\"role\":\"model\"},\"index\":0}]}\n\n",
        "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"!\"}],\"role\":\"model\"},\"finishReason\":\"STOP\",\"index\":0}],\"usageMetadata\":{\"promptTokenCount\":5,\"candidatesTokenCount\":3,\"totalTokenCount\":8}}\n\n",
    )
    .to_string()
}

/// Sends one chunk, then stalls until the connection drops.
pub fn hanging_sse_upstream() -> Router {
    Router::new().fallback(|| async {
        let stream = async_stream::stream! {
            yield Ok::<_, std::io::Error>(bytes::Bytes::from(
                "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hel\"}],\"role\":\"model\"},\"index\":0}]}\n\n",
            ));
            futures::future::pending::<()>().await;
        };
        Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "text/event-stream")
            .body(Body::from_stream(stream))
            .unwrap()
    })
}

/// Pool wrapper that records the order of every pool interaction.
pub struct RecordingPool {
    inner: KeyPool,
    events: Mutex<Vec<String>>,
}

impl RecordingPool {
    pub fn new(keys: usize, threshold: u32) -> Arc<Self> {
        Arc::new(Self {
            inner: KeyPool::new(&key_configs(keys), &pool_config(threshold), None),
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn snapshot(&self) -> Vec<ApiKey> {
        self.inner.snapshot()
    }
}

impl KeyProvider for RecordingPool {
    fn acquire(&self) -> AppResult<ApiKey> {
        self.events.lock().push("acquire".to_string());
        self.inner.acquire()
    }

    fn release(&self, key: Option<&ApiKey>) {
        self.events.lock().push("release".to_string());
        self.inner.release(key);
    }

    fn report_success(&self, key: &ApiKey, prompt_tokens: u64, completion_tokens: u64, model: &str) {
        self.events
            .lock()
            .push(format!("report_success({prompt_tokens},{completion_tokens})"));
        self.inner
            .report_success(key, prompt_tokens, completion_tokens, model);
    }

    fn report_failure(&self, key: &ApiKey, error: &AppError, model: &str) {
        self.events
            .lock()
            .push(format!("report_failure({})", error.kind.as_str()));
        self.inner.report_failure(key, error, model);
    }
}

pub fn client_for(pool: Arc<dyn KeyProvider>, base_url: &str) -> Arc<GeminiClient> {
    Arc::new(
        GeminiClient::new(
            pool,
            &UpstreamConfig {
                base_url: base_url.to_string(),
                request_timeout_seconds: 15,
                connect_timeout_seconds: 2,
            },
            ModelSettingsConfig::default(),
        )
        .unwrap(),
    )
}

pub struct TestApp {
    pub url: String,
    pub state: AppState,
}

/// Full application wired to the given upstream, served on an ephemeral
/// port with an in-memory store.
pub async fn spawn_app(
    upstream: Router,
    keys: Vec<KeyConfig>,
    admin_key: Option<String>,
) -> TestApp {
    let upstream_url = spawn_server(upstream).await;

    let mut config = AppConfig::default();
    config.upstream.base_url = upstream_url;
    config.upstream.connect_timeout_seconds = 2;
    config.keys = keys;
    config.server.admin_key = admin_key;

    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let pool = Arc::new(KeyPool::new(
        &config.keys,
        &config.pool,
        Some(Arc::clone(&store) as Arc<dyn KeyStore>),
    ));
    let provider: Arc<dyn KeyProvider> = pool.clone();
    let client = GeminiClient::new(provider, &config.upstream, config.model_settings.clone())
        .unwrap();

    let state = AppState {
        pool,
        client: Arc::new(client),
        store: Some(store),
        config: Arc::new(config),
        started_at: Instant::now(),
    };
    let url = spawn_server(build_router(state.clone())).await;
    TestApp { url, state }
}

pub fn chat_request_json(stream: bool) -> Value {
    json!({
        "model": "gpt-4",
        "messages": [{"role": "user", "content": "Hello"}],
        "stream": stream
    })
}

pub fn chat_request(stream: bool) -> crate::proxy::mappers::openai::ChatCompletionRequest {
    serde_json::from_value(chat_request_json(stream)).unwrap()
}

/// Polls a condition for up to a second; panics when it never holds.
pub async fn wait_until(label: &str, mut predicate: impl FnMut() -> bool) {
    for _ in 0..100 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 1s: {label}");
}
