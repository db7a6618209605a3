//! End-to-end scenarios through the dispatch client and the full router,
//! against mock upstream servers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::models::key::KeyStatus;
use crate::proxy::pool::KeyProvider;
use crate::proxy::tests::support::*;
use crate::proxy::upstream::StreamEvent;

// ---- blocking dispatch ----

#[tokio::test]
async fn blocking_happy_path_reports_success() {
    let app = spawn_app(ok_upstream(), key_configs(1), None).await;

    let response = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", app.url))
        .json(&chat_request_json(false))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["model"], "gpt-4");
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["choices"][0]["message"]["content"], "Hi!");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert_eq!(body["usage"]["total_tokens"], 2);
    assert!(body["id"].as_str().unwrap().starts_with("chatcmpl-"));

    let key = &app.state.pool.snapshot()[0];
    assert_eq!(key.status, KeyStatus::Active);
    assert_eq!(key.stats.request_count, 1);
    assert_eq!(key.stats.success_count, 1);
    assert_eq!(key.stats.prompt_tokens, 1);
}

#[tokio::test]
async fn system_message_lifts_into_upstream_system_instruction() {
    let captured = Arc::new(Mutex::new(Vec::new()));
    let app = spawn_app(capturing_upstream(captured.clone()), key_configs(1), None).await;

    let request = json!({
        "model": "gpt-4",
        "messages": [
            {"role": "system", "content": "Be brief."},
            {"role": "user", "content": "Hi"}
        ]
    });
    let response = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", app.url))
        .json(&request)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let bodies = captured.lock();
    assert_eq!(bodies.len(), 1);
    let upstream = &bodies[0];
    assert_eq!(
        upstream["systemInstruction"]["parts"][0]["text"],
        "Be brief."
    );
    assert_eq!(upstream["contents"].as_array().unwrap().len(), 1);
    assert_eq!(upstream["contents"][0]["role"], "user");
}

#[tokio::test]
async fn malformed_body_yields_error_envelope() {
    let app = spawn_app(ok_upstream(), key_configs(1), None).await;

    let response = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", app.url))
        .header("Content-Type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["type"], "invalid_request_error");
    assert_eq!(body["error"]["code"], 40001);
}

#[tokio::test]
async fn upstream_429_propagates_and_cools_the_key_down() {
    let app = spawn_app(
        error_upstream(
            429,
            json!({"error": {"code": 429, "message": "quota", "status": "RESOURCE_EXHAUSTED"}}),
        ),
        key_configs(1),
        None,
    )
    .await;

    let response = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", app.url))
        .json(&chat_request_json(false))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 429);
    assert_eq!(response.headers()["retry-after"], "60");
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["type"], "rate_limit_error");
    assert_eq!(body["error"]["retry_after"], 60);
    assert_eq!(body["error"]["message"], "quota");

    let key = &app.state.pool.snapshot()[0];
    assert_eq!(key.status, KeyStatus::RateLimited);
    let cooldown = key.cooldown_until.unwrap();
    let expected = chrono::Utc::now() + chrono::Duration::seconds(60);
    assert!((cooldown - expected).num_seconds().abs() <= 2);
}

#[tokio::test]
async fn all_cooling_down_rejects_without_upstream_call() {
    let calls = Arc::new(AtomicUsize::new(0));
    let app = spawn_app(counting_upstream(calls.clone()), key_configs(1), None).await;

    let key = app.state.pool.acquire().unwrap();
    app.state
        .pool
        .report_failure(&key, &AppError::rate_limit(60), "gpt-4");
    let requests_before = app.state.pool.snapshot()[0].stats.request_count;

    let response = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", app.url))
        .json(&chat_request_json(false))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 429);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["type"], "rate_limit_error");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        app.state.pool.snapshot()[0].stats.request_count,
        requests_before
    );
}

#[tokio::test]
async fn consecutive_upstream_failures_promote_the_key() {
    let pool = RecordingPool::new(1, 3);
    let upstream = spawn_server(error_upstream(500, json!({"error": {"code": 500, "message": "boom", "status": "INTERNAL"}}))).await;
    let client = client_for(pool.clone(), &upstream);

    for _ in 0..3 {
        let err = client.chat_completion(chat_request(false)).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Upstream);
    }

    let key = &pool.snapshot()[0];
    assert_eq!(key.status, KeyStatus::RateLimited);
    assert_eq!(key.stats.error_count, 3);
}

#[tokio::test]
async fn failure_reports_precede_release_on_every_path() {
    // Upstream 500.
    let pool = RecordingPool::new(1, 10);
    let upstream = spawn_server(error_upstream(500, json!({"error": {"code": 500, "message": "x", "status": "INTERNAL"}}))).await;
    let client = client_for(pool.clone(), &upstream);
    client.chat_completion(chat_request(false)).await.unwrap_err();

    let events = pool.events();
    let report = events.iter().position(|e| e.starts_with("report_failure")).unwrap();
    let release = events.iter().position(|e| e == "release").unwrap();
    assert!(report < release, "events: {events:?}");

    // Transport failure when opening a stream.
    let pool = RecordingPool::new(1, 10);
    let client = client_for(pool.clone(), "http://127.0.0.1:9");
    let err = client
        .chat_completion_stream(chat_request(true), CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind, crate::error::ErrorKind::ServiceUnavailable);

    let events = pool.events();
    let report = events.iter().position(|e| e.starts_with("report_failure")).unwrap();
    let release = events.iter().position(|e| e == "release").unwrap();
    assert!(report < release, "events: {events:?}");
}

#[tokio::test]
async fn success_report_precedes_release() {
    let pool = RecordingPool::new(1, 3);
    let upstream = spawn_server(ok_upstream()).await;
    let client = client_for(pool.clone(), &upstream);
    client.chat_completion(chat_request(false)).await.unwrap();

    let events = pool.events();
    assert_eq!(events[0], "acquire");
    let report = events.iter().position(|e| e.starts_with("report_success")).unwrap();
    let release = events.iter().position(|e| e == "release").unwrap();
    assert!(report < release, "events: {events:?}");
    assert_eq!(events.iter().filter(|e| *e == "release").count(), 1);
}

// ---- streaming ----

#[tokio::test]
async fn streaming_delivers_chunks_done_and_usage() {
    let pool = RecordingPool::new(1, 3);
    let upstream = spawn_server(sse_upstream(&s5_frames())).await;
    let client = client_for(pool.clone(), &upstream);

    let mut rx = client
        .chat_completion_stream(chat_request(true), CancellationToken::new())
        .await
        .unwrap();

    let mut deltas = Vec::new();
    let mut finish_reason = None;
    let mut saw_done = false;
    while let Some(event) = rx.recv().await {
        match event {
            StreamEvent::Chunk(chunk) => {
                if let Some(content) = chunk.choices[0].delta.content.clone() {
                    deltas.push(content);
                }
                if let Some(reason) = chunk.choices[0].finish_reason.clone() {
                    finish_reason = Some(reason);
                }
            }
            StreamEvent::Done => saw_done = true,
            StreamEvent::Error(err) => panic!("unexpected error event: {err}"),
        }
    }

    assert_eq!(deltas, vec!["Hel", "lo", "!"]);
    assert_eq!(finish_reason.as_deref(), Some("stop"));
    assert!(saw_done);

    wait_until("success reported", || {
        pool.events().iter().any(|e| e == "report_success(5,3)")
    })
    .await;
    let events = pool.events();
    let report = events.iter().position(|e| e.starts_with("report_success")).unwrap();
    let release = events.iter().position(|e| e == "release").unwrap();
    assert!(report < release);

    let key = &pool.snapshot()[0];
    assert_eq!(key.stats.success_count, 1);
    assert_eq!(key.stats.prompt_tokens, 5);
    assert_eq!(key.stats.completion_tokens, 3);
}

#[tokio::test]
async fn streaming_over_http_emits_sse_protocol() {
    let app = spawn_app(sse_upstream(&s5_frames()), key_configs(1), None).await;

    let response = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", app.url))
        .json(&chat_request_json(true))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["content-type"],
        "text/event-stream"
    );
    assert_eq!(response.headers()["cache-control"], "no-cache");

    let body = response.text().await.unwrap();
    let frames: Vec<&str> = body
        .split("\n\n")
        .filter(|frame| !frame.is_empty())
        .collect();
    assert_eq!(frames.len(), 4, "body: {body}");
    assert!(frames[0].contains("\"Hel\""));
    assert!(frames[1].contains("\"lo\""));
    assert!(frames[2].contains("\"!\""));
    assert!(frames[2].contains("\"finish_reason\":\"stop\""));
    assert_eq!(frames[3], "data: [DONE]");

    wait_until("stream success recorded", || {
        app.state.pool.snapshot()[0].stats.success_count == 1
    })
    .await;
}

#[tokio::test]
async fn stream_cancel_reports_failure_not_rate_limit() {
    let pool = RecordingPool::new(1, 3);
    let upstream = spawn_server(hanging_sse_upstream()).await;
    let client = client_for(pool.clone(), &upstream);

    let cancel = CancellationToken::new();
    let mut rx = client
        .chat_completion_stream(chat_request(true), cancel.clone())
        .await
        .unwrap();

    // First chunk arrives, then the upstream stalls.
    match rx.recv().await.unwrap() {
        StreamEvent::Chunk(chunk) => {
            assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("Hel"));
        }
        other => panic!("expected chunk, got {other:?}"),
    }

    // Client disconnect.
    cancel.cancel();

    wait_until("cancel failure reported", || {
        pool.events().iter().any(|e| e.starts_with("report_failure"))
    })
    .await;

    let events = pool.events();
    let report = events.iter().position(|e| e.starts_with("report_failure")).unwrap();
    let release = events.iter().position(|e| e == "release").unwrap();
    assert!(report < release, "events: {events:?}");
    assert_eq!(events.iter().filter(|e| *e == "release").count(), 1);
    // Cancellation is an internal failure, never a rate-limit signal.
    assert!(events[report].contains("server_error"), "events: {events:?}");

    let key = &pool.snapshot()[0];
    assert_eq!(key.status, KeyStatus::Active);
    assert_eq!(key.stats.error_count, 1);

    // The channel drains to closure.
    while rx.recv().await.is_some() {}
}

#[tokio::test]
async fn stream_request_with_all_keys_cooling_fails_before_headers() {
    let app = spawn_app(ok_upstream(), key_configs(1), None).await;
    let key = app.state.pool.acquire().unwrap();
    app.state
        .pool
        .report_failure(&key, &AppError::rate_limit(60), "gpt-4");

    let response = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", app.url))
        .json(&chat_request_json(true))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 429);
    let content_type = response.headers()["content-type"].to_str().unwrap().to_string();
    assert!(content_type.starts_with("application/json"));
}

// ---- auxiliary endpoints ----

#[tokio::test]
async fn health_models_and_ping_respond() {
    let app = spawn_app(ok_upstream(), key_configs(2), None).await;
    let http = reqwest::Client::new();

    let health: Value = http
        .get(format!("{}/health", app.url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["keys"]["total"], 2);
    assert_eq!(health["keys"]["active"], 2);

    let models: Value = http
        .get(format!("{}/v1/models", app.url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(models["object"], "list");
    let ids: Vec<&str> = models["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap())
        .collect();
    assert!(ids.contains(&"gpt-4"));
    assert!(ids.contains(&"gemini-2.0-flash"));

    let ping: Value = http
        .get(format!("{}/ping", app.url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(ping["message"], "pong");
}

#[tokio::test]
async fn unknown_route_returns_envelope_404() {
    let app = spawn_app(ok_upstream(), key_configs(1), None).await;
    let response = reqwest::Client::new()
        .get(format!("{}/v2/nothing", app.url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["type"], "not_found_error");
}

// ---- admin surface ----

#[tokio::test]
async fn admin_guard_requires_bearer_token() {
    let app = spawn_app(ok_upstream(), key_configs(1), Some("sekret".to_string())).await;
    let http = reqwest::Client::new();

    let denied = http
        .get(format!("{}/api/keys", app.url))
        .send()
        .await
        .unwrap();
    assert_eq!(denied.status(), 401);

    let allowed = http
        .get(format!("{}/api/keys", app.url))
        .bearer_auth("sekret")
        .send()
        .await
        .unwrap();
    assert_eq!(allowed.status(), 200);
    let body: Value = allowed.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["total"], 1);
    // The snapshot never leaks raw secrets.
    assert!(body["data"][0].get("api_key").is_none());
}

#[tokio::test]
async fn admin_key_lifecycle_create_list_delete() {
    let app = spawn_app(ok_upstream(), vec![], None).await;
    let http = reqwest::Client::new();

    let created = http
        .post(format!("{}/api/keys", app.url))
        .json(&json!({"key": "AIzaSyADMINKEY01", "name": "via-api", "tags": ["t"]}))
        .send()
        .await
        .unwrap();
    assert_eq!(created.status(), 201);
    let body: Value = created.json().await.unwrap();
    let id = body["data"]["id"].as_str().unwrap().to_string();
    assert_eq!(app.state.pool.size(), 1);

    // Duplicate secret is rejected.
    let duplicate = http
        .post(format!("{}/api/keys", app.url))
        .json(&json!({"key": "AIzaSyADMINKEY01"}))
        .send()
        .await
        .unwrap();
    assert_eq!(duplicate.status(), 400);

    let deleted = http
        .delete(format!("{}/api/keys/{id}", app.url))
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), 200);
    assert_eq!(app.state.pool.size(), 0);

    let missing = http
        .delete(format!("{}/api/keys/{id}", app.url))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);
}

#[tokio::test]
async fn admin_import_reports_imported_and_skipped() {
    let app = spawn_app(ok_upstream(), key_configs(1), None).await;
    let existing = &app.state.config.keys[0].key;

    let response = reqwest::Client::new()
        .post(format!("{}/api/keys/import", app.url))
        .json(&json!({"keys": [
            {"key": existing},
            {"key": "AIzaSyIMPORTED01"},
            {"key": ""}
        ]}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["data"]["imported"], 1);
    assert_eq!(body["data"]["skipped"], 1);
    assert_eq!(body["data"]["errors"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn admin_pool_settings_apply_hot_and_persist() {
    let app = spawn_app(ok_upstream(), key_configs(1), None).await;

    let response = reqwest::Client::new()
        .put(format!("{}/api/pool/settings", app.url))
        .json(&json!({"strategy": "weighted", "cooldown_seconds": 30, "max_consecutive_failures": 2}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    assert_eq!(app.state.pool.strategy_name(), "weighted");
    assert_eq!(app.state.pool.cooldown_seconds(), 30);
    assert_eq!(app.state.pool.max_consecutive_failures(), 2);

    let store = app.state.store.as_ref().unwrap();
    assert_eq!(
        store.get_setting("pool.strategy").unwrap().as_deref(),
        Some("weighted")
    );
    assert_eq!(
        store.get_setting("pool.cooldown_seconds").unwrap().as_deref(),
        Some("30")
    );

    let rejected = reqwest::Client::new()
        .put(format!("{}/api/pool/settings", app.url))
        .json(&json!({"strategy": "fastest"}))
        .send()
        .await
        .unwrap();
    assert_eq!(rejected.status(), 400);
}

#[tokio::test]
async fn admin_test_key_probes_the_live_models_endpoint() {
    // The mock upstream answers every route, including GET /models.
    let models_upstream = axum::Router::new().fallback(|| async {
        axum::Json(json!({"models": [
            {"name": "models/gemini-1.5-pro-latest"},
            {"name": "models/gemini-2.0-flash"}
        ]}))
    });
    let app = spawn_app(models_upstream, key_configs(1), None).await;
    let id = app.state.pool.snapshot()[0].id.clone();

    let response = reqwest::Client::new()
        .post(format!("{}/api/keys/{id}/test", app.url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["data"]["valid"], true);
    assert_eq!(body["data"]["models"].as_array().unwrap().len(), 2);
    assert!(body["data"]["latency_ms"].is_u64());
}

#[tokio::test]
async fn admin_validate_rejects_bad_keys_via_probe() {
    let app = spawn_app(
        error_upstream(
            400,
            json!({"error": {"code": 400, "message": "API key not valid", "status": "INVALID_ARGUMENT"}}),
        ),
        vec![],
        None,
    )
    .await;

    let response = reqwest::Client::new()
        .post(format!("{}/api/keys/validate", app.url))
        .json(&json!({"key": "AIzaSyBOGUS"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["valid"], false);
    assert_eq!(body["error"], "API key not valid");
}
