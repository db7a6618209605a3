//! Client-facing SSE pipeline: turns the dispatch client's event channel
//! into a `text/event-stream` body.

use axum::body::Body;
use axum::response::Response;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::DropGuard;
use tracing::debug;

use crate::proxy::upstream::StreamEvent;

/// Builds the streaming response. The drop guard cancels the producer when
/// the client goes away (the body stream is dropped with it).
pub fn sse_response(rx: mpsc::Receiver<StreamEvent>, guard: DropGuard) -> Response {
    let body = Body::from_stream(event_stream(rx, guard));
    Response::builder()
        .header("Content-Type", "text/event-stream")
        .header("Cache-Control", "no-cache")
        .header("Connection", "keep-alive")
        .header("X-Accel-Buffering", "no")
        .body(body)
        .expect("static response headers are valid")
}

fn event_stream(
    mut rx: mpsc::Receiver<StreamEvent>,
    guard: DropGuard,
) -> impl futures::Stream<Item = Result<Bytes, String>> {
    async_stream::stream! {
        // Held for the lifetime of the body; dropping it cancels upstream.
        let _guard = guard;
        let mut terminated = false;

        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::Chunk(chunk) => match serde_json::to_string(&chunk) {
                    Ok(json) => yield Ok(Bytes::from(format!("data: {json}\n\n"))),
                    Err(err) => {
                        debug!("failed to serialize stream chunk: {err}");
                    }
                },
                StreamEvent::Error(err) => {
                    // Headers are already committed; the error goes out as
                    // one final inline event.
                    if let Ok(json) = serde_json::to_string(&err.to_api_error()) {
                        yield Ok(Bytes::from(format!("data: {json}\n\n")));
                    }
                    terminated = true;
                    break;
                }
                StreamEvent::Done => {
                    yield Ok(Bytes::from("data: [DONE]\n\n"));
                    terminated = true;
                    break;
                }
            }
        }

        // Channel closed without a terminal event: emit the done marker
        // anyway so well-behaved clients stop waiting.
        if !terminated {
            yield Ok(Bytes::from("data: [DONE]\n\n"));
        }
    }
}
