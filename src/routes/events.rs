//! Server-Sent Events (SSE) endpoint.
//!
//! `GET /api/events` streams every access-journal entry as it is recorded
//! (`activity.new` events), for dashboards watching the hotspot live. Streams
//! end when the server shuts down so graceful shutdown is not held open.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use futures::stream::{Stream, StreamExt};
use tokio::sync::broadcast::error::RecvError;

use crate::state::AppState;

/// Maximum concurrent SSE connections before rejecting with 429.
const MAX_SSE_CONNECTIONS: u32 = 16;

/// `GET /api/events`: SSE event stream.
pub async fn event_stream(State(state): State<AppState>) -> impl IntoResponse {
    let admitted = state
        .sse_connections
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
            (n < MAX_SSE_CONNECTIONS).then_some(n + 1)
        });
    if admitted.is_err() {
        return Err((StatusCode::TOO_MANY_REQUESTS, "Too many SSE connections"));
    }

    let rx = state.events.subscribe();
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        match rx.recv().await {
            Ok(value) => {
                let event_type = value["type"].as_str().unwrap_or("message").to_string();
                let event = Event::default().event(event_type).data(value.to_string());
                Some((Ok(event), rx))
            }
            Err(RecvError::Lagged(n)) => {
                let event = Event::default()
                    .event("error")
                    .data(format!(r#"{{"code":"LAGGED","missed":{n}}}"#));
                Some((Ok(event), rx))
            }
            Err(RecvError::Closed) => None,
        }
    })
    .take_until(state.shutdown.clone().cancelled_owned());

    let stream = CountedStream {
        inner: Box::pin(stream),
        counter: state.sse_connections.clone(),
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default().interval(Duration::from_secs(15))))
}

/// Holds one slot of the SSE connection counter for as long as the stream lives.
struct CountedStream<S> {
    inner: Pin<Box<S>>,
    counter: Arc<AtomicU32>,
}

impl<S: Stream<Item = Result<Event, Infallible>>> Stream for CountedStream<S> {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl<S> Drop for CountedStream<S> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}
