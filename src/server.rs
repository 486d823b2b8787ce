// HTTP surface: subscription management plus the SSE transport that maps
// worker events onto a text/event-stream connection.

use crate::context::AppContext;
use crate::worker::{OutputEvent, Worker, SUBSCRIBER_QUEUE};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Caller-visible failures at the management surface.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("token not found")]
    UnknownToken,
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            ApiError::UnknownToken => StatusCode::NOT_FOUND,
            ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

pub fn router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/subscribe", post(subscribe))
        .route("/subs", get(list_subs))
        .route("/subs/:token", delete(delete_sub))
        .route("/stream/:token", get(stream))
        .with_state(ctx)
}

#[derive(Debug, Deserialize)]
struct SubscribeIn {
    snapshot_url: String,
    interval_sec: i64,
}

async fn subscribe(
    State(ctx): State<Arc<AppContext>>,
    Json(input): Json<SubscribeIn>,
) -> Result<impl IntoResponse, ApiError> {
    if input.interval_sec < 1 {
        return Err(ApiError::Validation(
            "interval_sec must be >= 1".to_string(),
        ));
    }
    if reqwest::Url::parse(&input.snapshot_url).is_err() {
        return Err(ApiError::Validation("snapshot_url is not a URL".to_string()));
    }
    let token = ctx
        .store
        .create(&input.snapshot_url, input.interval_sec as u64)?;
    Ok(Json(json!({ "subscription_token": token })))
}

async fn list_subs(State(ctx): State<Arc<AppContext>>) -> Result<impl IntoResponse, ApiError> {
    let items = ctx.store.list()?;
    Ok(Json(json!({ "items": items })))
}

async fn delete_sub(
    State(ctx): State<Arc<AppContext>>,
    Path(token): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if !ctx.store.delete(&token)? {
        return Err(ApiError::UnknownToken);
    }
    // Kick any live worker; absent just means nobody is streaming.
    ctx.manager.revoke(&token).await;
    Ok(Json(json!({ "ok": true })))
}

async fn stream(
    State(ctx): State<Arc<AppContext>>,
    Path(token): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let sub = ctx.store.get(&token)?.ok_or(ApiError::UnknownToken)?;

    let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
    // Attaching inside the manager's critical section keeps a retiring
    // loop from missing this subscriber.
    let (worker, id) = ctx
        .manager
        .ensure_attached(&sub.token, &sub.url, sub.interval, tx)
        .await;
    let guard = DetachGuard { worker, id };

    // Transport-level idle timer, distinct from the worker heartbeat:
    // keeps intermediaries from reaping a quiet connection.
    let idle_after = Duration::from_secs(ctx.config.stream.heartbeat_sec + 5);
    Ok(Sse::new(event_stream(rx, guard, idle_after)))
}

/// Detaches the subscriber channel when the SSE body is dropped, whether
/// the client disconnected or the stream ended.
struct DetachGuard {
    worker: Arc<Worker>,
    id: u64,
}

impl Drop for DetachGuard {
    fn drop(&mut self) {
        debug!(token = %self.worker.token(), id = self.id, "subscriber detached");
        self.worker.detach(self.id);
    }
}

fn event_stream(
    rx: mpsc::Receiver<OutputEvent>,
    guard: DetachGuard,
    idle_after: Duration,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let greeting = stream::once(futures::future::ready(Ok(Event::default().comment("hello"))));
    let events = stream::unfold((rx, guard), move |(mut rx, guard)| async move {
        match tokio::time::timeout(idle_after, rx.recv()).await {
            // Channel closed: worker revoked us or dropped this laggard.
            Ok(None) => None,
            Ok(Some(event)) => Some((Ok(sse_event(&event)), (rx, guard))),
            Err(_) => Some((Ok(sse_event(&OutputEvent::Idle)), (rx, guard))),
        }
    });
    greeting.chain(events)
}

fn sse_event(event: &OutputEvent) -> Event {
    match event {
        OutputEvent::Count(n) => Event::default().event("count").data(n.to_string()),
        OutputEvent::Log(line) => Event::default().event("log").data(line.clone()),
        OutputEvent::Error(message) => Event::default()
            .event("error")
            .data(json!({ "err": message }).to_string()),
        OutputEvent::Heartbeat => Event::default().comment("ping"),
        OutputEvent::Idle => Event::default().comment("idle"),
        OutputEvent::Revoked => Event::default().event("revoked").data("token deleted"),
    }
}
