//! Client-facing chat completions, streamed or collected.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use futures::Stream;
use serde::Serialize;
use tokio_stream::StreamExt;
use tracing::{info, warn};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use tabrelay_chat::*;
use tabrelay_core::{BridgeConfig, Error};
use tabrelay_dispatch::{Job, Submission, WorkerCommand, WorkerEvent};

type SseStream = Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/v1/chat/completions", post(chat_completions))
}

/// Releases a task when its response goes away, including on client disconnect.
struct TaskGuard {
    state: Arc<AppState>,
    task_id: String,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.state.dispatcher.cancel(&self.task_id);
        self.state.tasks.remove(&self.task_id);
    }
}

fn check_api_key(config: &BridgeConfig, headers: &HeaderMap) -> Result<(), Error> {
    let Some(expected) = config.api_key.as_deref().filter(|k| !k.is_empty()) else {
        return Ok(());
    };
    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match provided {
        Some(key) if key == expected => Ok(()),
        Some(_) => Err(Error::Unauthorized("invalid API key".into())),
        None => Err(Error::Unauthorized("missing bearer API key".into())),
    }
}

async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let config = state.reload_config();
    check_api_key(&config, &headers)?;

    let req: ChatCompletionRequest = serde_json::from_slice(&body)
        .map_err(|e| Error::InvalidRequest(format!("invalid request body: {}", e)))?;

    if config.log_server_requests {
        info!(
            body = %serde_json::to_string(&req).unwrap_or_default(),
            "Chat request received"
        );
    }
    if req.messages.is_empty() {
        return Err(Error::InvalidRequest("`messages` must be a non-empty list".into()).into());
    }
    if !state.dispatcher.has_sessions() {
        return Err(Error::WorkerUnavailable("no browser tab is connected".into()).into());
    }

    let task_id = Job::new_task_id();
    let job = {
        let models = state.models.read();
        RequestAdapter::new(AdapterOptions::from(&config)).build_job(&task_id, &req, &models)
    };

    state.tasks.create(&task_id)?;
    let guard = TaskGuard {
        state: state.clone(),
        task_id: task_id.clone(),
    };
    let events = decode_stream(state.tasks.take_stream(&task_id)?, DriverTimeouts::from(&config));

    match state.dispatcher.submit(job) {
        Submission::Assigned { session_id } => {
            info!(task_id = %task_id, session_id = %session_id, stream = req.stream, "Chat job dispatched")
        }
        Submission::Queued { position } => {
            info!(task_id = %task_id, position, stream = req.stream, "Chat job queued")
        }
    }

    let frames = ResponseFrames::new(req.model.as_deref().unwrap_or("unknown"));
    if req.stream {
        Ok(stream_response(guard, frames, events).into_response())
    } else {
        collect_response(guard, frames, events).await
    }
}

fn frame<T: Serialize>(value: &T) -> Event {
    Event::default().data(serde_json::to_string(value).unwrap_or_default())
}

fn request_refresh(guard: &TaskGuard) {
    let event = WorkerEvent::Command(WorkerCommand::Refresh);
    if guard.state.dispatcher.notify_owner(&guard.task_id, event) {
        info!(task_id = %guard.task_id, "Refresh command sent to worker");
    } else {
        warn!(task_id = %guard.task_id, "No worker to refresh");
    }
}

// ---------------------------------------------------------------
// Streaming (SSE)
// ---------------------------------------------------------------

fn stream_response(guard: TaskGuard, frames: ResponseFrames, mut events: EventStream) -> Sse<SseStream> {
    let stream: SseStream = Box::pin(async_stream::stream! {
        while let Some(event) = events.next().await {
            match event {
                DecodeEvent::Delta(text) => yield Ok(frame(&frames.delta(&text))),
                DecodeEvent::Warning(text) => yield Ok(frame(&frames.notice(&text))),
                DecodeEvent::RefreshWorker => request_refresh(&guard),
                DecodeEvent::Done(StreamEnd::Finished { finish_reason }) => {
                    yield Ok(frame(&frames.finish(&finish_reason)));
                }
                DecodeEvent::Done(StreamEnd::Failed(failure)) => {
                    yield Ok(frame(&frames.error(&failure.message())));
                    yield Ok(frame(&frames.finish("stop")));
                }
            }
        }
        yield Ok(Event::default().data("[DONE]"));
        drop(guard);
    });
    Sse::new(stream)
}

// ---------------------------------------------------------------
// Non-streaming
// ---------------------------------------------------------------

async fn collect_response(
    guard: TaskGuard,
    frames: ResponseFrames,
    mut events: EventStream,
) -> ApiResult<Response> {
    let mut content = String::new();
    while let Some(event) = events.next().await {
        match event {
            DecodeEvent::Delta(text) | DecodeEvent::Warning(text) => content.push_str(&text),
            DecodeEvent::RefreshWorker => request_refresh(&guard),
            DecodeEvent::Done(StreamEnd::Finished { finish_reason }) => {
                return Ok(Json(frames.completion(content, &finish_reason)).into_response());
            }
            DecodeEvent::Done(StreamEnd::Failed(failure)) => {
                return Err(ApiError(failure.into_error()));
            }
        }
    }
    Err(Error::Internal("response stream ended without a result".into()).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_api_key_check() {
        let mut config = BridgeConfig::default();
        let mut headers = HeaderMap::new();
        assert!(check_api_key(&config, &headers).is_ok());

        config.api_key = Some("sk-test".into());
        assert!(matches!(
            check_api_key(&config, &headers),
            Err(Error::Unauthorized(_))
        ));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer wrong"));
        assert!(check_api_key(&config, &headers).is_err());

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer sk-test"));
        assert!(check_api_key(&config, &headers).is_ok());
    }
}
