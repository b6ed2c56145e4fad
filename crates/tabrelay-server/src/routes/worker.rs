//! Worker-facing endpoints: job delivery (SSE, WebSocket, pull), fragment
//! ingestion, result reports, liveness and log relay.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::error::ApiResult;
use crate::state::AppState;
use tabrelay_core::Error;
use tabrelay_dispatch::{Inbound, TaskStatus, WorkerEvent};

type SseStream = Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>;

// ---------------------------------------------------------------
// Route builder
// ---------------------------------------------------------------

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/events", get(events))
        .route("/ws", get(ws_handler))
        .route("/get_messages_job", get(get_messages_job))
        .route("/stream_chunk", post(stream_chunk))
        .route("/report_result", post(report_result))
        .route("/heartbeat", post(heartbeat))
        .route("/log_from_client", post(log_from_client))
}

// ---------------------------------------------------------------
// Query / Body types
// ---------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct TabQuery {
    #[serde(default, alias = "session_id")]
    pub tab_id: Option<String>,
}

impl TabQuery {
    fn require(self) -> Result<String, Error> {
        self.tab_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::InvalidRequest("missing `tab_id`".into()))
    }
}

/// Fragment report: `{task_id, tab_id, chunk}` or `{task_id, tab_id, error}`.
#[derive(Debug, Deserialize)]
pub struct ChunkReport {
    #[serde(alias = "request_id")]
    pub task_id: String,
    #[serde(default, alias = "session_id")]
    pub tab_id: Option<String>,
    #[serde(default, alias = "data")]
    pub chunk: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

impl ChunkReport {
    fn into_inbound(self) -> Result<(String, Inbound), Error> {
        let item = match (self.error, self.chunk) {
            (Some(Value::String(message)), _) => Inbound::Error(message),
            (Some(other), _) => Inbound::Error(other.to_string()),
            (None, Some(chunk)) => Inbound::from_chunk(&chunk),
            (None, None) => {
                return Err(Error::InvalidRequest("report carries neither `chunk` nor `error`".into()))
            }
        };
        Ok((self.task_id, item))
    }
}

/// Result report: `{task_id, tab_id, status}`.
#[derive(Debug, Deserialize)]
pub struct ResultReport {
    #[serde(alias = "request_id")]
    pub task_id: String,
    #[serde(default, alias = "session_id")]
    pub tab_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ClientLog {
    #[serde(default)]
    pub level: Option<String>,
    pub message: String,
    #[serde(default, alias = "session_id")]
    pub tab_id: Option<String>,
}

// ---------------------------------------------------------------
// Shared ingestion
// ---------------------------------------------------------------

/// Queue a fragment on its task. A report naming a tab is only accepted while
/// that tab may still produce for the task.
fn ingest_chunk(state: &AppState, report: ChunkReport) -> Result<(), Error> {
    let tab_id = report.tab_id.clone();
    let (task_id, item) = report.into_inbound()?;
    if let Inbound::Error(message) = &item {
        warn!(task_id = %task_id, "Worker reported error: {}", message);
    }

    let pushed = match tab_id.as_deref() {
        Some(tab_id) => {
            state.dispatcher.touch(tab_id);
            state
                .dispatcher
                .with_producer(&task_id, tab_id, || state.tasks.push(&task_id, item))?
        }
        None => state.tasks.push(&task_id, item),
    };
    pushed.map_err(|e| {
        debug!(task_id = %task_id, "Fragment for unknown task dropped");
        e
    })
}

fn apply_result(state: &AppState, report: ResultReport) -> Result<(), Error> {
    let ResultReport {
        task_id,
        tab_id,
        status,
        error,
    } = report;
    let tab_id = tab_id.ok_or_else(|| Error::InvalidRequest("missing `tab_id`".into()))?;
    let failed = status.as_deref() == Some("failed");

    state.dispatcher.with_producer(&task_id, &tab_id, || {
        let status = if failed {
            TaskStatus::Failed
        } else {
            TaskStatus::Completed
        };
        if state.tasks.set_status(&task_id, status) {
            let item = if failed {
                Inbound::Error(error.unwrap_or_else(|| "worker reported a failed run".into()))
            } else {
                Inbound::End
            };
            // The stream may already have ended on its own end marker.
            let _ = state.tasks.push(&task_id, item);
        }
    })?;

    state.dispatcher.complete(&task_id, &tab_id)
}

fn ok() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

// ---------------------------------------------------------------
// Job delivery
// ---------------------------------------------------------------

fn sse_event(event: &WorkerEvent) -> Event {
    match event {
        WorkerEvent::NewJob(job) => Event::default().event("new_job").data(
            json!({"task_id": job.task_id, "payload": job.payload, "type": "prompt"}).to_string(),
        ),
        WorkerEvent::Command(command) => Event::default()
            .event("command")
            .data(json!({ "command": command }).to_string()),
        WorkerEvent::Ping => Event::default().comment("ping"),
    }
}

fn ws_frame(event: &WorkerEvent) -> String {
    match event {
        WorkerEvent::NewJob(job) => {
            json!({"type": "new_job", "task_id": job.task_id, "payload": job.payload})
        }
        WorkerEvent::Command(command) => json!({ "command": command }),
        WorkerEvent::Ping => json!({"type": "ping"}),
    }
    .to_string()
}

async fn events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TabQuery>,
) -> ApiResult<Sse<SseStream>> {
    let tab_id = query.require()?;
    let mut outbound = state.dispatcher.register_or_touch(&tab_id);
    info!(tab_id = %tab_id, "Worker event stream opened");

    let stream: SseStream = Box::pin(async_stream::stream! {
        while let Some(event) = outbound.recv().await {
            yield Ok(sse_event(&event));
        }
        info!(tab_id = %tab_id, "Worker event stream replaced or closed");
    });
    Ok(Sse::new(stream))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<TabQuery>,
) -> ApiResult<impl IntoResponse> {
    let tab_id = query.require()?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, tab_id)))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>, tab_id: String) {
    let mut outbound = state.dispatcher.register_or_touch(&tab_id);
    info!(tab_id = %tab_id, "Worker WebSocket connected");

    loop {
        tokio::select! {
            event = outbound.recv() => {
                let Some(event) = event else {
                    debug!(tab_id = %tab_id, "Outbound channel replaced, closing socket");
                    break;
                };
                if socket.send(Message::Text(ws_frame(&event).into())).await.is_err() {
                    debug!(tab_id = %tab_id, "Worker WebSocket send failed");
                    break;
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Text(text))) => {
                        state.dispatcher.touch(&tab_id);
                        handle_ws_report(&state, &tab_id, text.as_str());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(tab_id = %tab_id, "Worker WebSocket disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(tab_id = %tab_id, error = %e, "Worker WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }
}

/// Inbound WebSocket text: a fragment report, a result report, or a bare
/// liveness message.
fn handle_ws_report(state: &AppState, tab_id: &str, text: &str) {
    let mut value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!(tab_id, "Unparsable WebSocket message: {}", e);
            return;
        }
    };
    if !value.is_object() {
        return;
    }
    if value.get("tab_id").is_none() {
        value["tab_id"] = json!(tab_id);
    }

    let has_task = value.get("task_id").is_some() || value.get("request_id").is_some();
    let is_chunk = ["chunk", "data", "error"].iter().any(|k| value.get(*k).is_some());

    let outcome = if has_task && is_chunk {
        serde_json::from_value::<ChunkReport>(value)
            .map_err(Error::from)
            .and_then(|report| ingest_chunk(state, report))
    } else if has_task && value.get("status").is_some() {
        serde_json::from_value::<ResultReport>(value)
            .map_err(Error::from)
            .and_then(|report| apply_result(state, report))
    } else {
        return;
    };

    if let Err(e) = outcome {
        debug!(tab_id, "WebSocket report rejected: {}", e);
    }
}

async fn get_messages_job(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TabQuery>,
) -> ApiResult<Json<Value>> {
    let tab_id = query.require()?;
    match state.dispatcher.take_job_payload(&tab_id) {
        Some(job) => {
            state.tasks.mark_picked_up(&job.task_id);
            info!(tab_id = %tab_id, task_id = %job.task_id, "Job fetched by worker");
            Ok(Json(json!({
                "status": "success",
                "job": {"task_id": job.task_id, "payload": job.payload},
            })))
        }
        None => Ok(Json(json!({"status": "empty"}))),
    }
}

// ---------------------------------------------------------------
// Reports
// ---------------------------------------------------------------

async fn stream_chunk(
    State(state): State<Arc<AppState>>,
    Json(report): Json<ChunkReport>,
) -> ApiResult<Json<Value>> {
    ingest_chunk(&state, report)?;
    Ok(ok())
}

async fn report_result(
    State(state): State<Arc<AppState>>,
    Json(report): Json<ResultReport>,
) -> ApiResult<Json<Value>> {
    info!(
        task_id = %report.task_id,
        status = report.status.as_deref().unwrap_or("completed"),
        "Worker reported result"
    );
    apply_result(&state, report)?;
    Ok(ok())
}

async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TabQuery>,
) -> ApiResult<Json<Value>> {
    let tab_id = query.require()?;
    if state.dispatcher.touch(&tab_id) {
        Ok(ok())
    } else {
        Err(Error::NotFound(format!("session {}", tab_id)).into())
    }
}

async fn log_from_client(Json(log): Json<ClientLog>) -> StatusCode {
    let tab_id = log.tab_id.as_deref().unwrap_or("-");
    match log.level.as_deref().unwrap_or("info") {
        "error" => error!(target: "worker", tab_id, "{}", log.message),
        "warn" | "warning" => warn!(target: "worker", tab_id, "{}", log.message),
        "debug" => debug!(target: "worker", tab_id, "{}", log.message),
        _ => info!(target: "worker", tab_id, "{}", log.message),
    }
    StatusCode::NO_CONTENT
}
