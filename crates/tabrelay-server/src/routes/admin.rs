//! Model list, model-table refresh, config view and status.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::ApiResult;
use crate::state::AppState;
use tabrelay_chat::{ErrorBody, ModelList};
use tabrelay_core::extract_models_from_html;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(banner))
        .route("/v1/models", get(list_models))
        .route("/update_models", post(update_models))
        .route("/get_config", get(get_config))
        .route("/status", get(status))
}

async fn banner(State(state): State<Arc<AppState>>) -> String {
    format!("tabrelay {} is running\n", state.config.read().version)
}

// ---------------------------------------------------------------
// Models
// ---------------------------------------------------------------

async fn list_models(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let models = state.models.read();
    if models.is_empty() {
        return (
            StatusCode::NOT_FOUND,
            Json(json!(ErrorBody::new(
                "model table is empty; let a worker post the page to /update_models",
                "not_found",
            ))),
        );
    }
    let created = state.started_at.timestamp();
    (
        StatusCode::OK,
        Json(json!(ModelList::from_names(models.names(), created))),
    )
}

fn update_error(message: &str) -> (StatusCode, Json<Value>) {
    warn!("Model update rejected: {}", message);
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"status": "error", "message": message})),
    )
}

/// Body is the chat page HTML as scraped by a worker.
async fn update_models(
    State(state): State<Arc<AppState>>,
    html: String,
) -> ApiResult<(StatusCode, Json<Value>)> {
    if html.trim().is_empty() {
        return Ok(update_error("empty request body"));
    }
    let Some(scraped) = extract_models_from_html(&html) else {
        return Ok(update_error("no model table found in page HTML"));
    };

    let diff = state.models.write().apply_scraped(&scraped)?;
    info!(
        added = diff.added.len(),
        removed = diff.removed.len(),
        changed = diff.changed.len(),
        "Model table refreshed"
    );
    Ok((
        StatusCode::OK,
        Json(json!({
            "status": "success",
            "count": scraped.len(),
            "changes": diff,
        })),
    ))
}

// ---------------------------------------------------------------
// Config & status
// ---------------------------------------------------------------

async fn get_config(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(state.config.read().to_public_json())
}

async fn status(State(state): State<Arc<AppState>>) -> Json<Value> {
    let snapshot = state.dispatcher.snapshot();
    Json(json!({
        "version": state.config.read().version,
        "uptime_secs": (chrono::Utc::now() - state.started_at).num_seconds(),
        "sessions": snapshot.sessions,
        "queued": snapshot.queued,
        "queued_task_ids": snapshot.queued_task_ids,
        "in_flight": state.tasks.len(),
        "tasks": state.tasks.records(),
        "models": state.models.read().len(),
    }))
}
