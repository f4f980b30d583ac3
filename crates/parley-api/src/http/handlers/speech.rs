//! Speech request and status handlers.

use std::collections::HashMap;
use std::time::Instant;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use parley_infra::sink::FileSink;
use parley_types::request::RequestState;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::pipeline::submit_speech;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SpeakBody {
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct SpeakAccepted {
    /// Pool task name, usable with the websocket `cancel` command.
    pub task: String,
    pub output: String,
}

#[derive(Debug, Serialize)]
pub struct StatusView {
    pub request: RequestState,
    /// Task name to running flag.
    pub tasks: HashMap<String, bool>,
    pub listeners: usize,
    pub workers: usize,
}

/// POST /api/v1/speak - start a speech request, audio goes to the data dir.
pub async fn speak(
    State(state): State<AppState>,
    Json(body): Json<SpeakBody>,
) -> Result<(StatusCode, Json<ApiResponse<SpeakAccepted>>), AppError> {
    let started = Instant::now();
    let request_id = Uuid::now_v7();

    if body.text.trim().is_empty() {
        return Err(AppError::Validation("text must not be empty".to_string()));
    }
    if state.tracker.snapshot().is_processing {
        return Err(AppError::Busy);
    }

    let output = state
        .data_dir
        .join("replies")
        .join(format!("{request_id}.pcm"));
    let sink = FileSink::create(&output)
        .map_err(|e| AppError::Internal(format!("cannot create {}: {e}", output.display())))?;

    let handle = submit_speech(&state, body.text, sink)?;
    tracing::info!(task = %handle.name(), output = %output.display(), "Speech request accepted");

    let accepted = SpeakAccepted {
        task: handle.name().to_string(),
        output: output.display().to_string(),
    };
    let elapsed = started.elapsed().as_millis() as u64;
    Ok((
        StatusCode::ACCEPTED,
        Json(ApiResponse::success(accepted, request_id.to_string(), elapsed)),
    ))
}

/// GET /api/v1/status - request snapshot, running tasks and listener count.
pub async fn status(State(state): State<AppState>) -> Json<ApiResponse<StatusView>> {
    let started = Instant::now();
    let view = StatusView {
        request: state.tracker.snapshot(),
        tasks: state.pool.active_tasks(),
        listeners: state.broadcaster.connection_count(),
        workers: state.pool.workers(),
    };
    let elapsed = started.elapsed().as_millis() as u64;
    Json(ApiResponse::success(view, Uuid::now_v7().to_string(), elapsed))
}
