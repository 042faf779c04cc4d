//! HTTP handlers: upload, transcribe, progress polling, transcript fetch, reset.
//!
//! POST /upload          multipart `file` → stage it, replacing any running task.
//! POST /transcribe      `{video_id}` → start the single background task.
//! GET  /progress        task progress snapshot.
//! GET  /transcriptions  ordered segments plus counts.
//! POST /reset           cancel, join (bounded), wipe state and files.
//! GET  /config, /video, /health.

use crate::state::AppState;
use crate::upload::{extension_of, save_field, secure_filename};
use axum::body::Bytes;
use axum::extract::multipart::MultipartRejection;
use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use subit_core::StagedSource;

type ApiResponse = (StatusCode, Json<serde_json::Value>);

fn fail(status: StatusCode, message: impl Into<String>) -> ApiResponse {
    (
        status,
        Json(json!({ "success": false, "message": message.into() })),
    )
}

#[derive(Debug, Default, Deserialize)]
pub struct TranscribeRequest {
    #[serde(default, alias = "taskId", alias = "task_id")]
    pub video_id: Option<String>,
}

/// POST /upload: validate, store as `<uuid><ext>`, then cancel-and-join the running task,
/// clear everything but the new file, probe its duration and stage it.
///
/// Validation and the disk write happen before the cancel, not after: a rejected or
/// failed upload leaves the running task untouched. The worker never reads the new
/// file, so writing it while the old task is still stopping is safe.
pub async fn upload(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResponse {
    let Ok(mut multipart) = multipart else {
        return fail(StatusCode::BAD_REQUEST, "No file provided");
    };

    let field = loop {
        match multipart.next_field().await {
            Ok(Some(field)) if field.name() == Some("file") => break field,
            Ok(Some(_)) => continue,
            Ok(None) => return fail(StatusCode::BAD_REQUEST, "No file provided"),
            Err(e) => return fail(e.status(), e.body_text()),
        }
    };

    let client_name = field.file_name().unwrap_or_default().to_string();
    if client_name.trim().is_empty() {
        return fail(StatusCode::BAD_REQUEST, "No file selected");
    }
    if !state.config.is_allowed_file(&client_name) {
        return fail(
            StatusCode::BAD_REQUEST,
            format!(
                "Invalid file type. Allowed: {}",
                state.config.allowed_extensions.join(", ")
            ),
        );
    }

    let video_id = uuid::Uuid::new_v4().to_string();
    let filename = secure_filename(&client_name);
    let save_path = state
        .config
        .upload_dir
        .join(format!("{}{}", video_id, extension_of(&client_name)));

    let written = match save_field(field, &save_path).await {
        Ok(n) => n,
        Err((status, message)) => {
            tracing::warn!(target: "subit::gateway", "upload of {} failed: {}", client_name, message);
            return fail(status, message);
        }
    };
    if written == 0 {
        let _ = tokio::fs::remove_file(&save_path).await;
        return fail(StatusCode::BAD_REQUEST, "Uploaded file is empty");
    }

    let supervisor = state.supervisor.clone();
    let prober = state.prober.clone();
    let join_timeout = state.config.join_timeout();
    let keep = save_path.clone();
    let duration = match tokio::task::spawn_blocking(move || {
        if !supervisor.cancel_and_join(join_timeout) {
            tracing::warn!(target: "subit::gateway", "previous worker did not stop in time; replacing anyway");
        }
        supervisor.reset_all(true, Some(&keep));
        prober.probe(&keep)
    })
    .await
    {
        Ok(d) => d,
        Err(e) => {
            tracing::error!(target: "subit::gateway", "upload staging panicked: {}", e);
            return fail(StatusCode::INTERNAL_SERVER_ERROR, "Failed to stage upload");
        }
    };

    state.supervisor.stage_source(StagedSource {
        source_id: video_id.clone(),
        path: save_path,
        filename: filename.clone(),
        duration,
    });
    tracing::info!(
        target: "subit::gateway",
        "uploaded {} ({} bytes, {:.1}s) as {}",
        filename,
        written,
        duration,
        video_id
    );

    (
        StatusCode::OK,
        Json(json!({
            "success": true,
            "video_id": video_id,
            "filename": filename,
            "duration": duration,
            "ready": true,
        })),
    )
}

/// POST /transcribe: 409 while a task is active; 400 for a stale id or nothing staged.
pub async fn transcribe(State(state): State<AppState>, body: Bytes) -> ApiResponse {
    if !state.supervisor.can_start_new_task() {
        return fail(StatusCode::CONFLICT, "Another task is in progress");
    }

    let request: TranscribeRequest = if body.iter().all(u8::is_ascii_whitespace) {
        TranscribeRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(r) => r,
            Err(e) => return fail(StatusCode::BAD_REQUEST, format!("Invalid JSON body: {}", e)),
        }
    };

    if let Some(id) = request.video_id.as_deref().filter(|id| !id.is_empty()) {
        if !state.supervisor.is_same_source(id) {
            return fail(StatusCode::BAD_REQUEST, "Invalid video_id");
        }
    }
    let Some(staged) = state.supervisor.staged_source() else {
        return fail(StatusCode::BAD_REQUEST, "No video uploaded");
    };

    let Some(token) = state
        .supervisor
        .start_task(staged.path.clone(), &staged.source_id)
    else {
        return fail(StatusCode::CONFLICT, "Another task is in progress");
    };
    let task_id = token.task_id().to_string();
    if let Err(e) = state.worker.spawn(token) {
        tracing::error!(target: "subit::gateway", "could not spawn worker: {}", e);
        return fail(StatusCode::INTERNAL_SERVER_ERROR, "Failed to start task");
    }

    (
        StatusCode::OK,
        Json(json!({
            "success": true,
            "message": "Transcription started",
            "task_id": task_id,
        })),
    )
}

/// GET /progress
pub async fn progress(State(state): State<AppState>) -> Json<subit_core::ProgressSnapshot> {
    Json(state.supervisor.snapshot_progress())
}

/// GET /transcriptions
pub async fn transcriptions(State(state): State<AppState>) -> Json<serde_json::Value> {
    let progress = state.supervisor.snapshot_progress();
    let segments = state.supervisor.transcriptions();
    Json(json!({
        "transcriptions": segments,
        "total": progress.total_count,
        "completed": progress.completed_count,
    }))
}

/// POST /reset: best-effort join, then wipe all task state and tracked files.
pub async fn reset(State(state): State<AppState>) -> ApiResponse {
    let supervisor = state.supervisor.clone();
    let join_timeout = state.config.join_timeout();
    let joined = tokio::task::spawn_blocking(move || {
        let stopped = supervisor.cancel_and_join(join_timeout);
        supervisor.reset_all(true, None);
        stopped
    })
    .await;
    match joined {
        Ok(stopped) => {
            if !stopped {
                tracing::warn!(target: "subit::gateway", "reset proceeded while the worker was still stopping");
            }
            (
                StatusCode::OK,
                Json(json!({ "success": true, "message": "State reset" })),
            )
        }
        Err(e) => {
            tracing::error!(target: "subit::gateway", "reset panicked: {}", e);
            fail(StatusCode::INTERNAL_SERVER_ERROR, "Reset failed")
        }
    }
}

/// GET /config: client-side limits and polling cadence.
pub async fn client_config(State(state): State<AppState>) -> Json<serde_json::Value> {
    let max = state.config.max_content_length;
    Json(json!({
        "max_file_size": max,
        "max_file_size_mb": max as f64 / 1024.0 / 1024.0,
        "poll_interval": state.config.poll_interval_ms,
        "allowed_extensions": state.config.allowed_extensions,
    }))
}

/// GET /video: the staged upload, if any.
pub async fn video(State(state): State<AppState>) -> ApiResponse {
    match state.supervisor.staged_source() {
        Some(s) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "video_id": s.source_id,
                "filename": s.filename,
                "duration": s.duration,
            })),
        ),
        None => fail(StatusCode::NOT_FOUND, "No video uploaded"),
    }
}

pub async fn health() -> &'static str {
    "OK"
}
