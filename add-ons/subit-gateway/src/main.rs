//! Subit gateway: HTTP front for single-flight media transcription.
//!
//! Usage:
//!   cargo run -p subit-gateway
//!
//! Config from `config/subit.toml` (or `SUBIT_CONFIG`) and `SUBIT__*` env vars; `.env` is loaded first.

mod handlers;
mod state;
mod upload;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use subit_core::{Janitor, SubitConfig, TaskSupervisor};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use state::AppState;

#[tokio::main]
async fn main() {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[subit-gateway] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match SubitConfig::load() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(target: "subit::gateway", "invalid configuration: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = config.ensure_dirs() {
        tracing::error!(target: "subit::gateway", "cannot create upload/temp dirs: {}", e);
        std::process::exit(1);
    }

    // Leftovers from a previous run are never resumed.
    let janitor = Janitor::new(config.janitor_config());
    for dir in [&config.upload_dir, &config.temp_dir] {
        let report = janitor.sweep_dir(dir, None);
        if !report.removed.is_empty() {
            tracing::info!(
                target: "subit::gateway",
                "cleared {} stale file(s) from {}",
                report.removed.len(),
                dir.display()
            );
        }
    }

    // Blocking HTTP clients and model loads stay off the async runtime.
    let recognizer_config = config.recognizer.clone();
    let recognizer = match tokio::task::spawn_blocking(move || {
        subit_voice::build_recognizer(&recognizer_config)
    })
    .await
    {
        Ok(Ok(r)) => r,
        Ok(Err(e)) => {
            tracing::error!(target: "subit::gateway", "recognizer unavailable: {}", e);
            std::process::exit(1);
        }
        Err(e) => {
            tracing::error!(target: "subit::gateway", "recognizer init panicked: {}", e);
            std::process::exit(1);
        }
    };
    tracing::info!(target: "subit::gateway", "recognizer: {}", recognizer.name());

    let addr = config.bind_addr();
    let state = AppState::new(config, recognizer);
    let supervisor = Arc::clone(&state.supervisor);
    let app = build_app(state);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(target: "subit::gateway", "cannot bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    tracing::info!(target: "subit::gateway", "Subit listening on {}", addr);

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(supervisor))
        .await
    {
        tracing::error!(target: "subit::gateway", "server error: {}", e);
    }
}

/// Ctrl-C: stop accepting requests and flag the running task. The worker is not joined.
async fn shutdown_signal(supervisor: Arc<TaskSupervisor>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(target: "subit::gateway", "ctrl-c handler failed: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!(target: "subit::gateway", "shutdown requested");
    supervisor.request_cancellation();
}

fn build_app(state: AppState) -> Router {
    let body_limit = usize::try_from(state.config.max_content_length).unwrap_or(usize::MAX);
    Router::new()
        .route("/upload", post(handlers::upload))
        .route("/transcribe", post(handlers::transcribe))
        .route("/progress", get(handlers::progress))
        .route("/transcriptions", get(handlers::transcriptions))
        .route("/reset", post(handlers::reset))
        .route("/config", get(handlers::client_config))
        .route("/video", get(handlers::video))
        .route("/health", get(handlers::health))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use std::path::Path;
    use std::time::Duration;
    use subit_core::{ChunkStreamer, DurationProbe, TaskWorker};
    use subit_voice::PlaceholderRecognizer;
    use tower::ServiceExt;

    const BOUNDARY: &str = "subit-test-boundary";

    fn test_config(dir: &Path) -> SubitConfig {
        SubitConfig {
            upload_dir: dir.join("uploads"),
            temp_dir: dir.join("temp"),
            ffprobe_path: "/nonexistent/ffprobe".to_string(),
            ffmpeg_path: "/nonexistent/ffmpeg".to_string(),
            join_timeout_ms: 5_000,
            ..SubitConfig::default()
        }
    }

    fn test_state(dir: &Path) -> AppState {
        let config = test_config(dir);
        config.ensure_dirs().unwrap();
        AppState::new(config, Arc::new(PlaceholderRecognizer::new()))
    }

    fn multipart_body(field: &str, filename: &str, content: &[u8]) -> Vec<u8> {
        let mut body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"{f}\"; filename=\"{n}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
            b = BOUNDARY,
            f = field,
            n = filename
        )
        .into_bytes();
        body.extend_from_slice(content);
        body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());
        body
    }

    fn upload_request(field: &str, filename: &str, content: &[u8]) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/upload")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(multipart_body(field, filename, content)))
            .unwrap()
    }

    fn json_post(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let res = app.clone().oneshot(req).await.unwrap();
        let status = res.status();
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn upload_without_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_app(test_state(dir.path()));
        let req = Request::builder()
            .method("POST")
            .uri("/upload")
            .body(Body::empty())
            .unwrap();
        let (status, json) = send(&app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["success"], false);
        assert!(json["message"].as_str().unwrap().contains("No file"));

        let (status, json) = send(&app, upload_request("other", "a.mp4", b"data")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["message"].as_str().unwrap().contains("No file"));
    }

    #[tokio::test]
    async fn upload_validates_name_type_and_content() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_app(test_state(dir.path()));

        let (status, json) = send(&app, upload_request("file", "", b"data")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["message"], "No file selected");

        let (status, json) = send(&app, upload_request("file", "notes.txt", b"data")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["message"].as_str().unwrap().starts_with("Invalid file type"));

        let (status, json) = send(&app, upload_request("file", "empty.mp4", b"")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["message"], "Uploaded file is empty");
        assert_eq!(std::fs::read_dir(dir.path().join("uploads")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn upload_stages_and_replaces_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_app(test_state(dir.path()));

        let (status, first) = send(&app, upload_request("file", "My Talk.MP4", b"first")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["success"], true);
        assert_eq!(first["ready"], true);
        assert_eq!(first["filename"], "My_Talk.MP4");
        assert_eq!(first["duration"], 0.0);
        let first_id = first["video_id"].as_str().unwrap().to_string();
        let first_path = dir.path().join("uploads").join(format!("{}.mp4", first_id));
        assert_eq!(std::fs::read(&first_path).unwrap(), b"first");

        let (status, video) = send(&app, get_req("/video")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(video["video_id"], first_id.as_str());

        let (status, second) = send(&app, upload_request("file", "b.mkv", b"second")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(!first_path.exists());
        let (_, video) = send(&app, get_req("/video")).await;
        assert_eq!(video["video_id"], second["video_id"]);
    }

    #[tokio::test]
    async fn transcribe_without_upload_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_app(test_state(dir.path()));
        let (status, json) = send(&app, json_post("/transcribe", serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["message"].as_str().unwrap().contains("No video"));

        let req = Request::builder()
            .method("POST")
            .uri("/transcribe")
            .body(Body::empty())
            .unwrap();
        let (status, json) = send(&app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["message"].as_str().unwrap().contains("No video"));
    }

    #[tokio::test]
    async fn transcribe_rejects_unknown_video_id() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_app(test_state(dir.path()));
        let (status, _) = send(&app, upload_request("file", "a.mp4", b"data")).await;
        assert_eq!(status, StatusCode::OK);
        let (status, json) = send(
            &app,
            json_post("/transcribe", serde_json::json!({ "video_id": "not-it" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["message"], "Invalid video_id");
    }

    #[tokio::test]
    async fn idle_progress_and_transcriptions() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_app(test_state(dir.path()));
        let (status, p) = send(&app, get_req("/progress")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(p["is_processing"], false);
        assert_eq!(p["progress"], 0);
        assert_eq!(p["completed_chunks"], 0);
        assert_eq!(p["total_chunks"], 0);

        let (status, t) = send(&app, get_req("/transcriptions")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(t["transcriptions"], serde_json::json!([]));
        assert_eq!(t["completed"], 0);
    }

    #[tokio::test]
    async fn reset_clears_staged_upload() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_app(test_state(dir.path()));
        let (_, up) = send(&app, upload_request("file", "a.webm", b"data")).await;
        let path = dir
            .path()
            .join("uploads")
            .join(format!("{}.webm", up["video_id"].as_str().unwrap()));
        assert!(path.exists());

        let (status, json) = send(&app, json_post("/reset", serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["success"], true);
        assert!(!path.exists());
        let (status, _) = send(&app, get_req("/video")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn config_and_health() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_app(test_state(dir.path()));
        let (status, c) = send(&app, get_req("/config")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(c["max_file_size"], 524_288_000u64);
        assert_eq!(c["max_file_size_mb"], 500.0);
        assert_eq!(c["poll_interval"], 500);

        let res = app.clone().oneshot(get_req("/health")).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"OK");
    }

    #[cfg(unix)]
    mod with_fake_decoder {
        use super::*;
        use std::process::Command;
        use subit_core::DecodeCommand;

        struct Stalled;

        impl DecodeCommand for Stalled {
            fn command(&self, _source: &Path, _sample_rate: u32) -> Command {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg("sleep 30");
                cmd
            }
        }

        struct Fixed(f64);

        impl DurationProbe for Fixed {
            fn probe(&self, _source: &Path) -> f64 {
                self.0
            }
        }

        fn stalled_state(dir: &Path) -> AppState {
            let config = test_config(dir);
            config.ensure_dirs().unwrap();
            let supervisor = Arc::new(TaskSupervisor::new(Janitor::new(config.janitor_config())));
            let worker = Arc::new(TaskWorker::new(
                Arc::clone(&supervisor),
                Arc::new(Fixed(30.0)),
                ChunkStreamer::new(Arc::new(Stalled), Duration::from_millis(50)),
                Arc::new(PlaceholderRecognizer::new()),
                config.sample_rate,
                config.chunk_duration(),
            ));
            AppState::from_parts(config, supervisor, worker, Arc::new(Fixed(30.0)))
        }

        #[tokio::test(flavor = "multi_thread")]
        async fn second_transcribe_conflicts_and_upload_replaces_task() {
            let dir = tempfile::tempdir().unwrap();
            let app = build_app(stalled_state(dir.path()));

            let (_, up) = send(&app, upload_request("file", "a.mp4", b"data")).await;
            assert_eq!(up["duration"], 30.0);
            let video_id = up["video_id"].as_str().unwrap().to_string();
            let (status, started) = send(
                &app,
                json_post("/transcribe", serde_json::json!({ "video_id": video_id })),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert!(started["task_id"].as_str().is_some());

            let (_, p) = send(&app, get_req("/progress")).await;
            assert_eq!(p["is_processing"], true);
            let mut total = serde_json::Value::Null;
            for _ in 0..100 {
                let (_, p) = send(&app, get_req("/progress")).await;
                total = p["total_chunks"].clone();
                if total == 3 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            assert_eq!(total, 3);

            let (status, json) = send(&app, json_post("/transcribe", serde_json::json!({}))).await;
            assert_eq!(status, StatusCode::CONFLICT);
            assert_eq!(json["success"], false);

            // New upload cancels and joins the stalled task, then B starts clean.
            let (status, up_b) = send(&app, upload_request("file", "b.mp4", b"data")).await;
            assert_eq!(status, StatusCode::OK);
            let (_, p) = send(&app, get_req("/progress")).await;
            assert_eq!(p["is_processing"], false);

            let (status, _) = send(
                &app,
                json_post("/transcribe", serde_json::json!({ "taskId": up_b["video_id"] })),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            let (_, p) = send(&app, get_req("/progress")).await;
            assert_eq!(p["completed_chunks"], 0);

            let (status, _) = send(&app, json_post("/reset", serde_json::json!({}))).await;
            assert_eq!(status, StatusCode::OK);
            let (_, p) = send(&app, get_req("/progress")).await;
            assert_eq!(p["is_processing"], false);
        }
    }
}
