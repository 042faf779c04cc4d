//! Subit CLI: transcribe one media file offline through the same supervisor/worker path
//! the HTTP service uses.
//!
//! Usage:
//!   cargo run -p subit-core --bin subit-cli -- <file> [--chunk SECS] [--json]
//!
//! Recognizer and tool paths come from `config/subit.toml` and `SUBIT__*` env vars.

use std::path::PathBuf;
use std::sync::Arc;
use subit_core::{
    DurationProbe, FfprobeProbe, Janitor, StagedSource, SubitConfig, TaskSupervisor, TaskWorker,
};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut args = std::env::args().skip(1);
    let mut input: Option<PathBuf> = None;
    let mut chunk_secs: Option<u32> = None;
    let mut as_json = false;

    while let Some(a) = args.next() {
        match a.as_str() {
            "--chunk" => {
                if let Some(n) = args.next() {
                    chunk_secs = n.parse().ok();
                }
            }
            "--json" => as_json = true,
            _ if input.is_none() => input = Some(PathBuf::from(a)),
            _ => {}
        }
    }

    let Some(input) = input else {
        eprintln!("Subit: offline transcription");
        eprintln!("  subit-cli <file>      Transcribe a media file and print timed segments");
        eprintln!("  --chunk SECS          Window length (default: chunk_duration_secs from config)");
        eprintln!("  --json                Print segments as JSON");
        eprintln!();
        eprintln!("Recognizer: SUBIT__RECOGNIZER__BACKEND=placeholder|http|whisper");
        return Ok(());
    };
    if !input.is_file() {
        return Err(format!("{} is not a file", input.display()).into());
    }

    let mut config = SubitConfig::load()?;
    if let Some(secs) = chunk_secs.filter(|s| *s > 0) {
        config.chunk_duration_secs = secs;
    }

    let recognizer = subit_voice::build_recognizer(&config.recognizer)?;
    let supervisor = Arc::new(TaskSupervisor::new(Janitor::new(config.janitor_config())));
    let worker = TaskWorker::from_config(Arc::clone(&supervisor), &config, recognizer);

    let filename = input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let source_id = uuid::Uuid::new_v4().to_string();
    supervisor.stage_source(StagedSource {
        source_id: source_id.clone(),
        path: input.clone(),
        filename,
        duration: FfprobeProbe::new(&config.ffprobe_path).probe(&input),
    });

    let token = supervisor
        .start_task(input.clone(), &source_id)
        .ok_or("supervisor busy")?;
    worker.run(&token);

    let progress = supervisor.snapshot_progress();
    let segments = supervisor.transcriptions();
    info!(
        "done: {}/{} chunk(s), {:.1}s audio",
        progress.completed_count,
        progress.total_count,
        progress.duration
    );
    if as_json {
        println!("{}", serde_json::to_string_pretty(&segments)?);
    } else {
        for s in &segments {
            println!("[{:>7.2}s - {:>7.2}s] {}", s.start_time, s.end_time, s.text);
        }
    }
    if progress.completed_count < progress.total_count {
        return Err("transcription stopped early; see log".into());
    }
    Ok(())
}
