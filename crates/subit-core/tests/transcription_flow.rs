//! End-to-end flows through supervisor, streamer, worker and janitor with a fake decoder.
#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, Instant};
use subit_core::{
    estimate_chunk_count, ChunkStreamer, DecodeCommand, DurationProbe, Janitor, StagedSource,
    TaskSupervisor, TaskWorker,
};
use subit_voice::PlaceholderRecognizer;

/// 100 Hz mono f32: one second is 400 bytes.
const RATE: u32 = 100;

/// Emits `seconds` of silence, or stalls forever when `seconds` is `None`.
struct FakeDecoder {
    seconds: Option<u32>,
}

impl DecodeCommand for FakeDecoder {
    fn command(&self, _source: &Path, sample_rate: u32) -> Command {
        let script = match self.seconds {
            Some(s) => format!("head -c {} /dev/zero", s * sample_rate * 4),
            None => "sleep 60".to_string(),
        };
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }
}

struct FixedProbe(f64);

impl DurationProbe for FixedProbe {
    fn probe(&self, _source: &Path) -> f64 {
        self.0
    }
}

fn worker(sup: &Arc<TaskSupervisor>, seconds: Option<u32>) -> Arc<TaskWorker> {
    Arc::new(TaskWorker::new(
        Arc::clone(sup),
        Arc::new(FixedProbe(seconds.map(f64::from).unwrap_or(60.0))),
        ChunkStreamer::new(Arc::new(FakeDecoder { seconds }), Duration::from_millis(50)),
        Arc::new(PlaceholderRecognizer::with_response("words")),
        RATE,
        Duration::from_secs(10),
    ))
}

fn wait_idle(sup: &TaskSupervisor, within: Duration) -> bool {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if !sup.snapshot_progress().is_processing {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}

fn stage(sup: &TaskSupervisor, dir: &Path, name: &str) -> StagedSource {
    let path = dir.join(format!("{}.mp4", name));
    std::fs::write(&path, b"media").unwrap();
    let staged = StagedSource {
        source_id: name.to_string(),
        path,
        filename: format!("{}.mp4", name),
        duration: 0.0,
    };
    sup.stage_source(staged.clone());
    staged
}

#[test]
fn twenty_five_seconds_yield_three_contiguous_segments() {
    assert_eq!(estimate_chunk_count(25.0, 10.0), 3);

    let sup = Arc::new(TaskSupervisor::default());
    let token = sup.start_task(PathBuf::from("talk.mp4"), "talk").unwrap();
    worker(&sup, Some(25)).spawn(token).unwrap();
    assert!(wait_idle(&sup, Duration::from_secs(10)));

    let segs = sup.transcriptions();
    let spans: Vec<(usize, f64, f64)> = segs.iter().map(|s| (s.index, s.start_time, s.end_time)).collect();
    assert_eq!(spans, vec![(0, 0.0, 10.0), (1, 10.0, 20.0), (2, 20.0, 25.0)]);

    let p = sup.snapshot_progress();
    assert_eq!(p.completed_count, 3);
    assert_eq!(p.total_count, 3);
    assert_eq!(p.percent, 100);
    assert_eq!(p.duration, 25.0);
}

#[test]
fn cancellation_stops_a_stalled_task_promptly() {
    let sup = Arc::new(TaskSupervisor::default());
    let token = sup.start_task(PathBuf::from("long.mp4"), "long").unwrap();
    worker(&sup, None).spawn(token).unwrap();
    std::thread::sleep(Duration::from_millis(100));

    let began = Instant::now();
    sup.request_cancellation();
    assert!(wait_idle(&sup, Duration::from_secs(3)));
    assert!(began.elapsed() < Duration::from_secs(3));
    assert!(sup.transcriptions().is_empty());
}

#[test]
fn replacing_a_running_task_starts_clean() {
    let dir = tempfile::tempdir().unwrap();
    let sup = Arc::new(TaskSupervisor::new(Janitor::default()));

    // A is mid-transcription when B arrives.
    let a = stage(&sup, dir.path(), "a");
    let token = sup.start_task(a.path.clone(), &a.source_id).unwrap();
    worker(&sup, None).spawn(token).unwrap();
    std::thread::sleep(Duration::from_millis(100));
    assert!(!sup.can_start_new_task());

    // Upload of B: cancel-and-join A, wipe everything except B.
    let b_path = dir.path().join("b.mp4");
    std::fs::write(&b_path, b"media").unwrap();
    assert!(sup.cancel_and_join(Duration::from_secs(10)));
    sup.reset_all(true, Some(b_path.as_path()));
    let b = stage(&sup, dir.path(), "b");
    assert!(!a.path.exists());
    assert!(b.path.exists());

    let token = sup.start_task(b.path.clone(), &b.source_id).unwrap();
    assert_eq!(sup.snapshot_progress().completed_count, 0);
    worker(&sup, Some(12)).spawn(token).unwrap();
    assert!(wait_idle(&sup, Duration::from_secs(10)));

    let segs = sup.transcriptions();
    assert_eq!(segs.len(), 2);
    assert_eq!(segs[1].end_time, 12.0);
    assert_eq!(sup.current_source_id().as_deref(), Some("b"));
}

#[test]
fn reset_without_join_fences_off_the_old_worker() {
    let sup = Arc::new(TaskSupervisor::default());
    let old = sup.start_task(PathBuf::from("old.mp4"), "old").unwrap();
    let old_handle = old.handle().clone();
    worker(&sup, None).spawn(old).unwrap();

    sup.reset_all(false, None);
    let new = sup.start_task(PathBuf::from("new.mp4"), "new").unwrap();
    assert!(old_handle.wait(Duration::from_secs(3)));

    // The old worker's completion did not end the new task.
    assert!(sup.snapshot_progress().is_processing);
    assert_eq!(sup.current_task_id().as_deref(), Some(new.task_id()));
}
