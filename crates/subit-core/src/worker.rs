//! Background worker: staged media → ChunkStreamer → Recognizer → TaskSupervisor segments.
//!
//! Runs one task on a dedicated thread. Whatever ends the run (end of stream,
//! cancellation, decode or recognition failure, even a panic), the task is marked
//! completed and its `WorkerHandle` signalled, so the supervisor never keeps
//! reporting "processing" for a worker that has stopped.

use crate::config::SubitConfig;
use crate::error::{JobError, JobResult};
use crate::probe::{estimate_chunk_count, DurationProbe, FfprobeProbe};
use crate::streamer::ChunkStreamer;
use crate::supervisor::{TaskSupervisor, TaskToken};
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use subit_voice::{Recognizer, RECOGNIZER_SAMPLE_RATE};
use tracing::{debug, error, info, warn};

pub struct TaskWorker {
    supervisor: Arc<TaskSupervisor>,
    prober: Arc<dyn DurationProbe>,
    streamer: ChunkStreamer,
    recognizer: Arc<dyn Recognizer>,
    sample_rate: u32,
    chunk_duration: Duration,
}

impl TaskWorker {
    pub fn new(
        supervisor: Arc<TaskSupervisor>,
        prober: Arc<dyn DurationProbe>,
        streamer: ChunkStreamer,
        recognizer: Arc<dyn Recognizer>,
        sample_rate: u32,
        chunk_duration: Duration,
    ) -> Self {
        if sample_rate != RECOGNIZER_SAMPLE_RATE {
            warn!(
                target: "subit::worker",
                "sample rate {} Hz differs from the recognizer's {} Hz",
                sample_rate,
                RECOGNIZER_SAMPLE_RATE
            );
        }
        Self {
            supervisor,
            prober,
            streamer,
            recognizer,
            sample_rate,
            chunk_duration,
        }
    }

    /// ffprobe + ffmpeg as configured.
    pub fn from_config(
        supervisor: Arc<TaskSupervisor>,
        config: &SubitConfig,
        recognizer: Arc<dyn Recognizer>,
    ) -> Self {
        Self::new(
            supervisor,
            Arc::new(FfprobeProbe::new(&config.ffprobe_path)),
            ChunkStreamer::ffmpeg(&config.ffmpeg_path, config.read_timeout()),
            recognizer,
            config.sample_rate,
            config.chunk_duration(),
        )
    }

    /// Run the task on a new thread. The thread is detached; join through the token's handle.
    pub fn spawn(self: &Arc<Self>, token: TaskToken) -> io::Result<thread::JoinHandle<()>> {
        let worker = Arc::clone(self);
        let fallback = token.clone();
        let spawned = thread::Builder::new()
            .name("subit-worker".to_string())
            .spawn(move || worker.run(&token));
        if spawned.is_err() {
            // The closure never ran, so nothing else will release the task.
            self.supervisor.complete_task(&fallback);
            fallback.handle().mark_done();
        }
        spawned
    }

    /// Run the task on the current thread; always completes it.
    pub fn run(&self, token: &TaskToken) {
        let _guard = CompletionGuard {
            supervisor: &self.supervisor,
            token,
        };
        match self.run_blocking(token) {
            Ok(()) => info!(target: "subit::worker", "task {} finished", token.task_id()),
            Err(e) if e.is_cancelled() => {
                info!(target: "subit::worker", "task {} cancelled", token.task_id())
            }
            Err(e) => error!(target: "subit::worker", "task {} failed: {}", token.task_id(), e),
        }
    }

    /// Probe, publish the estimate, then recognize window by window.
    pub fn run_blocking(&self, token: &TaskToken) -> JobResult<()> {
        let source = token.source();
        let duration = self.prober.probe(source);
        let estimate = estimate_chunk_count(duration, self.chunk_duration.as_secs_f64());
        self.supervisor.set_duration(token, duration);
        self.supervisor.set_total_chunks(token, estimate);
        info!(
            target: "subit::worker",
            "task {}: {} ({:.2}s, ~{} chunk(s), recognizer {})",
            token.task_id(),
            source.display(),
            duration,
            estimate,
            self.recognizer.name()
        );

        let stream = self
            .streamer
            .stream(source, self.sample_rate, self.chunk_duration, || {
                token.is_cancelled()
            })?;
        for window in stream {
            let window = window?;
            if token.is_cancelled() {
                return Err(JobError::Cancelled);
            }
            let recognition = self.recognizer.recognize(&window)?;
            // Result of a call that outlived cancellation is discarded.
            if token.is_cancelled() {
                return Err(JobError::Cancelled);
            }
            let text = recognition.text.trim();
            debug!(
                target: "subit::worker",
                "chunk {} [{:.1}-{:.1}] {:.1}s: {}",
                window.index,
                window.start_time,
                window.end_time,
                window.duration(),
                text
            );
            if !self.supervisor.append_segment(
                token,
                window.index,
                text,
                window.start_time,
                window.end_time,
            ) {
                return Err(JobError::Cancelled);
            }
        }
        self.supervisor.finish_stream(token);
        Ok(())
    }
}

/// Completes the task and signals the handle on drop, including unwinding.
struct CompletionGuard<'a> {
    supervisor: &'a TaskSupervisor,
    token: &'a TaskToken,
}

impl Drop for CompletionGuard<'_> {
    fn drop(&mut self) {
        self.supervisor.complete_task(self.token);
        self.token.handle().mark_done();
    }
}
