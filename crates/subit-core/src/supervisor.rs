//! Single-flight task supervisor.
//!
//! Owns "is a job running", the job's accumulated segments, the staged upload and
//! the handle of the worker executing the job. Every operation takes the one state
//! lock for its whole duration; recognition and file deletion happen outside it.
//!
//! Worker-side writes carry the `TaskToken` returned by `start_task` and are dropped
//! once that token no longer names the current task, so a worker that outlived a
//! timed-out join can neither write into nor complete its replacement.

use crate::janitor::{CleanupReport, Janitor};
use crate::transcript::TranscriptSegment;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Idle,
    Running,
    Cancelling,
    Completed,
}

impl TaskStatus {
    /// Running or Cancelling.
    pub fn is_active(self) -> bool {
        matches!(self, TaskStatus::Running | TaskStatus::Cancelling)
    }
}

/// Done-signal for one background worker. Clones share the signal.
#[derive(Debug, Clone, Default)]
pub struct WorkerHandle {
    done: Arc<(Mutex<bool>, Condvar)>,
}

impl WorkerHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once by the worker when it has released everything it held.
    pub fn mark_done(&self) {
        let (lock, cvar) = &*self.done;
        *lock.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cvar.notify_all();
    }

    pub fn is_done(&self) -> bool {
        *self.done.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until done or `timeout` elapses. Returns whether the worker finished.
    pub fn wait(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.done;
        let guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = cvar
            .wait_timeout_while(guard, timeout, |done| !*done)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

/// Processing token for one task run.
#[derive(Debug, Clone)]
pub struct TaskToken {
    task_id: String,
    source_id: String,
    source: PathBuf,
    cancel: Arc<AtomicBool>,
    handle: WorkerHandle,
}

impl TaskToken {
    /// Fresh id generated by `start_task`.
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Id of the staged upload this run transcribes.
    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    /// This run's own cancellation flag; stays set after a reset.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn handle(&self) -> &WorkerHandle {
        &self.handle
    }
}

/// An upload waiting to be (or being) transcribed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedSource {
    pub source_id: String,
    pub path: PathBuf,
    /// Original client filename.
    pub filename: String,
    pub duration: f64,
}

impl StagedSource {
    /// `<dir>/<stem>_audio.wav`, the extracted-audio sidecar of this upload.
    pub fn audio_sidecar(&self) -> PathBuf {
        audio_sidecar(&self.path)
    }
}

fn audio_sidecar(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{}_audio.wav", stem))
}

/// Progress as polled by clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub is_processing: bool,
    #[serde(rename = "progress")]
    pub percent: u32,
    #[serde(rename = "completed_chunks")]
    pub completed_count: usize,
    #[serde(rename = "total_chunks")]
    pub total_count: usize,
    #[serde(rename = "audio_duration")]
    pub duration: f64,
}

struct ActiveTask {
    task_id: String,
    source_id: String,
    cancel: Arc<AtomicBool>,
    total_chunks: usize,
    duration: f64,
}

struct SupervisorState {
    status: TaskStatus,
    task: Option<ActiveTask>,
    segments: Vec<TranscriptSegment>,
    handle: Option<WorkerHandle>,
    staged: Option<StagedSource>,
    artifacts: Vec<PathBuf>,
}

impl SupervisorState {
    fn new() -> Self {
        Self {
            status: TaskStatus::Idle,
            task: None,
            segments: Vec::new(),
            handle: None,
            staged: None,
            artifacts: Vec::new(),
        }
    }

    fn current(&mut self, token: &TaskToken) -> Option<&mut ActiveTask> {
        self.task
            .as_mut()
            .filter(|t| t.task_id == token.task_id)
    }

    fn track(&mut self, path: PathBuf) {
        if !self.artifacts.contains(&path) {
            self.artifacts.push(path);
        }
    }
}

/// One explicitly constructed instance is shared (via `Arc`) by the HTTP layer and the worker.
pub struct TaskSupervisor {
    inner: Mutex<SupervisorState>,
    janitor: Janitor,
}

impl Default for TaskSupervisor {
    fn default() -> Self {
        Self::new(Janitor::default())
    }
}

impl TaskSupervisor {
    pub fn new(janitor: Janitor) -> Self {
        Self {
            inner: Mutex::new(SupervisorState::new()),
            janitor,
        }
    }

    fn state(&self) -> MutexGuard<'_, SupervisorState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> TaskStatus {
        self.state().status
    }

    /// True iff no task is Running or Cancelling.
    pub fn can_start_new_task(&self) -> bool {
        !self.state().status.is_active()
    }

    /// Start a task on `source` unless one is already active.
    ///
    /// Clears prior segments, creates the run's cancellation flag and `WorkerHandle`
    /// under the same lock, and returns the token the worker must present on writes.
    /// `None` means "busy, retry later".
    pub fn start_task(&self, source: PathBuf, source_id: &str) -> Option<TaskToken> {
        let mut st = self.state();
        if st.status.is_active() {
            debug!(target: "subit::supervisor", "start refused: task already active");
            return None;
        }
        let token = TaskToken {
            task_id: uuid::Uuid::new_v4().to_string(),
            source_id: source_id.to_string(),
            source,
            cancel: Arc::new(AtomicBool::new(false)),
            handle: WorkerHandle::new(),
        };
        st.segments.clear();
        st.status = TaskStatus::Running;
        st.handle = Some(token.handle.clone());
        st.task = Some(ActiveTask {
            task_id: token.task_id.clone(),
            source_id: token.source_id.clone(),
            cancel: Arc::clone(&token.cancel),
            total_chunks: 0,
            duration: 0.0,
        });
        info!(
            target: "subit::supervisor",
            "task {} started for source {}",
            token.task_id,
            token.source_id
        );
        Some(token)
    }

    /// Running → Cancelling and raise the run's flag. Idempotent, never blocks.
    pub fn request_cancellation(&self) {
        let mut st = self.state();
        if st.status == TaskStatus::Running {
            st.status = TaskStatus::Cancelling;
            if let Some(task) = st.task.as_ref() {
                task.cancel.store(true, Ordering::SeqCst);
                info!(target: "subit::supervisor", "cancellation requested for task {}", task.task_id);
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        let st = self.state();
        st.status == TaskStatus::Cancelling
            || st
                .task
                .as_ref()
                .is_some_and(|t| t.cancel.load(Ordering::SeqCst))
    }

    /// Replace the current worker handle (for workers started outside `start_task`'s handle).
    pub fn attach_worker_handle(&self, handle: WorkerHandle) {
        self.state().handle = Some(handle);
    }

    pub fn worker_handle(&self) -> Option<WorkerHandle> {
        self.state().handle.clone()
    }

    /// Cancel any active task and wait up to `timeout` for its worker to stop.
    /// Returns `false` if the worker was still alive at the deadline.
    pub fn cancel_and_join(&self, timeout: Duration) -> bool {
        self.request_cancellation();
        let Some(handle) = self.worker_handle() else {
            return true;
        };
        if handle.wait(timeout) {
            true
        } else {
            warn!(
                target: "subit::supervisor",
                "worker still running after {:?}; proceeding without it",
                timeout
            );
            false
        }
    }

    /// Append the next segment. Accepted only for the current, Running task at index
    /// `completed_count`; returns whether it was appended.
    pub fn append_segment(
        &self,
        token: &TaskToken,
        index: usize,
        text: &str,
        start_time: f64,
        end_time: f64,
    ) -> bool {
        let mut st = self.state();
        if st.status != TaskStatus::Running || st.current(token).is_none() {
            debug!(target: "subit::supervisor", "segment {} dropped: task {} not running", index, token.task_id);
            return false;
        }
        if index != st.segments.len() {
            warn!(
                target: "subit::supervisor",
                "segment {} out of order (expected {})",
                index,
                st.segments.len()
            );
            return false;
        }
        st.segments.push(TranscriptSegment {
            index,
            text: text.to_string(),
            start_time,
            end_time,
        });
        let completed = st.segments.len();
        if let Some(task) = st.current(token) {
            if completed > task.total_chunks {
                task.total_chunks = completed;
            }
        }
        true
    }

    pub fn set_duration(&self, token: &TaskToken, seconds: f64) {
        if let Some(task) = self.state().current(token) {
            task.duration = seconds;
        }
    }

    pub fn set_total_chunks(&self, token: &TaskToken, total: usize) {
        if let Some(task) = self.state().current(token) {
            task.total_chunks = total;
        }
    }

    /// Natural end of stream: the real window count replaces the estimate.
    pub fn finish_stream(&self, token: &TaskToken) {
        let mut st = self.state();
        if st.status != TaskStatus::Running {
            return;
        }
        let completed = st.segments.len();
        if let Some(task) = st.current(token) {
            if task.total_chunks != completed {
                debug!(
                    target: "subit::supervisor",
                    "total revised {} -> {}",
                    task.total_chunks,
                    completed
                );
                task.total_chunks = completed;
            }
        }
    }

    /// → Completed, whatever ended the run. Ignored for a superseded token.
    pub fn complete_task(&self, token: &TaskToken) {
        let mut st = self.state();
        if st.current(token).is_none() {
            debug!(target: "subit::supervisor", "stale completion for task {} ignored", token.task_id);
            return;
        }
        if st.status.is_active() {
            st.status = TaskStatus::Completed;
            info!(
                target: "subit::supervisor",
                "task {} completed with {} segment(s)",
                token.task_id,
                st.segments.len()
            );
        }
    }

    pub fn snapshot_progress(&self) -> ProgressSnapshot {
        let st = self.state();
        let completed_count = st.segments.len();
        let (total_count, duration) = st
            .task
            .as_ref()
            .map(|t| (t.total_chunks, t.duration))
            .unwrap_or((0, 0.0));
        let percent = if total_count > 0 {
            (completed_count * 100 / total_count) as u32
        } else {
            0
        };
        ProgressSnapshot {
            is_processing: st.status.is_active(),
            percent,
            completed_count,
            total_count,
            duration,
        }
    }

    /// Ordered copy of the current task's segments.
    pub fn transcriptions(&self) -> Vec<TranscriptSegment> {
        self.state().segments.clone()
    }

    pub fn current_task_id(&self) -> Option<String> {
        self.state().task.as_ref().map(|t| t.task_id.clone())
    }

    /// Source id of the current (or last) task run.
    pub fn current_source_id(&self) -> Option<String> {
        self.state().task.as_ref().map(|t| t.source_id.clone())
    }

    /// Stage an upload for transcription; it and its audio sidecar become cleanup targets.
    pub fn stage_source(&self, staged: StagedSource) {
        let mut st = self.state();
        st.track(staged.path.clone());
        st.track(staged.audio_sidecar());
        info!(
            target: "subit::supervisor",
            "staged {} as {} ({:.1}s)",
            staged.filename,
            staged.source_id,
            staged.duration
        );
        st.staged = Some(staged);
    }

    pub fn staged_source(&self) -> Option<StagedSource> {
        self.state().staged.clone()
    }

    pub fn is_same_source(&self, source_id: &str) -> bool {
        self.state()
            .staged
            .as_ref()
            .is_some_and(|s| s.source_id == source_id)
    }

    /// Register a scratch path for deletion on the next `reset_all(true, ..)`.
    pub fn track_artifact(&self, path: impl Into<PathBuf>) {
        self.state().track(path.into());
    }

    /// Drop all task and segment state; with `delete_files`, hand tracked artifacts except
    /// `keep` to the janitor. Does not wait for a worker: cancel-and-join first for a clean handoff.
    pub fn reset_all(&self, delete_files: bool, keep: Option<&Path>) -> CleanupReport {
        let targets = {
            let mut st = self.state();
            if let Some(task) = st.task.take() {
                task.cancel.store(true, Ordering::SeqCst);
                info!(target: "subit::supervisor", "task {} reset", task.task_id);
            }
            st.status = TaskStatus::Idle;
            st.segments.clear();
            st.handle = None;
            let keep_staged = match (keep, st.staged.as_ref()) {
                (Some(k), Some(s)) => s.path.as_path() == k,
                _ => false,
            };
            if !keep_staged {
                st.staged = None;
            }
            if delete_files {
                let (kept, targets): (Vec<PathBuf>, Vec<PathBuf>) = std::mem::take(&mut st.artifacts)
                    .into_iter()
                    .partition(|p| keep.is_some_and(|k| k == p.as_path()));
                st.artifacts = kept;
                targets
            } else {
                Vec::new()
            }
        };
        if targets.is_empty() {
            return CleanupReport::default();
        }
        let report = self.janitor.cleanup(&targets, keep);
        info!(
            target: "subit::supervisor",
            "reset removed {} file(s), {} failed",
            report.removed.len(),
            report.failed.len()
        );
        report
    }
}
