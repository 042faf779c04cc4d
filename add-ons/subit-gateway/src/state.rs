use std::sync::Arc;
use subit_core::{DurationProbe, FfprobeProbe, Janitor, SubitConfig, TaskSupervisor, TaskWorker};
use subit_voice::Recognizer;

/// Shared by all handlers. One supervisor per process, constructed in `main`.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<SubitConfig>,
    pub supervisor: Arc<TaskSupervisor>,
    pub worker: Arc<TaskWorker>,
    /// Upload-time duration probe.
    pub prober: Arc<dyn DurationProbe>,
}

impl AppState {
    /// Wire supervisor, ffprobe and an ffmpeg-backed worker from config.
    pub fn new(config: SubitConfig, recognizer: Arc<dyn Recognizer>) -> Self {
        let supervisor = Arc::new(TaskSupervisor::new(Janitor::new(config.janitor_config())));
        let worker = Arc::new(TaskWorker::from_config(
            Arc::clone(&supervisor),
            &config,
            recognizer,
        ));
        let prober = Arc::new(FfprobeProbe::new(&config.ffprobe_path));
        Self::from_parts(config, supervisor, worker, prober)
    }

    pub fn from_parts(
        config: SubitConfig,
        supervisor: Arc<TaskSupervisor>,
        worker: Arc<TaskWorker>,
        prober: Arc<dyn DurationProbe>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            supervisor,
            worker,
            prober,
        }
    }
}
